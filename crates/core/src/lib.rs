pub mod cron;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod macros;
pub mod metadata;
pub mod resources;
pub mod scheduling;
pub mod types;
