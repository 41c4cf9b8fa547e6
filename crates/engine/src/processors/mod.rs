//! Built-in processors.

pub mod exec;

pub use exec::{ExternalProgramProcessor, EXEC_PROCESSOR};
