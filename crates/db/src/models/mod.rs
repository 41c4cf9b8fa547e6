//! Persisted entities and the request types passed through the store ports.

pub mod notification;
pub mod scheduled;
pub mod search;
pub mod service;
pub mod workflow;
