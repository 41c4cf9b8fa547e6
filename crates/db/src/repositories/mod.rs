//! Postgres repositories, one per table family.
//!
//! Each repository is a zero-sized struct whose async methods take a
//! `&PgPool`. [`PgStore`](crate::postgres::PgStore) adapts them to the
//! store traits.

pub mod notification_repo;
pub mod scheduled_service_repo;
pub mod service_repo;
pub mod workflow_repo;

pub use notification_repo::NotificationRepo;
pub use scheduled_service_repo::ScheduledServiceRepo;
pub use service_repo::ServiceRepo;
pub use workflow_repo::WorkflowRepo;
