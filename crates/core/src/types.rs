/// Service records use PostgreSQL BIGSERIAL keys.
pub type ServiceId = i64;

/// Primary key of any other persisted row (notifications, workflows, templates).
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
