/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// Externally visible identity of a request or target.
pub type PublicId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
