use super::models::Interval;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("failed to run initial migration: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("failed to insert flow: {0}")]
    Insert(#[source] sqlx::Error),
    #[error("failed to read flow history: {0}")]
    Read(#[source] sqlx::Error),
    #[error("failed to delete expired flows: {0}")]
    Cleanup(#[source] sqlx::Error),
    #[error("interval `{0}` is finer than the hourly aggregation buckets")]
    IntervalTooFine(Interval),
    #[error("unsupported aggregation interval `{0}`")]
    UnsupportedInterval(String),
}

pub type Result<T> = std::result::Result<T, Error>;
