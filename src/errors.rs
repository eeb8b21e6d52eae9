use thiserror::Error;

use crate::types::Priority;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Transient: network, timeout or auth hiccup. Retried on the next tick.
    #[error("Mail source unavailable: {0}")]
    SourceUnavailable(String),
    /// Permanent: the mailbox configuration or credentials are wrong.
    #[error("Mail source misconfigured: {0}")]
    SourceConfigInvalid(String),
    #[error("No active SLA policy for priority {0}")]
    NoPolicyForPriority(Priority),
    #[error("Concurrent update on SLA timer {0}")]
    TimerWriteConflict(i64),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}
