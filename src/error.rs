use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("A query is already in flight on the notifier connection")]
    QueryInFlight,

    #[error("Notifier connection is not established")]
    Disconnected,

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),

    #[error("{0} is not running")]
    ActorUnavailable(&'static str),
}

pub type Result<T> = std::result::Result<T, RelayError>;
