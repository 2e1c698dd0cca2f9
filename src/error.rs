use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Worker not running")]
    NotReady,

    #[error("Insufficient resources: {0}")]
    ResourceExhausted(String),

    #[error("Source missing: {0}")]
    SourceMissing(String),

    #[error("Source still changing after {0}s")]
    StabilizeTimeout(u64),

    #[error("Encoder failed: {0}")]
    EncoderFailed(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
