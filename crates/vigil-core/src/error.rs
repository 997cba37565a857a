// Vigil Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Unknown alert: {0}")]
    UnknownAlert(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WatchdogError>;
