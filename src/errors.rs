use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Print error: {0}")]
    Print(#[from] PrintError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("A cycle is already in progress")]
    Busy,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("Camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Camera sensor fault: {0}")]
    SensorFault(String),

    #[error("Camera I/O error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Inference service rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("Print timed out after {0:?}")]
    Timeout(Duration),

    #[error("Printer out of paper")]
    OutOfPaper,

    #[error("Paper jam: {0}")]
    Jam(String),

    #[error("Printer device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Printer I/O error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing inference API key (set OPENAI_API_KEY)")]
    MissingApiKey,

    #[error("Invalid numeric value for {key}")]
    InvalidNumber { key: &'static str },

    #[error("Timeout for {key} must be greater than zero")]
    InvalidTimeout { key: &'static str },

    #[error("Retry budget for {key} must be at least one attempt")]
    InvalidRetryBudget { key: &'static str },

    #[error("Unsupported trigger source: {value}")]
    UnsupportedTriggerSource { value: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory: {path}")]
    CreateDirectoryFailed { path: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to write file: {path}")]
    WriteFailed { path: String },

    #[error("Storage I/O error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Cycle not found: {id}")]
    CycleNotFound { id: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type AppResult<T> = Result<T, AppError>;
