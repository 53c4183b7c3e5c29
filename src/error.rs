//! Error types for render-fleet.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Key-value store error: {0}")]
    Store(#[from] StoreError),

    #[error("Log service error: {0}")]
    Log(#[from] LogError),

    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Object store error: {0}")]
    Objects(#[from] ObjectStoreError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Conflicting options: {0}")]
    Conflict(String),
}

/// Key-value store errors. A rejected conditional write is not an error,
/// see [`crate::cloud::ConditionalWrite`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Table {table} not found")]
    TableNotFound { table: String },

    #[error("Table {table} already exists")]
    TableExists { table: String },

    #[error("Invalid item for table {table}: {reason}")]
    InvalidItem { table: String, reason: String },
}

/// Log service errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The sequence token supplied with an append was stale. `expected` is the
    /// token the service wants next (`None` for a stream with no events yet).
    #[error("Invalid sequence token (expected {expected:?})")]
    InvalidSequenceToken { expected: Option<String> },

    #[error("Log resource {name} already exists")]
    AlreadyExists { name: String },

    #[error("Log resource {name} not found")]
    NotFound { name: String },

    #[error("Gave up appending to stream {stream} after {attempts} attempts")]
    RetriesExhausted { stream: String, attempts: u32 },

    #[error("Log service failure: {0}")]
    Service(String),
}

/// Compute provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Instance {id} not found")]
    InstanceNotFound { id: String },

    #[error("No machine image matches {pattern}")]
    NoImage { pattern: String },

    #[error("Instances did not come into existence within {timeout:?}")]
    WaitTimedOut { timeout: Duration },
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("Container {name} not found")]
    ContainerNotFound { name: String },

    #[error("Container {name} already exists")]
    ContainerExists { name: String },

    #[error("Container {name} is not empty")]
    ContainerNotEmpty { name: String },

    #[error("Object {key} not found in {container}")]
    ObjectNotFound { container: String, key: String },

    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the external renderer subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to run renderer: {0}")]
    Io(#[from] std::io::Error),

    #[error("Renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Renderer output did not contain scene attributes")]
    MissingAttributes,

    #[error("Malformed scene attributes: {0}")]
    Attributes(#[from] serde_json::Error),

    #[error("Absolute output prefixes are not supported: {0}")]
    AbsolutePrefix(String),

    #[error("Output files {files:?} must be removed before rendering")]
    LeftoverOutput { files: Vec<PathBuf> },

    #[error("Expected exactly one output file, found {count}")]
    AmbiguousOutput { count: usize },
}

/// Job orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Worker bootstrap data is missing {key}")]
    MissingBootstrap { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for render-fleet.
pub type Result<T> = std::result::Result<T, Error>;
