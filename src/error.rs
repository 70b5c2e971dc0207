//! Error types for the WIP runtime.

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task queue and slot allocation errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("No task available{}", .0.as_ref().map(|id| format!(" (task {id})")).unwrap_or_default())]
    NoTask(Option<i64>),

    #[error("No worker servers configured")]
    NoWorkerServers,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Claim on task {id} lost to another worker")]
    ClaimLost { id: i64 },
}

/// Errors raised while loading or stepping a workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No workflow registered for class {0}")]
    UnknownClass(String),

    #[error("Workflow state for task {task_id} is corrupt: {reason}")]
    CorruptState { task_id: i64, reason: String },

    #[error("Step failed in state {state}: {reason}")]
    StepFailed { state: String, reason: String },
}

/// Process/container backend errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Backend {backend} command failed: {reason}")]
    CommandFailed { backend: String, reason: String },

    #[error("Unexpected output from {backend}: {output}")]
    BadOutput { backend: String, output: String },

    #[error("Process has not been started")]
    NotStarted,
}

/// Signal protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Invalid signal field {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Unknown signal kind: {0}")]
    UnknownKind(String),

    #[error("Signal {0} not found")]
    NotFound(String),

    #[error("Callback to {url} failed: {reason}")]
    Callback { url: String, reason: String },
}

impl SignalError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
