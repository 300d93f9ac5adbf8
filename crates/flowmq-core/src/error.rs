// Error types for the orchestration engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that can occur while driving a workflow delivery
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Envelope bytes could not be parsed
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Envelope parsed but required fields are missing or inconsistent
    #[error("validation error: {0}")]
    Validation(String),

    /// A metadata table holds a value outside the supported scalar set
    #[error("invalid metadata: {0}")]
    Metadata(String),

    /// State-log or history operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Bus driver failure
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A user step handler reported a failure
    #[error("handler error: {0}")]
    Handler(String),
}

impl WorkflowError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        WorkflowError::Validation(msg.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        WorkflowError::Metadata(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        WorkflowError::Storage(msg.into())
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        WorkflowError::Handler(msg.into())
    }
}

/// Errors surfaced by bus drivers
#[derive(Debug, Error)]
pub enum BusError {
    /// The driver has no usable channel yet
    #[error("not connected to broker")]
    NotConnected,

    /// The driver received its shutdown signal while an operation was in flight
    #[error("broker is shutting down")]
    Shutdown,

    /// Publishing failed permanently
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscription setup or the delivery stream failed
    #[error("consume failed: {0}")]
    Consume(String),

    /// Closing the driver failed
    #[error("close failed: {0}")]
    Close(String),
}
