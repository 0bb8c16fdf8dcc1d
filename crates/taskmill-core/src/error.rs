use std::fmt;

use crate::dispatch::QueueError;
use crate::storage::StorageError;
use crate::workflow::WorkflowError;

/// Main error type for taskmill
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Task queue errors
    Queue(QueueError),

    /// Workflow construction and polling errors
    Workflow(WorkflowError),

    /// Storage/DAO errors
    Storage(StorageError),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Queue(e) => write!(f, "Queue error: {}", e),
            Error::Workflow(e) => write!(f, "Workflow error: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Queue(e) => Some(e),
            Error::Workflow(e) => Some(e),
            Error::Storage(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external and module-level error types
impl From<QueueError> for Error {
    fn from(error: QueueError) -> Self {
        Error::Queue(error)
    }
}

impl From<WorkflowError> for Error {
    fn from(error: WorkflowError) -> Self {
        Error::Workflow(error)
    }
}

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        Error::Storage(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Other(format!("Invalid UUID: {}", error))
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new generic error
    pub fn other<T: Into<String>>(msg: T) -> Self {
        Error::Other(msg.into())
    }
}

impl Error {
    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Queue(_) => "queue",
            Error::Workflow(_) => "workflow",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing worker count");
        assert_eq!(err.to_string(), "Configuration error: missing worker count");
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = QueueError::Closed.into();
        assert_eq!(err.category(), "queue");

        let err: Error = WorkflowError::DuplicateStep("step1".to_string()).into();
        assert_eq!(err.category(), "workflow");
    }
}
