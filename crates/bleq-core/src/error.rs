/*!
 * Error types for the bleq core crate.
 */
use thiserror::Error;

/// Error type for bleq core operations
#[derive(Error, Debug)]
pub enum Error {
    /// The task queue is at capacity and rejected the submission
    #[error("Task queue is full")]
    QueueFull,

    /// The executor has been shut down and no longer accepts tasks
    #[error("Task executor is stopped")]
    ExecutorStopped,

    /// An operation did not resolve within its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime error (logging setup, background tasks)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for bleq core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new runtime error
    pub fn runtime<S: AsRef<str>>(msg: S) -> Self {
        Error::Runtime(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_helpers() {
        assert!(matches!(Error::timeout("x"), Error::Timeout(_)));
        assert!(matches!(Error::config("x"), Error::Config(_)));
        assert!(matches!(Error::other("x"), Error::Other(_)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::QueueFull.to_string(), "Task queue is full");
        assert_eq!(
            Error::timeout("no callback").to_string(),
            "Timeout: no callback"
        );
    }
}
