//! Runtime errors.

use thiserror::Error;

/// Everything the runtime and its backends can fail with.
///
/// Handler failures are not errors at this level: they are [`JobError`]s that
/// the worker turns into retries or dead-lettering.
///
/// [`JobError`]: crate::JobError
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pool lifecycle misuse, such as running a pool twice.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Missing or inconsistent builder input.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Beat state could not be loaded or saved.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Broker or result store failure, with the driver's message.
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = CourierError::Serialization(json_err);
        assert!(format!("{}", err).starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_display_config() {
        let err = CourierError::Config("handler is required".to_string());
        assert_eq!(format!("{}", err), "Configuration error: handler is required");
    }

    #[test]
    fn test_error_display_unknown_task() {
        let err = CourierError::UnknownTask("tasks.missing".to_string());
        assert_eq!(format!("{}", err), "Unknown task: tasks.missing");
    }

    #[test]
    fn test_error_display_backend() {
        let err = CourierError::Backend("connection refused".to_string());
        assert_eq!(format!("{}", err), "Backend error: connection refused");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: CourierError = json_err.into();
        assert!(matches!(err, CourierError::Serialization(_)));
    }
}
