//! Error types for lifeline.
//!
//! Channel-local failures are not errors here: they travel as
//! [`ChannelOutcome`](crate::channels::ChannelOutcome) values and are retried or
//! skipped by the queue. Everything in this module is surfaced to the caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::event::EventStatus;

/// The main error type for lifeline operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A queue mutation could not be made durable.
    ///
    /// This is never swallowed: an emergency record that silently fails to
    /// persist is the worst outcome this crate can produce.
    #[error("failed to persist queue state for event {event_id} during {operation}: {source}")]
    QueuePersistence {
        /// The event being persisted.
        event_id: String,
        /// The queue operation that failed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Coordinator Errors ===
    /// No event is currently in a state that accepts the request.
    #[error("no active event")]
    NoActiveEvent,

    /// The dead-man's switch already fired for this handle.
    #[error("safety check {handle} already expired")]
    AlreadyExpired {
        /// The switch handle id.
        handle: String,
    },

    /// The dead-man's switch is not armed for this handle.
    #[error("safety check {handle} is not armed")]
    NotArmed {
        /// The switch handle id.
        handle: String,
    },

    /// An event status transition was rejected.
    #[error("invalid status transition for event {event_id}: {from} -> {to}")]
    InvalidTransition {
        /// The event whose status was being changed.
        event_id: String,
        /// Current status.
        from: EventStatus,
        /// Requested status.
        to: EventStatus,
    },

    /// A request carried invalid arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The coordinator task is no longer running.
    #[error("coordinator is not running")]
    CoordinatorStopped,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for lifeline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Wrap a storage-side failure as a queue persistence failure for
    /// `event_id`. Already wrapped errors are returned as they are.
    #[must_use]
    pub fn persistence(event_id: impl Into<String>, operation: &'static str, err: Error) -> Self {
        match err {
            wrapped @ Self::QueuePersistence { .. } => wrapped,
            other => Self::QueuePersistence {
                event_id: event_id.into(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Check if this error is a queue persistence failure.
    #[must_use]
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::QueuePersistence { .. })
    }

    /// Check if this error means there was no event to act on.
    #[must_use]
    pub fn is_no_active_event(&self) -> bool {
        matches!(self, Self::NoActiveEvent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_error() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            Some("database or disk is full".to_string()),
        )
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NoActiveEvent.to_string(), "no active event");
        assert_eq!(
            Error::internal("test error").to_string(),
            "internal error: test error"
        );
        assert_eq!(
            Error::CoordinatorStopped.to_string(),
            "coordinator is not running"
        );
    }

    #[test]
    fn test_persistence_wraps_sqlite_errors() {
        let err = Error::persistence("evt-1", "enqueue", Error::DatabaseQuery(sqlite_error()));
        assert!(err.is_persistence_failure());
        let msg = err.to_string();
        assert!(msg.contains("evt-1"));
        assert!(msg.contains("enqueue"));
    }

    #[test]
    fn test_persistence_wraps_every_storage_failure() {
        let err = Error::persistence("evt-1", "enqueue", Error::internal("storage lock poisoned"));
        assert!(err.is_persistence_failure());
        assert!(err.to_string().contains("storage lock poisoned"));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::persistence("evt-2", "enqueue", Error::Json(json));
        assert!(err.is_persistence_failure());
    }

    #[test]
    fn test_persistence_is_not_wrapped_twice() {
        let inner = Error::persistence("evt-1", "enqueue", Error::DatabaseQuery(sqlite_error()));
        let err = Error::persistence("evt-1", "flush", inner);
        match err {
            Error::QueuePersistence {
                operation, source, ..
            } => {
                assert_eq!(operation, "enqueue");
                assert!(matches!(*source, Error::DatabaseQuery(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_is_no_active_event() {
        assert!(Error::NoActiveEvent.is_no_active_event());
        assert!(!Error::CoordinatorStopped.is_no_active_event());
    }

    #[test]
    fn test_switch_errors_name_the_handle() {
        let err = Error::AlreadyExpired {
            handle: "sw-1".to_string(),
        };
        assert!(err.to_string().contains("sw-1"));
        let err = Error::NotArmed {
            handle: "sw-2".to_string(),
        };
        assert!(err.to_string().contains("not armed"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::InvalidTransition {
            event_id: "evt-9".to_string(),
            from: EventStatus::Cancelled,
            to: EventStatus::Dispatching,
        };
        let msg = err.to_string();
        assert!(msg.contains("cancelled -> dispatching"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "invalid interval".to_string(),
        };
        assert!(err.to_string().contains("invalid interval"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
