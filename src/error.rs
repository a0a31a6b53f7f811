//! Unified error type for the reconciliation daemon.
//!
//! Each variant maps to one failure domain from the error-handling design:
//! configuration problems are fatal before any kernel mutation, upstream
//! problems abort only the current device-control pass, enforcement problems
//! are isolated per device, and lock contention is fatal for a single
//! invocation only.

/// Application-level error for all reconciliation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required local configuration file is absent or unreadable.
    /// Fatal: the process exits before touching kernel state.
    #[error("{0}")]
    ConfigurationMissing(String),

    /// The control plane could not produce a usable policy snapshot
    /// (transport error, timeout, malformed body, missing success flag).
    /// Aborts the current device-control pass; kernel state is preserved.
    #[error("{0}")]
    UpstreamUnavailable(String),

    /// A kernel change did not verify after application. Logged per device;
    /// suppresses that device's dependent notification.
    #[error("{0}")]
    EnforcementFailure(String),

    /// Another reconciliation pass holds the cross-process lock.
    #[error("{0}")]
    LockContention(String),

    /// A guest notification could not be delivered. The dedup marker is
    /// rolled back so the next detection cycle retries.
    #[error("{0}")]
    NotificationDelivery(String),

    /// I/O and OS-level errors (lease file, state file, process spawning).
    #[error("{0}")]
    Io(String),

    /// Invalid or missing caller input.
    #[error("{0}")]
    InvalidInput(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigurationMissing(_) => "ConfigurationMissing",
            Error::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Error::EnforcementFailure(_) => "EnforcementFailure",
            Error::LockContention(_) => "LockContention",
            Error::NotificationDelivery(_) => "NotificationDelivery",
            Error::Io(_) => "Io",
            Error::InvalidInput(_) => "InvalidInput",
        }
    }

    /// True for errors that should terminate a one-shot invocation with
    /// exit code 1.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationMissing(_) | Error::LockContention(_)
        )
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::UpstreamUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(
            Error::ConfigurationMissing("no config".into()).kind(),
            "ConfigurationMissing"
        );
        assert_eq!(
            Error::UpstreamUnavailable("timeout".into()).kind(),
            "UpstreamUnavailable"
        );
        assert_eq!(
            Error::EnforcementFailure("rule missing".into()).kind(),
            "EnforcementFailure"
        );
        assert_eq!(
            Error::LockContention("lock held".into()).kind(),
            "LockContention"
        );
        assert_eq!(
            Error::NotificationDelivery("post failed".into()).kind(),
            "NotificationDelivery"
        );
        assert_eq!(Error::Io("io fail".into()).kind(), "Io");
        assert_eq!(Error::InvalidInput("bad ip".into()).kind(), "InvalidInput");
    }

    #[test]
    fn test_error_display_shows_message() {
        let err = Error::UpstreamUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ConfigurationMissing("x".into()).is_fatal());
        assert!(Error::LockContention("x".into()).is_fatal());
        assert!(!Error::UpstreamUnavailable("x".into()).is_fatal());
        assert!(!Error::EnforcementFailure("x".into()).is_fatal());
        assert!(!Error::NotificationDelivery("x".into()).is_fatal());
    }

    #[test]
    fn test_from_io_error_produces_io_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), "Io");
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_from_serde_error_produces_invalid_input() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = serde_err.into();
        assert_eq!(err.kind(), "InvalidInput");
    }
}
