use std::fmt;
use thiserror::Error;

/// Why a queued operation never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    QueueCleared,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::QueueCleared => f.write_str("Operation queue cleared"),
            CancelReason::Shutdown => f.write_str("Resource manager shut down"),
        }
    }
}

/// Outcome of an operation submitted to the resource manager.
///
/// `Cancelled` and `ShutDown` mean the operation never started; `Failed` and
/// `Panicked` mean it ran and did not succeed.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation cancelled before it started: {0}")]
    Cancelled(CancelReason),

    #[error("resource manager is shut down")]
    ShutDown,

    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl OperationError {
    /// True when the operation was never started.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled(_) | OperationError::ShutDown)
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            OperationError::Cancelled(reason) => Some(*reason),
            OperationError::ShutDown => Some(CancelReason::Shutdown),
            _ => None,
        }
    }

    /// The operation's own error, if it ran and failed.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            OperationError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

pub type OperationResult<T> = Result<T, OperationError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguishable_from_failure() {
        let cleared = OperationError::Cancelled(CancelReason::QueueCleared);
        let failed = OperationError::Failed(anyhow::anyhow!("Operation failed"));

        assert!(cleared.is_cancelled());
        assert_eq!(cleared.cancel_reason(), Some(CancelReason::QueueCleared));
        assert!(!failed.is_cancelled());
        assert_eq!(failed.cancel_reason(), None);
        assert_eq!(failed.to_string(), "Operation failed");
        assert!(cleared.to_string().contains("Operation queue cleared"));
    }

    #[test]
    fn shut_down_counts_as_never_ran() {
        let err = OperationError::ShutDown;
        assert!(err.is_cancelled());
        assert_eq!(err.cancel_reason(), Some(CancelReason::Shutdown));
        assert!(err.source_error().is_none());
    }
}
