//! Error taxonomy for the loop runtime.
//!
//! Fatal kinds stop the loop and surface at the process boundary with an
//! exit code. Non-fatal kinds are recorded as guidance records and published
//! to subscribers as warnings; the loop keeps running.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by loop components.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The state file (or its directory) cannot be written.
    #[error("storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote provider failed; the caller falls back to templates.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A side-effect sink failed.
    #[error("sink '{sink}' failed: {reason}")]
    SinkFailed { sink: String, reason: String },

    /// A running task exceeded its simulated work budget.
    #[error("task {task_id} timed out")]
    TaskTimeout { task_id: u64 },

    /// The persisted snapshot could not be decoded.
    #[error("state file corrupt: {0}")]
    StateCorrupt(String),

    /// The template bank has nothing to offer for a category.
    #[error("no fallback template available for category '{category}'")]
    NoFallbackAvailable { category: String },

    /// The tick source stopped delivering.
    #[error("scheduler fault: {0}")]
    SchedulerFault(String),

    /// A task state machine edge that is not permitted.
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: u64,
        from: String,
        to: String,
    },
}

impl LoopError {
    /// Whether this error terminates the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid(_)
                | Self::StorageUnavailable { .. }
                | Self::SchedulerFault(_)
                | Self::InvalidTransition { .. }
        )
    }

    /// Process exit code for a fatal error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigInvalid(_) => 2,
            Self::StorageUnavailable { .. } => 3,
            Self::SchedulerFault(_) => 4,
            _ => 1,
        }
    }

    /// Short machine-readable label used in guidance records and warning events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::SinkFailed { .. } => "sink_failed",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::StateCorrupt(_) => "state_corrupt",
            Self::NoFallbackAvailable { .. } => "no_fallback_available",
            Self::SchedulerFault(_) => "scheduler_fault",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for loop results.
pub type LoopResult<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_map_to_documented_exit_codes() {
        assert_eq!(LoopError::ConfigInvalid("x".into()).exit_code(), 2);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro");
        assert_eq!(LoopError::storage("/tmp/x", io).exit_code(), 3);
        assert_eq!(LoopError::SchedulerFault("closed".into()).exit_code(), 4);
    }

    #[test]
    fn non_fatal_kinds_do_not_stop_the_loop() {
        assert!(!LoopError::ProviderUnavailable("500".into()).is_fatal());
        assert!(!LoopError::TaskTimeout { task_id: 1 }.is_fatal());
        assert!(!LoopError::StateCorrupt("bad json".into()).is_fatal());
        assert!(!LoopError::NoFallbackAvailable {
            category: "general".into()
        }
        .is_fatal());
        assert!(LoopError::ConfigInvalid("x".into()).is_fatal());
    }
}
