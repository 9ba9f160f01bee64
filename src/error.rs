//! Error types for KyroWatch.
//!
//! All errors in KyroWatch are strongly typed using thiserror.
//! Registration errors are returned synchronously to the caller of
//! `register`; dispatch errors are produced on the monitored thread and are
//! always surfaced through the fire-record feed and the log.

use thiserror::Error;

use crate::action::CaptureKind;
use crate::trigger::TriggerId;

/// Errors raised while validating or installing a registration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Invalid location {location}: {reason}")]
    InvalidLocation {
        location: String,
        reason: String,
    },

    #[error("Unsupported location {location}: {reason}")]
    UnsupportedLocation {
        location: String,
        reason: String,
    },

    #[error("Invalid identifier '{identifier}'")]
    InvalidIdentifier {
        identifier: String,
    },

    #[error("Invalid condition expression '{expression}': {reason}")]
    InvalidCondition {
        expression: String,
        reason: String,
    },

    #[error("Source hash mismatch: expected {expected}, found {actual}")]
    SourceHashMismatch {
        expected: String,
        actual: String,
    },

    #[error("Registration resolved to no locations")]
    NoLocations,

    #[error("Registry is closed")]
    Closed,

    /// Duplicate registrations are allowed, so this is never produced by the
    /// built-in registry.
    #[error("Trigger {id} is already registered")]
    RegistrationConflict {
        id: TriggerId,
    },
}

/// Errors raised by a condition, an action, or a context accessor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("Binding '{name}' is not visible in this activation")]
    MissingBinding {
        name: String,
    },

    #[error("Binding '{name}' has type {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Cannot write binding '{name}': {reason}")]
    WritebackRejected {
        name: String,
        reason: String,
    },

    #[error("No {what} is available for this event")]
    NoPayload {
        what: &'static str,
    },

    #[error("{message}")]
    Failed {
        message: String,
    },
}

impl EvalError {
    /// Creates a free-form evaluation failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors produced while dispatching an event.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Condition of trigger {trigger_id} failed: {source}")]
    ConditionEvaluation {
        trigger_id: TriggerId,
        #[source]
        source: EvalError,
    },

    #[error("Action of trigger {trigger_id} failed: {source}")]
    ActionExecution {
        trigger_id: TriggerId,
        #[source]
        source: EvalError,
    },

    #[error("Capture {kind:?} requested by trigger {trigger_id} failed: {reason}")]
    CaptureFailed {
        trigger_id: TriggerId,
        kind: CaptureKind,
        reason: String,
    },
}

impl DispatchError {
    /// The trigger that produced this error.
    #[must_use]
    pub const fn trigger_id(&self) -> TriggerId {
        match self {
            Self::ConditionEvaluation { trigger_id, .. }
            | Self::ActionExecution { trigger_id, .. }
            | Self::CaptureFailed { trigger_id, .. } => *trigger_id,
        }
    }
}

/// Errors reported by the host runtime hook API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("Unknown function {module}.{name}")]
    UnknownFunction {
        module: String,
        name: String,
    },

    #[error("Unknown module {module}")]
    UnknownModule {
        module: String,
    },

    #[error("Host cannot monitor {kind} events")]
    UnsupportedEvent {
        kind: String,
    },

    #[error("Host refused the request: {reason}")]
    Refused {
        reason: String,
    },

    #[error("Binding '{name}' not found in frame")]
    BindingNotFound {
        name: String,
    },

    #[error("Frame cannot jump to line {line}")]
    JumpUnsupported {
        line: u32,
    },
}

/// Top-level error type for KyroWatch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WatchError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Trigger handle was already removed")]
    HandleRemoved,

    #[error("Watcher has been torn down")]
    Closed,

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Config error: {message}")]
    Config {
        message: String,
    },
}

impl WatchError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if waiting on a channel timed out.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a registration error.
    #[must_use]
    pub const fn is_registration(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// Returns true if this is a host error.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host(_))
    }
}

/// Result type alias for KyroWatch operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_error_invalid_location() {
        let err = RegistrationError::InvalidLocation {
            location: "line app:10".to_string(),
            reason: "not an executable line".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("app:10"));
        assert!(msg.contains("not an executable line"));
    }

    #[test]
    fn test_dispatch_error_carries_trigger_id() {
        let id = TriggerId::new();
        let err = DispatchError::ActionExecution {
            trigger_id: id,
            source: EvalError::failed("boom"),
        };
        assert_eq!(err.trigger_id(), id);
        assert!(format!("{err}").contains("boom"));
    }

    #[test]
    fn test_eval_error_type_mismatch() {
        let err = EvalError::TypeMismatch {
            name: "x".to_string(),
            expected: "int",
            actual: "string",
        };
        let msg = format!("{err}");
        assert!(msg.contains("'x'"));
        assert!(msg.contains("expected int"));
    }

    #[test]
    fn test_watch_error_from_registration() {
        let err: WatchError = RegistrationError::NoLocations.into();
        assert!(err.is_registration());
        assert!(!err.is_dispatch());
    }

    #[test]
    fn test_watch_error_from_host() {
        let err: WatchError = HostError::UnknownModule {
            module: "m".to_string(),
        }
        .into();
        assert!(err.is_host());
        assert!(format!("{err}").contains("Unknown module m"));
    }
}
