//! Host runtime contracts.
//!
//! KyroWatch never walks a real program by itself. A host runtime (an
//! interpreter hook layer, a VM tool interface, a test double) implements these
//! traits so the engine can:
//! - enumerate resolvable code for a function or module
//! - subscribe and unsubscribe per-location event delivery
//! - read and write bindings of the activation that reached a location
//! - hand a capture request to an external collaborator

use serde::{Deserialize, Serialize};

use crate::action::CaptureKind;
use crate::error::HostError;
use crate::location::{EventKind, FunctionRef, Location};
use crate::trigger::TriggerId;
use crate::value::Value;

/// Static description of one function's code as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    /// The function this code belongs to.
    pub function: FunctionRef,
    /// Line number of the first source line (the definition line).
    pub first_line: u32,
    /// Executable line numbers, ascending.
    pub lines: Vec<u32>,
    /// Source text, one entry per line starting at `first_line`.
    pub source: Vec<String>,
}

impl CodeInfo {
    /// Source text of `line`, if it belongs to this code.
    #[must_use]
    pub fn source_line(&self, line: u32) -> Option<&str> {
        let offset = line.checked_sub(self.first_line)?;
        self.source.get(offset as usize).map(String::as_str)
    }

    /// True if `line` is an executable line of this code.
    #[must_use]
    pub fn has_line(&self, line: u32) -> bool {
        self.lines.binary_search(&line).is_ok()
    }
}

/// The hook API a host runtime exposes to the engine.
///
/// # Contract
/// - `subscribe` must make the host deliver events for exactly that location
///   until `unsubscribe` is called; locations never subscribed must cost the
///   monitored program nothing.
/// - Both calls may be issued from any thread, including from inside a
///   dispatch callback.
pub trait HostRuntime: Send + Sync {
    /// Describe the code of `function`.
    fn code(&self, function: &FunctionRef) -> Result<CodeInfo, HostError>;

    /// Describe every function of `module`.
    fn module_code(&self, module: &str) -> Result<Vec<CodeInfo>, HostError>;

    /// Whether the host can deliver events of `kind` at all.
    fn supports(&self, kind: EventKind) -> bool;

    /// Start delivering events for `location`.
    fn subscribe(&self, location: &Location) -> Result<(), HostError>;

    /// Stop delivering events for `location`. Unknown locations are ignored.
    fn unsubscribe(&self, location: &Location);
}

/// Read/write view of the bindings visible in one activation.
///
/// A frame is only ever borrowed by the engine for the duration of a single
/// dispatch.
pub trait Frame {
    /// Current value of `name`, if visible.
    fn get(&self, name: &str) -> Option<Value>;

    /// Overwrite `name`.
    fn set(&mut self, name: &str, value: Value) -> Result<(), HostError>;

    /// Names of all visible bindings.
    fn names(&self) -> Vec<String>;

    /// Continue execution at `line` once the current dispatch returns.
    fn jump_to(&mut self, line: u32) -> Result<(), HostError> {
        Err(HostError::JumpUnsupported { line })
    }
}

/// Opaque reference returned by a capture collaborator (a dump path, an id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureRef(pub String);

impl std::fmt::Display for CaptureRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the engine hands to the capture collaborator.
#[derive(Debug, Clone)]
pub struct CaptureRequest<'a> {
    pub trigger_id: TriggerId,
    pub kind: &'a CaptureKind,
    pub location: &'a Location,
    pub line: u32,
    /// Bindings visible at the time of the request.
    pub bindings: Vec<(String, Value)>,
    /// Name of the monitored thread, when it has one.
    pub thread: Option<String>,
}

/// External component that serializes process/thread state on request.
pub trait CaptureSink: Send + Sync {
    /// Perform the capture and return a reference to the stored artifact.
    fn capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureRef, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> CodeInfo {
        CodeInfo {
            function: FunctionRef::new("app", "f"),
            first_line: 10,
            lines: vec![11, 12, 14],
            source: vec![
                "def f(x):".to_string(),
                "    x += 1".to_string(),
                "    y = x".to_string(),
                "    # note".to_string(),
                "    return y".to_string(),
            ],
        }
    }

    #[test]
    fn source_line_is_relative_to_first_line() {
        let c = code();
        assert_eq!(c.source_line(10), Some("def f(x):"));
        assert_eq!(c.source_line(14), Some("    return y"));
        assert_eq!(c.source_line(9), None);
        assert_eq!(c.source_line(15), None);
    }

    #[test]
    fn has_line_only_accepts_executable_lines() {
        let c = code();
        assert!(c.has_line(11));
        assert!(!c.has_line(13));
        assert!(!c.has_line(10));
    }
}
