//! Execution context handed to conditions and actions.
//!
//! `ExecutionContext<'f>` borrows the host's frame for the duration of one
//! dispatch. Conditions and actions only ever receive `&ExecutionContext<'_>`
//! or `&mut ExecutionContext<'_>` with a caller-chosen lifetime, so they cannot
//! keep the context (or the frame behind it) after they return.

use crate::dispatcher::HostEvent;
use crate::error::EvalError;
use crate::location::{EventKind, FunctionRef, Identifier, Location};
use crate::host::{Frame, HostRuntime};
use crate::trigger::TriggerId;
use crate::value::Value;

/// Scoped view of the activation that reached a monitored location.
pub struct ExecutionContext<'f> {
    location: &'f Location,
    event: &'f HostEvent<'f>,
    frame: &'f mut dyn Frame,
    host: Option<&'f dyn HostRuntime>,
    trigger_id: TriggerId,
    depth: usize,
}

impl<'f> ExecutionContext<'f> {
    pub(crate) fn new(
        location: &'f Location,
        event: &'f HostEvent<'f>,
        frame: &'f mut dyn Frame,
        depth: usize,
    ) -> Self {
        Self {
            location,
            event,
            frame,
            host: None,
            trigger_id: TriggerId::from_uuid(uuid::Uuid::nil()),
            depth,
        }
    }

    /// Let line targets resolve against the host's code for the activation.
    pub(crate) fn with_host(mut self, host: &'f dyn HostRuntime) -> Self {
        self.host = Some(host);
        self
    }

    pub(crate) fn set_trigger(&mut self, id: TriggerId) {
        self.trigger_id = id;
    }

    /// The canonical location that was reached.
    #[must_use]
    pub const fn location(&self) -> &Location {
        self.location
    }

    #[must_use]
    pub const fn event_kind(&self) -> EventKind {
        self.event.kind
    }

    /// The function whose activation this is.
    #[must_use]
    pub const fn function(&self) -> &FunctionRef {
        self.event.function
    }

    /// Line the activation is at.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.event.line
    }

    /// Trigger currently being evaluated.
    #[must_use]
    pub const fn trigger_id(&self) -> TriggerId {
        self.trigger_id
    }

    /// Nesting depth of this dispatch on the current thread (1 = outermost).
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Value of `name`, if visible.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.frame.get(name)
    }

    /// Value of `name`, or `MissingBinding`.
    pub fn get(&self, name: &str) -> Result<Value, EvalError> {
        self.frame.get(name).ok_or_else(|| EvalError::MissingBinding {
            name: name.to_string(),
        })
    }

    /// Integer value of `name`.
    pub fn get_int(&self, name: &str) -> Result<i64, EvalError> {
        let value = self.get(name)?;
        value.as_int().ok_or_else(|| EvalError::TypeMismatch {
            name: name.to_string(),
            expected: "int",
            actual: value.type_name(),
        })
    }

    /// Numeric value of `name` (ints widen to float).
    pub fn get_float(&self, name: &str) -> Result<f64, EvalError> {
        let value = self.get(name)?;
        value.as_float().ok_or_else(|| EvalError::TypeMismatch {
            name: name.to_string(),
            expected: "float",
            actual: value.type_name(),
        })
    }

    /// Boolean value of `name`.
    pub fn get_bool(&self, name: &str) -> Result<bool, EvalError> {
        let value = self.get(name)?;
        value.as_bool().ok_or_else(|| EvalError::TypeMismatch {
            name: name.to_string(),
            expected: "bool",
            actual: value.type_name(),
        })
    }

    /// Return value of the activation; only available on exit events.
    pub fn return_value(&self) -> Result<&Value, EvalError> {
        match (self.event.kind, self.event.payload) {
            (EventKind::Exit, Some(value)) => Ok(value),
            _ => Err(EvalError::NoPayload { what: "return value" }),
        }
    }

    /// In-flight exception payload; only available on raise events.
    pub fn exception(&self) -> Result<&Value, EvalError> {
        match (self.event.kind, self.event.payload) {
            (EventKind::Raise, Some(value)) => Ok(value),
            _ => Err(EvalError::NoPayload { what: "exception" }),
        }
    }

    /// Snapshot of every visible binding, sorted by name.
    #[must_use]
    pub fn bindings(&self) -> Vec<(String, Value)> {
        let mut names = self.frame.names();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.frame.get(&name).map(|value| (name, value)))
            .collect()
    }

    /// Overwrite an existing binding.
    ///
    /// This is the only way the engine mutates program state, and only when
    /// an action asks for it. Bindings that do not exist in the activation are
    /// rejected rather than created.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), EvalError> {
        if self.frame.get(name).is_none() {
            return Err(EvalError::WritebackRejected {
                name: name.to_string(),
                reason: "binding does not exist in this activation".to_string(),
            });
        }
        self.frame
            .set(name, value.into())
            .map_err(|e| EvalError::WritebackRejected {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Ask the host to continue execution at `target` once dispatch returns.
    ///
    /// The target must resolve to exactly one executable line of the running
    /// function; the resolved line is returned. Without host code only an
    /// absolute line can be used, and the frame alone decides if it is valid.
    pub fn jump_to(&mut self, target: impl Into<Identifier>) -> Result<u32, EvalError> {
        let target = target.into();
        let line = match self.host {
            Some(host) => self.resolve_jump(host, &target)?,
            None => match target {
                Identifier::Line(line) => line,
                other => {
                    return Err(EvalError::failed(format!(
                        "cannot resolve goto target `{other}` without the function's code"
                    )))
                }
            },
        };
        self.frame
            .jump_to(line)
            .map_err(|e| EvalError::failed(e.to_string()))?;
        Ok(line)
    }

    fn resolve_jump(&self, host: &dyn HostRuntime, target: &Identifier) -> Result<u32, EvalError> {
        let function = self.event.function;
        let code = host
            .code(function)
            .map_err(|e| EvalError::failed(e.to_string()))?;
        let lines = target
            .line_set(&code)
            .map_err(|e| EvalError::failed(format!("invalid goto target: {e}")))?;
        let mut iter = lines.iter();
        match (iter.next(), iter.next()) {
            (Some(&line), None) => Ok(line),
            (None, _) => Err(EvalError::failed(format!(
                "goto target `{target}` matches no executable line of {function}"
            ))),
            (Some(_), Some(_)) => Err(EvalError::failed(format!(
                "goto target `{target}` is ambiguous in {function}: lines {lines:?}"
            ))),
        }
    }
}
