//! Action executor.
//!
//! An `Action` runs when its trigger's condition holds and yields an
//! `Outcome` the dispatcher interprets. Actions may write program state, but
//! only when they say so (`Assign`, `Goto`, or a callback calling
//! `ExecutionContext::set`). Errors are returned to the dispatcher, which
//! never swallows them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::EvalError;
use crate::location::Identifier;
use crate::value::Value;

/// Kind of state capture requested from the capture collaborator.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Bindings and location of the current activation.
    Snapshot,
    /// Full process dump.
    CoreDump,
    /// Hand the thread to an attached debugger.
    Breakpoint,
    Custom(String),
}

/// Result of executing an action.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// Proceed to the next trigger at this location.
    Continue,
    /// Halt the monitored program; remaining triggers are skipped.
    StopProgram,
    /// Raise a signal into the monitored program; remaining triggers are skipped.
    RaiseSignal(Value),
    /// Ask the capture collaborator for a capture, then continue.
    RequestCapture(CaptureKind),
    /// Disable the trigger that produced this outcome, then continue.
    DisableTrigger,
}

impl Outcome {
    /// Whether this outcome ends evaluation of the remaining triggers.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::StopProgram | Self::RaiseSignal(_))
    }
}

/// Signature of a user-supplied action.
pub type ActionFn = dyn Fn(&mut ExecutionContext<'_>) -> Result<Outcome, EvalError> + Send + Sync;

/// Effect performed when a trigger fires.
#[derive(Clone)]
pub enum Action {
    /// Do nothing and continue.
    Noop,
    /// User callback.
    Callback(Arc<ActionFn>),
    /// Overwrite an existing binding, then continue.
    Assign { name: String, value: Value },
    /// Continue execution at the single line `target` resolves to.
    Goto { target: Identifier },
    /// Return a fixed outcome.
    Emit(Outcome),
    /// Run each action in order; the first non-`Continue` outcome ends the chain.
    Sequence(Vec<Action>),
}

impl Action {
    #[must_use]
    pub const fn noop() -> Self {
        Self::Noop
    }

    /// Wrap an action closure.
    ///
    /// ```
    /// use kyrowatch::{Action, Outcome};
    ///
    /// let bump = Action::callback(|ctx| {
    ///     let x = ctx.get_int("x")?;
    ///     ctx.set("x", x + 1)?;
    ///     Ok(Outcome::Continue)
    /// });
    /// # let _ = bump;
    /// ```
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>) -> Result<Outcome, EvalError> + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    pub fn assign(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Assign {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Jump to a line, a `+N` offset or the unique line starting with a
    /// source prefix. Zero or several matches fail the action.
    #[must_use]
    pub fn goto(target: impl Into<Identifier>) -> Self {
        Self::Goto {
            target: target.into(),
        }
    }

    #[must_use]
    pub const fn stop() -> Self {
        Self::Emit(Outcome::StopProgram)
    }

    pub fn signal(payload: impl Into<Value>) -> Self {
        Self::Emit(Outcome::RaiseSignal(payload.into()))
    }

    #[must_use]
    pub const fn capture(kind: CaptureKind) -> Self {
        Self::Emit(Outcome::RequestCapture(kind))
    }

    #[must_use]
    pub const fn breakpoint() -> Self {
        Self::capture(CaptureKind::Breakpoint)
    }

    #[must_use]
    pub fn sequence(actions: impl IntoIterator<Item = Action>) -> Self {
        Self::Sequence(actions.into_iter().collect())
    }

    /// Append `next` to this action, flattening nested sequences.
    #[must_use]
    pub fn then(self, next: Action) -> Self {
        match self {
            Self::Sequence(mut actions) => {
                actions.push(next);
                Self::Sequence(actions)
            }
            first => Self::Sequence(vec![first, next]),
        }
    }

    /// Run the action against the current activation.
    pub fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Outcome, EvalError> {
        match self {
            Self::Noop => Ok(Outcome::Continue),
            Self::Callback(f) => f(ctx),
            Self::Assign { name, value } => {
                ctx.set(name, value.clone())?;
                Ok(Outcome::Continue)
            }
            Self::Goto { target } => {
                ctx.jump_to(target.clone())?;
                Ok(Outcome::Continue)
            }
            Self::Emit(outcome) => Ok(outcome.clone()),
            Self::Sequence(actions) => {
                for action in actions {
                    let outcome = action.execute(ctx)?;
                    if outcome != Outcome::Continue {
                        return Ok(outcome);
                    }
                }
                Ok(Outcome::Continue)
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("Noop"),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Assign { name, value } => f
                .debug_struct("Assign")
                .field("name", name)
                .field("value", value)
                .finish(),
            Self::Goto { target } => f.debug_struct("Goto").field("target", target).finish(),
            Self::Emit(outcome) => f.debug_tuple("Emit").field(outcome).finish(),
            Self::Sequence(actions) => f.debug_tuple("Sequence").field(actions).finish(),
        }
    }
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        Self::Emit(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dispatcher::HostEvent;
    use crate::host::MapFrame;
    use crate::location::{FunctionRef, Location};

    fn run(action: &Action, frame: &mut MapFrame) -> Result<Outcome, EvalError> {
        let f = FunctionRef::new("app", "f");
        let loc = Location::line("app", 2);
        let event = HostEvent::line(&f, 2);
        let mut ctx = ExecutionContext::new(&loc, &event, frame, 1);
        action.execute(&mut ctx)
    }

    #[test]
    fn fixed_outcomes() {
        let mut frame = MapFrame::new();
        assert_eq!(run(&Action::noop(), &mut frame).unwrap(), Outcome::Continue);
        assert_eq!(run(&Action::stop(), &mut frame).unwrap(), Outcome::StopProgram);
        assert_eq!(
            run(&Action::signal("sigusr"), &mut frame).unwrap(),
            Outcome::RaiseSignal(Value::from("sigusr"))
        );
        assert_eq!(
            run(&Action::breakpoint(), &mut frame).unwrap(),
            Outcome::RequestCapture(CaptureKind::Breakpoint)
        );
    }

    #[test]
    fn assign_writes_existing_binding_only() {
        let mut frame = MapFrame::new().with("x", 1);
        run(&Action::assign("x", 99), &mut frame).unwrap();
        assert_eq!(frame.int("x"), Some(99));

        let err = run(&Action::assign("nope", 1), &mut frame).unwrap_err();
        assert!(matches!(err, EvalError::WritebackRejected { .. }));
        assert!(frame.value("nope").is_none());
    }

    #[test]
    fn goto_records_a_jump() {
        let mut frame = MapFrame::new();
        run(&Action::goto(7), &mut frame).unwrap();
        assert_eq!(frame.take_jump(), Some(7));
    }

    #[test]
    fn sequence_stops_at_first_non_continue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let tail = Action::callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Continue)
        });

        let chain = Action::assign("x", 2).then(Action::stop()).then(tail.clone());
        let mut frame = MapFrame::new().with("x", 1);
        assert_eq!(run(&chain, &mut frame).unwrap(), Outcome::StopProgram);
        assert_eq!(frame.int("x"), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let chain = Action::sequence([Action::noop(), tail]);
        assert_eq!(run(&chain, &mut frame).unwrap(), Outcome::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequence_propagates_errors() {
        let chain = Action::sequence([
            Action::callback(|_| Err(EvalError::failed("boom"))),
            Action::stop(),
        ]);
        assert_eq!(
            run(&chain, &mut MapFrame::new()).unwrap_err(),
            EvalError::failed("boom")
        );
    }

    #[test]
    fn terminal_outcomes() {
        assert!(Outcome::StopProgram.is_terminal());
        assert!(Outcome::RaiseSignal(Value::Null).is_terminal());
        assert!(!Outcome::RequestCapture(CaptureKind::Snapshot).is_terminal());
        assert!(!Outcome::DisableTrigger.is_terminal());
        assert!(!Outcome::Continue.is_terminal());
    }

    #[test]
    fn outcome_serde_is_tagged() {
        let json = serde_json::to_value(Outcome::RequestCapture(CaptureKind::CoreDump)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "request_capture", "value": "core_dump"})
        );
        let back: Outcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, Outcome::RequestCapture(CaptureKind::CoreDump));
    }
}
