//! Event dispatcher.
//!
//! Runs on the monitored thread. For an event it takes the current registry
//! snapshot, walks the triggers at the event's location in registration
//! order, evaluates conditions, runs actions and turns their outcomes into a
//! `Directive` for the host. All per-dispatch state lives on the stack; the
//! only thread-local is the nesting depth used to bound re-entrant dispatch.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{error, info, trace, warn};

use crate::action::{CaptureKind, Outcome};
use crate::config::{ActionErrorPolicy, ConditionErrorPolicy, WatchConfig};
use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::feed::{FeedHub, FireOutcome, FireRecord};
use crate::host::{CaptureRequest, CaptureSink, Frame};
use crate::location::{EventKind, FunctionRef, Location};
use crate::registry::TriggerRegistry;
use crate::trigger::{Trigger, TriggerId};
use crate::value::Value;

/// An event reported by the host runtime.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostEvent<'a> {
    pub kind: EventKind,
    pub function: &'a FunctionRef,
    /// Line the activation is at when the event fires.
    pub line: u32,
    /// Return value on exit, exception on raise.
    pub payload: Option<&'a Value>,
}

impl<'a> HostEvent<'a> {
    #[must_use]
    pub const fn enter(function: &'a FunctionRef, line: u32) -> Self {
        Self {
            kind: EventKind::Enter,
            function,
            line,
            payload: None,
        }
    }

    #[must_use]
    pub const fn line(function: &'a FunctionRef, line: u32) -> Self {
        Self {
            kind: EventKind::Line,
            function,
            line,
            payload: None,
        }
    }

    #[must_use]
    pub const fn exit(function: &'a FunctionRef, line: u32, retval: &'a Value) -> Self {
        Self {
            kind: EventKind::Exit,
            function,
            line,
            payload: Some(retval),
        }
    }

    #[must_use]
    pub const fn raise(function: &'a FunctionRef, line: u32, exception: &'a Value) -> Self {
        Self {
            kind: EventKind::Raise,
            function,
            line,
            payload: Some(exception),
        }
    }

    /// The canonical location this event reaches.
    #[must_use]
    pub fn location(&self) -> Location {
        match self.kind {
            EventKind::Line => Location::line(Arc::clone(self.function.module_arc()), self.line),
            EventKind::Enter => Location::enter(self.function.clone()),
            EventKind::Exit => Location::exit(self.function.clone()),
            EventKind::Raise => Location::raise(self.function.clone()),
        }
    }
}

/// What the host should do once dispatch returns.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Resume the monitored program.
    Continue,
    /// Halt the monitored program.
    StopProgram { trigger_id: TriggerId },
    /// Raise `payload` into the monitored program.
    RaiseSignal { trigger_id: TriggerId, payload: Value },
    /// Dispatch failed and policy says the host must hear about it.
    Fatal(DispatchError),
}

impl Directive {
    #[must_use]
    pub const fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Error policies applied during dispatch.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub on_condition_error: ConditionErrorPolicy,
    pub on_action_error: ActionErrorPolicy,
    pub max_nesting: usize,
}

impl From<&WatchConfig> for DispatchPolicy {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            on_condition_error: cfg.on_condition_error,
            on_action_error: cfg.on_action_error,
            max_nesting: cfg.max_nesting.max(1),
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks one level of dispatch on the current thread.
struct NestingGuard {
    depth: usize,
}

impl NestingGuard {
    fn enter(max: usize) -> Option<Self> {
        DEPTH.with(|d| {
            let depth = d.get() + 1;
            if depth > max {
                return None;
            }
            d.set(depth);
            Some(Self { depth })
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Step after a trigger was handled.
enum Flow {
    Next,
    Stop(Directive),
}

/// Evaluates triggers for host events.
pub struct Dispatcher {
    registry: Arc<TriggerRegistry>,
    feed: Arc<FeedHub>,
    capture: Option<Arc<dyn CaptureSink>>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    /// Create a dispatcher over a registry and feed.
    #[must_use]
    pub fn new(
        registry: Arc<TriggerRegistry>,
        feed: Arc<FeedHub>,
        capture: Option<Arc<dyn CaptureSink>>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            registry,
            feed,
            capture,
            policy,
        }
    }

    /// Error and nesting policy in effect.
    #[must_use]
    pub const fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Dispatch one event.
    ///
    /// Returns `Continue` when nothing at the location asks otherwise. The
    /// frame is only written through when an action requests it.
    pub fn dispatch(&self, event: &HostEvent<'_>, frame: &mut dyn Frame) -> Directive {
        let location = event.location();
        let snapshot = self.registry.snapshot();
        let triggers = snapshot.triggers_for(&location);
        if triggers.is_empty() {
            return Directive::Continue;
        }

        let Some(guard) = NestingGuard::enter(self.policy.max_nesting) else {
            warn!(location = %location, max = self.policy.max_nesting, "dispatch nesting limit reached; event skipped");
            for trigger in triggers.iter().filter(|t| t.is_enabled()) {
                self.publish(trigger, || FireOutcome::Skipped {
                    reason: format!("nesting limit of {} reached", self.policy.max_nesting),
                });
            }
            return Directive::Continue;
        };
        trace!(location = %location, version = snapshot.version(), depth = guard.depth, "dispatch");

        let mut ctx = ExecutionContext::new(&location, event, frame, guard.depth)
            .with_host(self.registry.host().as_ref());
        for trigger in triggers {
            if !trigger.is_enabled() {
                continue;
            }
            ctx.set_trigger(trigger.id());
            if let Flow::Stop(directive) = self.fire(trigger, &mut ctx) {
                return directive;
            }
        }
        Directive::Continue
    }

    fn fire(&self, trigger: &Trigger, ctx: &mut ExecutionContext<'_>) -> Flow {
        let trigger_id = trigger.id();

        if let Some(condition) = trigger.condition() {
            match condition.evaluate(ctx) {
                Ok(true) => {}
                Ok(false) => return Flow::Next,
                Err(err) => {
                    warn!(trigger_id = %trigger_id, location = %ctx.location(), error = %err, "condition evaluation failed");
                    self.publish(trigger, || FireOutcome::ConditionError {
                        message: err.to_string(),
                    });
                    return match self.policy.on_condition_error {
                        ConditionErrorPolicy::TreatAsFalse => Flow::Next,
                        ConditionErrorPolicy::DisableTrigger => {
                            self.disable(trigger_id);
                            Flow::Next
                        }
                        ConditionErrorPolicy::Propagate => {
                            Flow::Stop(Directive::Fatal(DispatchError::ConditionEvaluation {
                                trigger_id,
                                source: err,
                            }))
                        }
                    };
                }
            }
        }

        let outcome = match trigger.action().execute(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                return self.action_failed(
                    trigger,
                    DispatchError::ActionExecution {
                        trigger_id,
                        source: err,
                    },
                );
            }
        };
        self.publish(trigger, || FireOutcome::Fired {
            outcome: outcome.clone(),
        });

        match outcome {
            Outcome::Continue => Flow::Next,
            Outcome::StopProgram => Flow::Stop(Directive::StopProgram { trigger_id }),
            Outcome::RaiseSignal(payload) => Flow::Stop(Directive::RaiseSignal { trigger_id, payload }),
            Outcome::DisableTrigger => {
                self.disable(trigger_id);
                Flow::Next
            }
            Outcome::RequestCapture(kind) => match self.capture(trigger, &kind, ctx) {
                Ok(()) => Flow::Next,
                Err(err) => self.action_failed(trigger, err),
            },
        }
    }

    fn capture(
        &self,
        trigger: &Trigger,
        kind: &CaptureKind,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(), DispatchError> {
        let failed = |reason: String| DispatchError::CaptureFailed {
            trigger_id: trigger.id(),
            kind: kind.clone(),
            reason,
        };
        let sink = self
            .capture
            .as_ref()
            .ok_or_else(|| failed("no capture sink configured".to_string()))?;

        let request = CaptureRequest {
            trigger_id: trigger.id(),
            kind,
            location: ctx.location(),
            line: ctx.line(),
            bindings: ctx.bindings(),
            thread: std::thread::current().name().map(str::to_string),
        };
        let reference = sink.capture(&request).map_err(failed)?;
        info!(trigger_id = %trigger.id(), kind = ?kind, reference = %reference, "state captured");
        self.publish(trigger, || FireOutcome::Captured { reference });
        Ok(())
    }

    fn action_failed(&self, trigger: &Trigger, err: DispatchError) -> Flow {
        error!(trigger_id = %trigger.id(), location = %trigger.location(), error = %err, "action failed");
        self.publish(trigger, || FireOutcome::ActionError {
            message: err.to_string(),
        });
        match self.policy.on_action_error {
            ActionErrorPolicy::Fatal => Flow::Stop(Directive::Fatal(err)),
            ActionErrorPolicy::Continue => Flow::Next,
            ActionErrorPolicy::DisableTrigger => {
                self.disable(trigger.id());
                Flow::Next
            }
        }
    }

    fn disable(&self, id: TriggerId) {
        self.registry.disable(&[id]);
        info!(trigger_id = %id, "trigger disabled during dispatch");
    }

    fn publish<F>(&self, trigger: &Trigger, outcome: F)
    where
        F: FnOnce() -> FireOutcome,
    {
        self.feed
            .publish_with(|| FireRecord::new(trigger.id(), trigger.location().clone(), outcome()));
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("capture", &self.capture.is_some())
            .finish_non_exhaustive()
    }
}
