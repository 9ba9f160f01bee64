//! In-memory reference host.
//!
//! `SimulatedHost` plays the part of a runtime hook layer: it owns a static
//! program image, tracks which locations are hooked, and "executes" a function
//! line by line, delivering events to a `Watcher` only for hooked locations.
//! It is intended for embedded usage, tests, and as a reference
//! implementation of the host contract.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::action::CaptureKind;
use crate::dispatcher::{Directive, HostEvent};
use crate::error::{DispatchError, HostError};
use crate::location::{EventKind, FunctionRef, Location};
use crate::trigger::TriggerId;
use crate::value::Value;
use crate::watcher::Watcher;

use super::traits::{CaptureRef, CaptureRequest, CaptureSink, CodeInfo, Frame, HostRuntime};

/// Static program image: modules and the code of their functions.
#[derive(Debug, Clone, Default)]
pub struct ProgramImage {
    modules: BTreeMap<String, Vec<CodeInfo>>,
}

impl ProgramImage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function from its source text.
    ///
    /// `source[0]` is the definition line at `first_line`; every following
    /// line that is neither blank nor a `#` comment is executable.
    #[must_use]
    pub fn function(mut self, module: &str, name: &str, first_line: u32, source: &[&str]) -> Self {
        let mut lines = Vec::new();
        for (offset, text) in (0u32..).zip(source.iter()).skip(1) {
            let text = text.trim();
            if !text.is_empty() && !text.starts_with('#') {
                lines.push(first_line + offset);
            }
        }
        self.push(CodeInfo {
            function: FunctionRef::new(module, name),
            first_line,
            lines,
            source: source.iter().map(|s| (*s).to_string()).collect(),
        });
        self
    }

    /// Add pre-built code.
    #[must_use]
    pub fn with_code(mut self, code: CodeInfo) -> Self {
        self.push(code);
        self
    }

    fn push(&mut self, code: CodeInfo) {
        let funcs = self.modules.entry(code.function.module().to_string()).or_default();
        funcs.retain(|c| c.function != code.function);
        funcs.push(code);
    }

    #[must_use]
    pub fn lookup(&self, function: &FunctionRef) -> Option<&CodeInfo> {
        self.modules
            .get(function.module())?
            .iter()
            .find(|c| &c.function == function)
    }

    #[must_use]
    pub fn module(&self, module: &str) -> Option<&[CodeInfo]> {
        self.modules.get(module).map(Vec::as_slice)
    }
}

/// Result of one line of a simulated function body.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Fall through to the next executable line.
    Next,
    /// Return from the function.
    Return(Value),
    /// Raise an exception carrying this payload.
    Raise(Value),
}

/// How a simulated call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Returned(Value),
    Raised(Value),
    /// A trigger returned `StopProgram`.
    Halted { trigger_id: TriggerId },
    /// A trigger raised a signal.
    Signalled { trigger_id: TriggerId, payload: Value },
    /// Dispatch failed fatally.
    Failed(DispatchError),
}

/// Reference host runtime backed by a `ProgramImage`.
#[derive(Debug)]
pub struct SimulatedHost {
    image: RwLock<ProgramImage>,
    unsupported: HashSet<EventKind>,
    hooks: Mutex<HashSet<Location>>,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    delivered: AtomicU64,
}

impl SimulatedHost {
    #[must_use]
    pub fn new(image: ProgramImage) -> Self {
        Self {
            image: RwLock::new(image),
            unsupported: HashSet::new(),
            hooks: Mutex::new(HashSet::new()),
            subscribe_calls: AtomicU64::new(0),
            unsubscribe_calls: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Make the host refuse events of `kind`.
    #[must_use]
    pub fn without_event(mut self, kind: EventKind) -> Self {
        self.unsupported.insert(kind);
        self
    }

    /// Replace the program image, as a module reload would.
    pub fn reload(&self, image: ProgramImage) {
        *self.image.write().unwrap_or_else(PoisonError::into_inner) = image;
    }

    /// Number of currently hooked locations.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_hooked(&self, location: &Location) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(location)
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unsubscribe_calls(&self) -> u64 {
        self.unsubscribe_calls.load(Ordering::Relaxed)
    }

    /// Events handed to the engine so far.
    #[must_use]
    pub fn delivered_events(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Execute `function` against `frame`, calling `body` for each executed line.
    ///
    /// Events are delivered to `watcher` only for hooked locations. Directives
    /// other than `Continue` end the call early.
    pub fn run<F>(
        &self,
        watcher: &Watcher,
        function: &FunctionRef,
        frame: &mut MapFrame,
        mut body: F,
    ) -> Result<RunOutcome, HostError>
    where
        F: FnMut(u32, &mut MapFrame) -> Step,
    {
        let code = self
            .image
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(function)
            .cloned()
            .ok_or_else(|| HostError::UnknownFunction {
                module: function.module().to_string(),
                name: function.name().to_string(),
            })?;

        let enter = HostEvent::enter(function, code.first_line);
        if let Some(out) = halted(self.deliver(watcher, &enter, frame)) {
            return Ok(out);
        }

        let mut idx = 0usize;
        let mut current = code.first_line;
        let mut retval = Value::Null;
        while let Some(&line) = code.lines.get(idx) {
            if let Some(out) = halted(self.deliver(watcher, &HostEvent::line(function, line), frame)) {
                return Ok(out);
            }

            current = match frame.take_jump() {
                Some(target) => {
                    idx = code
                        .lines
                        .iter()
                        .position(|&l| l == target)
                        .ok_or(HostError::JumpUnsupported { line: target })?;
                    target
                }
                None => line,
            };

            match body(current, frame) {
                Step::Next => idx += 1,
                Step::Return(value) => {
                    retval = value;
                    break;
                }
                Step::Raise(exc) => {
                    let event = HostEvent::raise(function, current, &exc);
                    if let Some(out) = halted(self.deliver(watcher, &event, frame)) {
                        return Ok(out);
                    }
                    return Ok(RunOutcome::Raised(exc));
                }
            }
        }

        let exit = HostEvent::exit(function, current, &retval);
        if let Some(out) = halted(self.deliver(watcher, &exit, frame)) {
            return Ok(out);
        }
        Ok(RunOutcome::Returned(retval))
    }

    fn deliver(&self, watcher: &Watcher, event: &HostEvent<'_>, frame: &mut MapFrame) -> Directive {
        if !self.is_hooked(&event.location()) {
            return Directive::Continue;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        watcher.dispatch(event, frame)
    }
}

fn halted(directive: Directive) -> Option<RunOutcome> {
    match directive {
        Directive::Continue => None,
        Directive::StopProgram { trigger_id } => Some(RunOutcome::Halted { trigger_id }),
        Directive::RaiseSignal { trigger_id, payload } => {
            Some(RunOutcome::Signalled { trigger_id, payload })
        }
        Directive::Fatal(err) => Some(RunOutcome::Failed(err)),
    }
}

impl HostRuntime for SimulatedHost {
    fn code(&self, function: &FunctionRef) -> Result<CodeInfo, HostError> {
        let image = self.image.read().unwrap_or_else(PoisonError::into_inner);
        image
            .lookup(function)
            .cloned()
            .ok_or_else(|| HostError::UnknownFunction {
                module: function.module().to_string(),
                name: function.name().to_string(),
            })
    }

    fn module_code(&self, module: &str) -> Result<Vec<CodeInfo>, HostError> {
        let image = self.image.read().unwrap_or_else(PoisonError::into_inner);
        image
            .module(module)
            .map(<[CodeInfo]>::to_vec)
            .ok_or_else(|| HostError::UnknownModule {
                module: module.to_string(),
            })
    }

    fn supports(&self, kind: EventKind) -> bool {
        !self.unsupported.contains(&kind)
    }

    fn subscribe(&self, location: &Location) -> Result<(), HostError> {
        if !self.supports(location.kind()) {
            return Err(HostError::UnsupportedEvent {
                kind: location.kind().to_string(),
            });
        }
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(location.clone());
        Ok(())
    }

    fn unsubscribe(&self, location: &Location) {
        self.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location);
    }
}

/// A frame backed by an ordered map of bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapFrame {
    bindings: BTreeMap<String, Value>,
    pending_jump: Option<u32>,
}

impl MapFrame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Create or overwrite a binding (program-side write, not an engine writeback).
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.bindings.insert(name.to_string(), value.into());
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Integer binding, or `None` if absent or not an int.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.bindings.get(name).and_then(Value::as_int)
    }

    /// Take the jump requested by an action, if any.
    pub fn take_jump(&mut self) -> Option<u32> {
        self.pending_jump.take()
    }
}

impl Frame for MapFrame {
    fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match self.bindings.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(HostError::BindingNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    fn jump_to(&mut self, line: u32) -> Result<(), HostError> {
        self.pending_jump = Some(line);
        Ok(())
    }
}

/// A capture stored by `MemoryCaptureSink`.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedState {
    pub reference: CaptureRef,
    pub trigger_id: TriggerId,
    pub kind: CaptureKind,
    pub location: Location,
    pub line: u32,
    pub bindings: Vec<(String, Value)>,
    pub thread: Option<String>,
}

/// Capture collaborator that keeps captures in memory.
#[derive(Debug, Default)]
pub struct MemoryCaptureSink {
    captures: Mutex<Vec<CapturedState>>,
    failure: Option<String>,
}

impl MemoryCaptureSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every capture fails with `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            captures: Mutex::new(Vec::new()),
            failure: Some(reason.into()),
        }
    }

    #[must_use]
    pub fn captures(&self) -> Vec<CapturedState> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CaptureSink for MemoryCaptureSink {
    fn capture(&self, request: &CaptureRequest<'_>) -> Result<CaptureRef, String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }
        let mut captures = self.captures.lock().unwrap_or_else(PoisonError::into_inner);
        let reference = CaptureRef(format!("mem-capture-{}", captures.len() + 1));
        captures.push(CapturedState {
            reference: reference.clone(),
            trigger_id: request.trigger_id,
            kind: request.kind.clone(),
            location: request.location.clone(),
            line: request.line,
            bindings: request.bindings.clone(),
            thread: request.thread.clone(),
        });
        Ok(reference)
    }
}
