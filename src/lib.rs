//! # KyroWatch - Event-Condition-Action Instrumentation
//!
//! KyroWatch attaches triggers to points in a running program's control flow
//! (function entry, exit, a line, an exception being raised) and, when the
//! program reaches one, evaluates a condition against the live frame and runs
//! an action. Locations nobody watches cost the host nothing: hooks are
//! subscribed only while a location has an enabled trigger.
//!
//! ## Core Concepts
//!
//! - **Location**: `(event kind, function or module line)`, a plain value
//! - **Trigger**: a location bound to an optional `Condition` and an `Action`
//! - **Outcome**: what an action asks for (continue, stop, signal, capture)
//! - **Host runtime**: the hook layer the engine drives through `HostRuntime`
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kyrowatch::{Action, FunctionRef, MapFrame, ProgramImage, RunOutcome, SimulatedHost, Step, Watcher};
//!
//! let host = Arc::new(SimulatedHost::new(ProgramImage::new().function(
//!     "app",
//!     "check",
//!     10,
//!     &["def check(x):", "    y = x * 2", "    return y"],
//! )));
//! let watcher = Watcher::new(host.clone());
//!
//! let handle = watcher
//!     .when(FunctionRef::new("app", "check"))
//!     .at_str("+1")
//!     .condition_expr("x > 5")
//!     .then(Action::signal("too big"))
//!     .register()?;
//!
//! let mut frame = MapFrame::new().with("x", 10);
//! let out = host.run(&watcher, &FunctionRef::new("app", "check"), &mut frame, |_, _| Step::Next)?;
//! assert!(matches!(out, RunOutcome::Signalled { .. }));
//!
//! handle.remove();
//! # Ok::<(), kyrowatch::WatchError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod condition;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod host;
pub mod lifecycle;
pub mod location;
pub mod registry;
pub mod trigger;
pub mod value;
pub mod watcher;

// Re-export primary types at crate root for convenience
pub use action::{Action, CaptureKind, Outcome};
pub use condition::{Condition, Expr};
pub use config::{ActionErrorPolicy, ConditionErrorPolicy, WatchConfig};
pub use context::ExecutionContext;
pub use dispatcher::{Directive, DispatchPolicy, Dispatcher, HostEvent};
pub use error::{DispatchError, EvalError, HostError, RegistrationError, WatchError, WatchResult};
pub use feed::{FireFeed, FireOutcome, FireRecord, SubscriptionId};
pub use host::{
    CaptureRef, CaptureRequest, CaptureSink, CapturedState, CodeInfo, Frame, HostRuntime, MapFrame,
    MemoryCaptureSink, ProgramImage, RunOutcome, SimulatedHost, Step,
};
pub use location::{EventKind, FunctionRef, Identifier, Location, LocationSpec, Target};
pub use registry::{NewTrigger, RegistrySnapshot, TriggerRegistry};
pub use trigger::{Trigger, TriggerId};
pub use value::Value;
pub use watcher::{ScopedTrigger, TriggerBuilder, TriggerHandle, Watcher, WatcherBuilder};
