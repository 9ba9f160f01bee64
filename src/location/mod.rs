//! Location model.
//!
//! A `Location` says *where* in the monitored program a trigger applies. It is
//! a plain value: equality and hashing depend only on the event kind and the
//! symbolic target (module and qualified name, or module and line), never on
//! the host's runtime identity of the code object, so re-loading a module does
//! not orphan registered triggers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Location specs and their resolution against a host.
pub mod spec;

pub use spec::{source_hash, Identifier, LocationSpec, SpecTarget};

/// Kind of control-flow event a location refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Function entry.
    Enter,
    /// Function exit (return).
    Exit,
    /// A specific source line is about to execute.
    Line,
    /// An exception/error is raised inside a function.
    Raise,
}

impl EventKind {
    /// All event kinds, in declaration order.
    pub const ALL: [Self; 4] = [Self::Enter, Self::Exit, Self::Line, Self::Raise];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
            Self::Line => "line",
            Self::Raise => "raise",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualified reference to a function of the monitored program.
///
/// Names are reference counted so that building a `Location` on the dispatch
/// path never allocates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionRef {
    module: Arc<str>,
    name: Arc<str>,
}

impl FunctionRef {
    /// Creates a reference to `module`.`name` (`name` may be dotted, e.g. `Class.method`).
    #[must_use]
    pub fn new(module: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// The owning module.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The qualified name inside the module.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn module_arc(&self) -> &Arc<str> {
        &self.module
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// What a location points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Function(FunctionRef),
    Line { module: Arc<str>, line: u32 },
}

/// A resolvable point in the monitored program's control flow.
///
/// Constructors keep kind and target consistent: `Line` locations always
/// target a module line, every other kind targets a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    kind: EventKind,
    target: Target,
}

impl Location {
    /// Function entry.
    #[must_use]
    pub const fn enter(function: FunctionRef) -> Self {
        Self {
            kind: EventKind::Enter,
            target: Target::Function(function),
        }
    }

    /// Function exit.
    #[must_use]
    pub const fn exit(function: FunctionRef) -> Self {
        Self {
            kind: EventKind::Exit,
            target: Target::Function(function),
        }
    }

    /// Exception raised inside `function`.
    #[must_use]
    pub const fn raise(function: FunctionRef) -> Self {
        Self {
            kind: EventKind::Raise,
            target: Target::Function(function),
        }
    }

    /// A line of `module`.
    #[must_use]
    pub fn line(module: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            kind: EventKind::Line,
            target: Target::Line {
                module: module.into(),
                line,
            },
        }
    }

    /// Builds the function-targeted location for `kind`.
    ///
    /// Returns `None` for `EventKind::Line`, which needs a line number.
    #[must_use]
    pub fn for_function(kind: EventKind, function: FunctionRef) -> Option<Self> {
        match kind {
            EventKind::Line => None,
            _ => Some(Self {
                kind,
                target: Target::Function(function),
            }),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub const fn target(&self) -> &Target {
        &self.target
    }

    /// Module the location lives in.
    #[must_use]
    pub fn module(&self) -> &str {
        match &self.target {
            Target::Function(f) => f.module(),
            Target::Line { module, .. } => module,
        }
    }

    /// The function for entry/exit/raise locations.
    #[must_use]
    pub const fn function(&self) -> Option<&FunctionRef> {
        match &self.target {
            Target::Function(f) => Some(f),
            Target::Line { .. } => None,
        }
    }

    /// The line number for line locations.
    #[must_use]
    pub const fn line_number(&self) -> Option<u32> {
        match &self.target {
            Target::Line { line, .. } => Some(*line),
            Target::Function(_) => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Function(func) => write!(f, "{} {func}", self.kind),
            Target::Line { module, line } => write!(f, "line {module}:{line}"),
        }
    }
}
