//! Condition evaluator.
//!
//! A `Condition` is a closed set of variants sharing one capability:
//! `evaluate(&ExecutionContext) -> Result<bool, EvalError>`. Composites
//! short-circuit: `All` stops at the first false, `Any` at the first true.
//! Evaluation errors are returned, never folded into `false`; the dispatcher's
//! policy decides what an error means for the firing.

use std::fmt;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{EvalError, RegistrationError};

/// Expression conditions.
pub mod expr;

pub use expr::Expr;

/// Signature of a user-supplied predicate.
pub type ConditionFn = dyn Fn(&ExecutionContext<'_>) -> Result<bool, EvalError> + Send + Sync;

/// Predicate gating a trigger's action.
#[derive(Clone)]
pub enum Condition {
    /// Constant result.
    Literal(bool),
    /// User callback.
    Callback(Arc<ConditionFn>),
    /// Parsed expression over frame bindings.
    Expr(Arc<Expr>),
    /// True if every part is true (true when empty).
    All(Vec<Condition>),
    /// True if any part is true (false when empty).
    Any(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
}

impl Condition {
    #[must_use]
    pub const fn always() -> Self {
        Self::Literal(true)
    }

    #[must_use]
    pub const fn never() -> Self {
        Self::Literal(false)
    }

    /// Wrap a predicate closure.
    ///
    /// ```
    /// use kyrowatch::Condition;
    ///
    /// let gt5 = Condition::callback(|ctx| Ok(ctx.get_int("x")? > 5));
    /// # let _ = gt5;
    /// ```
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&ExecutionContext<'_>) -> Result<bool, EvalError> + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    /// Parse an expression such as `x > 5 && name =~ "^a"`.
    pub fn expr(source: &str) -> Result<Self, RegistrationError> {
        Expr::parse(source).map(|e| Self::Expr(Arc::new(e)))
    }

    #[must_use]
    pub fn all(parts: impl IntoIterator<Item = Condition>) -> Self {
        Self::All(parts.into_iter().collect())
    }

    #[must_use]
    pub fn any(parts: impl IntoIterator<Item = Condition>) -> Self {
        Self::Any(parts.into_iter().collect())
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Conjunction with another condition, flattening nested `All`s.
    #[must_use]
    pub fn and(self, other: Condition) -> Self {
        match self {
            Self::All(mut parts) => {
                parts.push(other);
                Self::All(parts)
            }
            first => Self::All(vec![first, other]),
        }
    }

    /// Evaluate against the current activation.
    pub fn evaluate(&self, ctx: &ExecutionContext<'_>) -> Result<bool, EvalError> {
        match self {
            Self::Literal(value) => Ok(*value),
            Self::Callback(f) => f(ctx),
            Self::Expr(expr) => expr.evaluate(ctx),
            Self::All(parts) => {
                for part in parts {
                    if !part.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(parts) => {
                for part in parts {
                    if part.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(inner) => Ok(!inner.evaluate(ctx)?),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Expr(expr) => f.debug_tuple("Expr").field(&expr.source()).finish(),
            Self::All(parts) => f.debug_tuple("All").field(parts).finish(),
            Self::Any(parts) => f.debug_tuple("Any").field(parts).finish(),
            Self::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Self::Literal(value)
    }
}
