//! Watcher configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// What a condition evaluation error means for the firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionErrorPolicy {
    /// The condition counts as false; the error is logged and published.
    #[default]
    TreatAsFalse,
    /// As `TreatAsFalse`, and the trigger is disabled.
    DisableTrigger,
    /// Stop dispatch and hand the error to the host as `Directive::Fatal`.
    Propagate,
}

/// What an action execution error means for the firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorPolicy {
    /// Stop dispatch and hand the error to the host as `Directive::Fatal`.
    #[default]
    Fatal,
    /// Log, publish, and move on to the next trigger.
    Continue,
    /// As `Continue`, and the trigger is disabled.
    DisableTrigger,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Per-subscriber fire-record buffer capacity.
    pub feed_capacity: usize,
    pub on_condition_error: ConditionErrorPolicy,
    pub on_action_error: ActionErrorPolicy,
    /// Max re-entrant dispatch depth per thread.
    pub max_nesting: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            feed_capacity: 1024,
            on_condition_error: ConditionErrorPolicy::default(),
            on_action_error: ActionErrorPolicy::default(),
            max_nesting: 64,
        }
    }
}

impl WatchConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> WatchResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| WatchError::config(format!("invalid watch config: {e}")))?;
        Ok(cfg.normalized())
    }

    /// Read and parse a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> WatchResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WatchError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Clamp capacities to at least 1.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.feed_capacity = self.feed_capacity.max(1);
        self.max_nesting = self.max_nesting.max(1);
        self
    }
}
