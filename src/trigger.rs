//! Trigger types.
//!
//! A trigger binds a location to an optional condition and an action. Triggers
//! are owned by the registry and never mutated in place: enabling or disabling
//! one installs a copy in a new registry version, so an in-flight dispatch
//! keeps seeing the trigger exactly as it was when its snapshot was taken.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;
use crate::condition::Condition;
use crate::location::Location;

/// Unique identifier for a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered (location, condition, action) binding.
#[derive(Debug, Clone)]
pub struct Trigger {
    id: TriggerId,
    seq: u64,
    location: Location,
    condition: Option<Condition>,
    action: Action,
    enabled: bool,
    registered_at: DateTime<Utc>,
}

impl Trigger {
    pub(crate) fn new(seq: u64, location: Location, condition: Option<Condition>, action: Action) -> Self {
        Self {
            id: TriggerId::new(),
            seq,
            location,
            condition,
            action,
            enabled: true,
            registered_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TriggerId {
        self.id
    }

    /// Registration sequence number; lower fires first.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn location(&self) -> &Location {
        &self.location
    }

    #[must_use]
    pub const fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    #[must_use]
    pub const fn action(&self) -> &Action {
        &self.action
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Copy of this trigger with a different enabled flag.
    pub(crate) fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::FunctionRef;

    #[test]
    fn ids_are_unique() {
        assert_ne!(TriggerId::new(), TriggerId::new());
    }

    #[test]
    fn id_serializes_as_bare_uuid() {
        let uuid = Uuid::new_v4();
        let id = TriggerId::from_uuid(uuid);
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(uuid.to_string()));
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn with_enabled_keeps_identity_and_order() {
        let t = Trigger::new(7, Location::enter(FunctionRef::new("app", "f")), None, Action::noop());
        assert!(t.is_enabled());
        let off = t.with_enabled(false);
        assert!(!off.is_enabled());
        assert_eq!(off.id(), t.id());
        assert_eq!(off.seq(), 7);
        assert!(t.is_enabled());
    }
}
