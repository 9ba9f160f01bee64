//! Trigger registry.
//!
//! The registry is copy-on-write. Readers take an `Arc<RegistrySnapshot>`
//! and never block writers for longer than an `Arc` clone; writers serialize
//! on a mutex, build the next version, reconcile host hooks, then install it.
//! A dispatch that started on version N finishes on version N even if a
//! writer installs N+1 meanwhile.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::debug;

use crate::action::Action;
use crate::condition::Condition;
use crate::error::RegistrationError;
use crate::host::HostRuntime;
use crate::lifecycle::LifecycleManager;
use crate::location::spec::validate_location;
use crate::location::Location;
use crate::trigger::{Trigger, TriggerId};

/// A trigger waiting to be registered.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub location: Location,
    pub condition: Option<Condition>,
    pub action: Action,
}

impl NewTrigger {
    #[must_use]
    pub fn new(location: Location, action: Action) -> Self {
        Self {
            location,
            condition: None,
            action,
        }
    }

    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// One immutable version of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    by_location: HashMap<Location, Vec<Arc<Trigger>>>,
    index: HashMap<TriggerId, Location>,
}

impl RegistrySnapshot {
    /// Monotonic version; bumped by every successful write.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Triggers at `location` in registration order, enabled or not.
    #[must_use]
    pub fn triggers_for(&self, location: &Location) -> &[Arc<Trigger>] {
        self.by_location.get(location).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn get(&self, id: TriggerId) -> Option<&Arc<Trigger>> {
        let location = self.index.get(&id)?;
        self.triggers_for(location).iter().find(|t| t.id() == id)
    }

    #[must_use]
    pub fn contains(&self, id: TriggerId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of registered triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Locations with at least one enabled trigger.
    #[must_use]
    pub fn enabled_locations(&self) -> HashSet<Location> {
        self.by_location
            .iter()
            .filter(|(_, triggers)| triggers.iter().any(|t| t.is_enabled()))
            .map(|(location, _)| location.clone())
            .collect()
    }

    fn insert(&mut self, trigger: Trigger) {
        let location = trigger.location().clone();
        self.index.insert(trigger.id(), location.clone());
        // Sequence numbers only grow, so pushing keeps each list sorted.
        self.by_location.entry(location).or_default().push(Arc::new(trigger));
    }

    fn remove(&mut self, id: TriggerId) -> bool {
        let Some(location) = self.index.remove(&id) else {
            return false;
        };
        if let Some(triggers) = self.by_location.get_mut(&location) {
            triggers.retain(|t| t.id() != id);
            if triggers.is_empty() {
                self.by_location.remove(&location);
            }
        }
        true
    }

    fn set_enabled(&mut self, id: TriggerId, enabled: bool) -> bool {
        let Some(location) = self.index.get(&id) else {
            return false;
        };
        if let Some(slot) = self
            .by_location
            .get_mut(location)
            .and_then(|triggers| triggers.iter_mut().find(|t| t.id() == id))
        {
            if slot.is_enabled() != enabled {
                *slot = Arc::new(slot.with_enabled(enabled));
            }
        }
        true
    }
}

struct WriterState {
    lifecycle: LifecycleManager,
    next_seq: u64,
    closed: bool,
}

/// Owner of all triggers, shared by registration and dispatch.
pub struct TriggerRegistry {
    host: Arc<dyn HostRuntime>,
    current: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<WriterState>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            writer: Mutex::new(WriterState {
                lifecycle: LifecycleManager::new(Arc::clone(&host)),
                next_seq: 0,
                closed: false,
            }),
            host,
        }
    }

    /// The host this registry instruments.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    /// The current version. Cheap: one `Arc` clone under a read lock.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Triggers at `location` in the current version.
    #[must_use]
    pub fn triggers_for(&self, location: &Location) -> Vec<Arc<Trigger>> {
        self.snapshot().triggers_for(location).to_vec()
    }

    /// Register a single trigger.
    pub fn register(
        &self,
        location: Location,
        condition: Option<Condition>,
        action: Action,
    ) -> Result<TriggerId, RegistrationError> {
        let ids = self.register_all(vec![NewTrigger {
            location,
            condition,
            action,
        }])?;
        ids.into_iter().next().ok_or(RegistrationError::NoLocations)
    }

    /// Register several triggers as one version: either all of them are
    /// installed and hooked, or none are.
    pub fn register_all(&self, entries: Vec<NewTrigger>) -> Result<Vec<TriggerId>, RegistrationError> {
        if entries.is_empty() {
            return Err(RegistrationError::NoLocations);
        }
        for entry in &entries {
            validate_location(self.host.as_ref(), &entry.location)?;
        }

        let mut writer = self.lock_writer();
        if writer.closed {
            return Err(RegistrationError::Closed);
        }
        let mut next = (*self.snapshot()).clone();
        let mut ids = Vec::with_capacity(entries.len());
        let mut seq = writer.next_seq;
        for entry in entries {
            let trigger = Trigger::new(seq, entry.location, entry.condition, entry.action);
            seq += 1;
            ids.push((trigger.id(), trigger.location().clone()));
            next.insert(trigger);
        }

        self.commit(&mut writer, next)?;
        writer.next_seq = seq;
        Ok(ids
            .into_iter()
            .map(|(id, location)| {
                debug!(trigger_id = %id, location = %location, "trigger registered");
                id
            })
            .collect())
    }

    /// Remove a trigger. Returns false if it was not registered.
    pub fn unregister(&self, id: TriggerId) -> bool {
        self.unregister_all(&[id]) == 1
    }

    /// Remove every listed trigger; unknown ids are ignored. Returns how many
    /// were removed.
    pub fn unregister_all(&self, ids: &[TriggerId]) -> usize {
        let mut writer = self.lock_writer();
        let mut next = (*self.snapshot()).clone();
        let removed: Vec<TriggerId> = ids.iter().copied().filter(|id| next.remove(*id)).collect();
        if removed.is_empty() {
            return 0;
        }
        self.install_releasing(&mut writer, next);
        for id in &removed {
            debug!(trigger_id = %id, "trigger unregistered");
        }
        removed.len()
    }

    /// Enable triggers. Hooks newly-monitored locations; a host refusal
    /// leaves the registry unchanged.
    pub fn enable(&self, ids: &[TriggerId]) -> Result<usize, RegistrationError> {
        self.set_enabled(ids, true)
    }

    /// Disable triggers. Locations left without an enabled trigger are unhooked.
    pub fn disable(&self, ids: &[TriggerId]) -> usize {
        // Disabling only ever releases hooks, so it cannot be refused.
        self.set_enabled(ids, false).unwrap_or(0)
    }

    fn set_enabled(&self, ids: &[TriggerId], enabled: bool) -> Result<usize, RegistrationError> {
        let mut writer = self.lock_writer();
        if enabled && writer.closed {
            return Err(RegistrationError::Closed);
        }
        let mut next = (*self.snapshot()).clone();
        let found = ids.iter().filter(|id| next.set_enabled(**id, enabled)).count();
        if found == 0 {
            return Ok(0);
        }
        for id in ids {
            debug!(trigger_id = %id, enabled, "trigger state changed");
        }
        self.commit(&mut writer, next)?;
        Ok(found)
    }

    /// Remove every trigger and release every hook.
    pub fn clear(&self) -> usize {
        let mut writer = self.lock_writer();
        self.clear_locked(&mut writer)
    }

    /// Clear and refuse every later registration or enable with `Closed`.
    ///
    /// Both happen under the writer lock, so a registration racing with
    /// `close` is either removed by it or refused.
    pub fn close(&self) -> usize {
        let mut writer = self.lock_writer();
        writer.closed = true;
        self.clear_locked(&mut writer)
    }

    /// Whether `close` ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_writer().closed
    }

    fn clear_locked(&self, writer: &mut WriterState) -> usize {
        let current = self.snapshot();
        let removed = current.len();
        let next = RegistrySnapshot {
            version: current.version,
            ..RegistrySnapshot::default()
        };
        self.install_releasing(writer, next);
        writer.lifecycle.release_all();
        debug!(removed, "registry cleared");
        removed
    }

    /// Locations currently hooked in the host.
    #[must_use]
    pub fn monitored_locations(&self) -> Vec<Location> {
        self.lock_writer().lifecycle.active()
    }

    #[must_use]
    pub fn is_monitored(&self, location: &Location) -> bool {
        self.lock_writer().lifecycle.is_active(location)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hook what `next` needs, install it, then unhook what it no longer needs.
    fn commit(&self, writer: &mut WriterState, mut next: RegistrySnapshot) -> Result<(), RegistrationError> {
        let plan = writer.lifecycle.plan(&next.enabled_locations());
        writer.lifecycle.acquire(&plan.acquire)?;
        next.version = self.snapshot().version + 1;
        self.install(next);
        writer.lifecycle.release(&plan.release);
        Ok(())
    }

    fn install_releasing(&self, writer: &mut WriterState, mut next: RegistrySnapshot) {
        let plan = writer.lifecycle.plan(&next.enabled_locations());
        next.version = self.snapshot().version + 1;
        self.install(next);
        writer.lifecycle.release(&plan.release);
    }

    fn install(&self, next: RegistrySnapshot) {
        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TriggerRegistry")
            .field("version", &snapshot.version())
            .field("triggers", &snapshot.len())
            .finish_non_exhaustive()
    }
}
