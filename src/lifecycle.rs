//! Instrumentation lifecycle manager.
//!
//! Keeps the host's hooks in step with the registry: a location is hooked
//! exactly when it has at least one enabled trigger. The manager is only ever
//! driven from the registry's writer lock, so the host sees one subscribe per
//! newly-monitored location and one unsubscribe per released one.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{HostError, RegistrationError};
use crate::host::HostRuntime;
use crate::location::Location;

/// Hooks to add and remove to reach a wanted set of monitored locations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub acquire: Vec<Location>,
    pub release: Vec<Location>,
}

impl LifecyclePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acquire.is_empty() && self.release.is_empty()
    }
}

/// Tracks which locations currently hold a host hook.
pub struct LifecycleManager {
    host: Arc<dyn HostRuntime>,
    active: HashSet<Location>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self {
            host,
            active: HashSet::new(),
        }
    }

    /// Diff the hooked set against `wanted`.
    #[must_use]
    pub fn plan(&self, wanted: &HashSet<Location>) -> LifecyclePlan {
        LifecyclePlan {
            acquire: wanted.difference(&self.active).cloned().collect(),
            release: self.active.difference(wanted).cloned().collect(),
        }
    }

    /// Hook every location in `locations`, all or nothing.
    ///
    /// On the first refusal the hooks acquired by this call are released
    /// again and the refusal is reported as `UnsupportedLocation`.
    pub fn acquire(&mut self, locations: &[Location]) -> Result<(), RegistrationError> {
        let mut acquired: Vec<&Location> = Vec::with_capacity(locations.len());
        for location in locations {
            if self.active.contains(location) {
                continue;
            }
            let result = if self.host.supports(location.kind()) {
                self.host.subscribe(location)
            } else {
                Err(HostError::UnsupportedEvent {
                    kind: location.kind().to_string(),
                })
            };
            match result {
                Ok(()) => {
                    debug!(location = %location, "hook subscribed");
                    self.active.insert(location.clone());
                    acquired.push(location);
                }
                Err(err) => {
                    for done in acquired {
                        self.host.unsubscribe(done);
                        self.active.remove(done);
                        debug!(location = %done, "hook rolled back");
                    }
                    return Err(RegistrationError::UnsupportedLocation {
                        location: location.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Unhook every location in `locations` that is currently hooked.
    pub fn release(&mut self, locations: &[Location]) {
        for location in locations {
            if self.active.remove(location) {
                self.host.unsubscribe(location);
                debug!(location = %location, "hook unsubscribed");
            }
        }
    }

    pub fn release_all(&mut self) {
        for location in self.active.drain() {
            self.host.unsubscribe(&location);
            debug!(location = %location, "hook unsubscribed");
        }
    }

    #[must_use]
    pub fn is_active(&self, location: &Location) -> bool {
        self.active.contains(location)
    }

    /// Currently hooked locations, in display order.
    #[must_use]
    pub fn active(&self) -> Vec<Location> {
        let mut out: Vec<Location> = self.active.iter().cloned().collect();
        out.sort_by_cached_key(ToString::to_string);
        out
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
