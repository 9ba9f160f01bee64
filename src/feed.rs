//! Fire-record feed.
//!
//! Every firing, condition error, action error and capture produces a
//! `FireRecord` fanned out to subscribers over bounded channels. Publishing
//! never blocks the monitored thread: a full or disconnected subscriber loses
//! the record and the drop is counted. With no subscribers nothing is built.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Outcome;
use crate::error::{WatchError, WatchResult};
use crate::host::CaptureRef;
use crate::location::Location;
use crate::trigger::TriggerId;

/// Unique identifier for a feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened when a trigger was evaluated.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FireOutcome {
    /// The action ran and produced this outcome.
    Fired { outcome: Outcome },
    ConditionError { message: String },
    ActionError { message: String },
    /// The capture collaborator stored a capture.
    Captured { reference: CaptureRef },
    /// The trigger was not evaluated because dispatch nested too deeply.
    Skipped { reason: String },
}

/// One entry of the feed.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireRecord {
    pub event_id: Uuid,
    pub trigger_id: TriggerId,
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub outcome: FireOutcome,
}

impl FireRecord {
    #[must_use]
    pub fn new(trigger_id: TriggerId, location: Location, outcome: FireOutcome) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trigger_id,
            timestamp: Utc::now(),
            location,
            outcome,
        }
    }
}

/// Fan-out point for fire records.
#[derive(Debug)]
pub struct FeedHub {
    capacity: usize,
    subscribers: RwLock<HashMap<SubscriptionId, Sender<FireRecord>>>,
    active: AtomicUsize,
    dropped: AtomicU64,
}

impl FeedHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Whether anyone is listening.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Records lost to full or disconnected subscribers.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn subscribe(&self) -> (SubscriptionId, Receiver<FireRecord>) {
        let id = SubscriptionId::new();
        let (tx, rx) = bounded(self.capacity);
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.insert(id, tx);
        self.active.store(subs.len(), Ordering::Release);
        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.remove(&id);
        self.active.store(subs.len(), Ordering::Release);
    }

    /// Drop every subscriber; their feeds disconnect once drained.
    pub(crate) fn close(&self) {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.clear();
        self.active.store(0, Ordering::Release);
    }

    /// Build and publish a record, but only if someone is subscribed.
    pub(crate) fn publish_with<F>(&self, build: F)
    where
        F: FnOnce() -> FireRecord,
    {
        if !self.has_subscribers() {
            return;
        }
        let record = build();
        let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for tx in subs.values() {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(trigger_id = %record.trigger_id, "fire record dropped");
                }
            }
        }
    }
}

/// A subscription to the fire-record feed.
///
/// Dropping the feed unsubscribes it.
#[derive(Debug)]
pub struct FireFeed {
    subscription_id: SubscriptionId,
    rx: Receiver<FireRecord>,
    hub: Weak<FeedHub>,
    unsubscribed: AtomicBool,
}

impl FireFeed {
    pub(crate) fn new(subscription_id: SubscriptionId, rx: Receiver<FireRecord>, hub: Weak<FeedHub>) -> Self {
        Self {
            subscription_id,
            rx,
            hub,
            unsubscribed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Stop receiving new records. Idempotent; buffered records stay readable.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.subscription_id);
        }
    }

    /// Receive the next record (blocking).
    pub fn recv(&self) -> WatchResult<FireRecord> {
        self.rx.recv().map_err(|_| WatchError::Disconnected {
            path: "fire_feed".to_string(),
        })
    }

    /// Receive the next record with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> WatchResult<FireRecord> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WatchError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => WatchError::Disconnected {
                path: "fire_feed".to_string(),
            },
        })
    }

    /// Next buffered record, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<FireRecord> {
        self.rx.try_recv().ok()
    }

    /// Every record currently buffered.
    #[must_use]
    pub fn drain(&self) -> Vec<FireRecord> {
        self.rx.try_iter().collect()
    }
}

impl Drop for FireFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
