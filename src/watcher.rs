//! Registration surface.
//!
//! `Watcher` ties a host runtime to a registry, a dispatcher and a fire-record
//! feed. It is a cheap handle: clones share the same engine, and the engine
//! is torn down (all triggers removed, all hooks released, all feeds closed)
//! when the last clone is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, instrument};

use crate::action::Action;
use crate::condition::Condition;
use crate::config::WatchConfig;
use crate::dispatcher::{DispatchPolicy, Directive, Dispatcher, HostEvent};
use crate::error::{RegistrationError, WatchError, WatchResult};
use crate::feed::{FeedHub, FireFeed};
use crate::host::{CaptureSink, Frame, HostRuntime};
use crate::location::{Identifier, Location, LocationSpec};
use crate::registry::{NewTrigger, TriggerRegistry};
use crate::trigger::TriggerId;

/// Builder for a [`Watcher`].
pub struct WatcherBuilder {
    host: Arc<dyn HostRuntime>,
    config: WatchConfig,
    capture: Option<Arc<dyn CaptureSink>>,
}

impl WatcherBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Route `RequestCapture` outcomes to `sink`.
    #[must_use]
    pub fn capture_sink(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    /// Assemble the engine.
    #[must_use]
    pub fn build(self) -> Watcher {
        let config = self.config.normalized();
        let registry = Arc::new(TriggerRegistry::new(self.host));
        let feed = Arc::new(FeedHub::new(config.feed_capacity));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&feed),
            self.capture,
            DispatchPolicy::from(&config),
        );
        Watcher {
            inner: Arc::new(WatcherInner {
                registry,
                dispatcher,
                feed,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct WatcherInner {
    registry: Arc<TriggerRegistry>,
    dispatcher: Dispatcher,
    feed: Arc<FeedHub>,
    config: WatchConfig,
    closed: AtomicBool,
}

impl WatcherInner {
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.registry.close();
        self.feed.close();
        debug!(removed, "watcher torn down");
    }
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Entry point for registering triggers against a host runtime.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// A watcher with default configuration and no capture sink.
    #[must_use]
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self::builder(host).build()
    }

    /// Start configuring a watcher.
    #[must_use]
    pub fn builder(host: Arc<dyn HostRuntime>) -> WatcherBuilder {
        WatcherBuilder {
            host,
            config: WatchConfig::default(),
            capture: None,
        }
    }

    /// Effective (normalized) configuration.
    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// The registry backing this watcher.
    #[must_use]
    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.inner.registry
    }

    /// Start describing a trigger.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use kyrowatch::{Action, FunctionRef, ProgramImage, SimulatedHost, Watcher};
    ///
    /// let host = Arc::new(SimulatedHost::new(
    ///     ProgramImage::new().function("app", "f", 1, &["def f(x):", "    return x"]),
    /// ));
    /// let watcher = Watcher::new(host);
    /// let handle = watcher
    ///     .when(FunctionRef::new("app", "f"))
    ///     .at_str("<start>")
    ///     .condition_expr("x > 5")
    ///     .then(Action::stop())
    ///     .register()
    ///     .unwrap();
    /// assert_eq!(handle.ids().len(), 1);
    /// ```
    pub fn when(&self, spec: impl Into<LocationSpec>) -> TriggerBuilder<'_> {
        TriggerBuilder {
            watcher: self,
            spec: spec.into(),
            condition: None,
            action: None,
            error: None,
        }
    }

    /// Resolve `spec` and register one trigger per resolved location, atomically.
    #[instrument(level = "debug", skip_all, fields(spec = %spec))]
    pub fn register(
        &self,
        spec: &LocationSpec,
        condition: Option<Condition>,
        action: Action,
    ) -> WatchResult<TriggerHandle> {
        self.ensure_open()?;
        let locations = spec.resolve(self.inner.registry.host().as_ref())?;
        let entries = locations
            .into_iter()
            .map(|location| NewTrigger {
                location,
                condition: condition.clone(),
                action: action.clone(),
            })
            .collect();
        let ids = self.inner.registry.register_all(entries).map_err(refused)?;
        debug!(triggers = ids.len(), "registration complete");
        Ok(TriggerHandle::new(ids, Arc::downgrade(&self.inner.registry)))
    }

    /// Register a single trigger at an exact location.
    pub fn register_at(
        &self,
        location: Location,
        condition: Option<Condition>,
        action: Action,
    ) -> WatchResult<TriggerHandle> {
        self.ensure_open()?;
        let id = self
            .inner
            .registry
            .register(location, condition, action)
            .map_err(refused)?;
        Ok(TriggerHandle::new(vec![id], Arc::downgrade(&self.inner.registry)))
    }

    /// Deliver a host event. See [`Dispatcher::dispatch`].
    pub fn dispatch(&self, event: &HostEvent<'_>, frame: &mut dyn Frame) -> Directive {
        self.inner.dispatcher.dispatch(event, frame)
    }

    /// Subscribe to fire records.
    #[must_use]
    pub fn subscribe_feed(&self) -> FireFeed {
        let (id, rx) = self.inner.feed.subscribe();
        FireFeed::new(id, rx, Arc::downgrade(&self.inner.feed))
    }

    /// Fire records lost to slow subscribers.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.inner.feed.dropped()
    }

    /// Locations currently hooked in the host.
    #[must_use]
    pub fn monitored_locations(&self) -> Vec<Location> {
        self.inner.registry.monitored_locations()
    }

    /// Registered triggers, enabled or not.
    #[must_use]
    pub fn trigger_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Remove every trigger and release every hook. The watcher stays usable.
    pub fn clear_all(&self) -> usize {
        self.inner.registry.clear()
    }

    /// Remove everything and close all feeds. Later registrations fail with
    /// `Closed`; dispatch keeps returning `Continue`.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Whether `teardown` ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> WatchResult<()> {
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// A closed registry means the watcher was torn down.
fn refused(err: RegistrationError) -> WatchError {
    match err {
        RegistrationError::Closed => WatchError::Closed,
        other => other.into(),
    }
}

/// Fluent trigger description returned by [`Watcher::when`].
///
/// Parse errors from `at_str`/`condition_expr` are held until `register`.
pub struct TriggerBuilder<'w> {
    watcher: &'w Watcher,
    spec: LocationSpec,
    condition: Option<Condition>,
    action: Option<Action>,
    error: Option<RegistrationError>,
}

impl TriggerBuilder<'_> {
    /// Add an identifier.
    #[must_use]
    pub fn at(mut self, identifier: impl Into<Identifier>) -> Self {
        self.spec = self.spec.at(identifier);
        self
    }

    /// Add an identifier in its textual form (`<start>`, `+2`, `return x`).
    #[must_use]
    pub fn at_str(mut self, text: &str) -> Self {
        match Identifier::parse(text) {
            Ok(identifier) => self.spec = self.spec.at(identifier),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Refuse to register unless the target's source hash matches.
    #[must_use]
    pub fn source_hash(mut self, hash: impl Into<String>) -> Self {
        self.spec = self.spec.expect_source_hash(hash);
        self
    }

    /// Gate the action on `condition`; repeated calls are ANDed.
    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Gate the action on an expression; parse errors surface at `register`.
    #[must_use]
    pub fn condition_expr(self, source: &str) -> Self {
        match Condition::expr(source) {
            Ok(condition) => self.condition(condition),
            Err(err) => {
                let mut this = self;
                this.fail(err);
                this
            }
        }
    }

    /// Replace the action.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Append an action to the chain.
    #[must_use]
    pub fn then(mut self, action: Action) -> Self {
        self.action = Some(match self.action.take() {
            Some(existing) => existing.then(action),
            None => action,
        });
        self
    }

    /// Register; without an action the trigger only shows up in the feed.
    pub fn register(self) -> WatchResult<TriggerHandle> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        self.watcher
            .register(&self.spec, self.condition, self.action.unwrap_or(Action::Noop))
    }

    /// Register and remove again when the returned guard is dropped.
    pub fn register_scoped(self) -> WatchResult<ScopedTrigger> {
        self.register().map(TriggerHandle::scoped)
    }

    fn fail(&mut self, err: RegistrationError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

/// Handle to the triggers created by one registration.
///
/// Dropping a handle leaves its triggers registered; use [`TriggerHandle::remove`]
/// or [`TriggerHandle::scoped`] to tie their lifetime to a scope.
#[derive(Debug)]
pub struct TriggerHandle {
    ids: Vec<TriggerId>,
    registry: Weak<TriggerRegistry>,
    removed: AtomicBool,
}

impl TriggerHandle {
    fn new(ids: Vec<TriggerId>, registry: Weak<TriggerRegistry>) -> Self {
        Self {
            ids,
            registry,
            removed: AtomicBool::new(false),
        }
    }

    /// Triggers created by the registration, one per resolved location.
    #[must_use]
    pub fn ids(&self) -> &[TriggerId] {
        &self.ids
    }

    /// Remove every trigger of this handle. Idempotent.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_all(&self.ids);
        }
    }

    /// Re-enable every trigger of this handle.
    ///
    /// # Errors
    ///
    /// `HandleRemoved` after `remove` or once the triggers were cleared,
    /// `Closed` when the watcher is gone, or a registration error when a
    /// hook cannot be acquired.
    pub fn enable(&self) -> WatchResult<()> {
        let registry = self.live_registry()?;
        if registry.enable(&self.ids).map_err(refused)? == 0 {
            return Err(self.gone());
        }
        Ok(())
    }

    /// Disable every trigger of this handle.
    ///
    /// # Errors
    ///
    /// Same as [`TriggerHandle::enable`], minus hook acquisition.
    pub fn disable(&self) -> WatchResult<()> {
        let registry = self.live_registry()?;
        if registry.disable(&self.ids) == 0 {
            return Err(self.gone());
        }
        Ok(())
    }

    /// Whether any trigger of this handle is registered and enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let snapshot = registry.snapshot();
        self.ids
            .iter()
            .any(|id| snapshot.get(*id).is_some_and(|t| t.is_enabled()))
    }

    /// Whether `remove` ran or the triggers are known to be gone.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Tie the triggers' lifetime to the returned guard.
    #[must_use]
    pub fn scoped(self) -> ScopedTrigger {
        ScopedTrigger { handle: self }
    }

    fn live_registry(&self) -> WatchResult<Arc<TriggerRegistry>> {
        if self.is_removed() {
            return Err(WatchError::HandleRemoved);
        }
        self.registry.upgrade().ok_or(WatchError::Closed)
    }

    /// The registry no longer knows these ids (cleared or torn down).
    fn gone(&self) -> WatchError {
        self.removed.store(true, Ordering::Release);
        WatchError::HandleRemoved
    }
}

/// Removes its triggers when dropped.
#[derive(Debug)]
pub struct ScopedTrigger {
    handle: TriggerHandle,
}

impl ScopedTrigger {
    /// The underlying handle.
    #[must_use]
    pub fn handle(&self) -> &TriggerHandle {
        &self.handle
    }
}

impl std::ops::Deref for ScopedTrigger {
    type Target = TriggerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ScopedTrigger {
    fn drop(&mut self) {
        self.handle.remove();
    }
}
