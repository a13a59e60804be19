//! Model Registry - declared models, resident adapters and capacity
//!
//! The registry is the single owner of model lifecycle state. It tracks every
//! declared model, loads adapters on demand through the [`AdapterFactory`]
//! registered for the model's family, and keeps the committed memory estimate
//! within the configured capacity.
//!
//! # Locking
//!
//! ```text
//!   ledger (capacity account) ──▶ model map ──▶ model slot(s) ──▶ event log / stats
//! ```
//!
//! Locks are only ever taken in that order and never held across an `.await`.
//! A slot lock alone is enough for reference counting; anything that changes
//! committed capacity takes the ledger first.
//!
//! # Loading
//!
//! The first caller of [`ModelRegistry::ensure_loaded`] for an unloaded model
//! reserves capacity (evicting idle models if needed), moves the model to
//! `Loading` and spawns the load. Every caller, including the first, then
//! waits on the same outcome channel, so one load attempt serves all of them
//! and a caller that gives up waiting never strands the model in `Loading`.

mod events;
mod handle;
mod metrics;

pub use events::RegistryEvent;
pub use handle::{AdapterHandle, HandleLease};
pub use metrics::{HealthStatus, RegistryHealth, SessionOutcome, SessionReport, UsageStats};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use relay_kernel::{
    AdapterFactory, ModelDescriptor, ModelFamily, ModelId, ModelState, RelayError, RelayResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use events::EventLog;
use metrics::LoadStats;

// ============================================================================
// Configuration
// ============================================================================

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Total memory budget for resident models, in MB
    pub capacity_mb: u64,
    /// Upper bound on one adapter load, in seconds
    pub load_timeout_secs: u64,
    /// Number of state transitions kept for polling
    pub event_log_capacity: usize,
    /// Models loaded at startup
    pub preload: Vec<ModelId>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity_mb: 16 * 1024,
            load_timeout_secs: 120,
            event_log_capacity: 1024,
            preload: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_mb(mut self, capacity_mb: u64) -> Self {
        self.capacity_mb = capacity_mb;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    pub fn with_preload(mut self, models: Vec<ModelId>) -> Self {
        self.preload = models;
        self
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Immutable point-in-time view of one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSnapshot {
    pub descriptor: ModelDescriptor,
    pub state: ModelState,
    /// Position in registration order, starting at 0.
    pub registration_order: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub active_refs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_cause: Option<String>,
    pub usage: UsageStats,
}

impl ModelSnapshot {
    pub fn id(&self) -> &ModelId {
        &self.descriptor.id
    }

    pub fn memory_mb(&self) -> u64 {
        self.descriptor.resources.memory_mb
    }
}

// ============================================================================
// Internal state
// ============================================================================

type LoadOutcome = Result<AdapterHandle, RelayError>;

struct ModelSlot {
    descriptor: ModelDescriptor,
    order: u64,
    state: ModelState,
    state_tx: watch::Sender<ModelState>,
    handle: Option<AdapterHandle>,
    refs: usize,
    /// Callers waiting on the current load; a model with waiters is never evicted.
    waiters: usize,
    loading: Option<watch::Receiver<Option<LoadOutcome>>>,
    last_used: Option<DateTime<Utc>>,
    degraded_cause: Option<String>,
    usage: UsageStats,
}

impl ModelSlot {
    fn new(descriptor: ModelDescriptor, order: u64) -> Self {
        let (state_tx, _) = watch::channel(ModelState::Registered);
        Self {
            descriptor,
            order,
            state: ModelState::Registered,
            state_tx,
            handle: None,
            refs: 0,
            waiters: 0,
            loading: None,
            last_used: None,
            degraded_cause: None,
            usage: UsageStats::default(),
        }
    }

    fn memory_mb(&self) -> u64 {
        self.descriptor.resources.memory_mb
    }

    fn is_evictable(&self) -> bool {
        matches!(self.state, ModelState::Ready | ModelState::Degraded)
            && self.refs == 0
            && self.waiters == 0
    }

    fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            descriptor: self.descriptor.clone(),
            state: self.state,
            registration_order: self.order,
            last_used: self.last_used,
            active_refs: self.refs,
            degraded_cause: self.degraded_cause.clone(),
            usage: self.usage.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    committed_mb: u64,
}

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    factories: RwLock<HashMap<ModelFamily, Arc<dyn AdapterFactory>>>,
    ledger: Mutex<Ledger>,
    models: RwLock<HashMap<ModelId, Arc<Mutex<ModelSlot>>>>,
    events: Mutex<EventLog>,
    load_stats: Mutex<LoadStats>,
    next_order: AtomicU64,
    next_load_id: AtomicU64,
}

impl RegistryInner {
    fn slot(&self, model_id: &ModelId) -> RelayResult<Arc<Mutex<ModelSlot>>> {
        self.models
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| RelayError::ModelNotFound(model_id.clone()))
    }

    fn transition(&self, slot: &mut ModelSlot, to: ModelState, detail: Option<String>) {
        let from = slot.state;
        if from == to {
            return;
        }
        slot.state = to;
        slot.state_tx.send_replace(to);
        let event_id = self
            .events
            .lock()
            .record(&slot.descriptor.id, from, to, detail.clone());
        info!(
            model = %slot.descriptor.id,
            %from,
            %to,
            event_id,
            detail = detail.as_deref().unwrap_or(""),
            "model state transition"
        );
    }

    fn acquire(self: &Arc<Self>, slot: &mut ModelSlot, handle: AdapterHandle) -> HandleLease {
        slot.refs += 1;
        slot.last_used = Some(Utc::now());
        debug!(model = %slot.descriptor.id, refs = slot.refs, "handle acquired");
        HandleLease::new(handle, Arc::clone(self))
    }

    pub(crate) fn release(&self, model_id: &ModelId) {
        let Some(slot) = self.models.read().get(model_id).cloned() else {
            return;
        };
        let mut slot = slot.lock();
        slot.refs = slot.refs.saturating_sub(1);
        slot.last_used = Some(Utc::now());
        debug!(model = %model_id, refs = slot.refs, "handle released");
    }
}

/// Decrements a slot's waiter count if the waiting caller goes away.
struct WaiterGuard {
    slot: Arc<Mutex<ModelSlot>>,
    armed: bool,
}

impl WaiterGuard {
    fn new(slot: Arc<Mutex<ModelSlot>>) -> Self {
        Self { slot, armed: true }
    }

    /// Drop the waiter count while the caller already holds the slot lock.
    fn disarm(mut self, slot: &mut ModelSlot) {
        slot.waiters = slot.waiters.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.slot.lock();
            slot.waiters = slot.waiters.saturating_sub(1);
        }
    }
}

enum Step {
    Wait(watch::Receiver<Option<LoadOutcome>>),
    Settle(watch::Receiver<ModelState>),
    Start,
}

/// Work handed to a spawned load task.
struct LoadJob {
    inner: Arc<RegistryInner>,
    slot: Arc<Mutex<ModelSlot>>,
    descriptor: ModelDescriptor,
    factory: Arc<dyn AdapterFactory>,
    load_id: u64,
    outcome_tx: watch::Sender<Option<LoadOutcome>>,
    evicted: Vec<(Arc<Mutex<ModelSlot>>, AdapterHandle)>,
    previous: Option<AdapterHandle>,
}

// ============================================================================
// ModelRegistry
// ============================================================================

/// Model registry
///
/// This type is cheaply cloneable; all clones share the same underlying state.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let events = EventLog::new(config.event_log_capacity);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                factories: RwLock::new(HashMap::new()),
                ledger: Mutex::new(Ledger::default()),
                models: RwLock::new(HashMap::new()),
                events: Mutex::new(events),
                load_stats: Mutex::new(LoadStats::default()),
                next_order: AtomicU64::new(0),
                next_load_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn capacity_mb(&self) -> u64 {
        self.inner.config.capacity_mb
    }

    pub fn committed_mb(&self) -> u64 {
        self.inner.ledger.lock().committed_mb
    }

    /// Install the factory used to load models of its family.
    pub fn register_factory(&self, factory: Arc<dyn AdapterFactory>) {
        let family = factory.family();
        info!(%family, "adapter factory registered");
        self.inner.factories.write().insert(family, factory);
    }

    pub fn with_factory(self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.register_factory(factory);
        self
    }

    /// Declare a model.
    ///
    /// Registering an identical descriptor again is a no-op that returns the
    /// same id. A different descriptor under an existing id is rejected.
    pub fn register(&self, descriptor: ModelDescriptor) -> RelayResult<ModelId> {
        descriptor.validate()?;
        if !self.inner.factories.read().contains_key(&descriptor.family) {
            return Err(RelayError::InvalidDescriptor(format!(
                "no adapter factory for family '{}' (model '{}')",
                descriptor.family, descriptor.id
            )));
        }

        let id = descriptor.id.clone();
        let mut models = self.inner.models.write();
        if let Some(existing) = models.get(&id).cloned() {
            drop(models);
            let same = existing.lock().descriptor == descriptor;
            return if same {
                debug!(model = %id, "model already registered");
                Ok(id)
            } else {
                Err(RelayError::RegistrationConflict(id))
            };
        }

        let order = self.inner.next_order.fetch_add(1, Ordering::SeqCst);
        let slot = ModelSlot::new(descriptor, order);
        let event_id = self.inner.events.lock().record(
            &id,
            ModelState::Unregistered,
            ModelState::Registered,
            None,
        );
        models.insert(id.clone(), Arc::new(Mutex::new(slot)));
        info!(model = %id, order, event_id, "model registered");
        Ok(id)
    }

    /// Remove a model that is not resident.
    pub fn unregister(&self, model_id: &ModelId) -> RelayResult<()> {
        let mut models = self.inner.models.write();
        let slot = models
            .get(model_id)
            .cloned()
            .ok_or_else(|| RelayError::ModelNotFound(model_id.clone()))?;
        let slot = slot.lock();
        if !matches!(slot.state, ModelState::Registered | ModelState::Failed) || slot.refs > 0 {
            return Err(RelayError::InvalidRequest(format!(
                "model '{model_id}' is {} and cannot be unregistered",
                slot.state
            )));
        }
        let from = slot.state;
        drop(slot);
        models.remove(model_id);
        self.inner
            .events
            .lock()
            .record(model_id, from, ModelState::Unregistered, None);
        info!(model = %model_id, "model unregistered");
        Ok(())
    }

    /// Acquire the model's adapter, loading it first if needed.
    ///
    /// Concurrent callers for the same unloaded model share one load attempt
    /// and all observe its outcome. Fails with `CapacityExceeded` when the
    /// model cannot fit even after evicting every idle model; models with
    /// active leases are never evicted.
    pub async fn ensure_loaded(&self, model_id: &ModelId) -> RelayResult<HandleLease> {
        loop {
            let slot = self.inner.slot(model_id)?;
            let step = {
                let mut s = slot.lock();
                match s.state {
                    ModelState::Ready => match s.handle.clone() {
                        Some(handle) => return Ok(self.inner.acquire(&mut s, handle)),
                        None => Step::Start,
                    },
                    ModelState::Loading => match s.loading.clone() {
                        Some(rx) => {
                            s.waiters += 1;
                            Step::Wait(rx)
                        }
                        None => Step::Settle(s.state_tx.subscribe()),
                    },
                    ModelState::Unloading => Step::Settle(s.state_tx.subscribe()),
                    ModelState::Degraded if s.refs > 0 => {
                        return Err(RelayError::LoadError {
                            model: model_id.clone(),
                            reason: format!(
                                "model is degraded with {} active session(s)",
                                s.refs
                            ),
                        });
                    }
                    _ => Step::Start,
                }
            };

            let rx = match step {
                Step::Wait(rx) => rx,
                Step::Settle(mut state_rx) => {
                    let _ = state_rx
                        .wait_for(|st| !matches!(st, ModelState::Unloading | ModelState::Loading))
                        .await;
                    continue;
                }
                Step::Start => match self.begin_load(model_id, &slot)? {
                    Some(rx) => rx,
                    None => continue,
                },
            };

            let guard = WaiterGuard::new(Arc::clone(&slot));
            match Self::await_outcome(model_id, rx).await {
                Ok(handle) => {
                    let mut s = slot.lock();
                    let current = s.state == ModelState::Ready
                        && s.handle.as_ref().map(AdapterHandle::load_id) == Some(handle.load_id());
                    guard.disarm(&mut s);
                    if current {
                        return Ok(self.inner.acquire(&mut s, handle));
                    }
                    // Superseded between load and acquisition; go around again.
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn await_outcome(
        model_id: &ModelId,
        mut rx: watch::Receiver<Option<LoadOutcome>>,
    ) -> LoadOutcome {
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(result) => result.clone(),
                None => Err(RelayError::LoadError {
                    model: model_id.clone(),
                    reason: "load finished without an outcome".into(),
                }),
            },
            Err(_) => Err(RelayError::LoadError {
                model: model_id.clone(),
                reason: "load task aborted".into(),
            }),
        }
    }

    /// Reserve capacity, move the model to `Loading` and spawn the load.
    ///
    /// Returns `None` when the slot changed state before the ledger lock was
    /// taken and the caller should re-inspect it.
    fn begin_load(
        &self,
        model_id: &ModelId,
        slot: &Arc<Mutex<ModelSlot>>,
    ) -> RelayResult<Option<watch::Receiver<Option<LoadOutcome>>>> {
        let inner = &self.inner;
        let mut ledger = inner.ledger.lock();
        let others: Vec<Arc<Mutex<ModelSlot>>> = inner
            .models
            .read()
            .iter()
            .filter(|(id, _)| *id != model_id)
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let mut s = slot.lock();
        let reload = match s.state {
            ModelState::Registered | ModelState::Failed => false,
            ModelState::Degraded if s.refs == 0 => true,
            _ => return Ok(None),
        };

        let factory = inner
            .factories
            .read()
            .get(&s.descriptor.family)
            .cloned()
            .ok_or_else(|| {
                RelayError::InvalidDescriptor(format!(
                    "no adapter factory for family '{}'",
                    s.descriptor.family
                ))
            })?;

        let need = s.memory_mb();
        let capacity = inner.config.capacity_mb;
        let mut evicted = Vec::new();

        // A degraded reload reuses the memory it already holds.
        if !reload {
            let exceeded = |committed_mb| RelayError::CapacityExceeded {
                model: model_id.clone(),
                requested_mb: need,
                committed_mb,
                capacity_mb: capacity,
            };
            if need > capacity {
                return Err(exceeded(ledger.committed_mb));
            }

            if ledger.committed_mb + need > capacity {
                let mut guards: Vec<(usize, MutexGuard<'_, ModelSlot>)> = others
                    .iter()
                    .enumerate()
                    .map(|(i, o)| (i, o.lock()))
                    .filter(|(_, g)| g.is_evictable())
                    .collect();
                // Degraded first, then least recently used, then registration order.
                guards.sort_by(|(_, a), (_, b)| {
                    (a.state != ModelState::Degraded, a.last_used, a.order).cmp(&(
                        b.state != ModelState::Degraded,
                        b.last_used,
                        b.order,
                    ))
                });

                let mut freed = 0;
                let mut chosen = 0;
                for (_, g) in &guards {
                    if ledger.committed_mb - freed + need <= capacity {
                        break;
                    }
                    freed += g.memory_mb();
                    chosen += 1;
                }
                if ledger.committed_mb - freed + need > capacity {
                    warn!(
                        model = %model_id,
                        need,
                        committed = ledger.committed_mb,
                        capacity,
                        "no idle models to evict"
                    );
                    return Err(exceeded(ledger.committed_mb));
                }

                for (i, mut g) in guards.into_iter().take(chosen) {
                    if let Some(handle) = g.handle.take() {
                        ledger.committed_mb -= g.memory_mb();
                        inner.transition(
                            &mut g,
                            ModelState::Unloading,
                            Some(format!("evicted for '{model_id}'")),
                        );
                        evicted.push((Arc::clone(&others[i]), handle));
                    }
                }
            }
            ledger.committed_mb += need;
        }

        let load_id = inner.next_load_id.fetch_add(1, Ordering::SeqCst);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let previous = if reload { s.handle.take() } else { None };
        s.loading = Some(outcome_rx.clone());
        s.waiters += 1;
        inner.transition(&mut s, ModelState::Loading, None);
        let descriptor = s.descriptor.clone();
        drop(s);
        drop(ledger);

        let job = LoadJob {
            inner: Arc::clone(inner),
            slot: Arc::clone(slot),
            descriptor,
            factory,
            load_id,
            outcome_tx,
            evicted,
            previous,
        };
        tokio::spawn(Self::run_load(job));
        Ok(Some(outcome_rx))
    }

    async fn run_load(job: LoadJob) {
        let LoadJob {
            inner,
            slot,
            descriptor,
            factory,
            load_id,
            outcome_tx,
            evicted,
            previous,
        } = job;
        let model_id = descriptor.id.clone();

        for (victim, handle) in evicted {
            handle.revoke();
            handle.adapter().shutdown().await;
            let mut v = victim.lock();
            if v.state == ModelState::Unloading {
                inner.transition(&mut v, ModelState::Registered, None);
            }
        }
        if let Some(old) = previous {
            old.revoke();
            old.adapter().shutdown().await;
        }

        let timeout = inner.config.load_timeout();
        let started = Instant::now();
        let mut load = tokio::spawn({
            let descriptor = descriptor.clone();
            async move { factory.load(&descriptor).await }
        });

        let outcome: LoadOutcome = match tokio::time::timeout(timeout, &mut load).await {
            Ok(Ok(Ok(adapter))) => {
                let handle = AdapterHandle::new(model_id.clone(), load_id, adapter);
                {
                    let mut s = slot.lock();
                    s.handle = Some(handle.clone());
                    s.loading = None;
                    s.degraded_cause = None;
                    inner.transition(&mut s, ModelState::Ready, None);
                }
                inner.load_stats.lock().record_success(started.elapsed());
                info!(model = %model_id, load_id, elapsed_ms = started.elapsed().as_millis() as u64, "model loaded");
                Ok(handle)
            }
            Ok(Ok(Err(err))) => {
                let reason = err.to_string();
                Self::abandon_load(&inner, &slot, ModelState::Failed, Some(reason.clone()));
                inner.load_stats.lock().record_failure();
                warn!(model = %model_id, error = %reason, "model load failed");
                Err(RelayError::LoadError {
                    model: model_id.clone(),
                    reason,
                })
            }
            Ok(Err(join_err)) => {
                let reason = format!("load task failed: {join_err}");
                Self::abandon_load(&inner, &slot, ModelState::Failed, Some(reason.clone()));
                inner.load_stats.lock().record_failure();
                warn!(model = %model_id, error = %reason, "model load failed");
                Err(RelayError::LoadError {
                    model: model_id.clone(),
                    reason,
                })
            }
            Err(_) => {
                load.abort();
                let message = format!("load timed out after {}s", timeout.as_secs());
                Self::abandon_load(
                    &inner,
                    &slot,
                    ModelState::Registered,
                    Some(message.clone()),
                );
                inner.load_stats.lock().record_timeout();
                warn!(model = %model_id, timeout_secs = timeout.as_secs(), "model load timed out");
                Err(RelayError::Fatal {
                    model: model_id.clone(),
                    message,
                })
            }
        };

        outcome_tx.send_replace(Some(outcome));
    }

    fn abandon_load(
        inner: &RegistryInner,
        slot: &Arc<Mutex<ModelSlot>>,
        to: ModelState,
        detail: Option<String>,
    ) {
        let mut ledger = inner.ledger.lock();
        let mut s = slot.lock();
        ledger.committed_mb = ledger.committed_mb.saturating_sub(s.memory_mb());
        s.loading = None;
        s.handle = None;
        inner.transition(&mut s, to, detail);
    }

    /// Explicitly release a lease. Equivalent to dropping it.
    pub fn release_handle(&self, lease: HandleLease) {
        drop(lease);
    }

    /// Mark a Ready model degraded and revoke its handle.
    ///
    /// Sessions streaming from the model observe the revocation and end with
    /// an error. Automatic routing stops selecting the model. Calling this on
    /// a model that is not Ready is a no-op.
    pub fn mark_degraded(&self, model_id: &ModelId, cause: impl Into<String>) -> RelayResult<()> {
        let slot = self.inner.slot(model_id)?;
        let mut s = slot.lock();
        if s.state != ModelState::Ready {
            debug!(model = %model_id, state = %s.state, "mark_degraded ignored");
            return Ok(());
        }
        let cause = cause.into();
        if let Some(handle) = &s.handle {
            handle.revoke();
        }
        s.degraded_cause = Some(cause.clone());
        self.inner
            .transition(&mut s, ModelState::Degraded, Some(cause));
        Ok(())
    }

    /// Unload an idle resident model back to `Registered`.
    ///
    /// The model's memory stays committed until its adapter has shut down.
    /// Returns `false` when the model was not resident.
    pub async fn unload(&self, model_id: &ModelId) -> RelayResult<bool> {
        let slot = self.inner.slot(model_id)?;
        let handle = {
            let mut s = slot.lock();
            match s.state {
                ModelState::Ready | ModelState::Degraded => {}
                ModelState::Loading | ModelState::Unloading => {
                    return Err(RelayError::InvalidRequest(format!(
                        "model '{model_id}' is {}",
                        s.state
                    )));
                }
                _ => return Ok(false),
            }
            if s.refs > 0 || s.waiters > 0 {
                return Err(RelayError::InvalidRequest(format!(
                    "model '{model_id}' has {} active session(s)",
                    s.refs
                )));
            }
            let handle = s.handle.take();
            self.inner.transition(&mut s, ModelState::Unloading, None);
            handle
        };

        if let Some(handle) = handle {
            handle.revoke();
            handle.adapter().shutdown().await;
        }
        let mut ledger = self.inner.ledger.lock();
        let mut s = slot.lock();
        ledger.committed_mb = ledger.committed_mb.saturating_sub(s.memory_mb());
        self.inner.transition(&mut s, ModelState::Registered, None);
        Ok(true)
    }

    /// Unload every idle resident model. Models in use are left alone.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ModelId> = self
            .list_models()
            .into_iter()
            .filter(|m| matches!(m.state, ModelState::Ready | ModelState::Degraded))
            .map(|m| m.descriptor.id)
            .collect();

        let mut unloaded = 0;
        for id in ids {
            match self.unload(&id).await {
                Ok(true) => unloaded += 1,
                Ok(false) => {}
                Err(err) => warn!(model = %id, error = %err, "model left resident at shutdown"),
            }
        }
        info!(unloaded, "registry shut down");
        unloaded
    }

    /// Load the configured preload list, logging failures.
    pub async fn preload(&self) -> Vec<(ModelId, RelayResult<()>)> {
        let mut results = Vec::new();
        for id in self.inner.config.preload.clone() {
            let result = self.ensure_loaded(&id).await.map(drop);
            if let Err(err) = &result {
                warn!(model = %id, error = %err, "preload failed");
            }
            results.push((id, result));
        }
        results
    }

    /// Snapshot of every registered model, in registration order.
    pub fn list_models(&self) -> Vec<ModelSnapshot> {
        let slots: Vec<Arc<Mutex<ModelSlot>>> =
            self.inner.models.read().values().cloned().collect();
        let mut snapshots: Vec<ModelSnapshot> =
            slots.iter().map(|s| s.lock().snapshot()).collect();
        snapshots.sort_by_key(|s| s.registration_order);
        snapshots
    }

    pub fn snapshot(&self, model_id: &ModelId) -> Option<ModelSnapshot> {
        self.inner.slot(model_id).ok().map(|s| s.lock().snapshot())
    }

    pub fn state(&self, model_id: &ModelId) -> Option<ModelState> {
        self.inner.slot(model_id).ok().map(|s| s.lock().state)
    }

    /// Transitions newer than `after`.
    pub fn events_since(&self, after: u64) -> Vec<RegistryEvent> {
        self.inner.events.lock().since(after)
    }

    pub fn latest_event_id(&self) -> u64 {
        self.inner.events.lock().latest_id()
    }

    /// Account for a finished session on a model.
    pub fn record_session(&self, model_id: &ModelId, report: SessionReport) {
        if let Ok(slot) = self.inner.slot(model_id) {
            slot.lock().usage.record(&report);
        }
    }

    pub fn health(&self) -> RegistryHealth {
        let committed = self.committed_mb();
        let snapshots = self.list_models();
        let resident = snapshots.iter().filter(|s| s.state.is_resident()).count();
        let degraded = snapshots
            .iter()
            .filter(|s| s.state == ModelState::Degraded)
            .count();
        let stats = self.inner.load_stats.lock().clone();
        RegistryHealth::from_parts(
            &stats,
            committed,
            self.inner.config.capacity_mb,
            snapshots.len(),
            resident,
            degraded,
        )
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("capacity_mb", &self.inner.config.capacity_mb)
            .field("models", &self.inner.models.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_kernel::{
        AdapterError, CapabilitySet, ChunkStream, GenerationRequest, ModelAdapter,
    };
    use std::sync::atomic::AtomicUsize;

    struct NullAdapter;

    #[async_trait]
    impl ModelAdapter for NullAdapter {
        fn name(&self) -> &str {
            "null"
        }

        async fn generate(&self, _request: GenerationRequest) -> Result<ChunkStream, AdapterError> {
            Ok(Box::pin(futures::stream::empty::<
                Result<relay_kernel::AdapterChunk, AdapterError>,
            >()))
        }

        fn supports_streaming(&self) -> bool {
            true
        }

        fn describe_capabilities(&self) -> CapabilitySet {
            CapabilitySet::default()
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl AdapterFactory for CountingFactory {
        fn family(&self) -> ModelFamily {
            ModelFamily::Other("null".into())
        }

        async fn load(
            &self,
            _descriptor: &ModelDescriptor,
        ) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullAdapter))
        }
    }

    fn descriptor(id: &str, memory_mb: u64) -> ModelDescriptor {
        ModelDescriptor::new(id, ModelFamily::Other("null".into())).with_memory_mb(memory_mb)
    }

    fn registry(capacity_mb: u64) -> (ModelRegistry, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let registry = ModelRegistry::new(RegistryConfig::new().with_capacity_mb(capacity_mb))
            .with_factory(factory.clone());
        (registry, factory)
    }

    #[test]
    fn register_is_idempotent_and_detects_conflicts() {
        let (registry, _) = registry(100);
        let first = registry.register(descriptor("m1", 10)).unwrap();
        let second = registry.register(descriptor("m1", 10)).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.list_models().len(), 1);
        assert_eq!(registry.latest_event_id(), 1);

        let err = registry.register(descriptor("m1", 20)).unwrap_err();
        assert_eq!(err, RelayError::RegistrationConflict("m1".into()));
    }

    #[test]
    fn register_requires_known_family() {
        let (registry, _) = registry(100);
        let err = registry
            .register(ModelDescriptor::new("x", ModelFamily::RemoteHttp))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn ensure_loaded_then_release_tracks_refs() {
        let (registry, factory) = registry(100);
        let id = registry.register(descriptor("m1", 10)).unwrap();

        let lease = registry.ensure_loaded(&id).await.unwrap();
        assert_eq!(lease.model_id(), &id);
        assert_eq!(registry.state(&id), Some(ModelState::Ready));
        assert_eq!(registry.snapshot(&id).unwrap().active_refs, 1);
        assert_eq!(registry.committed_mb(), 10);

        let again = registry.ensure_loaded(&id).await.unwrap();
        assert_eq!(again.handle(), lease.handle());
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);

        registry.release_handle(again);
        drop(lease);
        assert_eq!(registry.snapshot(&id).unwrap().active_refs, 0);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let (registry, _) = registry(100);
        let err = registry.ensure_loaded(&"ghost".into()).await.unwrap_err();
        assert_eq!(err, RelayError::ModelNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn idle_model_is_evicted_lru_first() {
        let (registry, _) = registry(20);
        let a = registry.register(descriptor("a", 10)).unwrap();
        let b = registry.register(descriptor("b", 10)).unwrap();
        let c = registry.register(descriptor("c", 10)).unwrap();

        drop(registry.ensure_loaded(&a).await.unwrap());
        drop(registry.ensure_loaded(&b).await.unwrap());
        drop(registry.ensure_loaded(&c).await.unwrap());

        assert_eq!(registry.state(&a), Some(ModelState::Registered));
        assert_eq!(registry.state(&b), Some(ModelState::Ready));
        assert_eq!(registry.state(&c), Some(ModelState::Ready));
        assert_eq!(registry.committed_mb(), 20);
    }

    #[tokio::test]
    async fn mark_degraded_revokes_handle() {
        let (registry, _) = registry(100);
        let id = registry.register(descriptor("m1", 10)).unwrap();
        let lease = registry.ensure_loaded(&id).await.unwrap();

        registry.mark_degraded(&id, "bad output").unwrap();
        assert!(lease.is_revoked());
        let snap = registry.snapshot(&id).unwrap();
        assert_eq!(snap.state, ModelState::Degraded);
        assert_eq!(snap.degraded_cause.as_deref(), Some("bad output"));

        // In use: cannot be reloaded yet.
        assert!(matches!(
            registry.ensure_loaded(&id).await,
            Err(RelayError::LoadError { .. })
        ));
        drop(lease);

        // Idle: an explicit request reloads it.
        let fresh = registry.ensure_loaded(&id).await.unwrap();
        assert!(!fresh.is_revoked());
        assert_eq!(registry.state(&id), Some(ModelState::Ready));
        assert_eq!(registry.committed_mb(), 10);
    }

    #[tokio::test]
    async fn unload_and_shutdown_release_capacity() {
        let (registry, _) = registry(100);
        let a = registry.register(descriptor("a", 10)).unwrap();
        let b = registry.register(descriptor("b", 15)).unwrap();
        drop(registry.ensure_loaded(&a).await.unwrap());
        let held = registry.ensure_loaded(&b).await.unwrap();

        assert!(registry.unload(&b).await.is_err());
        assert!(registry.unload(&a).await.unwrap());
        assert!(!registry.unload(&a).await.unwrap());
        assert_eq!(registry.committed_mb(), 15);

        drop(held);
        assert_eq!(registry.shutdown().await, 1);
        assert_eq!(registry.committed_mb(), 0);
        assert_eq!(registry.health().resident_models, 0);
    }

    #[tokio::test]
    async fn unregister_only_when_idle() {
        let (registry, _) = registry(100);
        let id = registry.register(descriptor("m1", 10)).unwrap();
        let lease = registry.ensure_loaded(&id).await.unwrap();
        assert!(registry.unregister(&id).is_err());
        drop(lease);
        registry.unload(&id).await.unwrap();
        registry.unregister(&id).unwrap();
        assert!(registry.snapshot(&id).is_none());
        let last = registry.events_since(0).pop().unwrap();
        assert_eq!(last.to, ModelState::Unregistered);
    }

    #[tokio::test]
    async fn preload_loads_configured_models() {
        let factory = Arc::new(CountingFactory::default());
        let registry = ModelRegistry::new(
            RegistryConfig::new()
                .with_capacity_mb(100)
                .with_preload(vec!["m1".into(), "missing".into()]),
        )
        .with_factory(factory.clone());
        registry.register(descriptor("m1", 10)).unwrap();

        let results = registry.preload().await;
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(RelayError::ModelNotFound(_))));
        assert_eq!(registry.state(&"m1".into()), Some(ModelState::Ready));
        assert_eq!(registry.health().load_successes, 1);
    }
}
