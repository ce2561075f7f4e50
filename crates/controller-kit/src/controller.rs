//! The untyped reconciliation engine.
//!
//! [`ControllerBase`] drives the level-triggered control loop for a concrete
//! controller implementing [`Controller`]: it pulls keys off the work queue,
//! fetches the latest cached state, manages finalizer registration and
//! release, and dispatches to `reconcile` or `finalize` depending on the
//! object's lifecycle. Errors wrapped as
//! [`ReconcileError::Retry`](crate::error::ReconcileError) re-queue the key
//! with exponential backoff; everything else is logged and dropped, relying
//! on the next external trigger.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use snafu::ResultExt;
use tokio::task::JoinSet;

use crate::{
    error::{
        AlreadyStartedSnafu, BoxedError, CycleError, DeadlineExceededSnafu, GetObjectSnafu,
        ReconcileError, StartError, UpdateFinalizersSnafu,
    },
    event::{DeletedObject, EventSource, ResourceEvent, SyncedToken, wait_for_all_synced},
    key::ObjectKey,
    meta::{self, Lifecycle, WatchedObject},
    queue::{DoneGuard, WorkQueue},
};

/// Engine tuning knobs. The defaults match common client-go controllers.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// How long `start_workers` waits for all event source caches to sync
    /// before giving up.
    pub cache_sync_timeout: Duration,

    /// Deadline for a single processing cycle; a stuck cycle surfaces as a
    /// `DeadlineExceeded` error instead of stalling its worker.
    pub cycle_timeout: Duration,

    /// How long `shutdown` waits for in-flight workers before returning
    /// regardless.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cache_sync_timeout: Duration::from_secs(120),
            cycle_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// What an event handler observed: the object itself, or only the key of an
/// object whose final state is unknown.
#[derive(Clone)]
pub enum EventObject {
    Object(Arc<dyn WatchedObject>),
    Tombstone(ObjectKey),
}

impl EventObject {
    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            Self::Object(obj) => obj.key(),
            Self::Tombstone(key) => Some(key.clone()),
        }
    }
}

/// Contract a concrete controller implements to be driven by
/// [`ControllerBase`].
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Maps any watched object (primary or dependent) to the primary keys it
    /// should trigger. Dependent-object watches typically resolve owner
    /// references here.
    fn object_to_keys(&self, obj: &EventObject) -> Vec<ObjectKey>;

    /// Latest cached state of the primary object. [`None`] means the object
    /// no longer exists, which ends the cycle without an error.
    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Box<dyn WatchedObject>>, BoxedError>;

    /// Persists metadata changes (primarily finalizers) through the backing
    /// API, returning the stored object.
    async fn update_object(
        &self,
        obj: Box<dyn WatchedObject>,
    ) -> Result<Box<dyn WatchedObject>, BoxedError>;

    async fn reconcile(&self, obj: &dyn WatchedObject) -> Result<(), ReconcileError>;

    async fn finalize(&self, obj: &dyn WatchedObject) -> Result<(), ReconcileError>;

    /// Per-cycle reconciler factory. When this returns a session, `reconcile`
    /// and `finalize` are dispatched to it instead of the controller itself,
    /// so request-scoped clients and caches never leak across cycles.
    fn new_reconciler(&self) -> Option<Box<dyn Reconciler>> {
        None
    }
}

/// Ephemeral per-cycle reconciliation session.
#[async_trait]
pub trait Reconciler: Send {
    async fn reconcile(&mut self, obj: &dyn WatchedObject) -> Result<(), ReconcileError>;

    async fn finalize(&mut self, obj: &dyn WatchedObject) -> Result<(), ReconcileError>;
}

/// Driver loop for an untyped controller.
pub struct ControllerBase {
    shared: Arc<EngineShared>,
    config: ControllerConfig,
    event_sources: Vec<EventSource<Arc<dyn WatchedObject>>>,
    watch_caches: Vec<SyncedToken>,
    pumps: JoinSet<()>,
    workers: JoinSet<()>,
    started: bool,
}

struct EngineShared {
    name: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    controller: Arc<dyn Controller>,
    finalizers: Vec<String>,
    cycle_timeout: Duration,
}

impl ControllerBase {
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        controller: Arc<dyn Controller>,
        finalizers: Vec<String>,
    ) -> Self {
        Self::with_config(name, controller, finalizers, ControllerConfig::default())
    }

    /// Like [`ControllerBase::new`], with explicit tuning instead of the
    /// defaults.
    pub fn with_config(
        name: impl Into<String>,
        controller: Arc<dyn Controller>,
        finalizers: Vec<String>,
        config: ControllerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(EngineShared {
                queue: WorkQueue::new(name.clone()),
                name,
                controller,
                finalizers,
                cycle_timeout: config.cycle_timeout,
            }),
            config,
            event_sources: Vec::new(),
            watch_caches: Vec::new(),
            pumps: JoinSet::new(),
            workers: JoinSet::new(),
            started: false,
        }
    }

    /// Registers a stream of change notifications feeding the queue.
    pub fn add_event_source(mut self, source: EventSource<Arc<dyn WatchedObject>>) -> Self {
        self.event_sources.push(source);
        self
    }

    /// Registers an additional cache whose sync state gates worker startup
    /// without feeding events.
    pub fn add_watch_cache(mut self, synced: SyncedToken) -> Self {
        self.watch_caches.push(synced);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Waits for all registered caches to sync, then launches `workers`
    /// worker tasks. Event sources must be registered (and their watches
    /// started) beforehand.
    pub async fn start_workers(&mut self, workers: usize) -> Result<(), StartError> {
        if self.started {
            return AlreadyStartedSnafu.fail();
        }

        let mut tokens = self.watch_caches.clone();
        for source in std::mem::take(&mut self.event_sources) {
            tokens.push(source.synced_token());
            let shared = Arc::clone(&self.shared);
            self.pumps.spawn(pump_events(shared, source.events));
        }

        tracing::info!(controller = %self.shared.name, "Waiting for caches to sync");
        if let Err(err) = wait_for_all_synced(&tokens, self.config.cache_sync_timeout).await {
            self.pumps.abort_all();
            return Err(err);
        }

        for _ in 0..workers {
            let shared = Arc::clone(&self.shared);
            self.workers.spawn(worker_loop(shared));
        }
        self.started = true;
        Ok(())
    }

    /// Stops queue intake and waits, bounded by the configured grace period,
    /// for in-flight workers. Running cycles are not interrupted.
    pub async fn shutdown(&mut self) {
        self.shared.queue.shutdown();
        self.pumps.abort_all();

        let drain = async {
            while self.workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                controller = %self.shared.name,
                grace = ?self.config.shutdown_grace,
                "Workers still busy after the shutdown grace period"
            );
        }
    }
}

async fn pump_events(
    shared: Arc<EngineShared>,
    mut events: BoxStream<'static, ResourceEvent<Arc<dyn WatchedObject>>>,
) {
    while let Some(event) = events.next().await {
        for trigger in expand_event(event) {
            for key in shared.controller.object_to_keys(&trigger) {
                if key.name.is_empty() {
                    continue;
                }
                tracing::debug!(controller = %shared.name, key = %key, "Enqueue");
                shared.queue.add(key);
            }
        }
    }
}

/// Normalizes an event into handler triggers. An update that changes the UID
/// means the object was deleted and recreated under the same name; the dead
/// incarnation is surfaced as a tombstone so the two lifetimes are not
/// conflated.
fn expand_event(event: ResourceEvent<Arc<dyn WatchedObject>>) -> Vec<EventObject> {
    match event {
        ResourceEvent::Added(obj) | ResourceEvent::Deleted(DeletedObject::Object(obj)) => {
            vec![EventObject::Object(obj)]
        }
        ResourceEvent::Updated { old, current } => {
            let mut triggers = Vec::with_capacity(2);
            if old.object_meta().uid != current.object_meta().uid {
                if let Some(key) = old.key() {
                    triggers.push(EventObject::Tombstone(key));
                }
            }
            triggers.push(EventObject::Object(current));
            triggers
        }
        ResourceEvent::Deleted(DeletedObject::Tombstone(key)) => {
            vec![EventObject::Tombstone(key)]
        }
    }
}

async fn worker_loop(shared: Arc<EngineShared>) {
    while let Some(key) = shared.queue.get().await {
        tracing::debug!(controller = %shared.name, key = %key, "Dequeued key");
        if let Err(err) = shared.process(key.clone()).await {
            tracing::warn!(
                controller = %shared.name,
                key = %key,
                category = err.category(),
                error = &err as &dyn std::error::Error,
                "Failed sync"
            );
        }
    }
}

impl EngineShared {
    async fn process(&self, key: ObjectKey) -> Result<(), CycleError> {
        let _done = DoneGuard {
            queue: &self.queue,
            item: key.clone(),
        };

        match tokio::time::timeout(self.cycle_timeout, self.cycle(&key)).await {
            Ok(result) => result,
            Err(_) => DeadlineExceededSnafu {
                key,
                timeout: self.cycle_timeout,
            }
            .fail(),
        }
    }

    async fn cycle(&self, key: &ObjectKey) -> Result<(), CycleError> {
        let fetched = self
            .controller
            .get_object(key)
            .await
            .context(GetObjectSnafu { key: key.clone() })?;
        let Some(mut obj) = fetched else {
            // no longer exists
            return Ok(());
        };

        let lifecycle = Lifecycle::of(obj.object_meta());

        if lifecycle == Lifecycle::Active && !self.finalizers.is_empty() {
            let mut registered = false;
            for finalizer in &self.finalizers {
                if meta::add_finalizer(obj.object_meta_mut(), finalizer) {
                    obj = self
                        .controller
                        .update_object(obj)
                        .await
                        .context(UpdateFinalizersSnafu { key: key.clone() })?;
                    registered = true;
                }
            }
            if registered {
                // the persisted update re-triggers through the watch, so the
                // first domain reconcile runs with the finalizer in place
                tracing::debug!(key = %key, "Registered finalizers");
                return Ok(());
            }
        }

        match self.dispatch(lifecycle, &*obj).await {
            Ok(()) => {
                if lifecycle == Lifecycle::PendingDeletion {
                    let mut released = false;
                    for finalizer in &self.finalizers {
                        released |= meta::remove_finalizer(obj.object_meta_mut(), finalizer);
                    }
                    if released {
                        if let Err(err) = self.controller.update_object(obj).await {
                            // finalize is idempotent, run the whole cycle again
                            tracing::debug!(
                                key = %key,
                                error = err.as_ref() as &dyn std::error::Error,
                                "Failed to release finalizers, requeueing"
                            );
                            self.queue.add_rate_limited(key.clone());
                            return Ok(());
                        }
                    }
                }
                self.queue.forget(key);
                Ok(())
            }
            Err(err) if err.is_retry() => {
                tracing::debug!(
                    key = %key,
                    error = &err as &dyn std::error::Error,
                    "Requeueing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
                Ok(())
            }
            Err(source) => Err(match lifecycle {
                Lifecycle::Active => CycleError::Reconcile {
                    source,
                    key: key.clone(),
                },
                Lifecycle::PendingDeletion => CycleError::Finalize {
                    source,
                    key: key.clone(),
                },
            }),
        }
    }

    async fn dispatch(
        &self,
        lifecycle: Lifecycle,
        obj: &dyn WatchedObject,
    ) -> Result<(), ReconcileError> {
        match (lifecycle, self.controller.new_reconciler()) {
            (Lifecycle::Active, Some(mut session)) => session.reconcile(obj).await,
            (Lifecycle::Active, None) => self.controller.reconcile(obj).await,
            (Lifecycle::PendingDeletion, Some(mut session)) => session.finalize(obj).await,
            (Lifecycle::PendingDeletion, None) => self.controller.finalize(obj).await,
        }
    }
}
