//! The typed reconciliation engine.
//!
//! [`GenericControllerBase`] runs the same per-key state machine as
//! [`ControllerBase`](crate::controller::ControllerBase), specialized by a
//! compile-time resource type instead of trait objects. The concrete
//! controller only injects its capabilities: an [`ObjectStore`] for cache
//! reads and metadata updates, and a factory producing a fresh
//! [`GenericReconciler`] session per cycle.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use kube::Resource;
use snafu::ResultExt;
use tokio::task::JoinSet;

use crate::{
    controller::ControllerConfig,
    error::{
        AlreadyStartedSnafu, BoxedError, CycleError, DeadlineExceededSnafu, GetObjectSnafu,
        ReconcileError, StartError,
    },
    event::{DeletedObject, EventSource, ResourceEvent, SyncedToken, wait_for_all_synced},
    key::ObjectKey,
    meta::{self, Lifecycle},
    queue::{DoneGuard, WorkQueue},
};

/// Read and update access to the watched resource, typically a watcher-fed
/// [`Cache`](crate::watch::Cache) for reads and an API client for updates.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// Latest cached state; [`None`] (not an error) if the object is gone.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, BoxedError>;

    /// Persists the object's metadata, returning the stored object.
    async fn update(&self, obj: K) -> Result<K, BoxedError>;
}

/// Ephemeral per-cycle reconciliation session over a concrete resource type.
#[async_trait]
pub trait GenericReconciler<K>: Send {
    async fn reconcile(&mut self, obj: &K) -> Result<(), ReconcileError>;

    async fn finalize(&mut self, obj: &K) -> Result<(), ReconcileError>;
}

type ReconcilerFactory<K> = dyn Fn() -> Box<dyn GenericReconciler<K>> + Send + Sync;

/// Driver loop for a strongly-typed controller.
pub struct GenericControllerBase<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    shared: Arc<EngineShared<K>>,
    config: ControllerConfig,
    event_sources: Vec<EventSource<Arc<K>>>,
    watch_caches: Vec<SyncedToken>,
    pumps: JoinSet<()>,
    workers: JoinSet<()>,
    started: bool,
}

struct EngineShared<K> {
    name: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    store: Arc<dyn ObjectStore<K>>,
    new_reconciler: Box<ReconcilerFactory<K>>,
    finalizers: Vec<String>,
    cycle_timeout: Duration,
}

impl<K> GenericControllerBase<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore<K>>,
        new_reconciler: impl Fn() -> Box<dyn GenericReconciler<K>> + Send + Sync + 'static,
        finalizers: Vec<String>,
    ) -> Self {
        Self::with_config(
            name,
            store,
            new_reconciler,
            finalizers,
            ControllerConfig::default(),
        )
    }

    /// Like [`GenericControllerBase::new`], with explicit tuning instead of
    /// the defaults.
    pub fn with_config(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore<K>>,
        new_reconciler: impl Fn() -> Box<dyn GenericReconciler<K>> + Send + Sync + 'static,
        finalizers: Vec<String>,
        config: ControllerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(EngineShared {
                queue: WorkQueue::new(name.clone()),
                name,
                store,
                new_reconciler: Box::new(new_reconciler),
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

    /// Registers a stream of change notifications for the primary resource.
    pub fn add_event_source(mut self, source: EventSource<Arc<K>>) -> Self {
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
    /// worker tasks.
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

/// The typed engine watches its primary resource directly, so every event
/// enqueues the object's own key. A UID change additionally enqueues the old
/// incarnation's key so its lifetime is wound down separately.
fn event_keys<K>(event: &ResourceEvent<Arc<K>>) -> Vec<ObjectKey>
where
    K: Resource<DynamicType = ()>,
{
    match event {
        ResourceEvent::Added(obj) | ResourceEvent::Deleted(DeletedObject::Object(obj)) => {
            ObjectKey::from_meta(obj.meta()).into_iter().collect()
        }
        ResourceEvent::Updated { old, current } => {
            let mut keys = Vec::with_capacity(2);
            if old.meta().uid != current.meta().uid {
                keys.extend(ObjectKey::from_meta(old.meta()));
            }
            keys.extend(ObjectKey::from_meta(current.meta()));
            keys
        }
        ResourceEvent::Deleted(DeletedObject::Tombstone(key)) => vec![key.clone()],
    }
}

async fn pump_events<K>(shared: Arc<EngineShared<K>>, mut events: BoxStream<'static, ResourceEvent<Arc<K>>>)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    while let Some(event) = events.next().await {
        for key in event_keys(&event) {
            if key.name.is_empty() {
                continue;
            }
            tracing::debug!(controller = %shared.name, key = %key, "Enqueue");
            shared.queue.add(key);
        }
    }
}

async fn worker_loop<K>(shared: Arc<EngineShared<K>>)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
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
        tracing::debug!(controller = %shared.name, key = %key, "Finished process");
    }
}

impl<K> EngineShared<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
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
            .store
            .get(key)
            .await
            .context(GetObjectSnafu { key: key.clone() })?;
        let Some(current) = fetched else {
            // no longer exists
            return Ok(());
        };

        // never mutate the shared cache copy
        let mut target = (*current).clone();
        let lifecycle = Lifecycle::of(target.meta());

        match lifecycle {
            Lifecycle::Active => {
                let mut registered = false;
                for finalizer in &self.finalizers {
                    registered |= meta::add_finalizer(target.meta_mut(), finalizer);
                }
                if registered {
                    if let Err(err) = self.store.update(target).await {
                        // usually an optimistic concurrency conflict
                        tracing::debug!(
                            key = %key,
                            error = err.as_ref() as &dyn std::error::Error,
                            "Failed to register finalizers, requeueing"
                        );
                        self.queue.add_rate_limited(key.clone());
                        return Ok(());
                    }
                    // the persisted update re-triggers through the watch
                    tracing::debug!(key = %key, "Registered finalizers");
                    return Ok(());
                }
            }
            Lifecycle::PendingDeletion => {
                let finalizing = self
                    .finalizers
                    .iter()
                    .any(|finalizer| meta::has_finalizer(target.meta(), finalizer));
                if !finalizing {
                    // another actor already finalized this object
                    tracing::debug!(key = %key, "Skipping finalize, no finalizer left to release");
                    return Ok(());
                }
            }
        }

        let mut session = (self.new_reconciler)();
        let result = match lifecycle {
            Lifecycle::Active => session.reconcile(&target).await,
            Lifecycle::PendingDeletion => session.finalize(&target).await,
        };

        match result {
            Ok(()) => {
                if lifecycle == Lifecycle::PendingDeletion {
                    for finalizer in &self.finalizers {
                        meta::remove_finalizer(target.meta_mut(), finalizer);
                    }
                    if let Err(err) = self.store.update(target).await {
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
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use k8s_openapi::{
        api::core::v1::ConfigMap,
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    };

    use super::*;

    fn config_map(key: &ObjectKey, uid: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: key.namespace.clone(),
                name: Some(key.name.clone()),
                uid: Some(uid.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<HashMap<ObjectKey, ConfigMap>>,
        updates: Mutex<Vec<ConfigMap>>,
        fail_next_update: Mutex<bool>,
    }

    impl FakeStore {
        fn with_object(cm: ConfigMap) -> Arc<Self> {
            let store = Self::default();
            let key = ObjectKey::from_meta(cm.meta()).expect("fixture must have a name");
            store.objects.lock().expect("lock").insert(key, cm);
            Arc::new(store)
        }

        fn updates(&self) -> Vec<ConfigMap> {
            self.updates.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ObjectStore<ConfigMap> for FakeStore {
        async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<ConfigMap>>, BoxedError> {
            let objects = self.objects.lock().expect("lock");
            Ok(objects.get(key).cloned().map(Arc::new))
        }

        async fn update(&self, obj: ConfigMap) -> Result<ConfigMap, BoxedError> {
            if std::mem::take(&mut *self.fail_next_update.lock().expect("lock")) {
                return Err("conflict: object was modified".into());
            }
            let key = ObjectKey::from_meta(obj.meta()).expect("updated objects are always named");
            self.objects.lock().expect("lock").insert(key, obj.clone());
            self.updates.lock().expect("lock").push(obj.clone());
            Ok(obj)
        }
    }

    #[derive(Default)]
    struct Counters {
        sessions: Mutex<u32>,
        reconciled: Mutex<u32>,
        finalized: Mutex<u32>,
        reconcile_error: Mutex<Option<ReconcileError>>,
        hang_next_reconcile: Mutex<bool>,
    }

    struct CountingSession {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl GenericReconciler<ConfigMap> for CountingSession {
        async fn reconcile(&mut self, _obj: &ConfigMap) -> Result<(), ReconcileError> {
            if std::mem::take(&mut *self.counters.hang_next_reconcile.lock().expect("lock")) {
                std::future::pending::<()>().await;
            }
            if let Some(err) = self.counters.reconcile_error.lock().expect("lock").take() {
                return Err(err);
            }
            *self.counters.reconciled.lock().expect("lock") += 1;
            Ok(())
        }

        async fn finalize(&mut self, _obj: &ConfigMap) -> Result<(), ReconcileError> {
            *self.counters.finalized.lock().expect("lock") += 1;
            Ok(())
        }
    }

    fn engine(store: Arc<FakeStore>, counters: Arc<Counters>) -> EngineShared<ConfigMap> {
        EngineShared {
            name: "test".to_string(),
            queue: WorkQueue::new("test"),
            store,
            new_reconciler: Box::new(move || {
                let counters = Arc::clone(&counters);
                *counters.sessions.lock().expect("lock") += 1;
                Box::new(CountingSession { counters })
            }),
            finalizers: vec!["x".to_string()],
            cycle_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_ends_the_cycle_silently() {
        let store = Arc::new(FakeStore::default());
        let counters = Arc::new(Counters::default());
        let engine = engine(store, Arc::clone(&counters));

        engine
            .process(ObjectKey::namespaced("ns", "a"))
            .await
            .expect("missing object is not an error");
        assert_eq!(*counters.sessions.lock().expect("lock"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finalizers_are_registered_in_one_update_before_any_domain_logic() {
        let key = ObjectKey::namespaced("ns", "a");
        let store = FakeStore::with_object(config_map(&key, "uid-1"));
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        engine.process(key.clone()).await.expect("cycle must pass");

        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].metadata.finalizers, Some(vec!["x".to_string()]));
        assert_eq!(*counters.sessions.lock().expect("lock"), 0);

        engine.process(key).await.expect("cycle must pass");
        assert_eq!(*counters.reconciled.lock().expect("lock"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_cached_copy_is_never_mutated() {
        let key = ObjectKey::namespaced("ns", "a");
        let store = FakeStore::with_object(config_map(&key, "uid-1"));
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        let cached = engine
            .store
            .get(&key)
            .await
            .expect("get must pass")
            .expect("object exists");
        engine.process(key).await.expect("cycle must pass");
        assert_eq!(cached.metadata.finalizers, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_finalizer_registration_is_requeued_with_backoff() {
        let key = ObjectKey::namespaced("ns", "a");
        let store = FakeStore::with_object(config_map(&key, "uid-1"));
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        *store.fail_next_update.lock().expect("lock") = true;
        engine.process(key.clone()).await.expect("conflicts are transient");

        let redelivered = engine.queue.get().await.expect("key must be redelivered");
        assert_eq!(redelivered, key);
        engine.process(key).await.expect("cycle must pass");
        assert_eq!(store.updates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_object_without_our_finalizer_skips_finalize() {
        let key = ObjectKey::namespaced("ns", "a");
        let mut cm = config_map(&key, "uid-1");
        cm.metadata.deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        cm.metadata.finalizers = Some(vec!["somebody-else".to_string()]);
        let store = FakeStore::with_object(cm);
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        engine.process(key).await.expect("cycle must pass");

        assert_eq!(*counters.finalized.lock().expect("lock"), 0);
        assert!(store.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_finalize_releases_only_our_finalizer() {
        let key = ObjectKey::namespaced("ns", "a");
        let mut cm = config_map(&key, "uid-1");
        cm.metadata.deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        cm.metadata.finalizers = Some(vec!["x".to_string(), "somebody-else".to_string()]);
        let store = FakeStore::with_object(cm);
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        engine.process(key).await.expect("cycle must pass");

        assert_eq!(*counters.finalized.lock().expect("lock"), 1);
        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].metadata.finalizers,
            Some(vec!["somebody-else".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_errors_are_redelivered_with_backoff() {
        let key = ObjectKey::namespaced("ns", "a");
        let mut cm = config_map(&key, "uid-1");
        cm.metadata.finalizers = Some(vec!["x".to_string()]);
        let store = FakeStore::with_object(cm);
        let counters = Arc::new(Counters::default());
        let engine = engine(Arc::clone(&store), Arc::clone(&counters));

        *counters.reconcile_error.lock().expect("lock") =
            Some(ReconcileError::retry("dependency down"));

        engine.process(key.clone()).await.expect("retry is not fatal");
        let redelivered = engine.queue.get().await.expect("key must be redelivered");
        assert_eq!(redelivered, key);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_cycles_fail_the_deadline_and_free_the_processing_slot() {
        let key = ObjectKey::namespaced("ns", "a");
        let mut cm = config_map(&key, "uid-1");
        cm.metadata.finalizers = Some(vec!["x".to_string()]);
        let store = FakeStore::with_object(cm);
        let counters = Arc::new(Counters::default());

        let factory = {
            let counters = Arc::clone(&counters);
            move || {
                Box::new(CountingSession {
                    counters: Arc::clone(&counters),
                }) as Box<dyn GenericReconciler<ConfigMap>>
            }
        };
        let base = GenericControllerBase::with_config(
            "test",
            Arc::clone(&store) as Arc<dyn ObjectStore<ConfigMap>>,
            factory,
            vec!["x".to_string()],
            ControllerConfig {
                cycle_timeout: Duration::from_millis(10),
                ..ControllerConfig::default()
            },
        );

        *counters.hang_next_reconcile.lock().expect("lock") = true;
        let err = base
            .shared
            .process(key.clone())
            .await
            .expect_err("a stuck cycle must time out");
        assert_eq!(err.category(), "DeadlineExceeded");

        // the slot was released on the timeout path, the key can be
        // processed again
        base.shared.process(key).await.expect("cycle must pass");
        assert_eq!(*counters.reconciled.lock().expect("lock"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn event_keys_handles_recreation_under_the_same_name() {
        let key = ObjectKey::namespaced("ns", "a");
        let old = Arc::new(config_map(&key, "uid-1"));
        let current = Arc::new(config_map(&key, "uid-2"));

        let keys = event_keys(&ResourceEvent::Updated { old, current });
        // both incarnations resolve to the same key; the queue dedups it
        assert_eq!(keys, vec![key.clone(), key]);
    }
}
