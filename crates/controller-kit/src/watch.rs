//! Binding between kube watch streams and the engine.
//!
//! [`bind_watcher`] turns a [`kube::runtime::watcher`] stream into a local
//! [`Cache`] (the informer-cache analog, source of `get_object` reads) plus an
//! [`EventSource`] feeding the controller queue. Relists are resolved into
//! deltas: objects that vanished while the watch was away are surfaced as
//! delete events.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use futures::{Stream, StreamExt, future, stream};
use kube::{Resource, runtime::watcher};

use crate::{
    event::{DeletedObject, EventSource, ResourceEvent, SyncedFlag, synced_pair},
    key::ObjectKey,
};

type Store<K> = Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>;

/// Read-only shared view of the watched objects, continuously updated by the
/// bound watch stream.
#[derive(Debug)]
pub struct Cache<K> {
    store: Store<K>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K> Cache<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adapts a watcher stream into a cache and an event source.
///
/// The synced flag flips once the first relist completes (`InitDone`), so
/// `start_workers` holds back until the cache reflects the full initial
/// state. Watch errors are logged and skipped; the watcher itself handles
/// re-establishing the connection.
pub fn bind_watcher<K, S>(watch: S) -> (Cache<K>, EventSource<Arc<K>>)
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let (flag, token) = synced_pair();
    let cache = Cache {
        store: Arc::new(RwLock::new(HashMap::new())),
    };
    let state = BindState {
        store: Arc::clone(&cache.store),
        flag,
        relist: None,
    };

    let events = watch
        .scan(state, |state, item| {
            future::ready(Some(state.apply(item)))
        })
        .flat_map(stream::iter);

    (cache, EventSource::new(events, token))
}

struct BindState<K> {
    store: Store<K>,
    flag: SyncedFlag,
    relist: Option<HashSet<ObjectKey>>,
}

impl<K> BindState<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn apply(
        &mut self,
        item: Result<watcher::Event<K>, watcher::Error>,
    ) -> Vec<ResourceEvent<Arc<K>>> {
        match item {
            Ok(watcher::Event::Init) => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            Ok(watcher::Event::InitApply(obj) | watcher::Event::Apply(obj)) => {
                let Some(key) = ObjectKey::from_meta(obj.meta()) else {
                    return Vec::new();
                };
                if let Some(seen) = &mut self.relist {
                    seen.insert(key.clone());
                }
                let current = Arc::new(obj);
                let old = self
                    .write()
                    .insert(key, Arc::clone(&current));
                match old {
                    Some(old) => vec![ResourceEvent::Updated { old, current }],
                    None => vec![ResourceEvent::Added(current)],
                }
            }
            Ok(watcher::Event::InitDone) => {
                let mut events = Vec::new();
                if let Some(seen) = self.relist.take() {
                    let mut store = self.write();
                    let vanished: Vec<ObjectKey> = store
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    for key in vanished {
                        if let Some(old) = store.remove(&key) {
                            events.push(ResourceEvent::Deleted(DeletedObject::Object(old)));
                        }
                    }
                }
                self.flag.mark_synced();
                events
            }
            Ok(watcher::Event::Delete(obj)) => {
                let Some(key) = ObjectKey::from_meta(obj.meta()) else {
                    return Vec::new();
                };
                self.write().remove(&key);
                vec![ResourceEvent::Deleted(DeletedObject::Object(Arc::new(obj)))]
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Watch stream error, waiting for the watcher to recover"
                );
                Vec::new()
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    use super::*;

    fn config_map(name: &str, resource_version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(resource_version.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    async fn run_binding(
        events: Vec<Result<watcher::Event<ConfigMap>, watcher::Error>>,
    ) -> (Cache<ConfigMap>, Vec<ResourceEvent<Arc<ConfigMap>>>, bool) {
        let (cache, source) = bind_watcher(stream::iter(events));
        let token = source.synced_token();
        let seen: Vec<_> = source.events.collect().await;
        (cache, seen, token.has_synced())
    }

    #[tokio::test]
    async fn initial_list_populates_the_cache_and_sets_synced() {
        let (cache, seen, synced) = run_binding(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("a", "1"))),
            Ok(watcher::Event::InitApply(config_map("b", "1"))),
            Ok(watcher::Event::InitDone),
        ])
        .await;

        assert!(synced);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ObjectKey::namespaced("ns", "a")).is_some());
        assert!(matches!(seen[0], ResourceEvent::Added(_)));
        assert!(matches!(seen[1], ResourceEvent::Added(_)));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn apply_of_a_known_object_is_an_update_with_the_old_state() {
        let (cache, seen, _) = run_binding(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("a", "1"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(config_map("a", "2"))),
        ])
        .await;

        let ResourceEvent::Updated { old, current } = &seen[1] else {
            unreachable!("expected an update event, got {:?}", seen[1]);
        };
        assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(current.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(
            cache
                .get(&ObjectKey::namespaced("ns", "a"))
                .and_then(|cm| cm.metadata.resource_version.clone())
                .as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn delete_removes_the_object_from_the_cache() {
        let (cache, seen, _) = run_binding(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("a", "1"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Delete(config_map("a", "1"))),
        ])
        .await;

        assert!(cache.is_empty());
        assert!(matches!(
            seen.last(),
            Some(ResourceEvent::Deleted(DeletedObject::Object(_)))
        ));
    }

    #[tokio::test]
    async fn relist_surfaces_vanished_objects_as_deletes() {
        let (cache, seen, _) = run_binding(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("a", "1"))),
            Ok(watcher::Event::InitApply(config_map("b", "1"))),
            Ok(watcher::Event::InitDone),
            // the watch dropped; "b" was deleted in the meantime
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("a", "2"))),
            Ok(watcher::Event::InitDone),
        ])
        .await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&ObjectKey::namespaced("ns", "b")).is_none());
        let deletes = seen
            .iter()
            .filter(|event| matches!(event, ResourceEvent::Deleted(_)))
            .count();
        assert_eq!(deletes, 1);
    }
}
