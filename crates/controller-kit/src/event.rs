//! Change notifications from watched resources.
//!
//! An [`EventSource`] pairs a stream of [`ResourceEvent`]s with a
//! [`SyncedToken`] which reports whether the backing cache has seen its
//! initial state. Sources built on a kube watcher come from
//! [`bind_watcher`](crate::watch::bind_watcher); anything else (tests,
//! webhooks, periodic resync tickers) can go through [`channel`].

use std::{sync::Arc, time::Duration};

use futures::{
    Stream, StreamExt,
    stream::BoxStream,
};
use tokio::sync::{mpsc, watch};

use crate::{
    error::{CacheSyncFailedSnafu, CacheSyncTimeoutSnafu, StartError},
    key::ObjectKey,
    meta::WatchedObject,
};

/// A normalized change notification.
#[derive(Clone, Debug)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated { old: T, current: T },
    Deleted(DeletedObject<T>),
}

/// Payload of a delete notification.
#[derive(Clone, Debug)]
pub enum DeletedObject<T> {
    /// The final state of the object was observed.
    Object(T),

    /// The delete was only observed indirectly, e.g. after a relist; only
    /// the key of the vanished object is known.
    Tombstone(ObjectKey),
}

impl<K: WatchedObject> ResourceEvent<Arc<K>> {
    fn erase(self) -> ResourceEvent<Arc<dyn WatchedObject>> {
        match self {
            Self::Added(obj) => ResourceEvent::Added(obj),
            Self::Updated { old, current } => ResourceEvent::Updated { old, current },
            Self::Deleted(DeletedObject::Object(obj)) => {
                ResourceEvent::Deleted(DeletedObject::Object(obj))
            }
            Self::Deleted(DeletedObject::Tombstone(key)) => {
                ResourceEvent::Deleted(DeletedObject::Tombstone(key))
            }
        }
    }
}

/// Producer side of the synced flag, the analog of an informer's `HasSynced`.
#[derive(Debug)]
pub struct SyncedFlag {
    tx: watch::Sender<bool>,
}

impl SyncedFlag {
    /// Marks the source as synced. Idempotent.
    pub fn mark_synced(&self) {
        self.tx.send_replace(true);
    }
}

/// Consumer side of the synced flag.
#[derive(Clone, Debug)]
pub struct SyncedToken {
    rx: watch::Receiver<bool>,
}

impl SyncedToken {
    pub fn has_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the source reports synced. Returns `false` if the
    /// producer went away without ever syncing.
    pub async fn synced(&self) -> bool {
        let mut rx = self.rx.clone();
        rx.wait_for(|synced| *synced).await.is_ok()
    }
}

pub fn synced_pair() -> (SyncedFlag, SyncedToken) {
    let (tx, rx) = watch::channel(false);
    (SyncedFlag { tx }, SyncedToken { rx })
}

/// Waits until every source reports synced, bounded by `timeout`.
pub(crate) async fn wait_for_all_synced(
    tokens: &[SyncedToken],
    timeout: Duration,
) -> Result<(), StartError> {
    let all_synced = futures::future::join_all(tokens.iter().map(SyncedToken::synced));
    match tokio::time::timeout(timeout, all_synced).await {
        Ok(results) if results.iter().all(|&synced| synced) => Ok(()),
        Ok(_) => CacheSyncFailedSnafu.fail(),
        Err(_) => CacheSyncTimeoutSnafu { timeout }.fail(),
    }
}

/// A stream of change notifications plus its sync state.
pub struct EventSource<T> {
    pub(crate) events: BoxStream<'static, ResourceEvent<T>>,
    pub(crate) synced: SyncedToken,
}

impl<T> EventSource<T> {
    pub fn new(
        events: impl Stream<Item = ResourceEvent<T>> + Send + 'static,
        synced: SyncedToken,
    ) -> Self {
        Self {
            events: events.boxed(),
            synced,
        }
    }

    pub fn synced_token(&self) -> SyncedToken {
        self.synced.clone()
    }
}

impl<K: WatchedObject> EventSource<Arc<K>> {
    /// Erases the concrete resource type so the source can feed the untyped
    /// engine.
    pub fn erase(self) -> EventSource<Arc<dyn WatchedObject>> {
        EventSource {
            events: self.events.map(ResourceEvent::erase).boxed(),
            synced: self.synced,
        }
    }
}

/// Hand-fed event source, mostly for tests and non-watch producers.
pub struct EventSender<T> {
    tx: mpsc::Sender<ResourceEvent<T>>,
    flag: SyncedFlag,
}

impl<T> EventSender<T> {
    /// Delivers an event. Returns `false` once the consuming controller is
    /// gone.
    pub async fn send(&self, event: ResourceEvent<T>) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn mark_synced(&self) {
        self.flag.mark_synced();
    }
}

/// Builds an in-memory event source backed by a bounded channel.
pub fn channel<T: Send + 'static>(capacity: usize) -> (EventSender<T>, EventSource<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let (flag, token) = synced_pair();
    let events = futures::stream::unfold(rx, |mut rx| async {
        rx.recv().await.map(|event| (event, rx))
    });
    (
        EventSender { tx, flag },
        EventSource::new(events, token),
    )
}
