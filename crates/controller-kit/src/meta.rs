//! Metadata capabilities of watched objects.
//!
//! The engine never depends on a concrete resource type. Everything it needs
//! (namespace, name, generation, finalizers, deletion timestamp, owner
//! references) is reachable through [`ObjectMeta`], so the capability trait
//! only has to surface the metadata and a deep-copy operation.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::key::ObjectKey;

/// Object-safe view of any watched resource.
///
/// Implemented for free for every [`kube::Resource`] with a static
/// `DynamicType`, which covers both `k8s-openapi` types and derived custom
/// resources.
pub trait WatchedObject: Send + Sync + 'static {
    fn object_meta(&self) -> &ObjectMeta;

    fn object_meta_mut(&mut self) -> &mut ObjectMeta;

    /// Deep copy, used before mutating anything that may alias a shared
    /// cache entry.
    fn clone_object(&self) -> Box<dyn WatchedObject>;

    /// The queue key of this object, [`None`] if it has no name.
    fn key(&self) -> Option<ObjectKey> {
        ObjectKey::from_meta(self.object_meta())
    }
}

impl<K> WatchedObject for K
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn object_meta(&self) -> &ObjectMeta {
        self.meta()
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        self.meta_mut()
    }

    fn clone_object(&self) -> Box<dyn WatchedObject> {
        Box::new(self.clone())
    }
}

/// Whether an object is live or marked for deletion.
///
/// Resolved exactly once per cycle, at dequeue time, and carried as a value
/// instead of re-reading the (mutable) deletion timestamp mid-cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    PendingDeletion,
}

impl Lifecycle {
    pub fn of(meta: &ObjectMeta) -> Self {
        if meta.deletion_timestamp.is_some() {
            Self::PendingDeletion
        } else {
            Self::Active
        }
    }
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Appends `finalizer` if it is not present yet. Returns whether the list
/// changed.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes every occurrence of `finalizer`. Returns whether the list changed.
///
/// An emptied list is kept as an empty list so the update visibly clears the
/// field on the server.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    match &mut meta.finalizers {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        }
        None => false,
    }
}
