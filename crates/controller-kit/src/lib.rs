//! Building blocks for Kubernetes-style reconciliation control loops.
//!
//! The central pieces are a deduplicating, rate-limited [`WorkQueue`],
//! event-source plumbing that feeds it from [`kube`] watchers, and two
//! engine flavors that drive reconcile/finalize cycles over it:
//! [`ControllerBase`] for heterogeneous trait-object controllers and
//! [`GenericControllerBase`] when the watched resource type is known at
//! compile time.
//!
//! A controller never observes an object's deletion directly. Instead the
//! engines register finalizers on every active object, and run the
//! controller's finalize path once the object enters graceful deletion,
//! releasing the finalizers only after it succeeds.

pub mod controller;
pub mod error;
pub mod event;
pub mod generic;
pub mod key;
pub mod meta;
pub mod queue;
pub mod watch;

pub use crate::{
    controller::{Controller, ControllerBase, ControllerConfig, Reconciler},
    error::{BoxedError, CycleError, ReconcileError, StartError},
    event::{DeletedObject, EventSource, ResourceEvent},
    generic::{GenericControllerBase, GenericReconciler, ObjectStore},
    key::ObjectKey,
    meta::{Lifecycle, WatchedObject},
    queue::WorkQueue,
    watch::{Cache, bind_watcher},
};

// Re-export the Kubernetes API stack so controllers built on this crate
// track the versions it was built against.
pub use k8s_openapi;
pub use kube;
