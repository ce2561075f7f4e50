//! Error types shared by both engine variants.

use std::time::Duration;

use snafu::Snafu;
use strum::EnumDiscriminants;

use crate::key::ObjectKey;

/// Boxed error handed across the consumer boundary.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a `reconcile` or `finalize` invocation.
///
/// The [`Retry`](ReconcileError::Retry) variant is the explicit "requeue with
/// backoff" signal: temporary dependency unavailability, optimistic
/// concurrency conflicts and the like. Everything else is terminal for this
/// cycle; the engine logs it and relies on the next external trigger.
#[derive(Debug, Snafu)]
pub enum ReconcileError {
    #[snafu(display("transient failure, requeue with backoff: {source}"))]
    Retry { source: BoxedError },

    #[snafu(display("{source}"))]
    Terminal { source: BoxedError },
}

impl ReconcileError {
    pub fn retry(source: impl Into<BoxedError>) -> Self {
        Self::Retry {
            source: source.into(),
        }
    }

    pub fn terminal(source: impl Into<BoxedError>) -> Self {
        Self::Terminal {
            source: source.into(),
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// A failed processing cycle, as reported by a worker.
#[derive(Debug, Snafu, EnumDiscriminants)]
#[snafu(visibility(pub(crate)))]
#[strum_discriminants(derive(strum::IntoStaticStr))]
pub enum CycleError {
    #[snafu(display("failed to fetch object for {key}"))]
    GetObject { source: BoxedError, key: ObjectKey },

    #[snafu(display("failed to persist finalizers on {key}"))]
    UpdateFinalizers { source: BoxedError, key: ObjectKey },

    #[snafu(display("reconciliation of {key} failed"))]
    Reconcile {
        source: ReconcileError,
        key: ObjectKey,
    },

    #[snafu(display("finalization of {key} failed"))]
    Finalize {
        source: ReconcileError,
        key: ObjectKey,
    },

    #[snafu(display("cycle for {key} exceeded the deadline of {timeout:?}"))]
    DeadlineExceeded { key: ObjectKey, timeout: Duration },
}

impl CycleError {
    /// `PascalCase`d category of the failure, for structured logs.
    pub fn category(&self) -> &'static str {
        CycleErrorDiscriminants::from(self).into()
    }
}

/// Startup failures of [`start_workers`](crate::controller::ControllerBase::start_workers).
///
/// A cache that never syncs aborts startup entirely; no workers are launched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StartError {
    #[snafu(display("event source caches did not sync within {timeout:?}"))]
    CacheSyncTimeout { timeout: Duration },

    #[snafu(display("an event source went away before its cache synced"))]
    CacheSyncFailed,

    #[snafu(display("workers are already running"))]
    AlreadyStarted,
}
