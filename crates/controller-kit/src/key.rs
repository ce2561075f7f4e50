//! Queue identity for watched objects.

use std::{fmt::Display, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("unexpected key format {key:?}, expected \"name\" or \"namespace/name\""))]
pub struct InvalidKeyError {
    key: String,
}

/// String identity of a watched object, used for queue dedup and routing.
///
/// Renders as `namespace/name` for namespaced objects and plain `name` for
/// cluster-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Derives the key from object metadata. Returns [`None`] for objects
    /// which don't carry a name (yet), e.g. unsubmitted objects relying on
    /// `generateName`.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Self::cluster_scoped(name),
            (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
                Self::namespaced(namespace, name)
            }
            _ => {
                return InvalidKeySnafu { key: s }.fail();
            }
        };
        Ok(key)
    }
}
