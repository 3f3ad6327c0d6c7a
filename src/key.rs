//! Reconciliation keys
//!
//! A [`ReconcileKey`] names a parent Deployment by namespace and name. Only
//! the key travels through the work queue; the object itself is looked up
//! again when the key is processed, since by then it may be stale or gone.

use std::fmt;

use kube::{Resource, ResourceExt};

use crate::Error;

/// Namespace + name identifying a parent resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    /// Namespace of the parent (empty for cluster-scoped objects)
    pub namespace: String,
    /// Name of the parent
    pub name: String,
}

impl ReconcileKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key from an object's metadata
    ///
    /// Fails when the object has no name, which the API server never hands
    /// out but a hand-built object can.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self, Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.namespace().unwrap_or_default();
        let key = Self { namespace, name };
        key.validate()?;
        Ok(key)
    }

    /// Check that the key can address an object
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::invalid_key(self.to_string(), "name is empty"));
        }
        if self.name.contains('/') || self.namespace.contains('/') {
            return Err(Error::invalid_key(
                self.to_string(),
                "segments must not contain '/'",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
