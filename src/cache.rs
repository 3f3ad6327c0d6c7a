//! Local cache of parent Deployments
//!
//! The cache is a read-only, eventually-consistent mirror of the cluster's
//! Deployments, filled by the change stream in [`crate::informer`]. The
//! reconciler only ever reads from it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::{ObjectRef, Store};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// How often `has_synced` is checked by the default [`ParentCache::wait_until_synced`]
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Point lookups into the local mirror of parent resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParentCache: Send + Sync {
    /// Look up a Deployment; `None` if the cache does not hold it
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>>;

    /// True once the initial listing has been applied
    fn has_synced(&self) -> bool;

    /// Resolve once the initial listing has been applied
    ///
    /// Fails if the cache can never sync, e.g. its change stream is gone.
    async fn wait_until_synced(&self) -> Result<(), Error> {
        while !self.has_synced() {
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

/// [`ParentCache`] backed by a kube-rs reflector store
///
/// The store becomes ready when its writer applies the first `InitDone`.
#[derive(Clone)]
pub struct ReflectorCache {
    store: Store<Deployment>,
}

impl ReflectorCache {
    /// Wrap the reader half of a reflector
    pub fn new(store: Store<Deployment>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ParentCache for ReflectorCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.store
            .get(&ObjectRef::<Deployment>::new(name).within(namespace))
    }

    fn has_synced(&self) -> bool {
        matches!(self.store.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    async fn wait_until_synced(&self) -> Result<(), Error> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| Error::cache_sync("change stream stopped before the cache synced"))
    }
}
