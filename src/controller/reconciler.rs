//! Reconciliation of one parent key
//!
//! Processing is level-triggered: the event that put a key on the queue is
//! never trusted. Each pass re-reads ground truth (an authoritative API read
//! plus the local cache) and drives the dependents toward it.
//!
//! Two lookups are involved and they can disagree:
//!
//! - The authoritative read decides deletion. If the API server says the
//!   parent is gone, both dependents are deleted and the pass ends, even if
//!   the cache still holds a stale copy.
//! - The cache read decides creation. If the API server has the parent but
//!   the cache does not yet, the pass is a no-op; the cache's own add
//!   notification re-queues the key once it catches up.
//! - If the authoritative read fails, creation still runs from the cache and
//!   the key is then re-queued so deletion is re-evaluated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::cache::ParentCache;
use crate::client::ClusterClient;
use crate::key::ReconcileKey;
use crate::queue::RateLimitingQueue;
use crate::resources::{build_ingress, build_service, RouteOptions};
use crate::Error;

/// Everything the reconciler needs, passed in explicitly
pub struct Context {
    /// Cluster API access
    pub client: Arc<dyn ClusterClient>,
    /// Local mirror of parent Deployments
    pub cache: Arc<dyn ParentCache>,
    /// Shared work queue
    pub queue: RateLimitingQueue<ReconcileKey>,
    /// Settings for created routes
    pub route: RouteOptions,
}

impl Context {
    /// Bundle the collaborators with default route settings
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: Arc<dyn ParentCache>,
        queue: RateLimitingQueue<ReconcileKey>,
    ) -> Self {
        Self {
            client,
            cache,
            queue,
            route: RouteOptions::default(),
        }
    }

    /// Override the settings applied to created routes
    pub fn with_route_options(mut self, route: RouteOptions) -> Self {
        self.route = route;
        self
    }
}

/// Result of handling one queue item
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Dependents match the parent
    Synced,
    /// A recoverable failure; the key comes back after `delay`
    Requeued {
        /// Backoff chosen by the queue's rate limiter
        delay: Duration,
    },
    /// A failure retrying cannot fix; the key was dropped
    Dropped,
    /// The queue is shut down and drained; the worker should stop
    Shutdown,
}

/// What `sync_deployment` found and did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncResult {
    /// Service and route exist for the cached parent
    Exposed,
    /// The cache does not hold the parent; nothing was done
    ParentGone,
}

/// Pops keys and drives dependents toward the parent's state
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    /// Create a reconciler over the given context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// The context this reconciler works against
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Blocks until a key is available. Success forgets the key's failure
    /// history; a recoverable failure re-adds it with backoff; anything else
    /// drops it. The key's queue slot is always released, also when the
    /// reconcile panics or is cancelled; such a key is re-added with backoff.
    pub async fn process_item(&self) -> ProcessOutcome {
        let queue = &self.ctx.queue;
        let Some(key) = queue.get().await else {
            return ProcessOutcome::Shutdown;
        };
        let mut slot = InFlight::new(queue, key.clone());

        let outcome = match self.reconcile(&key).await {
            Ok(()) => {
                queue.forget(&key);
                ProcessOutcome::Synced
            }
            Err(e) if e.is_retryable() => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "reconcile failed, requeueing"
                );
                ProcessOutcome::Requeued { delay }
            }
            Err(e) => {
                queue.forget(&key);
                error!(%key, error = %e, "reconcile failed permanently, dropping key");
                ProcessOutcome::Dropped
            }
        };

        slot.settle();
        outcome
    }

    /// Bring the dependents of `key` in line with the parent
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<(), Error> {
        key.validate()?;
        let ReconcileKey { namespace, name } = key;

        let check_error = match self.ctx.client.get_deployment(namespace, name).await {
            Ok(None) => {
                info!("parent no longer exists, deleting dependents");
                return self.delete_dependents(namespace, name).await;
            }
            Ok(Some(_)) => None,
            Err(e) => {
                warn!(error = %e, "existence check failed, syncing from cache");
                Some(e)
            }
        };

        match self.sync_deployment(namespace, name).await? {
            SyncResult::Exposed => {}
            SyncResult::ParentGone if check_error.is_none() => {
                debug!("parent not in cache yet, waiting for its add notification");
            }
            SyncResult::ParentGone => {}
        }

        match check_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ensure a Service and a route exist for the cached parent
    ///
    /// Creation is idempotent: a dependent that already exists counts as
    /// created. The route is only attempted once the Service is in place.
    #[instrument(skip(self))]
    pub async fn sync_deployment(&self, namespace: &str, name: &str) -> Result<SyncResult, Error> {
        let Some(deployment) = self.ctx.cache.get(namespace, name) else {
            debug!("deployment in work queue no longer exists in cache");
            return Ok(SyncResult::ParentGone);
        };

        let desired = build_service(&deployment)?;
        let service = match self.ctx.client.create_service(&desired).await {
            Ok(created) => {
                info!("service created");
                created
            }
            Err(e) if e.is_already_exists() => {
                debug!("service already exists");
                desired
            }
            Err(e) => return Err(e),
        };

        let ingress = build_ingress(&service, &self.ctx.route)?;
        match self.ctx.client.create_ingress(&ingress).await {
            Ok(_) => info!("ingress created"),
            Err(e) if e.is_already_exists() => debug!("ingress already exists"),
            Err(e) => return Err(e),
        }

        Ok(SyncResult::Exposed)
    }

    /// Delete both dependents; ones that are already gone count as deleted
    ///
    /// The two deletions are independent. Both are attempted and the first
    /// failure, if any, is returned.
    async fn delete_dependents(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let service = match self.ctx.client.delete_service(namespace, name).await {
            Ok(()) => {
                info!("service deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("service already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        };

        let ingress = match self.ctx.client.delete_ingress(namespace, name).await {
            Ok(()) => {
                info!("ingress deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("ingress already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        };

        service.and(ingress)
    }
}

/// A key handed out by the queue, released with `done` on drop
///
/// A key dropped before [`InFlight::settle`] never finished its pass, so it
/// is re-added through the rate limiter before the slot is released.
struct InFlight<'a> {
    queue: &'a RateLimitingQueue<ReconcileKey>,
    key: ReconcileKey,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(queue: &'a RateLimitingQueue<ReconcileKey>, key: ReconcileKey) -> Self {
        Self {
            queue,
            key,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let delay = self.queue.add_rate_limited(self.key.clone());
            error!(
                key = %self.key,
                delay_ms = delay.as_millis() as u64,
                "reconcile aborted, requeueing"
            );
        }
        self.queue.done(&self.key);
    }
}
