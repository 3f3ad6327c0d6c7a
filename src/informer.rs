//! Change stream for parent Deployments and the Event Bridge
//!
//! [`Informer`] drives a kube-rs watcher, mirrors every event into the
//! reflector store behind [`ReflectorCache`], and reports additions and
//! removals to an [`EventHandler`]. [`QueueEventHandler`] is the bridge that
//! turns those notifications into reconciliation keys on the work queue.
//!
//! When the watch has to re-list (startup, expired resource version, lost
//! connection) deletions that happened while disconnected are never seen as
//! delete events. The informer compares the cache before and after the
//! re-list and reports every parent that vanished as removed.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ReflectorCache;
use crate::key::ReconcileKey;
use crate::queue::RateLimitingQueue;

/// Watcher timeout (seconds); must stay below the client read timeout so the
/// API server closes idle watches before the client gives up on them
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Receives add/remove notifications from the change stream
pub trait EventHandler: Send + Sync {
    /// A Deployment was created, or seen during a listing
    fn on_add(&self, obj: &Deployment);

    /// A Deployment was deleted, or disappeared across a re-list
    fn on_delete(&self, obj: &Deployment);
}

/// Event Bridge: enqueues the identity of every added or removed parent
///
/// No filtering and no coalescing beyond what the queue does itself.
#[derive(Clone)]
pub struct QueueEventHandler {
    queue: RateLimitingQueue<ReconcileKey>,
}

impl QueueEventHandler {
    /// Bridge notifications into `queue`
    pub fn new(queue: RateLimitingQueue<ReconcileKey>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, obj: &Deployment, event: &'static str) {
        match ReconcileKey::from_object(obj) {
            Ok(key) => {
                debug!(%key, event, "enqueueing parent");
                self.queue.add(key);
            }
            Err(e) => warn!(error = %e, event, "skipping object without a usable key"),
        }
    }
}

impl EventHandler for QueueEventHandler {
    fn on_add(&self, obj: &Deployment) {
        self.enqueue(obj, "add");
    }

    fn on_delete(&self, obj: &Deployment) {
        self.enqueue(obj, "delete");
    }
}

/// Watches Deployments and keeps the local cache in step with the cluster
pub struct Informer {
    api: Api<Deployment>,
    config: watcher::Config,
    reader: Store<Deployment>,
    writer: reflector::store::Writer<Deployment>,
}

impl Informer {
    /// Watch Deployments in `namespace`, or in all namespaces when `None`
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self::with_api(api)
    }

    /// Watch through an already scoped API handle
    pub fn with_api(api: Api<Deployment>) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            api,
            config: watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
            reader,
            writer,
        }
    }

    /// The cache this informer fills
    pub fn cache(&self) -> ReflectorCache {
        ReflectorCache::new(self.reader.clone())
    }

    /// Run the change stream until `shutdown` is cancelled
    ///
    /// Watch errors are retried by the watcher's default backoff; the
    /// stream only ends on shutdown.
    pub async fn run(self, handler: Arc<dyn EventHandler>, shutdown: CancellationToken) {
        let Self {
            api,
            config,
            reader,
            writer,
        } = self;

        let stream = watcher::watcher(api, config).default_backoff();
        tokio::pin!(stream);
        let mut dispatcher = Dispatcher::new(reader, writer, handler);

        info!("starting deployment change stream");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping deployment change stream");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => dispatcher.apply(event),
                    Some(Err(e)) => warn!(error = %e, "deployment watch error, retrying"),
                    None => {
                        warn!("deployment watch stream ended");
                        return;
                    }
                },
            }
        }
    }
}

/// Applies watcher events to the store and fans them out to the handler
struct Dispatcher {
    reader: Store<Deployment>,
    writer: reflector::store::Writer<Deployment>,
    handler: Arc<dyn EventHandler>,
    /// Set once the first listing has been applied
    synced: bool,
    /// Objects seen so far in the listing in progress
    listing: Option<Vec<Deployment>>,
}

impl Dispatcher {
    fn new(
        reader: Store<Deployment>,
        writer: reflector::store::Writer<Deployment>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            reader,
            writer,
            handler,
            synced: false,
            listing: None,
        }
    }

    /// Notifications go out only after the store reflects the event, so a
    /// worker reacting to an add always finds the object in the cache.
    fn apply(&mut self, event: Event<Deployment>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();

        match &event {
            Event::Init => {
                debug!("deployment listing started");
                self.listing = Some(Vec::new());
            }
            Event::InitApply(obj) => {
                if let Some(listing) = self.listing.as_mut() {
                    listing.push(obj.clone());
                }
            }
            Event::InitDone => {
                // the store still holds the pre-listing state until InitDone is applied
                let listed = self.listing.take().unwrap_or_default();
                let seen: HashSet<_> = listed.iter().map(ObjectRef::from_obj).collect();
                for stale in self.reader.state() {
                    if !seen.contains(&ObjectRef::from_obj(&*stale)) {
                        debug!(name = ?stale.metadata.name, "deployment vanished across re-list");
                        removed.push(Deployment::clone(&stale));
                    }
                }
                added = listed;
            }
            Event::Apply(obj) => {
                if self.reader.get(&ObjectRef::from_obj(obj)).is_none() {
                    added.push(obj.clone());
                }
            }
            Event::Delete(obj) => removed.push(obj.clone()),
        }

        self.writer.apply_watcher_event(&event);

        if matches!(event, Event::InitDone) && !self.synced {
            info!(
                count = self.reader.state().len(),
                "deployment cache synced"
            );
            self.synced = true;
        }

        for obj in &added {
            self.handler.on_add(obj);
        }
        for obj in &removed {
            self.handler.on_delete(obj);
        }
    }
}
