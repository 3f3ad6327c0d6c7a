//! Controller lifecycle: change stream, cache sync, worker lanes, shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconciler::{Context, ProcessOutcome, Reconciler};
use crate::cache::ParentCache;
use crate::{Error, DEFAULT_CACHE_SYNC_TIMEOUT_SECS, DEFAULT_WORKERS, DEFAULT_WORKER_RESTART_SECS};

/// Knobs for [`Controller::run`]
#[derive(Clone, Debug)]
pub struct RunnerSettings {
    /// Number of concurrent worker lanes
    pub workers: usize,
    /// Upper bound on the wait for the initial cache listing
    pub cache_sync_timeout: Duration,
    /// Minimum delay before a lane whose worker died is restarted
    pub restart_period: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cache_sync_timeout: Duration::from_secs(DEFAULT_CACHE_SYNC_TIMEOUT_SECS),
            restart_period: Duration::from_secs(DEFAULT_WORKER_RESTART_SECS),
        }
    }
}

/// Wait until `cache` reports its initial listing applied
///
/// Returns `Ok(true)` once synced, `Ok(false)` if `shutdown` fired first,
/// and a [`Error::CacheSync`] if `timeout` elapsed or the cache can never
/// sync.
pub async fn wait_for_cache_sync(
    cache: &dyn ParentCache,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<bool, Error> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(false),
        res = tokio::time::timeout(timeout, cache.wait_until_synced()) => match res {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::cache_sync(format!(
                "deployment cache not synced after {}s",
                timeout.as_secs()
            ))),
        },
    }
}

/// Process queue items until the queue shuts down
pub async fn run_worker(reconciler: Arc<Reconciler>) {
    while reconciler.process_item().await != ProcessOutcome::Shutdown {}
}

/// Keep one worker alive until the queue shuts down
///
/// A worker that dies (panics) is restarted after `restart_period`.
async fn run_lane(lane: usize, reconciler: Arc<Reconciler>, restart_period: Duration) {
    loop {
        match tokio::spawn(run_worker(reconciler.clone())).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => error!(lane, "worker panicked"),
            Err(e) => warn!(lane, error = %e, "worker task failed"),
        }

        if reconciler.context().queue.is_shutting_down() {
            debug!(lane, "worker stopped");
            return;
        }

        warn!(
            lane,
            restart_in_ms = restart_period.as_millis() as u64,
            "restarting worker"
        );
        tokio::time::sleep(restart_period).await;
    }
}

/// Orchestrates the change stream and the worker lanes
pub struct Controller {
    reconciler: Arc<Reconciler>,
    settings: RunnerSettings,
}

impl Controller {
    /// Create a controller over `ctx`
    pub fn new(ctx: Arc<Context>, settings: RunnerSettings) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(ctx)),
            settings,
        }
    }

    /// Run until `shutdown` fires
    ///
    /// Starts `change_stream` (which should itself stop on `shutdown`),
    /// waits for the cache to sync, then runs the worker lanes. On shutdown
    /// the queue stops accepting keys, workers drain what is queued, and the
    /// call returns once every lane and the stream have stopped.
    ///
    /// A cache that does not sync within the configured timeout is fatal.
    pub async fn run<F>(self, change_stream: F, shutdown: CancellationToken) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ctx = self.reconciler.context().clone();
        let workers = self.settings.workers.max(1);

        info!(workers, "starting expose controller");
        let stream = tokio::spawn(change_stream);

        info!("waiting for deployment cache to sync");
        match wait_for_cache_sync(
            ctx.cache.as_ref(),
            self.settings.cache_sync_timeout,
            &shutdown,
        )
        .await
        {
            Ok(true) => info!("deployment cache synced, starting workers"),
            Ok(false) => {
                info!("shutdown requested before cache sync");
                ctx.queue.shutdown();
                if let Err(e) = stream.await {
                    warn!(error = %e, "change stream ended abnormally");
                }
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "deployment cache failed to sync");
                ctx.queue.shutdown();
                stream.abort();
                return Err(e);
            }
        }

        let lanes: Vec<JoinHandle<()>> = (0..workers)
            .map(|lane| {
                tokio::spawn(run_lane(
                    lane,
                    self.reconciler.clone(),
                    self.settings.restart_period,
                ))
            })
            .collect();

        shutdown.cancelled().await;
        info!(
            queued = ctx.queue.len(),
            in_flight = ctx.queue.in_flight(),
            "shutting down, draining work queue"
        );
        ctx.queue.shutdown();

        for lane in futures::future::join_all(lanes).await {
            if let Err(e) = lane {
                warn!(error = %e, "worker lane ended abnormally");
            }
        }
        if let Err(e) = stream.await {
            warn!(error = %e, "change stream ended abnormally");
        }

        info!("expose controller stopped");
        Ok(())
    }
}
