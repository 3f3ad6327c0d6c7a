//! The full controller: change notifications in, concurrent workers, shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use expose_controller::controller::{Context, Controller, RunnerSettings};
use expose_controller::informer::{EventHandler, QueueEventHandler};
use expose_controller::key::ReconcileKey;
use expose_controller::queue::{default_controller_rate_limiter, BackoffConfig, RateLimitingQueue};

use super::fake_cluster::FakeCluster;

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Story: Deployments churn while several workers run; once the events stop
/// the cluster holds exactly one Service and one route per Deployment, and
/// shutdown stops the controller cleanly
#[tokio::test(start_paused = true)]
async fn story_churn_converges_with_concurrent_workers() {
    let cluster = FakeCluster::new();
    let queue: RateLimitingQueue<ReconcileKey> = RateLimitingQueue::new(
        default_controller_rate_limiter(BackoffConfig::default(), 10.0, 100),
    );
    let bridge = QueueEventHandler::new(queue.clone());
    let ctx = Context::new(cluster.clone(), cluster.clone(), queue.clone());

    let shutdown = CancellationToken::new();
    let stream_shutdown = shutdown.clone();
    let change_stream = async move { stream_shutdown.cancelled().await };

    let settings = RunnerSettings {
        workers: 3,
        cache_sync_timeout: Duration::from_secs(5),
        restart_period: Duration::from_secs(1),
    };
    let run = tokio::spawn(Controller::new(Arc::new(ctx), settings).run(change_stream, shutdown.clone()));

    cluster.fail_next("create_service", 3);
    for i in 0..10 {
        let obj = cluster.add_deployment("apps", &format!("svc-{i}"));
        bridge.on_add(&obj);
    }
    for i in (0..10).step_by(3) {
        let obj = cluster
            .delete_deployment("apps", &format!("svc-{i}"))
            .expect("created above");
        bridge.on_delete(&obj);
    }
    let obj = cluster.add_deployment("other", "svc-0");
    bridge.on_add(&obj);

    wait_until(|| cluster.converged() && queue.is_empty() && queue.in_flight() == 0).await;

    assert_eq!(cluster.deployment_names().len(), 7);
    assert_eq!(cluster.service_names(), cluster.deployment_names());
    assert_eq!(cluster.ingress_names(), cluster.deployment_names());

    shutdown.cancel();
    run.await
        .expect("controller task")
        .expect("clean shutdown");
    assert!(queue.is_shutting_down());
}

/// Story: shutdown requested before the cache syncs stops the controller
/// without touching the cluster
#[tokio::test(start_paused = true)]
async fn story_shutdown_before_sync_does_no_work() {
    let cluster = FakeCluster::new();
    let queue: RateLimitingQueue<ReconcileKey> =
        RateLimitingQueue::new(default_controller_rate_limiter(BackoffConfig::default(), 10.0, 100));
    let bridge = QueueEventHandler::new(queue.clone());
    for name in ["a", "b", "c"] {
        bridge.on_add(&cluster.add_deployment("ns1", name));
    }

    let ctx = Context::new(cluster.clone(), cluster.clone(), queue.clone());
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let stream_shutdown = shutdown.clone();
    Controller::new(Arc::new(ctx), RunnerSettings::default())
        .run(async move { stream_shutdown.cancelled().await }, shutdown)
        .await
        .expect("clean shutdown");

    assert!(queue.is_shutting_down());
    assert_eq!(queue.len(), 3);
    assert!(cluster.calls().is_empty());
}
