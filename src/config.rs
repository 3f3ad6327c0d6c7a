//! Startup configuration and cluster connection
//!
//! Every flag can also be set through an `EXPOSE_*` environment variable.
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `EXPOSE_KUBECONFIG` environment variable
//! 3. `~/.kube/config` if it exists
//! 4. Fall back to kube inference (`KUBECONFIG` env / in-cluster service account)

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::controller::RunnerSettings;
use crate::queue::{default_controller_rate_limiter, BackoffConfig, MaxOf};
use crate::resources::RouteOptions;
use crate::telemetry::LogFormat;
use crate::Error;

/// Connect timeout for the API client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for the API client; kept above the watch timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const KUBE_DIR_NAME: &str = ".kube";
const KUBECONFIG_FILE_NAME: &str = "config";

/// Expose controller: gives every Deployment a Service and an Ingress
#[derive(Parser, Debug, Clone)]
#[command(name = "expose-controller", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Path to a kubeconfig file
    #[arg(long, env = "EXPOSE_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch Deployments in this namespace (default: all namespaces)
    #[arg(long, env = "EXPOSE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of concurrent workers
    #[arg(long, env = "EXPOSE_WORKERS", default_value_t = crate::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Seconds to wait for the initial Deployment listing before giving up
    #[arg(
        long,
        env = "EXPOSE_CACHE_SYNC_TIMEOUT_SECS",
        default_value_t = crate::DEFAULT_CACHE_SYNC_TIMEOUT_SECS
    )]
    pub cache_sync_timeout_secs: u64,

    /// Seconds to wait before restarting a worker that died
    #[arg(
        long,
        env = "EXPOSE_WORKER_RESTART_SECS",
        default_value_t = crate::DEFAULT_WORKER_RESTART_SECS
    )]
    pub worker_restart_secs: u64,

    /// `ingressClassName` for created Ingresses (default: cluster default class)
    #[arg(long, env = "EXPOSE_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    /// Value of the rewrite-target annotation on created Ingresses
    #[arg(long, env = "EXPOSE_REWRITE_TARGET", default_value = "/")]
    pub rewrite_target: String,

    /// First retry delay for a failing key, in milliseconds
    #[arg(long, env = "EXPOSE_BASE_DELAY_MS", default_value_t = 5)]
    pub base_delay_ms: u64,

    /// Cap on the retry delay for a failing key, in seconds
    #[arg(long, env = "EXPOSE_MAX_DELAY_SECS", default_value_t = 1000)]
    pub max_delay_secs: u64,

    /// Sustained rate of retries across all keys, per second
    #[arg(long, env = "EXPOSE_QPS", default_value_t = 10.0)]
    pub qps: f64,

    /// Retries allowed in a burst above the sustained rate
    #[arg(long, env = "EXPOSE_BURST", default_value_t = 100)]
    pub burst: u32,

    /// Log output format
    #[arg(long, env = "EXPOSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ControllerConfig {
    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("--workers must be at least 1"));
        }
        if self.cache_sync_timeout_secs == 0 {
            return Err(Error::config("--cache-sync-timeout-secs must be positive"));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::config(format!("--qps must be positive, got {}", self.qps)));
        }
        if self.burst == 0 {
            return Err(Error::config("--burst must be at least 1"));
        }
        if Duration::from_millis(self.base_delay_ms) > Duration::from_secs(self.max_delay_secs) {
            return Err(Error::config(
                "--base-delay-ms must not exceed --max-delay-secs",
            ));
        }
        if self.namespace.as_deref() == Some("") {
            return Err(Error::config("--namespace must not be empty"));
        }
        Ok(())
    }

    /// Settings for the controller's worker lanes
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            workers: self.workers,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            restart_period: Duration::from_secs(self.worker_restart_secs),
        }
    }

    /// Settings applied to every created Ingress
    pub fn route_options(&self) -> RouteOptions {
        RouteOptions {
            ingress_class: self.ingress_class.clone(),
            rewrite_target: self.rewrite_target.clone(),
        }
    }

    /// Per-key backoff
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            ..Default::default()
        }
    }

    /// The work queue's rate limiter: per-key backoff combined with an
    /// overall token bucket
    pub fn rate_limiter<T>(&self) -> MaxOf<T>
    where
        T: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    {
        default_controller_rate_limiter(self.backoff(), self.qps, self.burst)
    }
}

/// Path to `~/.kube/config`, if a home directory can be determined
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(KUBE_DIR_NAME).join(KUBECONFIG_FILE_NAME))
}

/// Resolve a kubeconfig path using the priority chain.
///
/// `explicit` already carries the flag or its environment variable. Returns
/// `None` to let kube infer its configuration.
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    default_kubeconfig_path().filter(|path| path.exists())
}

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| Error::config(format!("failed to create client: {}", e)))
}
