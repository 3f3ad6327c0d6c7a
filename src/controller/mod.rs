//! Reconciliation of Deployments into a Service and an Ingress
//!
//! [`Reconciler`] handles one key at a time; [`Controller`] owns the
//! lifecycle around it: starting the change stream, waiting for the cache,
//! running worker lanes, and draining on shutdown.

mod reconciler;
mod runner;

pub use reconciler::{Context, ProcessOutcome, Reconciler, SyncResult};
pub use runner::{run_worker, wait_for_cache_sync, Controller, RunnerSettings};
