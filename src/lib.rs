//! Expose controller - gives every Deployment a Service and an Ingress
//!
//! For each Deployment in the cluster the controller keeps a Service of the
//! same name and namespace (selecting the Deployment's pods on port 80) and an
//! Ingress routing `/<name>` to that Service. When the Deployment goes away
//! both are deleted.
//!
//! # Architecture
//!
//! The controller is level-triggered:
//! - An informer watches Deployments, mirrors them into a local cache, and
//!   reports additions and removals
//! - The event bridge turns each notification into a `namespace/name` key on
//!   a deduplicating, rate-limited work queue
//! - Worker lanes pop keys and reconcile them against current state, never
//!   against the event that queued them
//!
//! # Modules
//!
//! - [`queue`] - Deduplicating work queue with per-key backoff
//! - [`key`] - Reconciliation keys
//! - [`cache`] - Read-only cache of parent Deployments
//! - [`informer`] - Deployment change stream and the event bridge
//! - [`client`] - Cluster API access
//! - [`resources`] - Service and Ingress builders
//! - [`controller`] - Reconciler, worker lanes and lifecycle
//! - [`config`] - Command line configuration and client setup
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod informer;
pub mod key;
pub mod queue;
pub mod resources;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager recorded on objects the controller creates
pub const FIELD_MANAGER: &str = "expose-controller";

/// Label marking objects created by this controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on created objects
pub const MANAGED_BY_VALUE: &str = "expose-controller";

/// Port the Service listens on and the Ingress targets
pub const HTTP_PORT: i32 = 80;

/// Name of the Service's single port
pub const HTTP_PORT_NAME: &str = "http";

/// Default number of worker lanes
pub const DEFAULT_WORKERS: usize = 1;

/// Default bound on the wait for the initial Deployment listing (seconds)
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 120;

/// Default delay before a dead worker is restarted (seconds)
pub const DEFAULT_WORKER_RESTART_SECS: u64 = 1;
