//! Stories about how the cluster converges as Deployments come and go
//!
//! # Test Organization
//!
//! - `fake_cluster`: in-memory API server and cache the controller runs against
//! - `scenarios`: single-key stories driven one queue item at a time
//! - `controller_run`: the full controller with concurrent workers

mod controller_run;
mod fake_cluster;
