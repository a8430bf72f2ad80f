//! Kubernetes integration and the metrics endpoint

pub mod convert;
pub mod metrics;
pub mod watcher;
