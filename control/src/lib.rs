//! Tollgate Control Plane Library
//!
//! Ingress reconciliation engine: turns the observed cluster state into proxy
//! configuration through a configuration API.

pub mod annotations;
pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
pub mod proxy;
pub mod store;
