//! Proxy configuration surface
//!
//! The configuration API the engine drives, and the generated artifacts it
//! pushes through it: frontend rules, map files and certificate files.

pub mod api;
pub mod certs;
pub mod maps;
pub mod memory;
pub mod rules;
