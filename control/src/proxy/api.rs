//! Proxy configuration API
//!
//! Transactional view of the proxy configuration the engine reconciles
//! against. Every mutation is buffered by the implementation and applied at
//! the next reload/restart, which the engine signals through its pass result.

use async_trait::async_trait;
use common::{Backend, BackendSwitchingRule, Bind, Defaults, Frontend, Global, LogTarget, Server};
use thiserror::Error;

/// Configuration API errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn not_found(kind: &'static str, name: &str) -> Self {
        ApiError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// Read/write access to the proxy configuration
#[async_trait]
pub trait ConfigApi: Send + Sync {
    // global section
    async fn global_get(&self) -> Result<Global, ApiError>;
    async fn global_push(&self, global: &Global) -> Result<(), ApiError>;
    async fn log_targets_get(&self) -> Result<Vec<LogTarget>, ApiError>;
    async fn log_targets_delete(&self) -> Result<(), ApiError>;
    async fn log_targets_create(&self, targets: &[LogTarget]) -> Result<(), ApiError>;
    async fn global_snippet_get(&self) -> Result<Vec<String>, ApiError>;
    async fn global_snippet_set(&self, lines: &[String]) -> Result<(), ApiError>;

    // defaults section
    async fn defaults_get(&self) -> Result<Defaults, ApiError>;
    async fn defaults_push(&self, defaults: &Defaults) -> Result<(), ApiError>;

    // frontends
    async fn frontend_get(&self, name: &str) -> Result<Frontend, ApiError>;
    async fn frontend_create(&self, frontend: &Frontend) -> Result<(), ApiError>;
    async fn frontend_edit(&self, frontend: &Frontend) -> Result<(), ApiError>;
    /// Deletes the frontend together with its binds, rules and switching rules
    async fn frontend_delete(&self, name: &str) -> Result<(), ApiError>;
    async fn frontend_binds_get(&self, frontend: &str) -> Result<Vec<Bind>, ApiError>;
    async fn frontend_bind_create(&self, frontend: &str, bind: &Bind) -> Result<(), ApiError>;
    async fn frontend_bind_edit(&self, frontend: &str, bind: &Bind) -> Result<(), ApiError>;
    /// Turn TLS termination on for every bind of the frontend
    async fn frontend_enable_ssl_offload(
        &self,
        frontend: &str,
        cert_dir: &str,
        alpn: &str,
    ) -> Result<(), ApiError>;
    async fn frontend_disable_ssl_offload(&self, frontend: &str) -> Result<(), ApiError>;
    /// Replace the request rules of a frontend with the given directives
    async fn frontend_rules_replace(&self, frontend: &str, rules: &[String]) -> Result<(), ApiError>;
    async fn frontend_snippet_get(&self, frontend: &str) -> Result<Vec<String>, ApiError>;
    async fn frontend_snippet_set(&self, frontend: &str, lines: &[String]) -> Result<(), ApiError>;
    async fn backend_switching_rules_get(
        &self,
        frontend: &str,
    ) -> Result<Vec<BackendSwitchingRule>, ApiError>;
    /// Insert a switching rule at `rule.index` (appended when absent)
    async fn backend_switching_rule_create(
        &self,
        frontend: &str,
        rule: &BackendSwitchingRule,
    ) -> Result<(), ApiError>;
    async fn backend_switching_rule_delete(&self, frontend: &str, index: i64) -> Result<(), ApiError>;

    // backends
    async fn backends_get(&self) -> Result<Vec<Backend>, ApiError>;
    async fn backend_get(&self, name: &str) -> Result<Backend, ApiError>;
    async fn backend_create(&self, backend: &Backend) -> Result<(), ApiError>;
    async fn backend_edit(&self, backend: &Backend) -> Result<(), ApiError>;
    async fn backend_delete(&self, name: &str) -> Result<(), ApiError>;
    async fn backend_servers_get(&self, backend: &str) -> Result<Vec<Server>, ApiError>;
    async fn backend_server_create(&self, backend: &str, server: &Server) -> Result<(), ApiError>;
    async fn backend_server_edit(&self, backend: &str, server: &Server) -> Result<(), ApiError>;
    async fn backend_server_delete(&self, backend: &str, name: &str) -> Result<(), ApiError>;

    // map files
    async fn map_replace(&self, map: &str, entries: &[(String, String)]) -> Result<(), ApiError>;
}
