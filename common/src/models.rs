//! Proxy configuration objects
//!
//! Field-level models of the sections and objects the proxy's configuration
//! API exposes. Durations are milliseconds. Equality is structural so callers
//! can diff a desired object against the live one.

use alloc::string::String;
use alloc::vec::Vec;

/// Proxy mode of a frontend or backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    #[default]
    Http,
    Tcp,
}

impl Mode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Http => "http",
            Mode::Tcp => "tcp",
        }
    }
}

/// Runtime API socket declared in the global section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeApi {
    pub address: String,
    pub level: String,
    pub expose_fd_listeners: bool,
}

/// Process-wide `global` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Global {
    pub daemon: bool,
    pub maxconn: Option<i64>,
    pub nbthread: Option<i64>,
    /// Hard stop deadline for old processes after a reload (ms)
    pub hard_stop_after: Option<i64>,
    pub pidfile: String,
    pub runtime_apis: Vec<RuntimeApi>,
    pub server_state_base: String,
    pub tune_ssl_default_dh_param: Option<i64>,
    pub ssl_default_bind_options: String,
}

/// One syslog destination of the global section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogTarget {
    pub index: Option<i64>,
    pub address: String,
    pub facility: String,
    pub level: String,
    pub format: String,
    pub length: Option<i64>,
}

/// `defaults` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Defaults {
    pub mode: Option<Mode>,
    pub log_global: bool,
    pub log_format: String,
    /// `http-keep-alive`, `http-server-close` or empty
    pub http_connection_mode: String,
    pub dontlognull: bool,
    pub logasap: bool,
    pub redispatch: bool,
    pub client_timeout: Option<i64>,
    pub client_fin_timeout: Option<i64>,
    pub connect_timeout: Option<i64>,
    pub http_request_timeout: Option<i64>,
    pub http_keep_alive_timeout: Option<i64>,
    pub queue_timeout: Option<i64>,
    pub server_timeout: Option<i64>,
    pub server_fin_timeout: Option<i64>,
    pub tunnel_timeout: Option<i64>,
}

/// Listening endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frontend {
    pub name: String,
    pub mode: Mode,
    pub default_backend: String,
    pub log_format: String,
}

/// Address/port a frontend listens on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bind {
    pub name: String,
    pub address: String,
    pub port: Option<i64>,
    pub accept_proxy: bool,
    pub v4v6: bool,
    pub ssl: bool,
    pub ssl_certificate: String,
    pub alpn: String,
    pub ssl_cafile: String,
    /// Client certificate verification: `required`, `optional` or empty
    pub verify: String,
}

/// `stick-table` declaration of a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StickTable {
    /// Key type, e.g. `ip`
    pub key: String,
    pub size: i64,
    /// Entry expiry (ms)
    pub expire: i64,
    /// Stored data, e.g. `http_req_rate(10000)`
    pub store: String,
}

/// Pool of upstream servers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backend {
    pub name: String,
    pub mode: Mode,
    pub balance: String,
    pub forwardfor: bool,
    pub stick_table: Option<StickTable>,
}

/// Upstream server of a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: Option<i64>,
    pub check: bool,
    pub ssl: bool,
    pub ssl_cafile: String,
    pub verify: String,
    pub send_proxy_v2: bool,
}

/// `use_backend` directive of a frontend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackendSwitchingRule {
    pub index: Option<i64>,
    /// Backend name or a log-format expression resolving to one
    pub name: String,
    /// `if`, `unless` or empty
    pub cond: String,
    pub cond_test: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_as_str() {
        assert_eq!(Mode::Http.as_str(), "http");
        assert_eq!(Mode::Tcp.as_str(), "tcp");
        assert_eq!(Mode::default(), Mode::Http);
    }

    #[test]
    fn test_structural_equality_detects_field_change() {
        let live = Global {
            maxconn: Some(1000),
            ..Default::default()
        };
        let mut desired = live.clone();
        assert_eq!(live, desired);

        desired.nbthread = Some(4);
        assert_ne!(live, desired, "nbthread change must be visible to a diff");
    }
}
