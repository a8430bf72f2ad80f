//! Configuration for the tollgate controller
//!
//! Process-level settings: which ingresses this instance owns, frontend names
//! of the proxy configuration, HTTPS listener layout and file-system paths.
//! Per-option tuning lives in the main config map instead.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Controller class identifier matched against IngressClass `spec.controller`
pub const CONTROLLER_CLASS: &str = "tollgate.io/ingress-controller";

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Ingress class this instance handles (`ingress.class` annotation)
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Admit ingresses without any class (default: false)
    #[serde(default)]
    pub empty_ingress_class: bool,

    /// Main config map as `<namespace>/<name>`
    #[serde(default = "default_configmap")]
    pub configmap: String,

    /// Fallback default service (`<namespace>/<name>`) when the config map sets none
    #[serde(default)]
    pub default_backend_service: String,

    /// Fallback default certificate secret (`<namespace>/<name>`)
    #[serde(default)]
    pub default_ssl_certificate: String,

    /// Namespace to watch (all namespaces when unset)
    #[serde(default)]
    pub watch_namespace: Option<String>,

    #[serde(default)]
    pub frontends: FrontendNames,

    #[serde(default)]
    pub https: HttpsConfig,

    #[serde(default)]
    pub env: EnvConfig,

    /// Quiet period used to batch store events before a pass (default: 2s)
    #[serde(default = "default_sync_period")]
    pub sync_period_ms: u64,

    /// Prometheus listener (default: 0.0.0.0:9100)
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

/// Names of the frontends/backends the engine manages
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendNames {
    #[serde(default = "default_http")]
    pub http: String,
    #[serde(default = "default_https")]
    pub https: String,
    /// TCP frontend used for SSL passthrough
    #[serde(default = "default_ssl")]
    pub ssl: String,
    /// Backend chaining the passthrough frontend into the HTTPS frontend
    #[serde(default = "default_ssl")]
    pub ssl_backend: String,
    #[serde(default = "default_stats")]
    pub stats: String,
}

/// HTTPS listener layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6: bool,
    #[serde(default = "default_https_port")]
    pub port: i64,
    #[serde(default = "default_addr_ipv4")]
    pub addr_ipv4: String,
    #[serde(default = "default_addr_ipv6")]
    pub addr_ipv6: String,
}

/// File-system layout of the proxy runtime
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvConfig {
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
    #[serde(default = "default_map_dir")]
    pub map_dir: String,
    #[serde(default = "default_runtime_socket")]
    pub runtime_socket: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_ingress_class() -> String {
    "tollgate".to_string()
}

fn default_configmap() -> String {
    "default/tollgate".to_string()
}

fn default_sync_period() -> u64 {
    2000
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_http() -> String {
    "http".to_string()
}

fn default_https() -> String {
    "https".to_string()
}

fn default_ssl() -> String {
    "ssl".to_string()
}

fn default_stats() -> String {
    "stats".to_string()
}

fn default_true() -> bool {
    true
}

fn default_https_port() -> i64 {
    443
}

fn default_addr_ipv4() -> String {
    "0.0.0.0".to_string()
}

fn default_addr_ipv6() -> String {
    "::".to_string()
}

fn default_cert_dir() -> String {
    "/etc/tollgate/certs".to_string()
}

fn default_map_dir() -> String {
    "/etc/tollgate/maps".to_string()
}

fn default_runtime_socket() -> String {
    "/var/run/tollgate-runtime-api.sock".to_string()
}

fn default_pid_file() -> String {
    "/var/run/tollgate.pid".to_string()
}

fn default_state_dir() -> String {
    "/var/state/tollgate/".to_string()
}

impl Default for FrontendNames {
    fn default() -> Self {
        Self {
            http: default_http(),
            https: default_https(),
            ssl: default_ssl(),
            ssl_backend: default_ssl(),
            stats: default_stats(),
        }
    }
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ipv4: default_true(),
            ipv6: default_true(),
            port: default_https_port(),
            addr_ipv4: default_addr_ipv4(),
            addr_ipv6: default_addr_ipv6(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            map_dir: default_map_dir(),
            runtime_socket: default_runtime_socket(),
            pid_file: default_pid_file(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: default_ingress_class(),
            empty_ingress_class: false,
            configmap: default_configmap(),
            default_backend_service: String::new(),
            default_ssl_certificate: String::new(),
            watch_namespace: None,
            frontends: FrontendNames::default(),
            https: HttpsConfig::default(),
            env: EnvConfig::default(),
            sync_period_ms: default_sync_period(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

type ConfigResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn parse_bool_var(name: &str, val: &str) -> ConfigResult<bool> {
    val.parse()
        .map_err(|_| format!("{name}: '{val}' is not a boolean").into())
}

impl ControllerConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `TOLLGATE_*` environment variables
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(val) = env::var("TOLLGATE_INGRESS_CLASS") {
            self.ingress_class = val;
        }

        if let Ok(val) = env::var("TOLLGATE_EMPTY_INGRESS_CLASS") {
            self.empty_ingress_class = parse_bool_var("TOLLGATE_EMPTY_INGRESS_CLASS", &val)?;
        }

        if let Ok(val) = env::var("TOLLGATE_CONFIGMAP") {
            self.configmap = val;
        }

        if let Ok(val) = env::var("TOLLGATE_DEFAULT_BACKEND_SERVICE") {
            self.default_backend_service = val;
        }

        if let Ok(val) = env::var("TOLLGATE_DEFAULT_SSL_CERTIFICATE") {
            self.default_ssl_certificate = val;
        }

        if let Ok(val) = env::var("TOLLGATE_WATCH_NAMESPACE") {
            self.watch_namespace = Some(val).filter(|ns| !ns.is_empty());
        }

        if let Ok(val) = env::var("TOLLGATE_DISABLE_HTTPS") {
            self.https.enabled = !parse_bool_var("TOLLGATE_DISABLE_HTTPS", &val)?;
        }

        if let Ok(val) = env::var("TOLLGATE_DISABLE_IPV6") {
            self.https.ipv6 = !parse_bool_var("TOLLGATE_DISABLE_IPV6", &val)?;
        }

        if let Ok(val) = env::var("TOLLGATE_HTTPS_PORT") {
            self.https.port = val.parse()?;
        }

        if let Ok(val) = env::var("TOLLGATE_CERT_DIR") {
            self.env.cert_dir = val;
        }

        if let Ok(val) = env::var("TOLLGATE_MAP_DIR") {
            self.env.map_dir = val;
        }

        if let Ok(val) = env::var("TOLLGATE_SYNC_PERIOD_MS") {
            self.sync_period_ms = val.parse()?;
        }

        if let Ok(val) = env::var("TOLLGATE_METRICS_ADDR") {
            self.metrics_addr = val;
        }

        Ok(())
    }

    /// Main config map as (namespace, name)
    pub fn configmap_ref(&self) -> Option<(&str, &str)> {
        self.configmap
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
    }
}
