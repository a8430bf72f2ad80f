//! Reconciliation engine
//!
//! One [`Controller::run_pass`] call brings the proxy configuration in line
//! with a snapshot of the cluster:
//!
//! 1. global and defaults sections, default certificate and default service
//! 2. every admitted ingress: TLS secrets, frontend rules, paths
//! 3. HTTPS offload, passthrough and client authentication
//! 4. frontend rules and map files, then pruning of unused backends
//!
//! Sub-step failures are logged and counted; they never abort the pass.

pub mod global;
pub mod https;
pub mod ingress;
pub mod route;
pub mod service;

use crate::apis::metrics::{record_pass, record_step_error};
use crate::config::ControllerConfig;
use crate::controller::https::Https;
use crate::controller::ingress::{
    handle_default_backend, handle_ingress_annotations, handle_ingress_path, handle_ingress_tls,
    ingress_class_is_supported, AnnotationSource,
};
use crate::controller::route::{remove_custom_route, CustomRoutes};
use crate::proxy::api::ConfigApi;
use crate::proxy::certs::Certificates;
use crate::proxy::maps::MapFiles;
use crate::proxy::rules::RuleRegistry;
use crate::store::{K8s, Status};
use common::{Backend, Mode, StickTable};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// State carried from one pass to the next
#[derive(Debug)]
pub struct ControllerCfg {
    pub front_http: String,
    pub front_https: String,
    /// TCP frontend of SSL passthrough
    pub front_ssl: String,
    pub front_stats: String,
    /// Backend chaining passthrough traffic into the HTTPS frontend
    pub back_ssl: String,
    pub rules: RuleRegistry,
    /// Backends referenced during the current pass
    pub active_backends: BTreeSet<String>,
    /// Backends this controller created or adopted
    pub managed_backends: BTreeSet<String>,
    /// Stick tables requested by rate-limit rules, keyed by table name
    pub rate_limit_tables: BTreeMap<String, StickTable>,
    pub map_files: MapFiles,
    pub custom_routes: CustomRoutes,
    /// SSL offload currently enabled on the HTTPS frontend
    pub https: bool,
    /// Some source asked for SSL passthrough during the current pass
    pub ssl_passthrough: bool,
    pub default_backend_claimed: bool,
}

impl ControllerCfg {
    pub fn new(options: &ControllerConfig) -> Self {
        Self {
            front_http: options.frontends.http.clone(),
            front_https: options.frontends.https.clone(),
            front_ssl: options.frontends.ssl.clone(),
            front_stats: options.frontends.stats.clone(),
            back_ssl: options.frontends.ssl_backend.clone(),
            rules: RuleRegistry::new(),
            active_backends: BTreeSet::new(),
            managed_backends: BTreeSet::new(),
            rate_limit_tables: BTreeMap::new(),
            map_files: MapFiles::new(&options.env.map_dir),
            custom_routes: CustomRoutes::default(),
            https: false,
            ssl_passthrough: false,
            default_backend_claimed: false,
        }
    }

    /// Forget everything derived from the previous snapshot
    pub fn begin_pass(&mut self) {
        self.active_backends.clear();
        self.rate_limit_tables.clear();
        self.ssl_passthrough = false;
        self.default_backend_claimed = false;
        self.rules.reset();
        self.map_files.clean();
    }
}

/// What the proxy needs after a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassResult {
    pub reload: bool,
    pub restart: bool,
}

/// Reconciliation driver
pub struct Controller {
    pub cfg: ControllerCfg,
    options: ControllerConfig,
    api: Arc<dyn ConfigApi>,
    certificates: Box<dyn Certificates>,
    https: Https,
}

impl Controller {
    pub fn new(
        options: ControllerConfig,
        api: Arc<dyn ConfigApi>,
        certificates: Box<dyn Certificates>,
    ) -> Self {
        Self {
            cfg: ControllerCfg::new(&options),
            https: Https::new(&options.https, &options.env.cert_dir),
            options,
            api,
            certificates,
        }
    }

    pub fn options(&self) -> &ControllerConfig {
        &self.options
    }

    /// Run one reconciliation pass over the store snapshot
    pub async fn run_pass(&mut self, k: &K8s) -> PassResult {
        let start = Instant::now();
        let api = self.api.as_ref();
        let certs = self.certificates.as_mut();
        let cfg = &mut self.cfg;
        cfg.begin_pass();

        let (mut reload, restart) =
            global::handle_global_config(k, cfg, &self.options, api, certs).await;

        for namespace in k.namespaces.values() {
            for stored in namespace.ingresses.values() {
                if stored.status == Status::Deleted {
                    debug!(namespace = %stored.namespace, ingress = %stored.name, "Ingress deleted, skipping");
                    continue;
                }
                let mut ingress = stored.clone();
                if !ingress_class_is_supported(&mut ingress, &k.ingress_classes, &self.options) {
                    debug!(namespace = %ingress.namespace, ingress = %ingress.name, "Ingress class not handled");
                    continue;
                }

                handle_ingress_tls(k, &ingress, certs);
                let rule_ids = handle_ingress_annotations(k, cfg, AnnotationSource::Ingress(&ingress));

                if let Some(path) = &ingress.default_backend {
                    if cfg.default_backend_claimed {
                        warn!(namespace = %ingress.namespace, ingress = %ingress.name, "Default backend already set, ignoring");
                    } else {
                        match handle_default_backend(k, cfg, api, certs, &ingress, path).await {
                            Ok(changed) => {
                                cfg.default_backend_claimed = true;
                                reload |= changed;
                            }
                            Err(e) => {
                                error!(namespace = %ingress.namespace, ingress = %ingress.name, error = %e, "Failed to set default backend");
                                record_step_error("default-service");
                            }
                        }
                    }
                }

                for rule in ingress.rules.values() {
                    for path in rule.paths.values() {
                        match handle_ingress_path(k, cfg, api, certs, &ingress, &rule.host, path, &rule_ids)
                            .await
                        {
                            Ok(changed) => reload |= changed,
                            Err(e) => {
                                error!(
                                    namespace = %ingress.namespace,
                                    ingress = %ingress.name,
                                    host = %rule.host,
                                    path = %path.path,
                                    error = %e,
                                    "Failed to reconcile ingress path"
                                );
                                record_step_error("ingress");
                            }
                        }
                    }
                }
            }
        }

        reload |= sync_rate_limit_tables(cfg, api).await;
        reload |= self.https.update(k, cfg, api, certs).await;

        match cfg.rules.refresh(api, &[cfg.front_ssl.as_str()]).await {
            Ok(changed) => reload |= changed,
            Err(e) => {
                error!(error = %e, "Failed to update frontend rules");
                record_step_error("rules");
            }
        }

        match cfg.map_files.refresh(api).await {
            Ok(changed) => reload |= changed,
            Err(e) => {
                error!(error = %e, "Failed to update map files");
                record_step_error("maps");
            }
        }

        reload |= prune_backends(cfg, api).await;

        match certs.refresh() {
            Ok(changed) => reload |= changed,
            Err(e) => {
                error!(error = %e, "Failed to clean up certificates");
                record_step_error("certificate");
            }
        }

        let result = PassResult { reload, restart };
        let duration = start.elapsed();
        record_pass(duration.as_secs_f64(), reload, restart, cfg.active_backends.len());
        info!(
            reload = result.reload,
            restart = result.restart,
            active_backends = cfg.active_backends.len(),
            rules_http = cfg.rules.rules(&cfg.front_http).len(),
            duration_ms = duration.as_millis() as u64,
            "Reconciliation pass complete"
        );
        result
    }
}

/// Create or update one TCP backend per stick table rate-limit rules track.
///
/// Tables are managed backends, so a table nothing requests any more is pruned.
async fn sync_rate_limit_tables(cfg: &mut ControllerCfg, api: &dyn ConfigApi) -> bool {
    let mut reload = false;
    for (name, table) in &cfg.rate_limit_tables {
        let desired = Backend {
            name: name.clone(),
            mode: Mode::Tcp,
            stick_table: Some(table.clone()),
            ..Default::default()
        };
        let result = match api.backend_get(name).await {
            Ok(live) if live == desired => Ok(false),
            Ok(_) => api.backend_edit(&desired).await.map(|()| true),
            Err(e) if e.is_not_found() => api.backend_create(&desired).await.map(|()| true),
            Err(e) => Err(e),
        };
        match result {
            Ok(changed) => {
                if changed {
                    info!(table = %name, size = table.size, "Rate limit table updated");
                }
                reload |= changed;
                cfg.managed_backends.insert(name.clone());
                cfg.active_backends.insert(name.clone());
            }
            Err(e) => {
                error!(table = %name, error = %e, "Failed to sync rate limit table");
                record_step_error("rate-limit");
            }
        }
    }
    reload
}

/// Delete managed backends no path referenced in this pass
async fn prune_backends(cfg: &mut ControllerCfg, api: &dyn ConfigApi) -> bool {
    let stale: Vec<String> = cfg
        .managed_backends
        .difference(&cfg.active_backends)
        .filter(|name| **name != cfg.back_ssl)
        .cloned()
        .collect();
    let mut reload = false;
    for backend in stale {
        let frontends = [cfg.front_http.as_str(), cfg.front_https.as_str()];
        if let Err(e) = remove_custom_route(&backend, &mut cfg.custom_routes, api, &frontends).await {
            error!(backend = %backend, error = %e, "Failed to remove custom route");
            record_step_error("prune");
            continue;
        }
        match api.backend_delete(&backend).await {
            Ok(()) => {
                info!(backend = %backend, "Backend removed");
                reload = true;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(backend = %backend, error = %e, "Failed to remove backend");
                record_step_error("prune");
                continue;
            }
        }
        cfg.managed_backends.remove(&backend);
    }
    reload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_pass_resets_pass_state() {
        let mut cfg = ControllerCfg::new(&ControllerConfig::default());
        cfg.active_backends.insert("default-web-svc-80".to_string());
        cfg.managed_backends.insert("default-web-svc-80".to_string());
        cfg.rate_limit_tables
            .insert("RateLimit-1000-100000".to_string(), StickTable::default());
        cfg.ssl_passthrough = true;
        cfg.default_backend_claimed = true;

        cfg.begin_pass();
        assert!(cfg.active_backends.is_empty());
        assert!(cfg.rate_limit_tables.is_empty());
        assert!(!cfg.ssl_passthrough);
        assert!(!cfg.default_backend_claimed);
        assert_eq!(
            cfg.managed_backends.len(),
            1,
            "Managed backends survive passes so they can be pruned"
        );
    }
}
