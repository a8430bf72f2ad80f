//! Ingress processing
//!
//! Admission, the annotation-to-rule pipeline and per-path reconciliation.

use crate::annotations::frontend::FRONTEND_ANNOTATIONS;
use crate::annotations::{get_value, parse_bool};
use crate::apis::metrics::record_step_error;
use crate::config::{ControllerConfig, CONTROLLER_CLASS};
use crate::controller::route::{add_custom_route, add_host_path_route, remove_custom_route, Route};
use crate::controller::service::ServiceContext;
use crate::controller::ControllerCfg;
use crate::error::ControllerError;
use crate::proxy::api::ConfigApi;
use crate::proxy::certs::{CertError, Certificates, SecretCtx, SecretType};
use crate::proxy::rules::{Rule, RuleId, RuleScope};
use crate::store::{Annotations, Ingress, IngressClass, IngressPath, K8s, Status};
use common::StickTable;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Decide whether this controller handles the ingress.
///
/// A freshly observed IngressClass marks the ingress MODIFIED; its paths then
/// report as changed through [`ServiceContext::status`].
pub fn ingress_class_is_supported(
    ingress: &mut Ingress,
    classes: &BTreeMap<String, IngressClass>,
    config: &ControllerConfig,
) -> bool {
    let annotation = get_value("ingress.class", &[&ingress.annotations]);
    if annotation.is_empty() && config.empty_ingress_class {
        return true;
    }
    if annotation.is_empty() || annotation != config.ingress_class {
        if let Some(class) = classes.get(&ingress.class) {
            if class.status != Status::Deleted && class.controller == CONTROLLER_CLASS {
                if class.status != Status::Empty {
                    ingress.status = Status::Modified;
                }
                return true;
            }
        }
    }
    annotation == config.ingress_class
}

/// Where frontend options are read from
#[derive(Debug, Clone, Copy)]
pub enum AnnotationSource<'a> {
    Ingress(&'a Ingress),
    /// The main config map; its rules apply to every route
    ConfigMap,
}

impl AnnotationSource<'_> {
    fn describe(&self) -> String {
        match self {
            AnnotationSource::Ingress(ing) => format!("ingress {}/{}", ing.namespace, ing.name),
            AnnotationSource::ConfigMap => "config map".to_string(),
        }
    }
}

/// Resolve `ssl-passthrough` for a source, and for one of its paths when given.
///
/// Lookup order is service, ingress, config map. The config map source only
/// consults the config map.
pub fn ssl_passthrough_enabled(
    k: &K8s,
    source: AnnotationSource<'_>,
    path: Option<&IngressPath>,
) -> bool {
    let config_map = &k.config_maps.main.annotations;
    let value = match source {
        AnnotationSource::ConfigMap => get_value("ssl-passthrough", &[config_map]),
        AnnotationSource::Ingress(ing) => {
            let service = path.and_then(|p| k.service(&ing.namespace, &p.svc_name));
            let mut sources: Vec<&Annotations> = Vec::with_capacity(3);
            if let Some(svc) = service {
                sources.push(&svc.annotations);
            }
            sources.push(&ing.annotations);
            sources.push(config_map);
            get_value("ssl-passthrough", &sources)
        }
    };
    if value.is_empty() {
        return false;
    }
    parse_bool(&value, "ssl-passthrough").unwrap_or_else(|e| {
        error!(source = %source.describe(), error = %e, "Invalid ssl-passthrough option");
        false
    })
}

/// Turn the frontend options of a source into registered rules.
///
/// Returns the ids of the rules produced, in catalogue order.
pub fn handle_ingress_annotations(
    k: &K8s,
    cfg: &mut ControllerCfg,
    source: AnnotationSource<'_>,
) -> Vec<RuleId> {
    let passthrough = ssl_passthrough_enabled(k, source, None);
    if passthrough {
        cfg.ssl_passthrough = true;
    }
    let annotations = match source {
        AnnotationSource::Ingress(ing) => &ing.annotations,
        AnnotationSource::ConfigMap => &k.config_maps.main.annotations,
    };

    let mut rules: Vec<Rule> = Vec::new();
    for handler in FRONTEND_ANNOTATIONS {
        let value = get_value(handler.name, &[annotations]);
        if value.is_empty() {
            continue;
        }
        if let Err(e) = (handler.process)(&value, annotations, &mut rules) {
            error!(source = %source.describe(), error = %e, "Failed to process annotation");
        }
    }

    let scope = match source {
        AnnotationSource::ConfigMap => RuleScope::Global,
        AnnotationSource::Ingress(_) => RuleScope::Ingress,
    };
    let mut ids = Vec::with_capacity(rules.len());
    for rule in rules {
        let frontends = match &rule {
            Rule::RequestRedirect {
                ssl_redirect: true, ..
            } => vec![cfg.front_http.clone()],
            Rule::Deny { .. } | Rule::Capture { .. } if passthrough => {
                vec![cfg.front_http.clone(), cfg.front_ssl.clone()]
            }
            Rule::RateLimit {
                table,
                period_ms,
                size,
                ..
            } => {
                cfg.rate_limit_tables
                    .entry(table.clone())
                    .or_insert_with(|| StickTable {
                        key: "ip".to_string(),
                        size: *size,
                        expire: *period_ms,
                        store: format!("http_req_rate({period_ms})"),
                    });
                vec![cfg.front_http.clone(), cfg.front_https.clone()]
            }
            _ => vec![cfg.front_http.clone(), cfg.front_https.clone()],
        };
        let id = rule.id();
        for frontend in &frontends {
            if let Err(e) = cfg.rules.add_rule(rule.clone(), scope, frontend) {
                error!(source = %source.describe(), error = %e, "Failed to register rule");
            }
        }
        ids.push(id);
    }
    ids
}

/// Resolve the certificates of an ingress's TLS section
pub fn handle_ingress_tls(k: &K8s, ingress: &Ingress, certs: &mut dyn Certificates) {
    for tls in &ingress.tls {
        if tls.status == Status::Deleted || tls.secret_name.is_empty() {
            continue;
        }
        let ctx = SecretCtx {
            default_ns: &ingress.namespace,
            secret_path: &tls.secret_name,
            secret_type: SecretType::FrontendCert,
        };
        match certs.handle_tls_secret(k, ctx) {
            Ok(path) => debug!(ingress = %ingress.name, path = %path.display(), "TLS certificate ready"),
            Err(CertError::NotFound(secret)) => {
                warn!(ingress = %ingress.name, secret = %secret, "TLS secret not found")
            }
            Err(e) => {
                error!(ingress = %ingress.name, error = %e, "Failed to handle TLS secret");
                record_step_error("certificate");
            }
        }
    }
}

/// Point the HTTP and HTTPS frontends at the default backend.
///
/// Returns whether any frontend changed.
pub async fn set_default_service(
    cfg: &ControllerCfg,
    api: &dyn ConfigApi,
    backend: &str,
) -> Result<bool, ControllerError> {
    let mut reload = false;
    for name in [&cfg.front_http, &cfg.front_https] {
        let mut frontend = api.frontend_get(name).await?;
        if frontend.default_backend == backend {
            continue;
        }
        frontend.default_backend = backend.to_string();
        api.frontend_edit(&frontend).await?;
        info!(frontend = %name, backend = %backend, "Default backend updated");
        reload = true;
    }
    Ok(reload)
}

/// Reconcile a default-backend path: the backend, both frontends' default
/// backend pointer and the servers.
pub async fn handle_default_backend(
    k: &K8s,
    cfg: &mut ControllerCfg,
    api: &dyn ConfigApi,
    certs: &mut dyn Certificates,
    ingress: &Ingress,
    path: &IngressPath,
) -> Result<bool, ControllerError> {
    let ctx = ServiceContext::new(k, ingress, path, false)?;
    if ctx.status() == Status::Deleted {
        debug!(ingress = %ingress.name, "Default service deleted, skipping");
        return Ok(false);
    }
    let (mut reload, backend) = ctx.reconcile_backend(api).await?;
    cfg.managed_backends.insert(backend.clone());
    reload |= set_default_service(cfg, api, &backend).await?;
    cfg.active_backends.insert(backend);
    reload |= ctx.reconcile_endpoints(api, k, certs).await;
    Ok(reload)
}

/// Reconcile one ingress path: backend, route and servers
#[allow(clippy::too_many_arguments)]
pub async fn handle_ingress_path(
    k: &K8s,
    cfg: &mut ControllerCfg,
    api: &dyn ConfigApi,
    certs: &mut dyn Certificates,
    ingress: &Ingress,
    host: &str,
    path: &IngressPath,
    rule_ids: &[RuleId],
) -> Result<bool, ControllerError> {
    let passthrough = ssl_passthrough_enabled(k, AnnotationSource::Ingress(ingress), Some(path));
    cfg.ssl_passthrough |= passthrough;

    let ctx = ServiceContext::new(k, ingress, path, passthrough)?;
    match ctx.status() {
        Status::Deleted => {
            debug!(ingress = %ingress.name, path = %path.path, "Path or service deleted, skipping");
            return Ok(false);
        }
        Status::Empty => {}
        status => debug!(ingress = %ingress.name, host = %host, path = %path.path, ?status, "Path changed since last pass"),
    }

    let (mut reload, backend_name) = ctx.reconcile_backend(api).await?;
    cfg.managed_backends.insert(backend_name.clone());

    let route = Route {
        host: host.to_string(),
        path: path.path.clone(),
        path_type: path.path_type,
        backend_name,
        ssl_passthrough: passthrough,
        rule_ids: rule_ids.to_vec(),
    };
    let route_acl = get_value("route-acl", &[&ctx.service().annotations]);
    let frontends = [cfg.front_http.as_str(), cfg.front_https.as_str()];
    if route_acl.is_empty() {
        if remove_custom_route(&route.backend_name, &mut cfg.custom_routes, api, &frontends).await? {
            reload = true;
        }
        add_host_path_route(&route, &mut cfg.map_files)?;
    } else {
        reload |= add_custom_route(&route, &route_acl, &mut cfg.custom_routes, api, &frontends).await?;
    }

    cfg.active_backends.insert(route.backend_name);
    reload |= ctx.reconcile_endpoints(api, k, certs).await;
    Ok(reload)
}
