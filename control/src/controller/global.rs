//! Proxy-wide configuration
//!
//! Global section, log targets, snippets and the defaults section, followed
//! by the default certificate and default service.

use crate::annotations::snippet::{update_frontend_snippet, update_global_snippet};
use crate::annotations::{self, get_value};
use crate::apis::metrics::record_step_error;
use crate::config::ControllerConfig;
use crate::controller::ingress::{handle_default_backend, handle_ingress_annotations, AnnotationSource};
use crate::controller::ControllerCfg;
use crate::error::ControllerError;
use crate::proxy::api::ConfigApi;
use crate::proxy::certs::{CertError, Certificates, SecretCtx, SecretType};
use crate::store::{Ingress, IngressPath, K8s};
use common::{Defaults, Global, Mode, RuntimeApi};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Synchronize the proxy-wide sections. Returns (reload, restart).
pub async fn handle_global_config(
    k: &K8s,
    cfg: &mut ControllerCfg,
    options: &ControllerConfig,
    api: &dyn ConfigApi,
    certs: &mut dyn Certificates,
) -> (bool, bool) {
    let (mut reload, restart) = global_cfg(k, cfg, options, api).await;
    reload |= defaults_cfg(k, api).await;
    handle_default_cert(k, options, certs);
    reload |= handle_default_service(k, cfg, options, api, certs).await;
    handle_ingress_annotations(k, cfg, AnnotationSource::ConfigMap);
    (reload, restart)
}

/// Names of the top-level fields that differ between two objects
pub fn diff_fields<T: Serialize>(live: &T, desired: &T) -> Vec<String> {
    let (Ok(serde_json::Value::Object(live)), Ok(serde_json::Value::Object(desired))) =
        (serde_json::to_value(live), serde_json::to_value(desired))
    else {
        return vec![];
    };
    desired
        .iter()
        .filter(|(key, value)| live.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

fn apply_env(global: &mut Global, options: &ControllerConfig) {
    global.daemon = true;
    global.pidfile = options.env.pid_file.clone();
    global.runtime_apis = vec![RuntimeApi {
        address: options.env.runtime_socket.clone(),
        level: "admin".to_string(),
        expose_fd_listeners: true,
    }];
    global.server_state_base = options.env.state_dir.clone();
    global.tune_ssl_default_dh_param = Some(2048);
    global.ssl_default_bind_options = "no-sslv3 no-tls-tickets no-tlsv10".to_string();
}

async fn global_cfg(
    k: &K8s,
    cfg: &ControllerCfg,
    options: &ControllerConfig,
    api: &dyn ConfigApi,
) -> (bool, bool) {
    let live = match api.global_get().await {
        Ok(global) => global,
        Err(e) => {
            error!(error = %e, "Failed to fetch global section");
            record_step_error("global");
            return (false, false);
        }
    };
    let live_targets = match api.log_targets_get().await {
        Ok(targets) => targets,
        Err(e) => {
            error!(error = %e, "Failed to fetch log targets");
            record_step_error("global");
            return (false, false);
        }
    };

    let config_map = &k.config_maps.main.annotations;
    let (mut desired, desired_targets) = match &k.cr.global {
        Some(global) => (
            global.clone(),
            k.cr.log_targets.clone().unwrap_or_default(),
        ),
        None => annotations::global::from_annotations(config_map),
    };
    apply_env(&mut desired, options);

    let mut reload = false;
    let mut restart = false;

    if desired != live {
        let fields = diff_fields(&live, &desired);
        match api.global_push(&desired).await {
            Ok(()) => {
                info!(fields = ?fields, "Global section updated");
                restart = true;
            }
            Err(e) => {
                error!(error = %e, "Failed to update global section");
                record_step_error("global");
            }
        }
    }

    if desired_targets != live_targets {
        let result = match api.log_targets_delete().await {
            Ok(()) => api.log_targets_create(&desired_targets).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(targets = desired_targets.len(), "Log targets updated");
                restart = true;
            }
            Err(e) => {
                error!(error = %e, "Failed to update log targets");
                record_step_error("global");
            }
        }
    }

    match update_global_snippet(api, config_map).await {
        Ok(changed) => restart |= changed,
        Err(e) => {
            error!(error = %e, "Failed to update global config snippet");
            record_step_error("global");
        }
    }

    let frontends = [
        cfg.front_http.as_str(),
        cfg.front_https.as_str(),
        cfg.front_stats.as_str(),
    ];
    match update_frontend_snippet(api, config_map, &frontends).await {
        Ok(changed) => reload |= changed,
        Err(e) => {
            error!(error = %e, "Failed to update frontend config snippet");
            record_step_error("global");
        }
    }

    (reload, restart)
}

fn base_defaults(defaults: &mut Defaults) {
    defaults.mode = Some(Mode::Http);
    defaults.log_global = true;
    defaults.redispatch = true;
}

async fn defaults_cfg(k: &K8s, api: &dyn ConfigApi) -> bool {
    let live = match api.defaults_get().await {
        Ok(defaults) => defaults,
        Err(e) => {
            error!(error = %e, "Failed to fetch defaults section");
            record_step_error("defaults");
            return false;
        }
    };
    let mut desired = match &k.cr.defaults {
        Some(defaults) => defaults.clone(),
        None => annotations::defaults::from_annotations(&k.config_maps.main.annotations),
    };
    base_defaults(&mut desired);
    if desired == live {
        return false;
    }
    let fields = diff_fields(&live, &desired);
    if let Err(e) = api.defaults_push(&desired).await {
        error!(error = %e, "Failed to update defaults section");
        record_step_error("defaults");
        return false;
    }
    info!(fields = ?fields, "Defaults section updated");
    true
}

fn handle_default_cert(k: &K8s, options: &ControllerConfig, certs: &mut dyn Certificates) {
    let mut secret = get_value("ssl-certificate", &[&k.config_maps.main.annotations]);
    if secret.is_empty() {
        secret = options.default_ssl_certificate.clone();
    }
    if secret.is_empty() {
        return;
    }
    let ctx = SecretCtx {
        default_ns: "",
        secret_path: &secret,
        secret_type: SecretType::DefaultCert,
    };
    match certs.handle_tls_secret(k, ctx) {
        Ok(path) => debug!(path = %path.display(), "Default certificate ready"),
        Err(CertError::NotFound(secret)) => warn!(secret = %secret, "Default certificate secret not found"),
        Err(e) => {
            error!(error = %e, "Failed to handle default certificate");
            record_step_error("certificate");
        }
    }
}

/// Synthetic ingress for the configured default service
fn default_service_ingress(k: &K8s, reference: &str) -> Result<(Ingress, IngressPath), ControllerError> {
    let parts: Vec<&str> = reference.split('/').collect();
    let [namespace, name] = parts.as_slice() else {
        return Err(ControllerError::InvalidReference(reference.to_string()));
    };
    let ns = k
        .namespaces
        .get(*namespace)
        .ok_or_else(|| ControllerError::NamespaceNotFound(namespace.to_string()))?;
    let service = ns.services.get(*name).ok_or_else(|| ControllerError::ServiceNotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })?;
    let port = service
        .ports
        .first()
        .ok_or_else(|| ControllerError::ServicePortNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: "<first>".to_string(),
        })?;
    let ingress = Ingress {
        namespace: namespace.to_string(),
        name: "DefaultService".to_string(),
        ..Default::default()
    };
    let path = IngressPath {
        svc_name: name.to_string(),
        svc_port_int: port.port,
        is_default_backend: true,
        ..Default::default()
    };
    Ok((ingress, path))
}

async fn handle_default_service(
    k: &K8s,
    cfg: &mut ControllerCfg,
    options: &ControllerConfig,
    api: &dyn ConfigApi,
    certs: &mut dyn Certificates,
) -> bool {
    let mut reference = get_value("default-backend-service", &[&k.config_maps.main.annotations]);
    if reference.is_empty() {
        reference = options.default_backend_service.clone();
    }
    if reference.is_empty() {
        return false;
    }
    let (ingress, path) = match default_service_ingress(k, &reference) {
        Ok(synthetic) => synthetic,
        Err(e) => {
            error!(reference = %reference, error = %e, "Invalid default service");
            return false;
        }
    };
    match handle_default_backend(k, cfg, api, certs, &ingress, &path).await {
        Ok(reload) => {
            cfg.default_backend_claimed = true;
            reload
        }
        Err(e) => {
            error!(reference = %reference, error = %e, "Failed to configure default service");
            record_step_error("default-service");
            false
        }
    }
}
