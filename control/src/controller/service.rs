//! Service context
//!
//! Resolves the service behind one ingress path and reconciles the proxy
//! backend and its servers against it. Backend options are read from the
//! service, then the ingress, then the main config map.

use crate::annotations::{get_value, parse_bool};
use crate::error::ControllerError;
use crate::proxy::api::ConfigApi;
use crate::proxy::certs::{CertError, Certificates, SecretCtx, SecretType};
use crate::store::{Annotations, Ingress, IngressPath, K8s, Service, ServicePort, Status};
use common::{Backend, Mode, Server};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

const BALANCE_ALGORITHMS: &[&str] = &[
    "roundrobin",
    "static-rr",
    "leastconn",
    "first",
    "source",
    "uri",
    "random",
];

/// Service behind one ingress path
#[derive(Debug)]
pub struct ServiceContext<'a> {
    ingress: &'a Ingress,
    path: &'a IngressPath,
    service: &'a Service,
    port: &'a ServicePort,
    config_map: &'a Annotations,
    passthrough: bool,
}

impl<'a> ServiceContext<'a> {
    pub fn new(
        k: &'a K8s,
        ingress: &'a Ingress,
        path: &'a IngressPath,
        passthrough: bool,
    ) -> Result<Self, ControllerError> {
        let namespace = k
            .namespaces
            .get(&ingress.namespace)
            .ok_or_else(|| ControllerError::NamespaceNotFound(ingress.namespace.clone()))?;
        let service = namespace.services.get(&path.svc_name).ok_or_else(|| {
            ControllerError::ServiceNotFound {
                namespace: ingress.namespace.clone(),
                name: path.svc_name.clone(),
            }
        })?;
        let port = service
            .ports
            .iter()
            .find(|p| {
                (path.svc_port_int != 0 && p.port == path.svc_port_int)
                    || (!path.svc_port_string.is_empty() && p.name == path.svc_port_string)
            })
            .ok_or_else(|| ControllerError::ServicePortNotFound {
                namespace: ingress.namespace.clone(),
                name: service.name.clone(),
                port: path.port_ref(),
            })?;
        Ok(Self {
            ingress,
            path,
            service,
            port,
            config_map: &k.config_maps.main.annotations,
            passthrough,
        })
    }

    /// DELETED if any of ingress, path or service is; MODIFIED if any changed
    pub fn status(&self) -> Status {
        let statuses = [self.ingress.status, self.path.status, self.service.status];
        if statuses.contains(&Status::Deleted) {
            Status::Deleted
        } else if statuses.iter().any(|s| *s != Status::Empty) {
            Status::Modified
        } else {
            Status::Empty
        }
    }

    pub fn service(&self) -> &'a Service {
        self.service
    }

    pub fn backend_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.service.namespace,
            self.service.name,
            self.path.port_ref()
        )
    }

    fn annotation(&self, name: &str) -> String {
        get_value(
            name,
            &[
                &self.service.annotations,
                &self.ingress.annotations,
                self.config_map,
            ],
        )
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        let value = self.annotation(name);
        if value.is_empty() {
            return default;
        }
        parse_bool(&value, name).unwrap_or_else(|e| {
            error!(service = %self.service.name, error = %e, "Invalid backend option");
            default
        })
    }

    fn desired_backend(&self) -> Backend {
        let mode = if self.passthrough { Mode::Tcp } else { Mode::Http };
        let mut balance = self.annotation("load-balance");
        if !BALANCE_ALGORITHMS.contains(&balance.as_str()) {
            error!(service = %self.service.name, algorithm = %balance, "Unknown load-balance algorithm, using roundrobin");
            balance = "roundrobin".to_string();
        }
        Backend {
            name: self.backend_name(),
            mode,
            balance,
            forwardfor: mode == Mode::Http && self.flag("forwarded-for", true),
            stick_table: None,
        }
    }

    /// Create or update the backend. Returns (reload, backend name).
    pub async fn reconcile_backend(
        &self,
        api: &dyn ConfigApi,
    ) -> Result<(bool, String), ControllerError> {
        let desired = self.desired_backend();
        match api.backend_get(&desired.name).await {
            Ok(live) if live == desired => Ok((false, desired.name)),
            Ok(_) => {
                api.backend_edit(&desired).await?;
                info!(backend = %desired.name, "Backend updated");
                Ok((true, desired.name))
            }
            Err(e) if e.is_not_found() => {
                api.backend_create(&desired).await?;
                info!(backend = %desired.name, mode = desired.mode.as_str(), "Backend created");
                Ok((true, desired.name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sync backend servers with the service endpoints. Errors are logged.
    pub async fn reconcile_endpoints(
        &self,
        api: &dyn ConfigApi,
        k: &K8s,
        certs: &mut dyn Certificates,
    ) -> bool {
        match self.sync_servers(api, k, certs).await {
            Ok(reload) => reload,
            Err(e) => {
                error!(backend = %self.backend_name(), error = %e, "Failed to sync endpoints");
                false
            }
        }
    }

    /// Ready addresses and the target port for this service port
    fn endpoints(&self, k: &K8s) -> (i64, Vec<String>) {
        let fallback_port = if self.port.target_port != 0 {
            self.port.target_port
        } else {
            self.port.port
        };
        let Some(endpoints) = k.endpoints(&self.service.namespace, &self.service.name) else {
            return (fallback_port, vec![]);
        };
        if endpoints.status == Status::Deleted {
            return (fallback_port, vec![]);
        }
        let entry = endpoints.ports.get(&self.port.name).or_else(|| {
            if endpoints.ports.len() == 1 {
                endpoints.ports.values().next()
            } else {
                None
            }
        });
        match entry {
            Some(entry) => {
                let mut addresses = entry.addresses.clone();
                addresses.sort();
                addresses.dedup();
                (entry.port, addresses)
            }
            None => (fallback_port, vec![]),
        }
    }

    fn server_template(
        &self,
        k: &K8s,
        certs: &mut dyn Certificates,
    ) -> Result<Server, ControllerError> {
        let ssl = self.flag("server-ssl", false);
        let mut ssl_cafile = String::new();
        let server_ca = self.annotation("server-ca");
        if !server_ca.is_empty() {
            match certs.handle_tls_secret(
                k,
                SecretCtx {
                    default_ns: &self.service.namespace,
                    secret_path: &server_ca,
                    secret_type: SecretType::BackendCa,
                },
            ) {
                Ok(path) => ssl_cafile = path.display().to_string(),
                Err(CertError::NotFound(secret)) => {
                    warn!(secret = %secret, backend = %self.backend_name(), "Server CA secret not found")
                }
                Err(e) => return Err(e.into()),
            }
        }
        let verify = match (ssl, ssl_cafile.is_empty()) {
            (false, _) => "",
            (true, true) => "none",
            (true, false) => "required",
        };
        Ok(Server {
            check: self.flag("check", true),
            ssl,
            ssl_cafile,
            verify: verify.to_string(),
            ..Default::default()
        })
    }

    async fn sync_servers(
        &self,
        api: &dyn ConfigApi,
        k: &K8s,
        certs: &mut dyn Certificates,
    ) -> Result<bool, ControllerError> {
        let backend = self.backend_name();
        let template = self.server_template(k, certs)?;
        let (port, addresses) = self.endpoints(k);
        let live = api.backend_servers_get(&backend).await?;

        let mut remaining: BTreeSet<String> = addresses.into_iter().collect();
        let mut used_names = BTreeSet::new();
        let mut reload = false;

        for server in &live {
            if remaining.remove(&server.address) {
                let desired = Server {
                    name: server.name.clone(),
                    address: server.address.clone(),
                    port: Some(port),
                    ..template.clone()
                };
                if *server != desired {
                    api.backend_server_edit(&backend, &desired).await?;
                    debug!(backend = %backend, server = %desired.name, "Server updated");
                    reload = true;
                }
                used_names.insert(server.name.clone());
            } else {
                api.backend_server_delete(&backend, &server.name).await?;
                debug!(backend = %backend, server = %server.name, address = %server.address, "Server removed");
                reload = true;
            }
        }

        let mut next = 1;
        for address in remaining {
            while used_names.contains(&format!("SRV_{next}")) {
                next += 1;
            }
            let name = format!("SRV_{next}");
            let server = Server {
                name: name.clone(),
                address,
                port: Some(port),
                ..template.clone()
            };
            api.backend_server_create(&backend, &server).await?;
            debug!(backend = %backend, server = %name, address = %server.address, "Server added");
            used_names.insert(name);
            reload = true;
        }
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::certs::SecretCertificates;
    use crate::proxy::memory::MemoryConfigApi;
    use crate::store::{Endpoints, PortEndpoints};

    fn store(addresses: &[&str]) -> K8s {
        let mut k = K8s::new();
        let ns = k.namespace_mut("default");
        ns.services.insert(
            "web-svc".to_string(),
            Service {
                namespace: "default".to_string(),
                name: "web-svc".to_string(),
                ports: vec![ServicePort {
                    name: "http".to_string(),
                    protocol: "TCP".to_string(),
                    port: 80,
                    target_port: 8080,
                }],
                ..Default::default()
            },
        );
        ns.endpoints.insert(
            "web-svc".to_string(),
            Endpoints {
                namespace: "default".to_string(),
                service: "web-svc".to_string(),
                ports: [(
                    "http".to_string(),
                    PortEndpoints {
                        port: 8080,
                        addresses: addresses.iter().map(ToString::to_string).collect(),
                    },
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        );
        k
    }

    fn ingress() -> Ingress {
        Ingress {
            namespace: "default".to_string(),
            name: "web".to_string(),
            ..Default::default()
        }
    }

    fn path() -> IngressPath {
        IngressPath {
            path: "/".to_string(),
            svc_name: "web-svc".to_string(),
            svc_port_int: 80,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_service_is_an_error() {
        let k = K8s::new();
        let ing = ingress();
        let p = path();
        assert!(matches!(
            ServiceContext::new(&k, &ing, &p, false),
            Err(ControllerError::NamespaceNotFound(_))
        ));

        let mut k = store(&[]);
        k.namespace_mut("default").services.clear();
        assert!(matches!(
            ServiceContext::new(&k, &ing, &p, false),
            Err(ControllerError::ServiceNotFound { .. })
        ));
    }

    #[test]
    fn test_status_folds_deleted() {
        let k = store(&[]);
        let mut ing = ingress();
        let p = path();
        let ctx = ServiceContext::new(&k, &ing, &p, false).unwrap();
        assert_eq!(ctx.status(), Status::Empty);

        ing.status = Status::Deleted;
        let ctx = ServiceContext::new(&k, &ing, &p, false).unwrap();
        assert_eq!(ctx.status(), Status::Deleted);
    }

    #[tokio::test]
    async fn test_backend_created_then_stable() {
        let api = MemoryConfigApi::new();
        let k = store(&[]);
        let (ing, p) = (ingress(), path());
        let ctx = ServiceContext::new(&k, &ing, &p, true).unwrap();

        let (reload, name) = ctx.reconcile_backend(&api).await.unwrap();
        assert!(reload);
        assert_eq!(name, "default-web-svc-80");
        let backend = api.backend_get(&name).await.unwrap();
        assert_eq!(backend.mode, Mode::Tcp, "passthrough backends are TCP");
        assert!(!backend.forwardfor, "forwardfor is HTTP only");

        let (reload, _) = ctx.reconcile_backend(&api).await.unwrap();
        assert!(!reload, "unchanged backend must not reload");
    }

    #[tokio::test]
    async fn test_servers_keep_names_across_churn() {
        let api = MemoryConfigApi::new();
        let mut certs = SecretCertificates::new(std::env::temp_dir().join("tollgate-unused"));
        let (ing, p) = (ingress(), path());

        let k = store(&["10.0.0.1", "10.0.0.2"]);
        let ctx = ServiceContext::new(&k, &ing, &p, false).unwrap();
        ctx.reconcile_backend(&api).await.unwrap();
        assert!(ctx.reconcile_endpoints(&api, &k, &mut certs).await);

        let servers = api.backend_servers_get("default-web-svc-80").await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "SRV_1");
        assert_eq!(servers[0].port, Some(8080));

        // 10.0.0.1 goes away, 10.0.0.3 arrives
        let k = store(&["10.0.0.2", "10.0.0.3"]);
        let ctx = ServiceContext::new(&k, &ing, &p, false).unwrap();
        assert!(ctx.reconcile_endpoints(&api, &k, &mut certs).await);
        let servers = api.backend_servers_get("default-web-svc-80").await.unwrap();
        let by_address = |addr: &str| {
            servers
                .iter()
                .find(|s| s.address == addr)
                .map(|s| s.name.clone())
        };
        assert_eq!(by_address("10.0.0.2"), Some("SRV_2".to_string()), "kept endpoint keeps its name");
        assert_eq!(by_address("10.0.0.3"), Some("SRV_1".to_string()), "freed name is reused");
        assert_eq!(by_address("10.0.0.1"), None);

        assert!(!ctx.reconcile_endpoints(&api, &k, &mut certs).await);
    }
}
