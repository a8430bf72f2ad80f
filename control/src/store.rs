//! Observed store
//!
//! Snapshot of the cluster objects the controller cares about. Populated by
//! the Kubernetes watchers (see `apis::convert`) and read by the engine during
//! a reconciliation pass. Each object carries a lifecycle [`Status`] describing
//! what happened to it since the previous pass.

use common::{Defaults, Global, LogTarget};
use std::collections::BTreeMap;

/// Annotations (or config map data) as seen on a resource
pub type Annotations = BTreeMap<String, String>;

/// Lifecycle status of an observed object relative to the previous pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    /// Unchanged since the previous pass
    #[default]
    Empty,
    Added,
    Modified,
    Deleted,
}

/// Ingress path type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathType {
    #[default]
    Prefix,
    Exact,
    ImplementationSpecific,
}

/// Backend of an ingress path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressPath {
    pub path: String,
    pub path_type: PathType,
    pub svc_name: String,
    pub svc_port_int: i64,
    pub svc_port_string: String,
    pub is_default_backend: bool,
    pub status: Status,
}

impl IngressPath {
    /// Port reference used in backend names: the number, or the port name
    pub fn port_ref(&self) -> String {
        if self.svc_port_int != 0 {
            self.svc_port_int.to_string()
        } else {
            self.svc_port_string.clone()
        }
    }
}

/// Host rule of an ingress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressRule {
    pub host: String,
    /// Keyed by path
    pub paths: BTreeMap<String, IngressPath>,
    pub status: Status,
}

/// TLS entry of an ingress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
    pub status: Status,
}

/// Ingress resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ingress {
    pub namespace: String,
    pub name: String,
    /// `spec.ingressClassName`
    pub class: String,
    pub annotations: Annotations,
    /// Keyed by host
    pub rules: BTreeMap<String, IngressRule>,
    pub default_backend: Option<IngressPath>,
    pub tls: Vec<IngressTls>,
    pub status: Status,
}

/// Service port
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: i64,
    pub target_port: i64,
}

/// Service resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub annotations: Annotations,
    pub ports: Vec<ServicePort>,
    pub status: Status,
}

/// Ready addresses behind one named endpoint port
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortEndpoints {
    pub port: i64,
    pub addresses: Vec<String>,
}

/// Endpoints of a service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoints {
    pub namespace: String,
    pub service: String,
    /// Keyed by port name (empty for unnamed single-port services)
    pub ports: BTreeMap<String, PortEndpoints>,
    pub status: Status,
}

/// Secret resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub status: Status,
}

/// Namespace and the objects it holds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    pub name: String,
    pub services: BTreeMap<String, Service>,
    pub endpoints: BTreeMap<String, Endpoints>,
    pub ingresses: BTreeMap<String, Ingress>,
    pub secrets: BTreeMap<String, Secret>,
    pub status: Status,
}

/// IngressClass resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressClass {
    pub name: String,
    pub controller: String,
    pub status: Status,
}

/// Config map resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMap {
    pub namespace: String,
    pub name: String,
    /// Config map data, consumed as annotations
    pub annotations: Annotations,
    pub status: Status,
}

/// Config maps the controller reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMaps {
    pub main: ConfigMap,
}

/// Custom-resource overrides for the proxy-wide sections
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomResources {
    pub global: Option<Global>,
    pub log_targets: Option<Vec<LogTarget>>,
    pub defaults: Option<Defaults>,
}

/// The observed store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct K8s {
    pub namespaces: BTreeMap<String, Namespace>,
    pub ingress_classes: BTreeMap<String, IngressClass>,
    pub config_maps: ConfigMaps,
    pub cr: CustomResources,
}

impl K8s {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace by name, created on first use
    pub fn namespace_mut(&mut self, name: &str) -> &mut Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                name: name.to_string(),
                status: Status::Added,
                ..Default::default()
            })
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        self.namespaces.get(namespace)?.services.get(name)
    }

    pub fn endpoints(&self, namespace: &str, service: &str) -> Option<&Endpoints> {
        self.namespaces.get(namespace)?.endpoints.get(service)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        self.namespaces.get(namespace)?.secrets.get(name)
    }

    /// Drop DELETED objects and mark everything else as unchanged.
    ///
    /// Called by the store owner once a pass has consumed the snapshot.
    pub fn clean(&mut self) {
        self.namespaces.retain(|_, ns| ns.status != Status::Deleted);
        for ns in self.namespaces.values_mut() {
            ns.status = Status::Empty;
            ns.services.retain(|_, s| s.status != Status::Deleted);
            ns.services.values_mut().for_each(|s| s.status = Status::Empty);
            ns.endpoints.retain(|_, e| e.status != Status::Deleted);
            ns.endpoints.values_mut().for_each(|e| e.status = Status::Empty);
            ns.secrets.retain(|_, s| s.status != Status::Deleted);
            ns.secrets.values_mut().for_each(|s| s.status = Status::Empty);
            ns.ingresses.retain(|_, i| i.status != Status::Deleted);
            for ingress in ns.ingresses.values_mut() {
                ingress.status = Status::Empty;
                for rule in ingress.rules.values_mut() {
                    rule.status = Status::Empty;
                    rule.paths.retain(|_, p| p.status != Status::Deleted);
                    rule.paths.values_mut().for_each(|p| p.status = Status::Empty);
                }
            }
        }
        self.ingress_classes
            .retain(|_, c| c.status != Status::Deleted);
        self.ingress_classes
            .values_mut()
            .for_each(|c| c.status = Status::Empty);
        self.config_maps.main.status = Status::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_ref_prefers_number() {
        let path = IngressPath {
            svc_port_int: 8080,
            svc_port_string: "http".to_string(),
            ..Default::default()
        };
        assert_eq!(path.port_ref(), "8080");

        let named = IngressPath {
            svc_port_string: "http".to_string(),
            ..Default::default()
        };
        assert_eq!(named.port_ref(), "http");
    }

    #[test]
    fn test_clean_drops_deleted_and_resets_status() {
        let mut store = K8s::new();
        let ns = store.namespace_mut("default");
        ns.services.insert(
            "gone".to_string(),
            Service {
                name: "gone".to_string(),
                status: Status::Deleted,
                ..Default::default()
            },
        );
        ns.services.insert(
            "web".to_string(),
            Service {
                name: "web".to_string(),
                status: Status::Modified,
                ..Default::default()
            },
        );
        store.ingress_classes.insert(
            "old".to_string(),
            IngressClass {
                name: "old".to_string(),
                status: Status::Deleted,
                ..Default::default()
            },
        );

        store.clean();

        let ns = &store.namespaces["default"];
        assert_eq!(ns.status, Status::Empty);
        assert!(!ns.services.contains_key("gone"));
        assert_eq!(ns.services["web"].status, Status::Empty);
        assert!(store.ingress_classes.is_empty());
    }
}
