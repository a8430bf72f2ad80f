//! Kubernetes objects to store entries
//!
//! Pure conversions from `k8s-openapi` types plus [`apply_event`], which
//! folds a watch event into the store and sets the lifecycle status the
//! engine reads on the next pass.

use crate::store::{
    ConfigMap, Endpoints, Ingress, IngressClass, IngressPath, IngressRule, IngressTls, K8s,
    PathType, PortEndpoints, Secret, Service, ServicePort, Status,
};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as netv1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::debug;

/// A converted object
#[derive(Debug, Clone, PartialEq)]
pub enum StoreObject {
    Ingress(Ingress),
    IngressClass(IngressClass),
    Service(Service),
    Endpoints(Endpoints),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

/// Watch event in store terms
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Apply(StoreObject),
    Delete(StoreObject),
}

fn namespace_of<K: ResourceExt>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

fn path_type(value: &str) -> PathType {
    match value {
        "Exact" => PathType::Exact,
        "Prefix" => PathType::Prefix,
        _ => PathType::ImplementationSpecific,
    }
}

/// Service backend of an ingress path; resource backends are not supported
fn backend_path(backend: &netv1::IngressBackend, path: &str, path_type: PathType) -> Option<IngressPath> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref();
    Some(IngressPath {
        path: path.to_string(),
        path_type,
        svc_name: service.name.clone(),
        svc_port_int: port.and_then(|p| p.number).map(i64::from).unwrap_or_default(),
        svc_port_string: port.and_then(|p| p.name.clone()).unwrap_or_default(),
        ..Default::default()
    })
}

pub fn ingress(ing: &netv1::Ingress) -> Ingress {
    let mut converted = Ingress {
        namespace: namespace_of(ing),
        name: ing.name_any(),
        annotations: ing.annotations().clone(),
        ..Default::default()
    };
    let Some(spec) = &ing.spec else {
        return converted;
    };
    converted.class = spec.ingress_class_name.clone().unwrap_or_default();
    converted.default_backend = spec.default_backend.as_ref().and_then(|backend| {
        backend_path(backend, "", PathType::Prefix).map(|p| IngressPath {
            is_default_backend: true,
            ..p
        })
    });

    for rule in spec.rules.iter().flatten() {
        let host = rule.host.clone().unwrap_or_default();
        let entry = converted
            .rules
            .entry(host.clone())
            .or_insert_with(|| IngressRule {
                host,
                ..Default::default()
            });
        let Some(http) = &rule.http else {
            continue;
        };
        for p in &http.paths {
            let path = p.path.clone().unwrap_or_else(|| "/".to_string());
            match backend_path(&p.backend, &path, path_type(&p.path_type)) {
                Some(backend) => {
                    entry.paths.insert(path, backend);
                }
                None => debug!(ingress = %converted.name, path = %path, "Skipping non-service backend"),
            }
        }
    }

    converted.tls = spec
        .tls
        .iter()
        .flatten()
        .map(|tls| IngressTls {
            hosts: tls.hosts.clone().unwrap_or_default(),
            secret_name: tls.secret_name.clone().unwrap_or_default(),
            status: Status::Empty,
        })
        .collect();
    converted
}

pub fn ingress_class(class: &netv1::IngressClass) -> IngressClass {
    IngressClass {
        name: class.name_any(),
        controller: class
            .spec
            .as_ref()
            .and_then(|s| s.controller.clone())
            .unwrap_or_default(),
        status: Status::Empty,
    }
}

pub fn service(svc: &corev1::Service) -> Service {
    let ports = svc
        .spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .map(|p| ServicePort {
            name: p.name.clone().unwrap_or_default(),
            protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            port: i64::from(p.port),
            target_port: match &p.target_port {
                Some(IntOrString::Int(port)) => i64::from(*port),
                // named target ports resolve through the endpoints
                _ => 0,
            },
        })
        .collect();
    Service {
        namespace: namespace_of(svc),
        name: svc.name_any(),
        annotations: svc.annotations().clone(),
        ports,
        status: Status::Empty,
    }
}

/// Ready addresses per port name. Not-ready addresses are left out.
pub fn endpoints(ep: &corev1::Endpoints) -> Endpoints {
    let mut ports: BTreeMap<String, PortEndpoints> = BTreeMap::new();
    for subset in ep.subsets.iter().flatten() {
        let addresses: Vec<String> = subset
            .addresses
            .iter()
            .flatten()
            .map(|a| a.ip.clone())
            .collect();
        for port in subset.ports.iter().flatten() {
            let entry = ports
                .entry(port.name.clone().unwrap_or_default())
                .or_insert_with(|| PortEndpoints {
                    port: i64::from(port.port),
                    addresses: Vec::new(),
                });
            entry.addresses.extend(addresses.iter().cloned());
        }
    }
    for entry in ports.values_mut() {
        entry.addresses.sort();
        entry.addresses.dedup();
    }
    Endpoints {
        namespace: namespace_of(ep),
        service: ep.name_any(),
        ports,
        status: Status::Empty,
    }
}

pub fn secret(secret: &corev1::Secret) -> Secret {
    Secret {
        namespace: namespace_of(secret),
        name: secret.name_any(),
        data: secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect(),
        status: Status::Empty,
    }
}

pub fn config_map(cm: &corev1::ConfigMap) -> ConfigMap {
    ConfigMap {
        namespace: namespace_of(cm),
        name: cm.name_any(),
        annotations: cm.data.clone().unwrap_or_default(),
        status: Status::Empty,
    }
}

/// Status of an object that replaces `old`.
///
/// An object added since the last pass stays ADDED.
fn next_status(old: Option<Status>, changed: bool) -> Option<Status> {
    match old {
        None => Some(Status::Added),
        Some(Status::Added) => Some(Status::Added),
        Some(_) if changed => Some(Status::Modified),
        Some(Status::Deleted) => Some(Status::Modified),
        Some(_) => None,
    }
}

fn without_status(ing: &Ingress) -> Ingress {
    let mut ing = ing.clone();
    ing.status = Status::Empty;
    for tls in &mut ing.tls {
        tls.status = Status::Empty;
    }
    ing.rules.retain(|_, r| r.status != Status::Deleted);
    for rule in ing.rules.values_mut() {
        rule.status = Status::Empty;
        rule.paths.retain(|_, p| p.status != Status::Deleted);
        rule.paths.values_mut().for_each(|p| p.status = Status::Empty);
    }
    ing
}

/// Mark path-level changes of an updated ingress. Removed paths are kept
/// as DELETED until the store is cleaned.
fn merge_ingress(old: &Ingress, mut new: Ingress) -> Ingress {
    for (host, rule) in new.rules.iter_mut() {
        let old_rule = old.rules.get(host);
        for (key, path) in rule.paths.iter_mut() {
            path.status = match old_rule.and_then(|r| r.paths.get(key)) {
                None => Status::Added,
                Some(p) if p.status == Status::Deleted => Status::Added,
                Some(p) if IngressPath { status: path.status, ..p.clone() } != *path => {
                    Status::Modified
                }
                Some(p) => p.status,
            };
        }
        if let Some(old_rule) = old_rule {
            for (key, path) in &old_rule.paths {
                if !rule.paths.contains_key(key) {
                    rule.paths.insert(
                        key.clone(),
                        IngressPath {
                            status: Status::Deleted,
                            ..path.clone()
                        },
                    );
                }
            }
        }
    }
    for (host, rule) in &old.rules {
        if !new.rules.contains_key(host) {
            let mut removed = rule.clone();
            removed.status = Status::Deleted;
            removed.paths.values_mut().for_each(|p| p.status = Status::Deleted);
            new.rules.insert(host.clone(), removed);
        }
    }
    new
}

/// Fold a watch event into the store.
///
/// `configmap` names the main config map; other config maps are ignored.
/// Returns whether the store changed.
pub fn apply_event(k: &mut K8s, event: StoreEvent, configmap: Option<(&str, &str)>) -> bool {
    match event {
        StoreEvent::Apply(StoreObject::Ingress(new)) => {
            let ns = k.namespace_mut(&new.namespace);
            let old = ns.ingresses.get(&new.name);
            let changed = old.map_or(true, |old| without_status(old) != new);
            let Some(status) = next_status(old.map(|o| o.status), changed) else {
                return false;
            };
            let mut merged = match old {
                Some(old) => merge_ingress(old, new),
                None => new,
            };
            merged.status = status;
            ns.ingresses.insert(merged.name.clone(), merged);
            true
        }
        StoreEvent::Apply(StoreObject::IngressClass(mut new)) => {
            let old = k.ingress_classes.get(&new.name);
            let changed = old.map_or(true, |o| o.controller != new.controller);
            let Some(status) = next_status(old.map(|o| o.status), changed) else {
                return false;
            };
            new.status = status;
            k.ingress_classes.insert(new.name.clone(), new);
            true
        }
        StoreEvent::Apply(StoreObject::Service(mut new)) => {
            let ns = k.namespace_mut(&new.namespace);
            let old = ns.services.get(&new.name);
            let changed = old.map_or(true, |o| Service { status: Status::Empty, ..o.clone() } != new);
            let Some(status) = next_status(old.map(|o| o.status), changed) else {
                return false;
            };
            new.status = status;
            ns.services.insert(new.name.clone(), new);
            true
        }
        StoreEvent::Apply(StoreObject::Endpoints(mut new)) => {
            let ns = k.namespace_mut(&new.namespace);
            let old = ns.endpoints.get(&new.service);
            let changed = old.map_or(true, |o| Endpoints { status: Status::Empty, ..o.clone() } != new);
            let Some(status) = next_status(old.map(|o| o.status), changed) else {
                return false;
            };
            new.status = status;
            ns.endpoints.insert(new.service.clone(), new);
            true
        }
        StoreEvent::Apply(StoreObject::Secret(mut new)) => {
            let ns = k.namespace_mut(&new.namespace);
            let old = ns.secrets.get(&new.name);
            let changed = old.map_or(true, |o| o.data != new.data);
            let Some(status) = next_status(old.map(|o| o.status), changed) else {
                return false;
            };
            new.status = status;
            ns.secrets.insert(new.name.clone(), new);
            true
        }
        StoreEvent::Apply(StoreObject::ConfigMap(mut new)) => {
            if configmap != Some((new.namespace.as_str(), new.name.as_str())) {
                return false;
            }
            let main = &mut k.config_maps.main;
            if main.name == new.name && main.annotations == new.annotations {
                return false;
            }
            new.status = if main.name.is_empty() {
                Status::Added
            } else {
                Status::Modified
            };
            *main = new;
            true
        }
        StoreEvent::Delete(object) => delete_object(k, object, configmap),
    }
}

fn delete_object(k: &mut K8s, object: StoreObject, configmap: Option<(&str, &str)>) -> bool {
    fn mark<T>(map: &mut BTreeMap<String, T>, key: &str, status: impl FnOnce(&mut T)) -> bool {
        match map.get_mut(key) {
            Some(obj) => {
                status(obj);
                true
            }
            None => false,
        }
    }
    match object {
        StoreObject::Ingress(ing) => {
            let ns = k.namespace_mut(&ing.namespace);
            mark(&mut ns.ingresses, &ing.name, |i| i.status = Status::Deleted)
        }
        StoreObject::IngressClass(class) => {
            mark(&mut k.ingress_classes, &class.name, |c| c.status = Status::Deleted)
        }
        StoreObject::Service(svc) => {
            let ns = k.namespace_mut(&svc.namespace);
            mark(&mut ns.services, &svc.name, |s| s.status = Status::Deleted)
        }
        StoreObject::Endpoints(ep) => {
            let ns = k.namespace_mut(&ep.namespace);
            mark(&mut ns.endpoints, &ep.service, |e| e.status = Status::Deleted)
        }
        StoreObject::Secret(secret) => {
            let ns = k.namespace_mut(&secret.namespace);
            mark(&mut ns.secrets, &secret.name, |s| s.status = Status::Deleted)
        }
        StoreObject::ConfigMap(cm) => {
            if configmap != Some((cm.namespace.as_str(), cm.name.as_str())) {
                return false;
            }
            // options fall back to their defaults
            k.config_maps.main.annotations.clear();
            k.config_maps.main.status = Status::Modified;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressServiceBackend, IngressSpec,
        ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn k8s_ingress(paths: &[(&str, &str, i32)]) -> netv1::Ingress {
        let http_paths = paths
            .iter()
            .map(|(path, svc, port)| HTTPIngressPath {
                path: Some(path.to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: svc.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(*port),
                            name: None,
                        }),
                    }),
                    resource: None,
                },
            })
            .collect();
        netv1::Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("tollgate".to_string()),
                rules: Some(vec![netv1::IngressRule {
                    host: Some("example.com".to_string()),
                    http: Some(HTTPIngressRuleValue { paths: http_paths }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ingress_conversion() {
        let ing = ingress(&k8s_ingress(&[("/", "web-svc", 80), ("/api", "api-svc", 8080)]));
        assert_eq!(ing.namespace, "default");
        assert_eq!(ing.class, "tollgate");
        let rule = &ing.rules["example.com"];
        assert_eq!(rule.paths.len(), 2);
        assert_eq!(rule.paths["/api"].svc_name, "api-svc");
        assert_eq!(rule.paths["/api"].svc_port_int, 8080);
        assert_eq!(rule.paths["/"].path_type, PathType::Prefix);
    }

    #[test]
    fn test_endpoints_keep_ready_addresses_only() {
        let ep = corev1::Endpoints {
            metadata: ObjectMeta {
                name: Some("web-svc".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![corev1::EndpointSubset {
                addresses: Some(vec![corev1::EndpointAddress {
                    ip: "10.0.0.2".to_string(),
                    ..Default::default()
                }]),
                not_ready_addresses: Some(vec![corev1::EndpointAddress {
                    ip: "10.0.0.9".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![corev1::EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
            }]),
        };
        let converted = endpoints(&ep);
        assert_eq!(converted.ports["http"].addresses, vec!["10.0.0.2".to_string()]);
        assert_eq!(converted.ports["http"].port, 8080);
    }

    #[test]
    fn test_secret_data_is_copied() {
        let s = corev1::Secret {
            metadata: ObjectMeta {
                name: Some("tls".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(
                [("tls.crt".to_string(), ByteString(b"CERT".to_vec()))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        assert_eq!(secret(&s).data["tls.crt"], b"CERT".to_vec());
    }

    #[test]
    fn test_apply_event_statuses() {
        let mut k = K8s::new();
        let first = ingress(&k8s_ingress(&[("/", "web-svc", 80)]));
        assert!(apply_event(&mut k, StoreEvent::Apply(StoreObject::Ingress(first.clone())), None));
        assert_eq!(k.namespaces["default"].ingresses["web"].status, Status::Added);

        k.clean();
        assert!(
            !apply_event(&mut k, StoreEvent::Apply(StoreObject::Ingress(first)), None),
            "Resync of an unchanged object is not a change"
        );

        let second = ingress(&k8s_ingress(&[("/api", "api-svc", 8080)]));
        assert!(apply_event(&mut k, StoreEvent::Apply(StoreObject::Ingress(second.clone())), None));
        let stored = &k.namespaces["default"].ingresses["web"];
        assert_eq!(stored.status, Status::Modified);
        let paths = &stored.rules["example.com"].paths;
        assert_eq!(paths["/api"].status, Status::Added);
        assert_eq!(paths["/"].status, Status::Deleted, "Removed path kept until clean");

        assert!(apply_event(&mut k, StoreEvent::Delete(StoreObject::Ingress(second)), None));
        assert_eq!(k.namespaces["default"].ingresses["web"].status, Status::Deleted);
        k.clean();
        assert!(k.namespaces["default"].ingresses.is_empty());
    }

    #[test]
    fn test_only_main_config_map_is_tracked() {
        let mut k = K8s::new();
        let other = ConfigMap {
            namespace: "kube-system".to_string(),
            name: "coredns".to_string(),
            ..Default::default()
        };
        assert!(!apply_event(
            &mut k,
            StoreEvent::Apply(StoreObject::ConfigMap(other)),
            Some(("default", "tollgate"))
        ));

        let main = ConfigMap {
            namespace: "default".to_string(),
            name: "tollgate".to_string(),
            annotations: [("maxconn".to_string(), "2000".to_string())].into_iter().collect(),
            status: Status::Empty,
        };
        assert!(apply_event(
            &mut k,
            StoreEvent::Apply(StoreObject::ConfigMap(main)),
            Some(("default", "tollgate"))
        ));
        assert_eq!(k.config_maps.main.annotations["maxconn"], "2000");
        assert_eq!(k.config_maps.main.status, Status::Added);
    }
}
