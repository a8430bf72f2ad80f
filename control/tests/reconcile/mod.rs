//! Fixtures for reconciliation tests
//!
//! A store with one namespace, a controller wired to an in-memory
//! configuration API seeded with the frontends a deployment ships, and a
//! throwaway certificate directory.

#![allow(dead_code)]

use common::{Bind, Frontend};
use control::config::ControllerConfig;
use control::controller::https::Https;
use control::controller::Controller;
use control::proxy::certs::SecretCertificates;
use control::proxy::memory::MemoryConfigApi;
use control::store::{
    Annotations, Endpoints, Ingress, IngressPath, IngressRule, K8s, PortEndpoints, Secret, Service,
    ServicePort,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("tollgate-{prefix}-{}-{n}", std::process::id()))
}

pub fn annotations(pairs: &[(&str, &str)]) -> Annotations {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub struct Harness {
    pub api: Arc<MemoryConfigApi>,
    pub controller: Controller,
    pub cert_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(mut config: ControllerConfig) -> Self {
        let cert_dir = temp_dir("certs");
        config.env.cert_dir = cert_dir.display().to_string();
        config.env.map_dir = "/etc/tollgate/maps".to_string();

        let api = Arc::new(MemoryConfigApi::new());
        api.seed_frontend(
            Frontend {
                name: config.frontends.http.clone(),
                ..Default::default()
            },
            vec![Bind {
                name: "v4".to_string(),
                address: "0.0.0.0".to_string(),
                port: Some(80),
                ..Default::default()
            }],
        );
        api.seed_frontend(
            Frontend {
                name: config.frontends.https.clone(),
                ..Default::default()
            },
            Https::new(&config.https, &config.env.cert_dir).bind_list(false),
        );
        api.seed_frontend(
            Frontend {
                name: config.frontends.stats.clone(),
                ..Default::default()
            },
            vec![],
        );

        let certificates = Box::new(SecretCertificates::new(&cert_dir));
        let controller = Controller::new(config, api.clone(), certificates);
        Self {
            api,
            controller,
            cert_dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.cert_dir);
    }
}

/// Store with service `default/web-svc` (port 80 → 8080) and its endpoints
pub fn store(addresses: &[&str]) -> K8s {
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

/// Ingress `default/<name>` of class `tollgate` routing `example.com/` to `web-svc:80`
pub fn web_ingress(name: &str, pairs: &[(&str, &str)]) -> Ingress {
    let path = IngressPath {
        path: "/".to_string(),
        svc_name: "web-svc".to_string(),
        svc_port_int: 80,
        ..Default::default()
    };
    let mut merged = annotations(pairs);
    merged
        .entry("kubernetes.io/ingress.class".to_string())
        .or_insert_with(|| "tollgate".to_string());
    Ingress {
        namespace: "default".to_string(),
        name: name.to_string(),
        annotations: merged,
        rules: [(
            "example.com".to_string(),
            IngressRule {
                host: "example.com".to_string(),
                paths: [("/".to_string(), path)].into_iter().collect(),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    }
}

pub fn add_ingress(k: &mut K8s, ingress: Ingress) {
    k.namespace_mut(&ingress.namespace.clone())
        .ingresses
        .insert(ingress.name.clone(), ingress);
}

pub fn add_secret(k: &mut K8s, namespace: &str, name: &str, data: &[(&str, &str)]) {
    k.namespace_mut(namespace).secrets.insert(
        name.to_string(),
        Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
            ..Default::default()
        },
    );
}
