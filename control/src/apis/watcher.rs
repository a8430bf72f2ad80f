//! Kubernetes watch loop
//!
//! One watcher task per resource kind feeds converted events into a channel.
//! A single consumer folds them into the store and, once events stop arriving
//! for the sync period, runs a reconciliation pass.

use crate::apis::convert::{self, apply_event, StoreEvent, StoreObject};
use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::store::K8s;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 1024;

/// Watch one resource kind until the receiver goes away
pub async fn watch_resource<K>(
    api: Api<K>,
    kind: &'static str,
    convert: fn(&K) -> StoreObject,
    tx: mpsc::Sender<StoreEvent>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let watcher = watcher(api, WatcherConfig::default());
    futures::pin_mut!(watcher);

    info!(kind, "Starting watcher");

    while let Some(event) = watcher.next().await {
        let event = match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                StoreEvent::Apply(convert(&obj))
            }
            Ok(watcher::Event::Delete(obj)) => StoreEvent::Delete(convert(&obj)),
            Ok(watcher::Event::Init) => {
                debug!(kind, "Watcher initialized");
                continue;
            }
            Ok(watcher::Event::InitDone) => {
                info!(kind, "Watcher initial sync complete");
                continue;
            }
            Err(e) => {
                warn!(kind, error = %e, "Watcher error");
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            debug!(kind, "Store consumer gone, stopping watcher");
            return;
        }
    }
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Spawn a watcher per resource kind the store holds
pub fn spawn_watchers(
    client: &Client,
    options: &ControllerConfig,
    tx: &mpsc::Sender<StoreEvent>,
) -> Vec<JoinHandle<()>> {
    let namespace = options.watch_namespace.as_deref();
    let mut handles = vec![
        tokio::spawn(watch_resource(
            scoped::<Ingress>(client, namespace),
            "Ingress",
            |obj| StoreObject::Ingress(convert::ingress(obj)),
            tx.clone(),
        )),
        tokio::spawn(watch_resource(
            Api::<IngressClass>::all(client.clone()),
            "IngressClass",
            |obj| StoreObject::IngressClass(convert::ingress_class(obj)),
            tx.clone(),
        )),
        tokio::spawn(watch_resource(
            scoped::<Service>(client, namespace),
            "Service",
            |obj| StoreObject::Service(convert::service(obj)),
            tx.clone(),
        )),
        tokio::spawn(watch_resource(
            scoped::<Endpoints>(client, namespace),
            "Endpoints",
            |obj| StoreObject::Endpoints(convert::endpoints(obj)),
            tx.clone(),
        )),
        tokio::spawn(watch_resource(
            scoped::<Secret>(client, namespace),
            "Secret",
            |obj| StoreObject::Secret(convert::secret(obj)),
            tx.clone(),
        )),
    ];
    match options.configmap_ref() {
        Some((ns, _)) => handles.push(tokio::spawn(watch_resource(
            Api::<ConfigMap>::namespaced(client.clone(), ns),
            "ConfigMap",
            |obj| StoreObject::ConfigMap(convert::config_map(obj)),
            tx.clone(),
        ))),
        None => warn!(configmap = %options.configmap, "Invalid config map reference, using defaults"),
    }
    handles
}

/// Consume store events and run a pass after each quiet period.
///
/// Returns when every sender is dropped.
pub async fn run(mut controller: Controller, mut rx: mpsc::Receiver<StoreEvent>) {
    let sync_period = Duration::from_millis(controller.options().sync_period_ms);
    let configmap = controller
        .options()
        .configmap_ref()
        .map(|(ns, name)| (ns.to_string(), name.to_string()));
    let mut k = K8s::new();
    let mut pending = false;

    loop {
        let event = if pending {
            match tokio::time::timeout(sync_period, rx.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    let result = controller.run_pass(&k).await;
                    if result.restart {
                        info!("Proxy restart required");
                    } else if result.reload {
                        info!("Proxy reload required");
                    }
                    k.clean();
                    pending = false;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };
        let Some(event) = event else {
            info!("Store event channel closed");
            return;
        };
        let configmap_ref = configmap.as_ref().map(|(ns, name)| (ns.as_str(), name.as_str()));
        pending |= apply_event(&mut k, event, configmap_ref);
    }
}

/// Channel connecting the watchers to [`run`]
pub fn channel() -> (mpsc::Sender<StoreEvent>, mpsc::Receiver<StoreEvent>) {
    mpsc::channel(EVENT_BUFFER)
}
