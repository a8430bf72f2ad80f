//! Route registration
//!
//! A route ties a host/path (or an SNI hostname for passthrough) to a
//! backend. Standard routes are map-file entries; custom routes are
//! `use_backend <backend> if <acl>` switching rules driven by the service's
//! `route-acl` annotation.

use crate::error::ControllerError;
use crate::proxy::api::ConfigApi;
use crate::proxy::maps::{MapFiles, MapId};
use crate::proxy::rules::RuleId;
use crate::store::PathType;
use common::BackendSwitchingRule;
use std::collections::BTreeMap;
use tracing::info;

/// Route of one ingress path
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub host: String,
    pub path: String,
    pub path_type: PathType,
    pub backend_name: String,
    pub ssl_passthrough: bool,
    /// Ingress-scoped rules that apply to this route
    pub rule_ids: Vec<RuleId>,
}

impl Route {
    /// Map value: the backend name followed by the route's rule ids
    pub fn map_value(&self) -> String {
        let mut value = self.backend_name.clone();
        for id in &self.rule_ids {
            value.push('.');
            value.push_str(&id.to_string());
        }
        value
    }
}

/// Custom routes currently installed, keyed by backend name
#[derive(Debug, Default)]
pub struct CustomRoutes {
    routes: BTreeMap<String, String>,
}

impl CustomRoutes {
    pub fn acl(&self, backend: &str) -> Option<&str> {
        self.routes.get(backend).map(String::as_str)
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.routes.contains_key(backend)
    }

    pub fn insert(&mut self, backend: &str, acl: &str) {
        self.routes.insert(backend.to_string(), acl.to_string());
    }

    pub fn remove(&mut self, backend: &str) -> Option<String> {
        self.routes.remove(backend)
    }
}

/// Register a host/path route (or an SNI route for passthrough) in the maps
pub fn add_host_path_route(route: &Route, maps: &mut MapFiles) -> Result<(), ControllerError> {
    if route.backend_name.is_empty() {
        return Err(ControllerError::Rule(format!(
            "route {}{} has no backend",
            route.host, route.path
        )));
    }
    if route.ssl_passthrough {
        if route.host.is_empty() {
            return Err(ControllerError::Rule(format!(
                "SSL passthrough route to '{}' needs a host",
                route.backend_name
            )));
        }
        maps.insert(MapId::Sni, route.host.clone(), route.backend_name.clone());
        return Ok(());
    }

    if !route.host.is_empty() {
        maps.insert(MapId::Host, route.host.clone(), route.host.clone());
    }
    let path = if route.path.is_empty() {
        "/"
    } else {
        route.path.as_str()
    };
    let map = match route.path_type {
        PathType::Exact => MapId::PathExact,
        PathType::Prefix | PathType::ImplementationSpecific => MapId::PathPrefix,
    };
    maps.insert(map, format!("{}{}", route.host, path), route.map_value());
    Ok(())
}

async fn delete_switching_rules(
    api: &dyn ConfigApi,
    frontend: &str,
    backend: &str,
) -> Result<(), ControllerError> {
    let rules = api.backend_switching_rules_get(frontend).await?;
    // highest index first so the remaining indexes stay valid
    for rule in rules.iter().rev().filter(|r| r.name == backend) {
        if let Some(index) = rule.index {
            api.backend_switching_rule_delete(frontend, index).await?;
        }
    }
    Ok(())
}

/// Install (or refresh) a custom ACL route on the given frontends.
///
/// Returns whether the proxy configuration changed.
pub async fn add_custom_route(
    route: &Route,
    acl: &str,
    custom_routes: &mut CustomRoutes,
    api: &dyn ConfigApi,
    frontends: &[&str],
) -> Result<bool, ControllerError> {
    if custom_routes.acl(&route.backend_name) == Some(acl) {
        return Ok(false);
    }
    for frontend in frontends {
        delete_switching_rules(api, frontend, &route.backend_name).await?;
        api.backend_switching_rule_create(
            frontend,
            &BackendSwitchingRule {
                index: None,
                name: route.backend_name.clone(),
                cond: "if".to_string(),
                cond_test: acl.to_string(),
            },
        )
        .await?;
    }
    custom_routes.insert(&route.backend_name, acl);
    info!(backend = %route.backend_name, acl = %acl, "Custom route installed");
    Ok(true)
}

/// Remove a custom route that is no longer requested
pub async fn remove_custom_route(
    backend: &str,
    custom_routes: &mut CustomRoutes,
    api: &dyn ConfigApi,
    frontends: &[&str],
) -> Result<bool, ControllerError> {
    if !custom_routes.contains(backend) {
        return Ok(false);
    }
    for frontend in frontends {
        delete_switching_rules(api, frontend, backend).await?;
    }
    custom_routes.remove(backend);
    info!(backend = %backend, "Custom route removed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::memory::MemoryConfigApi;
    use crate::proxy::rules::Rule;
    use common::Frontend;

    fn route(host: &str, path: &str) -> Route {
        Route {
            host: host.to_string(),
            path: path.to_string(),
            backend_name: "default-web-svc-80".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_host_path_route() {
        let mut maps = MapFiles::new("/maps");
        add_host_path_route(&route("example.com", "/"), &mut maps).unwrap();
        assert_eq!(maps.get(MapId::Host, "example.com"), Some("example.com"));
        assert_eq!(
            maps.get(MapId::PathPrefix, "example.com/"),
            Some("default-web-svc-80")
        );
        assert_eq!(maps.get(MapId::PathExact, "example.com/"), None);
    }

    #[test]
    fn test_route_value_carries_rule_ids() {
        let id = Rule::AcceptContent.id();
        let mut r = route("example.com", "/api");
        r.path_type = PathType::Exact;
        r.rule_ids = vec![id];
        let mut maps = MapFiles::new("/maps");
        add_host_path_route(&r, &mut maps).unwrap();
        assert_eq!(
            maps.get(MapId::PathExact, "example.com/api"),
            Some(format!("default-web-svc-80.{id}").as_str())
        );
    }

    #[test]
    fn test_passthrough_route_goes_to_sni_map() {
        let mut r = route("secure.example.com", "/");
        r.ssl_passthrough = true;
        let mut maps = MapFiles::new("/maps");
        add_host_path_route(&r, &mut maps).unwrap();
        assert_eq!(
            maps.get(MapId::Sni, "secure.example.com"),
            Some("default-web-svc-80")
        );
        assert_eq!(maps.get(MapId::PathPrefix, "secure.example.com/"), None);

        r.host.clear();
        assert!(add_host_path_route(&r, &mut maps).is_err());
    }

    #[tokio::test]
    async fn test_custom_route_lifecycle() {
        let api = MemoryConfigApi::new();
        for name in ["http", "https"] {
            api.seed_frontend(
                Frontend {
                    name: name.to_string(),
                    ..Default::default()
                },
                vec![],
            );
        }
        let mut custom = CustomRoutes::default();
        let r = route("example.com", "/");

        let changed = add_custom_route(&r, "{ path_beg /v1 }", &mut custom, &api, &["http", "https"])
            .await
            .unwrap();
        assert!(changed);
        let unchanged = add_custom_route(&r, "{ path_beg /v1 }", &mut custom, &api, &["http", "https"])
            .await
            .unwrap();
        assert!(!unchanged, "same ACL must be a no-op");

        add_custom_route(&r, "{ path_beg /v2 }", &mut custom, &api, &["http", "https"])
            .await
            .unwrap();
        let rules = api.backend_switching_rules_get("http").await.unwrap();
        assert_eq!(rules.len(), 1, "changed ACL replaces the previous rule");
        assert_eq!(rules[0].cond_test, "{ path_beg /v2 }");

        assert!(remove_custom_route(&r.backend_name, &mut custom, &api, &["http", "https"])
            .await
            .unwrap());
        assert!(!custom.contains(&r.backend_name));
        assert!(api.backend_switching_rules_get("https").await.unwrap().is_empty());
    }
}
