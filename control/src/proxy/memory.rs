//! In-memory configuration API
//!
//! Holds a complete proxy configuration model behind a mutex. Used by the
//! binary in dry-run mode and by the tests, which inspect the resulting state
//! and the number of mutation calls a pass issued.

use crate::proxy::api::{ApiError, ConfigApi};
use async_trait::async_trait;
use common::{Backend, BackendSwitchingRule, Bind, Defaults, Frontend, Global, LogTarget, Server};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Safe mutex lock helper that recovers from poisoning
#[inline]
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned in memory config API, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Frontend with everything attached to it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontendState {
    pub frontend: Frontend,
    pub binds: Vec<Bind>,
    pub rules: Vec<String>,
    pub switching_rules: Vec<BackendSwitchingRule>,
    pub snippet: Vec<String>,
}

/// Backend with its servers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendState {
    pub backend: Backend,
    pub servers: Vec<Server>,
}

/// Complete proxy configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyState {
    pub global: Global,
    pub log_targets: Vec<LogTarget>,
    pub global_snippet: Vec<String>,
    pub defaults: Defaults,
    pub frontends: BTreeMap<String, FrontendState>,
    pub backends: BTreeMap<String, BackendState>,
    pub maps: BTreeMap<String, Vec<(String, String)>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: ProxyState,
    mutations: u64,
    /// Operations that fail once with a transport error
    failures: Vec<&'static str>,
}

impl Inner {
    fn check(&mut self, op: &'static str) -> Result<(), ApiError> {
        if let Some(pos) = self.failures.iter().position(|f| *f == op) {
            self.failures.remove(pos);
            return Err(ApiError::Transport(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

/// Configuration API backed by memory
#[derive(Debug, Default)]
pub struct MemoryConfigApi {
    inner: Mutex<Inner>,
}

fn frontend<'a>(state: &'a ProxyState, name: &str) -> Result<&'a FrontendState, ApiError> {
    state
        .frontends
        .get(name)
        .ok_or_else(|| ApiError::not_found("frontend", name))
}

fn frontend_mut<'a>(state: &'a mut ProxyState, name: &str) -> Result<&'a mut FrontendState, ApiError> {
    state
        .frontends
        .get_mut(name)
        .ok_or_else(|| ApiError::not_found("frontend", name))
}

fn backend<'a>(state: &'a ProxyState, name: &str) -> Result<&'a BackendState, ApiError> {
    state
        .backends
        .get(name)
        .ok_or_else(|| ApiError::not_found("backend", name))
}

fn backend_mut<'a>(state: &'a mut ProxyState, name: &str) -> Result<&'a mut BackendState, ApiError> {
    state
        .backends
        .get_mut(name)
        .ok_or_else(|| ApiError::not_found("backend", name))
}

fn renumber(rules: &mut [BackendSwitchingRule]) {
    for (i, rule) in rules.iter_mut().enumerate() {
        rule.index = Some(i as i64);
    }
}

impl MemoryConfigApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a frontend without counting it as a mutation
    pub fn seed_frontend(&self, frontend: Frontend, binds: Vec<Bind>) {
        let mut inner = safe_lock(&self.inner);
        inner.state.frontends.insert(
            frontend.name.clone(),
            FrontendState {
                frontend,
                binds,
                ..Default::default()
            },
        );
    }

    /// Install a backend without counting it as a mutation
    pub fn seed_backend(&self, backend: Backend, servers: Vec<Server>) {
        let mut inner = safe_lock(&self.inner);
        inner
            .state
            .backends
            .insert(backend.name.clone(), BackendState { backend, servers });
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> ProxyState {
        safe_lock(&self.inner).state.clone()
    }

    /// Number of successful mutation calls since creation or the last reset
    pub fn mutations(&self) -> u64 {
        safe_lock(&self.inner).mutations
    }

    pub fn reset_mutations(&self) {
        safe_lock(&self.inner).mutations = 0;
    }

    /// Make the next call of `op` (the trait method name) fail
    pub fn fail_next(&self, op: &'static str) {
        safe_lock(&self.inner).failures.push(op);
    }

    fn read<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&ProxyState) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut inner = safe_lock(&self.inner);
        inner.check(op)?;
        f(&inner.state)
    }

    fn write(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut ProxyState) -> Result<(), ApiError>,
    ) -> Result<(), ApiError> {
        let mut inner = safe_lock(&self.inner);
        inner.check(op)?;
        f(&mut inner.state)?;
        inner.mutations += 1;
        Ok(())
    }
}

#[async_trait]
impl ConfigApi for MemoryConfigApi {
    async fn global_get(&self) -> Result<Global, ApiError> {
        self.read("global_get", |s| Ok(s.global.clone()))
    }

    async fn global_push(&self, global: &Global) -> Result<(), ApiError> {
        self.write("global_push", |s| {
            s.global = global.clone();
            Ok(())
        })
    }

    async fn log_targets_get(&self) -> Result<Vec<LogTarget>, ApiError> {
        self.read("log_targets_get", |s| Ok(s.log_targets.clone()))
    }

    async fn log_targets_delete(&self) -> Result<(), ApiError> {
        self.write("log_targets_delete", |s| {
            s.log_targets.clear();
            Ok(())
        })
    }

    async fn log_targets_create(&self, targets: &[LogTarget]) -> Result<(), ApiError> {
        self.write("log_targets_create", |s| {
            s.log_targets.extend_from_slice(targets);
            Ok(())
        })
    }

    async fn global_snippet_get(&self) -> Result<Vec<String>, ApiError> {
        self.read("global_snippet_get", |s| Ok(s.global_snippet.clone()))
    }

    async fn global_snippet_set(&self, lines: &[String]) -> Result<(), ApiError> {
        self.write("global_snippet_set", |s| {
            s.global_snippet = lines.to_vec();
            Ok(())
        })
    }

    async fn defaults_get(&self) -> Result<Defaults, ApiError> {
        self.read("defaults_get", |s| Ok(s.defaults.clone()))
    }

    async fn defaults_push(&self, defaults: &Defaults) -> Result<(), ApiError> {
        self.write("defaults_push", |s| {
            s.defaults = defaults.clone();
            Ok(())
        })
    }

    async fn frontend_get(&self, name: &str) -> Result<Frontend, ApiError> {
        self.read("frontend_get", |s| Ok(frontend(s, name)?.frontend.clone()))
    }

    async fn frontend_create(&self, new: &Frontend) -> Result<(), ApiError> {
        self.write("frontend_create", |s| {
            if s.frontends.contains_key(&new.name) {
                return Err(ApiError::AlreadyExists {
                    kind: "frontend",
                    name: new.name.clone(),
                });
            }
            s.frontends.insert(
                new.name.clone(),
                FrontendState {
                    frontend: new.clone(),
                    ..Default::default()
                },
            );
            Ok(())
        })
    }

    async fn frontend_edit(&self, edited: &Frontend) -> Result<(), ApiError> {
        self.write("frontend_edit", |s| {
            frontend_mut(s, &edited.name)?.frontend = edited.clone();
            Ok(())
        })
    }

    async fn frontend_delete(&self, name: &str) -> Result<(), ApiError> {
        self.write("frontend_delete", |s| {
            s.frontends
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ApiError::not_found("frontend", name))
        })
    }

    async fn frontend_binds_get(&self, name: &str) -> Result<Vec<Bind>, ApiError> {
        self.read("frontend_binds_get", |s| Ok(frontend(s, name)?.binds.clone()))
    }

    async fn frontend_bind_create(&self, name: &str, bind: &Bind) -> Result<(), ApiError> {
        self.write("frontend_bind_create", |s| {
            let ft = frontend_mut(s, name)?;
            if ft.binds.iter().any(|b| b.name == bind.name) {
                return Err(ApiError::AlreadyExists {
                    kind: "bind",
                    name: bind.name.clone(),
                });
            }
            ft.binds.push(bind.clone());
            Ok(())
        })
    }

    async fn frontend_bind_edit(&self, name: &str, bind: &Bind) -> Result<(), ApiError> {
        self.write("frontend_bind_edit", |s| {
            let ft = frontend_mut(s, name)?;
            let existing = ft
                .binds
                .iter_mut()
                .find(|b| b.name == bind.name)
                .ok_or_else(|| ApiError::not_found("bind", &bind.name))?;
            *existing = bind.clone();
            Ok(())
        })
    }

    async fn frontend_enable_ssl_offload(
        &self,
        name: &str,
        cert_dir: &str,
        alpn: &str,
    ) -> Result<(), ApiError> {
        self.write("frontend_enable_ssl_offload", |s| {
            for bind in frontend_mut(s, name)?.binds.iter_mut() {
                bind.ssl = true;
                bind.ssl_certificate = cert_dir.to_string();
                bind.alpn = alpn.to_string();
            }
            Ok(())
        })
    }

    async fn frontend_disable_ssl_offload(&self, name: &str) -> Result<(), ApiError> {
        self.write("frontend_disable_ssl_offload", |s| {
            for bind in frontend_mut(s, name)?.binds.iter_mut() {
                bind.ssl = false;
                bind.ssl_certificate.clear();
                bind.alpn.clear();
            }
            Ok(())
        })
    }

    async fn frontend_rules_replace(&self, name: &str, rules: &[String]) -> Result<(), ApiError> {
        self.write("frontend_rules_replace", |s| {
            frontend_mut(s, name)?.rules = rules.to_vec();
            Ok(())
        })
    }

    async fn frontend_snippet_get(&self, name: &str) -> Result<Vec<String>, ApiError> {
        self.read("frontend_snippet_get", |s| Ok(frontend(s, name)?.snippet.clone()))
    }

    async fn frontend_snippet_set(&self, name: &str, lines: &[String]) -> Result<(), ApiError> {
        self.write("frontend_snippet_set", |s| {
            frontend_mut(s, name)?.snippet = lines.to_vec();
            Ok(())
        })
    }

    async fn backend_switching_rules_get(
        &self,
        name: &str,
    ) -> Result<Vec<BackendSwitchingRule>, ApiError> {
        self.read("backend_switching_rules_get", |s| {
            Ok(frontend(s, name)?.switching_rules.clone())
        })
    }

    async fn backend_switching_rule_create(
        &self,
        name: &str,
        rule: &BackendSwitchingRule,
    ) -> Result<(), ApiError> {
        self.write("backend_switching_rule_create", |s| {
            let rules = &mut frontend_mut(s, name)?.switching_rules;
            let index = rule
                .index
                .map_or(rules.len(), |i| (i.max(0) as usize).min(rules.len()));
            rules.insert(index, rule.clone());
            renumber(rules);
            Ok(())
        })
    }

    async fn backend_switching_rule_delete(&self, name: &str, index: i64) -> Result<(), ApiError> {
        self.write("backend_switching_rule_delete", |s| {
            let rules = &mut frontend_mut(s, name)?.switching_rules;
            let Some(pos) = usize::try_from(index).ok().filter(|i| *i < rules.len()) else {
                return Err(ApiError::not_found("backend switching rule", &index.to_string()));
            };
            rules.remove(pos);
            renumber(rules);
            Ok(())
        })
    }

    async fn backends_get(&self) -> Result<Vec<Backend>, ApiError> {
        self.read("backends_get", |s| {
            Ok(s.backends.values().map(|b| b.backend.clone()).collect())
        })
    }

    async fn backend_get(&self, name: &str) -> Result<Backend, ApiError> {
        self.read("backend_get", |s| Ok(backend(s, name)?.backend.clone()))
    }

    async fn backend_create(&self, new: &Backend) -> Result<(), ApiError> {
        self.write("backend_create", |s| {
            if s.backends.contains_key(&new.name) {
                return Err(ApiError::AlreadyExists {
                    kind: "backend",
                    name: new.name.clone(),
                });
            }
            s.backends.insert(
                new.name.clone(),
                BackendState {
                    backend: new.clone(),
                    servers: vec![],
                },
            );
            Ok(())
        })
    }

    async fn backend_edit(&self, edited: &Backend) -> Result<(), ApiError> {
        self.write("backend_edit", |s| {
            backend_mut(s, &edited.name)?.backend = edited.clone();
            Ok(())
        })
    }

    async fn backend_delete(&self, name: &str) -> Result<(), ApiError> {
        self.write("backend_delete", |s| {
            s.backends
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ApiError::not_found("backend", name))
        })
    }

    async fn backend_servers_get(&self, name: &str) -> Result<Vec<Server>, ApiError> {
        self.read("backend_servers_get", |s| Ok(backend(s, name)?.servers.clone()))
    }

    async fn backend_server_create(&self, name: &str, server: &Server) -> Result<(), ApiError> {
        self.write("backend_server_create", |s| {
            let be = backend_mut(s, name)?;
            if be.servers.iter().any(|srv| srv.name == server.name) {
                return Err(ApiError::AlreadyExists {
                    kind: "server",
                    name: server.name.clone(),
                });
            }
            be.servers.push(server.clone());
            Ok(())
        })
    }

    async fn backend_server_edit(&self, name: &str, server: &Server) -> Result<(), ApiError> {
        self.write("backend_server_edit", |s| {
            let existing = backend_mut(s, name)?
                .servers
                .iter_mut()
                .find(|srv| srv.name == server.name)
                .ok_or_else(|| ApiError::not_found("server", &server.name))?;
            *existing = server.clone();
            Ok(())
        })
    }

    async fn backend_server_delete(&self, name: &str, server: &str) -> Result<(), ApiError> {
        self.write("backend_server_delete", |s| {
            let be = backend_mut(s, name)?;
            let before = be.servers.len();
            be.servers.retain(|srv| srv.name != server);
            if be.servers.len() == before {
                return Err(ApiError::not_found("server", server));
            }
            Ok(())
        })
    }

    async fn map_replace(&self, map: &str, entries: &[(String, String)]) -> Result<(), ApiError> {
        self.write("map_replace", |s| {
            s.maps.insert(map.to_string(), entries.to_vec());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutations_are_counted() {
        let api = MemoryConfigApi::new();
        api.backend_create(&Backend {
            name: "web".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let _ = api.backend_get("web").await.unwrap();
        assert_eq!(api.mutations(), 1, "reads must not count as mutations");

        let failed = api.backend_delete("missing").await;
        assert!(failed.unwrap_err().is_not_found());
        assert_eq!(api.mutations(), 1, "failed calls must not count");
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let api = MemoryConfigApi::new();
        api.fail_next("global_get");
        assert!(matches!(api.global_get().await, Err(ApiError::Transport(_))));
        assert!(api.global_get().await.is_ok());
    }

    #[tokio::test]
    async fn test_switching_rules_are_renumbered() {
        let api = MemoryConfigApi::new();
        api.seed_frontend(
            Frontend {
                name: "http".to_string(),
                ..Default::default()
            },
            vec![],
        );
        for name in ["a", "b"] {
            api.backend_switching_rule_create(
                "http",
                &BackendSwitchingRule {
                    index: Some(0),
                    name: name.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let rules = api.backend_switching_rules_get("http").await.unwrap();
        assert_eq!(rules[0].name, "b");
        assert_eq!(rules[1].index, Some(1));

        api.backend_switching_rule_delete("http", 0).await.unwrap();
        let rules = api.backend_switching_rules_get("http").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "a");
        assert_eq!(rules[0].index, Some(0));
    }
}
