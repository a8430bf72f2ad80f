//! Frontend request rules
//!
//! Rules are typed request-processing directives (redirects, ACL denies,
//! captures, rate limits, ...) attached to frontends. Each rule has a stable
//! content-derived [`RuleId`], so re-adding an identical rule is a no-op and
//! routes can reference the ingress-scoped rules that apply to them.
//!
//! The [`RuleRegistry`] is rebuilt on every pass. It keeps, per frontend, the
//! rendered directives last pushed to the configuration API and only pushes a
//! frontend again when its rendering changed.

use crate::error::ControllerError;
use crate::proxy::api::{ApiError, ConfigApi};
use common::{fnv1a_hash, Mode};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Content-derived rule identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Origin of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// From the config map, applies to all traffic of the frontend
    Global,
    /// From an ingress, applies only to requests routed through that ingress
    Ingress,
}

/// Request-processing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Redirect to HTTPS (`ssl_redirect`) or to another host
    RequestRedirect {
        ssl_redirect: bool,
        host: String,
        port: Option<i64>,
        code: i64,
    },
    /// Deny requests by source address. With `allow_list` only listed sources pass.
    Deny {
        src_ips: Vec<String>,
        allow_list: bool,
    },
    Capture {
        expression: String,
        len: i64,
    },
    /// Track the source in a stick table and deny above `requests` per period
    RateLimit {
        table: String,
        period_ms: i64,
        size: i64,
        requests: i64,
        deny_status: i64,
    },
    SetHeader {
        name: String,
        value: String,
    },
    /// Accept the connection once a TLS ClientHello was seen
    AcceptContent,
    InspectDelay {
        timeout_ms: i64,
    },
    /// Set a transaction variable, with an optional expression used when the
    /// first one yields nothing
    SetVariable {
        name: String,
        expression: String,
        fallback: Option<String>,
    },
}

impl Rule {
    /// Stable identity derived from the rule content
    pub fn id(&self) -> RuleId {
        RuleId(fnv1a_hash(format!("{self:?}").as_bytes()))
    }

    /// Evaluation order inside a frontend
    fn priority(&self) -> u8 {
        match self {
            Rule::InspectDelay { .. } => 0,
            Rule::AcceptContent => 1,
            Rule::SetVariable { .. } => 2,
            Rule::RequestRedirect { .. } => 3,
            Rule::Deny { .. } => 4,
            Rule::RateLimit { .. } => 5,
            Rule::Capture { .. } => 6,
            Rule::SetHeader { .. } => 7,
        }
    }

    /// Render the rule as frontend directives for a frontend in `mode`.
    ///
    /// Rules with no meaning in TCP mode render to nothing there.
    pub fn render(&self, mode: Mode) -> Vec<String> {
        let tcp = mode == Mode::Tcp;
        match self {
            Rule::RequestRedirect { .. } if tcp => vec![],
            Rule::RequestRedirect {
                ssl_redirect: true,
                port,
                code,
                ..
            } => match port {
                Some(port) => vec![format!(
                    "http-request redirect location https://%[req.hdr(host),field(1,:)]:{port}%[capture.req.uri] code {code} if !{{ ssl_fc }}"
                )],
                None => vec![format!(
                    "http-request redirect scheme https code {code} if !{{ ssl_fc }}"
                )],
            },
            Rule::RequestRedirect { host, code, .. } => vec![format!(
                "http-request redirect location //{host}%[capture.req.uri] code {code}"
            )],
            Rule::Deny {
                src_ips,
                allow_list,
            } => {
                let negate = if *allow_list { "!" } else { "" };
                let action = if tcp {
                    "tcp-request content reject"
                } else {
                    "http-request deny"
                };
                vec![format!("{action} if {negate}{{ src {} }}", src_ips.join(" "))]
            }
            Rule::Capture { expression, len } => {
                let directive = if tcp {
                    "tcp-request content capture"
                } else {
                    "http-request capture"
                };
                vec![format!("{directive} {expression} len {len}")]
            }
            Rule::RateLimit {
                table,
                requests,
                deny_status,
                ..
            } => {
                if tcp {
                    vec![
                        format!("tcp-request content track-sc0 src table {table}"),
                        format!("tcp-request content reject if {{ sc_http_req_rate(0) gt {requests} }}"),
                    ]
                } else {
                    vec![
                        format!("http-request track-sc0 src table {table}"),
                        format!(
                            "http-request deny deny_status {deny_status} if {{ sc_http_req_rate(0) gt {requests} }}"
                        ),
                    ]
                }
            }
            Rule::SetHeader { .. } if tcp => vec![],
            Rule::SetHeader { name, value } => {
                vec![format!("http-request set-header {name} {value}")]
            }
            Rule::AcceptContent => {
                vec!["tcp-request content accept if { req_ssl_hello_type 1 }".to_string()]
            }
            Rule::InspectDelay { timeout_ms } => {
                vec![format!("tcp-request inspect-delay {timeout_ms}")]
            }
            Rule::SetVariable {
                name,
                expression,
                fallback,
            } => {
                let directive = if tcp {
                    "tcp-request content set-var"
                } else {
                    "http-request set-var"
                };
                let mut lines = vec![format!("{directive}({name}) {expression}")];
                if let Some(fallback) = fallback {
                    lines.push(format!(
                        "{directive}({name}) {fallback} if !{{ var({name}) -m found }}"
                    ));
                }
                lines
            }
        }
    }
}

/// Condition restricting an ingress-scoped rule to the routes that carry its id
pub fn route_condition(id: RuleId) -> String {
    format!("{{ var(txn.path_match) -m sub {id} }}")
}

fn scoped(line: String, scope: RuleScope, id: RuleId) -> String {
    if scope == RuleScope::Global {
        return line;
    }
    let cond = route_condition(id);
    if line.contains(" if ") {
        format!("{line} {cond}")
    } else {
        format!("{line} if {cond}")
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: RuleId,
    rule: Rule,
    scope: RuleScope,
}

#[derive(Debug, Default)]
struct FrontendRules {
    entries: Vec<Entry>,
    /// Directives last pushed for this frontend
    applied: Option<Vec<String>>,
}

/// Per-frontend rule registry
#[derive(Debug, Default)]
pub struct RuleRegistry {
    frontends: BTreeMap<String, FrontendRules>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule to a frontend.
    ///
    /// A rule whose id is already present on the frontend is ignored.
    pub fn add_rule(
        &mut self,
        rule: Rule,
        scope: RuleScope,
        frontend: &str,
    ) -> Result<(), ControllerError> {
        if frontend.is_empty() {
            return Err(ControllerError::Rule(format!("no frontend for rule {rule:?}")));
        }
        let id = rule.id();
        let rules = self.frontends.entry(frontend.to_string()).or_default();
        if rules.entries.iter().any(|e| e.id == id) {
            return Ok(());
        }
        let priority = rule.priority();
        let position = rules
            .entries
            .iter()
            .position(|e| e.rule.priority() > priority)
            .unwrap_or(rules.entries.len());
        rules.entries.insert(position, Entry { id, rule, scope });
        Ok(())
    }

    /// Rules currently registered on a frontend, in evaluation order
    pub fn rules(&self, frontend: &str) -> Vec<&Rule> {
        self.frontends
            .get(frontend)
            .map(|r| r.entries.iter().map(|e| &e.rule).collect())
            .unwrap_or_default()
    }

    /// Drop a frontend with its rules and applied state
    pub fn delete_frontend(&mut self, frontend: &str) {
        self.frontends.remove(frontend);
    }

    /// Remove every rule of the given scope, on all frontends
    pub fn remove_scope(&mut self, scope: RuleScope) {
        for rules in self.frontends.values_mut() {
            rules.entries.retain(|e| e.scope != scope);
        }
    }

    /// Forget all rules while keeping track of what was last pushed
    pub fn reset(&mut self) {
        for rules in self.frontends.values_mut() {
            rules.entries.clear();
        }
    }

    /// Directives for a frontend in evaluation order
    pub fn render(&self, frontend: &str, mode: Mode) -> Vec<String> {
        let Some(rules) = self.frontends.get(frontend) else {
            return vec![];
        };
        rules
            .entries
            .iter()
            .flat_map(|e| {
                e.rule
                    .render(mode)
                    .into_iter()
                    .map(move |line| scoped(line, e.scope, e.id))
            })
            .collect()
    }

    /// Push the rendering of every frontend whose directives changed.
    ///
    /// Frontends listed in `tcp_frontends` are rendered in TCP mode. Returns
    /// whether anything was pushed.
    pub async fn refresh(
        &mut self,
        api: &dyn ConfigApi,
        tcp_frontends: &[&str],
    ) -> Result<bool, ApiError> {
        let mut reload = false;
        let names: Vec<String> = self.frontends.keys().cloned().collect();
        for name in names {
            let mode = if tcp_frontends.contains(&name.as_str()) {
                Mode::Tcp
            } else {
                Mode::Http
            };
            let rendered = self.render(&name, mode);
            let Some(rules) = self.frontends.get_mut(&name) else {
                continue;
            };
            let unchanged = match &rules.applied {
                Some(applied) => applied == &rendered,
                None => rendered.is_empty(),
            };
            if unchanged {
                continue;
            }
            api.frontend_rules_replace(&name, &rendered).await?;
            debug!(frontend = %name, rules = rendered.len(), "Frontend rules updated");
            rules.applied = Some(rendered);
            reload = true;
        }
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny(ip: &str) -> Rule {
        Rule::Deny {
            src_ips: vec![ip.to_string()],
            allow_list: false,
        }
    }

    #[test]
    fn test_rule_id_is_content_derived() {
        assert_eq!(deny("10.0.0.1").id(), deny("10.0.0.1").id());
        assert_ne!(deny("10.0.0.1").id(), deny("10.0.0.2").id());
        assert_eq!(deny("10.0.0.1").id().to_string().len(), 16);
    }

    #[test]
    fn test_add_rule_deduplicates() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(deny("10.0.0.1"), RuleScope::Global, "http").unwrap();
        registry.add_rule(deny("10.0.0.1"), RuleScope::Global, "http").unwrap();
        assert_eq!(registry.rules("http").len(), 1);
    }

    #[test]
    fn test_add_rule_requires_frontend() {
        let mut registry = RuleRegistry::new();
        assert!(registry.add_rule(deny("10.0.0.1"), RuleScope::Global, "").is_err());
    }

    #[test]
    fn test_rules_ordered_by_kind() {
        let mut registry = RuleRegistry::new();
        registry
            .add_rule(
                Rule::SetHeader {
                    name: "X-Env".to_string(),
                    value: "prod".to_string(),
                },
                RuleScope::Global,
                "http",
            )
            .unwrap();
        registry.add_rule(deny("10.0.0.1"), RuleScope::Global, "http").unwrap();
        let rules = registry.rules("http");
        assert!(matches!(rules[0], Rule::Deny { .. }));
        assert!(matches!(rules[1], Rule::SetHeader { .. }));
    }

    #[test]
    fn test_ingress_scope_adds_route_condition() {
        let mut registry = RuleRegistry::new();
        let rule = deny("10.0.0.1");
        let id = rule.id();
        registry.add_rule(rule, RuleScope::Ingress, "http").unwrap();
        let rendered = registry.render("http", Mode::Http);
        assert_eq!(
            rendered,
            vec![format!(
                "http-request deny if {{ src 10.0.0.1 }} {{ var(txn.path_match) -m sub {id} }}"
            )]
        );
    }

    #[test]
    fn test_remove_scope_keeps_global_rules() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(deny("10.0.0.1"), RuleScope::Global, "http").unwrap();
        registry.add_rule(deny("10.0.0.2"), RuleScope::Ingress, "http").unwrap();
        registry.remove_scope(RuleScope::Ingress);
        assert_eq!(registry.rules("http"), vec![&deny("10.0.0.1")]);
    }

    #[test]
    fn test_tcp_rendering() {
        let rule = Rule::SetVariable {
            name: "txn.sni_match".to_string(),
            expression: "req_ssl_sni,map(/maps/sni.map)".to_string(),
            fallback: Some("req_ssl_sni,regsub(^[^.]*,,),map(/maps/sni.map)".to_string()),
        };
        let lines = rule.render(Mode::Tcp);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("tcp-request content set-var(txn.sni_match)"));
        assert!(lines[1].ends_with("if !{ var(txn.sni_match) -m found }"));

        let redirect = Rule::RequestRedirect {
            ssl_redirect: true,
            host: String::new(),
            port: None,
            code: 302,
        };
        assert!(redirect.render(Mode::Tcp).is_empty());
        assert_eq!(
            redirect.render(Mode::Http),
            vec!["http-request redirect scheme https code 302 if !{ ssl_fc }".to_string()]
        );
    }
}
