//! Frontend request-rule options
//!
//! Each handler turns one option (plus its companion options, e.g.
//! `ssl-redirect-code` for `ssl-redirect`) into zero or more [`Rule`]s.
//! Handlers run in catalogue order against a single annotation source: an
//! ingress or the main config map.

use super::{get_value, lines, parse_bool, parse_size, parse_time, AnnotationError};
use crate::proxy::rules::Rule;
use crate::store::Annotations;
use std::net::IpAddr;

/// Frontend rule handler
pub struct RuleHandler {
    pub name: &'static str,
    /// Receives the resolved value of `name` and the source it came from
    pub process: fn(&str, &Annotations, &mut Vec<Rule>) -> Result<(), AnnotationError>,
}

/// Frontend-scope handlers, in processing order
pub const FRONTEND_ANNOTATIONS: &[RuleHandler] = &[
    RuleHandler {
        name: "ssl-redirect",
        process: ssl_redirect,
    },
    RuleHandler {
        name: "request-redirect",
        process: request_redirect,
    },
    RuleHandler {
        name: "whitelist",
        process: |v, _, rules| deny(v, "whitelist", true, rules),
    },
    RuleHandler {
        name: "blacklist",
        process: |v, _, rules| deny(v, "blacklist", false, rules),
    },
    RuleHandler {
        name: "request-capture",
        process: request_capture,
    },
    RuleHandler {
        name: "rate-limit-requests",
        process: rate_limit,
    },
    RuleHandler {
        name: "request-set-header",
        process: set_header,
    },
];

fn parse_int(name: &str, value: &str) -> Result<i64, AnnotationError> {
    value
        .trim()
        .parse()
        .map_err(|_| AnnotationError::new(name, format!("'{value}' is not an integer")))
}

fn redirect_code(name: &str, source: &Annotations) -> Result<i64, AnnotationError> {
    let code = parse_int(name, &get_value(name, &[source]))?;
    match code {
        301 | 302 | 303 | 307 | 308 => Ok(code),
        other => Err(AnnotationError::new(name, format!("{other} is not a redirect code"))),
    }
}

fn ssl_redirect(value: &str, source: &Annotations, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    if value.is_empty() || !parse_bool(value, "ssl-redirect")? {
        return Ok(());
    }
    let code = redirect_code("ssl-redirect-code", source)?;
    let port = get_value("ssl-redirect-port", &[source]);
    let port = if port.is_empty() {
        None
    } else {
        Some(parse_int("ssl-redirect-port", &port)?)
    };
    rules.push(Rule::RequestRedirect {
        ssl_redirect: true,
        host: String::new(),
        port,
        code,
    });
    Ok(())
}

fn request_redirect(value: &str, source: &Annotations, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.contains(char::is_whitespace) || value.contains('/') {
        return Err(AnnotationError::new(
            "request-redirect",
            format!("'{value}' is not a host[:port]"),
        ));
    }
    let code = redirect_code("request-redirect-code", source)?;
    rules.push(Rule::RequestRedirect {
        ssl_redirect: false,
        host: value.to_string(),
        port: None,
        code,
    });
    Ok(())
}

fn valid_source(entry: &str) -> bool {
    match entry.split_once('/') {
        Some((ip, prefix)) => match (ip.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(p)) => p <= 32,
            (Ok(IpAddr::V6(_)), Ok(p)) => p <= 128,
            _ => false,
        },
        None => entry.parse::<IpAddr>().is_ok(),
    }
}

fn deny(value: &str, name: &str, allow_list: bool, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    if value.is_empty() {
        return Ok(());
    }
    let src_ips: Vec<String> = value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    if let Some(bad) = src_ips.iter().find(|ip| !valid_source(ip)) {
        return Err(AnnotationError::new(
            name,
            format!("'{bad}' is not an IP address or CIDR"),
        ));
    }
    if src_ips.is_empty() {
        return Ok(());
    }
    rules.push(Rule::Deny { src_ips, allow_list });
    Ok(())
}

fn request_capture(value: &str, source: &Annotations, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    if value.is_empty() {
        return Ok(());
    }
    let len = parse_int("request-capture-len", &get_value("request-capture-len", &[source]))?;
    if len <= 0 {
        return Err(AnnotationError::new("request-capture-len", "must be positive"));
    }
    for expression in lines(value) {
        rules.push(Rule::Capture { expression, len });
    }
    Ok(())
}

fn rate_limit(value: &str, source: &Annotations, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    if value.is_empty() {
        return Ok(());
    }
    let requests = parse_int("rate-limit-requests", value)?;
    if requests <= 0 {
        return Err(AnnotationError::new("rate-limit-requests", "must be positive"));
    }
    let period_ms = parse_time(&get_value("rate-limit-period", &[source]))
        .map_err(|e| AnnotationError::new("rate-limit-period", e.reason))?;
    let size = parse_size(&get_value("rate-limit-size", &[source]))
        .map_err(|e| AnnotationError::new("rate-limit-size", e.reason))?;
    let deny_status = parse_int(
        "rate-limit-status-code",
        &get_value("rate-limit-status-code", &[source]),
    )?;
    rules.push(Rule::RateLimit {
        table: format!("RateLimit-{period_ms}-{size}"),
        period_ms,
        size,
        requests,
        deny_status,
    });
    Ok(())
}

/// One header per line: `<name> <value format>`
fn set_header(value: &str, _: &Annotations, rules: &mut Vec<Rule>) -> Result<(), AnnotationError> {
    for line in lines(value) {
        let Some((name, header_value)) = line.split_once(char::is_whitespace) else {
            return Err(AnnotationError::new(
                "request-set-header",
                format!("missing value for header '{line}'"),
            ));
        };
        rules.push(Rule::SetHeader {
            name: name.to_string(),
            value: header_value.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn run(pairs: &[(&str, &str)]) -> (Vec<Rule>, Vec<AnnotationError>) {
        let source = source(pairs);
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for handler in FRONTEND_ANNOTATIONS {
            let value = get_value(handler.name, &[&source]);
            if let Err(e) = (handler.process)(&value, &source, &mut rules) {
                errors.push(e);
            }
        }
        (rules, errors)
    }

    #[test]
    fn test_no_options_no_rules() {
        let (rules, errors) = run(&[]);
        assert!(rules.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_ssl_redirect_with_code_and_port() {
        let (rules, _) = run(&[
            ("ssl-redirect", "true"),
            ("ssl-redirect-code", "301"),
            ("ssl-redirect-port", "8443"),
        ]);
        assert_eq!(
            rules,
            vec![Rule::RequestRedirect {
                ssl_redirect: true,
                host: String::new(),
                port: Some(8443),
                code: 301,
            }]
        );
    }

    #[test]
    fn test_invalid_redirect_code_rejected() {
        let (rules, errors) = run(&[("ssl-redirect", "true"), ("ssl-redirect-code", "200")]);
        assert!(rules.is_empty());
        assert_eq!(errors[0].name, "ssl-redirect-code");
    }

    #[test]
    fn test_whitelist_and_blacklist() {
        let (rules, errors) = run(&[
            ("whitelist", "10.0.0.0/8, 192.168.1.10"),
            ("blacklist", "2001:db8::/32"),
        ]);
        assert!(errors.is_empty());
        assert_eq!(
            rules,
            vec![
                Rule::Deny {
                    src_ips: vec!["10.0.0.0/8".to_string(), "192.168.1.10".to_string()],
                    allow_list: true,
                },
                Rule::Deny {
                    src_ips: vec!["2001:db8::/32".to_string()],
                    allow_list: false,
                },
            ]
        );
    }

    #[test]
    fn test_invalid_ip_rejected_other_handlers_continue() {
        let (rules, errors) = run(&[
            ("whitelist", "10.0.0.0/33"),
            ("request-set-header", "X-Env prod"),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, "whitelist");
        assert_eq!(rules.len(), 1, "later handlers still run");
    }

    #[test]
    fn test_rate_limit_defaults() {
        let (rules, _) = run(&[("rate-limit-requests", "100")]);
        assert_eq!(
            rules,
            vec![Rule::RateLimit {
                table: "RateLimit-1000-100000".to_string(),
                period_ms: 1000,
                size: 100_000,
                requests: 100,
                deny_status: 403,
            }]
        );
    }

    #[test]
    fn test_capture_one_rule_per_line() {
        let (rules, _) = run(&[
            ("request-capture", "hdr(User-Agent)\ncookie(session)"),
            ("request-capture-len", "64"),
        ]);
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[1],
            Rule::Capture {
                expression: "cookie(session)".to_string(),
                len: 64,
            }
        );
    }
}
