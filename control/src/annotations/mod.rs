//! Annotation resolution and typed parsing
//!
//! Configuration options reach the controller as annotations on ingresses and
//! services, or as keys of the main config map. An option is resolved by
//! trying a list of sources in order and falling back to a built-in default.

pub mod defaults;
pub mod frontend;
pub mod global;
pub mod snippet;

use crate::store::Annotations;
use thiserror::Error;

/// Prefixes tried (in order) before the bare option name
pub const ANNOTATION_PREFIXES: [&str; 3] = ["tollgate.io/", "ingress.kubernetes.io/", "kubernetes.io/"];

/// Annotation parse/validation error
#[derive(Error, Debug, Clone, PartialEq)]
#[error("annotation {name}: {reason}")]
pub struct AnnotationError {
    pub name: String,
    pub reason: String,
}

impl AnnotationError {
    pub fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Built-in default value of an option
pub fn default_value(name: &str) -> Option<&'static str> {
    let value = match name {
        "check" => "true",
        "forwarded-for" => "true",
        "load-balance" => "roundrobin",
        "http-keep-alive" => "true",
        "dontlognull" => "true",
        "ssl-redirect-code" => "302",
        "request-redirect-code" => "302",
        "request-capture-len" => "128",
        "rate-limit-period" => "1s",
        "rate-limit-size" => "100k",
        "rate-limit-status-code" => "403",
        "syslog-server" => "address:127.0.0.1, facility: local0, level: notice",
        "timeout-connect" => "5s",
        "timeout-http-request" => "5s",
        "timeout-http-keep-alive" => "1m",
        "timeout-queue" => "5s",
        "timeout-server" => "50s",
        "timeout-tunnel" => "1h",
        _ => return None,
    };
    Some(value)
}

fn lookup<'a>(name: &str, source: &'a Annotations) -> Option<&'a str> {
    ANNOTATION_PREFIXES
        .iter()
        .filter_map(|prefix| source.get(&format!("{prefix}{name}")))
        .chain(source.get(name))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Resolve an option from ordered sources.
///
/// Returns the first non-empty value found, else the built-in default, else "".
pub fn get_value(name: &str, sources: &[&Annotations]) -> String {
    sources
        .iter()
        .find_map(|source| lookup(name, source))
        .or_else(|| default_value(name))
        .unwrap_or_default()
        .to_string()
}

/// Parse a boolean option (`true`/`false` and the usual short forms)
pub fn parse_bool(value: &str, name: &str) -> Result<bool, AnnotationError> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" | "enabled" | "on" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" | "disabled" | "off" => Ok(false),
        other => Err(AnnotationError::new(
            name,
            format!("'{other}' is not a boolean"),
        )),
    }
}

/// Parse a duration into milliseconds.
///
/// Accepts a bare number (milliseconds) or a number with one of the units
/// `ms`, `s`, `m`, `h`, `d`.
pub fn parse_time(value: &str) -> Result<i64, AnnotationError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: i64 = number
        .parse()
        .map_err(|_| AnnotationError::new("time", format!("invalid duration '{value}'")))?;
    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => {
            return Err(AnnotationError::new(
                "time",
                format!("invalid duration unit '{unit}' in '{value}'"),
            ))
        }
    };
    number
        .checked_mul(factor)
        .ok_or_else(|| AnnotationError::new("time", format!("duration '{value}' overflows")))
}

/// Parse a size with an optional `k`/`m`/`g` suffix
pub fn parse_size(value: &str) -> Result<i64, AnnotationError> {
    let value = value.trim();
    let (number, factor) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1_000),
        Some('m' | 'M') => (&value[..value.len() - 1], 1_000_000),
        Some('g' | 'G') => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };
    number
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(factor))
        .ok_or_else(|| AnnotationError::new("size", format!("invalid size '{value}'")))
}

/// Split a multi-line option into trimmed, non-empty lines
pub fn lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}
