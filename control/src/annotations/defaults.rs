//! Defaults-section options read from the main config map

use super::{get_value, lines, parse_bool, parse_time, AnnotationError};
use crate::store::Annotations;
use common::Defaults;
use tracing::error;

type DefaultsSetter = fn(&str, &mut Defaults) -> Result<(), AnnotationError>;

/// Defaults-scope options, applied in order.
///
/// `http-server-close` comes after `http-keep-alive` so it wins when both are set.
pub const DEFAULTS_ANNOTATIONS: &[(&str, DefaultsSetter)] = &[
    ("timeout-client", |v, d| timeout(v, "timeout-client", &mut d.client_timeout)),
    ("timeout-client-fin", |v, d| timeout(v, "timeout-client-fin", &mut d.client_fin_timeout)),
    ("timeout-connect", |v, d| timeout(v, "timeout-connect", &mut d.connect_timeout)),
    ("timeout-http-request", |v, d| timeout(v, "timeout-http-request", &mut d.http_request_timeout)),
    ("timeout-http-keep-alive", |v, d| timeout(v, "timeout-http-keep-alive", &mut d.http_keep_alive_timeout)),
    ("timeout-queue", |v, d| timeout(v, "timeout-queue", &mut d.queue_timeout)),
    ("timeout-server", |v, d| timeout(v, "timeout-server", &mut d.server_timeout)),
    ("timeout-server-fin", |v, d| timeout(v, "timeout-server-fin", &mut d.server_fin_timeout)),
    ("timeout-tunnel", |v, d| timeout(v, "timeout-tunnel", &mut d.tunnel_timeout)),
    ("log-format", set_log_format),
    ("dontlognull", |v, d| flag(v, "dontlognull", &mut d.dontlognull)),
    ("logasap", |v, d| flag(v, "logasap", &mut d.logasap)),
    ("http-keep-alive", |v, d| connection_mode(v, "http-keep-alive", d)),
    ("http-server-close", |v, d| connection_mode(v, "http-server-close", d)),
];

/// Build the desired defaults section from config map options
pub fn from_annotations(config_map: &Annotations) -> Defaults {
    let mut defaults = Defaults::default();
    for (name, setter) in DEFAULTS_ANNOTATIONS {
        let value = get_value(name, &[config_map]);
        if value.is_empty() {
            continue;
        }
        if let Err(e) = setter(&value, &mut defaults) {
            error!(annotation = %name, error = %e, "Invalid defaults option");
        }
    }
    defaults
}

fn timeout(value: &str, name: &str, field: &mut Option<i64>) -> Result<(), AnnotationError> {
    *field = Some(parse_time(value).map_err(|e| AnnotationError::new(name, e.reason))?);
    Ok(())
}

fn flag(value: &str, name: &str, field: &mut bool) -> Result<(), AnnotationError> {
    *field = parse_bool(value, name)?;
    Ok(())
}

fn connection_mode(value: &str, name: &str, defaults: &mut Defaults) -> Result<(), AnnotationError> {
    if parse_bool(value, name)? {
        defaults.http_connection_mode = name.to_string();
    }
    Ok(())
}

fn set_log_format(value: &str, defaults: &mut Defaults) -> Result<(), AnnotationError> {
    // multi-line values collapse into one directive
    defaults.log_format = lines(value).join(" ");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builtin_defaults_apply() {
        let defaults = from_annotations(&Annotations::new());
        assert_eq!(defaults.connect_timeout, Some(5_000));
        assert_eq!(defaults.server_timeout, Some(50_000));
        assert_eq!(defaults.client_timeout, None);
        assert_eq!(defaults.http_connection_mode, "http-keep-alive");
        assert!(defaults.dontlognull);
        assert!(!defaults.logasap);
    }

    #[test]
    fn test_server_close_overrides_keep_alive() {
        let defaults = from_annotations(&cm(&[("http-server-close", "true")]));
        assert_eq!(defaults.http_connection_mode, "http-server-close");
    }

    #[test]
    fn test_invalid_timeout_is_skipped() {
        let defaults = from_annotations(&cm(&[
            ("timeout-client", "soon"),
            ("timeout-tunnel", "2h"),
        ]));
        assert_eq!(defaults.client_timeout, None);
        assert_eq!(defaults.tunnel_timeout, Some(7_200_000));
    }

    #[test]
    fn test_log_format_lines_joined() {
        let defaults = from_annotations(&cm(&[("log-format", "%ci:%cp\n %ft %b")]));
        assert_eq!(defaults.log_format, "%ci:%cp %ft %b");
    }
}
