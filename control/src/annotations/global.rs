//! Global-section options read from the main config map

use super::{get_value, parse_time, AnnotationError};
use crate::store::Annotations;
use common::{Global, LogTarget};
use tracing::error;

type GlobalSetter = fn(&str, &mut Global, &mut Vec<LogTarget>) -> Result<(), AnnotationError>;

/// Global-scope options, applied in order
pub const GLOBAL_ANNOTATIONS: &[(&str, GlobalSetter)] = &[
    ("maxconn", set_maxconn),
    ("nbthread", set_nbthread),
    ("hard-stop-after", set_hard_stop_after),
    ("syslog-server", set_syslog_servers),
];

/// Build the desired global section and log targets from config map options.
///
/// Invalid values are logged and leave the field at its default.
pub fn from_annotations(config_map: &Annotations) -> (Global, Vec<LogTarget>) {
    let mut global = Global::default();
    let mut log_targets = Vec::new();
    for (name, setter) in GLOBAL_ANNOTATIONS {
        let value = get_value(name, &[config_map]);
        if value.is_empty() {
            continue;
        }
        if let Err(e) = setter(&value, &mut global, &mut log_targets) {
            error!(annotation = %name, error = %e, "Invalid global option");
        }
    }
    (global, log_targets)
}

fn parse_int(name: &str, value: &str) -> Result<i64, AnnotationError> {
    value
        .trim()
        .parse()
        .map_err(|_| AnnotationError::new(name, format!("'{value}' is not an integer")))
}

fn set_maxconn(value: &str, global: &mut Global, _: &mut Vec<LogTarget>) -> Result<(), AnnotationError> {
    global.maxconn = Some(parse_int("maxconn", value)?);
    Ok(())
}

fn set_nbthread(value: &str, global: &mut Global, _: &mut Vec<LogTarget>) -> Result<(), AnnotationError> {
    let threads = parse_int("nbthread", value)?;
    if threads < 1 {
        return Err(AnnotationError::new("nbthread", "must be at least 1"));
    }
    global.nbthread = Some(threads);
    Ok(())
}

fn set_hard_stop_after(
    value: &str,
    global: &mut Global,
    _: &mut Vec<LogTarget>,
) -> Result<(), AnnotationError> {
    global.hard_stop_after =
        Some(parse_time(value).map_err(|e| AnnotationError::new("hard-stop-after", e.reason))?);
    Ok(())
}

/// One syslog target per line: `address:<ip>, port:<n>, facility:<f>, level:<l>, format:<f>, length:<n>`
fn set_syslog_servers(
    value: &str,
    _: &mut Global,
    log_targets: &mut Vec<LogTarget>,
) -> Result<(), AnnotationError> {
    for line in super::lines(value) {
        let target = parse_syslog_line(&line)?;
        log_targets.push(LogTarget {
            index: Some(log_targets.len() as i64),
            ..target
        });
    }
    Ok(())
}

fn parse_syslog_line(line: &str) -> Result<LogTarget, AnnotationError> {
    let mut target = LogTarget::default();
    let mut port = None;
    for part in line.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, val)) = part.split_once(':') else {
            return Err(AnnotationError::new(
                "syslog-server",
                format!("expected key:value, got '{part}'"),
            ));
        };
        let val = val.trim();
        match key.trim() {
            "address" => target.address = val.to_string(),
            "port" => port = Some(parse_int("syslog-server", val)?),
            "facility" => target.facility = val.to_string(),
            "level" => target.level = val.to_string(),
            "format" => target.format = val.to_string(),
            "length" => target.length = Some(parse_int("syslog-server", val)?),
            other => {
                return Err(AnnotationError::new(
                    "syslog-server",
                    format!("unknown parameter '{other}'"),
                ))
            }
        }
    }
    if target.address.is_empty() {
        return Err(AnnotationError::new("syslog-server", "address is required"));
    }
    if target.facility.is_empty() {
        return Err(AnnotationError::new("syslog-server", "facility is required"));
    }
    if let Some(port) = port {
        target.address = format!("{}:{port}", target.address);
    }
    Ok(target)
}
