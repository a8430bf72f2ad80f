//! Raw configuration snippets
//!
//! `global-config-snippet` and `frontend-config-snippet` carry verbatim proxy
//! directives. A changed global snippet needs a restart, a changed frontend
//! snippet a reload.

use super::{get_value, lines};
use crate::error::{ControllerError, Errors};
use crate::proxy::api::ConfigApi;
use crate::store::Annotations;
use tracing::{debug, info};

/// Apply the global snippet. Returns whether it changed.
pub async fn update_global_snippet(
    api: &dyn ConfigApi,
    config_map: &Annotations,
) -> Result<bool, ControllerError> {
    let desired = lines(&get_value("global-config-snippet", &[config_map]));
    let live = api.global_snippet_get().await?;
    if live == desired {
        return Ok(false);
    }
    api.global_snippet_set(&desired).await?;
    info!(lines = desired.len(), "Global config snippet updated");
    Ok(true)
}

/// Apply the frontend snippet to each listed frontend that exists.
///
/// Returns whether any frontend changed.
pub async fn update_frontend_snippet(
    api: &dyn ConfigApi,
    config_map: &Annotations,
    frontends: &[&str],
) -> Result<bool, ControllerError> {
    let desired = lines(&get_value("frontend-config-snippet", &[config_map]));
    let mut changed = false;
    let mut errors = Errors::default();
    for frontend in frontends {
        let live = match api.frontend_snippet_get(frontend).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                debug!(frontend = %frontend, "Frontend absent, snippet skipped");
                continue;
            }
            Err(e) => {
                errors.add(Err(e));
                continue;
            }
        };
        if live == desired {
            continue;
        }
        match api.frontend_snippet_set(frontend, &desired).await {
            Ok(()) => {
                info!(frontend = %frontend, lines = desired.len(), "Frontend config snippet updated");
                changed = true;
            }
            Err(e) => errors.add(Err(e)),
        }
    }
    errors.into_result().map(|()| changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::memory::MemoryConfigApi;
    use common::Frontend;

    fn cm(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_global_snippet_applied_once() {
        let api = MemoryConfigApi::new();
        let config_map = cm(&[("global-config-snippet", "tune.bufsize 32768\n")]);
        assert!(update_global_snippet(&api, &config_map).await.unwrap());
        assert!(!update_global_snippet(&api, &config_map).await.unwrap());
        assert_eq!(api.snapshot().global_snippet, vec!["tune.bufsize 32768".to_string()]);
    }

    #[tokio::test]
    async fn test_frontend_snippet_skips_missing_frontend() {
        let api = MemoryConfigApi::new();
        api.seed_frontend(
            Frontend {
                name: "http".to_string(),
                ..Default::default()
            },
            vec![],
        );
        let config_map = cm(&[("frontend-config-snippet", "option forwardfor")]);
        let changed = update_frontend_snippet(&api, &config_map, &["http", "stats"])
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            api.snapshot().frontends["http"].snippet,
            vec!["option forwardfor".to_string()]
        );
    }
}
