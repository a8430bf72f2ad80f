//! HTTPS frontend state
//!
//! Two independent switches drive the HTTPS side of the proxy:
//!
//! - SSL offload: TLS termination on the HTTPS frontend, on whenever a
//!   frontend certificate is in use.
//! - SSL passthrough: a TCP frontend takes over the external HTTPS address,
//!   routes by SNI, and chains everything else into the HTTPS frontend, which
//!   then listens on loopback with PROXY protocol.
//!
//! Client certificate authentication is applied last since passthrough
//! toggling rewrites the HTTPS binds.

use crate::annotations::{get_value, parse_bool, parse_time};
use crate::apis::metrics::record_step_error;
use crate::config::HttpsConfig;
use crate::controller::ControllerCfg;
use crate::error::{ControllerError, Errors};
use crate::proxy::api::ConfigApi;
use crate::proxy::certs::{CertError, Certificates, SecretCtx, SecretType};
use crate::proxy::maps::MapId;
use crate::proxy::rules::{Rule, RuleScope};
use crate::store::K8s;
use common::{Backend, BackendSwitchingRule, Bind, Frontend, Mode, Server, LOOPBACK_V4, LOOPBACK_V6};
use tracing::{debug, error, info, warn};

/// Inspect delay of the passthrough frontend when `timeout-client` is unset (ms)
const DEFAULT_INSPECT_DELAY: i64 = 5000;

const PASSTHROUGH_LOG_FORMAT: &str = "'%ci:%cp [%t] %ft %b/%s %Tw/%Tc/%Tt %B %ts %ac/%fc/%bc/%sc/%rc %sq/%bq %hr %hs sni: %[var(sess.sni)]'";

/// Reload flag of an HTTPS step, logging its failure
fn step(name: &str, result: Result<bool, ControllerError>) -> bool {
    result.unwrap_or_else(|e| {
        error!(step = name, error = %e, "HTTPS update step failed");
        record_step_error("https");
        false
    })
}

/// HTTPS listener descriptor
#[derive(Debug, Clone)]
pub struct Https {
    pub enabled: bool,
    pub ipv4: bool,
    pub ipv6: bool,
    pub port: i64,
    pub addr_ipv4: String,
    pub addr_ipv6: String,
    pub cert_dir: String,
    /// Negotiated protocols, from the `tls-alpn` option
    pub alpn: String,
}

impl Https {
    pub fn new(config: &HttpsConfig, cert_dir: &str) -> Self {
        Self {
            enabled: config.enabled,
            ipv4: config.ipv4,
            ipv6: config.ipv6,
            port: config.port,
            addr_ipv4: config.addr_ipv4.clone(),
            addr_ipv6: config.addr_ipv6.clone(),
            cert_dir: cert_dir.to_string(),
            alpn: String::new(),
        }
    }

    /// Binds of the HTTPS frontend.
    ///
    /// While passthrough chains into the HTTPS frontend its binds move to
    /// loopback and accept the PROXY protocol.
    pub fn bind_list(&self, passthrough: bool) -> Vec<Bind> {
        let mut binds = Vec::new();
        if self.ipv4 {
            binds.push(Bind {
                name: "v4".to_string(),
                address: if passthrough {
                    LOOPBACK_V4.to_string()
                } else {
                    self.addr_ipv4.clone()
                },
                port: Some(self.port),
                accept_proxy: passthrough,
                ..Default::default()
            });
        }
        if self.ipv6 {
            binds.push(Bind {
                name: "v6".to_string(),
                address: if passthrough {
                    LOOPBACK_V6.to_string()
                } else {
                    self.addr_ipv6.clone()
                },
                port: Some(self.port),
                accept_proxy: passthrough,
                v4v6: true,
                ..Default::default()
            });
        }
        binds
    }

    /// Bring offload, passthrough and client authentication in line with the
    /// store. Returns whether a reload is needed.
    ///
    /// Every step runs on every pass; a failed step is logged and the next
    /// one still runs.
    pub async fn update(
        &mut self,
        k: &K8s,
        cfg: &mut ControllerCfg,
        api: &dyn ConfigApi,
        certs: &mut dyn Certificates,
    ) -> bool {
        if !self.enabled {
            debug!("HTTPS disabled, skipping HTTPS update");
            return false;
        }
        self.alpn = get_value("tls-alpn", &[&k.config_maps.main.annotations]);

        let mut reload = step(
            "offload",
            self.update_ssl_offload(cfg, api, certs.frontend_certs_enabled()).await,
        );
        reload |= step("passthrough", self.update_ssl_passthrough(k, cfg, api).await);
        reload |= step(
            "client-auth",
            self.handle_client_tls_auth(k, cfg, api, certs).await,
        );

        if certs.updated() {
            debug!("Certificates updated");
            reload = true;
        }
        reload
    }

    async fn update_ssl_offload(
        &self,
        cfg: &mut ControllerCfg,
        api: &dyn ConfigApi,
        certs_enabled: bool,
    ) -> Result<bool, ControllerError> {
        if certs_enabled == cfg.https {
            return Ok(false);
        }
        if certs_enabled {
            api.frontend_enable_ssl_offload(&cfg.front_https, &self.cert_dir, &self.alpn)
                .await?;
            info!(frontend = %cfg.front_https, "SSL offload enabled");
        } else {
            api.frontend_disable_ssl_offload(&cfg.front_https).await?;
            info!(frontend = %cfg.front_https, "SSL offload disabled");
        }
        cfg.https = certs_enabled;
        Ok(true)
    }

    async fn update_ssl_passthrough(
        &self,
        k: &K8s,
        cfg: &mut ControllerCfg,
        api: &dyn ConfigApi,
    ) -> Result<bool, ControllerError> {
        let ssl_frontend_exists = match api.frontend_get(&cfg.front_ssl).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        let mut reload = false;
        if cfg.ssl_passthrough {
            if !ssl_frontend_exists {
                if let Err(e) = self.enable_ssl_passthrough(cfg, api).await {
                    error!(error = %e, "Failed to enable SSL passthrough");
                }
                info!("SSL passthrough enabled");
                reload = true;
            }
            if let Err(e) = self.ssl_passthrough_rules(k, cfg) {
                error!(error = %e, "Failed to add SSL passthrough rules");
                record_step_error("https");
            }
        } else if ssl_frontend_exists {
            if let Err(e) = self.disable_ssl_passthrough(cfg, api).await {
                error!(error = %e, "Failed to disable SSL passthrough");
            }
            info!("SSL passthrough disabled");
            reload = true;
        }
        Ok(reload)
    }

    async fn handle_client_tls_auth(
        &self,
        k: &K8s,
        cfg: &ControllerCfg,
        api: &dyn ConfigApi,
        certs: &mut dyn Certificates,
    ) -> Result<bool, ControllerError> {
        let config_map = &k.config_maps.main.annotations;
        let client_ca = get_value("client-ca", &[config_map]);
        let optional = get_value("client-crt-optional", &[config_map]);

        let mut ca_file = String::new();
        if !client_ca.is_empty() {
            match certs.handle_tls_secret(
                k,
                SecretCtx {
                    default_ns: "",
                    secret_path: &client_ca,
                    secret_type: SecretType::CaCert,
                },
            ) {
                Ok(path) => ca_file = path.display().to_string(),
                Err(CertError::NotFound(secret)) => {
                    warn!(secret = %secret, "Client CA secret not found, client authentication disabled")
                }
                Err(e) => return Err(e.into()),
            }
        }
        let verify = if ca_file.is_empty() {
            ""
        } else if optional.is_empty() {
            "required"
        } else {
            match parse_bool(&optional, "client-crt-optional") {
                Ok(true) => "optional",
                Ok(false) => "required",
                Err(e) => {
                    error!(error = %e, "Invalid client-crt-optional, requiring client certificates");
                    "required"
                }
            }
        };

        let binds = api.frontend_binds_get(&cfg.front_https).await?;
        let Some(first) = binds.first() else {
            return Ok(false);
        };
        if first.ssl_cafile == ca_file && first.verify == verify {
            return Ok(false);
        }
        if ca_file.is_empty() {
            info!(frontend = %cfg.front_https, "Removing client TLS authentication");
        } else {
            info!(frontend = %cfg.front_https, ca_file = %ca_file, verify = %verify, "Configuring client TLS authentication");
        }
        // a failed edit leaves earlier binds updated
        for mut bind in binds {
            bind.ssl_cafile = ca_file.clone();
            bind.verify = verify.to_string();
            api.frontend_bind_edit(&cfg.front_https, &bind).await?;
        }
        Ok(true)
    }

    async fn enable_ssl_passthrough(
        &self,
        cfg: &mut ControllerCfg,
        api: &dyn ConfigApi,
    ) -> Result<(), ControllerError> {
        api.frontend_create(&Frontend {
            name: cfg.front_ssl.clone(),
            mode: Mode::Tcp,
            default_backend: cfg.back_ssl.clone(),
            log_format: PASSTHROUGH_LOG_FORMAT.to_string(),
        })
        .await?;
        for bind in self.bind_list(false) {
            api.frontend_bind_create(&cfg.front_ssl, &bind).await?;
        }

        let chaining_address = if self.ipv4 { LOOPBACK_V4 } else { LOOPBACK_V6 };
        let mut errors = Errors::default();
        errors.add(
            api.backend_create(&Backend {
                name: cfg.back_ssl.clone(),
                mode: Mode::Tcp,
                ..Default::default()
            })
            .await,
        );
        errors.add(
            api.backend_server_create(
                &cfg.back_ssl,
                &Server {
                    name: cfg.front_https.clone(),
                    address: chaining_address.to_string(),
                    port: Some(self.port),
                    send_proxy_v2: true,
                    ..Default::default()
                },
            )
            .await,
        );
        errors.add(
            api.backend_switching_rule_create(
                &cfg.front_ssl,
                &BackendSwitchingRule {
                    index: Some(0),
                    name: "%[var(txn.sni_match),field(1,.)]".to_string(),
                    ..Default::default()
                },
            )
            .await,
        );
        errors.add(self.toggle_ssl_passthrough(true, cfg, api).await);
        errors.into_result()
    }

    async fn disable_ssl_passthrough(
        &self,
        cfg: &mut ControllerCfg,
        api: &dyn ConfigApi,
    ) -> Result<(), ControllerError> {
        api.frontend_delete(&cfg.front_ssl).await?;
        cfg.rules.delete_frontend(&cfg.front_ssl);
        api.backend_delete(&cfg.back_ssl).await?;
        self.toggle_ssl_passthrough(false, cfg, api).await
    }

    async fn toggle_ssl_passthrough(
        &self,
        passthrough: bool,
        cfg: &ControllerCfg,
        api: &dyn ConfigApi,
    ) -> Result<(), ControllerError> {
        for bind in self.bind_list(passthrough) {
            api.frontend_bind_edit(&cfg.front_https, &bind).await?;
        }
        if cfg.https {
            api.frontend_enable_ssl_offload(&cfg.front_https, &self.cert_dir, &self.alpn)
                .await?;
        }
        Ok(())
    }

    fn ssl_passthrough_rules(&self, k: &K8s, cfg: &mut ControllerCfg) -> Result<(), ControllerError> {
        let timeout = get_value("timeout-client", &[&k.config_maps.main.annotations]);
        let inspect_delay = if timeout.is_empty() {
            DEFAULT_INSPECT_DELAY
        } else {
            parse_time(&timeout).unwrap_or_else(|e| {
                error!(error = %e, "Invalid timeout-client, using default inspect delay");
                DEFAULT_INSPECT_DELAY
            })
        };
        let sni_map = cfg.map_files.path(MapId::Sni).display().to_string();
        let rules = [
            Rule::AcceptContent,
            Rule::InspectDelay {
                timeout_ms: inspect_delay,
            },
            Rule::SetVariable {
                name: "sess.sni".to_string(),
                expression: "req_ssl_sni".to_string(),
                fallback: None,
            },
            Rule::SetVariable {
                name: "txn.sni_match".to_string(),
                expression: format!("req_ssl_sni,map({sni_map})"),
                fallback: Some(format!("req_ssl_sni,regsub(^[^.]*,,),map({sni_map})")),
            },
        ];
        let front_ssl = cfg.front_ssl.clone();
        let mut errors = Errors::default();
        for rule in rules {
            errors.add(cfg.rules.add_rule(rule, RuleScope::Global, &front_ssl));
        }
        errors.into_result()
    }
}
