//! Certificate material
//!
//! TLS secrets referenced by the configuration are written as PEM files the
//! proxy loads at reload time. The engine only sees the [`Certificates`]
//! trait: it asks for a secret to be materialised, learns the resulting file
//! path, and checks whether anything on disk changed during the pass.

use crate::store::K8s;
use common::fnv1a_hash;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Role a secret plays in the proxy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecretType {
    /// Certificate served when no SNI match exists
    DefaultCert,
    /// Certificate of an ingress TLS entry
    FrontendCert,
    /// CA bundle used to verify client certificates
    CaCert,
    /// CA bundle used to verify backend servers
    BackendCa,
}

impl SecretType {
    fn dir(&self) -> &'static str {
        match self {
            SecretType::DefaultCert | SecretType::FrontendCert => "frontend",
            SecretType::CaCert => "ca",
            SecretType::BackendCa => "backend-ca",
        }
    }

    fn is_ca(&self) -> bool {
        matches!(self, SecretType::CaCert | SecretType::BackendCa)
    }
}

/// Request to materialise a secret
#[derive(Debug, Clone, Copy)]
pub struct SecretCtx<'a> {
    /// Namespace used when the path has no namespace part
    pub default_ns: &'a str,
    /// `<namespace>/<name>` or `<name>`
    pub secret_path: &'a str,
    pub secret_type: SecretType,
}

/// Certificate handling errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("invalid secret reference '{0}'")]
    InvalidReference(String),

    #[error("secret '{secret}' has no key '{key}'")]
    MissingKey { secret: String, key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate store used by the engine
pub trait Certificates: Send {
    /// Write the secret's material and return the file path the proxy should use
    fn handle_tls_secret(&mut self, k: &K8s, ctx: SecretCtx<'_>) -> Result<PathBuf, CertError>;

    /// Whether any frontend (default or ingress) certificate is in use this pass
    fn frontend_certs_enabled(&self) -> bool;

    /// Whether certificate files changed during this pass
    fn updated(&self) -> bool;

    /// End the pass: remove files no longer referenced and reset tracking.
    ///
    /// Returns whether files were removed.
    fn refresh(&mut self) -> Result<bool, CertError>;
}

#[derive(Debug, Clone, Copy)]
struct FileState {
    role: SecretType,
    content_hash: u64,
    in_use: bool,
}

/// Certificates written from Kubernetes secrets into a directory tree
#[derive(Debug)]
pub struct SecretCertificates {
    dir: PathBuf,
    files: BTreeMap<PathBuf, FileState>,
    updated: bool,
}

fn parse_secret_path<'a>(ctx: &SecretCtx<'a>) -> Result<(&'a str, &'a str), CertError> {
    let parts: Vec<&str> = ctx.secret_path.split('/').collect();
    match parts.as_slice() {
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((*ns, *name)),
        [name] if !name.is_empty() && !ctx.default_ns.is_empty() => Ok((ctx.default_ns, *name)),
        _ => Err(CertError::InvalidReference(ctx.secret_path.to_string())),
    }
}

impl SecretCertificates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: BTreeMap::new(),
            updated: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pem(k: &K8s, ns: &str, name: &str, role: SecretType) -> Result<Vec<u8>, CertError> {
        let reference = format!("{ns}/{name}");
        let secret = k
            .secret(ns, name)
            .ok_or_else(|| CertError::NotFound(reference.clone()))?;
        let key = |key: &str| {
            secret.data.get(key).ok_or_else(|| CertError::MissingKey {
                secret: reference.clone(),
                key: key.to_string(),
            })
        };
        if role.is_ca() {
            return secret
                .data
                .get("ca.crt")
                .or_else(|| secret.data.get("tls.crt"))
                .cloned()
                .ok_or_else(|| CertError::MissingKey {
                    secret: reference.clone(),
                    key: "ca.crt".to_string(),
                });
        }
        let mut pem = key("tls.crt")?.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(key("tls.key")?);
        Ok(pem)
    }
}

impl Certificates for SecretCertificates {
    fn handle_tls_secret(&mut self, k: &K8s, ctx: SecretCtx<'_>) -> Result<PathBuf, CertError> {
        let (ns, name) = parse_secret_path(&ctx)?;
        let pem = Self::pem(k, ns, name, ctx.secret_type)?;
        let path = self
            .dir
            .join(ctx.secret_type.dir())
            .join(format!("{ns}_{name}.pem"));
        let content_hash = fnv1a_hash(&pem);

        let unchanged = self
            .files
            .get(&path)
            .is_some_and(|f| f.content_hash == content_hash)
            && path.exists();
        if !unchanged {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &pem)?;
            info!(secret = %format!("{ns}/{name}"), path = %path.display(), "Certificate written");
            self.updated = true;
        }
        self.files.insert(
            path.clone(),
            FileState {
                role: ctx.secret_type,
                content_hash,
                in_use: true,
            },
        );
        Ok(path)
    }

    fn frontend_certs_enabled(&self) -> bool {
        self.files.values().any(|f| {
            f.in_use && matches!(f.role, SecretType::DefaultCert | SecretType::FrontendCert)
        })
    }

    fn updated(&self) -> bool {
        self.updated
    }

    fn refresh(&mut self) -> Result<bool, CertError> {
        let stale: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, f)| !f.in_use)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &stale {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed unused certificate"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.files.remove(path);
        }
        for file in self.files.values_mut() {
            file.in_use = false;
        }
        self.updated = false;
        Ok(!stale.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Secret;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("tollgate-certs-{}-{n}", std::process::id()))
    }

    fn store_with_secret(ns: &str, name: &str, keys: &[(&str, &str)]) -> K8s {
        let mut k = K8s::new();
        k.namespace_mut(ns).secrets.insert(
            name.to_string(),
            Secret {
                namespace: ns.to_string(),
                name: name.to_string(),
                data: keys
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
                ..Default::default()
            },
        );
        k
    }

    #[test]
    fn test_writes_cert_and_tracks_updates() {
        let dir = temp_dir();
        let k = store_with_secret("default", "tls", &[("tls.crt", "CERT"), ("tls.key", "KEY")]);
        let mut certs = SecretCertificates::new(&dir);

        let path = certs
            .handle_tls_secret(
                &k,
                SecretCtx {
                    default_ns: "default",
                    secret_path: "tls",
                    secret_type: SecretType::FrontendCert,
                },
            )
            .unwrap();
        assert_eq!(path, dir.join("frontend").join("default_tls.pem"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "CERT\nKEY");
        assert!(certs.updated());
        assert!(certs.frontend_certs_enabled());

        assert!(!certs.refresh().unwrap());
        assert!(!certs.updated());

        // same content on the next pass: nothing written
        certs
            .handle_tls_secret(
                &k,
                SecretCtx {
                    default_ns: "",
                    secret_path: "default/tls",
                    secret_type: SecretType::FrontendCert,
                },
            )
            .unwrap();
        assert!(!certs.updated());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unused_files_removed_on_refresh() {
        let dir = temp_dir();
        let k = store_with_secret("ops", "ca", &[("ca.crt", "CA")]);
        let mut certs = SecretCertificates::new(&dir);
        let path = certs
            .handle_tls_secret(
                &k,
                SecretCtx {
                    default_ns: "",
                    secret_path: "ops/ca",
                    secret_type: SecretType::CaCert,
                },
            )
            .unwrap();
        assert!(!certs.frontend_certs_enabled(), "a CA bundle is not a frontend cert");
        assert!(!certs.refresh().unwrap());

        // not referenced during this pass
        assert!(certs.refresh().unwrap());
        assert!(!path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_secret_is_not_found() {
        let mut certs = SecretCertificates::new(temp_dir());
        let err = certs
            .handle_tls_secret(
                &K8s::new(),
                SecretCtx {
                    default_ns: "",
                    secret_path: "secret/ca-bundle",
                    secret_type: SecretType::CaCert,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CertError::NotFound(_)));
    }

    #[test]
    fn test_invalid_reference() {
        let mut certs = SecretCertificates::new(temp_dir());
        for path in ["", "a/b/c", "name-without-namespace"] {
            let err = certs
                .handle_tls_secret(
                    &K8s::new(),
                    SecretCtx {
                        default_ns: "",
                        secret_path: path,
                        secret_type: SecretType::DefaultCert,
                    },
                )
                .unwrap_err();
            assert!(matches!(err, CertError::InvalidReference(_)), "path {path:?}");
        }
    }
}
