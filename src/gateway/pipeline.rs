//! Request orchestration for `POST /secure-request`
//!
//! Validation runs strictly before any decode or network I/O:
//! body → environment → caller credentials → envelope → certificate source,
//! then the credential is resolved through the cache and the command is
//! forwarded.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{Config, DefaultsConfig, UpstreamConfig, UpstreamEnv};
use crate::envelope;
use crate::mtls::{CertificateMaterial, CredentialCache, Pkcs12Decoder};
use crate::upstream::SecureForwarder;
use crate::{Error, Result};

/// Company tax ids are exactly 14 ASCII digits.
static CNPJ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{14}$").expect("static regex"));

/// Side fields of the inbound body (the command itself is normalized separately)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RelayRequest {
    /// Upstream environment selection
    pub router: Option<RouterSection>,
    /// Caller credentials for the upstream
    pub auth: Option<CallerCredentials>,
    /// Client certificate source
    pub cert: Option<CertSection>,
}

/// `router` section
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Target environment
    pub env: Option<UpstreamEnv>,
}

/// `auth` section
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallerCredentials {
    /// Upstream client id
    pub client_id: Option<String>,
    /// Upstream client secret
    pub client_secret: Option<String>,
    /// 14-digit company tax id
    pub cnpj_id: Option<String>,
}

/// `cert` section
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CertSection {
    /// Inline PKCS#12 bundle, base64 encoded
    pub pfx_base64: Option<String>,
    /// Path of a PKCS#12 bundle on the server
    pub pfx_path: Option<String>,
    /// Bundle passphrase
    pub password: Option<String>,
}

/// Reply returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayResponse {
    /// Status returned by the upstream
    pub status_code: u16,
    /// Upstream URL the command was posted to
    pub url: String,
    /// Upstream body (JSON, or text when the upstream did not send JSON)
    pub response: Value,
}

/// Upstream credentials after defaults were applied
#[derive(Debug)]
struct ResolvedCredentials {
    client_id: String,
    client_secret: String,
    cnpj_id: String,
}

/// Where the client certificate comes from
#[derive(Debug)]
enum CertSource {
    Inline { bundle: Vec<u8>, password: String },
    File { path: PathBuf, password: String },
}

/// Caller value unless absent or empty; never trimmed.
fn pick(value: Option<&String>, fallback: &str) -> String {
    non_empty(value).unwrap_or(fallback).to_string()
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Orchestrates one relay call: validate, resolve credential, forward.
pub struct Relay {
    cache: Arc<CredentialCache>,
    forwarder: SecureForwarder,
    upstream: UpstreamConfig,
    defaults: DefaultsConfig,
}

impl Relay {
    /// Assemble a relay from its parts
    #[must_use]
    pub fn new(
        cache: Arc<CredentialCache>,
        forwarder: SecureForwarder,
        upstream: UpstreamConfig,
        defaults: DefaultsConfig,
    ) -> Self {
        Self {
            cache,
            forwarder,
            upstream,
            defaults,
        }
    }

    /// Build a relay (PKCS#12 decoder, cache, forwarder) from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the extra upstream CA cannot be loaded.
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = Arc::new(CredentialCache::new(
            Arc::new(Pkcs12Decoder),
            config.cache.policy(),
        ));
        let forwarder = SecureForwarder::new(
            config.upstream.ca_cert_path.as_deref().map(Path::new),
            config.upstream.scratch_dir.as_deref().map(PathBuf::from),
        )
        .map_err(|e| Error::Config(format!("failed to load upstream trust anchors: {e}")))?;

        Ok(Self::new(
            cache,
            forwarder,
            config.upstream.clone(),
            config.defaults.clone(),
        ))
    }

    /// Credential cache shared by all requests
    #[must_use]
    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Handle one `POST /secure-request` body.
    pub async fn handle(&self, raw: Value) -> Result<RelayResponse> {
        if !raw.is_object() {
            return Err(Error::Validation(
                "request body must be a JSON object".to_string(),
            ));
        }
        let request = RelayRequest::deserialize(&raw)
            .map_err(|e| Error::Validation(format!("invalid request: {e}")))?;

        let env = request
            .router
            .as_ref()
            .and_then(|r| r.env)
            .unwrap_or(self.upstream.default_env);
        let credentials = self.resolve_credentials(request.auth.as_ref())?;
        let envelope = envelope::normalize(&raw)?;
        let source = self.resolve_cert_source(request.cert.as_ref())?;

        let material = self.load_material(source).await?;

        let url = self.upstream.command_url(env);
        let headers = upstream_headers(&credentials)?;
        info!(route = %envelope.route, version = envelope.version, env = ?env, "Relaying command");

        let reply = self
            .forwarder
            .forward(
                &material,
                &envelope.to_upstream_body(),
                &url,
                headers,
                self.upstream.timeout,
            )
            .await?;

        info!(route = %envelope.route, status = reply.status, "Upstream replied");
        Ok(RelayResponse {
            status_code: reply.status,
            url,
            response: reply.body,
        })
    }

    fn resolve_credentials(
        &self,
        auth: Option<&CallerCredentials>,
    ) -> Result<ResolvedCredentials> {
        let client_id = pick(auth.and_then(|a| a.client_id.as_ref()), &self.defaults.client_id);
        let client_secret = pick(
            auth.and_then(|a| a.client_secret.as_ref()),
            &self.defaults.client_secret,
        );
        let cnpj_id = pick(auth.and_then(|a| a.cnpj_id.as_ref()), &self.defaults.cnpj_id);

        if client_id.is_empty() || client_secret.is_empty() {
            return Err(Error::Validation(
                "client_id and client_secret are required".to_string(),
            ));
        }
        if !CNPJ_RE.is_match(&cnpj_id) {
            return Err(Error::Validation(
                "cnpj_id must be exactly 14 digits".to_string(),
            ));
        }

        Ok(ResolvedCredentials {
            client_id,
            client_secret,
            cnpj_id,
        })
    }

    fn resolve_cert_source(&self, cert: Option<&CertSection>) -> Result<CertSource> {
        let password = cert.and_then(|c| non_empty(c.password.as_ref()));

        if let Some(encoded) = cert.and_then(|c| non_empty(c.pfx_base64.as_ref())) {
            let password = password.ok_or_else(|| {
                Error::Validation("password is required with pfx_base64".to_string())
            })?;
            let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let bundle = BASE64
                .decode(compact)
                .map_err(|e| Error::Validation(format!("invalid pfx_base64: {e}")))?;
            return Ok(CertSource::Inline {
                bundle,
                password: password.to_string(),
            });
        }

        if let Some(path) = cert.and_then(|c| non_empty(c.pfx_path.as_ref())) {
            let password = password.ok_or_else(|| {
                Error::Validation("password is required with pfx_path".to_string())
            })?;
            return Ok(CertSource::File {
                path: existing_file(path)?,
                password: password.to_string(),
            });
        }

        if self.defaults.pfx_path.is_empty() || self.defaults.pfx_password.is_empty() {
            return Err(Error::Validation(
                "no client certificate provided and no default configured".to_string(),
            ));
        }
        Ok(CertSource::File {
            path: existing_file(&self.defaults.pfx_path)?,
            password: self.defaults.pfx_password.clone(),
        })
    }

    async fn load_material(&self, source: CertSource) -> Result<Arc<CertificateMaterial>> {
        let (bundle, password) = match source {
            CertSource::Inline { bundle, password } => (bundle, password),
            CertSource::File { path, password } => {
                debug!(path = %path.display(), "Reading PKCS#12 bundle");
                (tokio::fs::read(&path).await?, password)
            }
        };

        let cache = Arc::clone(&self.cache);
        let material = tokio::task::spawn_blocking(move || cache.resolve(&bundle, &password))
            .await
            .map_err(|e| Error::Internal(format!("certificate decode task failed: {e}")))??;

        Ok(material)
    }
}

fn existing_file(path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::Validation(format!(
            "certificate file not found: {}",
            path.display()
        )))
    }
}

fn upstream_headers(credentials: &ResolvedCredentials) -> Result<HeaderMap> {
    let basic = BASE64.encode(format!(
        "{}:{}",
        credentials.client_id, credentials.client_secret
    ));
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {basic}"))
            .map_err(|e| Error::Internal(e.to_string()))?,
    );
    headers.insert(
        "Id",
        HeaderValue::from_str(&credentials.cnpj_id).map_err(|e| Error::Internal(e.to_string()))?,
    );
    Ok(headers)
}
