//! Secure forwarding to the partner API over mutual TLS
//!
//! Each call materializes the client identity into its own scratch
//! directory, builds a rustls client from those files, posts the command and
//! maps the reply. The scratch directory is released on every exit path; the
//! cached material it was written from is untouched.
//!
//! Failures are classified, never retried:
//!
//! | failure                         | error                    |
//! |---------------------------------|--------------------------|
//! | connect / read timeout          | [`ForwardError::Timeout`]   |
//! | TLS handshake, unusable identity| [`ForwardError::Tls`]       |
//! | anything else on the wire       | [`ForwardError::Transport`] |

use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use rustls::RootCertStore;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mtls::{CertificateMaterial, MaterialError, ScopedMaterial, load_certs};

/// Classified upstream failure.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The call did not finish within the configured timeout
    #[error("{0}")]
    Timeout(String),

    /// TLS handshake or client identity failure
    #[error("{0}")]
    Tls(String),

    /// Any other transport failure
    #[error("{0}")]
    Transport(String),
}

/// Upstream reply: status plus parsed JSON or raw text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamResponse {
    /// HTTP status returned by the upstream
    pub status: u16,
    /// JSON body when the upstream declared and produced JSON, else text
    pub body: Value,
}

/// Posts commands to the upstream presenting a client certificate.
pub struct SecureForwarder {
    roots: Arc<RootCertStore>,
    scratch_dir: Option<PathBuf>,
}

impl SecureForwarder {
    /// Create a forwarder trusting the webpki roots plus `extra_ca` (PEM).
    ///
    /// `scratch_dir` overrides where per-call identity files are written.
    pub fn new(extra_ca: Option<&Path>, scratch_dir: Option<PathBuf>) -> Result<Self, MaterialError> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = extra_ca {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            debug!(path = %path.display(), added, ignored, "Loaded extra upstream trust anchors");
        }

        Ok(Self {
            roots: Arc::new(roots),
            scratch_dir,
        })
    }

    /// Forward one command.
    pub async fn forward(
        &self,
        material: &CertificateMaterial,
        command: &Value,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse, ForwardError> {
        let scoped = ScopedMaterial::write(material, self.scratch_dir.as_deref())
            .await
            .map_err(|e| ForwardError::Transport(format!("failed to materialize client identity: {e}")))?;

        let result = self
            .send(&scoped, command, url, headers, timeout)
            .await;

        drop(scoped);
        result
    }

    async fn send(
        &self,
        scoped: &ScopedMaterial,
        command: &Value,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse, ForwardError> {
        let tls = scoped
            .client_config(Arc::clone(&self.roots))
            .map_err(|e| ForwardError::Tls(format!("unusable client identity: {e}")))?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Transport(format!("failed to build HTTP client: {e}")))?;

        debug!(url = %url, "Forwarding command upstream");
        let response = client
            .post(url)
            .headers(headers)
            .json(command)
            .send()
            .await
            .map_err(|e| classify(&e, timeout))?;

        let status = response.status().as_u16();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let text = response.text().await.map_err(|e| classify(&e, timeout))?;

        Ok(UpstreamResponse {
            status,
            body: map_body(text, is_json),
        })
    }
}

/// JSON when declared and parseable; otherwise the raw text.
fn map_body(text: String, is_json: bool) -> Value {
    if is_json {
        match serde_json::from_str(&text) {
            Ok(value) => return value,
            Err(e) => warn!(error = %e, "Upstream declared JSON but body did not parse"),
        }
    }
    Value::String(text)
}

fn classify(err: &reqwest::Error, timeout: Duration) -> ForwardError {
    if err.is_timeout() {
        ForwardError::Timeout(format!("upstream did not answer within {}s", timeout.as_secs_f64()))
    } else if is_tls_failure(err) {
        ForwardError::Tls(format!("TLS failure talking to upstream: {}", error_chain(err)))
    } else {
        ForwardError::Transport(error_chain(err))
    }
}

/// Whether a rustls error sits anywhere in the error tree.
///
/// `io::Error::source()` skips its payload, and the TLS connector nests the
/// handshake's `io::Error` inside another one, so payloads are walked as well
/// as sources.
fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    if err.is::<rustls::Error>() {
        return true;
    }
    if err
        .downcast_ref::<io::Error>()
        .and_then(io::Error::get_ref)
        .is_some_and(|payload| is_tls_failure(payload))
    {
        return true;
    }
    err.source().is_some_and(is_tls_failure)
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}
