//! Scoped on-disk materialization of client identities.
//!
//! The upstream client loads its identity from PEM files. Each call gets its
//! own private temporary directory holding `cert.pem` and `key.pem`; the
//! directory is removed when the [`ScopedMaterial`] guard drops, whichever way
//! the call ends (success, error, timeout or task cancellation).
//!
//! Also provides PEM loading helpers ([`load_certs`], [`load_private_key`])
//! and the rustls client configuration built from the materialized files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::CertificateMaterial;

/// Prefix of every per-call scratch directory.
pub const SCRATCH_PREFIX: &str = "relay-pem-";

/// Failure to turn PEM files into a usable TLS identity.
#[derive(Debug, Error)]
pub enum MaterialError {
    /// File could not be written or read
    #[error("cannot access '{path}': {source}")]
    Io {
        /// Offending path
        path: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// PEM data present but unparseable
    #[error("failed to parse PEM from '{path}': {reason}")]
    Parse {
        /// Offending path
        path: String,
        /// Parser message
        reason: String,
    },

    /// No `CERTIFICATE` block
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// No private key block
    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    /// rustls refused the identity (e.g. key does not match certificate)
    #[error("TLS client config error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Request-scoped copy of a client identity on disk.
#[derive(Debug)]
pub struct ScopedMaterial {
    dir: TempDir,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl ScopedMaterial {
    /// Write the material into a fresh private directory.
    ///
    /// `root` overrides the parent directory (defaults to the OS temp dir).
    pub async fn write(
        material: &CertificateMaterial,
        root: Option<&Path>,
    ) -> Result<Self, MaterialError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| MaterialError::Io {
            path: root.map_or_else(|| "<tmp>".to_string(), |r| r.display().to_string()),
            source: e,
        })?;

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        write_file(&cert_path, material.cert_chain_pem()).await?;
        write_key_file(&key_path, material.private_key_pem()).await?;

        debug!(dir = %dir.path().display(), "Materialized client identity");

        Ok(Self {
            dir,
            cert_path,
            key_path,
        })
    }

    /// Directory holding the files (removed on drop)
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the certificate chain file
    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path of the private key file
    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Build a rustls client config presenting this identity.
    pub fn client_config(&self, roots: Arc<RootCertStore>) -> Result<ClientConfig, MaterialError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), MaterialError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| MaterialError::Io {
            path: path.display().to_string(),
            source: e,
        })
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, MaterialError> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MaterialError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(MaterialError::NoCertificates(path.display().to_string()));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports PKCS#8 (`PRIVATE KEY`), RSA and SEC1 EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, MaterialError> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| MaterialError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| MaterialError::NoPrivateKey(path.display().to_string()))
}

/// Write the private key readable by the owner only.
///
/// The mode is set at creation so the key is never briefly world-readable.
async fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), MaterialError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    let written = async {
        let mut file = options.open(path).await?;
        file.write_all(contents).await?;
        file.flush().await
    }
    .await;

    written.map_err(|e| MaterialError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, MaterialError> {
    fs::read(path).map_err(|e| MaterialError::Io {
        path: path.display().to_string(),
        source: e,
    })
}
