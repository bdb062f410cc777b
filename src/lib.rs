//! Secure Relay Library
//!
//! HTTP gateway that forwards normalized commands to a partner API over
//! mutual TLS, presenting a client identity taken from a PKCS#12 bundle.
//!
//! # Features
//!
//! - **Caller gatekeeper**: open, shared-secret (`X-API-Key`) or bearer-token (HMAC JWT)
//! - **Envelope normalization**: two accepted command shapes, one canonical form
//! - **Credential cache**: decoded PKCS#12 material memoized with TTL and capacity bounds
//! - **Secure forwarding**: per-call client identity, cleaned up on every exit path
//! - **Production ready**: structured logging, health endpoint, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod mtls;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
