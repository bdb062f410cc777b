//! Caller authentication middleware
//!
//! Supports:
//! - Open mode (no authentication, logged at startup)
//! - Shared-secret authentication via the `X-API-Key` header
//! - Bearer-token (HMAC JWT) authentication with audience and issuer checks

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthMode};
use crate::{Error, Result};

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-api-key";

/// Caller rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Missing or invalid credential
    #[error("{0}")]
    Unauthorized(String),

    /// The selected mode cannot work with the server's configuration
    #[error("{0}")]
    MisconfiguredServer(String),
}

/// Authentication resolved from configuration (secrets expanded)
#[derive(Debug)]
pub struct Gatekeeper {
    mode: AuthMode,
    shared_secret: Option<String>,
    jwt_secret: Option<String>,
    validation: Validation,
}

impl Gatekeeper {
    /// Build the gatekeeper from [`AuthConfig`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unsupported JWT algorithm.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.jwt.algorithm)
            .ok()
            .filter(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unsupported JWT algorithm: {}",
                    config.jwt.algorithm
                ))
            })?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[config.jwt.audience.as_str()]);
        validation.set_issuer(&[config.jwt.issuer.as_str()]);
        // exp is checked when present but not demanded
        validation.set_required_spec_claims(&["aud", "iss"]);

        let shared_secret = config.api_key.clone().filter(|k| !k.is_empty());
        let jwt_secret = config.jwt.secret.clone().filter(|s| !s.is_empty());

        let mode = match config.mode {
            AuthMode::SharedSecret if shared_secret.is_none() => {
                warn!("auth.mode is shared-secret but no api_key is configured; running OPEN");
                AuthMode::Open
            }
            AuthMode::BearerToken if jwt_secret.is_none() => {
                warn!("auth.mode is bearer-token but no jwt.secret is configured; every request will fail");
                AuthMode::BearerToken
            }
            mode => mode,
        };

        Ok(Self {
            mode,
            shared_secret,
            jwt_secret,
            validation,
        })
    }

    /// Mode actually enforced (after degradation)
    #[must_use]
    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Check the caller's credential.
    pub fn authenticate(&self, headers: &HeaderMap) -> std::result::Result<(), AuthError> {
        match self.mode {
            AuthMode::Open => Ok(()),
            AuthMode::SharedSecret => self.check_shared_secret(headers),
            AuthMode::BearerToken => self.check_bearer(headers),
        }
    }

    fn check_shared_secret(&self, headers: &HeaderMap) -> std::result::Result<(), AuthError> {
        let Some(expected) = self.shared_secret.as_deref() else {
            return Ok(());
        };
        let presented = headers
            .get(API_KEY_HEADER)
            .ok_or_else(|| AuthError::Unauthorized("Missing X-API-Key header".to_string()))?;

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(AuthError::Unauthorized("Invalid API key".to_string()))
        }
    }

    fn check_bearer(&self, headers: &HeaderMap) -> std::result::Result<(), AuthError> {
        let Some(secret) = self.jwt_secret.as_deref() else {
            return Err(AuthError::MisconfiguredServer(
                "bearer-token authentication has no secret configured".to_string(),
            ));
        };

        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| {
                AuthError::Unauthorized(
                    "Missing Authorization header. Use: Authorization: Bearer <token>".to_string(),
                )
            })?;

        decode::<serde_json::Value>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &self.validation,
        )
        .map(|_| ())
        .map_err(|e| AuthError::Unauthorized(format!("Invalid bearer token: {e}")))
    }
}

/// Strip a case-insensitive `Bearer ` scheme
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match gatekeeper.authenticate(request.headers()) {
        Ok(()) => {
            debug!(path = %path, mode = %gatekeeper.mode(), "Caller authenticated");
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, reason = %e, "Caller rejected");
            Error::from(e).into_response()
        }
    }
}
