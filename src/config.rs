//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::mtls::CachePolicy;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Caller authentication
    pub auth: AuthConfig,
    /// Upstream partner API
    pub upstream: UpstreamConfig,
    /// Fallback caller credentials and certificate source
    pub defaults: DefaultsConfig,
    /// Credential cache
    pub cache: CacheConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Bound on a whole inbound request; must exceed `upstream.timeout`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// How inbound callers prove who they are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// No caller authentication
    Open,
    /// `X-API-Key` header compared against a shared secret
    #[default]
    #[serde(alias = "api-key")]
    SharedSecret,
    /// `Authorization: Bearer <jwt>` verified with an HMAC secret
    #[serde(alias = "jwt")]
    BearerToken,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::SharedSecret => "shared-secret",
            Self::BearerToken => "bearer-token",
        })
    }
}

/// Caller authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Authentication mode
    pub mode: AuthMode,
    /// Shared secret for `shared-secret` mode (supports `env:VAR_NAME`)
    pub api_key: Option<String>,
    /// Bearer-token verification settings
    pub jwt: JwtConfig,
}

/// Bearer-token (JWT) verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC secret (supports `env:VAR_NAME`)
    pub secret: Option<String>,
    /// Required `aud` claim
    pub audience: String,
    /// Required `iss` claim
    pub issuer: String,
    /// HMAC algorithm: HS256, HS384 or HS512
    pub algorithm: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: None,
            audience: "fastapi-ssl".to_string(),
            issuer: "n8n".to_string(),
            algorithm: "HS256".to_string(),
        }
    }
}

/// Upstream environment discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamEnv {
    /// User-acceptance environment
    #[default]
    Uat,
    /// Production
    Prod,
}

/// Upstream partner API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Environment used when the request does not pick one
    pub default_env: UpstreamEnv,
    /// Base URL of the UAT environment
    pub uat_base_url: String,
    /// Base URL of the production environment
    pub prod_base_url: String,
    /// Bound on the whole upstream call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra PEM trust anchors for the upstream (private CAs)
    pub ca_cert_path: Option<String>,
    /// Parent directory for per-call identity files (default: OS temp dir)
    pub scratch_dir: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_env: UpstreamEnv::Uat,
            uat_base_url: "https://uat-loyalty.dotznext.com".to_string(),
            prod_base_url: "https://loyalty.dotz.com.br".to_string(),
            timeout: Duration::from_secs(30),
            ca_cert_path: None,
            scratch_dir: None,
        }
    }
}

impl UpstreamConfig {
    /// Base URL for an environment
    #[must_use]
    pub fn base_url(&self, env: UpstreamEnv) -> &str {
        match env {
            UpstreamEnv::Uat => &self.uat_base_url,
            UpstreamEnv::Prod => &self.prod_base_url,
        }
    }

    /// Full command endpoint for an environment
    #[must_use]
    pub fn command_url(&self, env: UpstreamEnv) -> String {
        format!("{}/v1/command", self.base_url(env).trim_end_matches('/'))
    }
}

/// Fallbacks used when a request omits its own credentials or certificate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Upstream client id (supports `env:VAR_NAME`)
    pub client_id: String,
    /// Upstream client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// 14-digit company tax id sent as `Id`
    pub cnpj_id: String,
    /// Path of the default PKCS#12 bundle
    pub pfx_path: String,
    /// Passphrase of the default bundle (supports `env:VAR_NAME`)
    pub pfx_password: String,
}

/// Credential cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in seconds; zero or negative disables caching
    pub ttl_seconds: i64,
    /// Maximum number of entries before eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 50,
        }
    }
}

impl CacheConfig {
    /// Cache policy derived from this configuration
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        CachePolicy::from_config(self.ttl_seconds, self.max_entries)
    }
}

/// Resolve a secret reference (`env:VAR_NAME` or a literal value)
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or carries invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SECURE_RELAY_ prefix)
        figment = figment.merge(Env::prefixed("SECURE_RELAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before secret resolution)
        config.load_env_files();
        config.resolve_secrets();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `env:VAR_NAME` references in secret-bearing fields
    fn resolve_secrets(&mut self) {
        if let Some(key) = self.auth.api_key.as_mut() {
            *key = resolve_secret(key);
        }
        if let Some(secret) = self.auth.jwt.secret.as_mut() {
            *secret = resolve_secret(secret);
        }
        let defaults = &mut self.defaults;
        for field in [
            &mut defaults.client_id,
            &mut defaults.client_secret,
            &mut defaults.pfx_password,
        ] {
            *field = resolve_secret(field);
        }
    }

    /// Reject values that can never work at request time
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("upstream.uat_base_url", &self.upstream.uat_base_url),
            ("upstream.prod_base_url", &self.upstream.prod_base_url),
        ] {
            let url = Url::parse(value)
                .map_err(|e| Error::Config(format!("{name} is not a valid URL ({value}): {e}")))?;
            if !matches!(url.scheme(), "https" | "http") {
                return Err(Error::Config(format!("{name} must be an http(s) URL: {value}")));
            }
        }

        if !matches!(self.auth.jwt.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            return Err(Error::Config(format!(
                "auth.jwt.algorithm must be HS256, HS384 or HS512 (got {})",
                self.auth.jwt.algorithm
            )));
        }

        if self.upstream.timeout.is_zero() {
            return Err(Error::Config("upstream.timeout must be positive".to_string()));
        }
        if self.server.request_timeout <= self.upstream.timeout {
            return Err(Error::Config(format!(
                "server.request_timeout ({:?}) must be longer than upstream.timeout ({:?})",
                self.server.request_timeout, self.upstream.timeout
            )));
        }

        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// Bare numbers are seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };

        // "ms" must be checked before the bare "s" / "m" suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
