//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::Gatekeeper;
use super::pipeline::Relay;
use super::router::{AppState, create_router};
use crate::config::{AuthMode, Config};
use crate::{Error, Result};

/// Secure relay server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared application state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the authentication settings or the
    /// upstream trust anchors are unusable.
    pub fn new(config: Config) -> Result<Self> {
        let gatekeeper = Arc::new(Gatekeeper::from_config(&config.auth)?);
        let relay = Arc::new(Relay::from_config(&config)?);

        let state = Arc::new(AppState {
            relay,
            gatekeeper,
            request_timeout: config.server.request_timeout,
        });

        Ok(Self { config, state })
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("SECURE RELAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(
            host = %self.config.server.host,
            port = %self.config.server.port,
            request_timeout_ms = self.config.server.request_timeout.as_millis(),
            "Listening"
        );
        info!(
            "  POST http://{}:{}/secure-request",
            self.config.server.host, self.config.server.port
        );

        let upstream = &self.config.upstream;
        info!(
            default_env = ?upstream.default_env,
            uat = %upstream.uat_base_url,
            prod = %upstream.prod_base_url,
            timeout_ms = upstream.timeout.as_millis(),
            "Upstream"
        );

        let policy = self.config.cache.policy();
        if let Some(ttl) = policy.ttl {
            info!(ttl_secs = ttl.as_secs(), max_entries = policy.max_entries, "Credential cache enabled");
        } else {
            info!("Credential cache disabled");
        }

        match self.state.gatekeeper.mode() {
            AuthMode::Open => {
                warn!("AUTHENTICATION disabled - relay is open to all requests");
            }
            mode => info!(mode = %mode, "AUTHENTICATION enabled"),
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Relay stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
