//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::client::SecurityClient;
use crate::config::Config;
use crate::coordinator::{AuthCoordinator, TokioTimer};
use crate::registry::PendingRegistry;
use crate::{Error, Result};

/// Certificate authentication gateway
pub struct Gateway {
    config: Arc<Config>,
    coordinator: Arc<AuthCoordinator>,
}

impl Gateway {
    /// Build the gateway and connect to the security service.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing key cannot be resolved or the security
    /// client cannot be initialized.
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Handle::current();
        let client = Arc::new(SecurityClient::from_config(&config.security, runtime.clone())?);
        client.initialize()?;

        let coordinator = AuthCoordinator::new(
            client,
            Arc::new(PendingRegistry::new()),
            Arc::new(TokioTimer::new(runtime)),
            config.auth.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            coordinator,
        })
    }

    /// Build a gateway around an existing coordinator
    #[must_use]
    pub fn with_coordinator(config: Config, coordinator: Arc<AuthCoordinator>) -> Self {
        Self {
            config: Arc::new(config),
            coordinator,
        }
    }

    /// The coordinator serving `/auth`
    #[must_use]
    pub fn coordinator(&self) -> &Arc<AuthCoordinator> {
        &self.coordinator
    }

    /// The HTTP router
    pub fn router(&self) -> axum::Router {
        create_router(Arc::new(AppState {
            coordinator: Arc::clone(&self.coordinator),
            config: Arc::clone(&self.config),
        }))
    }

    /// Run the gateway until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        info!("============================================================");
        info!("CERTAUTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Listening");
        }
        info!(security_service = %self.config.security.url, "Security service");
        info!(
            poll_period = ?self.config.auth.poll_period,
            max_poll_attempts = self.config.auth.max_poll_attempts,
            reinit_on_reset = self.config.auth.reinit_on_reset,
            "Poll policy"
        );
        if self.config.routes.is_empty() {
            warn!("No routes configured - every request will be denied");
        }
        for (prefix, route) in &self.config.routes {
            info!(prefix = %prefix, operations = ?route.operations, "Route");
        }
        info!("============================================================");

        // Cache maintenance
        let client = Arc::clone(self.coordinator.client());
        let interval = self.config.security.cache_ttl.max(std::time::Duration::from_secs(1));
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => client.evict_expired(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!(pending = self.coordinator.pending(), "Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
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
    let _ = shutdown_tx.send(());
}
