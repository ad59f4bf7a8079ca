use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use librc2::{AppConfig, K8sServer, Orchestrator, Rc2Dao, SessionConfig, SessionRegistry};

use crate::auth::TokenSigner;
use crate::ws;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub signer: TokenSigner,
}

impl AppState {
    /// Wire the registry and token signer from configuration. Orchestrated
    /// mode is used when an `[orchestration]` table is present.
    pub fn from_config(config: &AppConfig, dao: Arc<dyn Rc2Dao>) -> Result<Arc<Self>> {
        let secret = config
            .auth
            .token_secret
            .as_deref()
            .ok_or_else(|| anyhow!("auth.token_secret must be configured"))?;
        let signer = TokenSigner::new(secret).context("invalid auth.token_secret")?;

        let orchestrator: Option<Arc<dyn Orchestrator>> = match &config.orchestration {
            Some(orch) => {
                let k8s = K8sServer::new(orch).context("failed to set up orchestration")?;
                info!(namespace = %orch.namespace, image = %orch.image, "compute engines are orchestrated");
                Some(Arc::new(k8s))
            }
            None => {
                info!(host = %config.compute.host, port = config.compute.port, "using a fixed compute engine");
                None
            }
        };
        let session_config = SessionConfig::from_app_config(config, orchestrator);
        let registry = SessionRegistry::new(dao, session_config, config.reap_delay());
        Ok(Arc::new(Self { registry, signer }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{wspace_id}", get(ws::ws_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then shut down every session and wait
/// for open connections to finish.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let registry = state.registry.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            registry.shutdown_all().await;
        })
        .await
        .context("server failed")
}
