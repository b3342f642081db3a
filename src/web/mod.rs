//! Web layer
//!
//! One axum router for every surface: the intent API (bearer auth with
//! scopes), the HLS delivery endpoints, the static artifact surface, the
//! health endpoint, and the externally built WebUI. Handlers are thin;
//! session logic lives in the orchestrator.

use anyhow::Result;
use axum::Router;
use axum::middleware::from_fn;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod responses;

pub use responses::Problem;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::orchestrator::SessionOrchestrator;
use crate::store::Store;
use auth::TokenSet;
use handlers::hls::PreparingBackoff;
use handlers::{files, hls, intents, webui};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub tokens: Arc<TokenSet>,
    pub preparing_backoff: Arc<PreparingBackoff>,
    pub hls_root: PathBuf,
    pub data_dir: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: &Config,
        orchestrator: Arc<SessionOrchestrator>,
        store: Store,
        metrics: Arc<Metrics>,
    ) -> Self {
        AppState {
            orchestrator,
            store,
            metrics,
            tokens: Arc::new(TokenSet::from_config(&config.auth)),
            preparing_backoff: Arc::new(PreparingBackoff::default()),
            hls_root: config.storage.hls_root.clone(),
            data_dir: config.storage.data_dir.clone(),
            started_at: Instant::now(),
        }
    }
}

/// Build the full application router
pub fn router(state: AppState, webui_dir: Option<&std::path::Path>) -> Router {
    let write_routes = Router::new()
        .route("/api/v3/intents", post(intents::post_intent))
        .route_layer(from_fn_with_state(state.clone(), auth::require_write));

    let read_routes = Router::new()
        .route("/api/v3/sessions", get(intents::list_sessions))
        .route("/api/v3/sessions/{id}", get(intents::get_session))
        .route("/api/v3/system/decision", post(intents::post_decision))
        .route_layer(from_fn_with_state(state.clone(), auth::require_read));

    let open_routes = Router::new()
        .route("/api/v3/system/health", get(intents::health))
        .route("/hls/{session_id}/{file}", get(hls::serve))
        .route("/files/{*name}", get(files::serve));

    let mut router = Router::new()
        .merge(write_routes)
        .merge(read_routes)
        .merge(open_routes);

    if let Some(dir) = webui_dir {
        router = router.fallback_service(webui::service(dir));
    }

    router
        .layer(from_fn(middleware::security_headers))
        .layer(from_fn(middleware::request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    router: Router,
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
}

impl WebServer {
    pub fn new(config: &Config, state: AppState) -> Result<Self> {
        let addr: SocketAddr = config.web.listen_addr.parse()?;
        let tls = match (&config.web.tls_cert, &config.web.tls_key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        };
        let router = router(state, config.webui.dir.as_deref());
        Ok(WebServer { router, addr, tls })
    }

    /// Serve until `shutdown` is cancelled, then drain connections
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });
        }

        let make_service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        match self.tls {
            Some((cert, key)) => {
                let tls_config =
                    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
                info!(addr = %self.addr, "listening (tls)");
                axum_server::bind_rustls(self.addr, tls_config)
                    .handle(handle)
                    .serve(make_service)
                    .await?;
            }
            None => {
                info!(addr = %self.addr, "listening");
                axum_server::bind(self.addr)
                    .handle(handle)
                    .serve(make_service)
                    .await?;
            }
        }
        Ok(())
    }
}
