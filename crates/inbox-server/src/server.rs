use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use inbox_core::MailAuthorizer;
use inbox_engine::{AskService, EventBroadcaster, PollHandle};
use inbox_store::EmailRepo;
use inbox_telemetry::SqliteLogSink;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty or `*` allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: EmailRepo,
    pub broadcaster: EventBroadcaster,
    pub ask: AskService,
    pub poll: PollHandle,
    pub authorizer: Arc<dyn MailAuthorizer>,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
    /// Persisted logs served at `/logs`; `None` when SQLite logging is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/emails", get(handlers::list_emails))
        .route("/ask", post(handlers::ask))
        .route("/reset", post(handlers::reset))
        .route("/auth/start", get(handlers::auth_start))
        .route("/auth/callback", get(handlers::auth_callback))
        .route("/events", get(handlers::events))
        .route("/logs", get(handlers::logs))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `cancel` fires. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    state: AppState,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state, &config.cors_origins);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "inbox server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server task to finish after shutdown was requested.
    pub async fn stopped(self) {
        let _ = self.server.await;
    }
}
