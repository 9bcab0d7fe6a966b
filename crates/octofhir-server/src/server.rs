use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::get,
};
use octofhir_core::events::EventBroadcaster;
use octofhir_subscriptions::SubscriptionEngine;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, handlers, observability, storage::InMemoryStore, websocket};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<InMemoryStore>,
    pub engine: Arc<SubscriptionEngine>,
    pub events: Arc<EventBroadcaster>,
    /// Serializes `Subscription` writes so the store and the registry change together
    pub subscription_admin: Arc<Mutex<()>>,
}

impl AppState {
    /// Build the store and the subscription engine.
    ///
    /// Must be called within a tokio runtime: consumers of the configured
    /// message topics are spawned here.
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let events = EventBroadcaster::new_shared();
        let engine = SubscriptionEngine::new(cfg.subscriptions.clone(), events.clone())?;
        let consumers = observability::spawn_message_consumers(&engine);
        if !consumers.is_empty() {
            tracing::info!(topics = consumers.len(), "Message topic consumers started");
        }
        Ok(Self {
            config: Arc::new(cfg.clone()),
            store: Arc::new(InMemoryStore::new()),
            engine: Arc::new(engine),
            events,
            subscription_admin: Arc::new(Mutex::new(())),
        })
    }
}

pub struct OctofhirServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
}

pub fn build_app(cfg: &AppConfig) -> anyhow::Result<Router> {
    Ok(router(AppState::new(cfg)?))
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    let fhir = Router::new()
        .route("/metadata", get(handlers::metadata))
        .route(
            "/{resource_type}",
            get(handlers::search_resource).post(handlers::create_resource),
        )
        .route(
            "/{resource_type}/{id}",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        );

    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        // Subscription websocket endpoints
        .route("/websocket", get(websocket::websocket_handler))
        .route(
            "/websocket/{fhir_version}",
            get(websocket::versioned_websocket_handler),
        )
        .nest("/fhir", fhir)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn build(self) -> anyhow::Result<OctofhirServer> {
        let state = AppState::new(&self.config)?;
        Ok(OctofhirServer {
            addr: self.addr,
            app: router(state.clone()),
            state,
        })
    }
}

impl OctofhirServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let logger = observability::spawn_delivery_logger(&self.state.events);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        self.state.engine.shutdown();
        logger.abort();
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
