// ============================================================================
// SECTION 10: HTTP SURFACE
// ============================================================================
// Serves the registry over HTTP:
// - GET <metrics_path>  text exposition of every enabled domain
// - GET /health         per-domain refresh health as JSON
// - GET /               landing page
// Shutdown on SIGINT/SIGTERM drains in-flight scrapes, then stops collectors.
// ============================================================================

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cache::HealthRecord;
use crate::collector::CollectorRegistry;
use crate::config::ServerConfig;
use crate::error::{ExporterError, ExporterResult};
use crate::logging::PerfTimer;
use crate::{EXPORTER_FULL_NAME, EXPORTER_VERSION};

/// Content type of the Prometheus text format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// ----------------------------------------------------------------------------
// 10.1 Shared State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<CollectorRegistry>,
    pub metrics_path: Arc<str>,
}

impl AppState {
    pub fn new(registry: Arc<CollectorRegistry>, metrics_path: &str) -> Self {
        Self {
            registry,
            metrics_path: Arc::from(metrics_path),
        }
    }
}

/// Exposition failures surface as a plain 500.
#[derive(Debug)]
pub struct ServerError(ExporterError);

impl From<ExporterError> for ServerError {
    fn from(err: ExporterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        error!(target: "sonic::http", error = %self.0, "Failed to render metrics");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

// ----------------------------------------------------------------------------
// 10.2 Handlers
// ----------------------------------------------------------------------------

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ServerError> {
    let timer = PerfTimer::with_threshold("http_metrics", 1_000);
    let body = state.registry.render().await?;
    timer.stop();

    Ok(([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response())
}

#[derive(Debug, Serialize)]
pub struct DomainHealth {
    pub domain: &'static str,
    #[serde(flatten)]
    pub record: HealthRecord,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub domains: Vec<DomainHealth>,
}

impl HealthReport {
    pub fn from_registry(registry: &CollectorRegistry) -> Self {
        let domains: Vec<DomainHealth> = registry
            .health()
            .into_iter()
            .map(|(domain, record)| DomainHealth { domain, record })
            .collect();
        let status = if domains.iter().all(|d| d.record.success) {
            "ok"
        } else {
            "degraded"
        };

        Self {
            status,
            version: EXPORTER_VERSION,
            domains,
        }
    }
}

/// Always 200; scrape health is reported in the body, not the status.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport::from_registry(&state.registry))
}

pub async fn landing(State(state): State<AppState>) -> Html<String> {
    let domains: String = state
        .registry
        .enabled()
        .map(|c| format!("<li>{}</li>", c.name()))
        .collect();

    Html(format!(
        "<html><head><title>{name}</title></head><body>\
         <h1>{name} {version}</h1>\
         <p><a href=\"{path}\">Metrics</a> | <a href=\"/health\">Health</a></p>\
         <ul>{domains}</ul>\
         </body></html>",
        name = EXPORTER_FULL_NAME,
        version = EXPORTER_VERSION,
        path = state.metrics_path,
    ))
}

/// The metrics path takes precedence over the fixed routes it shadows.
pub fn router(state: AppState) -> Router {
    let metrics_path = state.metrics_path.clone();
    let mut router = Router::new().route(&metrics_path, get(metrics));
    for (path, handler) in [("/", get(landing)), ("/health", get(health))] {
        if path != &*metrics_path {
            router = router.route(path, handler);
        }
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

// ----------------------------------------------------------------------------
// 10.3 Serve & Shutdown
// ----------------------------------------------------------------------------

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!(target: "sonic::engine", "Received SIGTERM"),
                    _ = sigint.recv() => info!(target: "sonic::engine", "Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(target: "sonic::engine", error = %e, "Signal handlers unavailable, falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "sonic::engine", error = %e, "Failed to wait for ctrl-c");
    }
}

/// Serve on an already bound listener until `shutdown` resolves, then stop
/// every collector.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> ExporterResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let app = router(state);

    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;

    info!(target: "sonic::engine", "HTTP server stopped, stopping collectors");
    registry.stop_all().await;
    result.map_err(ExporterError::Io)
}

/// Start collectors, bind `config.listen_address`, and serve until a
/// termination signal arrives.
pub async fn serve(config: &ServerConfig, registry: Arc<CollectorRegistry>) -> ExporterResult<()> {
    let addr: SocketAddr = config
        .listen_address
        .parse()
        .map_err(|e: std::net::AddrParseError| ExporterError::Internal(e.to_string()))?;

    registry.start_all().await;

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            registry.stop_all().await;
            return Err(ExporterError::Io(e));
        }
    };
    info!(
        target: "sonic::engine",
        address = %addr,
        path = %config.metrics_path,
        "Listening"
    );

    let state = AppState::new(registry, &config.metrics_path);
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::domains::VlanPipeline;
    use crate::store::{Database, MemoryStore};
    use crate::DomainEngine;
    use pretty_assertions::assert_eq;

    fn state() -> AppState {
        let store = Arc::new(
            MemoryStore::new()
                .with_hash(Database::ConfigDb, "VLAN|Vlan1000", [("vlanid", "1000")])
                .with_hash(Database::ConfigDb, "VLAN_MEMBER|Vlan1000|Ethernet0", [("tagging_mode", "untagged")]),
        );
        let mut registry = CollectorRegistry::new();
        registry.register(DomainEngine::new(VlanPipeline::new(), store, DomainConfig::default()));
        AppState::new(Arc::new(registry), "/metrics")
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let state = state();
        state.registry.refresh_all().await;

        let response = metrics(State(state)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TEXT_CONTENT_TYPE
        );
        let text = body_text(response).await;
        assert!(text.contains("sonic_vlan_members{vlan=\"Vlan1000\"} 1"));
        assert!(text.contains("sonic_vlan_collector_success 1"));
    }

    #[tokio::test]
    async fn test_health_report() {
        let state = state();
        let Json(before) = health(State(state.clone())).await;
        assert_eq!(before.status, "degraded");
        assert_eq!(before.domains.len(), 1);

        state.registry.refresh_all().await;
        let Json(after) = health(State(state)).await;
        assert_eq!(after.status, "ok");
        assert_eq!(after.domains[0].domain, "vlan");
        assert!(after.domains[0].record.success);

        let json = serde_json::to_value(&after).unwrap();
        assert_eq!(json["domains"][0]["domain"], "vlan");
        assert_eq!(json["domains"][0]["success"], true);
    }

    #[tokio::test]
    async fn test_landing_links_metrics_path() {
        let Html(page) = landing(State(AppState::new(state().registry, "/custom"))).await;
        assert!(page.contains("href=\"/custom\""));
        assert!(page.contains("<li>vlan</li>"));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let state = state();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve_with_shutdown(listener, state, async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
