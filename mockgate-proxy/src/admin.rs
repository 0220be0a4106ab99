//! Admin server: health, metrics and the control API.
//!
//! Runs on its own port (default 9998) so probes and registration traffic
//! never share a listener with gRPC callers.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health`, `GET /ready` | Liveness and readiness |
//! | `GET /metrics` | OpenMetrics text |
//! | `/api/v1/...` | Upstream, case and method management |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use prometheus_client::registry::Registry;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ports::admin_port;
use mockgate_core::control::{ControlError, ControlPlane};
use mockgate_core::lifecycle::{LifecycleManager, health_router};
use mockgate_core::store::{Case, UpstreamConfig};

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    pub port: u16,
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: String,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: admin_port(),
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

impl AdminServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<LifecycleManager>,
    pub prom_registry: Arc<Registry>,
    pub control: Arc<ControlPlane>,
}

pub struct AdminServer {
    config: AdminServerConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        prom_registry: Arc<Registry>,
        control: Arc<ControlPlane>,
    ) -> Self {
        Self::with_config(lifecycle, prom_registry, control, AdminServerConfig::default())
    }

    pub fn with_config(
        lifecycle: Arc<LifecycleManager>,
        prom_registry: Arc<Registry>,
        control: Arc<ControlPlane>,
        config: AdminServerConfig,
    ) -> Self {
        Self {
            config,
            state: AdminState {
                lifecycle,
                prom_registry,
                control,
            },
        }
    }

    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/upstreams", get(list_upstreams).post(add_upstream))
            .route("/upstreams/{name}", axum::routing::delete(delete_upstream))
            .route("/apps", get(list_apps))
            .route("/apps/{app}", axum::routing::delete(delete_app))
            .route("/apps/{app}/cases", get(list_cases))
            .route("/cases", put(set_cases))
            .route("/cases/{app}/{name}", get(get_case).delete(delete_case))
            .route("/methods", get(list_methods))
            .route("/methods/detail", get(method_detail))
            .route("/reload", post(reload));

        let admin = Router::new()
            .route("/metrics", get(metrics_handler))
            .nest("/api/v1", api)
            .with_state(self.state.clone());

        health_router(self.state.lifecycle.clone()).merge(admin)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr).await?;

        info!(addr = %bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.prom_registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Control API
// ─────────────────────────────────────────────────────────────────────────────

type ApiResult = Result<axum::response::Response, ControlError>;

#[derive(Debug, Deserialize)]
struct MethodQuery {
    method: String,
}

#[derive(Debug, Deserialize)]
struct DetailQuery {
    method: String,
    #[serde(default)]
    random: bool,
}

async fn list_upstreams(State(state): State<AdminState>) -> ApiResult {
    Ok(Json(state.control.list_upstreams().await?).into_response())
}

async fn add_upstream(
    State(state): State<AdminState>,
    Json(upstream): Json<UpstreamConfig>,
) -> ApiResult {
    let name = upstream.name.clone();
    let methods = state.control.add_upstream(upstream).await?;
    info!(upstream = %name, methods = methods.len(), "Upstream registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": name, "methods": methods })),
    )
        .into_response())
}

async fn delete_upstream(State(state): State<AdminState>, Path(name): Path<String>) -> ApiResult {
    state.control.delete_upstream(&name).await?;
    info!(upstream = %name, "Upstream removed");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_apps(State(state): State<AdminState>) -> ApiResult {
    Ok(Json(state.control.list_apps().await?).into_response())
}

async fn delete_app(State(state): State<AdminState>, Path(app): Path<String>) -> ApiResult {
    let removed = state.control.delete_app(&app).await?;
    info!(app = %app, removed, "App cases removed");
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn list_cases(State(state): State<AdminState>, Path(app): Path<String>) -> ApiResult {
    Ok(Json(state.control.list_cases(&app).await?).into_response())
}

async fn set_cases(State(state): State<AdminState>, Json(cases): Json<Vec<Case>>) -> ApiResult {
    let stored = state.control.set_cases(cases).await?;
    info!(stored, "Cases stored");
    Ok(Json(json!({ "stored": stored })).into_response())
}

async fn get_case(
    State(state): State<AdminState>,
    Path((app, name)): Path<(String, String)>,
    Query(query): Query<MethodQuery>,
) -> ApiResult {
    let case = state.control.get_case(&app, &query.method, &name).await?;
    Ok(Json(case).into_response())
}

async fn delete_case(
    State(state): State<AdminState>,
    Path((app, name)): Path<(String, String)>,
    Query(query): Query<MethodQuery>,
) -> ApiResult {
    state.control.delete_case(&app, &query.method, &name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_methods(State(state): State<AdminState>) -> ApiResult {
    Ok(Json(state.control.list_methods()).into_response())
}

async fn method_detail(
    State(state): State<AdminState>,
    Query(query): Query<DetailQuery>,
) -> ApiResult {
    let detail = state.control.method_detail(&query.method, query.random)?;
    Ok(Json(detail).into_response())
}

async fn reload(State(state): State<AdminState>) -> ApiResult {
    let version = state.control.reload().await?;
    Ok(Json(json!({ "version": version })).into_response())
}
