//! Write-side operations over the case store and upstream list.
//!
//! The admin server's `/api/v1` routes are thin wrappers around
//! [`ControlPlane`]. Writes go to the store only after validation, then
//! nudge the reload loop; the snapshot itself is never edited here.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::reload::{ReloadError, Reloader};
use crate::rule::{Rule, RuleError};
use crate::schema::{CodecError, JsonOptions, SchemaError, SchemaSource, encode_json, template};
use crate::snapshot::SnapshotHandle;
use crate::store::{Case, CaseStore, StoreError, UpstreamConfig};
use crate::upstream::{BackendPool, UpstreamError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("schema unavailable for upstream {name}: {source}")]
    SchemaUnavailable {
        name: String,
        #[source]
        source: SchemaError,
    },

    #[error("case {name}: body does not match {method} output: {source}")]
    CaseBody {
        name: String,
        method: String,
        #[source]
        source: CodecError,
    },

    #[error("case {name}: {source}")]
    CaseRule {
        name: String,
        #[source]
        source: RuleError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reload(#[from] ReloadError),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Invalid(_)
            | ControlError::Upstream(_)
            | ControlError::CaseBody { .. }
            | ControlError::CaseRule { .. } => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::SchemaUnavailable { .. } | ControlError::Reload(_) => StatusCode::BAD_GATEWAY,
            ControlError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Control request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Upstream as reported by the control API. Tokens are never echoed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamView {
    pub name: String,
    pub endpoints: Vec<String>,
    pub has_token: bool,
    /// Methods routed to this upstream in the current snapshot.
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodDetail {
    pub method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
}

pub struct ControlPlane {
    store: Arc<dyn CaseStore>,
    schema: Arc<dyn SchemaSource>,
    pool: BackendPool,
    reloader: Arc<Reloader>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn CaseStore>,
        schema: Arc<dyn SchemaSource>,
        pool: BackendPool,
        reloader: Arc<Reloader>,
    ) -> Self {
        Self {
            store,
            schema,
            pool,
            reloader,
        }
    }

    fn snapshot(&self) -> &SnapshotHandle {
        self.reloader.handle()
    }

    pub async fn list_upstreams(&self) -> Result<Vec<UpstreamView>, ControlError> {
        let snapshot = self.snapshot().load();
        let upstreams = self.store.list_upstreams().await?;
        Ok(upstreams
            .into_iter()
            .map(|u| UpstreamView {
                methods: snapshot
                    .upstream_methods()
                    .get(&u.name)
                    .cloned()
                    .unwrap_or_default(),
                has_token: u.token.as_deref().is_some_and(|t| !t.is_empty()),
                name: u.name,
                endpoints: u.endpoints,
            })
            .collect())
    }

    /// Register an upstream. The backend must be reachable and its schema
    /// resolvable before anything is stored.
    ///
    /// Returns the method paths the upstream serves.
    pub async fn add_upstream(&self, upstream: UpstreamConfig) -> Result<Vec<String>, ControlError> {
        if upstream.name.trim().is_empty() {
            return Err(ControlError::Invalid("upstream name is empty".into()));
        }
        let backend = self.pool.connect(&upstream)?;
        let services = self
            .schema
            .resolve(&backend)
            .await
            .map_err(|source| ControlError::SchemaUnavailable {
                name: upstream.name.clone(),
                source,
            })?;
        let mut methods: Vec<String> = services
            .iter()
            .flat_map(|s| s.methods.iter().map(|m| m.full_name.clone()))
            .collect();
        methods.sort();

        info!(upstream = %upstream.name, methods = methods.len(), "Upstream registered");
        self.store.add_upstream(upstream).await?;
        self.reloader.trigger();
        Ok(methods)
    }

    pub async fn delete_upstream(&self, name: &str) -> Result<(), ControlError> {
        if !self.store.delete_upstream(name).await? {
            return Err(ControlError::NotFound(format!("upstream {name}")));
        }
        info!(upstream = name, "Upstream removed");
        self.reloader.trigger();
        Ok(())
    }

    pub async fn list_apps(&self) -> Result<Vec<String>, ControlError> {
        Ok(self.store.list_apps().await?)
    }

    /// Returns how many cases were removed.
    pub async fn delete_app(&self, app: &str) -> Result<usize, ControlError> {
        let removed = self.store.delete_app(app).await?;
        if removed == 0 {
            return Err(ControlError::NotFound(format!("app {app}")));
        }
        self.reloader.trigger();
        Ok(removed)
    }

    pub async fn list_cases(&self, app: &str) -> Result<Vec<Case>, ControlError> {
        Ok(self.store.list_cases_for(app).await?)
    }

    /// Store a batch of cases. Every case is validated against the current
    /// snapshot first; if any is rejected nothing is stored.
    pub async fn set_cases(&self, cases: Vec<Case>) -> Result<usize, ControlError> {
        if cases.is_empty() {
            return Err(ControlError::Invalid("no cases given".into()));
        }
        let snapshot = self.snapshot().load();
        for case in &cases {
            if case.app.is_empty() || case.method.is_empty() || case.name.is_empty() {
                return Err(ControlError::Invalid(
                    "case app, method and name must be non-empty".into(),
                ));
            }
            let route = snapshot
                .lookup_method(&case.method)
                .ok_or_else(|| ControlError::NotFound(format!("method {}", case.method)))?;
            encode_json(&route.descriptor.output, &case.body).map_err(|source| {
                ControlError::CaseBody {
                    name: case.name.clone(),
                    method: case.method.clone(),
                    source,
                }
            })?;
            if !case.rule.trim().is_empty() {
                Rule::compile(&case.rule).map_err(|source| ControlError::CaseRule {
                    name: case.name.clone(),
                    source,
                })?;
            }
        }

        let count = cases.len();
        for case in cases {
            self.store.set_case(case).await?;
        }
        info!(cases = count, "Cases stored");
        self.reloader.trigger();
        Ok(count)
    }

    pub async fn get_case(&self, app: &str, method: &str, name: &str) -> Result<Case, ControlError> {
        self.store
            .get_case(app, method, name)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("case {app}/{method}/{name}")))
    }

    pub async fn delete_case(&self, app: &str, method: &str, name: &str) -> Result<(), ControlError> {
        if !self.store.delete_case(app, method, name).await? {
            return Err(ControlError::NotFound(format!("case {app}/{method}/{name}")));
        }
        self.reloader.trigger();
        Ok(())
    }

    /// Service name → method paths, from the current snapshot.
    pub fn list_methods(&self) -> BTreeMap<String, Vec<String>> {
        let snapshot = self.snapshot().load();
        let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for route in snapshot.routes() {
            services
                .entry(route.descriptor.service.clone())
                .or_default()
                .push(route.descriptor.full_name.clone());
        }
        for methods in services.values_mut() {
            methods.sort();
        }
        services
    }

    /// Input and output templates of a method, for writing cases.
    pub fn method_detail(&self, method: &str, random: bool) -> Result<MethodDetail, ControlError> {
        let snapshot = self.snapshot().load();
        let route = snapshot
            .lookup_method(method)
            .ok_or_else(|| ControlError::NotFound(format!("method {method}")))?;
        let opts = JsonOptions {
            random_defaults: random,
            ..JsonOptions::default()
        };
        let descriptor = &route.descriptor;
        Ok(MethodDetail {
            method: descriptor.full_name.clone(),
            client_streaming: descriptor.client_streaming,
            server_streaming: descriptor.server_streaming,
            input: template(&descriptor.input, &opts),
            output: template(&descriptor.output, &opts),
        })
    }

    /// Rebuild and publish now. Returns the new snapshot version.
    pub async fn reload(&self) -> Result<u64, ControlError> {
        Ok(self.reloader.reload_once().await?)
    }
}
