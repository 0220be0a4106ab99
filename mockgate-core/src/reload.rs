//! Hot reload loop.
//!
//! Each cycle reads every upstream and case from the store, re-resolves
//! every backend schema, and builds a fresh [`Snapshot`]. The new snapshot
//! replaces the old one only if the whole rebuild succeeded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rule::RuleError;
use crate::schema::{SchemaError, SchemaSource};
use crate::snapshot::{Snapshot, SnapshotBuilder, SnapshotHandle};
use crate::store::{CaseStore, StoreError};
use crate::telemetry::MockGateMetrics;
use crate::upstream::{BackendPool, UpstreamError};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upstream {name}: {source}")]
    Upstream {
        name: String,
        #[source]
        source: UpstreamError,
    },

    #[error("upstream {name}: schema unavailable: {source}")]
    Schema {
        name: String,
        #[source]
        source: SchemaError,
    },

    #[error("case {app}/{method}/{case}: {source}")]
    Rule {
        app: String,
        method: String,
        case: String,
        #[source]
        source: RuleError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSettings {
    pub interval: Duration,
    pub retry_backoff: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3000),
            retry_backoff: Duration::from_millis(1000),
        }
    }
}

pub struct Reloader {
    store: Arc<dyn CaseStore>,
    schema: Arc<dyn SchemaSource>,
    pool: BackendPool,
    handle: SnapshotHandle,
    settings: ReloadSettings,
    trigger: Notify,
    next_version: AtomicU64,
    metrics: Option<Arc<MockGateMetrics>>,
}

impl Reloader {
    pub fn new(
        store: Arc<dyn CaseStore>,
        schema: Arc<dyn SchemaSource>,
        pool: BackendPool,
        handle: SnapshotHandle,
        settings: ReloadSettings,
    ) -> Self {
        let next_version = AtomicU64::new(handle.version() + 1);
        Self {
            store,
            schema,
            pool,
            handle,
            settings,
            trigger: Notify::new(),
            next_version,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MockGateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> &SnapshotHandle {
        &self.handle
    }

    /// Wake the loop so the next rebuild starts now.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Build a snapshot from the store's current contents without
    /// publishing it.
    ///
    /// # Errors
    ///
    /// Any store, connection, schema, or rule failure aborts the build.
    pub async fn rebuild(&self) -> Result<Snapshot, ReloadError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let mut builder = SnapshotBuilder::new(version);

        let upstreams: BTreeMap<String, _> = self
            .store
            .list_upstreams()
            .await?
            .into_iter()
            .map(|u| (u.name.clone(), u))
            .collect();
        for (name, upstream) in upstreams {
            let backend = self
                .pool
                .connect(&upstream)
                .map_err(|source| ReloadError::Upstream {
                    name: name.clone(),
                    source,
                })?;
            let services = self
                .schema
                .resolve(&backend)
                .await
                .map_err(|source| ReloadError::Schema {
                    name: name.clone(),
                    source,
                })?;
            builder.add_upstream(backend, &services);
        }

        for app in self.store.list_apps().await? {
            for case in self.store.list_cases_for(&app).await? {
                let (app, method, name) = (case.app.clone(), case.method.clone(), case.name.clone());
                builder
                    .add_case(case)
                    .map_err(|source| ReloadError::Rule {
                        app,
                        method,
                        case: name,
                        source,
                    })?;
            }
        }

        Ok(builder.build())
    }

    /// Rebuild and publish. Returns the published version.
    pub async fn reload_once(&self) -> Result<u64, ReloadError> {
        let result = self.rebuild().await;
        if let Some(metrics) = &self.metrics {
            metrics.record_reload(result.is_ok());
        }
        let snapshot = result?;
        let version = snapshot.version();
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(version, snapshot.method_count(), snapshot.case_count());
        }
        debug!(
            version,
            methods = snapshot.method_count(),
            cases = snapshot.case_count(),
            "Published snapshot"
        );
        self.handle.publish(snapshot);
        Ok(version)
    }

    /// Reload until `shutdown` fires: immediately, then every interval, or
    /// after the retry backoff when the last attempt failed. A [`trigger`]
    /// cuts the wait short.
    ///
    /// [`trigger`]: Reloader::trigger
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "Snapshot reload loop started"
        );
        loop {
            let delay = match self.reload_once().await {
                Ok(_) => self.settings.interval,
                Err(e) => {
                    warn!(error = %e, "Snapshot rebuild failed, keeping previous snapshot");
                    self.settings.retry_backoff
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.trigger.notified() => {}
            }
        }
        info!("Snapshot reload loop stopped");
    }
}
