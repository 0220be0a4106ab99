//! Case and upstream storage.
//!
//! The store is the only mutable state in the system. The reload loop polls
//! it and the control plane writes to it; neither holds a transaction open
//! across calls.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("case store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// A registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A named mock response for one (app, method).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(alias = "tested_app_name")]
    pub app: String,
    /// Full method path, `/pkg.Service/Method`.
    pub method: String,
    #[serde(alias = "case_name")]
    pub name: String,
    /// Boolean expression over the request; empty means the case is only
    /// reachable by name.
    #[serde(default)]
    pub rule: String,
    /// Higher priorities are tried first when several rules could match.
    #[serde(default)]
    pub priority: i32,
    /// JSON view of the response message.
    pub body: serde_json::Value,
}

impl Case {
    pub fn key(&self) -> CaseKey {
        CaseKey {
            app: self.app.clone(),
            method: self.method.clone(),
            name: self.name.clone(),
        }
    }
}

/// Unique identity of a case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaseKey {
    pub app: String,
    pub method: String,
    pub name: String,
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn list_upstreams(&self) -> Result<Vec<UpstreamConfig>, StoreError>;

    async fn get_upstream(&self, name: &str) -> Result<Option<UpstreamConfig>, StoreError>;

    /// Insert or replace by name.
    async fn add_upstream(&self, upstream: UpstreamConfig) -> Result<(), StoreError>;

    /// Returns whether an upstream was removed.
    async fn delete_upstream(&self, name: &str) -> Result<bool, StoreError>;

    /// Apps with at least one case, sorted.
    async fn list_apps(&self) -> Result<Vec<String>, StoreError>;

    /// Cases of one app in registration order.
    async fn list_cases_for(&self, app: &str) -> Result<Vec<Case>, StoreError>;

    async fn get_case(&self, app: &str, method: &str, name: &str) -> Result<Option<Case>, StoreError>;

    /// Insert or replace by key. A replaced case keeps its registration slot.
    async fn set_case(&self, case: Case) -> Result<(), StoreError>;

    async fn delete_case(&self, app: &str, method: &str, name: &str) -> Result<bool, StoreError>;

    /// Remove every case of an app, returning how many were removed.
    async fn delete_app(&self, app: &str) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    upstreams: BTreeMap<String, UpstreamConfig>,
    cases: BTreeMap<CaseKey, (u64, Case)>,
    next_seq: u64,
}

/// Process-local [`CaseStore`].
#[derive(Default)]
pub struct MemoryCaseStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn list_upstreams(&self) -> Result<Vec<UpstreamConfig>, StoreError> {
        Ok(self.inner.read().upstreams.values().cloned().collect())
    }

    async fn get_upstream(&self, name: &str) -> Result<Option<UpstreamConfig>, StoreError> {
        Ok(self.inner.read().upstreams.get(name).cloned())
    }

    async fn add_upstream(&self, upstream: UpstreamConfig) -> Result<(), StoreError> {
        if upstream.name.is_empty() {
            return Err(StoreError::Invalid("upstream name is empty".into()));
        }
        self.inner
            .write()
            .upstreams
            .insert(upstream.name.clone(), upstream);
        Ok(())
    }

    async fn delete_upstream(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().upstreams.remove(name).is_some())
    }

    async fn list_apps(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        let apps: BTreeSet<&String> = inner.cases.keys().map(|k| &k.app).collect();
        Ok(apps.into_iter().cloned().collect())
    }

    async fn list_cases_for(&self, app: &str) -> Result<Vec<Case>, StoreError> {
        let inner = self.inner.read();
        let mut cases: Vec<&(u64, Case)> = inner
            .cases
            .iter()
            .filter(|(key, _)| key.app == app)
            .map(|(_, entry)| entry)
            .collect();
        cases.sort_by_key(|(seq, _)| *seq);
        Ok(cases.into_iter().map(|(_, case)| case.clone()).collect())
    }

    async fn get_case(&self, app: &str, method: &str, name: &str) -> Result<Option<Case>, StoreError> {
        let key = CaseKey {
            app: app.to_string(),
            method: method.to_string(),
            name: name.to_string(),
        };
        Ok(self.inner.read().cases.get(&key).map(|(_, case)| case.clone()))
    }

    async fn set_case(&self, case: Case) -> Result<(), StoreError> {
        if case.app.is_empty() || case.method.is_empty() || case.name.is_empty() {
            return Err(StoreError::Invalid(
                "case app, method and name must be non-empty".into(),
            ));
        }
        let mut inner = self.inner.write();
        let key = case.key();
        let existing = inner.cases.get(&key).map(|(seq, _)| *seq);
        let seq = match existing {
            Some(seq) => seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.cases.insert(key, (seq, case));
        Ok(())
    }

    async fn delete_case(&self, app: &str, method: &str, name: &str) -> Result<bool, StoreError> {
        let key = CaseKey {
            app: app.to_string(),
            method: method.to_string(),
            name: name.to_string(),
        };
        Ok(self.inner.write().cases.remove(&key).is_some())
    }

    async fn delete_app(&self, app: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.cases.len();
        inner.cases.retain(|key, _| key.app != app);
        Ok(before - inner.cases.len())
    }
}
