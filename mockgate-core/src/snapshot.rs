//! Immutable routing and case snapshot.
//!
//! A [`Snapshot`] bundles everything a call needs: method descriptors,
//! backend connections, and compiled cases. Snapshots are built whole by
//! [`SnapshotBuilder`] and published through a [`SnapshotHandle`]; a call
//! loads one `Arc<Snapshot>` at its start and uses only that.

use arc_swap::ArcSwap;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::rule::{Rule, RuleError};
use crate::schema::{MethodDescriptor, ServiceDescriptor, encode_json};
use crate::store::Case;
use crate::upstream::BackendConnection;

/// Routing entry for one method.
#[derive(Debug, Clone)]
pub struct Route {
    pub descriptor: Arc<MethodDescriptor>,
    pub backend: BackendConnection,
}

/// A case with its rule compiled and its body pre-encoded.
#[derive(Debug, Clone)]
pub struct CompiledCase {
    pub case: Case,
    pub rule: Option<Rule>,
    /// Wire encoding of the body; `None` when the body no longer fits the
    /// method's output shape.
    pub response: Option<Bytes>,
}

/// Cases of one (method, app), in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct CaseTable {
    ordered: Vec<CompiledCase>,
    by_name: HashMap<String, usize>,
}

impl CaseTable {
    pub fn get(&self, name: &str) -> Option<&CompiledCase> {
        self.by_name.get(name).map(|&i| &self.ordered[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledCase> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    methods: HashMap<String, Route>,
    upstream_methods: BTreeMap<String, Vec<String>>,
    /// method → app → cases
    cases: HashMap<String, BTreeMap<String, CaseTable>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Exact match on the full method path.
    pub fn lookup_method(&self, full_method: &str) -> Option<&Route> {
        self.methods.get(full_method)
    }

    pub fn case_table(&self, method: &str, app: &str) -> Option<&CaseTable> {
        self.cases.get(method)?.get(app)
    }

    /// Rule-matching candidates of one (method, app) namespace. A call
    /// without an app name sees only the empty-app namespace.
    pub fn candidates<'a>(
        &'a self,
        method: &str,
        app: Option<&str>,
    ) -> impl Iterator<Item = &'a CompiledCase> + use<'a> {
        self.case_table(method, app.unwrap_or_default())
            .into_iter()
            .flat_map(CaseTable::iter)
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn case_count(&self) -> usize {
        self.cases
            .values()
            .flat_map(|apps| apps.values())
            .map(CaseTable::len)
            .sum()
    }

    /// Method paths in sorted order.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.methods.values()
    }

    /// Method paths served by each upstream.
    pub fn upstream_methods(&self) -> &BTreeMap<String, Vec<String>> {
        &self.upstream_methods
    }
}

/// Assembles a [`Snapshot`] from resolved upstreams and stored cases.
#[derive(Debug)]
pub struct SnapshotBuilder {
    snapshot: Snapshot,
}

impl SnapshotBuilder {
    pub fn new(version: u64) -> Self {
        Self {
            snapshot: Snapshot {
                version,
                ..Snapshot::default()
            },
        }
    }

    /// Route every method of `services` to `backend`. A method already
    /// routed by an earlier upstream is taken over by this one.
    pub fn add_upstream(&mut self, backend: BackendConnection, services: &[ServiceDescriptor]) {
        let mut names = Vec::new();
        for service in services {
            for method in &service.methods {
                let route = Route {
                    descriptor: Arc::clone(method),
                    backend: backend.clone(),
                };
                if let Some(previous) = self.snapshot.methods.insert(method.full_name.clone(), route)
                    && previous.backend.name() != backend.name()
                {
                    warn!(
                        method = %method.full_name,
                        previous = previous.backend.name(),
                        upstream = backend.name(),
                        "Method served by more than one upstream, last one wins"
                    );
                    if let Some(list) = self.snapshot.upstream_methods.get_mut(previous.backend.name()) {
                        list.retain(|m| m != &method.full_name);
                    }
                }
                names.push(method.full_name.clone());
            }
        }
        names.sort();
        self.snapshot
            .upstream_methods
            .insert(backend.name().to_string(), names);
    }

    /// Compile and index a case.
    ///
    /// # Errors
    ///
    /// Returns the rule's compile error; the case is not added.
    pub fn add_case(&mut self, case: Case) -> Result<(), RuleError> {
        let rule = if case.rule.trim().is_empty() {
            None
        } else {
            Some(Rule::compile(&case.rule)?)
        };
        let response = match self.snapshot.methods.get(&case.method) {
            Some(route) => match encode_json(&route.descriptor.output, &case.body) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(
                        app = %case.app,
                        method = %case.method,
                        case = %case.name,
                        error = %e,
                        "Case body does not fit the method's output shape"
                    );
                    None
                }
            },
            None => {
                debug!(method = %case.method, case = %case.name, "Case for unrouted method");
                None
            }
        };

        let table = self
            .snapshot
            .cases
            .entry(case.method.clone())
            .or_default()
            .entry(case.app.clone())
            .or_default();
        if let Some(&i) = table.by_name.get(&case.name) {
            table.ordered[i] = CompiledCase { case, rule, response };
        } else {
            table.by_name.insert(case.name.clone(), table.ordered.len());
            table.ordered.push(CompiledCase { case, rule, response });
        }
        Ok(())
    }

    /// Finish: order every case table by priority (descending) then name.
    pub fn build(mut self) -> Snapshot {
        for apps in self.snapshot.cases.values_mut() {
            for table in apps.values_mut() {
                table.ordered.sort_by(|a, b| {
                    b.case
                        .priority
                        .cmp(&a.case.priority)
                        .then_with(|| a.case.name.cmp(&b.case.name))
                });
                table.by_name = table
                    .ordered
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.case.name.clone(), i))
                    .collect();
            }
        }
        self.snapshot
    }
}

/// Shared, atomically swapped reference to the current snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new(Snapshot::empty())
    }
}

impl SnapshotHandle {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// The current snapshot. Holding the `Arc` pins that snapshot for as
    /// long as the caller needs it.
    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    pub fn publish(&self, snapshot: Snapshot) {
        self.inner.store(Arc::new(snapshot));
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }
}
