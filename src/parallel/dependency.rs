//! Feature dependency graph and ready-set computation.
//!
//! Edges point from a feature to each feature it depends on. The graph is an
//! adjacency list keyed by stable feature IDs (a `StableDiGraph` plus an ID →
//! node index map), so node indices survive edge removal. The graph is kept
//! acyclic: every insertion runs a breadth-first reachability check first and
//! leaves the edge set untouched when the check fails.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CycleError, SchedulerError};
use crate::model::{Feature, FeatureId, FeatureStatus, TenantId};
use crate::store::Store;

/// Dependency graph over feature IDs.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<FeatureId, ()>,
    nodes: HashMap<FeatureId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from persisted features.
    ///
    /// Edges that would close a cycle are skipped and returned so the caller
    /// can log and correct them.
    pub fn from_features<'a>(features: impl IntoIterator<Item = &'a Feature>) -> (Self, Vec<CycleError>) {
        let mut graph = Self::new();
        let mut rejected = Vec::new();
        for feature in features {
            rejected.extend(graph.sync_feature(feature));
        }
        (graph, rejected)
    }

    fn ensure_node(&mut self, id: &FeatureId) -> NodeIndex {
        if let Some(index) = self.nodes.get(id) {
            return *index;
        }
        let index = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), index);
        index
    }

    /// Add the edge `feature → depends_on`.
    ///
    /// Fails with `CycleError` when `feature` is already reachable from
    /// `depends_on` (including the self-edge case). Returns `false` if the
    /// edge already existed.
    pub fn add_dependency(
        &mut self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<bool, CycleError> {
        self.check_dependency(feature, depends_on)?;
        let from = self.ensure_node(feature);
        let to = self.ensure_node(depends_on);
        if self.graph.find_edge(from, to).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(from, to, ());
        Ok(true)
    }

    /// Remove the edge `feature → depends_on`. Returns whether it existed.
    pub fn remove_dependency(&mut self, feature: &FeatureId, depends_on: &FeatureId) -> bool {
        let (Some(from), Some(to)) = (self.nodes.get(feature), self.nodes.get(depends_on)) else {
            return false;
        };
        match self.graph.find_edge(*from, *to) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Check whether `feature → depends_on` can be added without mutating
    /// the graph.
    pub fn check_dependency(
        &self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<(), CycleError> {
        match self.path_between(depends_on, feature) {
            Some(path) => Err(CycleError {
                feature: feature.clone(),
                depends_on: depends_on.clone(),
                path,
            }),
            None => Ok(()),
        }
    }

    /// Breadth-first search along dependency edges from `start` to `target`.
    /// Returns the node path `start → … → target` if one exists.
    fn path_between(&self, start: &FeatureId, target: &FeatureId) -> Option<Vec<FeatureId>> {
        if start == target {
            return Some(vec![start.clone()]);
        }
        let start_index = *self.nodes.get(start)?;
        let target_index = *self.nodes.get(target)?;

        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start_index]);
        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if next == start_index || parents.contains_key(&next) {
                    continue;
                }
                parents.insert(next, current);
                if next == target_index {
                    let mut path = vec![self.graph[next].clone()];
                    let mut cursor = next;
                    while let Some(parent) = parents.get(&cursor) {
                        path.push(self.graph[*parent].clone());
                        cursor = *parent;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Direct dependencies of `feature`, sorted by ID.
    pub fn dependencies_of(&self, feature: &FeatureId) -> Vec<FeatureId> {
        let Some(index) = self.nodes.get(feature) else {
            return Vec::new();
        };
        let mut deps: Vec<FeatureId> = self
            .graph
            .neighbors_directed(*index, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        deps.sort();
        deps
    }

    /// Snapshot of every edge as `(feature, depends_on)`.
    pub fn edges(&self) -> BTreeSet<(FeatureId, FeatureId)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
            .collect()
    }

    /// Reconcile the graph with a feature's persisted dependency list.
    ///
    /// Edges missing from the list are removed; new ones are added with the
    /// usual cycle check. Rejected edges are returned.
    pub fn sync_feature(&mut self, feature: &Feature) -> Vec<CycleError> {
        self.ensure_node(&feature.id);
        let wanted: BTreeSet<&FeatureId> = feature.depends_on.iter().collect();
        for existing in self.dependencies_of(&feature.id) {
            if !wanted.contains(&existing) {
                self.remove_dependency(&feature.id, &existing);
            }
        }
        let mut rejected = Vec::new();
        for dep in &feature.depends_on {
            if let Err(err) = self.add_dependency(&feature.id, dep) {
                rejected.push(err);
            }
        }
        rejected
    }

    /// Pending features of `tenant` whose every dependency is `passing`,
    /// ordered by priority, then creation time, then ID.
    ///
    /// `statuses` must cover every feature a dependency may point at; a
    /// dependency with no known status blocks its dependent.
    pub fn get_ready_features<'a>(
        &self,
        tenant: &TenantId,
        features: impl IntoIterator<Item = &'a Feature>,
        statuses: &HashMap<FeatureId, FeatureStatus>,
    ) -> Vec<Feature> {
        let mut ready: Vec<Feature> = features
            .into_iter()
            .filter(|f| &f.tenant == tenant && f.status == FeatureStatus::Pending)
            .filter(|f| {
                self.dependencies_of(&f.id)
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&FeatureStatus::Passing))
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready
    }
}

/// Shared resolver: the dependency graph plus the store it mirrors.
///
/// Edge mutations hold the graph lock across the cycle check, the store
/// write and the in-memory insert, so two concurrent insertions can never
/// both pass the check against a stale edge set.
pub struct DependencyResolver {
    graph: Mutex<DependencyGraph>,
    store: Arc<dyn Store>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            graph: Mutex::new(DependencyGraph::new()),
            store,
        }
    }

    /// Rebuild the graph from every tenant's features.
    ///
    /// Persisted edges that would close a cycle are dropped from the graph
    /// and from the store, with a warning.
    pub async fn load(&self) -> Result<(), SchedulerError> {
        let mut features = Vec::new();
        for tenant in self.store.list_tenants().await? {
            features.extend(self.store.list_features(&tenant.id, None).await?);
        }
        let (graph, rejected) = DependencyGraph::from_features(&features);
        *self.graph.lock().await = graph;
        self.correct(rejected).await;
        Ok(())
    }

    /// Bring the graph up to date with features created or edited outside
    /// the resolver.
    pub async fn sync(&self, features: &[Feature]) {
        let rejected = {
            let mut graph = self.graph.lock().await;
            features
                .iter()
                .flat_map(|feature| graph.sync_feature(feature))
                .collect::<Vec<_>>()
        };
        self.correct(rejected).await;
    }

    async fn correct(&self, rejected: Vec<CycleError>) {
        for err in rejected {
            warn!(
                feature = %err.feature,
                depends_on = %err.depends_on,
                "dropping persisted dependency that would close a cycle: {}",
                err
            );
            let deps = self.graph.lock().await.dependencies_of(&err.feature);
            if let Err(store_err) = self.store.set_dependencies(&err.feature, &deps).await {
                warn!(feature = %err.feature, "failed to persist corrected dependencies: {}", store_err);
            }
        }
    }

    /// Add `feature → depends_on`, persisting the new dependency list.
    pub async fn add_dependency(
        &self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<(), SchedulerError> {
        let current = self
            .store
            .get_feature(feature)
            .await?
            .ok_or_else(|| SchedulerError::UnknownFeature(feature.clone()))?;
        if self.store.get_feature(depends_on).await?.is_none() {
            return Err(SchedulerError::UnknownFeature(depends_on.clone()));
        }

        let mut graph = self.graph.lock().await;
        graph.sync_feature(&current);
        graph.check_dependency(feature, depends_on)?;

        let mut deps = current.depends_on.clone();
        if !deps.contains(depends_on) {
            deps.push(depends_on.clone());
            self.store.set_dependencies(feature, &deps).await?;
        }
        graph.add_dependency(feature, depends_on)?;
        debug!(feature = %feature, depends_on = %depends_on, "dependency added");
        Ok(())
    }

    /// Remove `feature → depends_on` if present.
    pub async fn remove_dependency(
        &self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<(), SchedulerError> {
        let Some(current) = self.store.get_feature(feature).await? else {
            return Ok(());
        };
        let mut graph = self.graph.lock().await;
        if current.depends_on.contains(depends_on) {
            let deps: Vec<FeatureId> = current
                .depends_on
                .iter()
                .filter(|dep| *dep != depends_on)
                .cloned()
                .collect();
            self.store.set_dependencies(feature, &deps).await?;
        }
        graph.remove_dependency(feature, depends_on);
        Ok(())
    }

    /// Ready set for `tenant`; see `DependencyGraph::get_ready_features`.
    pub async fn ready_set(
        &self,
        tenant: &TenantId,
        features: &[Feature],
        statuses: &HashMap<FeatureId, FeatureStatus>,
    ) -> Vec<Feature> {
        self.graph
            .lock()
            .await
            .get_ready_features(tenant, features, statuses)
    }

    /// Snapshot of the current edge set.
    pub async fn edges(&self) -> BTreeSet<(FeatureId, FeatureId)> {
        self.graph.lock().await.edges()
    }
}
