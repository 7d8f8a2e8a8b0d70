//! Dependency graph construction, cycle detection and deletion authorization.
//!
//! Edges point from a dependent to the resource it needs. The graph is built
//! outward from a root by asking the provider "what depends on this?" at each
//! node, using an explicit worklist over an arena of nodes. A node is marked
//! visited when it is first discovered, before it is expanded, so a provider
//! that reports a cycle cannot make construction loop and no node is ever
//! queried twice.

use crate::config::{GraphConfig, RetryConfig};
use crate::error::{Error, GraphError, ProviderError};
use crate::provider::ResourceProvider;
use crate::retry::{LogCallback, with_retry};
use crate::types::{ResourceDescriptor, ResourceId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

// ============================================================================
// Graph
// ============================================================================

/// One resource in the graph.
#[derive(Debug, Clone)]
struct Node {
    /// Resource identity
    id: ResourceId,
    /// Arena indices of the resources this one needs
    needs: Vec<usize>,
    /// Arena indices of the resources that need this one
    dependents: Vec<usize>,
}

/// Directed "depends on" graph rooted at one resource.
///
/// Built per operation and discarded after the authorization decision.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<ResourceId, usize>,
    root: ResourceDescriptor,
}

impl DependencyGraph {
    fn new(root: ResourceDescriptor) -> Self {
        let root_id = root.id.clone();
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            root,
        };
        graph.push(root_id);
        graph
    }

    fn push(&mut self, id: ResourceId) -> usize {
        let idx = self.nodes.len();
        self.index.insert(id.clone(), idx);
        self.nodes.push(Node {
            id,
            needs: Vec::new(),
            dependents: Vec::new(),
        });
        idx
    }

    fn add_edge(&mut self, dependent: usize, dependency: usize) {
        if self.nodes[dependent].needs.contains(&dependency) {
            return;
        }
        self.nodes[dependent].needs.push(dependency);
        self.nodes[dependency].dependents.push(dependent);
    }

    /// The resource the graph was built from.
    pub fn root(&self) -> &ResourceId {
        &self.root.id
    }

    /// Provider descriptor of the root.
    pub fn root_descriptor(&self) -> &ResourceDescriptor {
        &self.root
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` was visited.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Every node identity, in discovery order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes.iter().map(|n| &n.id)
    }

    /// Every edge as `(dependent, dependency)`.
    pub fn edges(&self) -> impl Iterator<Item = (&ResourceId, &ResourceId)> {
        self.nodes
            .iter()
            .flat_map(move |n| n.needs.iter().map(move |&d| (&n.id, &self.nodes[d].id)))
    }

    /// Immediate dependents of `id`, sorted.
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self.nodes[idx]
            .dependents
            .iter()
            .map(|&d| self.nodes[d].id.clone())
            .collect();
        out.sort();
        out
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Builds a [`DependencyGraph`] by querying a provider.
pub struct GraphBuilder<'a> {
    provider: &'a dyn ResourceProvider,
    config: GraphConfig,
    retry: RetryConfig,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder with default limits and retry policy.
    pub fn new(provider: &'a dyn ResourceProvider) -> Self {
        Self {
            provider,
            config: GraphConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Set the node limit.
    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry policy for provider queries.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build the graph of `root` and everything that transitively depends on it.
    ///
    /// Each provider query is retried on transient failures; a query that
    /// still fails aborts construction and no partial graph is returned.
    pub fn build(&self, root: &ResourceId) -> Result<DependencyGraph, GraphError> {
        let descriptor = self
            .query(root, || self.provider.describe(root))?
            .ok_or_else(|| GraphError::RootNotFound(root.clone()))?;

        let mut graph = DependencyGraph::new(descriptor);
        let mut worklist = VecDeque::from([0usize]);

        while let Some(idx) = worklist.pop_front() {
            let id = graph.nodes[idx].id.clone();
            let dependents = self.query(&id, || self.provider.dependents_of(&id))?;
            log::debug!("{id} has {} dependent(s)", dependents.len());

            for dependent in dependents {
                let dep_idx = if let Some(&existing) = graph.index.get(&dependent) {
                    existing
                } else {
                    if graph.nodes.len() >= self.config.max_nodes {
                        return Err(GraphError::TooLarge {
                            limit: self.config.max_nodes,
                        });
                    }
                    let new_idx = graph.push(dependent);
                    worklist.push_back(new_idx);
                    new_idx
                };
                graph.add_edge(dep_idx, idx);
            }
        }

        log::info!("Built dependency graph of {root}: {} node(s)", graph.len());
        Ok(graph)
    }

    fn query<T>(
        &self,
        resource: &ResourceId,
        op: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, GraphError> {
        with_retry(&self.retry, Some(&LogCallback), op).map_err(|source| GraphError::Provider {
            resource: resource.clone(),
            source,
        })
    }
}

// ============================================================================
// Cycle Detection
// ============================================================================

/// Result of [`detect_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleCheck {
    /// No cycle
    Acyclic,
    /// A cycle; the first node is repeated at the end
    CycleFound(Vec<ResourceId>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Depth-first search for a cycle along "needs" edges.
///
/// Grey nodes are on the current DFS path; reaching a grey node closes a
/// cycle. Reaching a black node is skipped. Runs on an explicit stack.
pub fn detect_cycle(graph: &DependencyGraph) -> CycleCheck {
    let mut color = vec![Color::White; graph.nodes.len()];
    // (node, index of the next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for start in 0..graph.nodes.len() {
        if color[start] != Color::White {
            continue;
        }
        color[start] = Color::Grey;
        stack.push((start, 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let Some(&child) = graph.nodes[node].needs.get(top.1) else {
                color[node] = Color::Black;
                stack.pop();
                continue;
            };
            top.1 += 1;

            match color[child] {
                Color::White => {
                    color[child] = Color::Grey;
                    stack.push((child, 0));
                }
                Color::Grey => {
                    let from = stack.iter().position(|&(n, _)| n == child).unwrap_or(0);
                    let mut path: Vec<ResourceId> = stack[from..]
                        .iter()
                        .map(|&(n, _)| graph.nodes[n].id.clone())
                        .collect();
                    path.push(graph.nodes[child].id.clone());
                    return CycleCheck::CycleFound(path);
                }
                Color::Black => {}
            }
        }
    }

    CycleCheck::Acyclic
}

// ============================================================================
// Deletion Authorization
// ============================================================================

/// What to do with the root's dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
    /// Reject the plan if anything depends on the root
    #[default]
    RefuseIfDependents,
    /// Delete every transitive dependent first, then the root
    Cascade,
}

/// An approved deletion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    /// The resource the operator asked to delete
    pub root: ResourceId,
    /// Resources to delete, each before anything it needs
    pub order: Vec<ResourceId>,
}

impl DeletionPlan {
    /// Every resource the plan mutates, i.e. the set to lock.
    pub fn resources(&self) -> &[ResourceId] {
        &self.order
    }
}

/// Decide whether the graph may be deleted under `policy`.
///
/// A cycle rejects the plan unconditionally, whatever the policy.
pub fn authorize_deletion(
    graph: &DependencyGraph,
    policy: DeletionPolicy,
) -> Result<DeletionPlan, Error> {
    if let CycleCheck::CycleFound(path) = detect_cycle(graph) {
        log::warn!(
            "Rejecting deletion of {}: dependency cycle through {} node(s)",
            graph.root(),
            path.len().saturating_sub(1)
        );
        return Err(Error::DependencyCycle { path });
    }

    let root = graph.root().clone();
    let order = match policy {
        DeletionPolicy::RefuseIfDependents => {
            let dependents = graph.dependents_of(&root);
            if !dependents.is_empty() {
                log::warn!(
                    "Rejecting deletion of {root}: {} dependent(s) still exist",
                    dependents.len()
                );
                return Err(Error::DependentsExist {
                    resource: root,
                    dependents,
                });
            }
            vec![root.clone()]
        }
        DeletionPolicy::Cascade => topological_order(graph),
    };

    Ok(DeletionPlan { root, order })
}

/// Kahn's algorithm: nodes nobody needs come first. Ties break on identity.
fn topological_order(graph: &DependencyGraph) -> Vec<ResourceId> {
    let mut remaining: Vec<usize> = graph.nodes.iter().map(|n| n.dependents.len()).collect();
    let mut ready: BinaryHeap<Reverse<(&ResourceId, usize)>> = graph
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| remaining[*i] == 0)
        .map(|(i, n)| Reverse((&n.id, i)))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(Reverse((id, idx))) = ready.pop() {
        order.push(id.clone());
        for &need in &graph.nodes[idx].needs {
            remaining[need] -= 1;
            if remaining[need] == 0 {
                ready.push(Reverse((&graph.nodes[need].id, need)));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::provider::{MemoryProvider, ProviderOp};
    use proptest::prelude::*;
    use std::time::Duration;

    fn id(kind: &str, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    fn build(provider: &MemoryProvider, root: &ResourceId) -> Result<DependencyGraph, GraphError> {
        GraphBuilder::new(provider).with_retry(fast_retry()).build(root)
    }

    /// A needs B, B needs C, C needs A.
    fn triangle() -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.insert(id("a", "A"), [id("b", "B")]);
        provider.insert(id("b", "B"), [id("c", "C")]);
        provider.insert(id("c", "C"), [id("a", "A")]);
        provider
    }

    #[test]
    fn test_cycle_is_found_with_all_nodes() {
        let provider = triangle();
        let graph = build(&provider, &id("a", "A")).unwrap();
        assert_eq!(graph.len(), 3);

        let CycleCheck::CycleFound(path) = detect_cycle(&graph) else {
            panic!("expected a cycle");
        };
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
        for node in [id("a", "A"), id("b", "B"), id("c", "C")] {
            assert!(path.contains(&node), "{node} missing from {path:?}");
        }
    }

    #[test]
    fn test_breaking_the_cycle_is_acyclic() {
        let provider = triangle();
        provider.remove_dependency(&id("c", "C"), &id("a", "A"));

        for root in [id("a", "A"), id("c", "C")] {
            let graph = build(&provider, &root).unwrap();
            assert_eq!(detect_cycle(&graph), CycleCheck::Acyclic);
        }
    }

    #[test]
    fn test_visited_nodes_are_queried_once() {
        let provider = triangle();
        // Diamond on top of the cycle: D and E both need A, F needs D and E
        provider.insert(id("d", "D"), [id("a", "A")]);
        provider.insert(id("e", "E"), [id("a", "A")]);
        provider.insert(id("f", "F"), [id("d", "D"), id("e", "E")]);

        let graph = build(&provider, &id("a", "A")).unwrap();
        assert_eq!(graph.len(), 6);
        for node in graph.resources() {
            assert_eq!(provider.dependents_queries(node), 1, "{node}");
        }
        assert_eq!(provider.calls(ProviderOp::DependentsOf), 6);
    }

    #[test]
    fn test_unknown_root_is_an_error() {
        let provider = MemoryProvider::new();
        let err = build(&provider, &id("disk", "ghost")).unwrap_err();
        assert!(matches!(err, GraphError::RootNotFound(_)));
    }

    #[test]
    fn test_node_limit() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "d"), []);
        for i in 0..5 {
            provider.insert(id("instance", &format!("vm-{i}")), [id("disk", "d")]);
        }

        let err = GraphBuilder::new(&provider)
            .with_config(GraphConfig { max_nodes: 3 })
            .with_retry(fast_retry())
            .build(&id("disk", "d"))
            .unwrap_err();
        assert!(matches!(err, GraphError::TooLarge { limit: 3 }));
    }

    #[test]
    fn test_transient_provider_failures_are_retried() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "d"), []);
        provider.insert(id("instance", "vm"), [id("disk", "d")]);
        provider.fail_next(
            ProviderOp::DependentsOf,
            ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after: None,
            },
            2,
        );

        let graph = build(&provider, &id("disk", "d")).unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_persistent_provider_failure_aborts() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "d"), []);
        provider.fail_next(
            ProviderOp::DependentsOf,
            ProviderError::PermissionDenied {
                message: "no".into(),
            },
            10,
        );

        let err = build(&provider, &id("disk", "d")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ProviderPermissionDenied);
        // Not retryable: a single call
        assert_eq!(provider.calls(ProviderOp::DependentsOf), 1);
    }

    #[test]
    fn test_refuse_if_dependents() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "disk-1"), []);
        provider.insert(id("instance", "instance-1"), [id("disk", "disk-1")]);

        let graph = build(&provider, &id("disk", "disk-1")).unwrap();
        let err = authorize_deletion(&graph, DeletionPolicy::RefuseIfDependents).unwrap_err();
        match err {
            Error::DependentsExist { resource, dependents } => {
                assert_eq!(resource, id("disk", "disk-1"));
                assert_eq!(dependents, vec![id("instance", "instance-1")]);
            }
            other => panic!("expected DependentsExist, got {other:?}"),
        }
    }

    #[test]
    fn test_lone_resource_is_authorized() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "spare"), []);

        let graph = build(&provider, &id("disk", "spare")).unwrap();
        let plan = authorize_deletion(&graph, DeletionPolicy::RefuseIfDependents).unwrap();
        assert_eq!(plan.order, vec![id("disk", "spare")]);
    }

    #[test]
    fn test_cascade_orders_dependents_first() {
        let provider = MemoryProvider::new();
        provider.insert(id("network", "net"), []);
        provider.insert(id("subnet", "sub"), [id("network", "net")]);
        provider.insert(id("instance", "vm"), [id("subnet", "sub"), id("network", "net")]);

        let graph = build(&provider, &id("network", "net")).unwrap();
        let plan = authorize_deletion(&graph, DeletionPolicy::Cascade).unwrap();
        assert_eq!(
            plan.order,
            vec![id("instance", "vm"), id("subnet", "sub"), id("network", "net")]
        );
    }

    #[test]
    fn test_cycle_rejects_even_cascade() {
        let provider = triangle();
        let graph = build(&provider, &id("a", "A")).unwrap();
        let err = authorize_deletion(&graph, DeletionPolicy::Cascade).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::DependencyCycle);
    }

    fn node(i: usize) -> ResourceId {
        id("node", &format!("n{i}"))
    }

    /// Provider over `n` nodes where `(a, b)` with `a > b` means a needs b.
    fn dag(n: usize, pairs: &[(usize, usize)]) -> MemoryProvider {
        let provider = MemoryProvider::new();
        for i in 0..n {
            let needs: Vec<_> = pairs
                .iter()
                .filter(|&&(a, b)| a == i && a > b)
                .map(|&(_, b)| node(b))
                .collect();
            provider.insert(node(i), needs);
        }
        provider
    }

    proptest! {
        #[test]
        fn prop_dag_is_acyclic_and_cascade_respects_edges(
            pairs in prop::collection::vec((0usize..10, 0usize..10), 0..30)
        ) {
            let provider = dag(10, &pairs);
            let graph = build(&provider, &node(0)).unwrap();
            prop_assert_eq!(detect_cycle(&graph), CycleCheck::Acyclic);

            let plan = authorize_deletion(&graph, DeletionPolicy::Cascade).unwrap();
            prop_assert_eq!(plan.order.len(), graph.len());
            prop_assert_eq!(plan.order.last(), Some(&node(0)));

            let pos: HashMap<_, _> = plan.order.iter().enumerate().map(|(i, r)| (r.clone(), i)).collect();
            for (dependent, dependency) in graph.edges() {
                prop_assert!(pos[dependent] < pos[dependency]);
            }
            for resource in graph.resources() {
                prop_assert_eq!(provider.dependents_queries(resource), 1);
            }
        }

        #[test]
        fn prop_back_edge_closes_a_cycle(
            len in 2usize..8
        ) {
            // Chain: n(i+1) needs n(i); then n0 needs the last node
            let pairs: Vec<_> = (1..len).map(|i| (i, i - 1)).collect();
            let provider = dag(len, &pairs);
            provider.add_dependency(&node(0), node(len - 1));

            let graph = build(&provider, &node(0)).unwrap();
            let CycleCheck::CycleFound(path) = detect_cycle(&graph) else {
                return Err(TestCaseError::fail("expected a cycle"));
            };
            prop_assert_eq!(path.len(), len + 1);
        }
    }
}
