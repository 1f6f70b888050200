//! Generic directed-graph utility used by the initializer to order module and
//! plugin startup.
//!
//! A [`Graph`] is built from nodes that each carry a `value`, a list of ids they
//! `provides`, and a list of ids they `consumes`. Two operations are supported:
//!
//! - [`Graph::detect_circular_dependency`] — DFS cycle detection with a reported
//!   path, for diagnostics.
//! - [`Graph::parallel_topological_traversal`] — visits every node exactly once,
//!   running all currently-ready nodes concurrently, where a node is ready once
//!   every node providing an id it consumes has completed.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::instrument;

/// A single node in the graph.
#[derive(Debug, Clone)]
pub struct Node<T> {
    pub value: T,
    pub provides: Vec<String>,
    pub consumes: Vec<String>,
}

impl<T> Node<T> {
    pub fn new(value: T, provides: Vec<String>, consumes: Vec<String>) -> Self {
        Self {
            value,
            provides,
            consumes,
        }
    }
}

/// A generic directed graph over nodes that declare what they provide/consume
/// by string id rather than by explicit edges.
#[derive(Debug, Clone, Default)]
pub struct Graph<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Graph<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn with_nodes(nodes: Vec<Node<T>>) -> Self {
        Self { nodes }
    }

    pub fn push(&mut self, node: Node<T>) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maps each provided id to the indices of nodes that provide it.
    /// Multiple providers of the same id are allowed.
    fn providers_by_id(&self) -> HashMap<&str, Vec<usize>> {
        let mut map: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for id in &node.provides {
                map.entry(id.as_str()).or_default().push(idx);
            }
        }
        map
    }

    /// Detects a cycle among nodes, where node `a` has an edge to node `b` if
    /// `a` consumes an id that `b` provides (i.e. `a` depends on `b`).
    ///
    /// Returns the cycle as a sequence of node values, `n0 -> n1 -> ... -> n0`,
    /// suitable for diagnostic formatting.
    #[instrument(level = "debug", skip_all, fields(nodes = self.nodes.len()))]
    pub fn detect_circular_dependency(&self) -> Option<Vec<T>>
    where
        T: Clone,
    {
        let providers = self.providers_by_id();
        let adjacency: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|node| {
                let mut deps = HashSet::new();
                for id in &node.consumes {
                    if let Some(provider_idxs) = providers.get(id.as_str()) {
                        deps.extend(provider_idxs.iter().copied());
                    }
                }
                deps.into_iter().collect()
            })
            .collect();

        let mut state = vec![VisitState::Unvisited; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if state[start] == VisitState::Unvisited {
                let mut path = Vec::new();
                if let Some(cycle) = self.dfs(start, &adjacency, &mut state, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs(
        &self,
        node: usize,
        adjacency: &[Vec<usize>],
        state: &mut [VisitState],
        path: &mut Vec<usize>,
    ) -> Option<Vec<T>>
    where
        T: Clone,
    {
        state[node] = VisitState::InProgress;
        path.push(node);

        for &next in &adjacency[node] {
            match state[next] {
                VisitState::InProgress => {
                    let cycle_start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<T> = path[cycle_start..]
                        .iter()
                        .map(|&i| self.nodes[i].value.clone())
                        .collect();
                    cycle.push(self.nodes[next].value.clone());
                    return Some(cycle);
                }
                VisitState::Unvisited => {
                    if let Some(cycle) = self.dfs(next, adjacency, state, path) {
                        return Some(cycle);
                    }
                }
                VisitState::Done => {}
            }
        }

        path.pop();
        state[node] = VisitState::Done;
        None
    }

    /// Visits every node exactly once, running all ready nodes concurrently.
    /// A node is ready once every node providing an id it consumes has
    /// completed. Unknown ids in `consumes` are treated as externally
    /// satisfied.
    ///
    /// If any `visit` call fails, the first error is returned once every
    /// already-scheduled visit has finished; in-flight visits are never
    /// cancelled.
    #[instrument(level = "debug", skip_all, fields(nodes = self.nodes.len()))]
    pub async fn parallel_topological_traversal<'a, F, Fut, E>(
        &'a self,
        visit: F,
    ) -> Result<(), E>
    where
        T: Sync,
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'a,
        E: Send + 'a,
    {
        if self.nodes.is_empty() {
            return Ok(());
        }

        let providers = self.providers_by_id();

        // For each node, the set of node indices it must wait on.
        let mut pending_preds: Vec<HashSet<usize>> = self
            .nodes
            .iter()
            .map(|node| {
                let mut preds = HashSet::new();
                for id in &node.consumes {
                    if let Some(provider_idxs) = providers.get(id.as_str()) {
                        preds.extend(provider_idxs.iter().copied());
                    }
                }
                preds
            })
            .collect();

        // Reverse index: node -> the nodes that depend on it (used to wake
        // dependents once a node completes).
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, preds) in pending_preds.iter().enumerate() {
            for &p in preds {
                dependents[p].push(idx);
            }
        }

        type BoxedVisit<'a, E> = Pin<Box<dyn Future<Output = (usize, Result<(), E>)> + Send + 'a>>;
        let mut in_flight: FuturesUnordered<BoxedVisit<'a, E>> = FuturesUnordered::new();
        let mut scheduled = vec![false; self.nodes.len()];
        let mut remaining = self.nodes.len();
        let mut first_error: Option<E> = None;

        let schedule = |idx: usize, in_flight: &mut FuturesUnordered<BoxedVisit<'a, E>>| {
            let fut = visit(&self.nodes[idx].value);
            in_flight.push(Box::pin(async move { (idx, fut.await) }));
        };

        for idx in 0..self.nodes.len() {
            if pending_preds[idx].is_empty() && !scheduled[idx] {
                scheduled[idx] = true;
                schedule(idx, &mut in_flight);
            }
        }

        while let Some((finished, result)) = in_flight.next().await {
            remaining -= 1;
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }

            if first_error.is_none() {
                for &dependent in &dependents[finished] {
                    pending_preds[dependent].remove(&finished);
                    if pending_preds[dependent].is_empty() && !scheduled[dependent] {
                        scheduled[dependent] = true;
                        schedule(dependent, &mut in_flight);
                    }
                }
            }

            if remaining == 0 {
                break;
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}
