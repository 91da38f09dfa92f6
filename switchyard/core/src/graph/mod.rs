//! Context Memory Graph
//!
//! Bounded, weighted, directed graph of past interactions. Every routed
//! query leaves a node behind; later queries retrieve the most relevant
//! nodes and feed them to both the selector (affinity) and the backend
//! (prompt context).
//!
//! # Structure
//!
//! ```text
//!   #1 --follow_up--> #2 --follow_up--> #3
//!    ^                 |
//!    |               similar (both directions)
//!    |                 v
//!    +---similar----- #4
//! ```
//!
//! - Explicit links run from the earlier node to the new one.
//! - Auto-links connect a new node to its `auto_link_k` most similar
//!   predecessors (similarity >= `min_similarity`), in both directions.
//! - A reverse index of incoming edges makes eviction O(degree).
//!
//! # Concurrency
//!
//! One `parking_lot::RwLock` guards the whole graph. Retrievals and
//! traversals share the read lock and bump reference counters atomically;
//! inserts and evictions take the write lock, so readers never see a
//! partially-linked node or a dangling edge.

pub mod similarity;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::error::RouterError;
use crate::selector::Query;

use similarity::{similarity, tokenize};

const RELEVANCE_SIMILARITY_WEIGHT: f64 = 0.6;
const RELEVANCE_RECENCY_WEIGHT: f64 = 0.25;
const RELEVANCE_LINK_WEIGHT: f64 = 0.15;

// ============================================================================
// Identifiers and edges
// ============================================================================

/// Identifier of a context node; allocated in increasing order from 1
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of relationship an edge records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// Next turn of the same conversation
    FollowUp,
    /// Found by content similarity
    Similar,
    /// Explicit caller-supplied reference
    Reference,
}

/// Outgoing edge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub target: NodeId,
    pub relation: RelationType,
    /// In (0, 1]
    pub weight: f64,
}

// ============================================================================
// Nodes
// ============================================================================

/// Content for a node about to be inserted
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewNode {
    pub summary: String,
    pub context_type: Option<String>,
    /// Earlier nodes this one is explicitly linked from
    pub links: Vec<(NodeId, RelationType)>,
    pub handled_by: Option<String>,
    pub succeeded: bool,
}

impl NewNode {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_context_type(mut self, context_type: Option<impl Into<String>>) -> Self {
        self.context_type = context_type.map(Into::into);
        self
    }

    /// Continue a conversation from `previous`
    #[must_use]
    pub fn follows(mut self, previous: NodeId) -> Self {
        self.links.push((previous, RelationType::FollowUp));
        self
    }

    #[must_use]
    pub fn references(mut self, earlier: NodeId) -> Self {
        self.links.push((earlier, RelationType::Reference));
        self
    }

    #[must_use]
    pub fn handled_by(mut self, model_id: impl Into<String>, succeeded: bool) -> Self {
        self.handled_by = Some(model_id.into());
        self.succeeded = succeeded;
        self
    }
}

struct ContextNode {
    id: NodeId,
    summary: String,
    context_type: Option<String>,
    created_at: DateTime<Utc>,
    handled_by: Option<String>,
    succeeded: bool,
    tokens: BTreeSet<String>,
    edges: Vec<Edge>,
    reference_count: AtomicU64,
    last_access_ms: AtomicI64,
}

impl ContextNode {
    fn touch(&self, now: DateTime<Utc>) {
        self.reference_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn recency(&self, now: DateTime<Utc>, half_life_ms: f64) -> f64 {
        let age_ms = (now.timestamp_millis() - self.last_access_ms.load(Ordering::Relaxed)).max(0);
        0.5_f64.powf(age_ms as f64 / half_life_ms)
    }

    fn view(&self, relevance: f64) -> NodeView {
        NodeView {
            id: self.id,
            summary: self.summary.clone(),
            context_type: self.context_type.clone(),
            created_at: self.created_at,
            handled_by: self.handled_by.clone(),
            succeeded: self.succeeded,
            reference_count: self.reference_count.load(Ordering::Relaxed),
            relevance,
        }
    }

    fn to_record(&self) -> NodeRecord {
        let last_access = Utc
            .timestamp_millis_opt(self.last_access_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at);
        NodeRecord {
            id: self.id,
            summary: self.summary.clone(),
            context_type: self.context_type.clone(),
            created_at: self.created_at,
            handled_by: self.handled_by.clone(),
            succeeded: self.succeeded,
            edges: self.edges.clone(),
            reference_count: self.reference_count.load(Ordering::Relaxed),
            last_access,
        }
    }

    fn from_record(record: NodeRecord) -> Self {
        Self {
            id: record.id,
            tokens: tokenize(&record.summary),
            summary: record.summary,
            context_type: record.context_type,
            created_at: record.created_at,
            handled_by: record.handled_by,
            succeeded: record.succeeded,
            edges: record.edges,
            reference_count: AtomicU64::new(record.reference_count),
            last_access_ms: AtomicI64::new(record.last_access.timestamp_millis()),
        }
    }
}

/// Read-only copy of a node
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub summary: String,
    pub context_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub handled_by: Option<String>,
    pub succeeded: bool,
    pub reference_count: u64,
    /// Retrieval score; 0 outside of retrieval
    pub relevance: f64,
}

/// Serialized form of a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub summary: String,
    pub context_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub handled_by: Option<String>,
    pub succeeded: bool,
    pub edges: Vec<Edge>,
    pub reference_count: u64,
    pub last_access: DateTime<Utc>,
}

/// Serialized form of the whole graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Next id to allocate
    pub next_id: u64,
    pub nodes: Vec<NodeRecord>,
}

// ============================================================================
// Retrieval results
// ============================================================================

/// Nodes retrieved for one query, most relevant first
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextSubgraph {
    nodes: Vec<NodeView>,
}

impl ContextSubgraph {
    #[must_use]
    pub fn new(nodes: Vec<NodeView>) -> Self {
        Self { nodes }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeView> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Nodes `model_id` handled successfully
    #[must_use]
    pub fn successes_for(&self, model_id: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.succeeded && n.handled_by.as_deref() == Some(model_id))
            .count()
    }
}

/// Nodes reached by [`ContextGraph::traverse`], in breadth-first order
#[derive(Debug)]
pub struct Traversal {
    nodes: std::vec::IntoIter<NodeView>,
}

impl Iterator for Traversal {
    type Item = NodeView;

    fn next(&mut self) -> Option<Self::Item> {
        self.nodes.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.nodes.size_hint()
    }
}

impl ExactSizeIterator for Traversal {}

/// Result of an insert
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insertion {
    pub id: NodeId,
    /// Similarity edges created
    pub auto_links: usize,
    /// Nodes evicted to stay within capacity
    pub evicted: Vec<NodeId>,
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<NodeId, ContextNode>,
    /// target -> sources with an edge into it
    incoming: HashMap<NodeId, BTreeSet<NodeId>>,
    next_id: u64,
}

impl GraphState {
    fn add_edge(&mut self, from: NodeId, to: NodeId, relation: RelationType, weight: f64) {
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        if node
            .edges
            .iter()
            .any(|e| e.target == to && e.relation == relation)
        {
            return;
        }
        node.edges.push(Edge {
            target: to,
            relation,
            weight: weight.clamp(f64::MIN_POSITIVE, 1.0),
        });
        self.incoming.entry(to).or_default().insert(from);
    }

    fn link_weight(&self, node: &ContextNode) -> f64 {
        let outgoing: f64 = node.edges.iter().map(|e| e.weight).sum();
        let incoming: f64 = self
            .incoming
            .get(&node.id)
            .into_iter()
            .flatten()
            .filter_map(|src| self.nodes.get(src))
            .flat_map(|src| src.edges.iter().filter(|e| e.target == node.id))
            .map(|e| e.weight)
            .sum();
        outgoing + incoming
    }

    fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(sources) = self.incoming.remove(&id) {
            for src in sources {
                if let Some(src_node) = self.nodes.get_mut(&src) {
                    src_node.edges.retain(|e| e.target != id);
                }
            }
        }
        for edge in &node.edges {
            if let Some(sources) = self.incoming.get_mut(&edge.target) {
                sources.remove(&id);
                if sources.is_empty() {
                    self.incoming.remove(&edge.target);
                }
            }
        }
    }

    fn verify(&self) -> Result<(), String> {
        for (id, node) in &self.nodes {
            if id.0 >= self.next_id {
                return Err(format!("node {id} is not below next id {}", self.next_id));
            }
            for edge in &node.edges {
                if !self.nodes.contains_key(&edge.target) {
                    return Err(format!("edge {id} -> {} points at a missing node", edge.target));
                }
                if !self
                    .incoming
                    .get(&edge.target)
                    .is_some_and(|s| s.contains(id))
                {
                    return Err(format!("edge {id} -> {} missing from reverse index", edge.target));
                }
            }
        }
        for (target, sources) in &self.incoming {
            for src in sources {
                let linked = self
                    .nodes
                    .get(src)
                    .is_some_and(|n| n.edges.iter().any(|e| e.target == *target));
                if !linked {
                    return Err(format!("reverse index lists {src} -> {target} with no edge"));
                }
            }
        }
        Ok(())
    }
}

/// Bounded context graph
pub struct ContextGraph {
    state: RwLock<GraphState>,
    config: GraphConfig,
}

impl Default for ContextGraph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

impl ContextGraph {
    #[must_use]
    pub fn new(config: GraphConfig) -> Self {
        Self {
            state: RwLock::new(GraphState {
                next_id: 1,
                ..Default::default()
            }),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    fn half_life_ms(&self) -> f64 {
        (self.config.recency_half_life_secs.max(1) * 1000) as f64
    }

    /// Add a node with explicit `Reference` links from `explicit_links`
    ///
    /// Unknown link targets are logged and skipped.
    pub fn add_node(
        &self,
        content: impl Into<String>,
        context_type: Option<&str>,
        explicit_links: &[NodeId],
    ) -> NodeId {
        let mut node = NewNode::new(content).with_context_type(context_type);
        for id in explicit_links {
            node = node.references(*id);
        }
        self.insert(node).id
    }

    /// Add a node, auto-link it and evict down to capacity
    pub fn insert(&self, new: NewNode) -> Insertion {
        let now = Utc::now();
        let tokens = tokenize(&new.summary);
        let mut state = self.state.write();

        let id = NodeId(state.next_id);
        state.next_id += 1;

        state.nodes.insert(
            id,
            ContextNode {
                id,
                summary: new.summary,
                context_type: new.context_type,
                created_at: now,
                handled_by: new.handled_by,
                succeeded: new.succeeded,
                tokens,
                edges: Vec::new(),
                reference_count: AtomicU64::new(0),
                last_access_ms: AtomicI64::new(now.timestamp_millis()),
            },
        );

        let mut explicit = HashSet::new();
        for (earlier, relation) in new.links {
            if earlier == id || !state.nodes.contains_key(&earlier) {
                warn!(node_id = %earlier, "Ignoring link to unknown context node");
                continue;
            }
            state.add_edge(earlier, id, relation, 1.0);
            explicit.insert(earlier);
        }

        let mut similar: Vec<(NodeId, f64)> = {
            let node = &state.nodes[&id];
            state
                .nodes
                .values()
                .filter(|other| other.id != id && !explicit.contains(&other.id))
                .map(|other| {
                    let score = similarity(
                        &node.tokens,
                        node.context_type.as_deref(),
                        &other.tokens,
                        other.context_type.as_deref(),
                    );
                    (other.id, score)
                })
                .filter(|(_, score)| *score >= self.config.min_similarity && *score > 0.0)
                .collect()
        };
        similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        similar.truncate(self.config.auto_link_k);

        for (other, score) in &similar {
            state.add_edge(id, *other, RelationType::Similar, *score);
            state.add_edge(*other, id, RelationType::Similar, *score);
        }

        let mut evicted = Vec::new();
        while state.nodes.len() > self.config.max_nodes {
            let half_life = self.half_life_ms();
            let victim = state
                .nodes
                .values()
                .filter(|n| n.id != id)
                .map(|n| {
                    let refs = n.reference_count.load(Ordering::Relaxed) as f64;
                    (n.id, n.recency(now, half_life) * (refs + 1.0))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
                .map(|(victim, _)| victim);
            let Some(victim) = victim else {
                break;
            };
            state.remove_node(victim);
            evicted.push(victim);
        }

        debug!(
            node_id = %id,
            auto_links = similar.len(),
            evicted = evicted.len(),
            nodes = state.nodes.len(),
            "Added context node"
        );

        Insertion {
            id,
            auto_links: similar.len(),
            evicted,
        }
    }

    /// Most relevant nodes for a query, most relevant first
    ///
    /// Only nodes sharing at least one word with the query are candidates;
    /// a matching context type alone is not enough.
    /// Returned nodes have their reference count and last access bumped.
    #[must_use]
    pub fn retrieve_relevant(&self, query: &Query, max_nodes: usize) -> ContextSubgraph {
        if max_nodes == 0 {
            return ContextSubgraph::default();
        }
        let now = Utc::now();
        let half_life = self.half_life_ms();
        let tokens = tokenize(&query.text);
        let state = self.state.read();

        let candidates: Vec<(&ContextNode, f64, f64)> = state
            .nodes
            .values()
            .filter(|node| !tokens.is_disjoint(&node.tokens))
            .map(|node| {
                let sim = similarity(
                    &tokens,
                    query.context_type.as_deref(),
                    &node.tokens,
                    node.context_type.as_deref(),
                );
                (node, sim, state.link_weight(node))
            })
            .collect();
        let max_link = candidates.iter().map(|c| c.2).fold(0.0_f64, f64::max);

        let mut scored: Vec<(&ContextNode, f64)> = candidates
            .into_iter()
            .map(|(node, sim, link)| {
                let link_norm = if max_link > 0.0 { link / max_link } else { 0.0 };
                let score = RELEVANCE_SIMILARITY_WEIGHT * sim
                    + RELEVANCE_RECENCY_WEIGHT * node.recency(now, half_life)
                    + RELEVANCE_LINK_WEIGHT * link_norm;
                (node, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.id.cmp(&a.0.id)));
        scored.truncate(max_nodes);

        ContextSubgraph::new(
            scored
                .into_iter()
                .map(|(node, score)| {
                    node.touch(now);
                    node.view(score)
                })
                .collect(),
        )
    }

    /// Nodes reachable from `start` within `depth` hops, breadth first
    ///
    /// Only outgoing edges of the given relation are followed (all of them
    /// when `relation` is `None`). `start` itself is not yielded. Every call
    /// walks the current graph from scratch.
    #[must_use]
    pub fn traverse(&self, start: NodeId, relation: Option<RelationType>, depth: usize) -> Traversal {
        let state = self.state.read();
        let mut found = Vec::new();

        if state.nodes.contains_key(&start) {
            let mut seen = HashSet::from([start]);
            let mut queue = VecDeque::from([(start, 0usize)]);

            while let Some((current, hops)) = queue.pop_front() {
                if hops == depth {
                    continue;
                }
                let Some(node) = state.nodes.get(&current) else {
                    continue;
                };
                for edge in &node.edges {
                    if relation.is_some_and(|r| r != edge.relation) {
                        continue;
                    }
                    if !seen.insert(edge.target) {
                        continue;
                    }
                    if let Some(target) = state.nodes.get(&edge.target) {
                        found.push(target.view(0.0));
                        queue.push_back((edge.target, hops + 1));
                    }
                }
            }
        }

        Traversal {
            nodes: found.into_iter(),
        }
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<NodeView> {
        self.state.read().nodes.get(&id).map(|n| n.view(0.0))
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.state.read().nodes.contains_key(&id)
    }

    /// Outgoing edges of a node
    #[must_use]
    pub fn edges(&self, id: NodeId) -> Vec<Edge> {
        self.state
            .read()
            .nodes
            .get(&id)
            .map(|n| n.edges.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    /// Check every edge targets a live node and the reverse index agrees
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::GraphConsistency`] describing the first problem.
    pub fn verify(&self) -> Result<(), RouterError> {
        self.state
            .read()
            .verify()
            .map_err(RouterError::GraphConsistency)
    }

    /// Serializable copy of the graph
    #[must_use]
    pub fn export(&self) -> GraphSnapshot {
        let state = self.state.read();
        GraphSnapshot {
            next_id: state.next_id,
            nodes: state.nodes.values().map(ContextNode::to_record).collect(),
        }
    }

    /// Replace the graph with a previously exported one
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::GraphConsistency`] if the snapshot has
    /// duplicate ids or dangling edges; the current graph is left untouched.
    pub fn restore(&self, snapshot: GraphSnapshot) -> Result<(), RouterError> {
        let mut rebuilt = GraphState {
            next_id: snapshot.next_id.max(1),
            ..Default::default()
        };
        for record in snapshot.nodes {
            let id = record.id;
            if rebuilt
                .nodes
                .insert(id, ContextNode::from_record(record))
                .is_some()
            {
                return Err(RouterError::GraphConsistency(format!("duplicate node {id}")));
            }
        }
        let links: Vec<(NodeId, NodeId)> = rebuilt
            .nodes
            .values()
            .flat_map(|n| n.edges.iter().map(move |e| (n.id, e.target)))
            .collect();
        for (from, to) in links {
            rebuilt.incoming.entry(to).or_default().insert(from);
        }
        if let Some(max) = rebuilt.nodes.keys().next_back() {
            rebuilt.next_id = rebuilt.next_id.max(max.0 + 1);
        }
        rebuilt.verify().map_err(RouterError::GraphConsistency)?;

        let count = rebuilt.nodes.len();
        *self.state.write() = rebuilt;
        debug!(nodes = count, "Restored context graph");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(max_nodes: usize) -> ContextGraph {
        ContextGraph::new(GraphConfig {
            max_nodes,
            ..Default::default()
        })
    }

    #[test]
    fn test_ids_increase_from_one() {
        let g = graph(10);
        assert_eq!(g.add_node("alpha release notes", None, &[]), NodeId(1));
        assert_eq!(g.add_node("kernel panic trace", None, &[]), NodeId(2));
    }

    #[test]
    fn test_explicit_link_runs_from_earlier_node() {
        let g = graph(10);
        let first = g.add_node("database schema", None, &[]);
        let second = g.add_node("frontend colours", None, &[first, NodeId(99)]);

        assert_eq!(
            g.edges(first),
            vec![Edge {
                target: second,
                relation: RelationType::Reference,
                weight: 1.0
            }]
        );
        assert!(g.edges(second).is_empty());
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_auto_links_are_bidirectional_and_capped() {
        let g = graph(10);
        for text in [
            "rust borrow checker error",
            "rust borrow checker lifetime",
            "rust borrow checker move",
            "rust borrow checker closure",
        ] {
            g.add_node(text, Some("code"), &[]);
        }
        let newest = g.add_node("rust borrow checker async", Some("code"), &[]);

        let out: Vec<_> = g
            .edges(newest)
            .into_iter()
            .filter(|e| e.relation == RelationType::Similar)
            .collect();
        assert_eq!(out.len(), 3);
        for edge in out {
            assert!(g
                .edges(edge.target)
                .iter()
                .any(|e| e.target == newest && e.relation == RelationType::Similar));
        }
    }

    #[test]
    fn test_traverse_respects_depth() {
        let g = graph(10);
        let texts = [
            "apples oranges",
            "kernels modules",
            "violins cellos",
            "glaciers fjords",
            "compilers parsers",
        ];
        let mut previous = None;
        for text in texts {
            let mut node = NewNode::new(text);
            if let Some(p) = previous {
                node = node.follows(p);
            }
            previous = Some(g.insert(node).id);
        }

        let ids: Vec<NodeId> = g.traverse(NodeId(1), None, 2).map(|n| n.id).collect();
        assert_eq!(ids, vec![NodeId(2), NodeId(3)]);

        // fresh walk every call
        assert_eq!(g.traverse(NodeId(1), None, 2).len(), 2);
        assert_eq!(g.traverse(NodeId(1), Some(RelationType::Similar), 4).len(), 0);
        assert_eq!(g.traverse(NodeId(42), None, 3).len(), 0);
    }

    #[test]
    fn test_eviction_prefers_unreferenced_nodes() {
        let g = graph(3);
        g.add_node("apples oranges", None, &[]);
        g.add_node("kernels modules", None, &[]);
        g.add_node("violins cellos", None, &[]);

        let hits = g.retrieve_relevant(&Query::new("apples"), 5);
        assert_eq!(hits.node_ids(), vec![NodeId(1)]);
        let hits = g.retrieve_relevant(&Query::new("violins"), 5);
        assert_eq!(hits.node_ids(), vec![NodeId(3)]);

        let inserted = g.insert(NewNode::new("glaciers fjords"));
        assert_eq!(inserted.evicted, vec![NodeId(2)]);
        assert_eq!(g.len(), 3);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_eviction_prunes_edges() {
        let g = graph(2);
        let a = g.add_node("apples oranges", None, &[]);
        let b = g.add_node("kernels modules", None, &[a]);
        let c = g.insert(NewNode::new("violins cellos").references(b));

        assert_eq!(c.evicted, vec![a]);
        assert!(!g.contains(a));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_retrieve_orders_by_relevance() {
        let g = graph(10);
        g.add_node("summarize the nginx error log", Some("analysis"), &[]);
        g.add_node("write a poem about autumn", Some("creative"), &[]);
        g.add_node("nginx access log spikes", Some("analysis"), &[]);

        let hits = g.retrieve_relevant(
            &Query::new("summarize nginx error log").with_context_type("analysis"),
            2,
        );
        assert_eq!(hits.node_ids(), vec![NodeId(1), NodeId(3)]);
        assert!(hits.iter().all(|n| n.relevance > 0.0));
        assert_eq!(g.get(NodeId(1)).unwrap().reference_count, 1);
        assert_eq!(g.get(NodeId(2)).unwrap().reference_count, 0);
    }

    #[test]
    fn test_export_restore_round_trip() {
        let g = graph(10);
        let a = g.add_node("nginx error log", Some("analysis"), &[]);
        g.insert(NewNode::new("nginx access log").follows(a).handled_by("m", true));

        let snapshot = g.export();
        let restored = graph(10);
        restored.restore(snapshot.clone()).unwrap();
        assert_eq!(restored.export(), snapshot);
        assert_eq!(restored.add_node("fresh node", None, &[]), NodeId(3));
    }

    #[test]
    fn test_restore_rejects_dangling_edges() {
        let g = graph(10);
        g.add_node("kept", None, &[]);
        let mut snapshot = g.export();
        snapshot.nodes[0].edges.push(Edge {
            target: NodeId(77),
            relation: RelationType::Reference,
            weight: 1.0,
        });

        assert!(matches!(
            g.restore(snapshot),
            Err(RouterError::GraphConsistency(_))
        ));
        assert_eq!(g.len(), 1);
    }
}
