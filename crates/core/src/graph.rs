//! Workflow graph: a DAG of task descriptors produced by a pipeline generator.
//!
//! Nodes are not service records yet; the workflow executor turns each
//! runnable node into one. Edges point from upstream to downstream ("must
//! complete before").

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::scheduling::ServiceState;
use crate::types::ServiceId;

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique within the graph.
    pub id: String,
    /// Processor name the node's service record will run.
    pub processor: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dictionary_args: Map<String, Value>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Output recorded by an earlier run. A node with an existing output is
    /// skipped unless the run forces it.
    #[serde(default)]
    pub existing_output: Option<Value>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processor: processor.into(),
            description: None,
            args: Vec::new(),
            dictionary_args: Map::new(),
            resources: BTreeMap::new(),
            existing_output: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_dictionary_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.dictionary_args.insert(name.into(), value);
        self
    }

    pub fn with_existing_output(mut self, output: Value) -> Self {
        self.existing_output = Some(output);
        self
    }
}

/// `upstream` must complete before `downstream` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
}

impl Edge {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// A validated DAG. Construction rejects duplicate node ids, dangling edges
/// and cycles, so every `WorkflowGraph` value has a topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGraph", into = "RawGraph")]
pub struct WorkflowGraph {
    nodes: Vec<TaskNode>,
    edges: Vec<Edge>,
    order: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct RawGraph {
    nodes: Vec<TaskNode>,
    edges: Vec<Edge>,
}

impl TryFrom<RawGraph> for WorkflowGraph {
    type Error = CoreError;

    fn try_from(raw: RawGraph) -> Result<Self, Self::Error> {
        WorkflowGraph::new(raw.nodes, raw.edges)
    }
}

impl From<WorkflowGraph> for RawGraph {
    fn from(graph: WorkflowGraph) -> Self {
        RawGraph {
            nodes: graph.nodes,
            edges: graph.edges,
        }
    }
}

impl WorkflowGraph {
    pub fn new(nodes: Vec<TaskNode>, edges: Vec<Edge>) -> Result<Self, CoreError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(CoreError::Validation(format!(
                    "Duplicate workflow node '{}'",
                    node.id
                )));
            }
        }

        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for edge in &edges {
            let (Some(&up), Some(&down)) = (
                index.get(edge.upstream.as_str()),
                index.get(edge.downstream.as_str()),
            ) else {
                return Err(CoreError::Validation(format!(
                    "Edge {} -> {} references an unknown node",
                    edge.upstream, edge.downstream
                )));
            };
            if up == down {
                return Err(CoreError::Validation(format!(
                    "Node '{}' depends on itself",
                    edge.upstream
                )));
            }
            downstream[up].push(down);
            in_degree[down] += 1;
        }

        // Kahn's algorithm; the ready set is ordered by insertion index so the
        // resulting order is stable for identical input.
        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &d in &downstream[next] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() != nodes.len() {
            let stuck: Vec<&str> = (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].id.as_str())
                .collect();
            return Err(CoreError::Validation(format!(
                "Workflow graph contains a cycle through: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self {
            nodes,
            edges,
            order,
        })
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes in topological order.
    pub fn topological_order(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().map(move |&i| &self.nodes[i])
    }

    /// Direct upstream node ids of `id`, in edge declaration order.
    pub fn upstream(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.downstream == id)
            .map(|e| e.upstream.as_str())
            .collect()
    }

    /// Nodes nothing depends on.
    pub fn sinks(&self) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.upstream == n.id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Execution status of one graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Service created for the node; `None` when skipped or not yet submitted.
    pub service_id: Option<ServiceId>,
    pub state: Option<ServiceState>,
    pub skipped: bool,
}

/// Read-only view for workflow viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<Edge>,
    pub states: BTreeMap<String, NodeState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn edge(up: &str, down: &str) -> Edge {
        Edge {
            upstream: up.into(),
            downstream: down.into(),
        }
    }

    fn ids(graph: &WorkflowGraph) -> Vec<&str> {
        graph.topological_order().map(|n| n.id.as_str()).collect()
    }

    // -- ordering ------------------------------------------------------------

    #[test]
    fn diamond_orders_upstream_first() {
        let graph = WorkflowGraph::new(
            vec![
                TaskNode::new("merge", "p"),
                TaskNode::new("left", "p"),
                TaskNode::new("right", "p"),
                TaskNode::new("load", "p"),
            ],
            vec![
                edge("load", "left"),
                edge("load", "right"),
                edge("left", "merge"),
                edge("right", "merge"),
            ],
        )
        .unwrap();
        assert_eq!(ids(&graph), vec!["load", "left", "right", "merge"]);
    }

    #[test]
    fn independent_nodes_keep_insertion_order() {
        let graph = WorkflowGraph::new(
            vec![TaskNode::new("c", "p"), TaskNode::new("a", "p"), TaskNode::new("b", "p")],
            vec![],
        )
        .unwrap();
        assert_eq!(ids(&graph), vec!["c", "a", "b"]);
    }

    #[test]
    fn order_is_stable_across_builds() {
        let build = || {
            WorkflowGraph::new(
                (0..8).map(|i| TaskNode::new(format!("n{i}"), "p")).collect(),
                vec![edge("n7", "n0"), edge("n3", "n1"), edge("n0", "n5")],
            )
            .unwrap()
        };
        let first: Vec<String> = build().topological_order().map(|n| n.id.clone()).collect();
        for _ in 0..5 {
            let again: Vec<String> = build().topological_order().map(|n| n.id.clone()).collect();
            assert_eq!(first, again);
        }
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn rejects_cycle() {
        let err = WorkflowGraph::new(
            vec![TaskNode::new("a", "p"), TaskNode::new("b", "p"), TaskNode::new("c", "p")],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        )
        .unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("cycle") && msg.contains('b'));
    }

    #[test]
    fn rejects_self_loop_and_dangling_edge() {
        assert!(WorkflowGraph::new(vec![TaskNode::new("a", "p")], vec![edge("a", "a")]).is_err());
        assert!(WorkflowGraph::new(vec![TaskNode::new("a", "p")], vec![edge("a", "x")]).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        assert!(WorkflowGraph::new(vec![TaskNode::new("a", "p"), TaskNode::new("a", "q")], vec![]).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let json = serde_json::json!({
            "nodes": [{"id": "a", "processor": "p"}, {"id": "b", "processor": "p"}],
            "edges": [{"upstream": "a", "downstream": "b"}, {"upstream": "b", "downstream": "a"}],
        });
        assert!(serde_json::from_value::<WorkflowGraph>(json).is_err());
    }

    // -- queries -------------------------------------------------------------

    #[test]
    fn upstream_and_sinks() {
        let graph = WorkflowGraph::new(
            vec![TaskNode::new("a", "p"), TaskNode::new("b", "p"), TaskNode::new("c", "p")],
            vec![edge("a", "c"), edge("b", "c")],
        )
        .unwrap();
        assert_eq!(graph.upstream("c"), vec!["a", "b"]);
        let sinks: Vec<&str> = graph.sinks().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(sinks, vec!["c"]);
    }
}
