//! Static workflow graphs
//!
//! A graph is a set of named nodes connected by unconditional and conditional
//! edges with designated `START` and `END` sentinels. Construction happens
//! through [`GraphBuilder`]; [`GraphBuilder::compile`] validates the structure
//! once, and the resulting [`CompiledGraph`] is immutable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::channel::ChannelSet;
use crate::node::{Node, NodeError};
use crate::state::WorkflowState;

/// Entry sentinel; has exactly one outbound edge
pub const START: &str = "__start__";

/// Termination sentinel; absorbing
pub const END: &str = "__end__";

/// Route function for conditional edges
///
/// Routes are pure over the post-update state and must not suspend. A route
/// that returns an error is fatal for the run (no retry).
pub type RouteFn = Arc<dyn Fn(&WorkflowState) -> Result<String, NodeError> + Send + Sync>;

/// Errors from graph construction and routing
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two nodes registered under the same name
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    /// An edge references a node that was never added
    #[error("edge references unknown node: {0}")]
    UnknownNode(String),

    /// START must have exactly one outbound edge
    #[error("graph entry is invalid: {0}")]
    InvalidEntry(String),

    /// A node has no inbound path from START
    #[error("node is unreachable from start: {0}")]
    Unreachable(String),

    /// A node cannot reach END under any admissible route
    #[error("no path to end from node: {0}")]
    NoPathToEnd(String),

    /// A node has no outgoing edge at all
    #[error("node has no outgoing edge: {0}")]
    MissingEdge(String),

    /// A route function returned a label outside the declared map
    #[error("route from {node} returned undeclared label: {label}")]
    InvalidRoute { node: String, label: String },
}

enum Edge {
    Direct(String),
    Conditional {
        route: RouteFn,
        targets: HashMap<String, String>,
    },
}

/// The step resolved from an edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Continue with the named node
    Node(String),
    /// The run is complete
    End,
}

/// Builder for workflow graphs
pub struct GraphBuilder {
    channels: ChannelSet,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    duplicate: Option<String>,
}

impl GraphBuilder {
    /// Start building a graph over the given channels
    pub fn new(channels: ChannelSet) -> Self {
        Self {
            channels,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            duplicate: None,
        }
    }

    /// Add a node
    pub fn add_node(mut self, node: Arc<dyn Node>) -> Self {
        let name = node.name().to_string();
        if self.nodes.insert(name.clone(), node).is_some() {
            self.duplicate.get_or_insert(name);
        }
        self
    }

    /// Add an unconditional edge `from -> to`
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Add a conditional edge: `from -> route(state) -> label -> target`
    ///
    /// The target map must list every label the route can return; an
    /// undeclared label fails the run with [`GraphError::InvalidRoute`].
    pub fn add_conditional_edges(
        mut self,
        from: impl Into<String>,
        route: RouteFn,
        targets: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.edges.insert(
            from.into(),
            Edge::Conditional {
                route,
                targets: targets.into_iter().collect(),
            },
        );
        self
    }

    /// Validate the structure and freeze the graph
    pub fn compile(self) -> Result<CompiledGraph, GraphError> {
        if let Some(name) = self.duplicate {
            return Err(GraphError::DuplicateNode(name));
        }

        // Every edge endpoint must be a known node or a sentinel
        let known = |name: &str| name == END || self.nodes.contains_key(name);
        for (from, edge) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            match edge {
                Edge::Direct(to) => {
                    if !known(to) {
                        return Err(GraphError::UnknownNode(to.clone()));
                    }
                }
                Edge::Conditional { targets, .. } => {
                    for to in targets.values() {
                        if !known(to) {
                            return Err(GraphError::UnknownNode(to.clone()));
                        }
                    }
                }
            }
        }

        // START has exactly one outbound edge, and it is unconditional
        let entry = match self.edges.get(START) {
            Some(Edge::Direct(to)) => to.clone(),
            Some(Edge::Conditional { .. }) => {
                return Err(GraphError::InvalidEntry(
                    "start edge must be unconditional".to_string(),
                ))
            }
            None => {
                return Err(GraphError::InvalidEntry(
                    "no edge out of start".to_string(),
                ))
            }
        };

        // Forward reachability from START over all admissible targets
        let successors = |name: &str| -> Vec<String> {
            match self.edges.get(name) {
                Some(Edge::Direct(to)) => vec![to.clone()],
                Some(Edge::Conditional { targets, .. }) => targets.values().cloned().collect(),
                None => vec![],
            }
        };

        let mut reachable: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([entry.clone()]);
        while let Some(name) = queue.pop_front() {
            if name == END || !reachable.insert(name.clone()) {
                continue;
            }
            for next in successors(&name) {
                queue.push_back(next);
            }
        }
        for name in self.nodes.keys() {
            if !reachable.contains(name) {
                return Err(GraphError::Unreachable(name.clone()));
            }
        }

        // Every node must reach END via some admissible state: walk backwards
        // from END over the edge union. A node with no outgoing edge at all
        // can never terminate.
        for name in self.nodes.keys() {
            if !self.edges.contains_key(name) {
                return Err(GraphError::MissingEdge(name.clone()));
            }
        }

        let mut reaches_end: HashSet<String> = HashSet::new();
        loop {
            let mut changed = false;
            for name in self.nodes.keys() {
                if reaches_end.contains(name) {
                    continue;
                }
                let nexts = successors(name);
                if nexts
                    .iter()
                    .any(|n| n == END || reaches_end.contains(n))
                {
                    reaches_end.insert(name.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for name in self.nodes.keys() {
            if !reaches_end.contains(name) {
                return Err(GraphError::NoPathToEnd(name.clone()));
            }
        }

        Ok(CompiledGraph {
            channels: self.channels,
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}

/// A validated, immutable workflow graph
pub struct CompiledGraph {
    channels: ChannelSet,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl CompiledGraph {
    /// The channels declared for this graph
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// The first node after START
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    /// Number of nodes (used for coarse progress estimation)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve the step after `current` given the post-update state
    ///
    /// `current` may be [`START`]. Route errors propagate as-is; a label
    /// outside the declared map is [`GraphError::InvalidRoute`].
    pub fn next(&self, current: &str, state: &WorkflowState) -> Result<Step, GraphError> {
        if current == START {
            return Ok(if self.entry == END {
                Step::End
            } else {
                Step::Node(self.entry.clone())
            });
        }
        let edge = self
            .edges
            .get(current)
            .ok_or_else(|| GraphError::MissingEdge(current.to_string()))?;

        let target = match edge {
            Edge::Direct(to) => to.clone(),
            Edge::Conditional { route, targets } => {
                let label = route(state).map_err(|e| GraphError::InvalidRoute {
                    node: current.to_string(),
                    label: format!("route failed: {e}"),
                })?;
                match targets.get(&label) {
                    Some(to) => to.clone(),
                    None => {
                        return Err(GraphError::InvalidRoute {
                            node: current.to_string(),
                            label,
                        })
                    }
                }
            }
        };

        if target == END {
            Ok(Step::End)
        } else {
            Ok(Step::Node(target))
        }
    }

    /// Resolve a conditional route directly, surfacing route failures
    ///
    /// Unlike [`CompiledGraph::next`], a route error is returned to the
    /// caller unchanged so the runtime can classify it (e.g. quality
    /// exhaustion raised by a route).
    pub fn route(&self, current: &str, state: &WorkflowState) -> Result<Step, RouteOutcome> {
        if current == START {
            return Ok(if self.entry == END {
                Step::End
            } else {
                Step::Node(self.entry.clone())
            });
        }
        let edge = match self.edges.get(current) {
            Some(e) => e,
            None => {
                return Err(RouteOutcome::Graph(GraphError::MissingEdge(
                    current.to_string(),
                )))
            }
        };

        let target = match edge {
            Edge::Direct(to) => to.clone(),
            Edge::Conditional { route, targets } => {
                let label = route(state).map_err(RouteOutcome::Failed)?;
                match targets.get(&label) {
                    Some(to) => to.clone(),
                    None => {
                        return Err(RouteOutcome::Graph(GraphError::InvalidRoute {
                            node: current.to_string(),
                            label,
                        }))
                    }
                }
            }
        };

        if target == END {
            Ok(Step::End)
        } else {
            Ok(Step::Node(target))
        }
    }
}

/// Failure surfaced while resolving a route
#[derive(Debug)]
pub enum RouteOutcome {
    /// The route function itself failed (fatal, no retry)
    Failed(NodeError),
    /// Structural routing error (undeclared label, missing edge)
    Graph(GraphError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FnNode;
    use crate::state::StateUpdate;
    use serde_json::json;

    fn noop(name: &str) -> Arc<dyn Node> {
        Arc::new(FnNode::new(name.to_string(), |_ctx, _state| async {
            Ok(StateUpdate::new())
        }))
    }

    fn linear_graph() -> GraphBuilder {
        GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END)
    }

    #[test]
    fn test_compile_linear() {
        let graph = linear_graph().compile().unwrap();
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_next_steps_through() {
        let graph = linear_graph().compile().unwrap();
        let state = WorkflowState::new();

        assert_eq!(graph.next(START, &state).unwrap(), Step::Node("a".into()));
        assert_eq!(graph.next("a", &state).unwrap(), Step::Node("b".into()));
        assert_eq!(graph.next("b", &state).unwrap(), Step::End);
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let result = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_edge(START, "a")
            .add_edge("a", "ghost")
            .compile();
        assert!(matches!(result, Err(GraphError::UnknownNode(_))));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let result = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_edge("a", END)
            .compile();
        assert!(matches!(result, Err(GraphError::InvalidEntry(_))));
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let result = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_node(noop("island"))
            .add_edge(START, "a")
            .add_edge("a", END)
            .add_edge("island", END)
            .compile();
        assert!(matches!(result, Err(GraphError::Unreachable(_))));
    }

    #[test]
    fn test_node_without_path_to_end_rejected() {
        // a -> b -> a is a cycle with no admissible exit
        let result = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "a")
            .compile();
        assert!(matches!(result, Err(GraphError::NoPathToEnd(_))));
    }

    #[test]
    fn test_conditional_cycle_with_exit_is_valid() {
        // check routes back to produce (retry) or to END (pass); the cycle is
        // admissible because one label escapes.
        let route: RouteFn = Arc::new(|state: &WorkflowState| {
            if state.counter("passed") > 0 {
                Ok("pass".to_string())
            } else {
                Ok("retry".to_string())
            }
        });
        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("produce"))
            .add_node(noop("check"))
            .add_edge(START, "produce")
            .add_edge("produce", "check")
            .add_conditional_edges(
                "check",
                route,
                [
                    ("pass".to_string(), END.to_string()),
                    ("retry".to_string(), "produce".to_string()),
                ],
            )
            .compile()
            .unwrap();

        let mut state = WorkflowState::new();
        assert_eq!(
            graph.next("check", &state).unwrap(),
            Step::Node("produce".into())
        );
        state.insert("passed", json!(1));
        assert_eq!(graph.next("check", &state).unwrap(), Step::End);
    }

    #[test]
    fn test_undeclared_label_is_invalid_route() {
        let route: RouteFn = Arc::new(|_state| Ok("surprise".to_string()));
        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_edge(START, "a")
            .add_conditional_edges("a", route, [("ok".to_string(), END.to_string())])
            .compile()
            .unwrap();

        let result = graph.next("a", &WorkflowState::new());
        assert!(matches!(result, Err(GraphError::InvalidRoute { .. })));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_node(noop("a"))
            .add_edge(START, "a")
            .add_edge("a", END)
            .compile();
        assert!(matches!(result, Err(GraphError::DuplicateNode(_))));
    }

    #[test]
    fn test_route_failure_surfaces() {
        let route: RouteFn = Arc::new(|_state| Err(NodeError::quality_exhausted("spent")));
        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(noop("a"))
            .add_edge(START, "a")
            .add_conditional_edges("a", route, [("ok".to_string(), END.to_string())])
            .compile()
            .unwrap();

        match graph.route("a", &WorkflowState::new()) {
            Err(RouteOutcome::Failed(err)) => {
                assert_eq!(err.error_type.as_deref(), Some("QualityExhausted"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
