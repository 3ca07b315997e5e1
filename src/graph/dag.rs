//! Resource dependency graph.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::resource::ResourceNode;

/// Declared resources linked by output references.
///
/// Edges point from a producer to the resource consuming its outputs.
/// Nodes are stored in declaration order, and a node's position in that order
/// is its index everywhere else in the engine.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// The underlying petgraph graph; node weights are declaration indices.
    graph: DiGraph<usize, ()>,
    /// Declared nodes, in declaration order.
    nodes: Vec<ResourceNode>,
    /// Logical name to declaration index.
    index: HashMap<String, usize>,
}

/// Visit state used by cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Registers a node and an edge for every resource whose outputs it consumes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateResource`] for a repeated logical name, or
    /// [`GraphError::UnknownReference`] if an input refers to a resource not
    /// declared in this graph.
    pub fn declare(&mut self, node: ResourceNode) -> Result<usize> {
        if self.index.contains_key(&node.name) {
            return Err(GraphError::DuplicateResource { name: node.name }.into());
        }

        let producers = node
            .referenced_resources()
            .into_iter()
            .map(|target| {
                self.index.get(&target).copied().ok_or_else(|| GraphError::UnknownReference {
                    resource: node.name.clone(),
                    target,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let position = self.nodes.len();
        let idx = self.graph.add_node(position);
        for producer in producers {
            self.graph.add_edge(NodeIndex::new(producer), idx, ());
        }
        debug!(resource = %node.name, index = position, "Declared resource");

        self.index.insert(node.name.clone(), position);
        self.nodes.push(node);
        Ok(position)
    }

    /// Resolves explicit `depends_on` options and checks the graph is acyclic.
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownReference`] for a `depends_on` naming an
    /// undeclared resource, or [`GraphError::CyclicDependency`] naming the
    /// resources on a cycle, starting from the earliest declared one.
    pub fn validate(&mut self) -> Result<()> {
        let mut explicit = Vec::new();
        for (position, node) in self.nodes.iter().enumerate() {
            for target in &node.options.depends_on {
                let producer = self.index.get(target).copied().ok_or_else(|| {
                    GraphError::UnknownReference {
                        resource: node.name.clone(),
                        target: target.clone(),
                    }
                })?;
                explicit.push((producer, position));
            }
        }
        for (producer, dependent) in explicit {
            self.graph
                .update_edge(NodeIndex::new(producer), NodeIndex::new(dependent), ());
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(GraphError::CyclicDependency {
                cycle: cycle.into_iter().map(|i| self.nodes[i].name.clone()).collect(),
            }
            .into());
        }
        Ok(())
    }

    /// Depth-first search with a recursion-stack marker.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        (0..self.nodes.len()).find_map(|root| {
            if marks[root] == Mark::Unvisited {
                self.visit(root, &mut marks, &mut stack)
            } else {
                None
            }
        })
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for next in self.dependents(node) {
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    let earliest = cycle
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, n)| **n)
                        .map_or(0, |(i, _)| i);
                    cycle.rotate_left(earliest);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Declaration indices of the resources `node` depends on, ascending.
    #[must_use]
    pub fn dependencies(&self, node: usize) -> Vec<usize> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Declaration indices of the resources depending on `node`, ascending.
    #[must_use]
    pub fn dependents(&self, node: usize) -> Vec<usize> {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: usize, direction: Direction) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(node), direction)
            .map(NodeIndex::index)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Every resource transitively depending on `node`, ascending.
    #[must_use]
    pub fn descendants(&self, node: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut pending = self.dependents(node);
        while let Some(next) = pending.pop() {
            if !seen[next] {
                seen[next] = true;
                pending.extend(self.dependents(next));
            }
        }
        (0..self.nodes.len()).filter(|&i| seen[i]).collect()
    }

    /// The node at declaration index `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn node(&self, index: usize) -> &ResourceNode {
        &self.nodes[index]
    }

    /// All nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Declaration index of a logical name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Logical names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Inputs, ResourceOptions};
    use crate::testing::{declare_thing, thing_schema};

    #[test]
    fn test_edges_follow_references() {
        let mut graph = DependencyGraph::new();
        declare_thing(&mut graph, "a", &[]);
        declare_thing(&mut graph, "b", &["a"]);
        declare_thing(&mut graph, "c", &["a", "b"]);

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.dependencies(2), vec![0, 1]);
        assert_eq!(graph.dependents(0), vec![1, 2]);
        assert_eq!(graph.descendants(0), vec![1, 2]);
        graph.validate().expect("acyclic");
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut graph = DependencyGraph::new();
        declare_thing(&mut graph, "a", &[]);
        let again = ResourceNode::new("a", thing_schema(), Inputs::new(), ResourceOptions::new())
            .expect("node");
        let err = graph.declare(again).expect_err("duplicate");
        assert!(err.to_string().contains("Duplicate resource name: a"));
    }

    #[test]
    fn test_reference_to_foreign_graph_rejected() {
        let mut other = DependencyGraph::new();
        let foreign = declare_thing(&mut other, "elsewhere", &[]);

        let mut graph = DependencyGraph::new();
        let node = ResourceNode::new(
            "b",
            thing_schema(),
            Inputs::new().set("after", foreign.output("value").expect("value")),
            ResourceOptions::new(),
        )
        .expect("node");
        let err = graph.declare(node).expect_err("unknown reference");
        assert!(err.to_string().contains("elsewhere"));
    }

    #[test]
    fn test_cycle_through_depends_on_names_participants() {
        let mut graph = DependencyGraph::new();
        let a = ResourceNode::new(
            "a",
            thing_schema(),
            Inputs::new(),
            ResourceOptions::new().depends_on("c"),
        )
        .expect("node");
        graph.declare(a).expect("a");
        declare_thing(&mut graph, "b", &["a"]);
        declare_thing(&mut graph, "c", &["b"]);
        declare_thing(&mut graph, "d", &[]);

        let err = graph.validate().expect_err("cycle");
        match err {
            crate::error::StackweaveError::Graph(GraphError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let a = ResourceNode::new(
            "a",
            thing_schema(),
            Inputs::new(),
            ResourceOptions::new().depends_on("a"),
        )
        .expect("node");
        graph.declare(a).expect("a");
        let err = graph.validate().expect_err("self cycle");
        assert!(err.to_string().contains('a'));
    }

    #[test]
    fn test_unknown_depends_on_rejected() {
        let mut graph = DependencyGraph::new();
        let a = ResourceNode::new(
            "a",
            thing_schema(),
            Inputs::new(),
            ResourceOptions::new().depends_on("ghost"),
        )
        .expect("node");
        graph.declare(a).expect("a");
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut graph = DependencyGraph::new();
        declare_thing(&mut graph, "a", &[]);
        let b = ResourceNode::new(
            "b",
            thing_schema(),
            Inputs::new(),
            ResourceOptions::new().depends_on("a"),
        )
        .expect("node");
        graph.declare(b).expect("b");

        graph.validate().expect("first");
        graph.validate().expect("second");
        assert_eq!(graph.edge_count(), 1);
    }
}
