//! Execution ordering.

use serde::Serialize;

use crate::error::{GraphError, Result};

use super::DependencyGraph;

/// Nodes grouped into batches that may run concurrently.
///
/// Every dependency of a node sits in a strictly earlier batch. Within a
/// batch nodes appear in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    /// Declaration indices, batch by batch.
    pub batches: Vec<Vec<usize>>,
}

/// Computes execution orders with Kahn layering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Schedule {
    /// Number of batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Returns true if there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Nodes in execution order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.batches.iter().flatten().copied()
    }

    /// Batch number of each node, indexed by declaration index.
    #[must_use]
    pub fn positions(&self, count: usize) -> Vec<Option<usize>> {
        let mut positions = vec![None; count];
        for (batch, nodes) in self.batches.iter().enumerate() {
            for &node in nodes {
                if let Some(slot) = positions.get_mut(node) {
                    *slot = Some(batch);
                }
            }
        }
        positions
    }

    /// The same layering, last batch first.
    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.batches.reverse();
        self
    }
}

impl Scheduler {
    /// Orders a validated graph for creation: dependencies first.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the graph has a cycle.
    pub fn order(graph: &DependencyGraph) -> Result<Schedule> {
        Self::layer(&graph.names(), |node| graph.dependencies(node))
    }

    /// Orders a validated graph for deletion: dependents first.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the graph has a cycle.
    pub fn reverse_order(graph: &DependencyGraph) -> Result<Schedule> {
        Self::order(graph).map(Schedule::reversed)
    }

    /// Layers `names.len()` nodes given each node's dependencies.
    ///
    /// Repeatedly extracts every node whose remaining in-degree is zero.
    /// Dependencies outside `0..names.len()` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] naming the nodes that could
    /// never be scheduled.
    pub fn layer<F>(names: &[String], dependencies: F) -> Result<Schedule>
    where
        F: Fn(usize) -> Vec<usize>,
    {
        let count = names.len();
        let mut in_degree = vec![0_usize; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for node in 0..count {
            let mut deps = dependencies(node);
            deps.sort_unstable();
            deps.dedup();
            for dep in deps.into_iter().filter(|&d| d < count) {
                in_degree[node] += 1;
                dependents[dep].push(node);
            }
        }

        let mut scheduled = vec![false; count];
        let mut ready: Vec<usize> = (0..count).filter(|&n| in_degree[n] == 0).collect();
        let mut schedule = Schedule::default();

        while !ready.is_empty() {
            let mut next = Vec::new();
            for &node in &ready {
                scheduled[node] = true;
                for &dependent in &dependents[node] {
                    in_degree[dependent] = in_degree[dependent].saturating_sub(1);
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            schedule.batches.push(std::mem::replace(&mut ready, next));
        }

        if scheduled.iter().all(|&s| s) {
            Ok(schedule)
        } else {
            Err(GraphError::CyclicDependency {
                cycle: (0..count)
                    .filter(|&n| !scheduled[n])
                    .map(|n| names[n].clone())
                    .collect(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::declare_thing;

    fn assert_dependencies_precede(graph: &DependencyGraph, schedule: &Schedule) {
        let positions = schedule.positions(graph.len());
        for node in 0..graph.len() {
            let own = positions[node].expect("scheduled");
            for dep in graph.dependencies(node) {
                assert!(positions[dep].expect("scheduled") < own, "{dep} must precede {node}");
            }
        }
    }

    #[test]
    fn test_chain_is_one_node_per_batch() {
        let mut graph = DependencyGraph::new();
        declare_thing(&mut graph, "Registry", &[]);
        declare_thing(&mut graph, "Image", &["Registry"]);
        declare_thing(&mut graph, "Service", &["Image"]);

        let schedule = Scheduler::order(&graph).expect("order");
        assert_eq!(schedule.batches, vec![vec![0], vec![1], vec![2]]);

        let reverse = Scheduler::reverse_order(&graph).expect("reverse");
        assert_eq!(reverse.batches, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn test_independent_nodes_share_a_batch_in_declaration_order() {
        let mut graph = DependencyGraph::new();
        declare_thing(&mut graph, "vpc", &[]);
        declare_thing(&mut graph, "cluster", &[]);
        declare_thing(&mut graph, "subnets", &["vpc"]);
        declare_thing(&mut graph, "sg", &["vpc"]);
        declare_thing(&mut graph, "service", &["cluster", "subnets", "sg"]);

        let schedule = Scheduler::order(&graph).expect("order");
        assert_eq!(schedule.batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(schedule.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_dependencies_always_in_earlier_batches() {
        // Node i depends on each earlier node j selected by a rotating bit pattern.
        for seed in 1_u64..40 {
            let mut graph = DependencyGraph::new();
            let names: Vec<String> = (0..12).map(|i| format!("n{i}")).collect();
            let mut state = seed;
            for (i, name) in names.iter().enumerate() {
                let mut after = Vec::new();
                for earlier in names.iter().take(i) {
                    state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    if state >> 61 == 0 {
                        after.push(earlier.as_str());
                    }
                }
                declare_thing(&mut graph, name, &after);
            }
            graph.validate().expect("acyclic");
            let schedule = Scheduler::order(&graph).expect("order");
            assert_eq!(schedule.iter().count(), graph.len());
            assert_dependencies_precede(&graph, &schedule);
        }
    }

    #[test]
    fn test_layer_reports_unschedulable_nodes() {
        let names = vec![String::from("a"), String::from("b"), String::from("c")];
        let deps = |n: usize| match n {
            0 => vec![1],
            1 => vec![0],
            _ => vec![],
        };
        let err = Scheduler::layer(&names, deps).expect_err("cycle");
        assert!(err.to_string().contains("a -> b"));
    }

    #[test]
    fn test_empty_graph_has_no_batches() {
        let schedule = Scheduler::order(&DependencyGraph::new()).expect("order");
        assert!(schedule.is_empty());
    }
}
