//! Dependency graph with deterministic ordering.
//!
//! Nodes are kept in ordered collections so that every traversal breaks ties
//! by node order. Edges point from a node to its prerequisites.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use crate::error::{PlanError, Result};

/// Directed acyclic graph of prerequisites.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K: Ord + Clone + Display> {
    prerequisites: BTreeMap<K, BTreeSet<K>>,
}

impl<K: Ord + Clone + Display> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            prerequisites: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone + Display> DependencyGraph<K> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no edges.
    pub fn add_node(&mut self, node: K) {
        self.prerequisites.entry(node).or_default();
    }

    /// Records that `node` must come after `prerequisite`.
    pub fn add_edge(&mut self, node: K, prerequisite: K) {
        self.add_node(prerequisite.clone());
        self.prerequisites.entry(node).or_default().insert(prerequisite);
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prerequisites.len()
    }

    /// Returns true when the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty()
    }

    /// Direct prerequisites of `node`.
    #[must_use]
    pub fn prerequisites_of(&self, node: &K) -> Vec<&K> {
        self.prerequisites
            .get(node)
            .map(|p| p.iter().collect())
            .unwrap_or_default()
    }

    /// Nodes that list `node` as a direct prerequisite.
    #[must_use]
    pub fn dependents_of(&self, node: &K) -> Vec<&K> {
        self.prerequisites
            .iter()
            .filter(|(_, prereqs)| prereqs.contains(node))
            .map(|(n, _)| n)
            .collect()
    }

    /// Groups nodes into layers: every node's prerequisites sit in earlier
    /// layers. Nodes within a layer are in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` naming one cycle if the graph is cyclic.
    pub fn layers(&self) -> Result<Vec<Vec<K>>> {
        let mut remaining: BTreeMap<&K, usize> = self
            .prerequisites
            .iter()
            .map(|(node, prereqs)| (node, prereqs.len()))
            .collect();

        let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();
        for (node, prereqs) in &self.prerequisites {
            for prereq in prereqs {
                dependents.entry(prereq).or_default().push(node);
            }
        }

        let mut layers = Vec::new();
        let mut ready: Vec<&K> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();

        while !ready.is_empty() {
            for node in &ready {
                remaining.remove(*node);
            }

            let mut next = BTreeSet::new();
            for node in &ready {
                for dependent in dependents.get(*node).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(*dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }

            layers.push(ready.into_iter().cloned().collect());
            ready = next.into_iter().collect();
        }

        if remaining.is_empty() {
            Ok(layers)
        } else {
            Err(PlanError::CycleDetected {
                cycle: self.describe_cycle(remaining.keys().copied()),
            }
            .into())
        }
    }

    /// Returns a topological order: prerequisites first, ties by node order.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if the graph is cyclic.
    pub fn topological_order(&self) -> Result<Vec<K>> {
        let mut remaining: BTreeMap<&K, BTreeSet<&K>> = self
            .prerequisites
            .iter()
            .map(|(node, prereqs)| (node, prereqs.iter().collect()))
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        while let Some(next) = remaining
            .iter()
            .find(|(_, prereqs)| prereqs.is_empty())
            .map(|(node, _)| *node)
        {
            remaining.remove(next);
            for prereqs in remaining.values_mut() {
                prereqs.remove(next);
            }
            order.push(next.clone());
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            Err(PlanError::CycleDetected {
                cycle: self.describe_cycle(remaining.keys().copied()),
            }
            .into())
        }
    }

    /// Reverse topological order: dependents first.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if the graph is cyclic.
    pub fn reverse_order(&self) -> Result<Vec<K>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Finds one cycle among `stuck` nodes and renders it as `a -> b -> a`.
    ///
    /// Every node left over by Kahn's algorithm either sits on a cycle or
    /// leads to one, so following unresolved prerequisites from the first
    /// stuck node must revisit a node.
    fn describe_cycle<'a>(&'a self, stuck: impl Iterator<Item = &'a K>) -> String {
        let stuck: BTreeSet<&K> = stuck.collect();
        let Some(start) = stuck.iter().next().copied() else {
            return String::new();
        };

        let mut path: Vec<&K> = vec![start];
        let mut current = start;
        loop {
            let Some(next) = self
                .prerequisites
                .get(current)
                .and_then(|p| p.iter().find(|n| stuck.contains(n)))
            else {
                break;
            };

            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
                cycle.push(next.to_string());
                return cycle.join(" -> ");
            }

            path.push(next);
            current = next;
        }

        path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergentError;

    fn frontdoor() -> DependencyGraph<String> {
        let mut graph = DependencyGraph::new();
        graph.add_edge(String::from("routing-rule"), String::from("backend-bing"));
        graph.add_edge(String::from("routing-rule"), String::from("frontend-endpoint"));
        graph.add_edge(String::from("backend-bing"), String::from("health-check"));
        graph
    }

    #[test]
    fn test_topological_order_puts_prerequisites_first() {
        let order = frontdoor().topological_order().expect("acyclic");
        assert_eq!(
            order,
            vec!["frontend-endpoint", "health-check", "backend-bing", "routing-rule"]
        );
        assert_eq!(frontdoor().reverse_order().expect("acyclic").first().map(String::as_str), Some("routing-rule"));
    }

    #[test]
    fn test_layers() {
        let layers = frontdoor().layers().expect("acyclic");
        assert_eq!(
            layers,
            vec![
                vec![String::from("frontend-endpoint"), String::from("health-check")],
                vec![String::from("backend-bing")],
                vec![String::from("routing-rule")],
            ]
        );
    }

    #[test]
    fn test_cycle_is_named() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");
        graph.add_edge("c", "a");

        match graph.layers() {
            Err(ConvergentError::Plan(PlanError::CycleDetected { cycle })) => {
                assert_eq!(cycle, "a -> b -> a");
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(1usize, 1usize);

        match graph.topological_order() {
            Err(ConvergentError::Plan(PlanError::CycleDetected { cycle })) => assert_eq!(cycle, "1 -> 1"),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_dependents_of() {
        let graph = frontdoor();
        let backend = String::from("backend-bing");
        assert_eq!(graph.dependents_of(&backend), vec![&String::from("routing-rule")]);
        assert_eq!(graph.prerequisites_of(&backend), vec![&String::from("health-check")]);
    }
}
