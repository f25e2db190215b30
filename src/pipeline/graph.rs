//! Index-based dependency graph for pipeline helpers.
//!
//! Nodes are addressed by their registration index. Edges point from a
//! dependency to its dependants. Ordering uses Kahn's algorithm; among ready
//! nodes the highest priority wins, then the earliest registration.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::Serialize;
use thiserror::Error;

/// Borrowed description of one node, in registration order.
#[derive(Debug, Clone, Copy)]
pub struct GraphNode<'a> {
    pub key: &'a str,
    pub priority: i32,
    pub dependencies: &'a [String],
}

/// A dependency naming a key that is not part of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingEdge {
    pub key: String,
    pub dependency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected involving: {}", members.join(", "))]
pub struct CycleError {
    /// Nodes that sit on (or between) cycles, in registration order.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    keys: Vec<String>,
    dependants: Vec<Vec<usize>>,
    order: Vec<usize>,
    missing: Vec<MissingEdge>,
}

impl DependencyGraph {
    pub fn build<'a, I>(nodes: I) -> Result<Self, CycleError>
    where
        I: IntoIterator<Item = GraphNode<'a>>,
    {
        let nodes: Vec<GraphNode<'a>> = nodes.into_iter().collect();
        let index_by_key: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.key, idx))
            .collect();

        let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        let mut missing = Vec::new();

        for (idx, node) in nodes.iter().enumerate() {
            for dependency in node.dependencies {
                let Some(&dep_idx) = index_by_key.get(dependency.as_str()) else {
                    missing.push(MissingEdge {
                        key: node.key.to_string(),
                        dependency: dependency.clone(),
                    });
                    continue;
                };
                if dependants[dep_idx].contains(&idx) {
                    continue;
                }
                dependants[dep_idx].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut ready: BinaryHeap<(i32, Reverse<usize>)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| (nodes[idx].priority, Reverse(idx)))
            .collect();

        let mut remaining = in_degree.clone();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some((_, Reverse(current))) = ready.pop() {
            order.push(current);
            for &next in &dependants[current] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.push((nodes[next].priority, Reverse(next)));
                }
            }
        }

        if order.len() != nodes.len() {
            let members = cycle_core(&dependants, &remaining)
                .into_iter()
                .map(|idx| nodes[idx].key.to_string())
                .collect();
            return Err(CycleError { members });
        }

        Ok(Self {
            keys: nodes.iter().map(|node| node.key.to_string()).collect(),
            dependants,
            order,
            missing,
        })
    }

    /// Registration indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn ordered_keys(&self) -> Vec<&str> {
        self.order.iter().map(|&idx| self.keys[idx].as_str()).collect()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|candidate| candidate == key)
    }

    pub fn dependants(&self, idx: usize) -> &[usize] {
        self.dependants.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn missing(&self) -> &[MissingEdge] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Strip unordered nodes that only hang off a cycle, leaving the cycle itself.
fn cycle_core(dependants: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let mut blocked: Vec<bool> = remaining.iter().map(|degree| *degree > 0).collect();
    loop {
        let mut changed = false;
        for idx in 0..blocked.len() {
            if blocked[idx] && !dependants[idx].iter().any(|&next| blocked[next]) {
                blocked[idx] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let core: Vec<usize> = (0..blocked.len()).filter(|&idx| blocked[idx]).collect();
    if core.is_empty() {
        (0..remaining.len())
            .filter(|&idx| remaining[idx] > 0)
            .collect()
    } else {
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn build(nodes: &[(&str, i32, Vec<String>)]) -> Result<DependencyGraph, CycleError> {
        DependencyGraph::build(nodes.iter().map(|(key, priority, dependencies)| GraphNode {
            key,
            priority: *priority,
            dependencies,
        }))
    }

    #[test]
    fn linear_chain_respects_edges() {
        let graph = build(&[
            ("c", 0, deps(&["b"])),
            ("b", 0, deps(&["a"])),
            ("a", 0, deps(&[])),
        ])
        .unwrap();
        assert_eq!(graph.ordered_keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn ready_nodes_sorted_by_priority_then_registration() {
        let graph = build(&[
            ("low", 0, deps(&[])),
            ("high", 10, deps(&[])),
            ("also-low", 0, deps(&[])),
        ])
        .unwrap();
        assert_eq!(graph.ordered_keys(), vec!["high", "low", "also-low"]);
    }

    #[test]
    fn dependency_beats_priority() {
        let graph = build(&[
            ("base", -5, deps(&[])),
            ("eager", 100, deps(&["base"])),
            ("middle", 1, deps(&[])),
        ])
        .unwrap();
        assert_eq!(graph.ordered_keys(), vec!["middle", "base", "eager"]);
    }

    #[test]
    fn diamond_orders_every_edge() {
        let graph = build(&[
            ("bottom", 0, deps(&["left", "right"])),
            ("left", 0, deps(&["top"])),
            ("right", 0, deps(&["top"])),
            ("top", 0, deps(&[])),
        ])
        .unwrap();
        let order = graph.ordered_keys();
        let pos = |key: &str| order.iter().position(|k| *k == key).unwrap();
        assert!(pos("top") < pos("left"));
        assert!(pos("top") < pos("right"));
        assert!(pos("left") < pos("bottom"));
        assert!(pos("right") < pos("bottom"));
    }

    #[test]
    fn cycle_reports_members_without_downstream_nodes() {
        let err = build(&[
            ("a", 0, deps(&["b"])),
            ("b", 0, deps(&["a"])),
            ("downstream", 0, deps(&["a"])),
            ("free", 0, deps(&[])),
        ])
        .unwrap_err();
        assert_eq!(err.members, vec!["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build(&[("solo", 0, deps(&["solo"]))]).unwrap_err();
        assert_eq!(err.members, vec!["solo".to_string()]);
    }

    #[test]
    fn unknown_dependencies_are_reported_not_linked() {
        let graph = build(&[("a", 0, deps(&["ghost"])), ("b", 0, deps(&["a", "a"]))]).unwrap();
        assert_eq!(graph.ordered_keys(), vec!["a", "b"]);
        assert_eq!(
            graph.missing(),
            &[MissingEdge {
                key: "a".into(),
                dependency: "ghost".into()
            }]
        );
        assert_eq!(graph.dependants(0), &[1]);
    }
}
