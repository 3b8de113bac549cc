//! Dependency graph for task dependencies.
//!
//! Edges point from a task to the tasks it waits for. The store only uses the
//! graph to refuse cycles; readiness is computed from task statuses.

use std::collections::{BTreeSet, HashMap};

use crate::domain::TaskId;

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Returns the first cycle found as a closed path (`a -> b -> a`), or
    /// `None` for a DAG.
    ///
    /// Three-color DFS, O(V + E). Roots are visited in sorted order so the
    /// reported cycle is deterministic.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut roots: Vec<&TaskId> = self.edges.keys().collect();
        roots.sort();

        let mut color: HashMap<&TaskId, Color> = HashMap::new();
        let mut path: Vec<&TaskId> = Vec::new();
        for root in roots {
            if color.contains_key(root) {
                continue;
            }
            if let Some(cycle) = self.visit(root, &mut color, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a TaskId,
        color: &mut HashMap<&'a TaskId, Color>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        color.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                match color.get(dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            path[start..].iter().map(|n| (*n).clone()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.visit(dep, color, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        path.pop();
        color.insert(node, Color::Black);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    #[test]
    fn chain_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));

        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn detects_simple_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("b"));
        graph.add_dependency(id("b"), id("a"));

        let cycle = graph.detect_cycle().expect("cycle");
        assert_eq!(cycle, vec![id("a"), id("b"), id("a")]);
    }

    #[test]
    fn detects_self_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("a"));
        assert_eq!(graph.detect_cycle(), Some(vec![id("a"), id("a")]));
    }

    #[test]
    fn detects_longer_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("d"), id("c"));
        graph.add_dependency(id("b"), id("d"));

        let cycle = graph.detect_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&id("c")));
        assert!(!cycle.contains(&id("a")));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("a"));
        graph.add_dependency(id("d"), id("b"));
        graph.add_dependency(id("d"), id("c"));
        graph.add_dependency(id("e"), id("b"));
        graph.add_dependency(id("e"), id("c"));

        assert!(graph.detect_cycle().is_none());
    }
}
