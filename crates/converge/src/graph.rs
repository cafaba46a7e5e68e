//! Resource dependency graph
//!
//! Nodes are declared resources; an edge points from a dependent to one of
//! its dependencies. The graph is built fresh for every run and is always
//! acyclic once [`Graph::build`] succeeds.

use crate::error::GraphError;
use crate::resource::Resource;
use crate::types::Status;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Directed acyclic graph of resources
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Resource>,
    /// Declaration order of IDs
    order: Vec<String>,
    /// id -> ids it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// id -> ids that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl Graph {
    /// Build a graph from a resource set
    ///
    /// Fails on duplicate IDs, edges to unknown IDs, and cycles.
    pub fn build(resources: impl IntoIterator<Item = Resource>) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        for resource in resources {
            if graph.nodes.contains_key(&resource.id) {
                return Err(GraphError::DuplicateId(resource.id));
            }
            graph.order.push(resource.id.clone());
            graph.dependencies.insert(resource.id.clone(), BTreeSet::new());
            graph.dependents.insert(resource.id.clone(), BTreeSet::new());
            graph.nodes.insert(resource.id.clone(), resource);
        }

        for (id, resource) in &graph.nodes {
            for dep in &resource.depends_on {
                if !graph.nodes.contains_key(dep) {
                    return Err(GraphError::Dangling {
                        from: id.clone(),
                        to: dep.clone(),
                    });
                }
                if let Some(deps) = graph.dependencies.get_mut(id) {
                    deps.insert(dep.clone());
                }
                if let Some(rdeps) = graph.dependents.get_mut(dep) {
                    rdeps.insert(id.clone());
                }
            }
        }

        graph.detect_cycle()?;

        log::debug!(
            "Built resource graph: {} nodes, {} edges",
            graph.len(),
            graph.dependencies.values().map(BTreeSet::len).sum::<usize>()
        );

        Ok(graph)
    }

    /// Depth-first search with three-color marking
    fn detect_cycle(&self) -> Result<(), GraphError> {
        let mut color: HashMap<&str, Color> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        let mut stack: Vec<&str> = Vec::new();

        for id in self.nodes.keys() {
            if color.get(id.as_str()) == Some(&Color::White) {
                self.visit(id, &mut color, &mut stack)?;
            }
        }

        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), GraphError> {
        color.insert(id, Color::Gray);
        stack.push(id);

        for dep in self.dependencies.get(id).into_iter().flatten() {
            match color.get(dep.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(ToString::to_string).collect();
                    path.push(dep.clone());
                    return Err(GraphError::Cycle { path });
                }
                Color::White => self.visit(dep, color, stack)?,
                Color::Black => {}
            }
        }

        stack.pop();
        color.insert(id, Color::Black);
        Ok(())
    }

    /// Dependency-ordered execution levels (batched Kahn's algorithm)
    ///
    /// Every dependency of a node in level `k` lies in a level before `k`;
    /// nodes within a level are independent. IDs within a level are sorted.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut pending: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut ready: Vec<&str> = self
            .dependencies
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.as_str())
            .collect();

        let mut levels = Vec::new();
        while !ready.is_empty() {
            let mut next = BTreeSet::new();
            for id in &ready {
                for dependent in self.dependents.get(*id).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(ready.iter().map(ToString::to_string).collect());
            ready = next.into_iter().collect();
        }

        levels
    }

    /// Levels in teardown order: dependents before their dependencies
    pub fn destroy_levels(&self) -> Vec<Vec<String>> {
        let mut levels = self.levels();
        levels.reverse();
        levels
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct dependents of a node
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// All transitive dependents of a node, excluding the node itself
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependents(id).collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.dependents(next));
            }
        }

        seen
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Record a node's per-run status
    pub fn set_status(&mut self, id: &str, status: Status) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
        }
    }

    /// IDs in declaration order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Resources in declaration order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str, deps: &[&str]) -> Resource {
        let mut r = Resource::new("test", name);
        for d in deps {
            r = r.depends_on(format!("test.{d}"));
        }
        r
    }

    fn position(levels: &[Vec<String>], id: &str) -> usize {
        levels
            .iter()
            .position(|l| l.iter().any(|x| x == id))
            .unwrap()
    }

    #[test]
    fn test_levels_chain() {
        let graph = Graph::build(vec![
            res("workload", &["leaf"]),
            res("leaf", &["ca"]),
            res("ca", &[]),
        ])
        .unwrap();

        assert_eq!(
            graph.levels(),
            vec![
                vec!["test.ca".to_string()],
                vec!["test.leaf".to_string()],
                vec!["test.workload".to_string()],
            ]
        );
    }

    #[test]
    fn test_two_node_apply_and_destroy_order() {
        // a depends on b
        let graph = Graph::build(vec![res("a", &["b"]), res("b", &[])]).unwrap();

        let apply: Vec<String> = graph.levels().into_iter().flatten().collect();
        let destroy: Vec<String> = graph.destroy_levels().into_iter().flatten().collect();
        assert_eq!(apply, vec!["test.b", "test.a"]);
        assert_eq!(destroy, vec!["test.a", "test.b"]);
    }

    #[test]
    fn test_levels_diamond_and_independent() {
        let graph = Graph::build(vec![
            res("top", &["left", "right"]),
            res("left", &["base"]),
            res("right", &["base"]),
            res("base", &[]),
            res("lonely", &[]),
        ])
        .unwrap();

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["test.base", "test.lonely"]);
        assert_eq!(levels[1], vec!["test.left", "test.right"]);
        assert_eq!(levels[2], vec!["test.top"]);
    }

    #[test]
    fn test_levels_respect_every_edge() {
        let graph = Graph::build(vec![
            res("a", &[]),
            res("b", &["a"]),
            res("c", &["a", "b"]),
            res("d", &["c"]),
            res("e", &["b"]),
            res("f", &["e", "d", "a"]),
        ])
        .unwrap();

        let levels = graph.levels();
        let total: usize = levels.iter().map(Vec::len).sum();
        assert_eq!(total, graph.len());

        for r in graph.resources() {
            for dep in &r.depends_on {
                assert!(position(&levels, dep) < position(&levels, &r.id));
            }
        }
    }

    #[test]
    fn test_cycle_detected() {
        let err = Graph::build(vec![res("a", &["c"]), res("b", &["a"]), res("c", &["b"])])
            .unwrap_err();

        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = Graph::build(vec![res("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["test.a".into(), "test.a".into()]
            }
        );
    }

    #[test]
    fn test_dangling_edge() {
        let err = Graph::build(vec![res("a", &["missing"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Dangling {
                from: "test.a".into(),
                to: "test.missing".into()
            }
        );
    }

    #[test]
    fn test_duplicate_id() {
        let err = Graph::build(vec![res("a", &[]), res("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateId("test.a".into()));
    }

    #[test]
    fn test_descendants() {
        let graph = Graph::build(vec![
            res("ca", &[]),
            res("leaf", &["ca"]),
            res("workload", &["leaf"]),
            res("other", &[]),
        ])
        .unwrap();

        let d = graph.descendants("test.ca");
        assert_eq!(d.len(), 2);
        assert!(d.contains("test.leaf"));
        assert!(d.contains("test.workload"));
        assert!(graph.descendants("test.other").is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
    }

    #[test]
    fn test_declaration_order_preserved() {
        let graph = Graph::build(vec![res("z", &[]), res("a", &[])]).unwrap();
        assert_eq!(graph.ids().collect::<Vec<_>>(), vec!["test.z", "test.a"]);
    }
}
