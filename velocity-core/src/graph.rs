use crate::error::{self, Result};
use crate::image::Image;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction::Outgoing;
use snafu::ensure;
use std::collections::{HashMap, HashSet, VecDeque};

/// A directed graph of images, edges pointing from an image to its dependencies.
///
/// Node weights are owned [`Image`] clones rather than references, which sidesteps the
/// attribute-losing neighbour iteration issue that value-typed graph libraries avoid
/// entirely (see the design notes on graph-library quirks).
#[derive(Debug, Default)]
pub struct ImageGraph {
    graph: DiGraph<Image, ()>,
    by_id: HashMap<String, NodeIndex>,
}

impl ImageGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            by_id: HashMap::new(),
        }
    }

    /// Insert an image, or return the existing node if one with the same id is present.
    pub fn add_node(&mut self, image: Image) -> NodeIndex {
        let id = image.id();
        if let Some(&idx) = self.by_id.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(image);
        self.by_id.insert(id, idx);
        idx
    }

    /// Add a dependency edge `from -> to`. Fails if either endpoint is absent from the graph
    /// or if the edge would close a cycle, reporting the offending path.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        ensure!(
            self.graph.node_weight(from).is_some() && self.graph.node_weight(to).is_some(),
            error::CannotFindDependencySnafu {
                image: "<graph edge>".to_string(),
                dep: "<missing endpoint>".to_string(),
            }
        );

        if to == from || self.is_above(to, from) {
            let mut cycle = self.path_names(to, from);
            cycle.push(self.graph[from].name.clone());
            return error::EdgeViolatesDagSnafu {
                from: self.graph[from].name.clone(),
                to: self.graph[to].name.clone(),
                cycle,
            }
            .fail();
        }

        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Full `Image` records for every direct dependency of `idx`.
    pub fn get_dependencies(&self, idx: NodeIndex) -> Vec<Image> {
        self.graph
            .neighbors_directed(idx, Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Every node whose image shares `name`.
    pub fn get_similar_nodes(&self, name: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph[i].name == name)
            .collect()
    }

    /// True if `to` is reachable from `from` by following dependency edges (or they're the
    /// same node).
    pub fn is_above(&self, from: NodeIndex, to: NodeIndex) -> bool {
        from == to || petgraph::algo::has_path_connecting(&self.graph, from, to, None)
    }

    pub fn node(&self, idx: NodeIndex) -> &Image {
        &self.graph[idx]
    }

    pub fn node_by_id(&self, id: &str) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Names along a path from `from` to `to`, inclusive, via BFS. Empty if unreachable.
    fn path_names(&self, from: NodeIndex, to: NodeIndex) -> Vec<String> {
        let mut pred = HashMap::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        visited.insert(from);

        while let Some(n) = queue.pop_front() {
            if n == to {
                break;
            }
            for next in self.graph.neighbors_directed(n, Outgoing) {
                if visited.insert(next) {
                    pred.insert(next, n);
                    queue.push_back(next);
                }
            }
        }

        if !visited.contains(&to) {
            return Vec::new();
        }

        let mut path = vec![to];
        let mut cur = to;
        while cur != from {
            match pred.get(&cur) {
                Some(&p) => {
                    path.push(p);
                    cur = p;
                }
                None => break,
            }
        }
        path.reverse();
        path.into_iter().map(|i| self.graph[i].name.clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;
    use velocity_version::Version;

    fn image(name: &str, version: &str) -> Image {
        Image::new(name, Version::parse(version).unwrap(), PathBuf::from("."))
    }

    #[test]
    fn acyclic_edges_succeed() {
        let mut g = ImageGraph::new();
        let a = g.add_node(image("a", "1"));
        let b = g.add_node(image("b", "1"));
        g.add_edge(a, b).unwrap();
        assert_eq!(g.get_dependencies(a).len(), 1);
        assert!(g.is_above(a, b));
        assert!(!g.is_above(b, a));
    }

    #[test]
    fn cycle_closing_edge_is_rejected() {
        let mut g = ImageGraph::new();
        let a = g.add_node(image("a", "1"));
        let b = g.add_node(image("b", "1"));
        g.add_edge(a, b).unwrap();
        let err = g.add_edge(b, a).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle") || msg.contains("acyclicity"));
    }

    #[test]
    fn similar_nodes_by_name() {
        let mut g = ImageGraph::new();
        g.add_node(image("gcc", "11.2"));
        g.add_node(image("gcc", "12.3"));
        g.add_node(image("clang", "1"));
        assert_eq!(g.get_similar_nodes("gcc").len(), 2);
    }
}
