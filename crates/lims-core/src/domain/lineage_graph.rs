//! Arena-backed lineage DAG.
//!
//! Nodes and edges live in vectors and refer to each other by index; an
//! `EUID -> node index` map gives O(1) entry into the graph. Only active
//! edges are followed by reachability and traversal.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};

use super::euid::Euid;
use super::instance::Actor;
use super::lineage::{Direction, EdgeId, EdgeStatus, LineageEdge};
use crate::CoreError;

/// In-memory DAG of lineage edges
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    index: HashMap<Euid, usize>,
    nodes: Vec<Euid>,
    edges: Vec<LineageEdge>,
    edge_index: HashMap<EdgeId, usize>,
    // Per node, indices into `edges`
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl LineageGraph {
    /// An empty graph
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, euid: &Euid) -> usize {
        if let Some(&idx) = self.index.get(euid) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(euid.clone());
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.index.insert(euid.clone(), idx);
        idx
    }

    /// Number of edges, superseded ones included
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Number of active edges
    pub fn active_edge_count(&self) -> usize {
        self.edges.iter().filter(|e| e.is_active()).count()
    }

    /// Look up an edge by id
    pub fn get(&self, id: &EdgeId) -> Option<&LineageEdge> {
        self.edge_index.get(id).map(|&i| &self.edges[i])
    }

    /// Active edge with the same endpoints and relationship type
    pub fn find_active(&self, parent: &Euid, child: &Euid, relationship_type: &str) -> Option<&LineageEdge> {
        let node = *self.index.get(parent)?;
        self.outgoing[node]
            .iter()
            .map(|&i| &self.edges[i])
            .find(|e| e.is_active() && &e.child == child && e.relationship_type == relationship_type)
    }

    /// Breadth-first search along active edges; returns `from ..= to`
    pub fn find_path(&self, from: &Euid, to: &Euid) -> Option<Vec<Euid>> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;

        let mut predecessor: HashMap<usize, usize> = HashMap::new();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![self.nodes[goal].clone()];
                let mut current = goal;
                while let Some(&prev) = predecessor.get(&current) {
                    path.push(self.nodes[prev].clone());
                    current = prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbour_indices(node, Direction::Descendants) {
                if seen.insert(next) {
                    predecessor.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn neighbour_indices(&self, node: usize, direction: Direction) -> impl Iterator<Item = usize> + '_ {
        let edges = match direction {
            Direction::Descendants => &self.outgoing[node],
            Direction::Ancestors => &self.incoming[node],
        };
        edges.iter().filter_map(move |&i| {
            let edge = &self.edges[i];
            if !edge.is_active() {
                return None;
            }
            let other = match direction {
                Direction::Descendants => &edge.child,
                Direction::Ancestors => &edge.parent,
            };
            self.index.get(other).copied()
        })
    }

    /// Immediate active neighbours in insertion order
    pub fn neighbours(&self, euid: &Euid, direction: Direction) -> Vec<Euid> {
        match self.index.get(euid) {
            Some(&node) => self
                .neighbour_indices(node, direction)
                .map(|i| self.nodes[i].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Insert an edge unless it would close a cycle.
    ///
    /// An identical active edge is returned instead of inserting a duplicate.
    /// A rejected insert leaves the graph untouched.
    pub fn insert(&mut self, edge: LineageEdge) -> Result<LineageEdge, CoreError> {
        if edge.parent == edge.child {
            return Err(CoreError::CycleDetected {
                path: vec![edge.parent.clone(), edge.child.clone()],
            });
        }

        if let Some(existing) = self.find_active(&edge.parent, &edge.child, &edge.relationship_type) {
            return Ok(existing.clone());
        }

        if let Some(back) = self.find_path(&edge.child, &edge.parent) {
            let mut path = Vec::with_capacity(back.len() + 1);
            path.push(edge.parent.clone());
            path.extend(back);
            return Err(CoreError::CycleDetected { path });
        }

        let parent = self.intern(&edge.parent);
        let child = self.intern(&edge.child);
        let idx = self.edges.len();
        self.outgoing[parent].push(idx);
        self.incoming[child].push(idx);
        self.edge_index.insert(edge.id, idx);
        self.edges.push(edge.clone());
        Ok(edge)
    }


    /// Mark an edge superseded
    pub fn supersede(&mut self, id: &EdgeId, actor: &Actor, at: DateTime<Utc>) -> Result<LineageEdge, CoreError> {
        let idx = *self
            .edge_index
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("lineage edge {}", id)))?;
        let edge = &mut self.edges[idx];
        if !edge.is_active() {
            return Err(CoreError::InvalidState(format!("lineage edge {} is already superseded", id)));
        }
        edge.status = EdgeStatus::Superseded;
        edge.superseded_at = Some(at);
        edge.superseded_by = Some(actor.clone());
        Ok(edge.clone())
    }

    /// Edges where `euid` is the parent
    pub fn outgoing(&self, euid: &Euid, include_superseded: bool) -> Vec<LineageEdge> {
        self.edges_at(euid, Direction::Descendants, include_superseded)
    }

    /// Edges where `euid` is the child
    pub fn incoming(&self, euid: &Euid, include_superseded: bool) -> Vec<LineageEdge> {
        self.edges_at(euid, Direction::Ancestors, include_superseded)
    }

    fn edges_at(&self, euid: &Euid, direction: Direction, include_superseded: bool) -> Vec<LineageEdge> {
        let Some(&node) = self.index.get(euid) else {
            return Vec::new();
        };
        let indices = match direction {
            Direction::Descendants => &self.outgoing[node],
            Direction::Ancestors => &self.incoming[node],
        };
        indices
            .iter()
            .map(|&i| &self.edges[i])
            .filter(|e| include_superseded || e.is_active())
            .cloned()
            .collect()
    }

    /// Kahn's algorithm over active edges
    pub fn is_acyclic(&self) -> bool {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in self.edges.iter().filter(|e| e.is_active()) {
            in_degree[self.index[&edge.child]] += 1;
        }
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in self.neighbour_indices(node, Direction::Descendants).collect::<Vec<_>>() {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        visited == self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn edge(parent: &str, child: &str) -> LineageEdge {
        LineageEdge::new(parent.into(), child.into(), "derived_from", Actor::system())
    }

    fn euids(ids: &[&str]) -> Vec<Euid> {
        ids.iter().map(|s| Euid::from(*s)).collect()
    }

    #[test]
    fn test_insert_and_neighbours() {
        let mut graph = LineageGraph::new();
        graph.insert(edge("A", "B")).unwrap();
        graph.insert(edge("A", "C")).unwrap();
        assert_eq!(graph.neighbours(&"A".into(), Direction::Descendants), euids(&["B", "C"]));
        assert_eq!(graph.neighbours(&"C".into(), Direction::Ancestors), euids(&["A"]));
        assert!(graph.neighbours(&"Z".into(), Direction::Ancestors).is_empty());
    }

    #[test]
    fn test_self_loop() {
        let mut graph = LineageGraph::new();
        let err = graph.insert(edge("A", "A")).unwrap_err();
        assert_eq!(err, CoreError::CycleDetected { path: euids(&["A", "A"]) });
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_cycle_reports_path_and_leaves_graph_unchanged() {
        let mut graph = LineageGraph::new();
        graph.insert(edge("A", "B")).unwrap();
        graph.insert(edge("B", "C")).unwrap();

        let err = graph.insert(edge("C", "A")).unwrap_err();
        assert_eq!(err, CoreError::CycleDetected { path: euids(&["C", "A", "B", "C"]) });
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.is_acyclic());
    }

    #[test]
    fn test_duplicate_link_returns_existing_edge() {
        let mut graph = LineageGraph::new();
        let first = graph.insert(edge("A", "B")).unwrap();
        let second = graph.insert(edge("A", "B")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(graph.edge_count(), 1);

        // A different relationship type is a different link
        let other = graph
            .insert(LineageEdge::new("A".into(), "B".into(), "contains", Actor::system()))
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn test_superseded_edges_do_not_block_links() {
        let mut graph = LineageGraph::new();
        let ab = graph.insert(edge("A", "B")).unwrap();
        assert!(graph.insert(edge("B", "A")).is_err());

        graph.supersede(&ab.id, &Actor::system(), Utc::now()).unwrap();
        assert!(graph.insert(edge("B", "A")).is_ok());
        assert_eq!(graph.active_edge_count(), 1);
        assert_eq!(graph.outgoing(&"A".into(), true).len(), 1);
        assert!(graph.outgoing(&"A".into(), false).is_empty());
    }

    #[test]
    fn test_supersede_twice_is_invalid() {
        let mut graph = LineageGraph::new();
        let ab = graph.insert(edge("A", "B")).unwrap();
        graph.supersede(&ab.id, &Actor::system(), Utc::now()).unwrap();
        let err = graph.supersede(&ab.id, &Actor::system(), Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert!(matches!(
            graph.supersede(&EdgeId::new(), &Actor::system(), Utc::now()),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_find_path_prefers_shortest() {
        let mut graph = LineageGraph::new();
        graph.insert(edge("A", "B")).unwrap();
        graph.insert(edge("B", "C")).unwrap();
        graph.insert(edge("C", "D")).unwrap();
        graph.insert(edge("A", "D")).unwrap();
        assert_eq!(graph.find_path(&"A".into(), &"D".into()), Some(euids(&["A", "D"])));
        assert_eq!(graph.find_path(&"D".into(), &"A".into()), None);
    }
}
