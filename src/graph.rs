use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction as EdgeDirection};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{
    error::DocGraphError,
    properties::{CentralityRecord, Node, NodeId},
    query::{Direction, HubMetric},
};

/// Directed link graph over cached nodes. Vertex order is the order nodes were handed to
/// [`GraphIndex::build`]; dangling link targets are not vertices.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    graph: petgraph::Graph<NodeId, ()>,
    id_to_index: BTreeMap<NodeId, NodeIndex>,
}

impl GraphIndex {
    pub fn build(nodes: &[Node]) -> Result<Self, DocGraphError> {
        let mut graph = petgraph::Graph::with_capacity(nodes.len(), nodes.len());
        let mut id_to_index = BTreeMap::new();
        for node in nodes {
            if id_to_index.contains_key(&node.id) {
                return Err(DocGraphError::Graph(format!(
                    "node id {} appears more than once",
                    node.id
                )));
            }
            let index = graph.add_node(node.id.clone());
            id_to_index.insert(node.id.clone(), index);
        }

        for node in nodes {
            let source_idx = id_to_index[&node.id];
            let mut linked = BTreeSet::new();
            for target in node.outgoing_links.iter() {
                if let Some(sink_idx) = id_to_index.get(target) {
                    if linked.insert(*sink_idx) {
                        graph.add_edge(source_idx, *sink_idx, ());
                    }
                }
            }
        }

        tracing::debug!(
            "[GraphIndex] built with {} vertices and {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(GraphIndex { graph, id_to_index })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_index.contains_key(id)
    }

    fn directed_neighbors(&self, idx: NodeIndex, dir: EdgeDirection) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(idx, dir)
            .map(|edge| match dir {
                EdgeDirection::Outgoing => edge.target(),
                EdgeDirection::Incoming => edge.source(),
            })
            .collect()
    }

    /// Adjacent node ids in vertex order. Unknown ids have no neighbors.
    pub fn neighbors(&self, id: &str, direction: Direction, limit: Option<usize>) -> Vec<NodeId> {
        let Some(idx) = self.id_to_index.get(id) else {
            return Vec::new();
        };
        let mut adjacent = BTreeSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            adjacent.extend(self.directed_neighbors(*idx, EdgeDirection::Outgoing));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            adjacent.extend(self.directed_neighbors(*idx, EdgeDirection::Incoming));
        }
        adjacent
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Shortest unweighted path following link direction, endpoints included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<NodeId>> {
        let start = *self.id_to_index.get(from)?;
        let goal = *self.id_to_index.get(to)?;
        if start == goal {
            return Some(vec![self.graph[start].clone()]);
        }

        let mut previous: BTreeMap<NodeIndex, NodeIndex> = BTreeMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let mut next = self.directed_neighbors(current, EdgeDirection::Outgoing);
            next.sort();
            for neighbor in next {
                if neighbor == start || previous.contains_key(&neighbor) {
                    continue;
                }
                previous.insert(neighbor, current);
                if neighbor == goal {
                    let mut path = vec![self.graph[goal].clone()];
                    let mut cursor = goal;
                    while let Some(prev) = previous.get(&cursor) {
                        path.push(self.graph[*prev].clone());
                        cursor = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(neighbor);
            }
        }
        None
    }

    pub fn in_degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, EdgeDirection::Incoming).count()
    }

    pub fn out_degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, EdgeDirection::Outgoing).count()
    }

    /// Top `n` nodes by degree, highest first. Ties keep vertex order.
    pub fn hubs(&self, n: usize, metric: HubMetric) -> Vec<(NodeId, usize)> {
        let mut ranked = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = match metric {
                    HubMetric::InDegree => self.in_degree(idx),
                    HubMetric::OutDegree => self.out_degree(idx),
                };
                (idx, degree)
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
            .into_iter()
            .take(n)
            .map(|(idx, degree)| (self.graph[idx].clone(), degree))
            .collect()
    }

    /// Degree centrality for every vertex, stamped with `computed_at`.
    pub fn centrality(&self, computed_at: i64) -> Vec<CentralityRecord> {
        self.graph
            .node_indices()
            .map(|idx| CentralityRecord {
                node_id: self.graph[idx].clone(),
                in_degree: self.in_degree(idx) as u32,
                out_degree: self.out_degree(idx) as u32,
                computed_at,
            })
            .collect()
    }
}
