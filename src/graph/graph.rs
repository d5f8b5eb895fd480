use super::network::{Network, RoadSegment};
use crate::algorithm::DistanceFunction;
use anyhow::Result;
use log::{debug, info};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A location on the road network: a segment plus the distance already
/// travelled along it from its start node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgePosition {
    pub segment: usize,
    pub offset: f64,
}

/// Route between two edge positions.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePath {
    /// meters, including the partial origin and destination segments
    pub distance: f64,
    /// road ids from origin to destination, consecutive duplicates merged
    pub road_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
struct SearchState {
    cost: f64,
    node: usize,
}

impl PartialEq for SearchState {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.node == other.node
    }
}

impl Eq for SearchState {}

impl Ord for SearchState {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on cost
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for SearchState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Read-only shortest path oracle. Graph nodes share their index with the
/// network nodes, every graph edge carries the index of its segment.
pub struct RoutingGraph {
    segments: Vec<RoadSegment>,
    graph: Graph<usize, usize, Directed, usize>,
    // 反向公差, 同一路段上允许的后退距离 米
    reverse_tolerance: f64,
}

impl RoutingGraph {
    pub fn new(network: &Network, distance: DistanceFunction) -> Result<Self> {
        info!("start construct routing graph...");
        let segments = network.segments(distance);
        if segments.is_empty() {
            return Err(anyhow::anyhow!("road network has no segment"));
        }
        let node_size = network.nodes.len();
        debug!("node size: {}, segment size: {}", node_size, segments.len());
        let mut graph = Graph::with_capacity(node_size, segments.len());
        // 添加node
        for index in 0..node_size {
            graph.add_node(index);
        }
        // 添加edge
        for (index, segment) in segments.iter().enumerate() {
            graph.add_edge(
                NodeIndex::new(segment.from_node),
                NodeIndex::new(segment.to_node),
                index,
            );
        }
        info!("finish construct routing graph...");
        Ok(RoutingGraph {
            segments,
            graph,
            reverse_tolerance: 0.0,
        })
    }

    /// Targets at most `tolerance` behind the origin on the same segment are
    /// reached with a zero length route.
    pub fn with_reverse_tolerance(mut self, tolerance: f64) -> Self {
        self.reverse_tolerance = tolerance;
        self
    }

    pub fn segments(&self) -> &[RoadSegment] {
        &self.segments
    }

    /// Bounded shortest routes from `from` to every target in one search.
    ///
    /// A target is `None` when it cannot be reached within `max_distance`.
    pub fn shortest_distances(
        &self,
        from: EdgePosition,
        targets: &[EdgePosition],
        max_distance: f64,
    ) -> Vec<Option<RoutePath>> {
        let mut results: Vec<Option<RoutePath>> = vec![None; targets.len()];
        let origin = &self.segments[from.segment];

        // 终点节点 -> 等待结算的目标
        let mut pending: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, target) in targets.iter().enumerate() {
            if target.segment == from.segment {
                if target.offset >= from.offset {
                    let distance = target.offset - from.offset;
                    if distance <= max_distance {
                        results[i] = Some(RoutePath {
                            distance,
                            road_ids: vec![origin.road_id.clone()],
                        });
                    }
                    continue;
                }
                // gps抖动造成的轻微后退
                if from.offset - target.offset <= self.reverse_tolerance {
                    results[i] = Some(RoutePath {
                        distance: 0.0,
                        road_ids: vec![origin.road_id.clone()],
                    });
                    continue;
                }
            }
            let entry = self.segments[target.segment].from_node;
            pending.entry(entry).or_default().push(i);
        }

        let start_cost = origin.length - from.offset;
        if pending.is_empty() || start_cost > max_distance {
            return results;
        }

        let mut dist: HashMap<usize, f64> = HashMap::new();
        let mut arrived_by: HashMap<usize, usize> = HashMap::new();
        let mut heap = BinaryHeap::new();
        dist.insert(origin.to_node, start_cost);
        heap.push(SearchState {
            cost: start_cost,
            node: origin.to_node,
        });

        while let Some(SearchState { cost, node }) = heap.pop() {
            if cost > dist.get(&node).copied().unwrap_or(f64::INFINITY) {
                continue;
            }
            if cost > max_distance {
                break;
            }
            if let Some(waiting) = pending.remove(&node) {
                let traversed = self.traversed_segments(&arrived_by, origin.to_node, node);
                for i in waiting {
                    let target = &targets[i];
                    let total = cost + target.offset;
                    if total <= max_distance {
                        results[i] = Some(RoutePath {
                            distance: total,
                            road_ids: self.road_ids(from.segment, &traversed, target.segment),
                        });
                    }
                }
                if pending.is_empty() {
                    break;
                }
            }
            for edge in self.graph.edges(NodeIndex::new(node)) {
                let segment = *edge.weight();
                let next = edge.target().index();
                let next_cost = cost + self.segments[segment].length;
                if next_cost > max_distance {
                    continue;
                }
                if next_cost < dist.get(&next).copied().unwrap_or(f64::INFINITY) {
                    dist.insert(next, next_cost);
                    arrived_by.insert(next, segment);
                    heap.push(SearchState {
                        cost: next_cost,
                        node: next,
                    });
                }
            }
        }
        results
    }

    pub fn shortest_distance(
        &self,
        from: EdgePosition,
        to: EdgePosition,
        max_distance: f64,
    ) -> Option<RoutePath> {
        self.shortest_distances(from, &[to], max_distance)
            .pop()
            .flatten()
    }

    fn traversed_segments(
        &self,
        arrived_by: &HashMap<usize, usize>,
        start: usize,
        end: usize,
    ) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = end;
        while current != start {
            match arrived_by.get(&current) {
                Some(segment) => {
                    path.push(*segment);
                    current = self.segments[*segment].from_node;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    fn road_ids(&self, origin: usize, traversed: &[usize], destination: usize) -> Vec<String> {
        let mut road_ids: Vec<String> = Vec::with_capacity(traversed.len() + 2);
        let all = std::iter::once(origin)
            .chain(traversed.iter().copied())
            .chain(std::iter::once(destination));
        for segment in all {
            let road_id = &self.segments[segment].road_id;
            if road_ids.last() != Some(road_id) {
                road_ids.push(road_id.clone());
            }
        }
        road_ids
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::algorithm::Point;

    // a(0,0) -w1-> b(100,0) -w2-> c(200,0), plus a detour b -w3-> d(100,100) -w4-> c
    fn test_graph() -> RoutingGraph {
        let mut network = Network::new();
        network.add_node("a", Point(0.0, 0.0)).unwrap();
        network.add_node("b", Point(100.0, 0.0)).unwrap();
        network.add_node("c", Point(200.0, 0.0)).unwrap();
        network.add_node("d", Point(100.0, 100.0)).unwrap();
        network.add_way("w1", &["a", "b"]).unwrap();
        network.add_way("w2", &["b", "c"]).unwrap();
        network.add_way("w3", &["b", "d"]).unwrap();
        network.add_way("w4", &["d", "c"]).unwrap();
        RoutingGraph::new(&network, DistanceFunction::Euclidean).unwrap()
    }

    #[test]
    fn test_same_segment_forward() {
        let graph = test_graph();
        let path = graph
            .shortest_distance(
                EdgePosition { segment: 0, offset: 10.0 },
                EdgePosition { segment: 0, offset: 60.0 },
                1000.0,
            )
            .unwrap();
        assert_eq!(path.distance, 50.0);
        assert_eq!(path.road_ids, vec!["w1".to_string()]);
    }

    #[test]
    fn test_multi_target_single_pass() {
        let graph = test_graph();
        let from = EdgePosition { segment: 0, offset: 50.0 };
        let targets = [
            EdgePosition { segment: 1, offset: 50.0 },
            EdgePosition { segment: 3, offset: 10.0 },
            EdgePosition { segment: 0, offset: 10.0 },
        ];
        let results = graph.shortest_distances(from, &targets, 1000.0);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.distance, 100.0);
        assert_eq!(first.road_ids, vec!["w1", "w2"]);
        let second = results[1].as_ref().unwrap();
        assert!((second.distance - 160.0).abs() < 1e-9);
        assert_eq!(second.road_ids, vec!["w1", "w3", "w4"]);
        // w1 cannot be re-entered from its own end
        assert!(results[2].is_none());
    }

    #[test]
    fn test_small_reverse_within_tolerance() {
        let graph = test_graph().with_reverse_tolerance(5.0);
        let from = EdgePosition { segment: 0, offset: 50.0 };
        let jitter = EdgePosition { segment: 0, offset: 47.0 };
        let far_back = EdgePosition { segment: 0, offset: 10.0 };
        let results = graph.shortest_distances(from, &[jitter, far_back], 1000.0);
        let path = results[0].as_ref().unwrap();
        assert_eq!(path.distance, 0.0);
        assert_eq!(path.road_ids, vec!["w1"]);
        assert!(results[1].is_none());
        // without tolerance the same target is unreachable
        assert!(test_graph().shortest_distance(from, jitter, 1000.0).is_none());
    }

    #[test]
    fn test_bound_cuts_search() {
        let graph = test_graph();
        let from = EdgePosition { segment: 0, offset: 50.0 };
        let to = EdgePosition { segment: 1, offset: 50.0 };
        assert!(graph.shortest_distance(from, to, 99.0).is_none());
        assert!(graph.shortest_distance(from, to, 100.0).is_some());
    }

    #[test]
    fn test_directed_edges() {
        let graph = test_graph();
        let from = EdgePosition { segment: 1, offset: 10.0 };
        let to = EdgePosition { segment: 0, offset: 10.0 };
        assert!(graph.shortest_distance(from, to, 10_000.0).is_none());
    }
}
