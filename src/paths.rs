//! Path ordering: skeleton graph → continuous, deterministic road paths.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::params::SplineParameters;
use crate::point::{polyline_length, Point};
use crate::skeleton::{NodeKind, SkeletonGraph};

/// One continuous road segment in terrain pixel space.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderedPath {
    pub points: Vec<Point>,
}

impl OrderedPath {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn length(&self) -> f32 {
        polyline_length(&self.points)
    }

    pub fn first(&self) -> Option<Point> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<Point> {
        self.points.last().copied()
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    /// Append `other`, dropping its first point when it duplicates our last.
    fn append(&mut self, other: &[Point]) {
        let skip = match (self.points.last(), other.first()) {
            (Some(a), Some(b)) if a.distance(*b) < 1e-3 => 1,
            _ => 0,
        };
        self.points.extend_from_slice(&other[skip.min(other.len())..]);
    }
}

/// Paths produced by one ordering pass plus what was filtered out.
#[derive(Clone, Debug, Default)]
pub struct PathOrdering {
    pub paths: Vec<OrderedPath>,
    /// Chains discarded as spurs (shorter than the minimum length)
    pub dropped: usize,
    pub bridged: usize,
}

/// A chain under construction, with whether each end may be bridged.
#[derive(Clone, Debug)]
struct Chain {
    path: OrderedPath,
    start_free: bool,
    end_free: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum End {
    Start,
    End,
}

impl End {
    fn opposite(self) -> Self {
        match self {
            End::Start => End::End,
            End::End => End::Start,
        }
    }
}

/// Number of edge points used to estimate the direction leaving a node.
const DIRECTION_LOOKAHEAD: usize = 5;

pub struct PathOrderer<'a> {
    params: &'a SplineParameters,
}

impl<'a> PathOrderer<'a> {
    pub fn new(params: &'a SplineParameters) -> Self {
        Self { params }
    }

    /// Order a skeleton graph into paths.
    pub fn order_graph(&self, graph: &SkeletonGraph) -> PathOrdering {
        let chains = self.build_chains(graph);
        self.finish(chains)
    }

    /// Apply bridging, spur filtering and ordering to paths that did not come
    /// from a skeleton (vector features). Every path end may be bridged.
    pub fn refine(&self, paths: Vec<OrderedPath>) -> PathOrdering {
        let chains = paths
            .into_iter()
            .filter(|p| p.len() >= 2)
            .map(|path| Chain { path, start_free: true, end_free: true })
            .collect();
        self.finish(chains)
    }

    fn finish(&self, chains: Vec<Chain>) -> PathOrdering {
        let (chains, bridged) = self.bridge(chains);
        let min_len = self.params.min_path_length_px;
        let before = chains.len();
        let kept: Vec<OrderedPath> = chains
            .into_iter()
            .map(|c| c.path)
            .filter(|p| p.len() >= 2 && p.length() >= min_len)
            .collect();
        let dropped = before - kept.len();
        let paths = if self.params.use_graph_ordering {
            order_by_proximity(kept, self.params.ordering_neighbor_radius_px)
        } else {
            order_by_position(kept)
        };
        PathOrdering { paths, dropped, bridged }
    }

    // =========================================================================
    // CHAINS
    // =========================================================================

    fn build_chains(&self, graph: &SkeletonGraph) -> Vec<Chain> {
        let links = if self.params.prefer_straight_through_junctions {
            self.junction_links(graph)
        } else {
            HashMap::new()
        };

        let is_free = |node: usize| graph.nodes[node].kind == NodeKind::Endpoint;
        let mut visited = vec![false; graph.edges.len()];
        let mut chains = Vec::new();

        for seed in 0..graph.edges.len() {
            if visited[seed] {
                continue;
            }
            // Walk back to the head of the chain containing `seed`
            let mut edge = seed;
            let mut entering = End::Start;
            for _ in 0..graph.edges.len() {
                match links.get(&(edge, entering)) {
                    Some(&(other, other_end)) if other != seed && !visited[other] => {
                        edge = other;
                        entering = other_end.opposite();
                    }
                    _ => break,
                }
            }

            let head_node = node_at(graph, edge, entering);
            let mut path = OrderedPath::default();
            let mut tail_node;
            loop {
                visited[edge] = true;
                let pts = &graph.edges[edge].points;
                if entering == End::Start {
                    path.append(pts);
                } else {
                    let rev: Vec<Point> = pts.iter().rev().copied().collect();
                    path.append(&rev);
                }
                let exit = entering.opposite();
                tail_node = node_at(graph, edge, exit);
                match links.get(&(edge, exit)) {
                    Some(&(other, other_end)) if !visited[other] => {
                        edge = other;
                        entering = other_end;
                    }
                    _ => break,
                }
            }
            chains.push(Chain {
                path,
                start_free: is_free(head_node),
                end_free: is_free(tail_node),
            });
        }
        chains
    }

    /// Pair edge ends at each junction by straightest continuation.
    fn junction_links(&self, graph: &SkeletonGraph) -> HashMap<(usize, End), (usize, End)> {
        let threshold = self.params.junction_angle_threshold_degrees.to_radians();
        let mut incident: HashMap<usize, Vec<(usize, End)>> = HashMap::new();
        for (i, e) in graph.edges.iter().enumerate() {
            if e.from == e.to {
                continue;
            }
            if graph.nodes[e.from].kind == NodeKind::Junction {
                incident.entry(e.from).or_default().push((i, End::Start));
            }
            if graph.nodes[e.to].kind == NodeKind::Junction {
                incident.entry(e.to).or_default().push((i, End::End));
            }
        }

        let mut links = HashMap::new();
        let mut nodes: Vec<usize> = incident.keys().copied().collect();
        nodes.sort_unstable();
        for node in nodes {
            let ends = &incident[&node];
            let dirs: Vec<Point> = ends.iter().map(|&(e, end)| leaving_direction(graph, e, end)).collect();
            let mut candidates = Vec::new();
            for i in 0..ends.len() {
                for j in (i + 1)..ends.len() {
                    // Straight through means leaving directions are opposite
                    let cos = (-dirs[i].dot(dirs[j])).clamp(-1.0, 1.0);
                    let deflection = cos.acos();
                    if deflection <= threshold {
                        candidates.push((deflection, i, j));
                    }
                }
            }
            candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let mut used = vec![false; ends.len()];
            for (_, i, j) in candidates {
                if used[i] || used[j] {
                    continue;
                }
                used[i] = true;
                used[j] = true;
                links.insert(ends[i], ends[j]);
                links.insert(ends[j], ends[i]);
            }
        }
        links
    }

    // =========================================================================
    // BRIDGING
    // =========================================================================

    /// Join free chain ends closer than the bridge distance, closest first.
    fn bridge(&self, mut chains: Vec<Chain>) -> (Vec<Chain>, usize) {
        let max = self.params.bridge_max_distance_px;
        let mut bridged = 0;
        if max <= 0.0 {
            return (chains, 0);
        }
        loop {
            let mut best: Option<(f32, usize, End, usize, End)> = None;
            for i in 0..chains.len() {
                for j in (i + 1)..chains.len() {
                    for ei in [End::Start, End::End] {
                        for ej in [End::Start, End::End] {
                            let (Some(a), Some(b)) = (free_end(&chains[i], ei), free_end(&chains[j], ej)) else {
                                continue;
                            };
                            let d = a.distance(b);
                            if d <= max && best.map_or(true, |(bd, ..)| d < bd) {
                                best = Some((d, i, ei, j, ej));
                            }
                        }
                    }
                }
            }
            let Some((_, i, ei, j, ej)) = best else { break };

            let mut b = chains.remove(j);
            let a = &mut chains[i];
            // Orient so that a's joined end is last and b's joined end is first
            if ei == End::Start {
                a.path.reverse();
                std::mem::swap(&mut a.start_free, &mut a.end_free);
            }
            if ej == End::End {
                b.path.reverse();
                std::mem::swap(&mut b.start_free, &mut b.end_free);
            }
            a.path.append(&b.path.points);
            a.end_free = b.end_free;
            bridged += 1;
        }
        (chains, bridged)
    }
}

fn node_at(graph: &SkeletonGraph, edge: usize, end: End) -> usize {
    match end {
        End::Start => graph.edges[edge].from,
        End::End => graph.edges[edge].to,
    }
}

fn leaving_direction(graph: &SkeletonGraph, edge: usize, end: End) -> Point {
    let pts = &graph.edges[edge].points;
    let k = DIRECTION_LOOKAHEAD.min(pts.len().saturating_sub(1));
    let (origin, ahead) = match end {
        End::Start => (pts[0], pts[k]),
        End::End => (pts[pts.len() - 1], pts[pts.len() - 1 - k]),
    };
    (ahead - origin).normalized_or(Point::new(1.0, 0.0))
}

fn free_end(chain: &Chain, end: End) -> Option<Point> {
    match end {
        End::Start if chain.start_free => chain.path.first(),
        End::End if chain.end_free => chain.path.last(),
        _ => None,
    }
}

// =============================================================================
// ORDERING
// =============================================================================

fn position_key(p: &OrderedPath) -> (i64, i64) {
    let f = p.first().unwrap_or_default();
    ((f.y * 16.0).round() as i64, (f.x * 16.0).round() as i64)
}

/// Deterministic order by first-point position.
fn order_by_position(mut paths: Vec<OrderedPath>) -> Vec<OrderedPath> {
    paths.sort_by_key(position_key);
    paths
}

/// Start from the longest path and repeatedly take the nearest path whose
/// end lies within `radius` of the current tail, otherwise the next longest.
pub fn order_by_proximity(paths: Vec<OrderedPath>, radius: f32) -> Vec<OrderedPath> {
    let mut remaining = order_by_position(paths);
    let mut ordered = Vec::with_capacity(remaining.len());

    let longest = |rem: &[OrderedPath]| {
        rem.iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.length()
                    .partial_cmp(&b.length())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)
    };

    while !remaining.is_empty() {
        let tail = ordered.last().and_then(|p: &OrderedPath| p.last());
        let mut pick: Option<(usize, bool, f32)> = None;
        if let Some(tail) = tail {
            for (i, p) in remaining.iter().enumerate() {
                let (Some(first), Some(last)) = (p.first(), p.last()) else { continue };
                for (d, reversed) in [(tail.distance(first), false), (tail.distance(last), true)] {
                    if d <= radius && pick.map_or(true, |(_, _, pd)| d < pd) {
                        pick = Some((i, reversed, d));
                    }
                }
            }
        }
        let (index, reversed) = match pick {
            Some((i, r, _)) => (i, r),
            None => match longest(&remaining) {
                Some(i) => (i, false),
                None => break,
            },
        };
        let mut path = remaining.remove(index);
        if reversed {
            path.reverse();
        }
        ordered.push(path);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tilemap::Tilemap;

    fn params() -> SplineParameters {
        SplineParameters {
            min_path_length_px: 4.0,
            ..SplineParameters::default()
        }
    }

    fn skeleton(width: usize, height: usize, pixels: &[(usize, usize)]) -> SkeletonGraph {
        let mut m = Tilemap::new(width, height);
        for &(x, y) in pixels {
            m.set(x, y, true);
        }
        SkeletonGraph::from_skeleton(&m)
    }

    fn cross() -> SkeletonGraph {
        let mut pixels = Vec::new();
        for i in 0..31 {
            pixels.push((i, 15));
            if i != 15 {
                pixels.push((15, i));
            }
        }
        skeleton(31, 31, &pixels)
    }

    #[test]
    fn test_straight_through_junction() {
        let p = params();
        let result = PathOrderer::new(&p).order_graph(&cross());
        assert_eq!(result.paths.len(), 2);
        for path in &result.paths {
            assert!((path.length() - 30.0).abs() < 1.0, "length {}", path.length());
        }
    }

    #[test]
    fn test_split_at_junction() {
        let p = SplineParameters {
            prefer_straight_through_junctions: false,
            ..params()
        };
        let result = PathOrderer::new(&p).order_graph(&cross());
        assert_eq!(result.paths.len(), 4);
    }

    #[test]
    fn test_bridges_small_gap() {
        // Two collinear runs separated by a 3-pixel gap
        let mut pixels: Vec<_> = (0..12).map(|x| (x, 5)).collect();
        pixels.extend((15..30).map(|x| (x, 5)));
        let graph = skeleton(30, 10, &pixels);
        let p = params();
        let result = PathOrderer::new(&p).order_graph(&graph);
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.bridged, 1);
        assert!((result.paths[0].length() - 29.0).abs() < 1e-3);
    }

    #[test]
    fn test_drops_spurs() {
        let mut pixels: Vec<_> = (0..30).map(|x| (x, 5)).collect();
        pixels.extend([(2, 15), (3, 15)]);
        let graph = skeleton(30, 20, &pixels);
        let p = params();
        let result = PathOrderer::new(&p).order_graph(&graph);
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.dropped, 1);
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let a = OrderedPath::new(vec![Point::new(0.0, 0.0), Point::new(50.0, 0.0)]);
        let b = OrderedPath::new(vec![Point::new(80.0, 0.0), Point::new(55.0, 0.0)]);
        let c = OrderedPath::new(vec![Point::new(0.0, 90.0), Point::new(10.0, 90.0)]);
        let first = order_by_proximity(vec![c.clone(), b.clone(), a.clone()], 12.0);
        let second = order_by_proximity(vec![a, c, b], 12.0);
        assert_eq!(first, second);
        // Longest first, then the neighbour reversed to continue from the tail
        assert_eq!(first[0].first(), Some(Point::new(0.0, 0.0)));
        assert_eq!(first[1].first(), Some(Point::new(55.0, 0.0)));
        assert_eq!(first[2].first(), Some(Point::new(0.0, 90.0)));
    }

    #[test]
    fn test_refine_vector_paths() {
        let a = OrderedPath::new(vec![Point::new(0.0, 0.0), Point::new(20.0, 0.0)]);
        let b = OrderedPath::new(vec![Point::new(40.0, 0.0), Point::new(22.0, 0.0)]);
        let p = params();
        let result = PathOrderer::new(&p).refine(vec![a, b]);
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.paths[0].last(), Some(Point::new(40.0, 0.0)));
    }
}
