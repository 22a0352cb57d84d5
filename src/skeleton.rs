//! Skeleton extraction from binary road masks.
//!
//! Thins a filled mask to a 1-pixel centerline (Zhang–Suen), strips
//! staircase pixels so diagonal runs stay degree-2, then walks the result
//! into a graph of endpoint/junction nodes joined by pixel-run edges.

use crate::point::Point;
use crate::tilemap::Tilemap;

// =============================================================================
// THINNING
// =============================================================================

/// 8-neighbourhood in Zhang–Suen order: N, NE, E, SE, S, SW, W, NW
const RING: [(i64, i64); 8] = [(0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1)];

fn is_set(mask: &Tilemap<bool>, x: i64, y: i64) -> bool {
    mask.get_checked(x, y).copied().unwrap_or(false)
}

fn ring(mask: &Tilemap<bool>, x: usize, y: usize) -> [bool; 8] {
    let mut p = [false; 8];
    for (i, (dx, dy)) in RING.iter().enumerate() {
        p[i] = is_set(mask, x as i64 + dx, y as i64 + dy);
    }
    p
}

/// Thin a binary mask to a 1-pixel-wide skeleton.
pub fn thin(mask: &Tilemap<bool>) -> Tilemap<bool> {
    let mut skel = mask.clone();
    let mut to_clear: Vec<(usize, usize)> = Vec::new();

    loop {
        let mut changed = false;
        for step in 0..2 {
            to_clear.clear();
            for y in 0..skel.height {
                for x in 0..skel.width {
                    if !*skel.get(x, y) {
                        continue;
                    }
                    let p = ring(&skel, x, y);
                    let b = p.iter().filter(|&&v| v).count();
                    if !(2..=6).contains(&b) {
                        continue;
                    }
                    let a = (0..8).filter(|&i| !p[i] && p[(i + 1) % 8]).count();
                    if a != 1 {
                        continue;
                    }
                    let (n, e, s, w) = (p[0], p[2], p[4], p[6]);
                    let remove = if step == 0 {
                        !(n && e && s) && !(e && s && w)
                    } else {
                        !(n && e && w) && !(n && s && w)
                    };
                    if remove {
                        to_clear.push((x, y));
                    }
                }
            }
            for &(x, y) in &to_clear {
                skel.set(x, y, false);
            }
            changed |= !to_clear.is_empty();
        }
        if !changed {
            break;
        }
    }

    remove_staircase(&mut skel);
    skel
}

/// Drop corner pixels whose two orthogonal neighbours already touch
/// diagonally, so a diagonal run does not read as a chain of junctions.
fn remove_staircase(skel: &mut Tilemap<bool>) {
    // (first, second, opposite diagonal) indices into RING
    const CORNERS: [(usize, usize, usize); 4] = [(0, 2, 5), (2, 4, 7), (4, 6, 1), (6, 0, 3)];
    for y in 0..skel.height {
        for x in 0..skel.width {
            if !*skel.get(x, y) {
                continue;
            }
            let p = ring(skel, x, y);
            for &(a, b, diag) in &CORNERS {
                let opp_a = (a + 4) % 8;
                let opp_b = (b + 4) % 8;
                if p[a] && p[b] && !p[opp_a] && !p[opp_b] && !p[diag] {
                    skel.set(x, y, false);
                    break;
                }
            }
        }
    }
}

// =============================================================================
// GRAPH
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Degree-1 pixel
    Endpoint,
    /// Cluster of adjacent degree ≥ 3 pixels
    Junction,
    /// Lone pixel with no neighbours
    Isolated,
    /// Anchor inserted to open a closed loop
    Loop,
}

#[derive(Clone, Debug)]
pub struct SkeletonNode {
    pub position: Point,
    pub kind: NodeKind,
    pub pixels: Vec<(usize, usize)>,
}

/// Pixel run between two nodes. `points` starts at `from`'s position and
/// ends at `to`'s.
#[derive(Clone, Debug)]
pub struct SkeletonEdge {
    pub from: usize,
    pub to: usize,
    pub points: Vec<Point>,
}

#[derive(Clone, Debug, Default)]
pub struct SkeletonGraph {
    pub nodes: Vec<SkeletonNode>,
    pub edges: Vec<SkeletonEdge>,
}

impl SkeletonGraph {
    /// Thin `mask` and extract its graph.
    pub fn from_mask(mask: &Tilemap<bool>) -> Self {
        Self::from_skeleton(&thin(mask))
    }

    /// Build the graph of an already thinned skeleton.
    pub fn from_skeleton(skel: &Tilemap<bool>) -> Self {
        let mut degree = skel.map(|_| 0u8);
        for y in 0..skel.height {
            for x in 0..skel.width {
                if *skel.get(x, y) {
                    let d = skel.neighbors_8(x, y).into_iter().filter(|&(nx, ny)| *skel.get(nx, ny)).count();
                    degree.set(x, y, d as u8);
                }
            }
        }

        let mut graph = SkeletonGraph::default();
        let mut node_of: Tilemap<Option<usize>> = Tilemap::new(skel.width, skel.height);

        // Nodes: endpoints, isolated pixels, and 8-connected junction clusters
        for y in 0..skel.height {
            for x in 0..skel.width {
                if !*skel.get(x, y) || node_of.get(x, y).is_some() {
                    continue;
                }
                let d = *degree.get(x, y);
                let id = graph.nodes.len();
                match d {
                    0 | 1 => {
                        node_of.set(x, y, Some(id));
                        graph.nodes.push(SkeletonNode {
                            position: Point::from_pixel(x, y),
                            kind: if d == 0 { NodeKind::Isolated } else { NodeKind::Endpoint },
                            pixels: vec![(x, y)],
                        });
                    }
                    2 => {}
                    _ => {
                        let pixels = flood_junction(skel, &degree, &mut node_of, x, y, id);
                        let n = pixels.len() as f32;
                        let (sx, sy) = pixels.iter().fold((0.0, 0.0), |(sx, sy), &(px, py)| (sx + px as f32, sy + py as f32));
                        graph.nodes.push(SkeletonNode {
                            position: Point::new(sx / n, sy / n),
                            kind: NodeKind::Junction,
                            pixels,
                        });
                    }
                }
            }
        }

        let mut visited: Tilemap<bool> = Tilemap::new(skel.width, skel.height);

        // Edges leaving each node
        for node_id in 0..graph.nodes.len() {
            let starts = graph.nodes[node_id].pixels.clone();
            for (sx, sy) in starts {
                for (nx, ny) in skel.neighbors_8(sx, sy) {
                    if !*skel.get(nx, ny) {
                        continue;
                    }
                    match *node_of.get(nx, ny) {
                        Some(other) if other == node_id => {}
                        Some(other) => {
                            // Adjacent nodes: add once, from the lower id
                            if node_id < other {
                                let points = vec![graph.nodes[node_id].position, graph.nodes[other].position];
                                graph.edges.push(SkeletonEdge { from: node_id, to: other, points });
                            }
                        }
                        None => {
                            if *visited.get(nx, ny) {
                                continue;
                            }
                            let (pixels, end) = trace(skel, &node_of, &mut visited, (sx, sy), (nx, ny));
                            let Some(end) = end else { continue };
                            if end == node_id && pixels.len() < 3 {
                                continue;
                            }
                            let mut points = Vec::with_capacity(pixels.len() + 2);
                            points.push(graph.nodes[node_id].position);
                            points.extend(pixels.iter().map(|&(px, py)| Point::from_pixel(px, py)));
                            points.push(graph.nodes[end].position);
                            graph.edges.push(SkeletonEdge { from: node_id, to: end, points });
                        }
                    }
                }
            }
        }

        // Closed loops have no nodes; anchor each at its first pixel
        for y in 0..skel.height {
            for x in 0..skel.width {
                if !*skel.get(x, y) || *visited.get(x, y) || node_of.get(x, y).is_some() {
                    continue;
                }
                let id = graph.nodes.len();
                node_of.set(x, y, Some(id));
                graph.nodes.push(SkeletonNode {
                    position: Point::from_pixel(x, y),
                    kind: NodeKind::Loop,
                    pixels: vec![(x, y)],
                });
                visited.set(x, y, true);
                let next = skel
                    .neighbors_8(x, y)
                    .into_iter()
                    .find(|&(nx, ny)| *skel.get(nx, ny) && !*visited.get(nx, ny));
                if let Some(next) = next {
                    let (pixels, end) = trace(skel, &node_of, &mut visited, (x, y), next);
                    let mut points = Vec::with_capacity(pixels.len() + 2);
                    points.push(Point::from_pixel(x, y));
                    points.extend(pixels.iter().map(|&(px, py)| Point::from_pixel(px, py)));
                    points.push(Point::from_pixel(x, y));
                    graph.edges.push(SkeletonEdge { from: id, to: end.unwrap_or(id), points });
                }
            }
        }

        graph
    }

    /// Number of edge ends touching `node` (self-loops count twice).
    #[cfg(test)]
    pub fn degree(&self, node: usize) -> usize {
        self.edges
            .iter()
            .map(|e| (e.from == node) as usize + (e.to == node) as usize)
            .sum()
    }

    pub fn junction_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Junction).count()
    }
}

fn flood_junction(
    skel: &Tilemap<bool>,
    degree: &Tilemap<u8>,
    node_of: &mut Tilemap<Option<usize>>,
    x: usize,
    y: usize,
    id: usize,
) -> Vec<(usize, usize)> {
    let mut pixels = Vec::new();
    let mut stack = vec![(x, y)];
    node_of.set(x, y, Some(id));
    while let Some((cx, cy)) = stack.pop() {
        pixels.push((cx, cy));
        for (nx, ny) in skel.neighbors_8(cx, cy) {
            if *skel.get(nx, ny) && *degree.get(nx, ny) >= 3 && node_of.get(nx, ny).is_none() {
                node_of.set(nx, ny, Some(id));
                stack.push((nx, ny));
            }
        }
    }
    pixels.sort_unstable_by_key(|&(px, py)| (py, px));
    pixels
}

/// Follow degree-2 pixels from `first` (a neighbour of `start`) until a node
/// pixel is reached. Returns the interior pixels and the node hit, if any.
fn trace(
    skel: &Tilemap<bool>,
    node_of: &Tilemap<Option<usize>>,
    visited: &mut Tilemap<bool>,
    start: (usize, usize),
    first: (usize, usize),
) -> (Vec<(usize, usize)>, Option<usize>) {
    let mut pixels = Vec::new();
    let mut prev = start;
    let mut cur = first;
    loop {
        if let Some(node) = *node_of.get(cur.0, cur.1) {
            return (pixels, Some(node));
        }
        if *visited.get(cur.0, cur.1) {
            return (pixels, None);
        }
        visited.set(cur.0, cur.1, true);
        pixels.push(cur);

        let neighbors: Vec<(usize, usize)> = skel
            .neighbors_8(cur.0, cur.1)
            .into_iter()
            .filter(|&(nx, ny)| *skel.get(nx, ny) && (nx, ny) != prev)
            .collect();
        // Prefer an unvisited through-pixel that moves away from `prev`,
        // orthogonal steps first; otherwise stop at a node pixel.
        let touches_prev = |(nx, ny): (usize, usize)| nx.abs_diff(prev.0) <= 1 && ny.abs_diff(prev.1) <= 1;
        let diagonal = |(nx, ny): (usize, usize)| nx != cur.0 && ny != cur.1;
        let next = neighbors
            .iter()
            .copied()
            .filter(|&(nx, ny)| node_of.get(nx, ny).is_none() && !*visited.get(nx, ny))
            .min_by_key(|&n| (touches_prev(n), diagonal(n)))
            .or_else(|| neighbors.iter().copied().find(|&(nx, ny)| node_of.get(nx, ny).is_some()));
        match next {
            Some(n) => {
                prev = cur;
                cur = n;
            }
            None => return (pixels, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(width: usize, height: usize, pixels: &[(usize, usize)]) -> Tilemap<bool> {
        let mut m = Tilemap::new(width, height);
        for &(x, y) in pixels {
            m.set(x, y, true);
        }
        m
    }

    #[test]
    fn test_thin_bar_to_single_line() {
        let mut mask = Tilemap::new(40, 15);
        for y in 5..10 {
            for x in 5..35 {
                mask.set(x, y, true);
            }
        }
        let skel = thin(&mask);
        for x in 12..28 {
            let count = (0..15).filter(|&y| *skel.get(x, y)).count();
            assert_eq!(count, 1, "column {x}");
        }
        let graph = SkeletonGraph::from_skeleton(&skel);
        let longest = graph
            .edges
            .iter()
            .map(|e| crate::point::polyline_length(&e.points))
            .fold(0.0, f32::max);
        assert!(longest > 20.0);
    }

    #[test]
    fn test_cross_has_one_junction() {
        let mut pixels = Vec::new();
        for i in 0..21 {
            pixels.push((i, 10));
            if i != 10 {
                pixels.push((10, i));
            }
        }
        let graph = SkeletonGraph::from_skeleton(&mask_from(21, 21, &pixels));
        assert_eq!(graph.junction_count(), 1);
        assert_eq!(graph.edges.len(), 4);
        let junction = graph.nodes.iter().position(|n| n.kind == NodeKind::Junction).unwrap();
        assert_eq!(graph.degree(junction), 4);
        assert!(graph.nodes[junction].position.distance(Point::new(10.0, 10.0)) < 1e-4);
    }

    #[test]
    fn test_straight_line_single_edge() {
        let pixels: Vec<_> = (2..18).map(|x| (x, 4)).collect();
        let graph = SkeletonGraph::from_skeleton(&mask_from(20, 8, &pixels));
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].points.len(), 16);
    }

    #[test]
    fn test_staircase_diagonal_stays_simple() {
        // Zig-zag diagonal: every step leaves an L-shaped corner pixel
        let mut pixels = Vec::new();
        for i in 0..10 {
            pixels.push((i + 1, i + 1));
            pixels.push((i + 1, i + 2));
        }
        let mut mask = mask_from(14, 14, &pixels);
        remove_staircase(&mut mask);
        let graph = SkeletonGraph::from_skeleton(&mask);
        assert_eq!(graph.junction_count(), 0);
        assert_eq!(graph.edges.len(), 1);
    }

    #[test]
    fn test_closed_loop() {
        let mut pixels = Vec::new();
        for i in 2..10 {
            pixels.push((i, 2));
            pixels.push((i, 9));
        }
        for i in 3..9 {
            pixels.push((2, i));
            pixels.push((9, i));
        }
        let graph = SkeletonGraph::from_skeleton(&mask_from(12, 12, &pixels));
        assert_eq!(graph.edges.len(), 1);
        let edge = &graph.edges[0];
        assert_eq!(edge.from, edge.to);
        assert!(crate::point::polyline_length(&edge.points) > 25.0);
    }
}
