//! Junction detection and elevation harmonization across road layers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::network::RoadLayer;
use crate::point::Point;

/// Distance from the terrain edge within which a path end is treated as
/// leaving the map rather than dangling.
const BORDER_MARGIN_PX: f32 = 2.0;

/// A path sample taking part in a junction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JunctionMember {
    /// Index into the road layer list
    pub layer: usize,
    pub path: usize,
    /// Sample of `path` closest to the junction
    pub sample: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JunctionSite {
    /// Stable id, assigned in row-major position order
    pub id: usize,
    pub position: Point,
    pub members: Vec<JunctionMember>,
    pub blended_elevation: f32,
    /// Skip this junction when harmonizing
    pub excluded: bool,
}

impl JunctionSite {
    /// Number of distinct layers meeting here.
    pub fn layer_count(&self) -> usize {
        let mut layers: Vec<usize> = self.members.iter().map(|m| m.layer).collect();
        layers.sort_unstable();
        layers.dedup();
        layers.len()
    }
}

#[derive(Clone, Copy, Debug)]
struct SampleRef {
    layer: usize,
    path: usize,
    sample: usize,
    position: Point,
    along: f32,
    radius: f32,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    position: Point,
    distance: f32,
    a: usize,
    b: usize,
}

fn cell_of(p: Point, size: f32) -> (i64, i64) {
    ((p.x / size).floor() as i64, (p.y / size).floor() as i64)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

// =============================================================================
// DETECTION
// =============================================================================

/// Find places where road paths pass within their detection radius of each
/// other. Nearby detections collapse into a single site.
pub fn detect_junctions(layers: &[RoadLayer], meters_per_pixel: f32) -> Vec<JunctionSite> {
    let mpp = meters_per_pixel.max(1e-6);
    let mut refs = Vec::new();
    for (l, layer) in layers.iter().enumerate() {
        let jp = &layer.params.junctions;
        if !jp.enabled {
            continue;
        }
        let radius = jp.detection_radius_m / mpp;
        for (p, path) in layer.network.paths().iter().enumerate() {
            for (k, s) in path.samples.iter().enumerate() {
                refs.push(SampleRef {
                    layer: l,
                    path: p,
                    sample: k,
                    position: s.position,
                    along: s.distance,
                    radius,
                });
            }
        }
    }
    let cell = refs.iter().map(|r| r.radius).fold(0.0f32, f32::max);
    if refs.is_empty() || cell <= 0.0 {
        return Vec::new();
    }

    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (i, r) in refs.iter().enumerate() {
        grid.entry(cell_of(r.position, cell)).or_default().push(i);
    }

    let mut candidates = Vec::new();
    for (i, a) in refs.iter().enumerate() {
        let (cx, cy) = cell_of(a.position, cell);
        for gy in cy - 1..=cy + 1 {
            for gx in cx - 1..=cx + 1 {
                let Some(bucket) = grid.get(&(gx, gy)) else { continue };
                for &j in bucket {
                    if j <= i {
                        continue;
                    }
                    let b = &refs[j];
                    let radius = a.radius.max(b.radius);
                    // A path meeting itself only counts far from where it already is
                    if a.layer == b.layer && a.path == b.path && (a.along - b.along).abs() <= 3.0 * radius {
                        continue;
                    }
                    let distance = a.position.distance(b.position);
                    if distance <= radius {
                        candidates.push(Candidate {
                            position: a.position.lerp(b.position, 0.5),
                            distance,
                            a: i,
                            b: j,
                        });
                    }
                }
            }
        }
    }

    let clusters = cluster_candidates(&candidates, &refs, cell);
    let mut sites: Vec<JunctionSite> = clusters
        .into_iter()
        .map(|members| build_site(&members, &candidates, &refs, layers))
        .collect();

    sites.sort_by(|a, b| {
        (a.position.y, a.position.x)
            .partial_cmp(&(b.position.y, b.position.x))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (id, site) in sites.iter_mut().enumerate() {
        site.id = id;
    }
    sites
}

/// Single-linkage clustering of candidates within their detection radius.
fn cluster_candidates(candidates: &[Candidate], refs: &[SampleRef], cell: f32) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..candidates.len()).collect();
    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        grid.entry(cell_of(c.position, cell)).or_default().push(i);
    }
    for (i, c) in candidates.iter().enumerate() {
        let radius = refs[c.a].radius.max(refs[c.b].radius);
        let (cx, cy) = cell_of(c.position, cell);
        for gy in cy - 1..=cy + 1 {
            for gx in cx - 1..=cx + 1 {
                let Some(bucket) = grid.get(&(gx, gy)) else { continue };
                for &j in bucket {
                    if j > i && c.position.distance(candidates[j].position) <= radius {
                        let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                        if ri != rj {
                            parent[ri.max(rj)] = ri.min(rj);
                        }
                    }
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..candidates.len() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }
    let mut clusters: Vec<Vec<usize>> = groups.into_values().collect();
    clusters.sort_by_key(|c| c[0]);
    clusters
}

fn build_site(cluster: &[usize], candidates: &[Candidate], refs: &[SampleRef], layers: &[RoadLayer]) -> JunctionSite {
    // The closest approach in the cluster is the crossing point
    let best = cluster
        .iter()
        .copied()
        .min_by(|&a, &b| {
            candidates[a]
                .distance
                .partial_cmp(&candidates[b].distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        })
        .unwrap_or(cluster[0]);
    let position = candidates[best].position;

    // One member per path: its candidate sample nearest the crossing
    let mut nearest: HashMap<(usize, usize), (f32, usize)> = HashMap::new();
    for &c in cluster {
        for r in [candidates[c].a, candidates[c].b] {
            let s = &refs[r];
            let d = s.position.distance(position);
            let entry = nearest.entry((s.layer, s.path)).or_insert((d, s.sample));
            if d < entry.0 || (d == entry.0 && s.sample < entry.1) {
                *entry = (d, s.sample);
            }
        }
    }
    let mut members: Vec<JunctionMember> = nearest
        .into_iter()
        .map(|((layer, path), (_, sample))| JunctionMember { layer, path, sample })
        .collect();
    members.sort_by_key(|m| (m.layer, m.path));

    let elevations: Vec<f32> = members
        .iter()
        .filter_map(|m| layers[m.layer].network.paths()[m.path].targets().get(m.sample).copied())
        .collect();
    let blended_elevation = if elevations.is_empty() {
        0.0
    } else {
        elevations.iter().sum::<f32>() / elevations.len() as f32
    };

    JunctionSite {
        id: 0,
        position,
        members,
        blended_elevation,
        excluded: false,
    }
}

// =============================================================================
// HARMONIZATION
// =============================================================================

/// Which samples changed, per layer and path.
#[derive(Clone, Debug, Default)]
pub struct Harmonization {
    pub changed: Vec<Vec<Vec<bool>>>,
    pub applied_sites: usize,
    pub tapered_ends: usize,
}

impl Harmonization {
    pub fn any_changed(&self) -> bool {
        self.changed.iter().flatten().flatten().any(|&c| c)
    }
}

/// Blend member targets toward each included site's elevation, then taper
/// dangling path ends back toward their original terrain.
pub fn harmonize(
    layers: &mut [RoadLayer],
    sites: &[JunctionSite],
    meters_per_pixel: f32,
    terrain_size: (usize, usize),
) -> Harmonization {
    let mpp = meters_per_pixel.max(1e-6);
    let mut result = Harmonization {
        changed: layers
            .iter()
            .map(|l| l.network.paths().iter().map(|p| vec![false; p.samples.len()]).collect())
            .collect(),
        ..Default::default()
    };

    for site in sites.iter().filter(|s| !s.excluded) {
        let mut touched = false;
        for m in &site.members {
            let Some(layer) = layers.get_mut(m.layer) else { continue };
            let jp = layer.params.junctions.clone();
            let blend_px = jp.blend_distance_m / mpp;
            if blend_px <= 0.0 {
                continue;
            }
            let Some(path) = layer.network.paths_mut().get_mut(m.path) else { continue };
            for (k, s) in path.samples.iter().enumerate() {
                let d = s.position.distance(site.position);
                if d >= blend_px {
                    continue;
                }
                let w = jp.blend_function.weight(d / blend_px);
                if w <= 0.0 {
                    continue;
                }
                let t = &mut path.profile.target[k];
                *t += (site.blended_elevation - *t) * w;
                result.changed[m.layer][m.path][k] = true;
                touched = true;
            }
        }
        if touched {
            result.applied_sites += 1;
        }
    }

    let (width, height) = terrain_size;
    for (l, layer) in layers.iter_mut().enumerate() {
        let jp = layer.params.junctions.clone();
        if !jp.enabled || !jp.endpoint_taper {
            continue;
        }
        let detect_px = jp.detection_radius_m / mpp;
        let taper_px = jp.endpoint_taper_distance_m / mpp;
        if taper_px <= 0.0 {
            continue;
        }
        for (p, path) in layer.network.paths_mut().iter_mut().enumerate() {
            let length = path.length();
            let (Some(first), Some(last)) = (path.samples.first().copied(), path.samples.last().copied()) else {
                continue;
            };
            for (end, at_start) in [(first.position, true), (last.position, false)] {
                if !is_dangling(end, sites, detect_px, width, height) {
                    continue;
                }
                result.tapered_ends += 1;
                for (k, s) in path.samples.iter().enumerate() {
                    let u = if at_start { s.distance } else { length - s.distance };
                    if u >= taper_px {
                        continue;
                    }
                    let w = jp.endpoint_blend_strength.clamp(0.0, 1.0) * jp.blend_function.weight(u / taper_px);
                    let raw = path.profile.raw.get(k).copied().unwrap_or(path.profile.target[k]);
                    let t = &mut path.profile.target[k];
                    *t += (raw - *t) * w;
                    result.changed[l][p][k] = true;
                }
            }
        }
    }
    result
}

/// An end dangles when no junction (excluded ones included) is near it and
/// it does not run off the terrain edge.
fn is_dangling(end: Point, sites: &[JunctionSite], detect_px: f32, width: usize, height: usize) -> bool {
    let at_border = end.x <= BORDER_MARGIN_PX
        || end.y <= BORDER_MARGIN_PX
        || end.x >= width as f32 - 1.0 - BORDER_MARGIN_PX
        || end.y >= height as f32 - 1.0 - BORDER_MARGIN_PX;
    if at_border {
        return false;
    }
    !sites.iter().any(|s| s.position.distance(end) <= detect_px)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross_section::{stamp_path, CrossSectionAccumulator, CrossSectionGeometry};
    use crate::network::{NetworkStats, RoadNetwork, RoadPath};
    use crate::params::RoadSmoothingParameters;
    use crate::smoothing::ElevationProfile;
    use crate::spline::TcbSpline;
    use crate::tilemap::Heightmap;

    fn straight(material: usize, a: Point, b: Point, elevation: f32) -> RoadPath {
        let spline = TcbSpline::new(vec![a, b], 0.0, 0.0, 0.0).unwrap();
        let samples = spline.resample(1.0);
        let n = samples.len();
        RoadPath {
            material,
            samples,
            profile: ElevationProfile {
                raw: vec![elevation; n],
                target: vec![elevation; n],
            },
        }
    }

    fn layer(material: usize, paths: Vec<RoadPath>) -> RoadLayer {
        let params = RoadSmoothingParameters::default();
        RoadLayer {
            material,
            geometry: CrossSectionGeometry::from_params(&params, 1.0),
            params,
            network: RoadNetwork::Spline { paths },
            stats: NetworkStats::default(),
        }
    }

    fn crossing(e1: f32, e2: f32) -> Vec<RoadLayer> {
        vec![
            layer(1, vec![straight(1, Point::new(0.0, 50.0), Point::new(99.0, 50.0), e1)]),
            layer(2, vec![straight(2, Point::new(50.0, 0.0), Point::new(50.0, 99.0), e2)]),
        ]
    }

    #[test]
    fn test_cross_material_crossing_is_one_site() {
        let layers = crossing(10.0, 20.0);
        let sites = detect_junctions(&layers, 1.0);
        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.layer_count(), 2);
        assert!(site.position.distance(Point::new(50.0, 50.0)) < 1.0);
        assert!((site.blended_elevation - 15.0).abs() < 1e-4);
    }

    #[test]
    fn test_parallel_far_paths_have_no_site() {
        let layers = vec![
            layer(1, vec![straight(1, Point::new(0.0, 20.0), Point::new(99.0, 20.0), 0.0)]),
            layer(2, vec![straight(2, Point::new(0.0, 60.0), Point::new(99.0, 60.0), 0.0)]),
        ];
        assert!(detect_junctions(&layers, 1.0).is_empty());
    }

    #[test]
    fn test_crossing_elevation_between_targets() {
        let (e1, e2) = (10.0, 20.0);
        let mut layers = crossing(e1, e2);
        let sites = detect_junctions(&layers, 1.0);
        let outcome = harmonize(&mut layers, &sites, 1.0, (100, 100));
        assert_eq!(outcome.applied_sites, 1);
        assert!(outcome.any_changed());

        let mut terrain = Heightmap::new_with(100, 100, 0.0);
        let mut acc = CrossSectionAccumulator::new(100, 100);
        for l in &layers {
            for p in l.network.paths() {
                stamp_path(&mut acc, &terrain, &p.samples, p.targets(), &l.geometry);
            }
        }
        acc.apply(&mut terrain);
        let v = *terrain.get(50, 50);
        assert!(v >= e1 && v <= e2, "crossing elevation {v}");
    }

    #[test]
    fn test_excluded_site_is_left_alone() {
        let mut layers = crossing(10.0, 20.0);
        let mut sites = detect_junctions(&layers, 1.0);
        sites[0].excluded = true;
        let outcome = harmonize(&mut layers, &sites, 1.0, (100, 100));
        assert_eq!(outcome.applied_sites, 0);
        // Ends run to the border, so nothing tapers either
        assert_eq!(outcome.tapered_ends, 0);
        assert!(layers[0].network.paths()[0].targets().iter().all(|&t| t == 10.0));
    }

    #[test]
    fn test_dangling_end_tapers_to_terrain() {
        let mut path = straight(1, Point::new(10.0, 50.0), Point::new(60.0, 50.0), 0.0);
        for t in path.profile.target.iter_mut() {
            *t = 5.0;
        }
        let mut layers = vec![layer(1, vec![path])];
        let outcome = harmonize(&mut layers, &[], 1.0, (100, 100));
        assert_eq!(outcome.tapered_ends, 2);
        let targets = layers[0].network.paths()[0].targets();
        let strength = RoadSmoothingParameters::default().junctions.endpoint_blend_strength;
        assert!((targets[0] - 5.0 * (1.0 - strength)).abs() < 1e-4);
        let mid = targets.len() / 2;
        assert_eq!(targets[mid], 5.0);
    }
}
