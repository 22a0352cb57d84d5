//! Cross-section rasterization of road elevation targets.
//!
//! Stamps accumulate into a `CrossSectionAccumulator` as weighted sums, so
//! overlapping stamps give the same result regardless of order. The terrain
//! is only touched when the accumulator is applied.

use crate::blend::{lateral_weight, BlendFunction};
use crate::params::RoadSmoothingParameters;
use crate::point::Point;
use crate::spline::SplineSample;
use crate::tilemap::{Heightmap, Tilemap};

/// Weight at or above which a pixel counts as road surface.
const CORE_WEIGHT: f32 = 0.999;

/// Side slope widening never grows the impact radius past this multiple.
const MAX_WIDENING: f32 = 4.0;

// =============================================================================
// ACCUMULATOR
// =============================================================================

#[derive(Clone, Debug)]
pub struct CrossSectionAccumulator {
    weighted_sum: Tilemap<f32>,
    weight_sum: Tilemap<f32>,
    max_weight: Tilemap<f32>,
}

impl CrossSectionAccumulator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            weighted_sum: Tilemap::new(width, height),
            weight_sum: Tilemap::new(width, height),
            max_weight: Tilemap::new(width, height),
        }
    }

    pub fn width(&self) -> usize {
        self.weight_sum.width
    }

    pub fn height(&self) -> usize {
        self.weight_sum.height
    }

    /// Add one weighted target at a pixel. Zero weights are ignored.
    pub fn add(&mut self, x: usize, y: usize, target: f32, weight: f32) {
        if !(weight > 0.0) || !target.is_finite() {
            return;
        }
        let w = weight.min(1.0);
        *self.weighted_sum.get_mut(x, y) += target * w;
        *self.weight_sum.get_mut(x, y) += w;
        let m = self.max_weight.get_mut(x, y);
        *m = m.max(w);
    }

    pub fn weight(&self, x: usize, y: usize) -> f32 {
        *self.max_weight.get(x, y)
    }

    /// Weighted-average target at a pixel, if anything was stamped there.
    pub fn target(&self, x: usize, y: usize) -> Option<f32> {
        let ws = *self.weight_sum.get(x, y);
        (ws > 0.0).then(|| *self.weighted_sum.get(x, y) / ws)
    }

    /// Pixels receiving any correction.
    pub fn affected(&self) -> Tilemap<bool> {
        self.max_weight.map(|&w| w > 0.0)
    }

    /// Pixels receiving the full road target.
    pub fn core(&self) -> Tilemap<bool> {
        self.max_weight.map(|&w| w >= CORE_WEIGHT)
    }

    /// Blend stamped targets into `heightmap`:
    /// `existing + (target - existing) * weight`.
    pub fn apply(&self, heightmap: &mut Heightmap) {
        for y in 0..heightmap.height {
            for x in 0..heightmap.width {
                if let Some(target) = self.target(x, y) {
                    let w = self.weight(x, y);
                    let h = heightmap.get_mut(x, y);
                    *h += (target - *h) * w;
                }
            }
        }
    }
}

// =============================================================================
// SPLINE STAMPING
// =============================================================================

/// Cross-section shape in pixel units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CrossSectionGeometry {
    pub half_width_px: f32,
    pub falloff_px: f32,
    pub blend: BlendFunction,
    /// tan of the steepest allowed embankment, if limited
    pub side_slope_tan: Option<f32>,
    pub meters_per_pixel: f32,
}

impl CrossSectionGeometry {
    pub fn from_params(params: &RoadSmoothingParameters, meters_per_pixel: f32) -> Self {
        let mpp = meters_per_pixel.max(1e-6);
        Self {
            half_width_px: params.road_width_m * 0.5 / mpp,
            falloff_px: params.terrain_affected_range_m.max(0.0) / mpp,
            blend: params.blend_function,
            side_slope_tan: params
                .side_max_slope_degrees
                .map(|d| d.clamp(0.1, 89.0).to_radians().tan()),
            meters_per_pixel: mpp,
        }
    }

    pub fn max_falloff_px(&self) -> f32 {
        self.falloff_px.max((self.half_width_px + self.falloff_px) * MAX_WIDENING - self.half_width_px)
    }

    /// Falloff needed so the embankment between `target` and `terrain`
    /// stays within the side slope limit, capped at `max_falloff_px`.
    pub fn falloff_for(&self, target: f32, terrain: f32) -> f32 {
        match self.side_slope_tan {
            Some(tan) => {
                let needed = (target - terrain).abs() / tan / self.meters_per_pixel;
                self.falloff_px.max(needed.min(self.max_falloff_px()))
            }
            None => self.falloff_px,
        }
    }

    /// Slope-limited falloff for a stamp at `center`, judged by the terrain
    /// at both edges of the configured impact width.
    pub fn falloff_at(&self, terrain: &Heightmap, center: Point, tangent: Point, target: f32) -> f32 {
        if self.side_slope_tan.is_none() {
            return self.falloff_px;
        }
        let normal = tangent.normalized_or(Point::new(1.0, 0.0)).perpendicular();
        let reach = self.half_width_px + self.falloff_px;
        [1.0f32, -1.0]
            .iter()
            .map(|side| {
                let edge = center + normal * (reach * side);
                self.falloff_for(target, terrain.sample_bilinear(edge.x, edge.y))
            })
            .fold(self.falloff_px, f32::max)
    }
}

/// Summary of one stamped path.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StampStats {
    pub stamps: usize,
    /// Stamps whose falloff was widened to respect the side slope
    pub widened: usize,
    /// Widened stamps that hit the widening cap and still exceed the slope
    pub capped: usize,
}

impl StampStats {
    pub fn merge(&mut self, other: StampStats) {
        self.stamps += other.stamps;
        self.widened += other.widened;
        self.capped += other.capped;
    }
}

/// Stamp a cross-section at every spline sample of one path.
///
/// Each stamp covers the strip halfway to its neighbouring samples (plus a
/// one-pixel overlap) and the full impact width across the path.
pub fn stamp_path(
    acc: &mut CrossSectionAccumulator,
    terrain: &Heightmap,
    samples: &[SplineSample],
    targets: &[f32],
    geometry: &CrossSectionGeometry,
) -> StampStats {
    stamp_samples(acc, terrain, samples, targets, geometry, |_| true)
}

/// Like `stamp_path`, but only for samples where `include[i]` is set.
pub fn stamp_path_subset(
    acc: &mut CrossSectionAccumulator,
    terrain: &Heightmap,
    samples: &[SplineSample],
    targets: &[f32],
    geometry: &CrossSectionGeometry,
    include: &[bool],
) -> StampStats {
    stamp_samples(acc, terrain, samples, targets, geometry, |i| include.get(i).copied().unwrap_or(false))
}

fn stamp_samples(
    acc: &mut CrossSectionAccumulator,
    terrain: &Heightmap,
    samples: &[SplineSample],
    targets: &[f32],
    geometry: &CrossSectionGeometry,
    include: impl Fn(usize) -> bool,
) -> StampStats {
    let mut stats = StampStats::default();
    let n = samples.len().min(targets.len());
    for i in 0..n {
        if !include(i) {
            continue;
        }
        let s = samples[i];
        let target = targets[i];
        let back = if i > 0 { s.distance - samples[i - 1].distance } else { 0.0 };
        let ahead = if i + 1 < n { samples[i + 1].distance - s.distance } else { 0.0 };
        let along_back = back * 0.5 + 1.0;
        let along_ahead = ahead * 0.5 + 1.0;

        let falloff = geometry.falloff_at(terrain, s.position, s.tangent, target);
        if falloff > geometry.falloff_px + 1e-3 {
            stats.widened += 1;
            if falloff >= geometry.max_falloff_px() - 1e-3 {
                stats.capped += 1;
            }
        }
        stamp_one(acc, s.position, s.tangent, along_back, along_ahead, target, falloff, geometry);
        stats.stamps += 1;
    }
    stats
}

#[allow(clippy::too_many_arguments)]
fn stamp_one(
    acc: &mut CrossSectionAccumulator,
    center: Point,
    tangent: Point,
    along_back: f32,
    along_ahead: f32,
    target: f32,
    falloff: f32,
    geometry: &CrossSectionGeometry,
) {
    let tangent = tangent.normalized_or(Point::new(1.0, 0.0));
    let normal = tangent.perpendicular();
    let reach = geometry.half_width_px + falloff;
    let extent = reach.max(along_back.max(along_ahead)) + 1.0;

    let x0 = (center.x - extent).floor().max(0.0) as i64;
    let y0 = (center.y - extent).floor().max(0.0) as i64;
    let x1 = ((center.x + extent).ceil() as i64).min(acc.width() as i64 - 1);
    let y1 = ((center.y + extent).ceil() as i64).min(acc.height() as i64 - 1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let d = Point::new(x as f32, y as f32) - center;
            let along = d.dot(tangent);
            if along < -along_back || along > along_ahead {
                continue;
            }
            let lateral = d.dot(normal).abs();
            if lateral > reach {
                continue;
            }
            let w = lateral_weight(geometry.blend, lateral, geometry.half_width_px, falloff);
            acc.add(x as usize, y as usize, target, w);
        }
    }
}

// =============================================================================
// DIRECT MASK
// =============================================================================

/// Nearest set pixel of `mask` for every pixel (two-pass propagation).
pub fn nearest_site(mask: &Tilemap<bool>) -> Tilemap<Option<(u32, u32)>> {
    let (w, h) = (mask.width, mask.height);
    let mut site: Tilemap<Option<(u32, u32)>> = Tilemap::new(w, h);
    for (x, y, &v) in mask.iter() {
        if v {
            site.set(x, y, Some((x as u32, y as u32)));
        }
    }

    let dist2 = |x: usize, y: usize, s: (u32, u32)| {
        let dx = x as f32 - s.0 as f32;
        let dy = y as f32 - s.1 as f32;
        dx * dx + dy * dy
    };
    let relax = |site: &mut Tilemap<Option<(u32, u32)>>, x: usize, y: usize, offsets: &[(i64, i64)]| {
        let mut best = site.get(x, y).map(|s| (dist2(x, y, s), s));
        for &(dx, dy) in offsets {
            if let Some(Some(s)) = site.get_checked(x as i64 + dx, y as i64 + dy).copied() {
                let d = dist2(x, y, s);
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, s));
                }
            }
        }
        site.set(x, y, best.map(|(_, s)| s));
    };

    const FORWARD: [(i64, i64); 4] = [(-1, 0), (-1, -1), (0, -1), (1, -1)];
    const BACKWARD: [(i64, i64); 4] = [(1, 0), (1, 1), (0, 1), (-1, 1)];
    for y in 0..h {
        for x in 0..w {
            relax(&mut site, x, y, &FORWARD);
        }
    }
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            relax(&mut site, x, y, &BACKWARD);
        }
    }
    site
}

/// Mean terrain elevation of mask pixels within `radius` of each mask pixel.
pub fn masked_box_average(terrain: &Heightmap, mask: &Tilemap<bool>, radius: usize) -> Tilemap<f32> {
    let (w, h) = (terrain.width, terrain.height);
    // Summed-area tables with a zero border row/column
    let mut sum = vec![0.0f64; (w + 1) * (h + 1)];
    let mut count = vec![0u32; (w + 1) * (h + 1)];
    let idx = |x: usize, y: usize| y * (w + 1) + x;
    for y in 0..h {
        for x in 0..w {
            let (v, c) = if *mask.get(x, y) { (*terrain.get(x, y) as f64, 1) } else { (0.0, 0) };
            sum[idx(x + 1, y + 1)] = v + sum[idx(x, y + 1)] + sum[idx(x + 1, y)] - sum[idx(x, y)];
            count[idx(x + 1, y + 1)] = c + count[idx(x, y + 1)] + count[idx(x + 1, y)] - count[idx(x, y)];
        }
    }

    let mut out = terrain.clone();
    for y in 0..h {
        for x in 0..w {
            if !*mask.get(x, y) {
                continue;
            }
            let (xa, ya) = (x.saturating_sub(radius), y.saturating_sub(radius));
            let (xb, yb) = ((x + radius + 1).min(w), (y + radius + 1).min(h));
            let s = sum[idx(xb, yb)] - sum[idx(xa, yb)] - sum[idx(xb, ya)] + sum[idx(xa, ya)];
            let c = count[idx(xb, yb)] + count[idx(xa, ya)] - count[idx(xa, yb)] - count[idx(xb, ya)];
            if c > 0 {
                out.set(x, y, (s / c as f64) as f32);
            }
        }
    }
    out
}

/// Flatten a painted road mask directly: mask pixels take the local mean
/// (optionally leveled), and the surroundings fall off with distance to the
/// nearest mask pixel. Returns the per-pixel target map for mask pixels.
pub fn stamp_direct_mask(
    acc: &mut CrossSectionAccumulator,
    terrain: &Heightmap,
    mask: &Tilemap<bool>,
    geometry: &CrossSectionGeometry,
    smoothing_radius: usize,
    leveling_strength: f32,
) -> Tilemap<f32> {
    let mut targets = masked_box_average(terrain, mask, smoothing_radius);

    let strength = leveling_strength.clamp(0.0, 1.0);
    if strength > 0.0 {
        let (total, n) = mask
            .iter()
            .filter(|(_, _, m)| **m)
            .fold((0.0f64, 0usize), |(t, n), (x, y, _)| (t + *targets.get(x, y) as f64, n + 1));
        if n > 0 {
            let mean = (total / n as f64) as f32;
            for (x, y, &m) in mask.iter() {
                if m {
                    let v = targets.get_mut(x, y);
                    *v += (mean - *v) * strength;
                }
            }
        }
    }

    let sites = nearest_site(mask);
    for y in 0..terrain.height {
        for x in 0..terrain.width {
            let Some((sx, sy)) = *sites.get(x, y) else { continue };
            let target = *targets.get(sx as usize, sy as usize);
            let dx = x as f32 - sx as f32;
            let dy = y as f32 - sy as f32;
            let distance = (dx * dx + dy * dy).sqrt();
            let falloff = geometry.falloff_for(target, *terrain.get(x, y));
            let w = lateral_weight(geometry.blend, distance, 0.0, falloff);
            acc.add(x, y, target, w);
        }
    }
    targets
}
