//! Vector and raster road/area ingestion.
//!
//! Both ingestion paths end in the same representation: line features become
//! `OrderedPath`s in terrain pixel space, area features become a greyscale
//! mask. Raster layer masks are binarized and handed to skeleton extraction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diagnostics::DiagnosticLog;
use crate::error::{Result, TerrainError};
use crate::geo::CoordinateTransformer;
use crate::paths::OrderedPath;
use crate::point::{distance_to_segment, Point};
use crate::tilemap::Tilemap;

const SOURCE: &str = "features";

/// Geometry in geographic coordinates, `[lon, lat]` pairs as in GeoJSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum FeatureGeometry {
    LineString(Vec<[f64; 2]>),
    /// Exterior ring followed by holes
    Polygon(Vec<Vec<[f64; 2]>>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: FeatureGeometry,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Pre-fetched features for one query bounding box.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Selects features by a property key and optional accepted values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFilter {
    pub key: String,
    /// Empty accepts any value for `key`
    #[serde(default)]
    pub values: Vec<String>,
}

impl FeatureFilter {
    pub fn matches(&self, feature: &Feature) -> bool {
        let Some(value) = feature.properties.get(&self.key) else {
            return false;
        };
        if self.values.is_empty() {
            return true;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.values.iter().any(|v| *v == text)
    }
}

/// Project `[lon, lat]` pairs into terrain pixels, rejecting non-finite or
/// out-of-range coordinates.
pub fn project_coordinates(coords: &[[f64; 2]], transformer: &CoordinateTransformer) -> Result<Vec<Point>> {
    coords
        .iter()
        .map(|&[lon, lat]| {
            if !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
                return Err(TerrainError::geometry(format!("invalid coordinate ({}, {})", lon, lat)));
            }
            transformer.geo_to_pixel(lat, lon)
        })
        .collect()
}

/// Clip a segment to the rectangle `[0, max_x] x [0, max_y]` (Liang-Barsky).
fn clip_segment(a: Point, b: Point, max_x: f32, max_y: f32) -> Option<(Point, Point)> {
    let d = b - a;
    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    let checks = [(-d.x, a.x), (d.x, max_x - a.x), (-d.y, a.y), (d.y, max_y - a.y)];
    for (p, q) in checks {
        if p.abs() < 1e-12 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((a + d * t0, a + d * t1))
}

/// Split a polyline into the runs that fall inside the terrain.
pub fn clip_polyline(points: &[Point], width: usize, height: usize) -> Vec<Vec<Point>> {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let mut runs: Vec<Vec<Point>> = Vec::new();
    let mut current: Vec<Point> = Vec::new();

    for w in points.windows(2) {
        match clip_segment(w[0], w[1], max_x, max_y) {
            Some((s, e)) => {
                let continues = current.last().map_or(false, |last| last.distance(s) < 1e-3);
                if !continues {
                    if current.len() >= 2 {
                        runs.push(std::mem::take(&mut current));
                    }
                    current.clear();
                    current.push(s);
                }
                if current.last().map_or(true, |last| last.distance(e) > 1e-6) {
                    current.push(e);
                }
            }
            None => {
                if current.len() >= 2 {
                    runs.push(std::mem::take(&mut current));
                }
                current.clear();
            }
        }
    }
    if current.len() >= 2 {
        runs.push(current);
    }
    runs
}

/// Convert matching line features into pixel-space paths.
///
/// Malformed features are skipped with a warning; geometry entirely outside
/// the terrain is dropped silently.
pub fn vectorize_lines(
    collection: &FeatureCollection,
    filter: &FeatureFilter,
    transformer: &CoordinateTransformer,
    width: usize,
    height: usize,
    log: &mut DiagnosticLog,
) -> Vec<OrderedPath> {
    let mut paths = Vec::new();
    let mut outside = 0usize;

    for (i, feature) in collection.features.iter().enumerate() {
        if !filter.matches(feature) {
            continue;
        }
        let FeatureGeometry::LineString(coords) = &feature.geometry else {
            continue;
        };
        if coords.len() < 2 {
            log.warn(SOURCE, format!("feature {} has fewer than two coordinates, skipped", i));
            continue;
        }
        let projected = match project_coordinates(coords, transformer) {
            Ok(p) => p,
            Err(e) => {
                log.warn(SOURCE, format!("feature {} skipped: {}", i, e));
                continue;
            }
        };
        let runs = clip_polyline(&projected, width, height);
        if runs.is_empty() {
            outside += 1;
            continue;
        }
        paths.extend(runs.into_iter().map(OrderedPath::new));
    }

    if outside > 0 {
        log::debug!("{} line features fell entirely outside the terrain", outside);
    }
    paths
}

/// Rasterize matching area features into a greyscale mask (255 = covered).
///
/// Polygons are filled with the even-odd rule across all rings. Line features
/// are buffered to `line_width_px` when given, otherwise ignored.
pub fn rasterize_areas(
    collection: &FeatureCollection,
    filter: &FeatureFilter,
    transformer: &CoordinateTransformer,
    width: usize,
    height: usize,
    line_width_px: Option<f32>,
    log: &mut DiagnosticLog,
) -> Tilemap<u8> {
    let mut mask = Tilemap::new_with(width, height, 0u8);
    let mut lines = Vec::new();

    for (i, feature) in collection.features.iter().enumerate() {
        if !filter.matches(feature) {
            continue;
        }
        match &feature.geometry {
            FeatureGeometry::Polygon(rings) => {
                let mut projected = Vec::with_capacity(rings.len());
                let mut valid = true;
                for ring in rings {
                    if ring.len() < 3 {
                        log.warn(SOURCE, format!("polygon {} has a degenerate ring, skipped", i));
                        valid = false;
                        break;
                    }
                    match project_coordinates(ring, transformer) {
                        Ok(p) => projected.push(p),
                        Err(e) => {
                            log.warn(SOURCE, format!("polygon {} skipped: {}", i, e));
                            valid = false;
                            break;
                        }
                    }
                }
                if valid && !projected.is_empty() {
                    fill_polygon(&mut mask, &projected);
                }
            }
            FeatureGeometry::LineString(coords) => {
                if line_width_px.is_none() || coords.len() < 2 {
                    continue;
                }
                match project_coordinates(coords, transformer) {
                    Ok(p) => lines.extend(clip_polyline(&p, width, height).into_iter().map(OrderedPath::new)),
                    Err(e) => log.warn(SOURCE, format!("feature {} skipped: {}", i, e)),
                }
            }
        }
    }

    if let Some(w) = line_width_px {
        let stroke = rasterize_lines(&lines, w, width, height);
        for (a, &b) in mask.data_mut().iter_mut().zip(stroke.data()) {
            *a = (*a).max(b);
        }
    }
    mask
}

/// Even-odd scanline fill at pixel centers.
pub fn fill_polygon(mask: &mut Tilemap<u8>, rings: &[Vec<Point>]) {
    let min_y = rings.iter().flatten().map(|p| p.y).fold(f32::MAX, f32::min);
    let max_y = rings.iter().flatten().map(|p| p.y).fold(f32::MIN, f32::max);
    if !min_y.is_finite() || !max_y.is_finite() {
        return;
    }
    let y_start = min_y.ceil().max(0.0) as usize;
    let y_end = (max_y.floor() as i64).min(mask.height as i64 - 1);
    if y_end < 0 {
        return;
    }

    let mut crossings: Vec<f32> = Vec::new();
    for y in y_start..=y_end as usize {
        let yc = y as f32;
        crossings.clear();
        for ring in rings {
            let n = ring.len();
            for i in 0..n {
                let a = ring[i];
                let b = ring[(i + 1) % n];
                if (a.y <= yc && yc < b.y) || (b.y <= yc && yc < a.y) {
                    crossings.push(a.x + (yc - a.y) / (b.y - a.y) * (b.x - a.x));
                }
            }
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for pair in crossings.chunks_exact(2) {
            let x0 = pair[0].ceil().max(0.0) as i64;
            let x1 = (pair[1].floor() as i64).min(mask.width as i64 - 1);
            for x in x0..=x1 {
                mask.set(x as usize, y, 255);
            }
        }
    }
}

/// Stroke paths with a given total width into a mask.
pub fn rasterize_lines(paths: &[OrderedPath], width_px: f32, width: usize, height: usize) -> Tilemap<u8> {
    let mut mask = Tilemap::new_with(width, height, 0u8);
    let half = (width_px * 0.5).max(0.5);
    for path in paths {
        for seg in path.points.windows(2) {
            let (a, b) = (seg[0], seg[1]);
            let x0 = ((a.x.min(b.x) - half).floor().max(0.0)) as usize;
            let y0 = ((a.y.min(b.y) - half).floor().max(0.0)) as usize;
            let x1 = ((a.x.max(b.x) + half).ceil() as i64).min(width as i64 - 1);
            let y1 = ((a.y.max(b.y) + half).ceil() as i64).min(height as i64 - 1);
            if x1 < 0 || y1 < 0 {
                continue;
            }
            for y in y0..=y1 as usize {
                for x in x0..=x1 as usize {
                    if distance_to_segment(Point::from_pixel(x, y), a, b) <= half {
                        mask.set(x, y, 255);
                    }
                }
            }
        }
    }
    mask
}

/// Threshold a greyscale layer mask.
pub fn binarize(mask: &Tilemap<u8>, threshold: u8) -> Tilemap<bool> {
    mask.map(|&v| v >= threshold && v > 0)
}
