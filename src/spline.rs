//! Kochanek–Bartels (TCB) spline fitting with arc-length resampling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::SplineParameters;
use crate::paths::OrderedPath;
use crate::point::{distance_to_segment, polyline_length, Point};

/// Arc-length table subdivisions per spline segment
const LUT_STEPS: usize = 16;

/// Why a path could not be turned into a spline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SplineRejection {
    #[error("fewer than two distinct points after simplification")]
    TooFewPoints,
    #[error("path length {length:.1}px is below the minimum {min:.1}px")]
    TooShort { length: f32, min: f32 },
}

/// One arc-length resample of a fitted spline.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplineSample {
    pub position: Point,
    /// Unit direction of travel
    pub tangent: Point,
    /// Arc length from the start (pixels)
    pub distance: f32,
}

#[derive(Clone, Copy, Debug)]
struct ArcEntry {
    s: f32,
    segment: usize,
    t: f32,
}

/// Interpolating TCB spline through a fixed set of knots.
#[derive(Clone, Debug)]
pub struct TcbSpline {
    knots: Vec<Point>,
    /// (incoming, outgoing) tangent per knot
    tangents: Vec<(Point, Point)>,
    lut: Vec<ArcEntry>,
    knot_arc: Vec<f32>,
}

impl TcbSpline {
    /// Fit through `knots` (at least two, consecutive duplicates removed).
    pub fn new(knots: Vec<Point>, tension: f32, continuity: f32, bias: f32) -> Result<Self, SplineRejection> {
        let knots = dedup(&knots);
        if knots.len() < 2 {
            return Err(SplineRejection::TooFewPoints);
        }
        let tangents = compute_tangents(&knots, tension, continuity, bias);
        let mut spline = Self {
            knots,
            tangents,
            lut: Vec::new(),
            knot_arc: Vec::new(),
        };
        spline.build_lut();
        Ok(spline)
    }

    pub fn knots(&self) -> &[Point] {
        &self.knots
    }

    /// Arc length at each knot.
    pub fn knot_arc_lengths(&self) -> &[f32] {
        &self.knot_arc
    }

    pub fn length(&self) -> f32 {
        self.lut.last().map_or(0.0, |e| e.s)
    }

    fn segments(&self) -> usize {
        self.knots.len() - 1
    }

    /// Evaluate segment `i` at local parameter `t` in [0, 1].
    fn evaluate(&self, i: usize, t: f32) -> Point {
        let (p0, p1) = (self.knots[i], self.knots[i + 1]);
        let d0 = self.tangents[i].1;
        let d1 = self.tangents[i + 1].0;
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        p0 * h00 + d0 * h10 + p1 * h01 + d1 * h11
    }

    fn derivative(&self, i: usize, t: f32) -> Point {
        let (p0, p1) = (self.knots[i], self.knots[i + 1]);
        let d0 = self.tangents[i].1;
        let d1 = self.tangents[i + 1].0;
        let t2 = t * t;
        let dh00 = 6.0 * t2 - 6.0 * t;
        let dh10 = 3.0 * t2 - 4.0 * t + 1.0;
        let dh01 = -6.0 * t2 + 6.0 * t;
        let dh11 = 3.0 * t2 - 2.0 * t;
        p0 * dh00 + d0 * dh10 + p1 * dh01 + d1 * dh11
    }

    fn build_lut(&mut self) {
        let mut lut = Vec::with_capacity(self.segments() * LUT_STEPS + 1);
        let mut knot_arc = Vec::with_capacity(self.knots.len());
        let mut s = 0.0f32;
        for seg in 0..self.segments() {
            knot_arc.push(s);
            let mut prev = self.evaluate(seg, 0.0);
            lut.push(ArcEntry { s, segment: seg, t: 0.0 });
            for step in 1..LUT_STEPS {
                let t = step as f32 / LUT_STEPS as f32;
                let p = self.evaluate(seg, t);
                s += p.distance(prev);
                prev = p;
                lut.push(ArcEntry { s, segment: seg, t });
            }
            s += self.knots[seg + 1].distance(prev);
        }
        knot_arc.push(s);
        lut.push(ArcEntry {
            s,
            segment: self.segments() - 1,
            t: 1.0,
        });
        self.lut = lut;
        self.knot_arc = knot_arc;
    }

    /// Map an arc length to (segment, local t).
    fn locate(&self, s: f32) -> (usize, f32) {
        let s = s.clamp(0.0, self.length());
        let idx = self.lut.partition_point(|e| e.s <= s);
        if idx == 0 {
            return (0, 0.0);
        }
        if idx >= self.lut.len() {
            let last = self.lut[self.lut.len() - 1];
            return (last.segment, last.t);
        }
        let a = self.lut[idx - 1];
        let b = self.lut[idx];
        if (s - a.s).abs() < f32::EPSILON {
            return (a.segment, a.t);
        }
        let b_t = if b.segment == a.segment { b.t } else { 1.0 };
        let span = b.s - a.s;
        let f = if span > 0.0 { (s - a.s) / span } else { 0.0 };
        (a.segment, a.t + (b_t - a.t) * f)
    }

    /// Position at arc length `s` (clamped to the curve).
    pub fn point_at(&self, s: f32) -> Point {
        let (seg, t) = self.locate(s);
        self.evaluate(seg, t)
    }

    /// Unit tangent at arc length `s`.
    pub fn tangent_at(&self, s: f32) -> Point {
        let (seg, t) = self.locate(s);
        let chord = self.knots[seg + 1] - self.knots[seg];
        self.derivative(seg, t).normalized_or(chord.normalized_or(Point::new(1.0, 0.0)))
    }

    /// Samples every `interval` pixels of arc length, always including both
    /// ends.
    pub fn resample(&self, interval: f32) -> Vec<SplineSample> {
        let length = self.length();
        let interval = if interval > 0.0 { interval } else { length.max(1.0) };
        let mut distances = Vec::new();
        let mut s = 0.0;
        while s < length {
            distances.push(s);
            s += interval;
        }
        if distances.last().map_or(true, |&d| length - d > 1e-3) {
            distances.push(length);
        }
        distances
            .into_iter()
            .map(|distance| SplineSample {
                position: self.point_at(distance),
                tangent: self.tangent_at(distance),
                distance,
            })
            .collect()
    }
}

fn dedup(points: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for &p in points {
        if !p.is_finite() {
            continue;
        }
        if out.last().map_or(true, |last| last.distance(p) > 1e-4) {
            out.push(p);
        }
    }
    out
}

/// Kochanek–Bartels tangents with chord-length spacing correction and
/// mirrored phantom knots at both ends.
fn compute_tangents(knots: &[Point], tension: f32, continuity: f32, bias: f32) -> Vec<(Point, Point)> {
    let n = knots.len();
    let (t, c, b) = (tension, continuity, bias);
    let out_a = (1.0 - t) * (1.0 + b) * (1.0 + c) * 0.5;
    let out_b = (1.0 - t) * (1.0 - b) * (1.0 - c) * 0.5;
    let in_a = (1.0 - t) * (1.0 + b) * (1.0 - c) * 0.5;
    let in_b = (1.0 - t) * (1.0 - b) * (1.0 + c) * 0.5;

    (0..n)
        .map(|i| {
            let p = knots[i];
            let prev = if i > 0 { knots[i - 1] } else { p * 2.0 - knots[1] };
            let next = if i + 1 < n { knots[i + 1] } else { p * 2.0 - knots[n - 2] };
            let d_prev = p - prev;
            let d_next = next - p;

            let outgoing = d_prev * out_a + d_next * out_b;
            let incoming = d_prev * in_a + d_next * in_b;

            let len_prev = d_prev.length();
            let len_next = d_next.length();
            let sum = len_prev + len_next;
            if sum > 0.0 {
                (incoming * (2.0 * len_prev / sum), outgoing * (2.0 * len_next / sum))
            } else {
                (incoming, outgoing)
            }
        })
        .collect()
}

/// Insert points so no segment is longer than `max_spacing`.
pub fn densify(points: &[Point], max_spacing: f32) -> Vec<Point> {
    if points.len() < 2 || max_spacing <= 0.0 {
        return points.to_vec();
    }
    let mut out = Vec::with_capacity(points.len());
    out.push(points[0]);
    for w in points.windows(2) {
        let len = w[0].distance(w[1]);
        let steps = (len / max_spacing).ceil().max(1.0) as usize;
        for k in 1..=steps {
            out.push(w[0].lerp(w[1], k as f32 / steps as f32));
        }
    }
    out
}

/// Ramer–Douglas–Peucker simplification.
pub fn simplify(points: &[Point], tolerance: f32) -> Vec<Point> {
    if points.len() <= 2 || tolerance <= 0.0 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let (a, b) = (points[start], points[end]);
        let (index, dist) = (start + 1..end)
            .map(|i| (i, distance_to_segment(points[i], a, b)))
            .fold((start, 0.0f32), |best, cur| if cur.1 > best.1 { cur } else { best });
        if dist > tolerance {
            keep[index] = true;
            stack.push((start, index));
            stack.push((index, end));
        }
    }
    points.iter().zip(keep).filter(|(_, k)| *k).map(|(p, _)| *p).collect()
}

/// Prepared knots plus the fitted curve for one path.
#[derive(Clone, Debug)]
pub struct FittedSpline {
    pub spline: TcbSpline,
    pub samples: Vec<SplineSample>,
}

/// Simplify, densify, and fit a TCB spline to `path`, resampled every
/// `interval_px`.
pub fn fit_path(path: &OrderedPath, params: &SplineParameters, interval_px: f32) -> Result<FittedSpline, SplineRejection> {
    let cleaned = dedup(&path.points);
    let simplified = simplify(&cleaned, params.simplify_tolerance_px);
    if simplified.len() < 2 {
        return Err(SplineRejection::TooFewPoints);
    }
    let length = polyline_length(&simplified);
    if length < params.min_path_length_px {
        return Err(SplineRejection::TooShort {
            length,
            min: params.min_path_length_px,
        });
    }
    let knots = densify(&simplified, params.densify_max_spacing_px);
    let spline = TcbSpline::new(knots, params.tension, params.continuity, params.bias)?;
    let samples = spline.resample(interval_px);
    Ok(FittedSpline { spline, samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wavy_path() -> OrderedPath {
        OrderedPath::new(
            (0..60)
                .map(|i| {
                    let x = i as f32;
                    Point::new(x, 20.0 + 6.0 * (x * 0.1).sin())
                })
                .collect(),
        )
    }

    #[test]
    fn test_interpolates_knots_at_their_arc_lengths() {
        let params = SplineParameters::default();
        let fitted = fit_path(&wavy_path(), &params, 1.0).unwrap();
        let spline = &fitted.spline;
        for (knot, &s) in spline.knots().iter().zip(spline.knot_arc_lengths()) {
            let p = spline.point_at(s);
            assert!(p.distance(*knot) <= params.simplify_tolerance_px, "knot {:?} vs {:?}", knot, p);
        }
    }

    #[test]
    fn test_knots_stay_within_tolerance_of_input() {
        let params = SplineParameters::default();
        let path = wavy_path();
        let fitted = fit_path(&path, &params, 1.0).unwrap();
        for knot in fitted.spline.knots() {
            let d = path
                .points
                .windows(2)
                .map(|w| distance_to_segment(*knot, w[0], w[1]))
                .fold(f32::MAX, f32::min);
            assert!(d <= params.simplify_tolerance_px + 1e-4);
        }
    }

    #[test]
    fn test_straight_line_resample_spacing() {
        let spline = TcbSpline::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(20.0, 0.0)], 0.0, 0.0, 0.0).unwrap();
        assert!((spline.length() - 20.0).abs() < 1e-3);
        let samples = spline.resample(2.5);
        assert_eq!(samples.len(), 9);
        for (i, s) in samples.iter().enumerate() {
            assert!((s.position.x - i as f32 * 2.5).abs() < 1e-2);
            assert!(s.position.y.abs() < 1e-4);
            assert!((s.tangent.x - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rejects_degenerate() {
        let params = SplineParameters::default();
        let same = OrderedPath::new(vec![Point::new(3.0, 3.0); 5]);
        assert_eq!(fit_path(&same, &params, 1.0).unwrap_err(), SplineRejection::TooFewPoints);

        let short = OrderedPath::new(vec![Point::new(0.0, 0.0), Point::new(2.0, 0.0)]);
        assert!(matches!(fit_path(&short, &params, 1.0), Err(SplineRejection::TooShort { .. })));
    }

    #[test]
    fn test_tension_tightens_curve() {
        let knots = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0), Point::new(20.0, 0.0)];
        let loose = TcbSpline::new(knots.clone(), 0.0, 0.0, 0.0).unwrap();
        let tight = TcbSpline::new(knots, 0.9, 0.0, 0.0).unwrap();
        // Higher tension approaches the control polygon, whose length is 2·√200
        let polygon = 2.0 * 200f32.sqrt();
        assert!((tight.length() - polygon).abs() < (loose.length() - polygon).abs());
    }

    #[test]
    fn test_simplify_and_densify() {
        let pts: Vec<Point> = (0..11).map(|i| Point::new(i as f32, if i % 2 == 0 { 0.0 } else { 0.2 })).collect();
        let simple = simplify(&pts, 0.5);
        assert_eq!(simple.len(), 2);
        let dense = densify(&simple, 2.0);
        assert_eq!(dense.len(), 6);
        assert!(dense.windows(2).all(|w| w[0].distance(w[1]) <= 2.0 + 1e-5));
    }
}
