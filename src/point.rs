//! Pixel-space 2D point used throughout path extraction and spline fitting.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A point in terrain pixel space (x = column, y = row, fractional).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn from_pixel(x: usize, y: usize) -> Self {
        Self::new(x as f32, y as f32)
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(self, other: Point) -> f32 {
        (self - other).length()
    }

    pub fn distance_sq(self, other: Point) -> f32 {
        let d = self - other;
        d.x * d.x + d.y * d.y
    }

    pub fn dot(self, other: Point) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Unit vector, or `fallback` for near-zero vectors.
    pub fn normalized_or(self, fallback: Point) -> Point {
        let len = self.length();
        if len > 1e-6 {
            Point::new(self.x / len, self.y / len)
        } else {
            fallback
        }
    }

    /// Left-hand perpendicular.
    pub fn perpendicular(self) -> Point {
        Point::new(-self.y, self.x)
    }

    pub fn lerp(self, other: Point, t: f32) -> Point {
        self + (other - self) * t
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Nearest integer pixel, if non-negative.
    pub fn to_pixel(self) -> Option<(usize, usize)> {
        let x = self.x.round();
        let y = self.y.round();
        if x < 0.0 || y < 0.0 || !self.is_finite() {
            return None;
        }
        Some((x as usize, y as usize))
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Point {
    type Output = Point;
    fn mul(self, rhs: f32) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

/// Distance from `p` to the segment `a`-`b`.
pub fn distance_to_segment(p: Point, a: Point, b: Point) -> f32 {
    let ab = b - a;
    let len_sq = ab.dot(ab);
    if len_sq < 1e-12 {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

/// Total length of a polyline.
pub fn polyline_length(points: &[Point]) -> f32 {
    points.windows(2).map(|w| w[0].distance(w[1])).sum()
}
