//! Blend kernels mapping a normalized falloff distance to a weight.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendFunction {
    Linear,
    #[default]
    Cosine,
    SmoothStep,
    SmootherStep,
    Quadratic,
}

impl BlendFunction {
    pub fn all() -> &'static [Self] {
        &[Self::Linear, Self::Cosine, Self::SmoothStep, Self::SmootherStep, Self::Quadratic]
    }

    /// Weight for a normalized distance `t` into the falloff band.
    /// 1.0 at `t <= 0`, 0.0 at `t >= 1`, monotonically non-increasing between.
    pub fn weight(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => 1.0 - t,
            Self::Cosine => 0.5 * (1.0 + (t * std::f32::consts::PI).cos()),
            Self::SmoothStep => 1.0 - t * t * (3.0 - 2.0 * t),
            Self::SmootherStep => 1.0 - t * t * t * (t * (t * 6.0 - 15.0) + 10.0),
            Self::Quadratic => (1.0 - t) * (1.0 - t),
        }
    }
}

impl std::fmt::Display for BlendFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Cosine => write!(f, "cosine"),
            Self::SmoothStep => write!(f, "smoothstep"),
            Self::SmootherStep => write!(f, "smootherstep"),
            Self::Quadratic => write!(f, "quadratic"),
        }
    }
}

/// Lateral road weight: full inside the road half-width, blended over the
/// affected range, zero beyond.
pub fn lateral_weight(blend: BlendFunction, distance: f32, half_width: f32, falloff: f32) -> f32 {
    if distance <= half_width {
        return 1.0;
    }
    if falloff <= 0.0 {
        return 0.0;
    }
    let t = (distance - half_width) / falloff;
    if t >= 1.0 {
        0.0
    } else {
        blend.weight(t)
    }
}
