//! Elevation profile smoothing along road paths.
//!
//! A profile is the terrain elevation sampled at each spline resample. It is
//! low-passed (moving window or zero-phase Butterworth), optionally leveled
//! toward its mean, and optionally grade-limited.

use serde::{Deserialize, Serialize};

use crate::diagnostics::{DiagnosticLog, ValidationWarning, WarningKind};
use crate::error::{Result, TerrainError};
use crate::params::{odd_window, ProfileFilter, ProfileFilterKind, RoadSmoothingParameters};
use crate::spline::SplineSample;
use crate::tilemap::Heightmap;

const SOURCE: &str = "smoothing";

/// Raw and smoothed elevations for one path, one value per spline sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElevationProfile {
    pub raw: Vec<f32>,
    pub target: Vec<f32>,
}

/// Bilinearly sample terrain elevation under each spline sample.
pub fn sample_profile(heightmap: &Heightmap, samples: &[SplineSample]) -> Vec<f32> {
    samples
        .iter()
        .map(|s| heightmap.sample_bilinear(s.position.x, s.position.y))
        .collect()
}

// =============================================================================
// BOX FILTER
// =============================================================================

/// Symmetric moving average with edge clamping. `window` should be odd.
pub fn box_filter(values: &[f32], window: usize) -> Vec<f32> {
    let n = values.len();
    if n == 0 || window <= 1 {
        return values.to_vec();
    }
    let half = (window / 2) as i64;
    let clamped = |i: i64| values[i.clamp(0, n as i64 - 1) as usize];

    let mut out = Vec::with_capacity(n);
    let mut sum: f32 = (-half..=half).map(clamped).sum();
    let count = (2 * half + 1) as f32;
    for i in 0..n as i64 {
        out.push(sum / count);
        sum += clamped(i + half + 1) - clamped(i - half);
    }
    out
}

// =============================================================================
// BUTTERWORTH
// =============================================================================

/// One second-order section, transposed direct form II.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    /// Filter `x` in place, starting from the steady state for `x[0]`.
    fn run(&self, x: &mut [f64]) {
        let Some(&x0) = x.first() else { return };
        let mut z2 = (self.b2 - self.a2) * x0;
        let mut z1 = (self.b1 - self.a1) * x0 + z2;
        for v in x.iter_mut() {
            let input = *v;
            let y = self.b0 * input + z1;
            z1 = self.b1 * input - self.a1 * y + z2;
            z2 = self.b2 * input - self.a2 * y;
            *v = y;
        }
    }

    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }
}

/// Digital Butterworth low-pass built from cascaded sections via the
/// bilinear transform with frequency pre-warping.
#[derive(Clone, Debug, PartialEq)]
pub struct ButterworthFilter {
    order: u32,
    sections: Vec<Biquad>,
}

impl ButterworthFilter {
    /// `cutoff` is a fraction of the Nyquist frequency, strictly in (0, 1).
    pub fn low_pass(order: u32, cutoff: f32) -> Result<Self> {
        if order == 0 {
            return Err(TerrainError::parameter("Butterworth order must be at least 1"));
        }
        if !(cutoff > 0.0 && cutoff < 1.0) {
            return Err(TerrainError::parameter(format!(
                "Butterworth cutoff {} must be between 0 and 1 (fraction of Nyquist)",
                cutoff
            )));
        }
        let k = (std::f64::consts::PI * cutoff as f64 / 2.0).tan();
        let k2 = k * k;
        let n = order as f64;
        let mut sections = Vec::with_capacity(order as usize / 2 + 1);

        for i in 0..order / 2 {
            let alpha = 2.0 * ((2 * i + 1) as f64 * std::f64::consts::PI / (2.0 * n)).sin();
            let norm = 1.0 / (1.0 + alpha * k + k2);
            let b0 = k2 * norm;
            sections.push(Biquad {
                b0,
                b1: 2.0 * b0,
                b2: b0,
                a1: 2.0 * (k2 - 1.0) * norm,
                a2: (1.0 - alpha * k + k2) * norm,
            });
        }
        if order % 2 == 1 {
            let b0 = k / (1.0 + k);
            sections.push(Biquad {
                b0,
                b1: b0,
                b2: 0.0,
                a1: (k - 1.0) / (1.0 + k),
                a2: 0.0,
            });
        }
        Ok(Self { order, sections })
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Forward-backward (zero-phase) filtering with odd reflection padding.
    pub fn filtfilt(&self, values: &[f32]) -> Vec<f32> {
        let n = values.len();
        if n < 2 {
            return values.to_vec();
        }
        let pad = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let first = values[0] as f64;
        let last = values[n - 1] as f64;

        let mut x: Vec<f64> = Vec::with_capacity(n + 2 * pad);
        x.extend((1..=pad).rev().map(|i| 2.0 * first - values[i] as f64));
        x.extend(values.iter().map(|&v| v as f64));
        x.extend((1..=pad).map(|i| 2.0 * last - values[n - 1 - i] as f64));

        for s in &self.sections {
            s.run(&mut x);
        }
        x.reverse();
        for s in &self.sections {
            s.run(&mut x);
        }
        x.reverse();
        x[pad..pad + n].iter().map(|&v| v as f32).collect()
    }
}

// =============================================================================
// PROFILE ADJUSTMENTS
// =============================================================================

/// Blend each value toward the profile mean by `strength` (0 = untouched,
/// 1 = perfectly level).
pub fn apply_leveling(values: &mut [f32], strength: f32) {
    let strength = strength.clamp(0.0, 1.0);
    if values.is_empty() || strength <= 0.0 {
        return;
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
    let mean = mean as f32;
    for v in values.iter_mut() {
        *v += (mean - *v) * strength;
    }
}

/// Limit the change between consecutive values to `max_delta`, forward then
/// backward so neither end is favoured.
pub fn clamp_slope(values: &mut [f32], max_delta: f32) {
    if values.len() < 2 || !(max_delta >= 0.0) {
        return;
    }
    for i in 1..values.len() {
        let prev = values[i - 1];
        values[i] = values[i].clamp(prev - max_delta, prev + max_delta);
    }
    for i in (0..values.len() - 1).rev() {
        let next = values[i + 1];
        values[i] = values[i].clamp(next - max_delta, next + max_delta);
    }
}

/// Per-material smoother with its filter window already validated.
#[derive(Clone, Debug)]
pub struct ProfileSmoother {
    filter: Option<ProfileKernel>,
    leveling: f32,
    max_slope_tan: Option<f32>,
}

#[derive(Clone, Debug)]
enum ProfileKernel {
    Box(usize),
    Butterworth(ButterworthFilter),
}

impl ProfileSmoother {
    /// Builds the smoother for one material. Even box windows are bumped to
    /// the next odd size with a warning.
    pub fn new(params: &RoadSmoothingParameters, log: &mut DiagnosticLog) -> Result<Self> {
        let filter = if params.filter.enabled {
            Some(Self::kernel(&params.filter, log)?)
        } else {
            None
        };
        let max_slope_tan = params
            .enable_max_slope
            .then(|| params.road_max_slope_degrees.clamp(0.0, 89.0).to_radians().tan());
        Ok(Self {
            filter,
            leveling: params.global_leveling_strength,
            max_slope_tan,
        })
    }

    fn kernel(filter: &ProfileFilter, log: &mut DiagnosticLog) -> Result<ProfileKernel> {
        match filter.kind {
            ProfileFilterKind::Box => {
                let (window, corrected) = odd_window(filter.window_size);
                if corrected {
                    log.advisory(
                        SOURCE,
                        &ValidationWarning::new(
                            WarningKind::EvenWindowSize,
                            format!("profile window {} is even, using {}", filter.window_size, window),
                            "use an odd window size",
                        ),
                    );
                }
                Ok(ProfileKernel::Box(window))
            }
            ProfileFilterKind::Butterworth => Ok(ProfileKernel::Butterworth(ButterworthFilter::low_pass(
                filter.butterworth_order,
                filter.butterworth_cutoff,
            )?)),
        }
    }

    /// Smooth a raw profile. `spacing_m` is the ground distance between
    /// consecutive samples, used for the grade limit.
    pub fn smooth(&self, raw: &[f32], spacing_m: f32) -> ElevationProfile {
        let mut target = match &self.filter {
            Some(ProfileKernel::Box(w)) => box_filter(raw, *w),
            Some(ProfileKernel::Butterworth(f)) => f.filtfilt(raw),
            None => raw.to_vec(),
        };
        apply_leveling(&mut target, self.leveling);
        if let Some(tan) = self.max_slope_tan {
            clamp_slope(&mut target, tan * spacing_m.max(0.0));
        }
        ElevationProfile {
            raw: raw.to_vec(),
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_ramp(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| i as f32 * 0.5 + if i % 2 == 0 { 2.0 } else { -2.0 })
            .collect()
    }

    #[test]
    fn test_box_filter_constant_and_length() {
        let flat = vec![7.0; 20];
        assert_eq!(box_filter(&flat, 5), flat);
        let out = box_filter(&noisy_ramp(40), 5);
        assert_eq!(out.len(), 40);
    }

    #[test]
    fn test_box_window_validation() {
        for size in [3usize, 5, 7, 11] {
            assert_eq!(odd_window(size), (size, false));
        }
        let params = RoadSmoothingParameters {
            filter: ProfileFilter {
                kind: ProfileFilterKind::Box,
                window_size: 6,
                ..ProfileFilter::default()
            },
            ..RoadSmoothingParameters::default()
        };
        let mut log = DiagnosticLog::new();
        let smoother = ProfileSmoother::new(&params, &mut log).unwrap();
        assert!(matches!(smoother.filter, Some(ProfileKernel::Box(7))));
        assert_eq!(log.warning_count(), 1);
    }

    #[test]
    fn test_butterworth_unity_dc_gain() {
        for order in 1..=8 {
            let f = ButterworthFilter::low_pass(order, 0.1).unwrap();
            assert_eq!(f.sections().len(), (order as usize + 1) / 2);
            for s in f.sections() {
                assert!((s.dc_gain() - 1.0).abs() < 1e-9);
            }
            let flat = vec![42.0f32; 64];
            for v in f.filtfilt(&flat) {
                assert!((v - 42.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_butterworth_attenuates_alternating_noise() {
        let f = ButterworthFilter::low_pass(4, 0.08).unwrap();
        let raw = noisy_ramp(200);
        let smooth = f.filtfilt(&raw);
        // Away from the ends the output follows the underlying ramp
        for i in 50..150 {
            assert!((smooth[i] - i as f32 * 0.5).abs() < 0.25, "sample {i}: {}", smooth[i]);
        }
    }

    #[test]
    fn test_butterworth_zero_phase() {
        // A symmetric bump stays centred after forward-backward filtering
        let raw: Vec<f32> = (0..101).map(|i| if (45..=55).contains(&i) { 10.0 } else { 0.0 }).collect();
        let f = ButterworthFilter::low_pass(2, 0.1).unwrap();
        let out = f.filtfilt(&raw);
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!((peak as i64 - 50).abs() <= 1);
    }

    #[test]
    fn test_invalid_butterworth() {
        assert!(ButterworthFilter::low_pass(0, 0.1).is_err());
        assert!(ButterworthFilter::low_pass(4, 1.0).is_err());
        assert!(ButterworthFilter::low_pass(4, 0.0).is_err());
    }

    #[test]
    fn test_leveling_is_linear_toward_mean() {
        let mut v = vec![0.0, 10.0, 20.0];
        apply_leveling(&mut v, 0.5);
        assert_eq!(v, vec![5.0, 10.0, 15.0]);
        apply_leveling(&mut v, 1.0);
        assert_eq!(v, vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_clamp_slope() {
        let mut v = vec![0.0, 0.0, 10.0, 10.0, 0.0];
        clamp_slope(&mut v, 2.0);
        for w in v.windows(2) {
            assert!((w[1] - w[0]).abs() <= 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_smoother_applies_slope_limit() {
        let params = RoadSmoothingParameters {
            enable_max_slope: true,
            road_max_slope_degrees: 45.0,
            filter: ProfileFilter {
                enabled: false,
                ..ProfileFilter::default()
            },
            ..RoadSmoothingParameters::default()
        };
        let mut log = DiagnosticLog::new();
        let smoother = ProfileSmoother::new(&params, &mut log).unwrap();
        let profile = smoother.smooth(&[0.0, 5.0, 10.0], 1.0);
        assert_eq!(profile.raw, vec![0.0, 5.0, 10.0]);
        for w in profile.target.windows(2) {
            assert!((w[1] - w[0]).abs() <= 1.0 + 1e-5);
        }
    }
}
