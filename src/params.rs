//! Road smoothing parameters and pre-generation validation.
//!
//! Distances ending in `_m` are meters and are converted to pixels with the
//! terrain's meters-per-pixel; `_px` fields are already in pixel space.

use serde::{Deserialize, Serialize};

use crate::blend::BlendFunction;
use crate::diagnostics::{ValidationWarning, WarningKind};

/// Leveling strength above which a narrow affected range risks dotted roads.
pub const DISCONNECTED_LEVELING_THRESHOLD: f32 = 0.5;
/// Affected range (meters) below which strong leveling is flagged.
pub const DISCONNECTED_RANGE_THRESHOLD: f32 = 15.0;
/// Butterworth orders above this are accepted but flagged.
pub const MAX_ADVISED_FILTER_ORDER: u32 = 6;
const STEEP_SLOPE_DEGREES: f32 = 30.0;
const NARROW_ROAD_METERS: f32 = 2.0;

/// How a road material turns its layer into elevation corrections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoadApproach {
    /// Skeletonize, order paths, fit splines, stamp cross-sections
    #[default]
    Spline,
    /// Flatten the painted mask directly using a distance field
    DirectMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProfileFilterKind {
    /// Symmetric moving average
    Box,
    /// Zero-phase IIR low-pass
    #[default]
    Butterworth,
}

/// 1D filter applied to the elevation profile sampled along each road.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFilter {
    pub enabled: bool,
    pub kind: ProfileFilterKind,
    /// Box window in samples. Must be odd; even sizes are bumped by one.
    pub window_size: usize,
    /// Butterworth order (2-6 typical)
    pub butterworth_order: u32,
    /// Cutoff as a fraction of the Nyquist frequency (0.0-1.0, exclusive)
    pub butterworth_cutoff: f32,
}

impl Default for ProfileFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProfileFilterKind::Butterworth,
            window_size: 11,
            butterworth_order: 4,
            butterworth_cutoff: 0.08,
        }
    }
}

/// Skeleton ordering and spline fitting knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineParameters {
    /// TCB tension (-1.0 to 1.0, 0 = Catmull-Rom)
    pub tension: f32,
    /// TCB continuity (-1.0 to 1.0)
    pub continuity: f32,
    /// TCB bias (-1.0 to 1.0)
    pub bias: f32,
    /// Insert points until consecutive spacing is at most this
    pub densify_max_spacing_px: f32,
    /// Drop points within this distance of the simplified curve
    pub simplify_tolerance_px: f32,
    /// Paths shorter than this are dropped as spurs
    pub min_path_length_px: f32,
    /// Stitch dangling endpoints closer than this
    pub bridge_max_distance_px: f32,
    /// Continue through junctions along the straightest branch
    pub prefer_straight_through_junctions: bool,
    /// Maximum deviation from a straight continuation at a junction
    pub junction_angle_threshold_degrees: f32,
    /// Order independent paths by proximity for stable output
    pub use_graph_ordering: bool,
    pub ordering_neighbor_radius_px: f32,
}

impl Default for SplineParameters {
    fn default() -> Self {
        Self {
            tension: 0.0,
            continuity: 0.0,
            bias: 0.0,
            densify_max_spacing_px: 2.0,
            simplify_tolerance_px: 0.5,
            min_path_length_px: 8.0,
            bridge_max_distance_px: 6.0,
            prefer_straight_through_junctions: true,
            junction_angle_threshold_degrees: 45.0,
            use_graph_ordering: true,
            ordering_neighbor_radius_px: 12.0,
        }
    }
}

/// Junction harmonization and endpoint tapering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JunctionParameters {
    pub enabled: bool,
    /// Paths closer than this are considered to meet
    pub detection_radius_m: f32,
    /// Distance along each path over which the junction elevation is blended in
    pub blend_distance_m: f32,
    pub blend_function: BlendFunction,
    /// Taper dangling road ends back toward the original terrain
    pub endpoint_taper: bool,
    pub endpoint_taper_distance_m: f32,
    /// 0.0 = keep road elevation at the end, 1.0 = fully return to terrain
    pub endpoint_blend_strength: f32,
}

impl Default for JunctionParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            detection_radius_m: 10.0,
            blend_distance_m: 24.0,
            blend_function: BlendFunction::Cosine,
            endpoint_taper: true,
            endpoint_taper_distance_m: 16.0,
            endpoint_blend_strength: 0.5,
        }
    }
}

/// Full configuration bundle for one road material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadSmoothingParameters {
    pub approach: RoadApproach,
    pub road_width_m: f32,
    /// Falloff band on each side of the road surface
    pub terrain_affected_range_m: f32,
    /// Spacing between stamped cross-sections along the road
    pub cross_section_interval_m: f32,
    pub blend_function: BlendFunction,
    /// Clamp grade between consecutive cross-sections
    pub enable_max_slope: bool,
    pub road_max_slope_degrees: f32,
    /// Widen the falloff where the embankment would exceed this grade
    pub side_max_slope_degrees: Option<f32>,
    /// Blend of the smoothed profile toward the path-average elevation (0.0-1.0)
    pub global_leveling_strength: f32,
    pub filter: ProfileFilter,
    pub spline: SplineParameters,
    pub junctions: JunctionParameters,
}

impl Default for RoadSmoothingParameters {
    fn default() -> Self {
        Self {
            approach: RoadApproach::Spline,
            road_width_m: 8.0,
            terrain_affected_range_m: 12.0,
            cross_section_interval_m: 1.0,
            blend_function: BlendFunction::Cosine,
            enable_max_slope: false,
            road_max_slope_degrees: 12.0,
            side_max_slope_degrees: None,
            global_leveling_strength: 0.0,
            filter: ProfileFilter::default(),
            spline: SplineParameters::default(),
            junctions: JunctionParameters::default(),
        }
    }
}

impl RoadSmoothingParameters {
    /// Road half-width plus affected range.
    pub fn impact_radius_m(&self) -> f32 {
        self.road_width_m * 0.5 + self.terrain_affected_range_m
    }

    /// Largest cross-section interval that still avoids gaps between stamps.
    pub fn recommended_max_interval_m(&self) -> f32 {
        self.impact_radius_m() / 3.0
    }

    /// Check risky parameter combinations. Never blocks generation.
    pub fn validate(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        if self.global_leveling_strength > DISCONNECTED_LEVELING_THRESHOLD
            && self.terrain_affected_range_m < DISCONNECTED_RANGE_THRESHOLD
        {
            warnings.push(ValidationWarning::new(
                WarningKind::DisconnectedRoadRisk,
                format!(
                    "global leveling strength {:.2} with terrain affected range {:.1}m can leave visually separated road segments",
                    self.global_leveling_strength, self.terrain_affected_range_m
                ),
                format!(
                    "raise the affected range to at least {:.0}m or lower leveling to {:.1} or less",
                    DISCONNECTED_RANGE_THRESHOLD, DISCONNECTED_LEVELING_THRESHOLD
                ),
            ));
        }

        let max_interval = self.recommended_max_interval_m();
        if self.cross_section_interval_m > max_interval {
            warnings.push(ValidationWarning::new(
                WarningKind::CrossSectionSpacing,
                format!(
                    "cross-section interval {:.2}m exceeds a third of the impact radius ({:.2}m)",
                    self.cross_section_interval_m,
                    self.impact_radius_m()
                ),
                format!("use an interval of at most {:.2}m", max_interval),
            ));
        }

        if self.enable_max_slope && self.road_max_slope_degrees > STEEP_SLOPE_DEGREES {
            warnings.push(ValidationWarning::new(
                WarningKind::SteepSlope,
                format!("maximum road slope {:.1} degrees is steep for a drivable surface", self.road_max_slope_degrees),
                format!("keep road slopes at or below {:.0} degrees", STEEP_SLOPE_DEGREES),
            ));
        }

        if self.road_width_m < NARROW_ROAD_METERS {
            warnings.push(ValidationWarning::new(
                WarningKind::NarrowRoad,
                format!("road width {:.2}m is narrower than a single lane", self.road_width_m),
                format!("use a width of at least {:.0}m", NARROW_ROAD_METERS),
            ));
        }

        if self.filter.enabled {
            match self.filter.kind {
                ProfileFilterKind::Butterworth if self.filter.butterworth_order > MAX_ADVISED_FILTER_ORDER => {
                    warnings.push(ValidationWarning::new(
                        WarningKind::HighFilterOrder,
                        format!(
                            "Butterworth order {} may ring near sharp elevation steps",
                            self.filter.butterworth_order
                        ),
                        format!("use an order between 2 and {}", MAX_ADVISED_FILTER_ORDER),
                    ));
                }
                ProfileFilterKind::Box if self.filter.window_size % 2 == 0 => {
                    warnings.push(even_window_warning("profile box filter", self.filter.window_size));
                }
                _ => {}
            }
        }

        if self.junctions.enabled && self.junctions.blend_distance_m < self.road_width_m {
            warnings.push(ValidationWarning::new(
                WarningKind::JunctionBlendDistance,
                format!(
                    "junction blend distance {:.1}m is shorter than the road width {:.1}m",
                    self.junctions.blend_distance_m, self.road_width_m
                ),
                format!("use a blend distance of at least {:.1}m", self.road_width_m),
            ));
        }

        warnings
    }
}

/// Final smoothing pass over the union of all road-affected pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostFilterKind {
    #[default]
    Gaussian,
    Box,
    Median,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessingParameters {
    pub enabled: bool,
    pub kind: PostFilterKind,
    /// Kernel size in pixels. Must be odd; even sizes are bumped by one.
    pub kernel_size: usize,
    /// Gaussian sigma in pixels
    pub sigma: f32,
    pub iterations: usize,
    /// How far beyond the affected region the smoothing mask extends
    pub mask_extension_m: f32,
}

impl Default for PostProcessingParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: PostFilterKind::Gaussian,
            kernel_size: 5,
            sigma: 1.0,
            iterations: 2,
            mask_extension_m: 4.0,
        }
    }
}

impl PostProcessingParameters {
    /// Checks that depend on a road material's cross-section interval.
    pub fn validate(&self, cross_section_interval_m: f32) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        if !self.enabled {
            return warnings;
        }
        let required = 2.0 * cross_section_interval_m;
        if self.mask_extension_m < required {
            warnings.push(ValidationWarning::new(
                WarningKind::MaskExtensionMargin,
                format!(
                    "post-processing mask extension {:.2}m is below twice the cross-section interval",
                    self.mask_extension_m
                ),
                format!("use a mask extension of at least {:.2}m", required),
            ));
        }
        if self.kernel_size % 2 == 0 {
            warnings.push(even_window_warning("post-processing kernel", self.kernel_size));
        }
        warnings
    }
}

fn even_window_warning(what: &str, size: usize) -> ValidationWarning {
    ValidationWarning::new(
        WarningKind::EvenWindowSize,
        format!("{} size {} is even and will be raised to {}", what, size, size + 1),
        "use an odd window size",
    )
}

/// Symmetric filters need an odd size; even sizes become `size + 1`.
/// Returns the corrected size and whether a correction happened.
pub fn odd_window(size: usize) -> (usize, bool) {
    if size % 2 == 0 {
        (size + 1, true)
    } else {
        (size, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(w: &[ValidationWarning]) -> Vec<WarningKind> {
        w.iter().map(|w| w.kind).collect()
    }

    #[test]
    fn test_defaults_are_clean() {
        let params = RoadSmoothingParameters::default();
        assert!(params.validate().is_empty(), "{:?}", params.validate());
        let post = PostProcessingParameters::default();
        assert!(post.validate(params.cross_section_interval_m).is_empty());
    }

    #[test]
    fn test_disconnected_road_risk() {
        let params = RoadSmoothingParameters {
            global_leveling_strength: 0.8,
            terrain_affected_range_m: 5.0,
            ..Default::default()
        };
        let warnings = params.validate();
        assert!(kinds(&warnings).contains(&WarningKind::DisconnectedRoadRisk));
        assert!(warnings[0].to_string().contains("Disconnected Road Risk"));

        // Strong leveling is fine with a wide falloff
        let wide = RoadSmoothingParameters {
            global_leveling_strength: 0.8,
            terrain_affected_range_m: 20.0,
            ..Default::default()
        };
        assert!(!kinds(&wide.validate()).contains(&WarningKind::DisconnectedRoadRisk));
    }

    #[test]
    fn test_cross_section_spacing_recommendation() {
        let params = RoadSmoothingParameters {
            road_width_m: 6.0,
            terrain_affected_range_m: 6.0,
            cross_section_interval_m: 4.0,
            ..Default::default()
        };
        assert!((params.recommended_max_interval_m() - 3.0).abs() < 1e-6);
        let warnings = params.validate();
        let spacing = warnings
            .iter()
            .find(|w| w.kind == WarningKind::CrossSectionSpacing)
            .expect("spacing warning");
        assert!(spacing.recommendation.contains("3.00"));
    }

    #[test]
    fn test_high_order_is_advisory() {
        let mut params = RoadSmoothingParameters::default();
        params.filter.butterworth_order = 8;
        assert!(kinds(&params.validate()).contains(&WarningKind::HighFilterOrder));
    }

    #[test]
    fn test_mask_extension_margin() {
        let post = PostProcessingParameters {
            mask_extension_m: 1.0,
            ..Default::default()
        };
        assert!(kinds(&post.validate(1.0)).contains(&WarningKind::MaskExtensionMargin));
        assert!(post.validate(0.5).is_empty());
    }

    #[test]
    fn test_odd_window() {
        for size in [1usize, 3, 5, 7, 11, 31] {
            assert_eq!(odd_window(size), (size, false));
        }
        for size in [2usize, 4, 6, 10, 32] {
            assert_eq!(odd_window(size), (size + 1, true));
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: RoadSmoothingParameters =
            serde_json::from_str(r#"{"road_width_m": 5.0, "filter": {"kind": "Box"}}"#).unwrap();
        assert_eq!(params.road_width_m, 5.0);
        assert_eq!(params.filter.kind, ProfileFilterKind::Box);
        assert_eq!(params.filter.window_size, 11);
        assert_eq!(params.terrain_affected_range_m, 12.0);
    }
}
