//! Generation job configuration, loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostics::ValidationWarning;
use crate::error::Result;
use crate::geo::{CoordinateTransformer, CropWindow, GeoBoundingBox, GeoTransform, TransformKey};
use crate::material::MaterialDefinition;
use crate::params::PostProcessingParameters;

/// How terrain pixels relate to geographic coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GeoReference {
    /// Terrain covers this lon/lat box
    BoundingBox(GeoBoundingBox),
    /// Terrain was taken from a georeferenced raster
    Raster {
        geo_transform: GeoTransform,
        #[serde(default)]
        projection: String,
        native_size: (usize, usize),
        #[serde(default)]
        crop: Option<CropWindow>,
        /// Needed to place lon/lat features on projected rasters
        #[serde(default)]
        wgs84_bounds: Option<GeoBoundingBox>,
    },
}

impl GeoReference {
    pub fn cache_key(&self, terrain_size: (usize, usize)) -> TransformKey {
        match self {
            GeoReference::BoundingBox(bbox) => TransformKey::bounding_box(bbox, terrain_size),
            GeoReference::Raster {
                geo_transform,
                projection,
                native_size,
                crop,
                wgs84_bounds,
            } => TransformKey::raster(
                geo_transform,
                projection,
                *native_size,
                terrain_size,
                *crop,
                wgs84_bounds.as_ref(),
            ),
        }
    }

    pub fn build_transformer(&self, terrain_size: (usize, usize)) -> Result<CoordinateTransformer> {
        match self {
            GeoReference::BoundingBox(bbox) => CoordinateTransformer::from_bounding_box(*bbox, terrain_size),
            GeoReference::Raster {
                geo_transform,
                projection,
                native_size,
                crop,
                wgs84_bounds,
            } => CoordinateTransformer::from_raster(
                *geo_transform,
                projection,
                *native_size,
                terrain_size,
                *crop,
                *wgs84_bounds,
            ),
        }
    }

    /// Bounding box features were fetched for, if known.
    pub fn query_bbox(&self) -> Option<GeoBoundingBox> {
        match self {
            GeoReference::BoundingBox(bbox) => Some(*bbox),
            GeoReference::Raster { wgs84_bounds, .. } => *wgs84_bounds,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Output terrain size; defaults to the heightmap's own size
    pub terrain_size: Option<(usize, usize)>,
    /// Used when no geo reference provides a scale
    pub meters_per_pixel: Option<f32>,
    pub materials: Vec<MaterialDefinition>,
    pub post_processing: PostProcessingParameters,
    /// Write per-material debug overlays
    pub debug: bool,
    pub geo: Option<GeoReference>,
}

impl GenerationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Advisories for every road material plus post-processing margins.
    pub fn validate(&self) -> Vec<ValidationWarning> {
        let mut warnings: Vec<ValidationWarning> = Vec::new();
        for road in self.materials.iter().filter_map(|m| m.road.as_ref()) {
            let found = road
                .validate()
                .into_iter()
                .chain(self.post_processing.validate(road.cross_section_interval_m));
            for w in found {
                if !warnings.contains(&w) {
                    warnings.push(w);
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::WarningKind;
    use crate::params::RoadSmoothingParameters;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{
            "meters_per_pixel": 2.0,
            "materials": [
                { "name": "grass" },
                { "name": "road", "layer": { "RasterFile": { "path": "road.png", "threshold": 100 } }, "road": {} }
            ]
        }"#;
        let config = GenerationConfig::from_json(json).unwrap();
        assert_eq!(config.meters_per_pixel, Some(2.0));
        assert_eq!(config.materials.len(), 2);
        assert_eq!(config.materials[1].road, Some(RoadSmoothingParameters::default()));
        assert_eq!(config.post_processing, PostProcessingParameters::default());
        assert!(config.geo.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_bounding_box_reference() {
        let json = r#"{
            "geo": { "BoundingBox": { "min_lat": 45.0, "min_lon": 7.0, "max_lat": 45.01, "max_lon": 7.01 } }
        }"#;
        let config = GenerationConfig::from_json(json).unwrap();
        let geo = config.geo.unwrap();
        let t = geo.build_transformer((256, 256)).unwrap();
        assert!(t.meters_per_pixel() > 0.0);
        assert!(geo.query_bbox().is_some());
    }

    #[test]
    fn test_disconnected_road_risk_reported() {
        let mut config = GenerationConfig::default();
        config.materials.push(MaterialDefinition::new("road").with_road(RoadSmoothingParameters {
            global_leveling_strength: 0.8,
            terrain_affected_range_m: 5.0,
            ..RoadSmoothingParameters::default()
        }));
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.kind == WarningKind::DisconnectedRoadRisk));
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = GenerationConfig::default();
        config.materials.push(MaterialDefinition::new("base"));
        config.terrain_size = Some((128, 64));
        let parsed = GenerationConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_repeated_advisories_reported_once() {
        let risky = RoadSmoothingParameters {
            global_leveling_strength: 0.8,
            terrain_affected_range_m: 5.0,
            ..RoadSmoothingParameters::default()
        };
        let mut config = GenerationConfig::default();
        config.materials.push(MaterialDefinition::new("base"));
        config.materials.push(MaterialDefinition::new("a").with_road(risky.clone()));
        config.materials.push(MaterialDefinition::new("b").with_road(RoadSmoothingParameters::default()));
        config.materials.push(MaterialDefinition::new("c").with_road(risky));

        let warnings = config.validate();
        let risk = warnings
            .iter()
            .filter(|w| w.kind == WarningKind::DisconnectedRoadRisk)
            .count();
        assert_eq!(risk, 1);
        for w in &warnings {
            assert_eq!(warnings.iter().filter(|o| *o == w).count(), 1);
        }
    }
}
