//! Material definitions and the ordering they are composited in.
//!
//! The first material is the base layer and may omit a layer source. Any
//! later material without one can never claim pixels, so it is moved to the
//! end of the list before generation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{ValidationWarning, WarningKind};
use crate::features::FeatureFilter;
use crate::params::RoadSmoothingParameters;
use crate::tilemap::Tilemap;

/// Greyscale threshold used when a raster layer does not set one.
pub const DEFAULT_LAYER_THRESHOLD: u8 = 128;

fn default_threshold() -> u8 {
    DEFAULT_LAYER_THRESHOLD
}

/// Where a material's layer mask comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerSource {
    /// Greyscale image on disk, binarized at `threshold`
    RasterFile {
        path: PathBuf,
        #[serde(default = "default_threshold")]
        threshold: u8,
    },
    /// Greyscale mask supplied by the caller
    #[serde(skip)]
    InMemory { mask: Tilemap<u8>, threshold: u8 },
    /// Features from the run's feature collection
    Vector {
        filter: FeatureFilter,
        /// Lines are buffered to this width when rasterizing area masks
        #[serde(default)]
        buffer_width_m: Option<f32>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialDefinition {
    pub name: String,
    #[serde(default)]
    pub layer: Option<LayerSource>,
    /// Present for road materials
    #[serde(default)]
    pub road: Option<RoadSmoothingParameters>,
}

impl MaterialDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layer: None,
            road: None,
        }
    }

    pub fn with_layer(mut self, layer: LayerSource) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_road(mut self, road: RoadSmoothingParameters) -> Self {
        self.road = Some(road);
        self
    }

    pub fn has_layer(&self) -> bool {
        self.layer.is_some()
    }

    pub fn is_road(&self) -> bool {
        self.road.is_some()
    }
}

/// A material at its final compositing position.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialSlot {
    /// Contiguous index after reordering; also the material index map value
    pub index: usize,
    /// Position in the caller's list
    pub original_index: usize,
    pub definition: MaterialDefinition,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReorderOutcome {
    pub slots: Vec<MaterialSlot>,
    /// Names of materials that were moved to the end
    pub moved: Vec<String>,
}

impl ReorderOutcome {
    pub fn was_reordered(&self) -> bool {
        !self.moved.is_empty()
    }

    /// One advisory per moved material.
    pub fn warnings(&self) -> Vec<ValidationWarning> {
        self.moved
            .iter()
            .map(|name| {
                ValidationWarning::new(
                    WarningKind::UnreachableMaterial,
                    format!("material '{}' has no layer source and was moved to the end", name),
                    "give the material a layer mask or feature filter",
                )
            })
            .collect()
    }
}

/// Move layerless materials (other than the first) to the end, keeping
/// relative order within both groups, and renumber from zero.
pub fn reorder_materials(definitions: Vec<MaterialDefinition>) -> ReorderOutcome {
    let mut kept = Vec::with_capacity(definitions.len());
    let mut tail = Vec::new();
    for (i, def) in definitions.into_iter().enumerate() {
        if i == 0 || def.has_layer() {
            kept.push((i, def));
        } else {
            tail.push((i, def));
        }
    }

    // Layerless materials already at the end keep their place
    let last_kept = kept.last().map_or(0, |(i, _)| *i);
    let moved = tail
        .iter()
        .filter(|(i, _)| *i < last_kept)
        .map(|(_, d)| d.name.clone())
        .collect();

    let slots = kept
        .into_iter()
        .chain(tail)
        .enumerate()
        .map(|(index, (original_index, definition))| MaterialSlot {
            index,
            original_index,
            definition,
        })
        .collect();

    ReorderOutcome { slots, moved }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(name: &str) -> MaterialDefinition {
        MaterialDefinition::new(name).with_layer(LayerSource::RasterFile {
            path: PathBuf::from(format!("{}.png", name)),
            threshold: DEFAULT_LAYER_THRESHOLD,
        })
    }

    fn names(outcome: &ReorderOutcome) -> Vec<&str> {
        outcome.slots.iter().map(|s| s.definition.name.as_str()).collect()
    }

    #[test]
    fn test_layerless_material_moves_to_end() {
        let outcome = reorder_materials(vec![
            MaterialDefinition::new("A"),
            MaterialDefinition::new("B"),
            masked("C"),
        ]);
        assert_eq!(names(&outcome), vec!["A", "C", "B"]);
        let indices: Vec<usize> = outcome.slots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(outcome.slots[1].original_index, 2);
        assert_eq!(outcome.moved, vec!["B".to_string()]);
        assert_eq!(outcome.warnings().len(), 1);
    }

    #[test]
    fn test_well_formed_order_is_untouched() {
        let outcome = reorder_materials(vec![MaterialDefinition::new("base"), masked("road"), masked("grass")]);
        assert_eq!(names(&outcome), vec!["base", "road", "grass"]);
        assert!(!outcome.was_reordered());
    }

    #[test]
    fn test_trailing_layerless_is_not_reported() {
        let outcome = reorder_materials(vec![masked("a"), masked("b"), MaterialDefinition::new("c")]);
        assert_eq!(names(&outcome), vec!["a", "b", "c"]);
        assert!(outcome.moved.is_empty());
    }

    #[test]
    fn test_relative_order_kept_in_both_groups() {
        let outcome = reorder_materials(vec![
            masked("base"),
            MaterialDefinition::new("x"),
            masked("p"),
            MaterialDefinition::new("y"),
            masked("q"),
        ]);
        assert_eq!(names(&outcome), vec!["base", "p", "q", "x", "y"]);
        assert_eq!(outcome.moved, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_definition_from_partial_json() {
        let json = r#"{
            "name": "asphalt",
            "layer": { "RasterFile": { "path": "roads.png" } },
            "road": { "approach": "DirectMask", "road_width_m": 6.0 }
        }"#;
        let def: MaterialDefinition = serde_json::from_str(json).unwrap();
        assert!(def.is_road());
        assert_eq!(
            def.layer,
            Some(LayerSource::RasterFile {
                path: PathBuf::from("roads.png"),
                threshold: DEFAULT_LAYER_THRESHOLD
            })
        );
        let road = def.road.unwrap();
        assert_eq!(road.road_width_m, 6.0);
        assert_eq!(road.terrain_affected_range_m, RoadSmoothingParameters::default().terrain_affected_range_m);
    }
}
