//! Caller-owned caches for coordinate transformers and fetched feature data.
//!
//! Nothing here is global: the cache lives as long as the caller keeps it and
//! can be invalidated or reset between runs.

use std::collections::HashMap;

use crate::error::Result;
use crate::features::FeatureCollection;
use crate::geo::transform::{CoordinateTransformer, CropWindow, GeoBoundingBox, GeoTransform};

/// Hashable identity of an `f64`, by bit pattern.
fn bits(v: f64) -> u64 {
    // -0.0 and 0.0 describe the same coordinate
    if v == 0.0 { 0 } else { v.to_bits() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBoxKey([u64; 4]);

impl From<&GeoBoundingBox> for BoundingBoxKey {
    fn from(b: &GeoBoundingBox) -> Self {
        Self([bits(b.min_lat), bits(b.min_lon), bits(b.max_lat), bits(b.max_lon)])
    }
}

/// Everything a transformer depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransformKey {
    Raster {
        coefficients: [u64; 6],
        projection: String,
        native_size: (usize, usize),
        terrain_size: (usize, usize),
        crop: Option<CropWindow>,
        bounds: Option<BoundingBoxKey>,
    },
    BoundingBox {
        bbox: BoundingBoxKey,
        terrain_size: (usize, usize),
    },
}

impl TransformKey {
    pub fn raster(
        transform: &GeoTransform,
        projection: &str,
        native_size: (usize, usize),
        terrain_size: (usize, usize),
        crop: Option<CropWindow>,
        bounds: Option<&GeoBoundingBox>,
    ) -> Self {
        let c = transform.coefficients();
        Self::Raster {
            coefficients: [bits(c[0]), bits(c[1]), bits(c[2]), bits(c[3]), bits(c[4]), bits(c[5])],
            projection: projection.to_string(),
            native_size,
            terrain_size,
            crop,
            bounds: bounds.map(BoundingBoxKey::from),
        }
    }

    pub fn bounding_box(bbox: &GeoBoundingBox, terrain_size: (usize, usize)) -> Self {
        Self::BoundingBox {
            bbox: bbox.into(),
            terrain_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct GenerationCache {
    transforms: HashMap<TransformKey, CoordinateTransformer>,
    features: HashMap<BoundingBoxKey, FeatureCollection>,
    transform_hits: usize,
}

impl GenerationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached transformer for `key`, building it on a miss.
    /// Build failures are not cached.
    pub fn transformer<F>(&mut self, key: TransformKey, build: F) -> Result<CoordinateTransformer>
    where
        F: FnOnce() -> Result<CoordinateTransformer>,
    {
        if let Some(t) = self.transforms.get(&key) {
            self.transform_hits += 1;
            return Ok(t.clone());
        }
        let t = build()?;
        self.transforms.insert(key, t.clone());
        Ok(t)
    }

    pub fn insert_features(&mut self, bbox: &GeoBoundingBox, features: FeatureCollection) {
        self.features.insert(bbox.into(), features);
    }

    pub fn features(&self, bbox: &GeoBoundingBox) -> Option<&FeatureCollection> {
        self.features.get(&BoundingBoxKey::from(bbox))
    }

    pub fn transform_hits(&self) -> usize {
        self.transform_hits
    }

    pub fn cached_transforms(&self) -> usize {
        self.transforms.len()
    }

    pub fn invalidate_transforms(&mut self) {
        self.transforms.clear();
        self.transform_hits = 0;
    }

    pub fn invalidate_features(&mut self, bbox: Option<&GeoBoundingBox>) {
        match bbox {
            Some(b) => {
                self.features.remove(&BoundingBoxKey::from(b));
            }
            None => self.features.clear(),
        }
    }

    pub fn reset(&mut self) {
        self.invalidate_transforms();
        self.invalidate_features(None);
    }
}
