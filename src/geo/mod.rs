//! Coordinate transformation between geographic sources and terrain pixels.

pub mod cache;
pub mod transform;

pub use cache::{GenerationCache, TransformKey};
pub use transform::{
    CoordinateTransformer, CropWindow, CrsKind, GeoBoundingBox, GeoTransform, METERS_PER_DEGREE,
};
