//! Road-aware terrain synthesis
//!
//! Flattens and blends road corridors into a heightmap, material by material,
//! then harmonizes junctions and smooths what the passes touched.

pub mod blend;
pub mod compositor;
pub mod config;
pub mod cross_section;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod geo;
pub mod io;
pub mod junctions;
pub mod material;
pub mod network;
pub mod params;
pub mod paths;
pub mod point;
pub mod postprocess;
pub mod skeleton;
pub mod smoothing;
pub mod spawn;
pub mod spline;
pub mod tilemap;

pub use compositor::{
    CancellationToken, Compositor, FailureReport, GenerationRequest, GenerationStage, HeightmapSource, NetworkPlan, Progress,
    TerrainCreationResult,
};
pub use config::GenerationConfig;
pub use error::{Result, TerrainError};
pub use tilemap::{Heightmap, Tilemap};
