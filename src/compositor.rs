//! Generation orchestration.
//!
//! A run moves through
//! `Idle → Validating → Transforming → PerMaterialProcessing(i) →
//! JunctionHarmonization → PostProcessing → Done`, or ends in `Failed`.
//! It is split in two phases: [`Compositor::analyze`] smooths every material
//! and detects junctions, returning a [`NetworkPlan`] the caller may review
//! (and exclude junctions from); [`Compositor::commit`] harmonizes, post
//! processes and builds the final result.
//!
//! Materials are processed strictly in order against one heightmap, since
//! later materials sample elevations earlier ones already changed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::{GenerationConfig, GeoReference};
use crate::cross_section::{stamp_path_subset, CrossSectionAccumulator};
use crate::diagnostics::{DiagnosticLog, ValidationWarning, WarningKind};
use crate::error::{Result, TerrainError};
use crate::features::{binarize, rasterize_areas, rasterize_lines, vectorize_lines, FeatureCollection};
use crate::geo::{CoordinateTransformer, GenerationCache, GeoTransform};
use crate::io::{load_heightmap, load_mask, render_debug_overlay};
use crate::junctions::{detect_junctions, harmonize, JunctionSite};
use crate::material::{reorder_materials, LayerSource, MaterialSlot};
use crate::network::{NetworkBuilder, RoadInput, RoadLayer};
use crate::params::PostProcessingParameters;
use crate::point::Point;
use crate::postprocess::{extend_mask, PostProcessor};
use crate::spawn::{suggest_spawn, SpawnPoint};
use crate::tilemap::{Heightmap, Tilemap};

const SOURCE: &str = "compositor";

// =============================================================================
// INPUTS
// =============================================================================

pub enum HeightmapSource {
    InMemory(Heightmap),
    /// Greyscale PNG scaled to `base_elevation..base_elevation + elevation_scale`
    File {
        path: PathBuf,
        elevation_scale: f32,
        base_elevation: f32,
    },
    /// Elevation grid with its native georeference
    Georeferenced {
        grid: Heightmap,
        geo_transform: GeoTransform,
        projection: String,
    },
}

pub struct GenerationRequest {
    pub heightmap: HeightmapSource,
    pub config: GenerationConfig,
    /// Pre-fetched features for vector layers
    pub features: Option<FeatureCollection>,
}

impl GenerationRequest {
    pub fn new(heightmap: HeightmapSource, config: GenerationConfig) -> Self {
        Self {
            heightmap,
            config,
            features: None,
        }
    }

    pub fn with_features(mut self, features: FeatureCollection) -> Self {
        self.features = Some(features);
        self
    }
}

// =============================================================================
// STAGES, PROGRESS, CANCELLATION
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationStage {
    Idle,
    Validating,
    Transforming,
    /// Slot index of the material being processed
    PerMaterialProcessing(usize),
    JunctionHarmonization,
    PostProcessing,
    Done,
    Failed,
}

/// Checked between stages; a cancelled run fails with `TerrainError::Cancelled`.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub stage: GenerationStage,
    /// Overall completion, 0.0-1.0
    pub fraction: f32,
    pub message: String,
}

pub type ProgressCallback<'a> = Box<dyn FnMut(&Progress) + Send + 'a>;

// =============================================================================
// OUTPUTS
// =============================================================================

/// Everything `commit` needs, produced by `analyze`.
#[derive(Clone, Debug)]
pub struct NetworkPlan {
    /// Terrain after every material pass, before junction harmonization
    pub heightmap: Heightmap,
    pub slots: Vec<MaterialSlot>,
    /// Resolved layer mask per slot
    pub layer_masks: Vec<Option<Tilemap<bool>>>,
    pub roads: Vec<RoadLayer>,
    pub junctions: Vec<JunctionSite>,
    /// Union of all pixels a road pass touched
    pub affected: Tilemap<bool>,
    pub post_processing: PostProcessingParameters,
    pub meters_per_pixel: f32,
    pub debug: bool,
    pub degraded_geo: bool,
    pub log: DiagnosticLog,
    pub warnings: Vec<ValidationWarning>,
    /// Materials moved to the end by the reorder step
    pub reordered: Vec<String>,
    pub skipped: Vec<String>,
}

impl NetworkPlan {
    /// Mark junction `id` so `commit` leaves it alone. Returns false when no
    /// junction has that id.
    pub fn exclude_junction(&mut self, id: usize) -> bool {
        match self.junctions.iter_mut().find(|j| j.id == id) {
            Some(j) => {
                j.excluded = true;
                true
            }
            None => false,
        }
    }

    pub fn path_count(&self) -> usize {
        self.roads.iter().map(|r| r.stats.paths).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub min_elevation: f32,
    pub max_elevation: f32,
    pub meters_per_pixel: f32,
    pub path_count: usize,
    pub rejected_paths: usize,
    pub dropped_spurs: usize,
    pub bridged_gaps: usize,
    pub junction_count: usize,
    pub excluded_junctions: usize,
    pub tapered_ends: usize,
    /// (material name, claimed pixels) in slot order
    pub material_pixel_counts: Vec<(String, usize)>,
    pub skipped_materials: Vec<String>,
    pub reordered_materials: Vec<String>,
    pub degraded_geo: bool,
}

/// Final per-material weight layer (255 where the material won the pixel).
#[derive(Clone, Debug)]
pub struct MaterialLayerMap {
    pub name: String,
    pub index: usize,
    pub map: Tilemap<u8>,
}

#[derive(Clone, Debug)]
pub struct TerrainCreationResult {
    pub heightmap: Heightmap,
    /// Slot index of the material painted on each pixel
    pub material_index: Tilemap<u8>,
    pub layers: Vec<MaterialLayerMap>,
    pub spawn: SpawnPoint,
    pub metadata: GenerationMetadata,
    pub log: DiagnosticLog,
    pub warnings: Vec<ValidationWarning>,
    pub junctions: Vec<JunctionSite>,
    /// (material name, overlay) when the debug flag is set
    pub debug_overlays: Vec<(String, RgbImage)>,
}

// =============================================================================
// COMPOSITOR
// =============================================================================

struct LayerContext<'c> {
    width: usize,
    height: usize,
    meters_per_pixel: f32,
    transformer: Option<&'c CoordinateTransformer>,
    features: Option<&'c FeatureCollection>,
}

struct ResolvedLayer {
    mask: Tilemap<bool>,
    road_input: Option<RoadInput>,
}

/// What a failed run left behind: the stage it stopped in and everything it
/// logged up to and including the error.
#[derive(Clone, Debug)]
pub struct FailureReport {
    pub stage: GenerationStage,
    pub message: String,
    pub log: DiagnosticLog,
}

pub struct Compositor<'a> {
    cache: &'a mut GenerationCache,
    cancel: CancellationToken,
    progress: Option<ProgressCallback<'a>>,
    stage: GenerationStage,
    failure: Option<FailureReport>,
}

impl<'a> Compositor<'a> {
    pub fn new(cache: &'a mut GenerationCache) -> Self {
        Self {
            cache,
            cancel: CancellationToken::new(),
            progress: None,
            stage: GenerationStage::Idle,
            failure: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback<'a>) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn stage(&self) -> GenerationStage {
        self.stage
    }

    /// Diagnostics of the last failed `analyze` or `commit`, if any.
    pub fn failure(&self) -> Option<&FailureReport> {
        self.failure.as_ref()
    }

    /// Stage the last failed run stopped in.
    pub fn failed_stage(&self) -> Option<GenerationStage> {
        self.failure.as_ref().map(|f| f.stage)
    }

    /// Analyze and commit in one go, with no junction exclusions.
    pub fn generate(&mut self, request: GenerationRequest) -> Result<TerrainCreationResult> {
        let plan = self.analyze(request)?;
        self.commit(plan)
    }

    /// Validate, transform and run every material pass, then detect junctions.
    pub fn analyze(&mut self, request: GenerationRequest) -> Result<NetworkPlan> {
        self.stage = GenerationStage::Idle;
        self.failure = None;
        let mut log = DiagnosticLog::new();
        match self.run_analysis(request, &mut log) {
            Ok(mut plan) => {
                plan.log = log;
                Ok(plan)
            }
            Err(e) => Err(self.fail(e, log)),
        }
    }

    /// Harmonize junctions, post-process and assemble the final result.
    pub fn commit(&mut self, mut plan: NetworkPlan) -> Result<TerrainCreationResult> {
        self.failure = None;
        let mut log = std::mem::take(&mut plan.log);
        match self.run_commit(plan, &mut log) {
            Ok(mut result) => {
                result.log = log;
                Ok(result)
            }
            Err(e) => Err(self.fail(e, log)),
        }
    }

    fn fail(&mut self, error: TerrainError, mut log: DiagnosticLog) -> TerrainError {
        let stage = self.stage;
        let message = error.to_string();
        log.error(SOURCE, format!("generation failed during {:?}: {}", stage, message));
        self.stage = GenerationStage::Failed;
        self.failure = Some(FailureReport { stage, message, log });
        error
    }

    fn enter(&mut self, stage: GenerationStage, fraction: f32, message: String, log: &mut DiagnosticLog) {
        self.stage = stage;
        log.info(SOURCE, message.clone());
        if let Some(callback) = self.progress.as_mut() {
            callback(&Progress { stage, fraction, message });
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TerrainError::Cancelled(format!("{:?}", self.stage)));
        }
        Ok(())
    }

    fn run_analysis(&mut self, request: GenerationRequest, log: &mut DiagnosticLog) -> Result<NetworkPlan> {
        let GenerationRequest {
            heightmap: source,
            config,
            features,
        } = request;
        let mut warnings = Vec::new();

        // -- Validating --
        self.check_cancelled()?;
        self.enter(GenerationStage::Validating, 0.0, "Validating inputs".to_string(), log);
        let georeferenced = matches!(source, HeightmapSource::Georeferenced { .. });
        let (mut heightmap, source_geo) = resolve_heightmap(source)?;
        if let Some((w, h)) = config.terrain_size {
            if (w, h) != (heightmap.width, heightmap.height) {
                if w == 0 || h == 0 {
                    return Err(TerrainError::DimensionMismatch {
                        expected_width: heightmap.width,
                        expected_height: heightmap.height,
                        width: w,
                        height: h,
                    });
                }
                log.info(
                    SOURCE,
                    format!(
                        "Resampling heightmap from {}x{} to {}x{}",
                        heightmap.width, heightmap.height, w, h
                    ),
                );
                heightmap = heightmap.resample_bilinear(w, h);
            }
        }
        let (width, height) = (heightmap.width, heightmap.height);

        if config.materials.is_empty() {
            return Err(TerrainError::NoValidMaterials);
        }
        let reorder = reorder_materials(config.materials.clone());
        if reorder.was_reordered() {
            log.info(SOURCE, format!("Moved {} layerless materials to the end", reorder.moved.len()));
        }
        for w in reorder.warnings().into_iter().chain(config.validate()) {
            log.advisory(SOURCE, &w);
            warnings.push(w);
        }

        // -- Transforming --
        self.check_cancelled()?;
        self.enter(GenerationStage::Transforming, 0.1, "Resolving coordinate transform".to_string(), log);
        let geo = config.geo.clone().or(source_geo);
        let mut degraded_geo = false;
        let transformer = match &geo {
            Some(reference) => {
                let key = reference.cache_key((width, height));
                match self.cache.transformer(key, || reference.build_transformer((width, height))) {
                    Ok(t) => {
                        // Projected rasters without WGS84 bounds cannot place features
                        if t.pixel_to_geo(Point::new(0.0, 0.0)).is_err() && features.is_some() {
                            degraded_geo = true;
                        }
                        Some(t)
                    }
                    Err(e) if georeferenced => return Err(e),
                    Err(e) => {
                        degraded_geo = true;
                        log.warn(SOURCE, format!("coordinate transform unavailable: {}", e));
                        None
                    }
                }
            }
            None if features.is_some() => {
                degraded_geo = true;
                log.warn(SOURCE, "features supplied without a geographic reference");
                None
            }
            None => None,
        };
        if degraded_geo {
            let w = ValidationWarning::new(
                WarningKind::DegradedGeoMode,
                "feature coordinates cannot be mapped onto the terrain; vector layers are skipped",
                "supply WGS84 bounds or a bounding-box reference",
            );
            log.advisory(SOURCE, &w);
            warnings.push(w);
        }

        let meters_per_pixel = transformer
            .as_ref()
            .map(|t| t.meters_per_pixel() as f32)
            .or(config.meters_per_pixel)
            .filter(|m| *m > 0.0)
            .unwrap_or(1.0);
        log.info(SOURCE, format!("Terrain {}x{} at {:.3} m/px", width, height, meters_per_pixel));

        let query_bbox = geo.as_ref().and_then(|g| g.query_bbox());
        let features = match (features, query_bbox) {
            (Some(fc), Some(bbox)) => {
                self.cache.insert_features(&bbox, fc.clone());
                Some(fc)
            }
            (Some(fc), None) => Some(fc),
            (None, Some(bbox)) => self.cache.features(&bbox).cloned(),
            (None, None) => None,
        };

        // -- PerMaterialProcessing --
        let ctx = LayerContext {
            width,
            height,
            meters_per_pixel,
            transformer: if degraded_geo { None } else { transformer.as_ref() },
            features: features.as_ref(),
        };
        let count = reorder.slots.len();
        let mut affected = Tilemap::new(width, height);
        let mut layer_masks = Vec::with_capacity(count);
        let mut roads = Vec::new();
        let mut skipped = Vec::new();

        for slot in &reorder.slots {
            self.check_cancelled()?;
            let fraction = 0.15 + 0.6 * slot.index as f32 / count as f32;
            self.enter(
                GenerationStage::PerMaterialProcessing(slot.index),
                fraction,
                format!("Processing material {} '{}'", slot.index, slot.definition.name),
                log,
            );
            match process_material(slot, &ctx, &mut heightmap, &mut affected, &mut warnings, log) {
                Ok((mask, road)) => {
                    layer_masks.push(mask);
                    roads.extend(road);
                }
                Err(e) => {
                    log.warn(SOURCE, format!("material '{}' skipped: {}", slot.definition.name, e));
                    skipped.push(slot.definition.name.clone());
                    layer_masks.push(None);
                }
            }
        }

        let junctions = detect_junctions(&roads, meters_per_pixel);
        log.info(SOURCE, format!("Detected {} junctions", junctions.len()));

        Ok(NetworkPlan {
            heightmap,
            slots: reorder.slots,
            layer_masks,
            roads,
            junctions,
            affected,
            post_processing: config.post_processing,
            meters_per_pixel,
            debug: config.debug,
            degraded_geo,
            log: DiagnosticLog::new(),
            warnings,
            reordered: reorder.moved,
            skipped,
        })
    }

    fn run_commit(&mut self, plan: NetworkPlan, log: &mut DiagnosticLog) -> Result<TerrainCreationResult> {
        let NetworkPlan {
            mut heightmap,
            slots,
            layer_masks,
            mut roads,
            junctions,
            mut affected,
            post_processing,
            meters_per_pixel,
            debug,
            degraded_geo,
            log: _,
            warnings,
            reordered,
            skipped,
        } = plan;
        let (width, height) = (heightmap.width, heightmap.height);

        // -- JunctionHarmonization --
        self.check_cancelled()?;
        let excluded = junctions.iter().filter(|j| j.excluded).count();
        self.enter(
            GenerationStage::JunctionHarmonization,
            0.8,
            format!("Harmonizing {} junctions ({} excluded)", junctions.len(), excluded),
            log,
        );
        let harmonized = harmonize(&mut roads, &junctions, meters_per_pixel, (width, height));
        if harmonized.any_changed() {
            log.info(SOURCE, format!("Harmonized elevations at {} junctions", harmonized.applied_sites));
        }
        for (layer, changed) in roads.iter().zip(&harmonized.changed) {
            if !changed.iter().flatten().any(|&c| c) {
                continue;
            }
            let mut acc = CrossSectionAccumulator::new(width, height);
            for (path, include) in layer.network.paths().iter().zip(changed) {
                if include.iter().any(|&c| c) {
                    stamp_path_subset(&mut acc, &heightmap, &path.samples, path.targets(), &layer.geometry, include);
                }
            }
            acc.apply(&mut heightmap);
            affected.union_with(&acc.affected());
        }
        if harmonized.tapered_ends > 0 {
            log.info(SOURCE, format!("Tapered {} dangling road ends", harmonized.tapered_ends));
        }

        // -- PostProcessing --
        self.check_cancelled()?;
        self.enter(GenerationStage::PostProcessing, 0.9, "Post-processing".to_string(), log);
        if post_processing.enabled && affected.count_set() > 0 {
            let mask = extend_mask(&affected, post_processing.mask_extension_m / meters_per_pixel);
            let processor = PostProcessor::new(&post_processing, log);
            processor.apply(&mut heightmap, &mask);
            log.info(
                SOURCE,
                format!("Smoothed {} pixels with a {}px kernel", mask.count_set(), processor.kernel_size()),
            );
        }

        // Later slots paint over earlier ones; slot 0 is the base
        let mut material_index = Tilemap::new_with(width, height, 0u8);
        for (slot, mask) in slots.iter().zip(&layer_masks) {
            let Some(mask) = mask else { continue };
            let value = u8::try_from(slot.index).unwrap_or(u8::MAX);
            for (x, y, &m) in mask.iter() {
                if m {
                    material_index.set(x, y, value);
                }
            }
        }
        let layers: Vec<MaterialLayerMap> = slots
            .iter()
            .map(|slot| {
                let value = u8::try_from(slot.index).unwrap_or(u8::MAX);
                MaterialLayerMap {
                    name: slot.definition.name.clone(),
                    index: slot.index,
                    map: material_index.map(|&v| if v == value { 255 } else { 0 }),
                }
            })
            .collect();

        let debug_overlays = if debug {
            slots
                .iter()
                .zip(&layer_masks)
                .filter(|(_, mask)| mask.is_some())
                .map(|(slot, mask)| {
                    let own = roads
                        .iter()
                        .position(|r| r.material == slot.index)
                        .map_or(&roads[..0], |p| &roads[p..=p]);
                    (
                        slot.definition.name.clone(),
                        render_debug_overlay(&heightmap, mask.as_ref(), own, &junctions),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        let spawn = suggest_spawn(&roads, &heightmap);
        let (min_elevation, max_elevation) = heightmap.min_max();
        let metadata = GenerationMetadata {
            min_elevation,
            max_elevation,
            meters_per_pixel,
            path_count: roads.iter().map(|r| r.stats.paths).sum(),
            rejected_paths: roads.iter().map(|r| r.stats.rejected).sum(),
            dropped_spurs: roads.iter().map(|r| r.stats.dropped).sum(),
            bridged_gaps: roads.iter().map(|r| r.stats.bridged).sum(),
            junction_count: junctions.len(),
            excluded_junctions: excluded,
            tapered_ends: harmonized.tapered_ends,
            material_pixel_counts: layers
                .iter()
                .map(|l| (l.name.clone(), l.map.data().iter().filter(|&&v| v > 0).count()))
                .collect(),
            skipped_materials: skipped,
            reordered_materials: reordered,
            degraded_geo,
        };

        self.enter(
            GenerationStage::Done,
            1.0,
            format!("Done: elevation {:.2}..{:.2}", min_elevation, max_elevation),
            log,
        );

        Ok(TerrainCreationResult {
            heightmap,
            material_index,
            layers,
            spawn,
            metadata,
            log: DiagnosticLog::new(),
            warnings,
            junctions,
            debug_overlays,
        })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn resolve_heightmap(source: HeightmapSource) -> Result<(Heightmap, Option<GeoReference>)> {
    let (grid, geo) = match source {
        HeightmapSource::InMemory(grid) => (grid, None),
        HeightmapSource::File {
            path,
            elevation_scale,
            base_elevation,
        } => (load_heightmap(&path, elevation_scale, base_elevation)?, None),
        HeightmapSource::Georeferenced {
            grid,
            geo_transform,
            projection,
        } => {
            let native_size = (grid.width, grid.height);
            let reference = GeoReference::Raster {
                geo_transform,
                projection,
                native_size,
                crop: None,
                wgs84_bounds: None,
            };
            (grid, Some(reference))
        }
    };
    if grid.width == 0 || grid.height == 0 {
        return Err(TerrainError::MissingHeightmap("heightmap is empty".to_string()));
    }
    Ok((grid, geo))
}

fn fit_mask(mask: Tilemap<u8>, ctx: &LayerContext<'_>, name: &str, log: &mut DiagnosticLog) -> Tilemap<u8> {
    if mask.width == ctx.width && mask.height == ctx.height {
        return mask;
    }
    log.info(
        SOURCE,
        format!(
            "layer '{}' is {}x{}, resizing to {}x{}",
            name, mask.width, mask.height, ctx.width, ctx.height
        ),
    );
    mask.resize_nearest(ctx.width, ctx.height)
}

fn resolve_layer(slot: &MaterialSlot, ctx: &LayerContext<'_>, log: &mut DiagnosticLog) -> Result<Option<ResolvedLayer>> {
    let def = &slot.definition;
    let Some(source) = &def.layer else {
        return Ok(None);
    };
    let raster = |mask: Tilemap<bool>| ResolvedLayer {
        road_input: def.road.as_ref().map(|_| RoadInput::Mask(mask.clone())),
        mask,
    };

    match source {
        LayerSource::RasterFile { path, threshold } => {
            let grey = fit_mask(load_mask(path)?, ctx, &def.name, log);
            Ok(Some(raster(binarize(&grey, *threshold))))
        }
        LayerSource::InMemory { mask, threshold } => {
            if mask.width != ctx.width || mask.height != ctx.height {
                return Err(TerrainError::DimensionMismatch {
                    expected_width: ctx.width,
                    expected_height: ctx.height,
                    width: mask.width,
                    height: mask.height,
                });
            }
            Ok(Some(raster(binarize(mask, *threshold))))
        }
        LayerSource::Vector { filter, buffer_width_m } => {
            let transformer = ctx
                .transformer
                .ok_or_else(|| TerrainError::projection("no usable coordinate transform for vector layer"))?;
            let features = ctx
                .features
                .ok_or_else(|| TerrainError::geometry("vector layer needs a feature collection"))?;
            match &def.road {
                Some(road) => {
                    let paths = vectorize_lines(features, filter, transformer, ctx.width, ctx.height, log);
                    if paths.is_empty() {
                        return Err(TerrainError::geometry(format!(
                            "no line features match filter '{}'",
                            filter.key
                        )));
                    }
                    let width_px = road.road_width_m / ctx.meters_per_pixel;
                    let mask = binarize(&rasterize_lines(&paths, width_px, ctx.width, ctx.height), 1);
                    Ok(Some(ResolvedLayer {
                        mask,
                        road_input: Some(RoadInput::Paths(paths)),
                    }))
                }
                None => {
                    let line_px = buffer_width_m.map(|m| m / ctx.meters_per_pixel);
                    let grey = rasterize_areas(features, filter, transformer, ctx.width, ctx.height, line_px, log);
                    Ok(Some(ResolvedLayer {
                        mask: binarize(&grey, 1),
                        road_input: None,
                    }))
                }
            }
        }
    }
}

/// Resolve one material's layer and, for roads, smooth it into `heightmap`.
fn process_material(
    slot: &MaterialSlot,
    ctx: &LayerContext<'_>,
    heightmap: &mut Heightmap,
    affected: &mut Tilemap<bool>,
    warnings: &mut Vec<ValidationWarning>,
    log: &mut DiagnosticLog,
) -> Result<(Option<Tilemap<bool>>, Option<RoadLayer>)> {
    let Some(resolved) = resolve_layer(slot, ctx, log)? else {
        if slot.definition.is_road() {
            log.warn(
                SOURCE,
                format!("road material '{}' has no layer source, nothing to smooth", slot.definition.name),
            );
        }
        return Ok((None, None));
    };

    let road = match (&slot.definition.road, resolved.road_input) {
        (Some(params), Some(input)) => {
            let builder = NetworkBuilder::new(slot.index, params, ctx.meters_per_pixel, log)?;
            let mut acc = CrossSectionAccumulator::new(ctx.width, ctx.height);
            let (network, stats) = builder.build(input, heightmap, &mut acc, log);
            acc.apply(heightmap);
            affected.union_with(&acc.affected());
            log.info(
                SOURCE,
                format!(
                    "material '{}': {} paths, {} rejected, {} spurs dropped, {} gaps bridged, {} of {} stamps widened",
                    slot.definition.name,
                    stats.paths,
                    stats.rejected,
                    stats.dropped,
                    stats.bridged,
                    stats.stamps.widened,
                    stats.stamps.stamps
                ),
            );
            if stats.stamps.widened > 0 {
                let w = ValidationWarning::new(
                    WarningKind::SideSlopeUnreachable,
                    format!(
                        "material '{}': {:.1}m of affected range cannot hold a {:.1} degree side slope at {} of {} stamps ({} still too steep after widening)",
                        slot.definition.name,
                        params.terrain_affected_range_m,
                        params.side_max_slope_degrees.unwrap_or(90.0),
                        stats.stamps.widened,
                        stats.stamps.stamps,
                        stats.stamps.capped
                    ),
                    "raise terrain_affected_range_m or relax side_max_slope_degrees",
                );
                log.advisory(SOURCE, &w);
                warnings.push(w);
            }
            Some(RoadLayer {
                material: slot.index,
                params: params.clone(),
                geometry: builder.geometry(),
                network,
                stats,
            })
        }
        _ => None,
    };
    Ok((Some(resolved.mask), road))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::BlendFunction;
    use crate::material::MaterialDefinition;
    use crate::features::FeatureFilter;
    use crate::geo::GeoBoundingBox;
    use crate::params::{RoadApproach, RoadSmoothingParameters};
    use std::sync::Mutex;

    fn band(width: usize, height: usize, horizontal: bool, from: usize, to: usize) -> Tilemap<u8> {
        let mut m = Tilemap::new_with(width, height, 0u8);
        for (x, y, v) in m.iter_mut() {
            let c = if horizontal { y } else { x };
            if (from..to).contains(&c) {
                *v = 255;
            }
        }
        m
    }

    fn road_material(name: &str, mask: Tilemap<u8>, params: RoadSmoothingParameters) -> MaterialDefinition {
        MaterialDefinition::new(name)
            .with_layer(LayerSource::InMemory { mask, threshold: 128 })
            .with_road(params)
    }

    fn config(materials: Vec<MaterialDefinition>) -> GenerationConfig {
        GenerationConfig {
            meters_per_pixel: Some(1.0),
            materials,
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn test_flat_direct_mask_stays_flat() {
        let params = RoadSmoothingParameters {
            approach: RoadApproach::DirectMask,
            road_width_m: 4.0,
            terrain_affected_range_m: 6.0,
            blend_function: BlendFunction::Cosine,
            ..RoadSmoothingParameters::default()
        };
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(256, 256, 100.0)),
            config(vec![
                MaterialDefinition::new("grass"),
                road_material("road", band(256, 256, true, 126, 130), params),
            ]),
        );
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let result = compositor.generate(request).unwrap();
        assert_eq!(compositor.stage(), GenerationStage::Done);

        let h = &result.heightmap;
        for x in [0usize, 64, 128, 200, 255] {
            assert!((h.get(x, 128) - 100.0).abs() < 1e-3);
            assert!((h.get(x, 120) - 100.0).abs() < 1e-3);
            assert!((h.get(x, 136) - 100.0).abs() < 1e-3);
        }
        assert!(h.data().iter().all(|v| (v - 100.0).abs() < 1e-3));
        assert_eq!(*result.material_index.get(10, 128), 1);
        assert_eq!(*result.material_index.get(10, 10), 0);
        assert_eq!(result.metadata.material_pixel_counts[1], ("road".to_string(), 256 * 4));
        assert!(result.spawn.on_road);
    }

    #[test]
    fn test_sloped_road_changes_only_nearby_rows() {
        let params = RoadSmoothingParameters {
            approach: RoadApproach::DirectMask,
            road_width_m: 4.0,
            terrain_affected_range_m: 6.0,
            ..RoadSmoothingParameters::default()
        };
        let mut terrain = Heightmap::new(96, 96);
        for (x, y, v) in terrain.iter_mut() {
            *v = 50.0 + ((x * 31 + y * 17) % 7) as f32;
        }
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(terrain.clone()),
            config(vec![
                MaterialDefinition::new("grass"),
                road_material("road", band(96, 96, true, 46, 50), params),
            ]),
        );
        let mut cache = GenerationCache::new();
        let result = Compositor::new(&mut cache).generate(request).unwrap();
        for x in 0..96 {
            assert_eq!(result.heightmap.get(x, 10), terrain.get(x, 10));
            assert_eq!(result.heightmap.get(x, 85), terrain.get(x, 85));
        }
        let changed = (0..96).filter(|&x| result.heightmap.get(x, 48) != terrain.get(x, 48)).count();
        assert!(changed > 48);
    }

    #[test]
    fn test_crossing_materials_share_one_junction() {
        let params = RoadSmoothingParameters::default();
        let mut terrain = Heightmap::new(128, 128);
        for (x, y, v) in terrain.iter_mut() {
            *v = 20.0 + x as f32 * 0.05 + y as f32 * 0.1;
        }
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(terrain),
            config(vec![
                MaterialDefinition::new("base"),
                road_material("main", band(128, 128, true, 62, 66), params.clone()),
                road_material("side", band(128, 128, false, 62, 66), params),
            ]),
        );
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let mut plan = compositor.analyze(request).unwrap();
        assert_eq!(plan.roads.len(), 2);
        assert_eq!(plan.junctions.len(), 1);
        assert_eq!(plan.junctions[0].layer_count(), 2);

        let id = plan.junctions[0].id;
        assert!(plan.exclude_junction(id));
        assert!(!plan.exclude_junction(id + 100));
        let result = compositor.commit(plan).unwrap();
        assert_eq!(result.metadata.junction_count, 1);
        assert_eq!(result.metadata.excluded_junctions, 1);
        assert!(result.junctions[0].excluded);
    }

    #[test]
    fn test_reorder_is_reported() {
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(32, 32, 1.0)),
            config(vec![
                MaterialDefinition::new("A"),
                MaterialDefinition::new("B"),
                MaterialDefinition::new("C").with_layer(LayerSource::InMemory {
                    mask: band(32, 32, true, 0, 8),
                    threshold: 128,
                }),
            ]),
        );
        let mut cache = GenerationCache::new();
        let plan = Compositor::new(&mut cache).analyze(request).unwrap();
        let names: Vec<&str> = plan.slots.iter().map(|s| s.definition.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C", "B"]);
        assert_eq!(plan.reordered, vec!["B".to_string()]);
        assert!(plan.warnings.iter().any(|w| w.kind == WarningKind::UnreachableMaterial));
        assert!(plan.log.infos().any(|e| e.message == "Moved 1 layerless materials to the end"));
    }

    #[test]
    fn test_missing_heightmap_fails_run() {
        let request = GenerationRequest::new(
            HeightmapSource::File {
                path: PathBuf::from("/nonexistent/terrain.png"),
                elevation_scale: 100.0,
                base_elevation: 0.0,
            },
            config(vec![MaterialDefinition::new("base")]),
        );
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let err = compositor.generate(request).unwrap_err();
        assert!(matches!(err, TerrainError::MissingHeightmap(_)));
        assert_eq!(compositor.stage(), GenerationStage::Failed);
    }

    #[test]
    fn test_no_materials_is_fatal() {
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(8, 8, 0.0)),
            config(Vec::new()),
        );
        let mut cache = GenerationCache::new();
        let err = Compositor::new(&mut cache).generate(request).unwrap_err();
        assert!(matches!(err, TerrainError::NoValidMaterials));
    }

    #[test]
    fn test_bad_material_is_skipped() {
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(32, 32, 5.0)),
            config(vec![
                MaterialDefinition::new("base"),
                MaterialDefinition::new("wrong size").with_layer(LayerSource::InMemory {
                    mask: band(16, 16, true, 0, 4),
                    threshold: 128,
                }),
            ]),
        );
        let mut cache = GenerationCache::new();
        let result = Compositor::new(&mut cache).generate(request).unwrap();
        assert_eq!(result.metadata.skipped_materials, vec!["wrong size".to_string()]);
        assert!(result.log.warnings().any(|e| e.message.contains("wrong size")));
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(8, 8, 0.0)),
            config(vec![MaterialDefinition::new("base")]),
        );
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache).with_cancellation(token);
        let err = compositor.generate(request).unwrap_err();
        assert!(matches!(err, TerrainError::Cancelled(_)));
        assert_eq!(compositor.stage(), GenerationStage::Failed);
    }

    #[test]
    fn test_progress_reports_every_stage() {
        let seen = Mutex::new(Vec::new());
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(16, 16, 0.0)),
            config(vec![MaterialDefinition::new("base")]),
        );
        let mut cache = GenerationCache::new();
        {
            let mut compositor = Compositor::new(&mut cache).with_progress(Box::new(|p: &Progress| {
                if let Ok(mut s) = seen.lock() {
                    s.push(p.stage);
                }
            }));
            compositor.generate(request).unwrap();
        }
        let stages = seen.into_inner().unwrap();
        assert_eq!(
            stages,
            vec![
                GenerationStage::Validating,
                GenerationStage::Transforming,
                GenerationStage::PerMaterialProcessing(0),
                GenerationStage::JunctionHarmonization,
                GenerationStage::PostProcessing,
                GenerationStage::Done,
            ]
        );
    }

    /// 128x128 terrain over a ~1.1km box, about 8.7 m/px.
    fn bbox_config(materials: Vec<MaterialDefinition>) -> GenerationConfig {
        GenerationConfig {
            materials,
            geo: Some(GeoReference::BoundingBox(GeoBoundingBox {
                min_lat: 45.0,
                min_lon: 7.0,
                max_lat: 45.01,
                max_lon: 7.0141,
            })),
            ..GenerationConfig::default()
        }
    }

    fn sample_features() -> FeatureCollection {
        FeatureCollection::from_json(
            r#"{ "features": [
                { "geometry": { "type": "LineString", "coordinates": [[7.001, 45.005], [7.013, 45.005]] },
                  "properties": { "highway": "primary" } },
                { "geometry": { "type": "Polygon", "coordinates": [[[7.001, 45.006], [7.005, 45.006], [7.005, 45.009], [7.001, 45.009], [7.001, 45.006]]] },
                  "properties": { "landuse": "forest" } }
            ] }"#,
        )
        .unwrap()
    }

    fn vector_material(name: &str, key: &str, road: Option<RoadSmoothingParameters>) -> MaterialDefinition {
        let def = MaterialDefinition::new(name).with_layer(LayerSource::Vector {
            filter: FeatureFilter {
                key: key.to_string(),
                values: Vec::new(),
            },
            buffer_width_m: None,
        });
        match road {
            Some(params) => def.with_road(params),
            None => def,
        }
    }

    fn wide_road() -> RoadSmoothingParameters {
        RoadSmoothingParameters {
            road_width_m: 20.0,
            terrain_affected_range_m: 30.0,
            cross_section_interval_m: 4.0,
            ..RoadSmoothingParameters::default()
        }
    }

    #[test]
    fn test_vector_road_from_bounding_box() {
        let mut terrain = Heightmap::new(128, 128);
        for (x, y, v) in terrain.iter_mut() {
            *v = 10.0 + x as f32 * 0.2 + y as f32 * 0.1;
        }
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(terrain),
            bbox_config(vec![
                MaterialDefinition::new("base"),
                vector_material("road", "highway", Some(wide_road())),
            ]),
        )
        .with_features(sample_features());
        let mut cache = GenerationCache::new();
        let result = Compositor::new(&mut cache).generate(request).unwrap();

        assert!(!result.metadata.degraded_geo);
        assert!(result.metadata.skipped_materials.is_empty());
        assert!(result.metadata.meters_per_pixel > 8.0 && result.metadata.meters_per_pixel < 9.5);
        assert_eq!(result.metadata.path_count, 1);
        assert_eq!(*result.material_index.get(64, 64), 1);
        assert_eq!(*result.material_index.get(64, 20), 0);
        let (_, road_pixels) = &result.metadata.material_pixel_counts[1];
        assert!(*road_pixels > 100 && *road_pixels < 128 * 16);
    }

    #[test]
    fn test_vector_area_polygon_fill() {
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(128, 128, 30.0)),
            bbox_config(vec![
                MaterialDefinition::new("base"),
                vector_material("forest", "landuse", None),
            ]),
        )
        .with_features(sample_features());
        let mut cache = GenerationCache::new();
        let result = Compositor::new(&mut cache).generate(request).unwrap();

        // Polygon spans roughly x 9..45, y 13..51
        assert_eq!(*result.material_index.get(27, 32), 1);
        assert_eq!(*result.material_index.get(100, 100), 0);
        assert_eq!(*result.material_index.get(64, 64), 0);
        let (_, forest) = &result.metadata.material_pixel_counts[1];
        assert!(*forest > 500 && *forest < 128 * 128 / 2);
        assert!(result.heightmap.data().iter().all(|&v| v == 30.0));
    }

    #[test]
    fn test_projected_raster_without_bounds_degrades() {
        let request = GenerationRequest::new(
            HeightmapSource::Georeferenced {
                grid: Heightmap::new_with(64, 64, 12.0),
                geo_transform: GeoTransform::from_coefficients([500_000.0, 10.0, 0.0, 4_000_000.0, 0.0, -10.0]),
                projection: "EPSG:32632".to_string(),
            },
            GenerationConfig {
                materials: vec![
                    MaterialDefinition::new("base"),
                    vector_material("road", "highway", Some(wide_road())),
                ],
                ..GenerationConfig::default()
            },
        )
        .with_features(sample_features());
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let result = compositor.generate(request).unwrap();

        assert_eq!(compositor.stage(), GenerationStage::Done);
        assert!(result.metadata.degraded_geo);
        assert_eq!(result.metadata.meters_per_pixel, 10.0);
        assert_eq!(result.metadata.skipped_materials, vec!["road".to_string()]);
        assert!(result.warnings.iter().any(|w| w.kind == WarningKind::DegradedGeoMode));
        assert!(result.heightmap.data().iter().all(|&v| v == 12.0));
    }

    #[test]
    fn test_features_without_reference_degrade() {
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(32, 32, 0.0)),
            config(vec![
                MaterialDefinition::new("base"),
                vector_material("road", "highway", Some(wide_road())),
            ]),
        )
        .with_features(sample_features());
        let mut cache = GenerationCache::new();
        let result = Compositor::new(&mut cache).generate(request).unwrap();
        assert!(result.metadata.degraded_geo);
        assert_eq!(result.metadata.skipped_materials, vec!["road".to_string()]);
        assert!(result.warnings.iter().any(|w| w.kind == WarningKind::DegradedGeoMode));
    }

    #[test]
    fn test_failure_keeps_stage_and_log() {
        let request = GenerationRequest::new(
            HeightmapSource::Georeferenced {
                grid: Heightmap::new_with(16, 16, 0.0),
                geo_transform: GeoTransform::from_coefficients([7.0, 0.0, 0.0, 45.0, 0.0, 0.0]),
                projection: "EPSG:4326".to_string(),
            },
            config(vec![MaterialDefinition::new("base")]),
        );
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let err = compositor.analyze(request).unwrap_err();
        assert!(matches!(err, TerrainError::Projection(_)));
        assert_eq!(compositor.stage(), GenerationStage::Failed);
        assert_eq!(compositor.failed_stage(), Some(GenerationStage::Transforming));

        let failure = compositor.failure().unwrap();
        assert_eq!(failure.stage, GenerationStage::Transforming);
        assert_eq!(failure.log.errors().count(), 1);
        assert!(failure.log.infos().any(|e| e.message == "Validating inputs"));
        let last = failure.log.entries().last().unwrap();
        assert_eq!(last.level, crate::diagnostics::LogLevel::Error);
        assert!(last.message.contains(&failure.message));
    }

    #[test]
    fn test_successful_run_clears_failure() {
        let mut cache = GenerationCache::new();
        let mut compositor = Compositor::new(&mut cache);
        let bad = GenerationRequest::new(HeightmapSource::InMemory(Heightmap::new_with(8, 8, 0.0)), config(Vec::new()));
        assert!(compositor.generate(bad).is_err());
        assert_eq!(compositor.failed_stage(), Some(GenerationStage::Validating));

        let good = GenerationRequest::new(
            HeightmapSource::InMemory(Heightmap::new_with(8, 8, 0.0)),
            config(vec![MaterialDefinition::new("base")]),
        );
        compositor.generate(good).unwrap();
        assert!(compositor.failure().is_none());
    }

    #[test]
    fn test_road_along_cliff_reports_side_slope() {
        let mut terrain = Heightmap::new(128, 128);
        for (_, y, v) in terrain.iter_mut() {
            *v = if y >= 64 { 40.0 } else { 0.0 };
        }
        let params = RoadSmoothingParameters {
            side_max_slope_degrees: Some(10.0),
            terrain_affected_range_m: 3.0,
            ..RoadSmoothingParameters::default()
        };
        let request = GenerationRequest::new(
            HeightmapSource::InMemory(terrain),
            config(vec![
                MaterialDefinition::new("base"),
                road_material("road", band(128, 128, true, 62, 66), params),
            ]),
        );
        let mut cache = GenerationCache::new();
        let plan = Compositor::new(&mut cache).analyze(request).unwrap();
        assert!(plan.roads[0].stats.stamps.widened > 0);
        assert!(plan.warnings.iter().any(|w| w.kind == WarningKind::SideSlopeUnreachable));
        assert!(plan.log.warnings().any(|e| e.message.contains("Side Slope Unreachable")));
    }

    #[test]
    fn test_layer_threshold_controls_coverage() {
        let mut mask = Tilemap::new_with(16, 16, 0u8);
        for x in 0..16 {
            mask.set(x, 4, 100);
        }
        let run = |threshold: u8| {
            let request = GenerationRequest::new(
                HeightmapSource::InMemory(Heightmap::new_with(16, 16, 0.0)),
                config(vec![
                    MaterialDefinition::new("base"),
                    MaterialDefinition::new("gravel").with_layer(LayerSource::InMemory {
                        mask: mask.clone(),
                        threshold,
                    }),
                ]),
            );
            let mut cache = GenerationCache::new();
            let result = Compositor::new(&mut cache).generate(request).unwrap();
            result.metadata.material_pixel_counts[1].1
        };
        assert_eq!(run(50), 16);
        assert_eq!(run(128), 0);
    }
}
