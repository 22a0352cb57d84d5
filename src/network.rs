//! Road networks: the per-material result of turning a layer into road
//! paths with elevation targets.
//!
//! Both approaches expose the same `RoadPath` list, so junction handling and
//! spawn selection do not care how a network was extracted.

use rayon::prelude::*;

use crate::cross_section::{stamp_direct_mask, stamp_path, CrossSectionAccumulator, CrossSectionGeometry, StampStats};
use crate::diagnostics::DiagnosticLog;
use crate::error::Result;
use crate::features::rasterize_lines;
use crate::params::{RoadApproach, RoadSmoothingParameters};
use crate::paths::{OrderedPath, PathOrderer, PathOrdering};
use crate::skeleton::SkeletonGraph;
use crate::smoothing::{sample_profile, ElevationProfile, ProfileSmoother};
use crate::spline::{fit_path, SplineRejection, SplineSample};
use crate::tilemap::{Heightmap, Tilemap};

const SOURCE: &str = "network";

/// One fitted road path with its elevation profile.
#[derive(Clone, Debug)]
pub struct RoadPath {
    /// Slot index of the owning material
    pub material: usize,
    pub samples: Vec<SplineSample>,
    pub profile: ElevationProfile,
}

impl RoadPath {
    pub fn length(&self) -> f32 {
        self.samples.last().map_or(0.0, |s| s.distance)
    }

    pub fn targets(&self) -> &[f32] {
        &self.profile.target
    }
}

/// Road geometry handed to a network builder.
#[derive(Clone, Debug)]
pub enum RoadInput {
    /// Binary layer mask (painted or rasterized)
    Mask(Tilemap<bool>),
    /// Already vectorized centerlines
    Paths(Vec<OrderedPath>),
}

#[derive(Clone, Debug)]
pub enum RoadNetwork {
    Spline {
        paths: Vec<RoadPath>,
    },
    DirectMask {
        mask: Tilemap<bool>,
        /// Flattened elevation for each mask pixel
        targets: Tilemap<f32>,
        /// Skeleton centerlines, used for junctions and spawn placement
        centerlines: Vec<RoadPath>,
    },
}

impl RoadNetwork {
    pub fn approach(&self) -> RoadApproach {
        match self {
            RoadNetwork::Spline { .. } => RoadApproach::Spline,
            RoadNetwork::DirectMask { .. } => RoadApproach::DirectMask,
        }
    }

    pub fn paths(&self) -> &[RoadPath] {
        match self {
            RoadNetwork::Spline { paths } => paths,
            RoadNetwork::DirectMask { centerlines, .. } => centerlines,
        }
    }

    pub fn paths_mut(&mut self) -> &mut Vec<RoadPath> {
        match self {
            RoadNetwork::Spline { paths } => paths,
            RoadNetwork::DirectMask { centerlines, .. } => centerlines,
        }
    }
}

/// Counters from building one network.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetworkStats {
    pub paths: usize,
    /// Paths the spline fitter rejected
    pub rejected: usize,
    /// Spurs dropped by the path orderer
    pub dropped: usize,
    pub bridged: usize,
    pub stamps: StampStats,
}

/// A road material's network together with the settings it was built with.
#[derive(Clone, Debug)]
pub struct RoadLayer {
    /// Slot index of the owning material
    pub material: usize,
    pub params: RoadSmoothingParameters,
    pub geometry: CrossSectionGeometry,
    pub network: RoadNetwork,
    pub stats: NetworkStats,
}

/// Builds a road network for one material against the current terrain.
pub struct NetworkBuilder<'a> {
    material: usize,
    params: &'a RoadSmoothingParameters,
    geometry: CrossSectionGeometry,
    meters_per_pixel: f32,
    smoother: ProfileSmoother,
}

impl<'a> NetworkBuilder<'a> {
    pub fn new(
        material: usize,
        params: &'a RoadSmoothingParameters,
        meters_per_pixel: f32,
        log: &mut DiagnosticLog,
    ) -> Result<Self> {
        let smoother = ProfileSmoother::new(params, log)?;
        Ok(Self {
            material,
            params,
            geometry: CrossSectionGeometry::from_params(params, meters_per_pixel),
            meters_per_pixel: meters_per_pixel.max(1e-6),
            smoother,
        })
    }

    pub fn geometry(&self) -> CrossSectionGeometry {
        self.geometry
    }

    fn interval_px(&self) -> f32 {
        (self.params.cross_section_interval_m / self.meters_per_pixel).max(0.25)
    }

    /// Extract paths, smooth profiles, and stamp everything into `acc`.
    pub fn build(
        &self,
        input: RoadInput,
        terrain: &Heightmap,
        acc: &mut CrossSectionAccumulator,
        log: &mut DiagnosticLog,
    ) -> (RoadNetwork, NetworkStats) {
        match self.params.approach {
            RoadApproach::Spline => self.build_spline(input, terrain, acc, log),
            RoadApproach::DirectMask => self.build_direct(input, terrain, acc, log),
        }
    }

    fn order(&self, input: &RoadInput) -> PathOrdering {
        let orderer = PathOrderer::new(&self.params.spline);
        match input {
            RoadInput::Mask(mask) => {
                let graph = SkeletonGraph::from_mask(mask);
                log::debug!(
                    "material {}: skeleton with {} edges and {} junctions",
                    self.material,
                    graph.edges.len(),
                    graph.junction_count()
                );
                orderer.order_graph(&graph)
            }
            RoadInput::Paths(paths) => orderer.refine(paths.clone()),
        }
    }

    /// Fit and smooth paths in parallel; results keep input order.
    fn fit_paths(&self, paths: &[OrderedPath], terrain: &Heightmap, log: &mut DiagnosticLog) -> (Vec<RoadPath>, usize) {
        let interval_px = self.interval_px();
        let spacing_m = self.params.cross_section_interval_m;
        let fitted: Vec<std::result::Result<RoadPath, SplineRejection>> = paths
            .par_iter()
            .map(|path| -> std::result::Result<RoadPath, SplineRejection> {
                let fitted = fit_path(path, &self.params.spline, interval_px)?;
                let raw = sample_profile(terrain, &fitted.samples);
                let profile = self.smoother.smooth(&raw, spacing_m);
                Ok(RoadPath {
                    material: self.material,
                    samples: fitted.samples,
                    profile,
                })
            })
            .collect();

        let mut out = Vec::with_capacity(fitted.len());
        let mut rejected = 0;
        for (i, r) in fitted.into_iter().enumerate() {
            match r {
                Ok(p) => out.push(p),
                Err(e) => {
                    rejected += 1;
                    log.warn(SOURCE, format!("material {} path {} rejected: {}", self.material, i, e));
                }
            }
        }
        (out, rejected)
    }

    fn build_spline(
        &self,
        input: RoadInput,
        terrain: &Heightmap,
        acc: &mut CrossSectionAccumulator,
        log: &mut DiagnosticLog,
    ) -> (RoadNetwork, NetworkStats) {
        let ordering = self.order(&input);
        let (paths, rejected) = self.fit_paths(&ordering.paths, terrain, log);

        let mut stamps = StampStats::default();
        for path in &paths {
            stamps.merge(stamp_path(acc, terrain, &path.samples, path.targets(), &self.geometry));
        }
        let stats = NetworkStats {
            paths: paths.len(),
            rejected,
            dropped: ordering.dropped,
            bridged: ordering.bridged,
            stamps,
        };
        (RoadNetwork::Spline { paths }, stats)
    }

    fn build_direct(
        &self,
        input: RoadInput,
        terrain: &Heightmap,
        acc: &mut CrossSectionAccumulator,
        log: &mut DiagnosticLog,
    ) -> (RoadNetwork, NetworkStats) {
        let mask = match input {
            RoadInput::Mask(mask) => mask,
            RoadInput::Paths(paths) => {
                let width_px = self.params.road_width_m / self.meters_per_pixel;
                rasterize_lines(&paths, width_px, terrain.width, terrain.height).map(|&v| v > 0)
            }
        };

        let window = if self.params.filter.enabled { self.params.filter.window_size } else { 0 };
        let radius = (window / 2).max(self.geometry.half_width_px.ceil() as usize);
        let targets = stamp_direct_mask(
            acc,
            terrain,
            &mask,
            &self.geometry,
            radius,
            self.params.global_leveling_strength,
        );

        // Centerlines carry the flattened targets for junction handling
        let ordering = self.order(&RoadInput::Mask(mask.clone()));
        let (mut centerlines, rejected) = self.fit_paths(&ordering.paths, terrain, log);
        for path in &mut centerlines {
            path.profile.target = path
                .samples
                .iter()
                .map(|s| targets.sample_bilinear(s.position.x, s.position.y))
                .collect();
        }

        let stats = NetworkStats {
            paths: centerlines.len(),
            rejected,
            dropped: ordering.dropped,
            bridged: ordering.bridged,
            stamps: StampStats {
                stamps: mask.count_set(),
                ..StampStats::default()
            },
        };
        (RoadNetwork::DirectMask { mask, targets, centerlines }, stats)
    }
}
