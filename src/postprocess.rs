//! Final smoothing pass over road-affected terrain.
//!
//! Restricted to the union of all affected pixels, grown by a margin, so
//! untouched terrain keeps its original detail.

use rayon::prelude::*;

use crate::cross_section::nearest_site;
use crate::diagnostics::{DiagnosticLog, ValidationWarning, WarningKind};
use crate::params::{odd_window, PostFilterKind, PostProcessingParameters};
use crate::tilemap::{Heightmap, Tilemap};

const SOURCE: &str = "postprocess";

/// Grow `mask` by `radius_px` (Euclidean).
pub fn extend_mask(mask: &Tilemap<bool>, radius_px: f32) -> Tilemap<bool> {
    if radius_px <= 0.0 {
        return mask.clone();
    }
    let sites = nearest_site(mask);
    let r2 = radius_px * radius_px;
    let mut out = Tilemap::new(mask.width, mask.height);
    for (x, y, site) in sites.iter() {
        if let Some((sx, sy)) = *site {
            let dx = x as f32 - sx as f32;
            let dy = y as f32 - sy as f32;
            if dx * dx + dy * dy <= r2 {
                out.set(x, y, true);
            }
        }
    }
    out
}

#[derive(Clone, Debug)]
pub struct PostProcessor {
    kind: PostFilterKind,
    /// Odd kernel size in pixels
    kernel: usize,
    /// Gaussian weights, `kernel * kernel`, row-major
    weights: Vec<f32>,
    iterations: usize,
}

impl PostProcessor {
    pub fn new(params: &PostProcessingParameters, log: &mut DiagnosticLog) -> Self {
        let (kernel, corrected) = odd_window(params.kernel_size.max(1));
        if corrected {
            log.advisory(
                SOURCE,
                &ValidationWarning::new(
                    WarningKind::EvenWindowSize,
                    format!("post-processing kernel {} is even, using {}", params.kernel_size, kernel),
                    "use an odd kernel size",
                ),
            );
        }
        let half = (kernel / 2) as i64;
        let sigma = params.sigma.max(1e-3);
        let weights = (-half..=half)
            .flat_map(|dy| (-half..=half).map(move |dx| (dx, dy)))
            .map(|(dx, dy)| (-((dx * dx + dy * dy) as f32) / (2.0 * sigma * sigma)).exp())
            .collect();
        Self {
            kind: params.kind,
            kernel,
            weights,
            iterations: params.iterations,
        }
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel
    }

    /// Smooth `heightmap` inside `mask` for the configured iterations.
    /// Neighbours outside the mask are read but never written.
    pub fn apply(&self, heightmap: &mut Heightmap, mask: &Tilemap<bool>) {
        for _ in 0..self.iterations {
            // Compute all rows in parallel, then write serially
            let current: &Heightmap = heightmap;
            let updates: Vec<Vec<(usize, f32)>> = (0..current.height)
                .into_par_iter()
                .map(|y| {
                    let mut row = Vec::new();
                    let mut window = Vec::with_capacity(self.kernel * self.kernel);
                    for x in 0..current.width {
                        if *mask.get(x, y) {
                            row.push((x, self.filter_at(current, x, y, &mut window)));
                        }
                    }
                    row
                })
                .collect();
            for (y, row) in updates.into_iter().enumerate() {
                for (x, v) in row {
                    heightmap.set(x, y, v);
                }
            }
        }
    }

    fn filter_at(&self, heightmap: &Heightmap, x: usize, y: usize, window: &mut Vec<f32>) -> f32 {
        let half = (self.kernel / 2) as i64;
        let mut sum = 0.0f32;
        let mut weight = 0.0f32;
        window.clear();
        for dy in -half..=half {
            for dx in -half..=half {
                let Some(&v) = heightmap.get_checked(x as i64 + dx, y as i64 + dy) else { continue };
                match self.kind {
                    PostFilterKind::Gaussian => {
                        let w = self.weights[((dy + half) as usize) * self.kernel + (dx + half) as usize];
                        sum += v * w;
                        weight += w;
                    }
                    PostFilterKind::Box => {
                        sum += v;
                        weight += 1.0;
                    }
                    PostFilterKind::Median => window.push(v),
                }
            }
        }
        match self.kind {
            PostFilterKind::Median => {
                window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                window.get(window.len() / 2).copied().unwrap_or(*heightmap.get(x, y))
            }
            _ if weight > 0.0 => sum / weight,
            _ => *heightmap.get(x, y),
        }
    }
}
