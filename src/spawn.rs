//! Spawn-point suggestion for downstream placement.

use serde::{Deserialize, Serialize};

use crate::network::RoadLayer;
use crate::point::Point;
use crate::tilemap::Heightmap;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// Terrain pixel position
    pub position: Point,
    /// Final terrain elevation at `position`
    pub elevation: f32,
    /// Radians from +x toward +y (image rows grow downward)
    pub heading: f32,
    pub on_road: bool,
}

/// Middle of the longest road path, facing along it. Falls back to the
/// terrain center when there are no roads.
pub fn suggest_spawn(layers: &[RoadLayer], heightmap: &Heightmap) -> SpawnPoint {
    let longest = layers
        .iter()
        .flat_map(|l| l.network.paths())
        .filter(|p| !p.samples.is_empty())
        .max_by(|a, b| a.length().partial_cmp(&b.length()).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(path) = longest {
        let half = path.length() * 0.5;
        let mid = path
            .samples
            .iter()
            .min_by(|a, b| {
                (a.distance - half)
                    .abs()
                    .partial_cmp(&(b.distance - half).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied();
        if let Some(sample) = mid {
            return SpawnPoint {
                position: sample.position,
                elevation: heightmap.sample_bilinear(sample.position.x, sample.position.y),
                heading: sample.tangent.y.atan2(sample.tangent.x),
                on_road: true,
            };
        }
    }

    let center = Point::new(heightmap.width as f32 * 0.5, heightmap.height as f32 * 0.5);
    SpawnPoint {
        position: center,
        elevation: heightmap.sample_bilinear(center.x, center.y),
        heading: 0.0,
        on_road: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross_section::CrossSectionAccumulator;
    use crate::diagnostics::DiagnosticLog;
    use crate::network::{NetworkBuilder, RoadInput};
    use crate::params::RoadSmoothingParameters;
    use crate::paths::OrderedPath;

    #[test]
    fn test_falls_back_to_center() {
        let h = Heightmap::new_with(32, 16, 7.0);
        let spawn = suggest_spawn(&[], &h);
        assert!(!spawn.on_road);
        assert_eq!(spawn.position, Point::new(16.0, 8.0));
        assert!((spawn.elevation - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_midpoint_of_longest_road() {
        let params = RoadSmoothingParameters::default();
        let mut log = DiagnosticLog::new();
        let builder = NetworkBuilder::new(0, &params, 1.0, &mut log).unwrap();
        let terrain = Heightmap::new_with(64, 64, 10.0);
        let mut acc = CrossSectionAccumulator::new(64, 64);
        let input = RoadInput::Paths(vec![
            OrderedPath::new(vec![Point::new(32.0, 4.0), Point::new(32.0, 60.0)]),
            OrderedPath::new(vec![Point::new(2.0, 10.0), Point::new(22.0, 10.0)]),
        ]);
        let (network, stats) = builder.build(input, &terrain, &mut acc, &mut log);
        let layer = RoadLayer {
            material: 0,
            params: params.clone(),
            geometry: builder.geometry(),
            network,
            stats,
        };
        let spawn = suggest_spawn(std::slice::from_ref(&layer), &terrain);
        assert!(spawn.on_road);
        assert!((spawn.position.x - 32.0).abs() < 0.5);
        assert!((spawn.position.y - 32.0).abs() < 1.5);
        // Pointing along +y or -y
        assert!((spawn.heading.abs() - std::f32::consts::FRAC_PI_2).abs() < 0.1);
    }
}
