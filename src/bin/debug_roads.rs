//! Debug tool for comparing road smoothing settings visually
//! Generates a grid of shaded heightmaps, one per parameter variant

use image::{ImageBuffer, Rgb, RgbImage};
use noise::{NoiseFn, Perlin};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use road_terrain::blend::BlendFunction;
use road_terrain::features::rasterize_lines;
use road_terrain::geo::GenerationCache;
use road_terrain::io::{render_debug_overlay, render_shaded};
use road_terrain::material::{LayerSource, MaterialDefinition};
use road_terrain::params::{
    PostProcessingParameters, ProfileFilter, ProfileFilterKind, RoadApproach, RoadSmoothingParameters,
};
use road_terrain::paths::OrderedPath;
use road_terrain::point::Point;
use road_terrain::{Compositor, GenerationConfig, GenerationRequest, Heightmap, HeightmapSource};

const SIZE: usize = 256;
const SEED: u64 = 42;
const ROADS: usize = 3;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    println!("Generating road comparison grid...");

    let terrain = generate_terrain(SEED);
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let roads: Vec<OrderedPath> = (0..ROADS).map(|_| random_road(&mut rng)).collect();
    let mask = rasterize_lines(&roads, 6.0, SIZE, SIZE);

    let base = RoadSmoothingParameters {
        road_width_m: 6.0,
        terrain_affected_range_m: 10.0,
        ..RoadSmoothingParameters::default()
    };
    let variants: Vec<(&str, RoadSmoothingParameters, bool)> = vec![
        ("Spline cosine", base.clone(), true),
        (
            "Spline linear",
            RoadSmoothingParameters {
                blend_function: BlendFunction::Linear,
                ..base.clone()
            },
            true,
        ),
        ("Spline no post", base.clone(), false),
        (
            "Box filter",
            RoadSmoothingParameters {
                filter: ProfileFilter {
                    kind: ProfileFilterKind::Box,
                    window_size: 15,
                    ..base.filter.clone()
                },
                ..base.clone()
            },
            true,
        ),
        (
            "Direct mask",
            RoadSmoothingParameters {
                approach: RoadApproach::DirectMask,
                ..base.clone()
            },
            true,
        ),
        (
            "Strong leveling",
            RoadSmoothingParameters {
                global_leveling_strength: 0.8,
                ..base.clone()
            },
            true,
        ),
    ];

    let mut images: Vec<RgbImage> = vec![render_shaded(&terrain)];
    let mut cache = GenerationCache::new();

    for (name, params, post) in &variants {
        println!("  Processing: {}", name);
        let config = GenerationConfig {
            meters_per_pixel: Some(1.0),
            materials: vec![
                MaterialDefinition::new("ground"),
                MaterialDefinition::new("road")
                    .with_layer(LayerSource::InMemory {
                        mask: mask.clone(),
                        threshold: 128,
                    })
                    .with_road(params.clone()),
            ],
            post_processing: PostProcessingParameters {
                enabled: *post,
                ..PostProcessingParameters::default()
            },
            ..GenerationConfig::default()
        };
        let request = GenerationRequest::new(HeightmapSource::InMemory(terrain.clone()), config);
        let mut compositor = Compositor::new(&mut cache);
        let plan = compositor.analyze(request).expect("analysis failed");
        let overlay_roads = plan.roads.clone();
        let junctions = plan.junctions.clone();
        let result = compositor.commit(plan).expect("commit failed");
        println!(
            "    {} paths, {} junctions, {} tapered ends, {} warnings",
            result.metadata.path_count,
            result.metadata.junction_count,
            result.metadata.tapered_ends,
            result.log.warning_count()
        );
        if images.len() == 1 {
            let road_mask = mask.map(|&v| v > 0);
            images.push(render_debug_overlay(&terrain, Some(&road_mask), &overlay_roads, &junctions));
        }
        images.push(render_shaded(&result.heightmap));
    }

    // Original, overlay, then variants in order
    let grid = create_grid(&images, 4);
    grid.save("road_comparison.png").expect("Failed to save grid");
    println!("Saved road_comparison.png");
}

fn generate_terrain(seed: u64) -> Heightmap {
    let perlin = Perlin::new(seed as u32);
    let detail = Perlin::new(seed as u32 + 1111);
    let mut h = Heightmap::new(SIZE, SIZE);
    for (x, y, v) in h.iter_mut() {
        let (fx, fy) = (x as f64 / SIZE as f64, y as f64 / SIZE as f64);
        let hills = perlin.get([fx * 3.0, fy * 3.0]) * 40.0;
        let bumps = detail.get([fx * 24.0, fy * 24.0]) * 3.0;
        *v = (100.0 + hills + bumps) as f32;
    }
    h
}

/// Wandering road from one edge toward the other.
fn random_road(rng: &mut ChaCha8Rng) -> OrderedPath {
    let margin = SIZE as f32 * 0.1;
    let mut p = Point::new(0.0, rng.gen_range(margin..SIZE as f32 - margin));
    let mut heading: f32 = rng.gen_range(-0.4..0.4);
    let mut points = vec![p];
    while p.x < SIZE as f32 && p.y >= 0.0 && p.y < SIZE as f32 {
        heading = (heading + rng.gen_range(-0.25..0.25)).clamp(-0.9, 0.9);
        p = p + Point::new(heading.cos(), heading.sin()) * 12.0;
        points.push(p);
    }
    OrderedPath::new(points)
}

fn create_grid(images: &[RgbImage], cols: usize) -> RgbImage {
    if images.is_empty() {
        return ImageBuffer::new(1, 1);
    }
    let cell_width = images[0].width();
    let cell_height = images[0].height();
    let rows = images.len().div_ceil(cols);
    let gap = 4u32;

    let mut grid: RgbImage = ImageBuffer::from_pixel(
        (cell_width + gap) * cols as u32,
        (cell_height + gap) * rows as u32,
        Rgb([40, 40, 40]),
    );
    for (idx, img) in images.iter().enumerate() {
        let x_offset = (idx % cols) as u32 * (cell_width + gap);
        let y_offset = (idx / cols) as u32 * (cell_height + gap);
        for y in 0..cell_height.min(img.height()) {
            for x in 0..cell_width.min(img.width()) {
                grid.put_pixel(x_offset + x, y_offset + y, *img.get_pixel(x, y));
            }
        }
    }
    grid
}
