use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::json;

use road_terrain::features::FeatureCollection;
use road_terrain::geo::GenerationCache;
use road_terrain::io::{save_heightmap_png16, save_mask_png};
use road_terrain::{Compositor, GenerationConfig, GenerationRequest, HeightmapSource, Progress, Result};

#[derive(Parser, Debug)]
#[command(name = "road_terrain")]
#[command(about = "Flatten and blend road corridors into a terrain heightmap")]
struct Args {
    /// Input heightmap (8 or 16-bit greyscale PNG)
    heightmap: PathBuf,

    /// Generation config (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Pre-fetched feature collection for vector layers (JSON)
    #[arg(short, long)]
    features: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Elevation span of the full heightmap value range
    #[arg(long, default_value = "1000.0")]
    elevation_scale: f32,

    /// Elevation of heightmap value zero
    #[arg(long, default_value = "0.0")]
    base_elevation: f32,

    /// Write per-material debug overlays
    #[arg(long)]
    debug: bool,

    /// Stop after analysis and write the detected junctions for review
    #[arg(long)]
    analyze_only: bool,

    /// Junction id to leave out of harmonization (repeatable)
    #[arg(long = "exclude-junction")]
    exclude_junction: Vec<usize>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = GenerationConfig::load(&args.config)?;
    config.debug |= args.debug;

    let mut request = GenerationRequest::new(
        HeightmapSource::File {
            path: args.heightmap.clone(),
            elevation_scale: args.elevation_scale,
            base_elevation: args.base_elevation,
        },
        config,
    );
    if let Some(path) = &args.features {
        let text = std::fs::read_to_string(path)?;
        request = request.with_features(FeatureCollection::from_json(&text)?);
    }
    std::fs::create_dir_all(&args.output)?;

    let mut cache = GenerationCache::new();
    let mut compositor = Compositor::new(&mut cache).with_progress(Box::new(|p: &Progress| {
        println!("[{:3.0}%] {}", p.fraction * 100.0, p.message);
    }));

    let mut plan = compositor.analyze(request)?;
    println!("Found {} road paths and {} junctions", plan.path_count(), plan.junctions.len());
    for j in &plan.junctions {
        println!(
            "  junction {}: ({:.1}, {:.1}) elevation {:.2}, {} paths",
            j.id,
            j.position.x,
            j.position.y,
            j.blended_elevation,
            j.members.len()
        );
    }

    if args.analyze_only {
        let path = args.output.join("junctions.json");
        std::fs::write(&path, serde_json::to_string_pretty(&plan.junctions)?)?;
        println!("Wrote junction review to {}", path.display());
        return Ok(());
    }

    for &id in &args.exclude_junction {
        if !plan.exclude_junction(id) {
            log::warn!("No junction with id {}", id);
        }
    }

    let result = compositor.commit(plan)?;
    let (min, max) = save_heightmap_png16(&result.heightmap, &args.output.join("heightmap.png"))?;
    println!("Heightmap range: {:.2} to {:.2}", min, max);

    save_mask_png(&result.material_index, &args.output.join("material_index.png"))?;
    for layer in &result.layers {
        save_mask_png(&layer.map, &layer_path(&args.output, "layer", layer.index, &layer.name))?;
    }
    for (i, (name, overlay)) in result.debug_overlays.iter().enumerate() {
        overlay.save(layer_path(&args.output, "debug", i, name))?;
    }

    let summary = json!({
        "metadata": result.metadata,
        "spawn": result.spawn,
        "junctions": result.junctions,
        "warnings": result.warnings,
        "log": result.log.entries(),
    });
    std::fs::write(args.output.join("result.json"), serde_json::to_string_pretty(&summary)?)?;

    println!(
        "Done: {} paths ({} rejected), {} junctions ({} excluded), {} warnings",
        result.metadata.path_count,
        result.metadata.rejected_paths,
        result.metadata.junction_count,
        result.metadata.excluded_junctions,
        result.log.warning_count()
    );
    Ok(())
}

fn layer_path(dir: &Path, prefix: &str, index: usize, name: &str) -> PathBuf {
    let clean: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("{}_{:02}_{}.png", prefix, index, clean))
}
