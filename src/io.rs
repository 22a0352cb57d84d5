//! Image input and output: heightmaps, layer masks and debug overlays.

use std::path::Path;

use image::{ColorType, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::error::{Result, TerrainError};
use crate::junctions::JunctionSite;
use crate::network::RoadLayer;
use crate::tilemap::{Heightmap, Tilemap};

/// Load a greyscale PNG as elevations: `base + normalized * scale`, where
/// `normalized` is 0..1 over the file's bit depth.
pub fn load_heightmap(path: &Path, elevation_scale: f32, base_elevation: f32) -> Result<Heightmap> {
    let img = image::open(path)
        .map_err(|e| TerrainError::MissingHeightmap(format!("{}: {}", path.display(), e)))?;
    let sixteen_bit = matches!(
        img.color(),
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16
    );
    let (w, h) = (img.width() as usize, img.height() as usize);
    let data: Vec<f32> = if sixteen_bit {
        img.to_luma16()
            .into_raw()
            .into_iter()
            .map(|v| base_elevation + v as f32 / u16::MAX as f32 * elevation_scale)
            .collect()
    } else {
        img.to_luma8()
            .into_raw()
            .into_iter()
            .map(|v| base_elevation + v as f32 / u8::MAX as f32 * elevation_scale)
            .collect()
    };
    log::debug!(
        "Loaded {}x{} {}-bit heightmap from {}",
        w,
        h,
        if sixteen_bit { 16 } else { 8 },
        path.display()
    );
    Tilemap::from_vec(w, h, data)
        .ok_or_else(|| TerrainError::MissingHeightmap(format!("{}: empty image", path.display())))
}

/// Load a greyscale layer mask (0-255).
pub fn load_mask(path: &Path) -> Result<Tilemap<u8>> {
    let img = image::open(path)?.to_luma8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    Tilemap::from_vec(w, h, img.into_raw()).ok_or_else(|| TerrainError::geometry(format!("{}: empty mask", path.display())))
}

/// Normalize to the full 16-bit range. Returns the image and the (min, max)
/// elevation it spans.
pub fn heightmap_to_luma16(heightmap: &Heightmap) -> (ImageBuffer<Luma<u16>, Vec<u16>>, (f32, f32)) {
    let (min, max) = heightmap.min_max();
    let range = (max - min).max(f32::EPSILON);
    let mut img = ImageBuffer::new(heightmap.width as u32, heightmap.height as u32);
    for (x, y, &v) in heightmap.iter() {
        let n = ((v - min) / range).clamp(0.0, 1.0);
        img.put_pixel(x as u32, y as u32, Luma([(n * u16::MAX as f32).round() as u16]));
    }
    (img, (min, max))
}

/// Write a 16-bit greyscale PNG; returns the elevation range it encodes.
pub fn save_heightmap_png16(heightmap: &Heightmap, path: &Path) -> Result<(f32, f32)> {
    let (img, range) = heightmap_to_luma16(heightmap);
    img.save(path)?;
    Ok(range)
}

pub fn save_mask_png(mask: &Tilemap<u8>, path: &Path) -> Result<()> {
    let mut img: GrayImage = ImageBuffer::new(mask.width as u32, mask.height as u32);
    for (x, y, &v) in mask.iter() {
        img.put_pixel(x as u32, y as u32, Luma([v]));
    }
    img.save(path)?;
    Ok(())
}

/// Grey hillshade, lit from the upper left.
pub fn render_shaded(heightmap: &Heightmap) -> RgbImage {
    let (min_h, max_h) = heightmap.min_max();
    let range = (max_h - min_h).max(1.0);
    let (w, h) = (heightmap.width, heightmap.height);
    let mut img = ImageBuffer::new(w as u32, h as u32);

    let light_len = (0.7f32 * 0.7 + 0.7 * 0.7 + 0.5 * 0.5).sqrt();
    let (lx, ly, lz) = (-0.7 / light_len, -0.7 / light_len, 0.5 / light_len);

    for y in 0..h {
        for x in 0..w {
            let v = *heightmap.get(x, y);
            let left = *heightmap.get(x.saturating_sub(1), y);
            let right = *heightmap.get((x + 1).min(w - 1), y);
            let up = *heightmap.get(x, y.saturating_sub(1));
            let down = *heightmap.get(x, (y + 1).min(h - 1));

            let (nx, ny, nz) = (left - right, up - down, 1.0f32);
            let nlen = (nx * nx + ny * ny + nz * nz).sqrt();
            let diffuse = ((nx * lx + ny * ly + nz * lz) / nlen).max(0.0);
            let lighting = (0.3 + 0.7 * diffuse).min(1.0);

            let base = 60.0 + 160.0 * (v - min_h) / range;
            let g = (base * lighting).clamp(0.0, 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([g, g, g]));
        }
    }
    img
}

fn tint(img: &mut RgbImage, x: u32, y: u32, color: [u8; 3], alpha: f32) {
    if x >= img.width() || y >= img.height() {
        return;
    }
    let p = img.get_pixel_mut(x, y);
    for c in 0..3 {
        p.0[c] = (p.0[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha) as u8;
    }
}

fn cross(img: &mut RgbImage, cx: f32, cy: f32, size: i64, color: [u8; 3]) {
    for d in -size..=size {
        for (x, y) in [(cx as i64 + d, cy as i64), (cx as i64, cy as i64 + d)] {
            if x >= 0 && y >= 0 {
                tint(img, x as u32, y as u32, color, 1.0);
            }
        }
    }
}

/// Shaded terrain with the layer mask in blue, fitted road samples in red
/// and junctions as yellow crosses (grey when excluded).
pub fn render_debug_overlay(
    heightmap: &Heightmap,
    mask: Option<&Tilemap<bool>>,
    layers: &[RoadLayer],
    junctions: &[JunctionSite],
) -> RgbImage {
    let mut img = render_shaded(heightmap);

    if let Some(mask) = mask {
        for (x, y, &m) in mask.iter() {
            if m {
                tint(&mut img, x as u32, y as u32, [40, 90, 230], 0.45);
            }
        }
    }

    for path in layers.iter().flat_map(|l| l.network.paths()) {
        for s in &path.samples {
            if let Some((x, y)) = s.position.to_pixel() {
                tint(&mut img, x as u32, y as u32, [230, 40, 40], 1.0);
            }
        }
    }

    for site in junctions {
        let color = if site.excluded { [150, 150, 150] } else { [250, 220, 30] };
        cross(&mut img, site.position.x, site.position.y, 3, color);
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("road_terrain_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_heightmap_png16_round_trip_range() {
        let mut h = Heightmap::new(8, 4);
        for (x, _, v) in h.iter_mut() {
            *v = 100.0 + x as f32 * 10.0;
        }
        let path = temp_path("height.png");
        let (min, max) = save_heightmap_png16(&h, &path).unwrap();
        assert_eq!((min, max), (100.0, 170.0));

        let loaded = load_heightmap(&path, max - min, min).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!((loaded.width, loaded.height), (8, 4));
        for (a, b) in h.data().iter().zip(loaded.data()) {
            assert!((a - b).abs() < 0.01, "{a} vs {b}");
        }
    }

    #[test]
    fn test_mask_save_and_load() {
        let mut mask = Tilemap::new_with(5, 5, 0u8);
        mask.set(2, 3, 255);
        let path = temp_path("mask.png");
        save_mask_png(&mask, &path).unwrap();
        let loaded = load_mask(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, mask);
    }

    #[test]
    fn test_missing_heightmap_is_reported() {
        let err = load_heightmap(Path::new("/nonexistent/height.png"), 1.0, 0.0).unwrap_err();
        assert!(matches!(err, TerrainError::MissingHeightmap(_)));
    }

    #[test]
    fn test_overlay_marks_mask() {
        let h = Heightmap::new_with(10, 10, 5.0);
        let mut mask = Tilemap::new(10, 10);
        mask.set(4, 4, true);
        let img = render_debug_overlay(&h, Some(&mask), &[], &[]);
        let marked = img.get_pixel(4, 4);
        let plain = img.get_pixel(0, 0);
        assert!(marked.0[2] > plain.0[2]);
    }
}
