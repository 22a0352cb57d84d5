//! Geographic ↔ terrain pixel mapping.
//!
//! Two mappings are supported:
//! - **Raster**: a source raster's affine `GeoTransform` (optionally cropped) is
//!   inverted and scaled to the terrain size. Geographic rasters (degree-sized
//!   pixels) map lon/lat directly; projected rasters need their WGS84 bounds to
//!   accept lon/lat features.
//! - **Bounding box**: equirectangular projection of a lon/lat box, with the
//!   longitude scale corrected by cos(center latitude).

use serde::{Deserialize, Serialize};

use crate::error::{Result, TerrainError};
use crate::point::Point;

/// Meters per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Pixel sizes below this are treated as degrees.
const GEOGRAPHIC_PIXEL_SIZE: f64 = 0.1;

/// Min/max latitude and longitude in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl GeoBoundingBox {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self> {
        let bbox = Self { min_lat, min_lon, max_lat, max_lon };
        bbox.validate()?;
        Ok(bbox)
    }

    /// min ≤ max on both axes, all values finite.
    pub fn validate(&self) -> Result<()> {
        let values = [self.min_lat, self.min_lon, self.max_lat, self.max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(TerrainError::geometry("bounding box has non-finite coordinates"));
        }
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(TerrainError::geometry(format!(
                "bounding box min exceeds max: lat {}..{}, lon {}..{}",
                self.min_lat, self.max_lat, self.min_lon, self.max_lon
            )));
        }
        Ok(())
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_lat + self.max_lat) * 0.5, (self.min_lon + self.max_lon) * 0.5)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn lon_span(&self) -> f64 {
        self.max_lon - self.min_lon
    }
}

/// Six-coefficient affine transform from raster pixel space to the raster's
/// native CRS, in the conventional order
/// `[origin_x, pixel_width, row_rotation, origin_y, column_rotation, pixel_height]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub column_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_coefficients(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            origin_y: c[3],
            column_rotation: c[4],
            pixel_height: c[5],
        }
    }

    pub fn coefficients(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.column_rotation,
            self.pixel_height,
        ]
    }

    /// Degree-based when the pixel size is tiny.
    pub fn is_geographic(&self) -> bool {
        self.pixel_width.abs() < GEOGRAPHIC_PIXEL_SIZE
    }

    pub fn pixel_to_native(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.column_rotation + row * self.pixel_height,
        )
    }

    /// Inverse affine. Fails for a singular transform.
    pub fn native_to_pixel(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.column_rotation;
        if det.abs() < 1e-18 || !det.is_finite() {
            return Err(TerrainError::projection("geo transform is singular"));
        }
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.column_rotation) / det;
        Ok((col, row))
    }
}

/// Sub-rectangle of the native raster that became the terrain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropWindow {
    pub offset_x: usize,
    pub offset_y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrsKind {
    Geographic,
    Projected,
}

#[derive(Clone, Debug, PartialEq)]
enum Mapping {
    Raster {
        transform: GeoTransform,
        crop: CropWindow,
        /// Terrain pixels per native pixel
        scale_x: f64,
        scale_y: f64,
        /// Lon/lat bounds for projected rasters
        wgs84_bounds: Option<GeoBoundingBox>,
    },
    BoundingBox {
        bbox: GeoBoundingBox,
        cos_lat: f64,
        meters_per_pixel: f64,
    },
}

/// Bidirectional geo ↔ terrain-pixel mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinateTransformer {
    mapping: Mapping,
    kind: CrsKind,
    projection: String,
    terrain_width: usize,
    terrain_height: usize,
}

impl CoordinateTransformer {
    /// Build from a source raster's transform.
    ///
    /// `crop` defaults to the full native raster. Projected rasters without
    /// `wgs84_bounds` can still map native coordinates, but `geo_to_pixel`
    /// will fail for them.
    pub fn from_raster(
        transform: GeoTransform,
        projection: &str,
        native_size: (usize, usize),
        terrain_size: (usize, usize),
        crop: Option<CropWindow>,
        wgs84_bounds: Option<GeoBoundingBox>,
    ) -> Result<Self> {
        let (native_w, native_h) = native_size;
        let (terrain_w, terrain_h) = terrain_size;
        if native_w == 0 || native_h == 0 || terrain_w == 0 || terrain_h == 0 {
            return Err(TerrainError::projection("raster and terrain sizes must be non-zero"));
        }
        let crop = crop.unwrap_or(CropWindow {
            offset_x: 0,
            offset_y: 0,
            width: native_w,
            height: native_h,
        });
        if crop.width == 0
            || crop.height == 0
            || crop.offset_x + crop.width > native_w
            || crop.offset_y + crop.height > native_h
        {
            return Err(TerrainError::projection(format!(
                "crop window {:?} exceeds native raster {}x{}",
                crop, native_w, native_h
            )));
        }
        // Validates invertibility up front.
        transform.native_to_pixel(transform.origin_x, transform.origin_y)?;
        if let Some(bounds) = wgs84_bounds {
            bounds.validate()?;
        }

        let kind = if transform.is_geographic() {
            CrsKind::Geographic
        } else {
            CrsKind::Projected
        };

        Ok(Self {
            mapping: Mapping::Raster {
                transform,
                crop,
                scale_x: terrain_w as f64 / crop.width as f64,
                scale_y: terrain_h as f64 / crop.height as f64,
                wgs84_bounds,
            },
            kind,
            projection: projection.to_string(),
            terrain_width: terrain_w,
            terrain_height: terrain_h,
        })
    }

    /// Equirectangular mapping of a lon/lat box onto the terrain, fitted so
    /// the whole box is visible with square pixels.
    pub fn from_bounding_box(bbox: GeoBoundingBox, terrain_size: (usize, usize)) -> Result<Self> {
        bbox.validate()?;
        let (terrain_w, terrain_h) = terrain_size;
        if terrain_w == 0 || terrain_h == 0 {
            return Err(TerrainError::projection("terrain size must be non-zero"));
        }
        let (center_lat, _) = bbox.center();
        let cos_lat = center_lat.to_radians().cos();
        if cos_lat < 1e-6 {
            return Err(TerrainError::projection("bounding box is centered on a pole"));
        }
        let width_m = bbox.lon_span() * METERS_PER_DEGREE * cos_lat;
        let height_m = bbox.lat_span() * METERS_PER_DEGREE;
        let meters_per_pixel = (width_m / terrain_w as f64).max(height_m / terrain_h as f64);
        if meters_per_pixel <= 0.0 {
            return Err(TerrainError::projection("bounding box has zero extent"));
        }
        Ok(Self {
            mapping: Mapping::BoundingBox {
                bbox,
                cos_lat,
                meters_per_pixel,
            },
            kind: CrsKind::Geographic,
            projection: "EPSG:4326".to_string(),
            terrain_width: terrain_w,
            terrain_height: terrain_h,
        })
    }

    pub fn kind(&self) -> CrsKind {
        self.kind
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn terrain_size(&self) -> (usize, usize) {
        (self.terrain_width, self.terrain_height)
    }

    /// Native raster coordinates → terrain pixel.
    pub fn native_to_pixel(&self, x: f64, y: f64) -> Result<Point> {
        match &self.mapping {
            Mapping::Raster { transform, crop, scale_x, scale_y, .. } => {
                let (col, row) = transform.native_to_pixel(x, y)?;
                Ok(Point::new(
                    ((col - crop.offset_x as f64) * scale_x) as f32,
                    ((row - crop.offset_y as f64) * scale_y) as f32,
                ))
            }
            Mapping::BoundingBox { .. } => self.geo_to_pixel(y, x),
        }
    }

    /// Latitude/longitude (degrees) → terrain pixel.
    pub fn geo_to_pixel(&self, lat: f64, lon: f64) -> Result<Point> {
        match &self.mapping {
            Mapping::BoundingBox { bbox, cos_lat, meters_per_pixel } => {
                let x = (lon - bbox.min_lon) * METERS_PER_DEGREE * cos_lat / meters_per_pixel;
                let y = (bbox.max_lat - lat) * METERS_PER_DEGREE / meters_per_pixel;
                Ok(Point::new(x as f32, y as f32))
            }
            Mapping::Raster { wgs84_bounds, .. } => match self.kind {
                CrsKind::Geographic => self.native_to_pixel(lon, lat),
                CrsKind::Projected => {
                    let bounds = wgs84_bounds.ok_or_else(|| {
                        TerrainError::projection(format!(
                            "projected raster ({}) has no geographic bounds; cannot place lon/lat features",
                            self.projection
                        ))
                    })?;
                    if bounds.lon_span() <= 0.0 || bounds.lat_span() <= 0.0 {
                        return Err(TerrainError::projection("geographic bounds have zero extent"));
                    }
                    let x = (lon - bounds.min_lon) / bounds.lon_span() * self.terrain_width as f64;
                    let y = (bounds.max_lat - lat) / bounds.lat_span() * self.terrain_height as f64;
                    Ok(Point::new(x as f32, y as f32))
                }
            },
        }
    }

    /// Terrain pixel → (latitude, longitude).
    pub fn pixel_to_geo(&self, p: Point) -> Result<(f64, f64)> {
        match &self.mapping {
            Mapping::BoundingBox { bbox, cos_lat, meters_per_pixel } => {
                let lon = bbox.min_lon + p.x as f64 * meters_per_pixel / (METERS_PER_DEGREE * cos_lat);
                let lat = bbox.max_lat - p.y as f64 * meters_per_pixel / METERS_PER_DEGREE;
                Ok((lat, lon))
            }
            Mapping::Raster { transform, crop, scale_x, scale_y, wgs84_bounds } => match self.kind {
                CrsKind::Geographic => {
                    let col = p.x as f64 / scale_x + crop.offset_x as f64;
                    let row = p.y as f64 / scale_y + crop.offset_y as f64;
                    let (lon, lat) = transform.pixel_to_native(col, row);
                    Ok((lat, lon))
                }
                CrsKind::Projected => {
                    let bounds = wgs84_bounds.ok_or_else(|| {
                        TerrainError::projection("projected raster has no geographic bounds")
                    })?;
                    let lon = bounds.min_lon + p.x as f64 / self.terrain_width as f64 * bounds.lon_span();
                    let lat = bounds.max_lat - p.y as f64 / self.terrain_height as f64 * bounds.lat_span();
                    Ok((lat, lon))
                }
            },
        }
    }

    /// Ground distance covered by one terrain pixel (meters), using the
    /// cos(center latitude) correction for degree-based sources.
    pub fn meters_per_pixel(&self) -> f64 {
        match &self.mapping {
            Mapping::BoundingBox { meters_per_pixel, .. } => *meters_per_pixel,
            Mapping::Raster { transform, crop, scale_x, scale_y, .. } => match self.kind {
                CrsKind::Projected => transform.pixel_width.abs() / scale_x,
                CrsKind::Geographic => {
                    let col = self.terrain_width as f64 * 0.5 / scale_x + crop.offset_x as f64;
                    let row = self.terrain_height as f64 * 0.5 / scale_y + crop.offset_y as f64;
                    let (_, lat) = transform.pixel_to_native(col, row);
                    transform.pixel_width.abs() * METERS_PER_DEGREE * lat.to_radians().cos() / scale_x
                }
            },
        }
    }
}
