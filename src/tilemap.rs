/// A 2D grid addressed by integer pixel coordinates, row-major.
///
/// Terrain rasters do not wrap: every accessor clamps or rejects coordinates
/// outside `0..width` / `0..height`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tilemap<T> {
    pub width: usize,
    pub height: usize,
    data: Vec<T>,
}

/// Elevation grid in meters.
pub type Heightmap = Tilemap<f32>;

impl<T: Clone + Default> Tilemap<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::default(); width * height],
        }
    }
}

impl<T: Clone> Tilemap<T> {
    pub fn new_with(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Wrap an existing row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self { width, height, data })
    }

    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y * self.width + x
    }

    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.index(x, y)]
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        let idx = self.index(x, y);
        &mut self.data[idx]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    /// Signed lookup; `None` outside the grid.
    pub fn get_checked(&self, x: i64, y: i64) -> Option<&T> {
        if self.contains(x, y) {
            Some(self.get(x as usize, y as usize))
        } else {
            None
        }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn same_size<U>(&self, other: &Tilemap<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// 8-connected neighbors, clipped at the grid edges.
    pub fn neighbors_8(&self, x: usize, y: usize) -> Vec<(usize, usize)> {
        let mut result = Vec::with_capacity(8);
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if self.contains(nx, ny) {
                    result.push((nx as usize, ny as usize));
                }
            }
        }
        result
    }

    /// Iterate over all cells with their coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        let width = self.width;
        self.data.iter().enumerate().map(move |(idx, val)| {
            (idx % width, idx / width, val)
        })
    }

    /// Iterate mutably over all cells with their coordinates.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, usize, &mut T)> {
        let width = self.width;
        self.data.iter_mut().enumerate().map(move |(idx, val)| {
            (idx % width, idx / width, val)
        })
    }

    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> Tilemap<U> {
        Tilemap {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Nearest-neighbour resample, used for masks that arrive at a different resolution.
    pub fn resize_nearest(&self, width: usize, height: usize) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let sy = (y * self.height / height.max(1)).min(self.height - 1);
            for x in 0..width {
                let sx = (x * self.width / width.max(1)).min(self.width - 1);
                data.push(self.get(sx, sy).clone());
            }
        }
        Self { width, height, data }
    }
}

impl Tilemap<f32> {
    /// Bilinear sample at fractional pixel coordinates, clamped to the grid.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let v00 = *self.get(x0, y0);
        let v10 = *self.get(x1, y0);
        let v01 = *self.get(x0, y1);
        let v11 = *self.get(x1, y1);

        let v0 = v00 * (1.0 - fx) + v10 * fx;
        let v1 = v01 * (1.0 - fx) + v11 * fx;
        v0 * (1.0 - fy) + v1 * fy
    }

    /// Bilinear resample to a new resolution.
    pub fn resample_bilinear(&self, width: usize, height: usize) -> Self {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let sx = if width > 1 { (self.width - 1) as f32 / (width - 1) as f32 } else { 0.0 };
        let sy = if height > 1 { (self.height - 1) as f32 / (height - 1) as f32 } else { 0.0 };
        let mut result = Tilemap::new_with(width, height, 0.0f32);
        for y in 0..height {
            for x in 0..width {
                result.set(x, y, self.sample_bilinear(x as f32 * sx, y as f32 * sy));
            }
        }
        result
    }

    /// (min, max) over all finite cells. Empty or all-NaN maps yield (0, 0).
    pub fn min_max(&self) -> (f32, f32) {
        let mut min_h = f32::MAX;
        let mut max_h = f32::MIN;
        for &h in self.data.iter().filter(|h| h.is_finite()) {
            if h < min_h { min_h = h; }
            if h > max_h { max_h = h; }
        }
        if min_h > max_h {
            (0.0, 0.0)
        } else {
            (min_h, max_h)
        }
    }
}

impl Tilemap<bool> {
    pub fn count_set(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }

    /// Union in place. Both maps must have the same size.
    pub fn union_with(&mut self, other: &Tilemap<bool>) {
        debug_assert!(self.same_size(other));
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a |= b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_wrapping_neighbors() {
        let map = Tilemap::new_with(4, 4, 0u8);
        assert_eq!(map.neighbors_8(0, 0).len(), 3);
        assert_eq!(map.neighbors_8(1, 1).len(), 8);
        assert_eq!(map.neighbors_8(3, 2).len(), 5);
        assert!(map.get_checked(-1, 0).is_none());
        assert!(map.get_checked(4, 0).is_none());
    }

    #[test]
    fn test_bilinear_sampling() {
        let mut map = Tilemap::new_with(2, 2, 0.0f32);
        map.set(1, 0, 10.0);
        map.set(0, 1, 20.0);
        map.set(1, 1, 30.0);
        assert!((map.sample_bilinear(0.5, 0.5) - 15.0).abs() < 1e-5);
        // Clamped outside the grid
        assert!((map.sample_bilinear(-3.0, -3.0) - 0.0).abs() < 1e-5);
        assert!((map.sample_bilinear(9.0, 9.0) - 30.0).abs() < 1e-5);
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(Tilemap::from_vec(3, 3, vec![0u8; 8]).is_none());
        assert!(Tilemap::from_vec(3, 3, vec![0u8; 9]).is_some());
    }

    #[test]
    fn test_resample_preserves_corners() {
        let mut map = Tilemap::new_with(3, 3, 0.0f32);
        map.set(2, 2, 8.0);
        let big = map.resample_bilinear(5, 5);
        assert_eq!(*big.get(0, 0), 0.0);
        assert!((*big.get(4, 4) - 8.0).abs() < 1e-5);
    }
}
