use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3, ArrayView2};
use num_complex::Complex;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Complex-valued SAR data type (I + jQ)
pub type SarComplex = Complex<f32>;

/// Real-valued phase, coherence or displacement sample
pub type SarReal = f32;

/// 2D complex SAR data array (azimuth x range)
pub type SarImage = Array2<SarComplex>;

/// 2D real SAR data array (azimuth x range)
pub type SarRealImage = Array2<SarReal>;

/// 3D real stack (layer x azimuth x range), e.g. a displacement time series
pub type SarRealCube = Array3<SarReal>;

/// Coordinate system enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Radar coordinates (range, azimuth)
    Radar,
    /// Geographic coordinates (latitude, longitude)
    Geographic,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

/// Orbit state vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVector {
    pub time: DateTime<Utc>,
    pub position: [f64; 3],  // [x, y, z] in meters (ECEF)
    pub velocity: [f64; 3],  // [vx, vy, vz] in m/s
}

/// Precise orbit information for one acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbitData {
    pub state_vectors: Vec<StateVector>,
    /// Scene reference (mid-acquisition) time
    pub reference_time: DateTime<Utc>,
}

/// Geospatial bounding box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Affine pixel-to-map transform (GDAL coefficient order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform spanning `bbox` with the given raster shape
    pub fn from_bounds(bbox: &BoundingBox, rows: usize, cols: usize) -> Self {
        Self {
            top_left_x: bbox.min_lon,
            pixel_width: (bbox.max_lon - bbox.min_lon) / cols.max(1) as f64,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -(bbox.max_lat - bbox.min_lat) / rows.max(1) as f64,
        }
    }

    /// Map coordinates of the upper-left corner of pixel (row, col)
    pub fn pixel_to_map(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }
}

/// Error types for InSAR processing
#[derive(Debug, thiserror::Error)]
pub enum InsarError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Insufficient observations: {valid} valid, {required} required")]
    InsufficientObservations { valid: usize, required: usize },

    #[error("Disconnected network: {connected} of {total} dates reachable")]
    DisconnectedNetwork { connected: usize, total: usize },

    #[error("External tool failure: {0}")]
    ExternalToolFailure(String),

    #[error("Numerically degenerate system: {0}")]
    NumericDegenerate(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for InSAR operations
pub type InsarResult<T> = Result<T, InsarError>;

/// Fail with `ShapeMismatch` unless both rasters share a shape
pub fn ensure_same_shape<A, B>(
    what: &str,
    a: &Array2<A>,
    b: &Array2<B>,
) -> InsarResult<()> {
    if a.dim() != b.dim() {
        return Err(InsarError::ShapeMismatch(format!(
            "{}: {:?} vs {:?}",
            what,
            a.dim(),
            b.dim()
        )));
    }
    Ok(())
}

/// NaN-aware summary statistics of a real raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub valid_pixels: usize,
    pub total_pixels: usize,
}

impl RasterStatistics {
    /// Compute statistics over finite pixels only.
    ///
    /// All moments are NaN when the raster holds no finite pixel.
    pub fn compute<T: Float>(data: ArrayView2<'_, T>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for &v in data.iter() {
            let v = match v.to_f64() {
                Some(v) if v.is_finite() => v,
                _ => continue,
            };
            count += 1;
            sum += v;
            sum_sq += v * v;
            min = min.min(v);
            max = max.max(v);
        }

        if count == 0 {
            return Self {
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
                valid_pixels: 0,
                total_pixels: data.len(),
            };
        }

        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Self {
            mean,
            std: variance.sqrt(),
            min,
            max,
            valid_pixels: count,
            total_pixels: data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_statistics_ignore_nan() {
        let data = array![[1.0f32, f32::NAN], [3.0, f32::NAN]];
        let stats = RasterStatistics::compute(data.view());

        assert_eq!(stats.valid_pixels, 2);
        assert_eq!(stats.total_pixels, 4);
        assert_abs_diff_eq!(stats.mean, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.std, 1.0, epsilon = 1e-12);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
    }

    #[test]
    fn test_statistics_of_f64_raster() {
        let data = array![[0.5f64, f64::INFINITY, -1.5]];
        let stats = RasterStatistics::compute(data.view());
        assert_eq!(stats.valid_pixels, 2);
        assert_abs_diff_eq!(stats.mean, -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_statistics_all_invalid() {
        let data = Array2::<f32>::from_elem((2, 2), f32::NAN);
        let stats = RasterStatistics::compute(data.view());
        assert_eq!(stats.valid_pixels, 0);
        assert!(stats.mean.is_nan());
    }

    #[test]
    fn test_geo_transform_from_bounds() {
        let bbox = BoundingBox { min_lon: 10.0, max_lon: 11.0, min_lat: 45.0, max_lat: 46.0 };
        let gt = GeoTransform::from_bounds(&bbox, 100, 200);
        let (x, y) = gt.pixel_to_map(100.0, 200.0);
        assert_abs_diff_eq!(x, 11.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y, 45.0, epsilon = 1e-12);
    }
}
