//! In-memory raster exchange with the external raster I/O collaborator.
//!
//! Real rasters are one scalar per pixel. Complex rasters travel as two
//! co-located real bands (real, imaginary) or as magnitude plus phase.

use crate::types::{
    ensure_same_shape, BoundingBox, CoordinateSystem, GeoTransform, InsarResult, SarComplex,
    SarImage, SarRealImage,
};
use ndarray::{Array2, Zip};

/// A raster tagged with its coordinate reference and affine transform
#[derive(Debug, Clone)]
pub struct GeoRaster<T> {
    pub data: Array2<T>,
    pub coordinate_system: CoordinateSystem,
    pub geo_transform: Option<GeoTransform>,
}

impl<T> GeoRaster<T> {
    /// Raster in radar geometry without a map transform
    pub fn radar(data: Array2<T>) -> Self {
        Self {
            data,
            coordinate_system: CoordinateSystem::Radar,
            geo_transform: None,
        }
    }

    /// Geographic raster spanning `bbox`
    pub fn geographic(data: Array2<T>, bbox: &BoundingBox) -> Self {
        let (rows, cols) = data.dim();
        Self {
            data,
            coordinate_system: CoordinateSystem::Geographic,
            geo_transform: Some(GeoTransform::from_bounds(bbox, rows, cols)),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Replace the pixels, keeping the georeferencing
    pub fn with_data<U>(&self, data: Array2<U>) -> GeoRaster<U> {
        GeoRaster {
            data,
            coordinate_system: self.coordinate_system.clone(),
            geo_transform: self.geo_transform.clone(),
        }
    }
}

/// Build a complex raster from real and imaginary bands
pub fn complex_from_bands(real: &SarRealImage, imag: &SarRealImage) -> InsarResult<SarImage> {
    ensure_same_shape("complex bands", real, imag)?;
    let mut out = SarImage::zeros(real.dim());
    Zip::from(&mut out)
        .and(real)
        .and(imag)
        .for_each(|c, &re, &im| *c = SarComplex::new(re, im));
    Ok(out)
}

/// Build a complex raster from magnitude and phase bands
pub fn complex_from_polar(magnitude: &SarRealImage, phase: &SarRealImage) -> InsarResult<SarImage> {
    ensure_same_shape("polar bands", magnitude, phase)?;
    let mut out = SarImage::zeros(magnitude.dim());
    Zip::from(&mut out)
        .and(magnitude)
        .and(phase)
        .for_each(|c, &m, &p| *c = SarComplex::from_polar(m, p));
    Ok(out)
}

/// Split a complex raster into (real, imaginary) bands
pub fn complex_to_bands(data: &SarImage) -> (SarRealImage, SarRealImage) {
    (data.mapv(|c| c.re), data.mapv(|c| c.im))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InsarError;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_band_conversion() {
        let re = array![[1.0f32, 2.0], [3.0, 4.0]];
        let im = array![[0.5f32, -0.5], [0.0, 1.0]];
        let complex = complex_from_bands(&re, &im).unwrap();
        assert_eq!(complex[[0, 1]], SarComplex::new(2.0, -0.5));

        let (re2, im2) = complex_to_bands(&complex);
        assert_eq!(re2, re);
        assert_eq!(im2, im);
    }

    #[test]
    fn test_polar_conversion() {
        let magnitude = array![[2.0f32]];
        let phase = array![[std::f32::consts::FRAC_PI_2]];
        let complex = complex_from_polar(&magnitude, &phase).unwrap();
        assert_abs_diff_eq!(complex[[0, 0]].re, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(complex[[0, 0]].im, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_band_shape_mismatch() {
        let a = SarRealImage::zeros((2, 2));
        let b = SarRealImage::zeros((2, 3));
        assert!(matches!(complex_from_bands(&a, &b), Err(InsarError::ShapeMismatch(_))));
    }

    #[test]
    fn test_with_data_keeps_georeferencing() {
        let bbox = BoundingBox { min_lon: 0.0, max_lon: 1.0, min_lat: 0.0, max_lat: 1.0 };
        let raster = GeoRaster::geographic(SarRealImage::zeros((4, 4)), &bbox);
        let derived = raster.with_data(raster.data.mapv(|v| v + 1.0));
        assert_eq!(derived.coordinate_system, CoordinateSystem::Geographic);
        assert_eq!(derived.geo_transform, raster.geo_transform);
    }
}
