use crate::types::{
    ensure_same_shape, InsarError, InsarResult, RasterStatistics, SarImage, SarRealImage,
};
use ndarray::{Array2, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Interferogram formation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterferogramParams {
    /// Boxcar window used for coherence estimation
    pub coherence_window: usize,
    /// Coherence level counted as "coherent" in the summary
    pub coherence_threshold: f32,
}

impl Default for InterferogramParams {
    fn default() -> Self {
        Self {
            coherence_window: 32,
            coherence_threshold: 0.4,
        }
    }
}

/// Summary figures for quality gating
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterferogramSummary {
    pub mean_coherence: f64,
    /// Fraction of pixels whose coherence reaches the threshold
    pub coherent_fraction: f64,
}

/// Products of one interferometric pair
#[derive(Debug, Clone)]
pub struct InterferogramProduct {
    pub interferogram: SarImage,
    pub coherence: SarRealImage,
    /// Wrapped phase in (-pi, pi]
    pub phase: SarRealImage,
    pub amplitude: SarRealImage,
    pub summary: InterferogramSummary,
}

/// Interferogram and coherence generator
pub struct InterferogramGenerator {
    params: InterferogramParams,
}

impl InterferogramGenerator {
    pub fn new(params: InterferogramParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(InterferogramParams::default())
    }

    /// Form `conj(reference) * secondary`, its phase and the boxcar coherence
    pub fn generate(
        &self,
        reference: &SarImage,
        aligned_secondary: &SarImage,
    ) -> InsarResult<InterferogramProduct> {
        ensure_same_shape("interferogram reference/secondary", reference, aligned_secondary)?;
        if self.params.coherence_window == 0 {
            return Err(InsarError::InvalidInput(
                "coherence window must be positive".to_string(),
            ));
        }

        let (rows, cols) = reference.dim();
        log::info!("Generating {}x{} interferogram", rows, cols);

        let mut interferogram = SarImage::zeros((rows, cols));
        Zip::from(&mut interferogram)
            .and(reference)
            .and(aligned_secondary)
            .for_each(|ifg, r, s| *ifg = r.conj() * s);

        let phase = interferogram.mapv(|c| c.arg());
        let amplitude = interferogram.mapv(|c| c.norm());
        let coherence = self.compute_coherence(reference, aligned_secondary)?;
        let summary = self.summarize(&coherence);

        log::info!(
            "Interferogram complete: mean coherence {:.4}, {:.1}% above {}",
            summary.mean_coherence,
            summary.coherent_fraction * 100.0,
            self.params.coherence_threshold
        );

        Ok(InterferogramProduct {
            interferogram,
            coherence,
            phase,
            amplitude,
            summary,
        })
    }

    /// Boxcar coherence estimate, clamped to [0, 1].
    ///
    /// The window is truncated at the image border; pixels whose power
    /// product vanishes get zero coherence.
    pub fn compute_coherence(
        &self,
        reference: &SarImage,
        secondary: &SarImage,
    ) -> InsarResult<SarRealImage> {
        ensure_same_shape("coherence reference/secondary", reference, secondary)?;
        let (rows, cols) = reference.dim();
        let window = self.params.coherence_window;
        log::debug!("Coherence estimation with {}x{} window", window, window);

        let cross = SummedArea::build(rows, cols, |i, j| {
            let r = reference[[i, j]];
            let s = secondary[[i, j]];
            let c = r.conj() * s;
            Complex64::new(c.re as f64, c.im as f64)
        });
        let ref_power = SummedArea::build(rows, cols, |i, j| reference[[i, j]].norm_sqr() as f64);
        let sec_power = SummedArea::build(rows, cols, |i, j| secondary[[i, j]].norm_sqr() as f64);

        let half = window / 2;
        let estimate = |(i, j): (usize, usize), out: &mut f32| {
            let r0 = i.saturating_sub(half);
            let c0 = j.saturating_sub(half);
            let r1 = (i + window - half).min(rows);
            let c1 = (j + window - half).min(cols);

            // Window sums share the same count, so means cancel out
            let numerator = cross.window_sum(r0, c0, r1, c1).norm();
            let denominator =
                (ref_power.window_sum(r0, c0, r1, c1) * sec_power.window_sum(r0, c0, r1, c1)).sqrt();

            *out = if denominator > 1e-20 {
                (numerator / denominator).clamp(0.0, 1.0) as f32
            } else {
                0.0
            };
        };

        let mut coherence = SarRealImage::zeros((rows, cols));
        #[cfg(feature = "parallel")]
        Zip::indexed(&mut coherence).par_for_each(estimate);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut coherence).for_each(estimate);

        Ok(coherence)
    }

    fn summarize(&self, coherence: &SarRealImage) -> InterferogramSummary {
        let stats = RasterStatistics::compute(coherence.view());
        let coherent = coherence
            .iter()
            .filter(|&&c| c >= self.params.coherence_threshold)
            .count();
        InterferogramSummary {
            mean_coherence: stats.mean,
            coherent_fraction: if coherence.is_empty() {
                0.0
            } else {
                coherent as f64 / coherence.len() as f64
            },
        }
    }
}

impl Default for InterferogramGenerator {
    fn default() -> Self {
        Self::standard()
    }
}

/// Inclusive-prefix summed-area table with a zero border row and column
struct SummedArea<T> {
    table: Array2<T>,
}

impl<T> SummedArea<T>
where
    T: Copy + Default + std::ops::Add<Output = T> + std::ops::Sub<Output = T>,
{
    fn build(rows: usize, cols: usize, value: impl Fn(usize, usize) -> T) -> Self {
        let mut table = Array2::<T>::from_elem((rows + 1, cols + 1), T::default());
        for i in 0..rows {
            let mut row_sum = T::default();
            for j in 0..cols {
                row_sum = row_sum + value(i, j);
                table[[i + 1, j + 1]] = table[[i, j + 1]] + row_sum;
            }
        }
        Self { table }
    }

    /// Sum over rows `r0..r1` and columns `c0..c1`
    fn window_sum(&self, r0: usize, c0: usize, r1: usize, c1: usize) -> T {
        self.table[[r1, c1]] - self.table[[r0, c1]] - self.table[[r1, c0]] + self.table[[r0, c0]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SarComplex;
    use approx::assert_abs_diff_eq;
    use std::f32::consts::PI;

    fn speckle(rows: usize, cols: usize, seed: usize) -> SarImage {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            let a = (((i + seed) * 31 + j * 17) % 23) as f32 * 0.1 + 0.2;
            let p = (((i * 5 + j * 3 + seed) % 13) as f32) * 0.45 - 2.7;
            SarComplex::from_polar(a, p)
        })
    }

    #[test]
    fn test_identical_images_have_unit_coherence() {
        let image = speckle(20, 24, 0);
        let params = InterferogramParams { coherence_window: 5, coherence_threshold: 0.4 };
        let product = InterferogramGenerator::new(params).generate(&image, &image).unwrap();

        for &c in product.coherence.iter() {
            assert_abs_diff_eq!(c, 1.0, epsilon = 1e-5);
        }
        for &p in product.phase.iter() {
            assert_abs_diff_eq!(p, 0.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(product.summary.coherent_fraction, 1.0);
    }

    #[test]
    fn test_coherence_bounds() {
        let a = speckle(16, 16, 0);
        let b = speckle(16, 16, 7);
        let generator = InterferogramGenerator::new(InterferogramParams {
            coherence_window: 4,
            coherence_threshold: 0.4,
        });
        let coherence = generator.compute_coherence(&a, &b).unwrap();
        assert!(coherence.iter().all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn test_zero_power_gives_zero_coherence() {
        let zeros = SarImage::zeros((6, 6));
        let coherence = InterferogramGenerator::standard()
            .compute_coherence(&zeros, &zeros)
            .unwrap();
        assert!(coherence.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_phase_ramp() {
        let reference = Array2::from_elem((4, 8), SarComplex::new(1.0, 0.0));
        let secondary = Array2::from_shape_fn((4, 8), |(_, j)| SarComplex::from_polar(1.0, 0.5 * j as f32 - PI / 2.0));
        let product = InterferogramGenerator::standard().generate(&reference, &secondary).unwrap();
        assert_abs_diff_eq!(product.phase[[2, 3]], 1.5 - PI / 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(product.amplitude[[1, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = speckle(4, 4, 0);
        let b = speckle(4, 5, 0);
        let err = InterferogramGenerator::standard().generate(&a, &b).unwrap_err();
        assert!(matches!(err, InsarError::ShapeMismatch(_)));
    }

    #[test]
    fn test_summed_area_window() {
        let sat = SummedArea::build(3, 3, |i, j| (i * 3 + j) as f64);
        assert_eq!(sat.window_sum(0, 0, 3, 3), 36.0);
        assert_eq!(sat.window_sum(1, 1, 3, 3), 4.0 + 5.0 + 7.0 + 8.0);
    }
}
