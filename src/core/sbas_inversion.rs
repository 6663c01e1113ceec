use crate::core::sbas_network::SbasNetwork;
use crate::types::{
    ensure_same_shape, InsarError, InsarResult, RasterStatistics, SarRealCube, SarRealImage,
};
use nalgebra::{DMatrix, DVector, SVD};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};

/// Singular values below this are treated as zero
const SVD_EPSILON: f64 = 1e-10;

/// Inversion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbasInversionParams {
    /// Tikhonov damping weight on the interval rates
    pub regularization: f64,
    /// Minimum number of valid observations per pixel
    pub min_observations: usize,
    /// Rows per work unit; cancellation is checked between blocks
    pub row_block_size: usize,
}

impl Default for SbasInversionParams {
    fn default() -> Self {
        Self {
            regularization: 0.01,
            min_observations: 3,
            row_block_size: 16,
        }
    }
}

/// Solution for a single pixel
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSolution {
    /// Per-interval rates (phase / day)
    pub rates: Vec<f64>,
    /// RMS of `A x - b` over the valid observations
    pub residual: f64,
    pub n_observations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InversionStatistics {
    pub velocity_mean: f64,
    pub velocity_std: f64,
    pub velocity_min: f64,
    pub velocity_max: f64,
    pub residual_mean: f64,
    pub residual_std: f64,
    pub valid_pixels: usize,
    pub insufficient_pixels: usize,
    pub degenerate_pixels: usize,
}

/// Per-pixel SBAS products, layers first
#[derive(Debug, Clone)]
pub struct SbasInversionResult {
    /// Cumulative displacement per date (N layers), zero at the first date.
    /// Values are phase in radians, summed as `rate * interval_days`.
    pub displacement: SarRealCube,
    /// Solved rate per date interval (N-1 layers)
    pub interval_rates: SarRealCube,
    /// Mean rate over the full span, phase per year
    pub velocity: SarRealImage,
    pub residual: SarRealImage,
    pub statistics: InversionStatistics,
}

enum PixelOutcome {
    Solved(PixelSolution),
    Insufficient,
    Degenerate,
}

/// Coherence-weighted, damped least-squares SBAS inversion
pub struct SbasInverter {
    params: SbasInversionParams,
}

impl SbasInverter {
    pub fn new(params: SbasInversionParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(SbasInversionParams::default())
    }

    pub fn params(&self) -> &SbasInversionParams {
        &self.params
    }

    /// Invert one unwrapped phase raster per network pair
    pub fn invert(
        &self,
        network: &SbasNetwork,
        phase_stack: &[SarRealImage],
        coherence_stack: Option<&[SarRealImage]>,
    ) -> InsarResult<SbasInversionResult> {
        self.invert_design(
            &network.design_matrix,
            &network.interval_days(),
            phase_stack,
            coherence_stack,
            None,
        )
    }

    /// Invert against an explicit `M x (N-1)` design matrix.
    ///
    /// `interval_days` holds the N-1 interval durations used to accumulate
    /// rates into displacement. When `cancel` is set between row blocks the
    /// run stops with `Cancelled`.
    pub fn invert_design(
        &self,
        design_matrix: &Array2<f64>,
        interval_days: &[f64],
        phase_stack: &[SarRealImage],
        coherence_stack: Option<&[SarRealImage]>,
        cancel: Option<&AtomicBool>,
    ) -> InsarResult<SbasInversionResult> {
        let (n_pairs, n_unknowns) = design_matrix.dim();
        self.validate(design_matrix, interval_days, phase_stack, coherence_stack)?;
        let (rows, cols) = phase_stack[0].dim();

        log::info!(
            "SBAS inversion: {} pairs, {} intervals, {}x{} pixels",
            n_pairs,
            n_unknowns,
            rows,
            cols
        );
        log::debug!("Inversion parameters: {:?}", self.params);

        let design = DMatrix::from_fn(n_pairs, n_unknowns, |r, c| design_matrix[[r, c]]);
        let block = self.params.row_block_size.max(1);
        let blocks: Vec<(usize, usize)> = (0..rows)
            .step_by(block)
            .map(|start| (start, (start + block).min(rows)))
            .collect();

        let solve_block = |&(start, end): &(usize, usize)| -> InsarResult<Vec<PixelOutcome>> {
            if cancel.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
                return Err(InsarError::Cancelled);
            }
            let mut outcomes = Vec::with_capacity((end - start) * cols);
            let mut phases = vec![0.0; n_pairs];
            let mut coherences = vec![0.0; n_pairs];
            for i in start..end {
                for j in 0..cols {
                    for k in 0..n_pairs {
                        phases[k] = phase_stack[k][[i, j]] as f64;
                        if let Some(stack) = coherence_stack {
                            coherences[k] = stack[k][[i, j]] as f64;
                        }
                    }
                    let coherence = coherence_stack.map(|_| coherences.as_slice());
                    let outcome = match self.solve_pixel(&design, &phases, coherence) {
                        Ok(solution) => PixelOutcome::Solved(solution),
                        Err(InsarError::InsufficientObservations { .. }) => PixelOutcome::Insufficient,
                        Err(InsarError::NumericDegenerate(_)) => PixelOutcome::Degenerate,
                        Err(e) => return Err(e),
                    };
                    outcomes.push(outcome);
                }
            }
            Ok(outcomes)
        };

        #[cfg(feature = "parallel")]
        let solved: Vec<Vec<PixelOutcome>> = {
            use rayon::prelude::*;
            blocks.par_iter().map(solve_block).collect::<InsarResult<_>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let solved: Vec<Vec<PixelOutcome>> =
            blocks.iter().map(solve_block).collect::<InsarResult<_>>()?;

        let n_dates = n_unknowns + 1;
        let span: f64 = interval_days.iter().sum();
        let mut displacement = Array3::<f32>::from_elem((n_dates, rows, cols), f32::NAN);
        let mut interval_rates = Array3::<f32>::from_elem((n_unknowns, rows, cols), f32::NAN);
        let mut velocity = SarRealImage::from_elem((rows, cols), f32::NAN);
        let mut residual = SarRealImage::from_elem((rows, cols), f32::NAN);
        let mut insufficient = 0usize;
        let mut degenerate = 0usize;

        for (&(start, _), outcomes) in blocks.iter().zip(solved) {
            for (offset, outcome) in outcomes.into_iter().enumerate() {
                let (i, j) = (start + offset / cols, offset % cols);
                let solution = match outcome {
                    PixelOutcome::Solved(solution) => solution,
                    PixelOutcome::Insufficient => {
                        insufficient += 1;
                        continue;
                    }
                    PixelOutcome::Degenerate => {
                        degenerate += 1;
                        continue;
                    }
                };

                let mut cumulative = 0.0;
                displacement[[0, i, j]] = 0.0;
                for (m, (&rate, &dt)) in solution.rates.iter().zip(interval_days).enumerate() {
                    cumulative += rate * dt;
                    interval_rates[[m, i, j]] = rate as f32;
                    displacement[[m + 1, i, j]] = cumulative as f32;
                }
                velocity[[i, j]] = (cumulative / span * 365.0) as f32;
                residual[[i, j]] = solution.residual as f32;
            }
        }

        let velocity_stats = RasterStatistics::compute(velocity.view());
        let residual_stats = RasterStatistics::compute(residual.view());
        let statistics = InversionStatistics {
            velocity_mean: velocity_stats.mean,
            velocity_std: velocity_stats.std,
            velocity_min: velocity_stats.min,
            velocity_max: velocity_stats.max,
            residual_mean: residual_stats.mean,
            residual_std: residual_stats.std,
            valid_pixels: velocity_stats.valid_pixels,
            insufficient_pixels: insufficient,
            degenerate_pixels: degenerate,
        };

        if insufficient > 0 || degenerate > 0 {
            log::warn!(
                "{} pixels with insufficient observations, {} degenerate",
                insufficient,
                degenerate
            );
        }
        log::info!(
            "Inversion complete: {} valid pixels, mean velocity {:.4}",
            statistics.valid_pixels,
            statistics.velocity_mean
        );

        Ok(SbasInversionResult {
            displacement,
            interval_rates,
            velocity,
            residual,
            statistics,
        })
    }

    /// Solve `[W A; l I] x = [W b; 0]` for one pixel.
    ///
    /// Observations with NaN phase or NaN coherence are dropped. The weight
    /// is the squared coherence, or 1 without coherence, and `W` holds its
    /// square root so the least-squares weight of each observation is the
    /// weight itself.
    pub fn solve_pixel(
        &self,
        design: &DMatrix<f64>,
        phases: &[f64],
        coherence: Option<&[f64]>,
    ) -> InsarResult<PixelSolution> {
        let n_unknowns = design.ncols();
        let valid: Vec<(usize, f64)> = phases
            .iter()
            .enumerate()
            .filter_map(|(k, &phase)| {
                let weight = match coherence {
                    Some(c) => c[k] * c[k],
                    None => 1.0,
                };
                (phase.is_finite() && weight.is_finite()).then_some((k, weight))
            })
            .collect();

        let required = self.params.min_observations.max(1);
        if valid.len() < required {
            return Err(InsarError::InsufficientObservations {
                valid: valid.len(),
                required,
            });
        }

        let lambda = self.params.regularization;
        let n_rows = valid.len() + n_unknowns;
        let mut system = DMatrix::<f64>::zeros(n_rows, n_unknowns);
        let mut rhs = DVector::<f64>::zeros(n_rows);
        for (r, &(k, weight)) in valid.iter().enumerate() {
            let scale = weight.sqrt();
            for c in 0..n_unknowns {
                system[(r, c)] = scale * design[(k, c)];
            }
            rhs[r] = scale * phases[k];
        }
        for c in 0..n_unknowns {
            system[(valid.len() + c, c)] = lambda;
        }

        let svd = SVD::new(system, true, true);
        if svd.rank(SVD_EPSILON) == 0 {
            return Err(InsarError::NumericDegenerate("zero-rank system".to_string()));
        }
        let x = svd
            .solve(&rhs, SVD_EPSILON)
            .map_err(|e| InsarError::NumericDegenerate(e.to_string()))?;
        if x.iter().any(|v| !v.is_finite()) {
            return Err(InsarError::NumericDegenerate("non-finite solution".to_string()));
        }

        let mut sum_sq = 0.0;
        for &(k, _) in &valid {
            let predicted: f64 = (0..n_unknowns).map(|c| design[(k, c)] * x[c]).sum();
            let diff = predicted - phases[k];
            sum_sq += diff * diff;
        }

        Ok(PixelSolution {
            rates: x.iter().copied().collect(),
            residual: (sum_sq / valid.len() as f64).sqrt(),
            n_observations: valid.len(),
        })
    }

    fn validate(
        &self,
        design_matrix: &Array2<f64>,
        interval_days: &[f64],
        phase_stack: &[SarRealImage],
        coherence_stack: Option<&[SarRealImage]>,
    ) -> InsarResult<()> {
        let (n_pairs, n_unknowns) = design_matrix.dim();
        if n_unknowns == 0 || n_pairs == 0 {
            return Err(InsarError::InvalidInput(format!(
                "Design matrix {}x{} has no pairs or no intervals",
                n_pairs, n_unknowns
            )));
        }
        if interval_days.len() != n_unknowns {
            return Err(InsarError::ShapeMismatch(format!(
                "{} interval durations for {} design columns",
                interval_days.len(),
                n_unknowns
            )));
        }
        if interval_days.iter().sum::<f64>() <= 0.0 {
            return Err(InsarError::InvalidInput("Stack spans zero days".to_string()));
        }
        if phase_stack.len() != n_pairs {
            return Err(InsarError::ShapeMismatch(format!(
                "{} phase rasters for {} pairs",
                phase_stack.len(),
                n_pairs
            )));
        }
        for phase in &phase_stack[1..] {
            ensure_same_shape("phase stack", &phase_stack[0], phase)?;
        }
        if let Some(coherence) = coherence_stack {
            if coherence.len() != n_pairs {
                return Err(InsarError::ShapeMismatch(format!(
                    "{} coherence rasters for {} pairs",
                    coherence.len(),
                    n_pairs
                )));
            }
            for c in coherence {
                ensure_same_shape("coherence stack", &phase_stack[0], c)?;
            }
        }
        Ok(())
    }
}

impl Default for SbasInverter {
    fn default() -> Self {
        Self::standard()
    }
}

/// Line-of-sight displacement (metres) from unwrapped phase (radians)
pub fn phase_to_los(phase: f64, wavelength_m: f64) -> f64 {
    phase * wavelength_m / (4.0 * PI)
}

/// Vertical displacement from LOS displacement at the given incidence angle
pub fn los_to_vertical(los: f64, incidence_angle_deg: f64) -> f64 {
    los / incidence_angle_deg.to_radians().cos()
}

pub fn phase_raster_to_los(phase: &SarRealImage, wavelength_m: f64) -> SarRealImage {
    phase.mapv(|p| phase_to_los(p as f64, wavelength_m) as f32)
}

pub fn los_raster_to_vertical(los: &SarRealImage, incidence_angle_deg: f64) -> SarRealImage {
    los.mapv(|d| los_to_vertical(d as f64, incidence_angle_deg) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sbas_network::{AcquisitionDate, SbasNetworkBuilder};
    use approx::assert_abs_diff_eq;

    fn network() -> SbasNetwork {
        let dates: Vec<AcquisitionDate> = ["2023-01-01", "2023-01-13", "2023-01-25", "2023-02-18"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        SbasNetworkBuilder::standard().build(&dates).unwrap()
    }

    /// Phase of every pair for a pixel whose displacement at each date is `truth`
    fn pair_phases(network: &SbasNetwork, truth: &[f64]) -> Vec<f64> {
        network
            .pairs
            .iter()
            .map(|p| truth[p.slave_index] - truth[p.master_index])
            .collect()
    }

    #[test]
    fn test_pixel_recovers_rates() {
        let network = network();
        let design = DMatrix::from_fn(network.n_pairs(), 3, |r, c| network.design_matrix[[r, c]]);
        let truth = [0.0, 1.2, 1.8, 4.2];
        let phases = pair_phases(&network, &truth);

        let solution = SbasInverter::standard().solve_pixel(&design, &phases, None).unwrap();
        let intervals = network.interval_days();
        assert_abs_diff_eq!(solution.rates[0], 1.2 / intervals[0], epsilon = 1e-6);
        assert_abs_diff_eq!(solution.rates[2], 2.4 / intervals[2], epsilon = 1e-6);
        assert!(solution.residual < 1e-5);
        assert_eq!(solution.n_observations, 6);
    }

    #[test]
    fn test_stack_inversion_recovers_truth() {
        let network = network();
        let truth = [0.0, 0.6, 1.5, 3.0];
        let phases = pair_phases(&network, &truth);
        let stack: Vec<SarRealImage> = phases
            .iter()
            .map(|&p| SarRealImage::from_elem((3, 4), p as f32))
            .collect();
        let coherence: Vec<SarRealImage> = (0..stack.len())
            .map(|_| SarRealImage::from_elem((3, 4), 0.9))
            .collect();

        let result = SbasInverter::standard()
            .invert(&network, &stack, Some(&coherence))
            .unwrap();

        assert_eq!(result.displacement.dim(), (4, 3, 4));
        assert_eq!(result.interval_rates.dim(), (3, 3, 4));
        for (k, &d) in truth.iter().enumerate() {
            assert_abs_diff_eq!(result.displacement[[k, 1, 2]], d as f32, epsilon = 1e-4);
        }
        let expected_velocity = 3.0 / network.total_span_days() * 365.0;
        assert_abs_diff_eq!(result.velocity[[0, 0]], expected_velocity as f32, epsilon = 1e-3);
        assert!(result.residual.iter().all(|&r| r < 1e-4));
        assert_eq!(result.statistics.valid_pixels, 12);
        assert_eq!(result.statistics.insufficient_pixels, 0);
    }

    #[test]
    fn test_pixel_with_too_few_observations_is_nan() {
        let network = network();
        let phases = pair_phases(&network, &[0.0, 0.5, 1.0, 1.5]);
        let mut stack: Vec<SarRealImage> = phases
            .iter()
            .map(|&p| SarRealImage::from_elem((2, 2), p as f32))
            .collect();
        for layer in stack.iter_mut().skip(2) {
            layer[[1, 1]] = f32::NAN;
        }

        let result = SbasInverter::standard().invert(&network, &stack, None).unwrap();
        assert!(result.velocity[[1, 1]].is_nan());
        assert!(result.residual[[1, 1]].is_nan());
        assert!((0..4).all(|k| result.displacement[[k, 1, 1]].is_nan()));
        assert!(result.velocity[[0, 0]].is_finite());
        assert_eq!(result.statistics.insufficient_pixels, 1);
        assert_eq!(result.statistics.valid_pixels, 3);
    }

    #[test]
    fn test_nan_coherence_discards_observation() {
        let network = network();
        let design = DMatrix::from_fn(network.n_pairs(), 3, |r, c| network.design_matrix[[r, c]]);
        let phases = pair_phases(&network, &[0.0, 0.5, 1.0, 1.5]);
        let mut coherence = vec![0.8; phases.len()];
        coherence[0] = f64::NAN;

        let solution = SbasInverter::standard()
            .solve_pixel(&design, &phases, Some(&coherence))
            .unwrap();
        assert_eq!(solution.n_observations, phases.len() - 1);
    }

    #[test]
    fn test_rows_scaled_by_coherence_not_its_square() {
        let network = network();
        let n = network.n_pairs();
        let design = DMatrix::from_fn(n, 3, |r, c| network.design_matrix[[r, c]]);
        // Inconsistent observations so the weighting changes the answer
        let mut phases = pair_phases(&network, &[0.0, 0.5, 1.4, 2.0]);
        for (k, p) in phases.iter_mut().enumerate() {
            *p += if k % 2 == 0 { 0.3 } else { -0.2 };
        }
        let coherence: Vec<f64> = (0..n).map(|k| 0.3 + 0.1 * k as f64).collect();
        let lambda = 0.01;

        let mut system = DMatrix::<f64>::zeros(n + 3, 3);
        let mut rhs = DVector::<f64>::zeros(n + 3);
        for k in 0..n {
            for c in 0..3 {
                system[(k, c)] = coherence[k] * design[(k, c)];
            }
            rhs[k] = coherence[k] * phases[k];
        }
        for c in 0..3 {
            system[(n + c, c)] = lambda;
        }
        let expected = SVD::new(system, true, true).solve(&rhs, SVD_EPSILON).unwrap();

        let inverter = SbasInverter::new(SbasInversionParams {
            regularization: lambda,
            ..Default::default()
        });
        let solution = inverter.solve_pixel(&design, &phases, Some(&coherence)).unwrap();
        for c in 0..3 {
            assert_abs_diff_eq!(solution.rates[c], expected[c], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_stack_shape_mismatch() {
        let network = network();
        let stack = vec![SarRealImage::zeros((2, 2)); network.n_pairs() - 1];
        assert!(matches!(
            SbasInverter::standard().invert(&network, &stack, None),
            Err(InsarError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_cancelled_between_blocks() {
        let network = network();
        let stack = vec![SarRealImage::zeros((4, 4)); network.n_pairs()];
        let cancel = AtomicBool::new(true);
        let result = SbasInverter::standard().invert_design(
            &network.design_matrix,
            &network.interval_days(),
            &stack,
            None,
            Some(&cancel),
        );
        assert!(matches!(result, Err(InsarError::Cancelled)));
    }

    #[test]
    fn test_unit_conversions() {
        let los = phase_to_los(4.0 * PI, 0.0555);
        assert_abs_diff_eq!(los, 0.0555, epsilon = 1e-12);
        assert_abs_diff_eq!(los_to_vertical(1.0, 60.0), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(los_to_vertical(1.0, 0.0), 1.0, epsilon = 1e-12);
    }
}
