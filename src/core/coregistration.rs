use crate::types::{ensure_same_shape, InsarError, InsarResult, SarComplex, SarImage};
use ndarray::{s, Array2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coregistration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoregistrationParams {
    /// Side length of the leading correlation window (clamped to the image)
    pub window_size: usize,
    /// Refine the reported offset with a parabolic fit around the peak.
    /// The applied shift is always the integer peak location.
    pub subpixel_refinement: bool,
}

impl Default for CoregistrationParams {
    fn default() -> Self {
        Self {
            window_size: 64,
            subpixel_refinement: false,
        }
    }
}

/// Translation aligning the secondary image onto the reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    pub row_offset: f64,
    pub col_offset: f64,
    /// Peak-to-total correlation ratio in [0, 1]
    pub correlation: f64,
}

/// Result of aligning one secondary image
#[derive(Debug, Clone)]
pub struct CoregistrationResult {
    pub offset: OffsetEstimate,
    pub aligned_secondary: SarImage,
    pub rms_error: f64,
}

/// FFT phase-correlation coregistration
pub struct Coregistrator {
    params: CoregistrationParams,
}

impl Coregistrator {
    pub fn new(params: CoregistrationParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(CoregistrationParams::default())
    }

    /// Estimate the offset of `secondary` against `reference` and shift it into place.
    ///
    /// If `reference` equals `secondary` cyclically shifted by `(dr, dc)`, the
    /// reported offset is `(dr, dc)` and the aligned secondary equals the reference.
    pub fn coregister(
        &self,
        reference: &SarImage,
        secondary: &SarImage,
    ) -> InsarResult<CoregistrationResult> {
        if reference.is_empty() || secondary.is_empty() {
            return Err(InsarError::ShapeMismatch(
                "coregistration inputs must not be empty".to_string(),
            ));
        }
        ensure_same_shape("coregistration reference/secondary", reference, secondary)?;
        if self.params.window_size == 0 {
            return Err(InsarError::InvalidInput(
                "coregistration window size must be positive".to_string(),
            ));
        }

        log::info!(
            "Coregistering {}x{} secondary (window {})",
            reference.nrows(),
            reference.ncols(),
            self.params.window_size
        );

        let offset = self.estimate_offset(reference, secondary);
        log::info!(
            "Estimated offset: row={:.2}, col={:.2}, correlation={:.4}",
            offset.row_offset,
            offset.col_offset,
            offset.correlation
        );

        let aligned_secondary = apply_offset(
            secondary,
            offset.row_offset.round() as isize,
            offset.col_offset.round() as isize,
        );
        let rms_error = rms_difference(reference, &aligned_secondary);
        log::debug!("Coregistration RMS error: {:.4}", rms_error);

        Ok(CoregistrationResult {
            offset,
            aligned_secondary,
            rms_error,
        })
    }

    /// Phase correlation over the leading window of both images
    pub fn estimate_offset(&self, reference: &SarImage, secondary: &SarImage) -> OffsetEstimate {
        let win_rows = self.params.window_size.min(reference.nrows());
        let win_cols = self.params.window_size.min(reference.ncols());

        let mut ref_spec = to_complex64(&reference.slice(s![..win_rows, ..win_cols]).to_owned());
        let mut sec_spec = to_complex64(&secondary.slice(s![..win_rows, ..win_cols]).to_owned());

        let mut planner = FftPlanner::<f64>::new();
        let row_fft = planner.plan_fft_forward(win_cols);
        let col_fft = planner.plan_fft_forward(win_rows);
        fft2d(&mut ref_spec, &row_fft, &col_fft);
        fft2d(&mut sec_spec, &row_fft, &col_fft);

        // Normalised cross-power spectrum
        let mut surface = Array2::<Complex64>::zeros((win_rows, win_cols));
        ndarray::Zip::from(&mut surface)
            .and(&ref_spec)
            .and(&sec_spec)
            .for_each(|out, r, s| {
                let cross = r * s.conj();
                let norm = cross.norm();
                *out = if norm > 1e-20 { cross / norm } else { Complex64::new(0.0, 0.0) };
            });

        let row_ifft = planner.plan_fft_inverse(win_cols);
        let col_ifft = planner.plan_fft_inverse(win_rows);
        fft2d(&mut surface, &row_ifft, &col_ifft);

        let magnitude = surface.mapv(|c| c.norm());
        let total: f64 = magnitude.sum();

        let mut peak = (0usize, 0usize);
        let mut peak_value = f64::NEG_INFINITY;
        for ((i, j), &m) in magnitude.indexed_iter() {
            if m > peak_value {
                peak_value = m;
                peak = (i, j);
            }
        }

        if !(total > 0.0) {
            log::warn!("Correlation surface is empty; reporting zero offset");
            return OffsetEstimate {
                row_offset: 0.0,
                col_offset: 0.0,
                correlation: 0.0,
            };
        }

        let mut row_offset = fold_index(peak.0, win_rows) as f64;
        let mut col_offset = fold_index(peak.1, win_cols) as f64;

        if self.params.subpixel_refinement {
            let (dr, dc) = parabolic_refinement(&magnitude, peak);
            row_offset += dr;
            col_offset += dc;
        }

        OffsetEstimate {
            row_offset,
            col_offset,
            correlation: (peak_value / total).clamp(0.0, 1.0),
        }
    }
}

impl Default for Coregistrator {
    fn default() -> Self {
        Self::standard()
    }
}

/// Cyclically shift an image: `out[(i + dr) mod h, (j + dc) mod w] = data[i, j]`
pub fn apply_offset(data: &SarImage, row_shift: isize, col_shift: isize) -> SarImage {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return data.clone();
    }
    let dr = row_shift.rem_euclid(rows as isize) as usize;
    let dc = col_shift.rem_euclid(cols as isize) as usize;

    let mut shifted = Array2::<SarComplex>::zeros((rows, cols));
    for ((i, j), &v) in data.indexed_iter() {
        shifted[[(i + dr) % rows, (j + dc) % cols]] = v;
    }
    shifted
}

/// Root-mean-square complex magnitude difference
pub fn rms_difference(a: &SarImage, b: &SarImage) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm_sqr() as f64)
        .sum();
    (sum / a.len() as f64).sqrt()
}

fn to_complex64(data: &SarImage) -> Array2<Complex64> {
    data.mapv(|c| Complex64::new(c.re as f64, c.im as f64))
}

/// In-place 2-D transform: every row with `row_fft`, then every column with `col_fft`
fn fft2d(data: &mut Array2<Complex64>, row_fft: &Arc<dyn Fft<f64>>, col_fft: &Arc<dyn Fft<f64>>) {
    transform_lanes(data, Axis(1), row_fft);
    transform_lanes(data, Axis(0), col_fft);
}

fn transform_lanes(data: &mut Array2<Complex64>, axis: Axis, fft: &Arc<dyn Fft<f64>>) {
    let mut buffer = vec![Complex64::new(0.0, 0.0); data.len_of(axis)];
    for mut lane in data.lanes_mut(axis) {
        for (b, v) in buffer.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        fft.process(&mut buffer);
        for (v, b) in lane.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

/// Map a peak index into the signed range `[-n/2, n/2)`
fn fold_index(index: usize, n: usize) -> isize {
    if index < n / 2 {
        index as isize
    } else {
        index as isize - n as isize
    }
}

fn parabolic_refinement(magnitude: &Array2<f64>, peak: (usize, usize)) -> (f64, f64) {
    let (rows, cols) = magnitude.dim();
    let (i, j) = peak;
    let center = magnitude[[i, j]];

    let vertex = |minus: f64, plus: f64| {
        let denom = minus - 2.0 * center + plus;
        if denom.abs() < 1e-12 {
            0.0
        } else {
            (0.5 * (minus - plus) / denom).clamp(-0.5, 0.5)
        }
    };

    let dr = if rows >= 3 {
        vertex(magnitude[[(i + rows - 1) % rows, j]], magnitude[[(i + 1) % rows, j]])
    } else {
        0.0
    };
    let dc = if cols >= 3 {
        vertex(magnitude[[i, (j + cols - 1) % cols]], magnitude[[i, (j + 1) % cols]])
    } else {
        0.0
    };
    (dr, dc)
}
