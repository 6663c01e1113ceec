use crate::core::phase_unwrap::wrap_phase;
use crate::types::{ensure_same_shape, InsarResult, SarRealImage};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Coarse classification of an unwrapping result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityLevel {
    Good,
    Moderate,
    Poor,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score > 80.0 {
            QualityLevel::Good
        } else if score > 60.0 {
            QualityLevel::Moderate
        } else {
            QualityLevel::Poor
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Good => write!(f, "good"),
            QualityLevel::Moderate => write!(f, "moderate"),
            QualityLevel::Poor => write!(f, "poor"),
        }
    }
}

/// Consistency of an unwrapped raster with its wrapped input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnwrapQuality {
    pub rmse: f64,
    pub mae: f64,
    /// RMSE weighted by squared coherence
    pub weighted_rmse: f64,
    /// MAE weighted by squared coherence
    pub weighted_mae: f64,
    /// Mean wrapped disagreement of the range-direction gradients
    pub gradient_consistency: f64,
    /// `100 * max(0, 1 - weighted_rmse / pi)`
    pub quality_score: f64,
    pub level: QualityLevel,
}

/// Re-wrap `unwrapped` and measure its wrapped residual against `wrapped`.
///
/// Pixels where any input is NaN are left out of every figure. When the
/// total coherence weight is zero the weighted figures fall back to the
/// plain RMSE and MAE.
pub fn assess_unwrapping(
    wrapped: &SarRealImage,
    unwrapped: &SarRealImage,
    coherence: &SarRealImage,
) -> InsarResult<UnwrapQuality> {
    ensure_same_shape("quality wrapped/unwrapped", wrapped, unwrapped)?;
    ensure_same_shape("quality wrapped/coherence", wrapped, coherence)?;

    let mut count = 0usize;
    let mut sum_sq = 0.0;
    let mut sum_abs = 0.0;
    let mut weighted_sq = 0.0;
    let mut weighted_abs = 0.0;
    let mut weight_total = 0.0;

    for ((&w, &u), &c) in wrapped.iter().zip(unwrapped.iter()).zip(coherence.iter()) {
        let rewrapped = wrap_phase(u as f64);
        let residual = wrap_phase(w as f64 - rewrapped);
        if !residual.is_finite() {
            continue;
        }
        count += 1;
        sum_sq += residual * residual;
        sum_abs += residual.abs();
        if c.is_finite() {
            let weight = (c as f64) * (c as f64);
            weighted_sq += weight * residual * residual;
            weighted_abs += weight * residual.abs();
            weight_total += weight;
        }
    }

    let (rmse, mae) = if count > 0 {
        ((sum_sq / count as f64).sqrt(), sum_abs / count as f64)
    } else {
        (f64::NAN, f64::NAN)
    };
    let (weighted_rmse, weighted_mae) = if weight_total > 0.0 {
        ((weighted_sq / weight_total).sqrt(), weighted_abs / weight_total)
    } else {
        (rmse, mae)
    };

    let gradient_consistency = gradient_consistency(wrapped, unwrapped);

    let quality_score = if weighted_rmse.is_finite() {
        (100.0 * (1.0 - weighted_rmse / PI)).clamp(0.0, 100.0)
    } else {
        0.0
    };
    let level = QualityLevel::from_score(quality_score);

    log::debug!(
        "Unwrapping quality: rmse={:.4}, weighted_rmse={:.4}, weighted_mae={:.4}, score={:.2} ({})",
        rmse,
        weighted_rmse,
        weighted_mae,
        quality_score,
        level
    );

    Ok(UnwrapQuality {
        rmse,
        mae,
        weighted_rmse,
        weighted_mae,
        gradient_consistency,
        quality_score,
        level,
    })
}

fn gradient_consistency(wrapped: &SarRealImage, unwrapped: &SarRealImage) -> f64 {
    let (rows, cols) = wrapped.dim();
    let mut count = 0usize;
    let mut total = 0.0;
    for i in 0..rows {
        for j in 1..cols {
            let dw = wrapped[[i, j]] as f64 - wrapped[[i, j - 1]] as f64;
            let du = unwrapped[[i, j]] as f64 - unwrapped[[i, j - 1]] as f64;
            let d = wrap_phase(dw - du).abs();
            if d.is_finite() {
                total += d;
                count += 1;
            }
        }
    }
    if count > 0 {
        total / count as f64
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn truth(rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(i, j)| 0.4 * i as f64 - 0.7 * j as f64)
    }

    #[test]
    fn test_perfect_unwrap_scores_100() {
        let t = truth(8, 8);
        let wrapped = t.mapv(|v| wrap_phase(v) as f32);
        let unwrapped = t.mapv(|v| v as f32);
        let coherence = SarRealImage::ones((8, 8));

        let quality = assess_unwrapping(&wrapped, &unwrapped, &coherence).unwrap();
        assert_abs_diff_eq!(quality.quality_score, 100.0, epsilon = 1e-3);
        assert_eq!(quality.level, QualityLevel::Good);
        assert!(quality.gradient_consistency < 1e-5);
    }

    #[test]
    fn test_score_decreases_with_noise() {
        let t = truth(10, 10);
        let wrapped = t.mapv(|v| wrap_phase(v) as f32);
        let coherence = SarRealImage::from_elem((10, 10), 0.8);
        let pattern = Array2::from_shape_fn((10, 10), |(i, j)| ((i * 3 + j * 7) % 5) as f64 / 4.0 - 0.5);

        let mut previous = f64::INFINITY;
        for amplitude in [0.0, 0.2, 0.5, 1.0, 2.0] {
            let unwrapped = (&t + &(&pattern * amplitude)).mapv(|v| v as f32);
            let quality = assess_unwrapping(&wrapped, &unwrapped, &coherence).unwrap();
            assert!(quality.quality_score < previous || amplitude == 0.0);
            previous = quality.quality_score;
        }
    }

    #[test]
    fn test_nan_pixels_are_ignored() {
        let t = truth(4, 4);
        let wrapped = t.mapv(|v| wrap_phase(v) as f32);
        let mut unwrapped = t.mapv(|v| v as f32);
        unwrapped[[2, 2]] = f32::NAN;
        let coherence = SarRealImage::ones((4, 4));
        let quality = assess_unwrapping(&wrapped, &unwrapped, &coherence).unwrap();
        assert!(quality.rmse.is_finite());
        assert!(quality.quality_score > 99.9);
    }

    #[test]
    fn test_weighted_mae_follows_coherence() {
        let wrapped = SarRealImage::zeros((2, 2));
        let unwrapped = Array2::from_shape_vec((2, 2), vec![0.1f32, 0.1, 0.5, 0.5]).unwrap();
        let coherence = Array2::from_shape_vec((2, 2), vec![1.0f32, 1.0, 0.1, 0.1]).unwrap();

        let quality = assess_unwrapping(&wrapped, &unwrapped, &coherence).unwrap();
        assert_abs_diff_eq!(quality.mae, 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(quality.weighted_mae, 0.21 / 2.02, epsilon = 1e-6);

        let quality = assess_unwrapping(&wrapped, &unwrapped, &SarRealImage::zeros((2, 2))).unwrap();
        assert_eq!(quality.weighted_mae, quality.mae);
        assert_eq!(quality.weighted_rmse, quality.rmse);
    }

    #[test]
    fn test_levels() {
        assert_eq!(QualityLevel::from_score(95.0), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(70.0), QualityLevel::Moderate);
        assert_eq!(QualityLevel::from_score(60.0), QualityLevel::Poor);
    }
}
