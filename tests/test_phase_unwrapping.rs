use approx::assert_abs_diff_eq;
use insardine::core::phase_unwrap::{compute_residues, wrap_phase};
use insardine::core::{CostMode, InitMethod, QualityLevel, UnwrapEngine, UnwrapMethod, UnwrapParams};
use insardine::types::SarRealImage;
use ndarray::Array2;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Smooth deformation bowl spanning several cycles
fn bowl(rows: usize, cols: usize) -> Array2<f64> {
    let (ci, cj) = (rows as f64 / 2.0, cols as f64 / 2.0);
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let r2 = (i as f64 - ci).powi(2) + (j as f64 - cj).powi(2);
        -12.0 * (-r2 / 120.0).exp()
    })
}

fn rewrap(unwrapped: &SarRealImage) -> Array2<f64> {
    unwrapped.mapv(|v| wrap_phase(v as f64))
}

#[test]
fn test_rewrap_round_trip_for_both_fallbacks() {
    init_logging();

    let truth = bowl(32, 40);
    let wrapped = truth.mapv(|v| wrap_phase(v) as f32);
    let coherence = SarRealImage::ones(wrapped.dim());

    for method in [InitMethod::Mcf, InitMethod::Mst] {
        let engine = UnwrapEngine::new(UnwrapParams { cost_mode: CostMode::Defo, fallback_method: method });
        let result = engine.unwrap(&wrapped, &coherence).expect("Unwrapping failed");

        println!(
            "{}: {:.2} cycles, score {:.2}",
            result.method_used, result.statistics.n_cycles, result.quality.quality_score
        );

        for (r, w) in rewrap(&result.unwrapped_phase).iter().zip(wrapped.iter()) {
            assert_abs_diff_eq!(wrap_phase(r - *w as f64), 0.0, epsilon = 1e-4);
        }
        assert!(result.statistics.n_cycles > 1.0);
        assert_eq!(result.quality.level, QualityLevel::Good);
    }
}

#[test]
fn test_unwrapped_bowl_matches_truth_up_to_constant() {
    init_logging();

    let truth = bowl(24, 24);
    let wrapped = truth.mapv(|v| wrap_phase(v) as f32);
    let coherence = SarRealImage::ones(wrapped.dim());
    let result = UnwrapEngine::standard().unwrap(&wrapped, &coherence).expect("Unwrapping failed");

    assert_eq!(result.method_used, UnwrapMethod::GradientIntegration);
    let offset = result.unwrapped_phase[[0, 0]] as f64 - truth[[0, 0]];
    for (u, t) in result.unwrapped_phase.iter().zip(truth.iter()) {
        assert_abs_diff_eq!(*u as f64 - t, offset, epsilon = 1e-3);
    }
}

#[test]
fn test_smooth_field_has_no_residues() {
    let wrapped = bowl(20, 20).mapv(|v| wrap_phase(v) as f32);
    let residues = compute_residues(&wrapped);
    assert_eq!(residues.dim(), (19, 19));
    assert!(residues.iter().all(|&r| r == 0));
}

#[test]
fn test_vortex_produces_residue_pair() {
    // Phase winding once around (4.5, 4.5) and unwinding around (4.5, 10.5)
    let wrapped = SarRealImage::from_shape_fn((10, 16), |(i, j)| {
        let a = (i as f64 - 4.5).atan2(j as f64 - 4.5);
        let b = (i as f64 - 4.5).atan2(j as f64 - 10.5);
        wrap_phase(a - b) as f32
    });
    let residues = compute_residues(&wrapped);
    let positive = residues.iter().filter(|&&r| r > 0).count();
    let negative = residues.iter().filter(|&&r| r < 0).count();
    assert_eq!(positive, 1);
    assert_eq!(negative, 1);
}

#[test]
fn test_nan_pixels_survive_unwrapping() {
    init_logging();

    let mut wrapped = bowl(16, 16).mapv(|v| wrap_phase(v) as f32);
    wrapped[[5, 5]] = f32::NAN;
    let coherence = SarRealImage::ones(wrapped.dim());
    let result = UnwrapEngine::standard().unwrap(&wrapped, &coherence).expect("Unwrapping failed");

    assert!(result.unwrapped_phase[[5, 5]].is_nan());
    assert!(result.unwrapped_phase[[5, 6]].is_finite());
    assert!(result.quality.rmse.is_finite());
}
