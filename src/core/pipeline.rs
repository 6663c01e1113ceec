//! Per-run orchestration of the deformation chain.
//!
//! Every network pair runs coregistration, interferogram formation and
//! unwrapping independently; the unwrapped stack is then inverted once all
//! pairs are available.

use crate::core::coregistration::{CoregistrationParams, Coregistrator, OffsetEstimate};
use crate::core::interferogram::{InterferogramGenerator, InterferogramParams};
use crate::core::phase_unwrap::{PhaseUnwrapper, UnwrapEngine, UnwrapMethod, UnwrapParams};
use crate::core::sbas_inversion::{
    los_raster_to_vertical, phase_raster_to_los, phase_to_los, SbasInversionParams, SbasInversionResult,
    SbasInverter,
};
use crate::core::sbas_network::{
    AcquisitionDate, BaselineProvider, NetworkPair, NetworkParams, NetworkSummary, SbasNetwork,
    SbasNetworkBuilder,
};
use crate::io::snaphu::{SnaphuConfig, SnaphuUnwrapper};
use crate::types::{InsarError, InsarResult, SarImage, SarRealCube, SarRealImage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One entry of the run's step log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Final record of a finished or cancelled run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub steps: Vec<StepRecord>,
}

/// State of one processing run, shared by reference with every stage
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    cancelled: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
    steps: Mutex<Vec<StepRecord>>,
}

impl RunContext {
    /// Context named after its start time plus a random suffix
    pub fn new() -> Self {
        let started_at = Utc::now();
        let run_id = format!(
            "run-{}-{}",
            started_at.format("%Y%m%dT%H%M%S"),
            Uuid::new_v4().simple()
        );
        Self::with_id(run_id)
    }

    pub fn with_id<S: Into<String>>(run_id: S) -> Self {
        let run_id = run_id.into();
        log::info!("Starting run {}", run_id);
        Self {
            run_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Flag observed by stages and external subprocesses
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        log::warn!("Run {} cancelled", self.run_id);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> InsarResult<()> {
        if self.is_cancelled() {
            Err(InsarError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn record<S: Into<String>, M: Into<String>>(&self, step: S, message: M) {
        let record = StepRecord {
            step: step.into(),
            message: message.into(),
            at: Utc::now(),
        };
        log::debug!("[{}] {}: {}", self.run_id, record.step, record.message);
        match self.steps.lock() {
            Ok(mut steps) => steps.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        match self.steps.lock() {
            Ok(steps) => steps.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Close the run
    pub fn finish(self) -> RunReport {
        let cancelled = self.is_cancelled();
        let steps = match self.steps.into_inner() {
            Ok(steps) => steps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let finished_at = Utc::now();
        log::info!(
            "Run {} finished after {} ms{}",
            self.run_id,
            (finished_at - self.started_at).num_milliseconds(),
            if cancelled { " (cancelled)" } else { "" }
        );
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            cancelled,
            steps,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Location and limits of the external unwrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalUnwrapperConfig {
    pub executable: PathBuf,
    pub timeout_seconds: u64,
    pub snaphu: SnaphuConfig,
}

impl Default for ExternalUnwrapperConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("snaphu"),
            timeout_seconds: 3600,
            snaphu: SnaphuConfig::default(),
        }
    }
}

/// Full processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub coregistration: CoregistrationParams,
    pub interferogram: InterferogramParams,
    pub unwrap: UnwrapParams,
    pub network: NetworkParams,
    pub inversion: SbasInversionParams,
    /// `None` runs only the in-process unwrapper
    pub external_unwrapper: Option<ExternalUnwrapperConfig>,
    /// Fail on a disconnected network instead of inverting its reachable part
    pub require_connected: bool,
    pub wavelength_m: f64,
    pub incidence_angle_deg: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            coregistration: CoregistrationParams::default(),
            interferogram: InterferogramParams::default(),
            unwrap: UnwrapParams::default(),
            network: NetworkParams::default(),
            inversion: SbasInversionParams::default(),
            external_unwrapper: None,
            require_connected: false,
            wavelength_m: 0.0555,
            incidence_angle_deg: 34.0,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> InsarResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> InsarResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::info!("Loaded pipeline configuration from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> InsarResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Correction applied to every unwrapped interferogram before inversion
pub trait PhaseCorrection: Send + Sync {
    fn name(&self) -> &str;

    /// Return a corrected raster with the shape of `unwrapped`
    fn correct(&self, unwrapped: &SarRealImage, pair: &NetworkPair) -> InsarResult<SarRealImage>;
}

/// Reference every interferogram to the phase of one stable pixel
#[derive(Debug, Clone, Copy)]
pub struct ReferencePixelCorrection {
    pub row: usize,
    pub col: usize,
}

impl PhaseCorrection for ReferencePixelCorrection {
    fn name(&self) -> &str {
        "reference_pixel"
    }

    fn correct(&self, unwrapped: &SarRealImage, _pair: &NetworkPair) -> InsarResult<SarRealImage> {
        let reference = unwrapped.get((self.row, self.col)).copied().ok_or_else(|| {
            InsarError::InvalidInput(format!(
                "Reference pixel ({}, {}) outside {:?} raster",
                self.row,
                self.col,
                unwrapped.dim()
            ))
        })?;
        if !reference.is_finite() {
            log::warn!("Reference pixel ({}, {}) is invalid, phase left unchanged", self.row, self.col);
            return Ok(unwrapped.clone());
        }
        Ok(unwrapped.mapv(|v| v - reference))
    }
}

/// Products of one processed pair
#[derive(Debug, Clone)]
pub struct PairProduct {
    pub pair: NetworkPair,
    pub offset: OffsetEstimate,
    pub coregistration_rms: f64,
    pub mean_coherence: f64,
    pub coherence: SarRealImage,
    pub unwrapped_phase: SarRealImage,
    pub method_used: UnwrapMethod,
    pub quality_score: f64,
}

/// Serializable per-pair report line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSummary {
    pub master_date: AcquisitionDate,
    pub slave_date: AcquisitionDate,
    pub temporal_baseline_days: i64,
    pub perpendicular_baseline_m: f64,
    pub mean_coherence: Option<f64>,
    pub method_used: Option<UnwrapMethod>,
    pub quality_score: Option<f64>,
    /// Error that turned this pair into an all-NaN layer
    pub failure: Option<String>,
}

/// Outputs of a full stack run
#[derive(Debug, Clone)]
pub struct StackResult {
    pub network: SbasNetwork,
    pub pairs: Vec<PairSummary>,
    pub inversion: SbasInversionResult,
    /// Cumulative LOS displacement per date, metres
    pub displacement_los_m: SarRealCube,
    pub velocity_los_m_per_year: SarRealImage,
    pub velocity_vertical_m_per_year: SarRealImage,
}

impl StackResult {
    pub fn network_summary(&self) -> NetworkSummary {
        self.network.summary()
    }
}

/// Coregistration, interferogram, unwrapping and SBAS inversion in one run
pub struct InsarPipeline {
    config: PipelineConfig,
    coregistrator: Coregistrator,
    generator: InterferogramGenerator,
    unwrapper: UnwrapEngine,
    corrections: Vec<Box<dyn PhaseCorrection>>,
}

impl InsarPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::build(config, None)
    }

    /// Pipeline whose external unwrapper is killed when `ctx` is cancelled
    pub fn for_run(config: PipelineConfig, ctx: &RunContext) -> Self {
        Self::build(config, Some(ctx.cancel_flag()))
    }

    fn build(config: PipelineConfig, cancel_flag: Option<Arc<AtomicBool>>) -> Self {
        let mut unwrapper = UnwrapEngine::new(config.unwrap.clone());
        if let Some(external) = &config.external_unwrapper {
            let mut snaphu = SnaphuUnwrapper::new(
                external.executable.clone(),
                Duration::from_secs(external.timeout_seconds),
                external.snaphu.clone(),
            );
            if let Some(flag) = cancel_flag {
                snaphu = snaphu.with_cancel_flag(flag);
            }
            unwrapper = unwrapper.with_external(Box::new(snaphu));
        }

        Self {
            coregistrator: Coregistrator::new(config.coregistration.clone()),
            generator: InterferogramGenerator::new(config.interferogram.clone()),
            unwrapper,
            corrections: Vec::new(),
            config,
        }
    }

    /// Replace the external unwrapper with any other capability
    pub fn with_external_unwrapper(mut self, external: Box<dyn PhaseUnwrapper>) -> Self {
        self.unwrapper = UnwrapEngine::new(self.config.unwrap.clone()).with_external(external);
        self
    }

    pub fn with_correction(mut self, correction: Box<dyn PhaseCorrection>) -> Self {
        self.corrections.push(correction);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Coregister, form the interferogram, unwrap and correct one pair
    pub fn process_pair(
        &self,
        ctx: &RunContext,
        pair: &NetworkPair,
        reference: &SarImage,
        secondary: &SarImage,
    ) -> InsarResult<PairProduct> {
        ctx.check_cancelled()?;
        let label = format!("pair {}-{}", pair.master_index, pair.slave_index);

        let coregistered = self.coregistrator.coregister(reference, secondary)?;
        ctx.record(
            &label,
            format!(
                "coregistered, offset ({:.1}, {:.1})",
                coregistered.offset.row_offset, coregistered.offset.col_offset
            ),
        );

        let product = self.generator.generate(reference, &coregistered.aligned_secondary)?;
        ctx.record(
            &label,
            format!("interferogram, mean coherence {:.3}", product.summary.mean_coherence),
        );

        ctx.check_cancelled()?;
        let unwrapped = self.unwrapper.unwrap(&product.phase, &product.coherence)?;
        ctx.record(
            &label,
            format!(
                "unwrapped with {}, quality {:.1}",
                unwrapped.method_used, unwrapped.quality.quality_score
            ),
        );

        let mut phase = unwrapped.unwrapped_phase;
        for correction in &self.corrections {
            let corrected = correction.correct(&phase, pair)?;
            if corrected.dim() != phase.dim() {
                return Err(InsarError::ShapeMismatch(format!(
                    "correction {} returned {:?} for {:?} input",
                    correction.name(),
                    corrected.dim(),
                    phase.dim()
                )));
            }
            phase = corrected;
        }

        Ok(PairProduct {
            pair: *pair,
            offset: coregistered.offset,
            coregistration_rms: coregistered.rms_error,
            mean_coherence: product.summary.mean_coherence,
            coherence: product.coherence,
            unwrapped_phase: phase,
            method_used: unwrapped.method_used,
            quality_score: unwrapped.quality.quality_score,
        })
    }

    /// Process a dated stack of coregistration-ready SLCs end to end.
    ///
    /// Pair-level failures other than cancellation and shape mismatches turn
    /// that pair into an all-NaN observation.
    pub fn process_stack(
        &self,
        ctx: &RunContext,
        acquisitions: &[(AcquisitionDate, SarImage)],
        baselines: &dyn BaselineProvider,
    ) -> InsarResult<StackResult> {
        ctx.check_cancelled()?;
        let dates: Vec<AcquisitionDate> = acquisitions.iter().map(|(d, _)| *d).collect();
        let mut network =
            SbasNetworkBuilder::new(self.config.network.clone()).build_with_baselines(&dates, baselines)?;
        ctx.record(
            "network",
            format!("{} dates, {} pairs", network.n_dates(), network.n_pairs()),
        );

        if !network.connectivity.is_connected {
            if self.config.require_connected {
                network.require_connected()?;
            }
            let (reachable, _) = network.reachable_subnetwork()?;
            ctx.record(
                "network",
                format!("restricted to {} reachable dates", reachable.n_dates()),
            );
            network = reachable;
        }
        if network.n_pairs() == 0 {
            return Err(InsarError::InsufficientObservations {
                valid: 0,
                required: 1,
            });
        }

        let shape = acquisitions[0].1.dim();
        for (date, image) in acquisitions {
            if image.dim() != shape {
                return Err(InsarError::ShapeMismatch(format!(
                    "acquisition {} is {:?}, stack is {:?}",
                    date,
                    image.dim(),
                    shape
                )));
            }
        }

        let run_pair = |pair: &NetworkPair| -> InsarResult<Result<PairProduct, String>> {
            let reference = image_for(acquisitions, &network.dates[pair.master_index])?;
            let secondary = image_for(acquisitions, &network.dates[pair.slave_index])?;
            match self.process_pair(ctx, pair, reference, secondary) {
                Ok(product) => Ok(Ok(product)),
                Err(e @ (InsarError::Cancelled | InsarError::ShapeMismatch(_))) => Err(e),
                Err(e) => {
                    log::warn!(
                        "Pair {} / {} failed: {}",
                        network.dates[pair.master_index],
                        network.dates[pair.slave_index],
                        e
                    );
                    Ok(Err(e.to_string()))
                }
            }
        };

        log::info!("Processing {} pairs", network.n_pairs());
        #[cfg(feature = "parallel")]
        let outcomes: Vec<Result<PairProduct, String>> = {
            use rayon::prelude::*;
            network.pairs.par_iter().map(run_pair).collect::<InsarResult<_>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<Result<PairProduct, String>> =
            network.pairs.iter().map(run_pair).collect::<InsarResult<_>>()?;

        let mut phase_stack = Vec::with_capacity(outcomes.len());
        let mut coherence_stack = Vec::with_capacity(outcomes.len());
        let mut pairs = Vec::with_capacity(outcomes.len());
        for (pair, outcome) in network.pairs.iter().zip(outcomes) {
            let mut summary = PairSummary {
                master_date: network.dates[pair.master_index],
                slave_date: network.dates[pair.slave_index],
                temporal_baseline_days: pair.temporal_baseline_days,
                perpendicular_baseline_m: pair.perpendicular_baseline_m,
                mean_coherence: None,
                method_used: None,
                quality_score: None,
                failure: None,
            };
            match outcome {
                Ok(product) => {
                    summary.mean_coherence = Some(product.mean_coherence);
                    summary.method_used = Some(product.method_used);
                    summary.quality_score = Some(product.quality_score);
                    phase_stack.push(product.unwrapped_phase);
                    coherence_stack.push(product.coherence);
                }
                Err(failure) => {
                    summary.failure = Some(failure);
                    phase_stack.push(SarRealImage::from_elem(shape, f32::NAN));
                    coherence_stack.push(SarRealImage::from_elem(shape, f32::NAN));
                }
            }
            pairs.push(summary);
        }
        ctx.record("pairs", format!("{} pairs joined", pairs.len()));

        ctx.check_cancelled()?;
        let cancel_flag = ctx.cancel_flag();
        let inversion = SbasInverter::new(self.config.inversion.clone()).invert_design(
            &network.design_matrix,
            &network.interval_days(),
            &phase_stack,
            Some(&coherence_stack),
            Some(cancel_flag.as_ref()),
        )?;
        ctx.record(
            "inversion",
            format!(
                "{} valid pixels, {} insufficient, {} degenerate",
                inversion.statistics.valid_pixels,
                inversion.statistics.insufficient_pixels,
                inversion.statistics.degenerate_pixels
            ),
        );

        let wavelength = self.config.wavelength_m;
        let displacement_los_m = inversion
            .displacement
            .mapv(|p| phase_to_los(p as f64, wavelength) as f32);
        let velocity_los_m_per_year = phase_raster_to_los(&inversion.velocity, wavelength);
        let velocity_vertical_m_per_year =
            los_raster_to_vertical(&velocity_los_m_per_year, self.config.incidence_angle_deg);

        Ok(StackResult {
            network,
            pairs,
            inversion,
            displacement_los_m,
            velocity_los_m_per_year,
            velocity_vertical_m_per_year,
        })
    }
}

fn image_for<'a>(
    acquisitions: &'a [(AcquisitionDate, SarImage)],
    date: &AcquisitionDate,
) -> InsarResult<&'a SarImage> {
    acquisitions
        .iter()
        .find(|(d, _)| d == date)
        .map(|(_, image)| image)
        .ok_or_else(|| InsarError::InvalidInput(format!("No image for {}", date)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SarComplex;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_config_json_round_trip() {
        let mut config = PipelineConfig::default();
        config.network.max_temporal_baseline_days = 48;
        config.external_unwrapper = Some(ExternalUnwrapperConfig::default());

        let json = config.to_json().unwrap();
        let parsed = PipelineConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.network.max_temporal_baseline_days, 48);
        assert_eq!(parsed.wavelength_m, 0.0555);
        assert!(parsed.external_unwrapper.is_some());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"incidence_angle_deg": 40.0}"#).unwrap();
        assert_eq!(config.incidence_angle_deg, 40.0);
        assert_eq!(config.inversion.regularization, 0.01);
        assert_eq!(config.network.max_perpendicular_baseline_m, 150.0);

        assert!(matches!(
            PipelineConfig::from_json_str("{not json"),
            Err(InsarError::Json(_))
        ));
    }

    #[test]
    fn test_run_context_lifecycle() {
        let ctx = RunContext::with_id("test-run");
        ctx.record("network", "3 dates");
        assert!(ctx.check_cancelled().is_ok());

        ctx.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(InsarError::Cancelled)));

        let report = ctx.finish();
        assert_eq!(report.run_id, "test-run");
        assert!(report.cancelled);
        assert_eq!(report.steps.len(), 1);
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn test_generated_run_ids_are_distinct() {
        let first = RunContext::new();
        let second = RunContext::new();
        assert!(first.run_id().starts_with("run-"));
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(RunContext::with_id("nightly").run_id(), "nightly");
    }

    #[test]
    fn test_reference_pixel_correction() {
        let pair = NetworkPair {
            master_index: 0,
            slave_index: 1,
            temporal_baseline_days: 12,
            perpendicular_baseline_m: 0.0,
        };
        let phase = SarRealImage::from_shape_fn((2, 2), |(i, j)| (i * 2 + j) as f32);
        let corrected = ReferencePixelCorrection { row: 1, col: 0 }.correct(&phase, &pair).unwrap();
        assert_abs_diff_eq!(corrected[[1, 0]], 0.0);
        assert_abs_diff_eq!(corrected[[0, 0]], -2.0);

        let outside = ReferencePixelCorrection { row: 5, col: 0 }.correct(&phase, &pair);
        assert!(matches!(outside, Err(InsarError::InvalidInput(_))));
    }

    struct Cropping;

    impl PhaseCorrection for Cropping {
        fn name(&self) -> &str {
            "cropping"
        }

        fn correct(&self, unwrapped: &SarRealImage, _: &NetworkPair) -> InsarResult<SarRealImage> {
            Ok(SarRealImage::zeros((unwrapped.nrows() - 1, unwrapped.ncols())))
        }
    }

    #[test]
    fn test_correction_changing_shape_is_rejected() {
        let image = SarImage::from_elem((8, 8), SarComplex::new(1.0, 0.0));
        let pair = NetworkPair {
            master_index: 0,
            slave_index: 1,
            temporal_baseline_days: 12,
            perpendicular_baseline_m: 0.0,
        };
        let mut config = PipelineConfig::default();
        config.coregistration.window_size = 8;
        config.interferogram.coherence_window = 3;
        let pipeline = InsarPipeline::new(config).with_correction(Box::new(Cropping));

        let ctx = RunContext::new();
        let err = pipeline.process_pair(&ctx, &pair, &image, &image).unwrap_err();
        assert!(matches!(err, InsarError::ShapeMismatch(_)));
    }

    #[test]
    fn test_cancelled_run_stops_before_pairs() {
        let image = SarImage::from_elem((4, 4), SarComplex::new(1.0, 0.0));
        let acquisitions: Vec<(AcquisitionDate, SarImage)> = ["2023-01-01", "2023-01-13"]
            .iter()
            .map(|d| (d.parse().unwrap(), image.clone()))
            .collect();
        let ctx = RunContext::new();
        ctx.cancel();
        let result = InsarPipeline::new(PipelineConfig::default()).process_stack(
            &ctx,
            &acquisitions,
            &crate::core::sbas_network::ZeroBaseline,
        );
        assert!(matches!(result, Err(InsarError::Cancelled)));
    }
}
