//! Phase unwrapping engine.
//!
//! An optional external statistical-cost network-flow unwrapper is tried
//! first; any failure of it drops to the in-process fallback, which is
//! either a residue-aware gradient integration with coherence blending or a
//! quality-guided flood fill.

use crate::core::unwrap_quality::{assess_unwrapping, UnwrapQuality};
use crate::types::{ensure_same_shape, InsarError, InsarResult, RasterStatistics, SarRealImage};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::str::FromStr;

/// Statistical cost model requested from the network-flow unwrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CostMode {
    /// Topography
    Topo,
    /// Deformation
    Defo,
    /// Generic smooth surface
    Smooth,
}

impl fmt::Display for CostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CostMode::Topo => write!(f, "TOPO"),
            CostMode::Defo => write!(f, "DEFO"),
            CostMode::Smooth => write!(f, "SMOOTH"),
        }
    }
}

impl FromStr for CostMode {
    type Err = InsarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TOPO" => Ok(CostMode::Topo),
            "DEFO" => Ok(CostMode::Defo),
            "SMOOTH" => Ok(CostMode::Smooth),
            _ => Err(InsarError::InvalidInput(format!("Invalid cost mode: {}", s))),
        }
    }
}

/// Initialisation strategy: network-flow style integration or spanning-tree growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitMethod {
    Mcf,
    Mst,
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitMethod::Mcf => write!(f, "MCF"),
            InitMethod::Mst => write!(f, "MST"),
        }
    }
}

/// Which implementation produced an unwrapped raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnwrapMethod {
    /// External statistical-cost network-flow tool
    External,
    /// In-process gradient integration with coherence blending
    GradientIntegration,
    /// In-process quality-guided flood fill
    QualityGuided,
}

impl fmt::Display for UnwrapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnwrapMethod::External => write!(f, "snaphu"),
            UnwrapMethod::GradientIntegration => write!(f, "gradient_mcf"),
            UnwrapMethod::QualityGuided => write!(f, "quality_mst"),
        }
    }
}

/// A phase unwrapping capability
pub trait PhaseUnwrapper: Send + Sync {
    fn method(&self) -> UnwrapMethod;

    fn unwrap_phase(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        cost_mode: CostMode,
    ) -> InsarResult<SarRealImage>;
}

/// Wrap a phase value into (-pi, pi]
pub fn wrap_phase(x: f64) -> f64 {
    x.sin().atan2(x.cos())
}

/// Unwrapping engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwrapParams {
    pub cost_mode: CostMode,
    /// Strategy of the in-process fallback
    pub fallback_method: InitMethod,
}

impl Default for UnwrapParams {
    fn default() -> Self {
        Self {
            cost_mode: CostMode::Defo,
            fallback_method: InitMethod::Mcf,
        }
    }
}

/// Summary of an unwrapped raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnwrapStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    /// Number of 2-pi cycles spanned by the unwrapped surface
    pub n_cycles: f64,
    pub positive_residues: usize,
    pub negative_residues: usize,
}

/// Output of the unwrapping engine
#[derive(Debug, Clone)]
pub struct UnwrapResult {
    pub unwrapped_phase: SarRealImage,
    pub method_used: UnwrapMethod,
    pub statistics: UnwrapStatistics,
    pub quality: UnwrapQuality,
}

/// Unwrapping engine: optional external tool, in-process fallback
pub struct UnwrapEngine {
    params: UnwrapParams,
    external: Option<Box<dyn PhaseUnwrapper>>,
    fallback: GradientUnwrapper,
}

impl UnwrapEngine {
    /// Engine that only runs the in-process fallback
    pub fn new(params: UnwrapParams) -> Self {
        let fallback = GradientUnwrapper::new(params.fallback_method);
        Self {
            params,
            external: None,
            fallback,
        }
    }

    pub fn standard() -> Self {
        Self::new(UnwrapParams::default())
    }

    /// Try `external` first on every call
    pub fn with_external(mut self, external: Box<dyn PhaseUnwrapper>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn params(&self) -> &UnwrapParams {
        &self.params
    }

    /// Unwrap with the configured cost mode
    pub fn unwrap(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
    ) -> InsarResult<UnwrapResult> {
        self.unwrap_with_mode(wrapped_phase, coherence, self.params.cost_mode)
    }

    pub fn unwrap_with_mode(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        cost_mode: CostMode,
    ) -> InsarResult<UnwrapResult> {
        ensure_same_shape("unwrap phase/coherence", wrapped_phase, coherence)?;
        log::info!(
            "Unwrapping {}x{} phase ({} cost mode)",
            wrapped_phase.nrows(),
            wrapped_phase.ncols(),
            cost_mode
        );

        let (unwrapped_phase, method_used) = match self.try_external(wrapped_phase, coherence, cost_mode)? {
            Some(result) => result,
            None => {
                let unwrapped = self.fallback.unwrap_phase(wrapped_phase, coherence, cost_mode)?;
                (unwrapped, self.fallback.method())
            }
        };

        let statistics = compute_statistics(wrapped_phase, &unwrapped_phase);
        let quality = assess_unwrapping(wrapped_phase, &unwrapped_phase, coherence)?;

        log::info!(
            "Phase unwrapping completed with {}: {:.2} cycles, quality {:.1} ({})",
            method_used,
            statistics.n_cycles,
            quality.quality_score,
            quality.level
        );

        Ok(UnwrapResult {
            unwrapped_phase,
            method_used,
            statistics,
            quality,
        })
    }

    /// `Ok(None)` whenever the fallback should run; only cancellation propagates
    fn try_external(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        cost_mode: CostMode,
    ) -> InsarResult<Option<(SarRealImage, UnwrapMethod)>> {
        let Some(external) = self.external.as_ref() else {
            return Ok(None);
        };
        match external.unwrap_phase(wrapped_phase, coherence, cost_mode) {
            Ok(unwrapped) if unwrapped.dim() == wrapped_phase.dim() => {
                Ok(Some((unwrapped, external.method())))
            }
            Ok(unwrapped) => {
                log::warn!(
                    "External unwrapper returned {:?} for {:?} input, using in-process fallback",
                    unwrapped.dim(),
                    wrapped_phase.dim()
                );
                Ok(None)
            }
            Err(InsarError::Cancelled) => Err(InsarError::Cancelled),
            Err(e) => {
                log::warn!("External unwrapper failed ({}), using in-process fallback", e);
                Ok(None)
            }
        }
    }
}

impl Default for UnwrapEngine {
    fn default() -> Self {
        Self::standard()
    }
}

/// In-process unwrapper, independent of any external binary
#[derive(Debug, Clone)]
pub struct GradientUnwrapper {
    method: InitMethod,
}

impl GradientUnwrapper {
    pub fn new(method: InitMethod) -> Self {
        Self { method }
    }

    /// Integrate wrapped gradients along rows, then fix each column to the
    /// wrapped column gradient.
    ///
    /// NaN pixels stay NaN; the sweeps bridge them to the last valid pixel.
    pub fn integrate_gradients(wrapped: &SarRealImage) -> Array2<f64> {
        let (rows, cols) = wrapped.dim();
        let mut unwrapped = Array2::<f64>::from_elem((rows, cols), f64::NAN);

        for i in 0..rows {
            let mut last: Option<(f64, f64)> = None;
            for j in 0..cols {
                let p = wrapped[[i, j]] as f64;
                if !p.is_finite() {
                    continue;
                }
                let u = match last {
                    None => p,
                    Some((lp, lu)) => lu + wrap_phase(p - lp),
                };
                unwrapped[[i, j]] = u;
                last = Some((p, u));
            }
        }

        for j in 0..cols {
            let mut last: Option<(f64, f64)> = None;
            for i in 0..rows {
                let p = wrapped[[i, j]] as f64;
                if !p.is_finite() {
                    continue;
                }
                if let Some((lp, lu)) = last {
                    let dy = wrap_phase(p - lp);
                    let adjustment = ((dy - (unwrapped[[i, j]] - lu)) / TAU).round() * TAU;
                    unwrapped[[i, j]] += adjustment;
                }
                last = Some((p, unwrapped[[i, j]]));
            }
        }

        unwrapped
    }

    /// Pull low-coherence pixels toward their coherence-weighted 3x3 mean.
    ///
    /// With `w = coherence^2`, `out = w * u + (1 - w) * smooth`.
    pub fn coherence_blend(unwrapped: &Array2<f64>, coherence: &SarRealImage) -> Array2<f64> {
        let (rows, cols) = unwrapped.dim();
        let weight = coherence.mapv(|c| {
            if c.is_finite() {
                (c as f64).clamp(0.0, 1.0).powi(2)
            } else {
                0.0
            }
        });

        let blend = |(i, j): (usize, usize), out: &mut f64| {
            let u = unwrapped[[i, j]];
            if !u.is_finite() {
                *out = f64::NAN;
                return;
            }
            let mut num = 0.0;
            let mut den = 0.0;
            for ii in i.saturating_sub(1)..(i + 2).min(rows) {
                for jj in j.saturating_sub(1)..(j + 2).min(cols) {
                    let v = unwrapped[[ii, jj]];
                    if v.is_finite() {
                        num += weight[[ii, jj]] * v;
                        den += weight[[ii, jj]];
                    }
                }
            }
            let smooth = if den > 1e-12 { num / den } else { u };
            let w = weight[[i, j]];
            *out = w * u + (1.0 - w) * smooth;
        };

        let mut blended = Array2::<f64>::zeros((rows, cols));
        #[cfg(feature = "parallel")]
        Zip::indexed(&mut blended).par_for_each(blend);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut blended).for_each(blend);
        blended
    }

    /// Grow the solution from the most coherent pixel, always extending to the
    /// most coherent frontier pixel next.
    pub fn quality_guided(wrapped: &SarRealImage, coherence: &SarRealImage) -> Array2<f64> {
        let (rows, cols) = wrapped.dim();
        let mut unwrapped = Array2::<f64>::from_elem((rows, cols), f64::NAN);
        let mut visited = Array2::<bool>::from_elem((rows, cols), false);
        let quality = |i: usize, j: usize| {
            let c = coherence[[i, j]];
            if c.is_finite() { c } else { f32::NEG_INFINITY }
        };

        // Region seeds in descending coherence, sorted once
        let mut seeds: Vec<(usize, usize)> = wrapped
            .indexed_iter()
            .filter(|(_, p)| p.is_finite())
            .map(|(idx, _)| idx)
            .collect();
        seeds.sort_by(|&(ai, aj), &(bi, bj)| quality(bi, bj).total_cmp(&quality(ai, aj)));

        let mut heap = BinaryHeap::new();
        for (si, sj) in seeds {
            if visited[[si, sj]] {
                continue;
            }

            unwrapped[[si, sj]] = wrapped[[si, sj]] as f64;
            visited[[si, sj]] = true;
            push_neighbours(&mut heap, wrapped, &visited, (si, sj), &quality);

            while let Some(candidate) = heap.pop() {
                let (i, j) = candidate.pixel;
                if visited[[i, j]] {
                    continue;
                }
                let (pi, pj) = candidate.parent;
                let diff = wrap_phase(wrapped[[i, j]] as f64 - wrapped[[pi, pj]] as f64);
                unwrapped[[i, j]] = unwrapped[[pi, pj]] + diff;
                visited[[i, j]] = true;
                push_neighbours(&mut heap, wrapped, &visited, (i, j), &quality);
            }
        }

        unwrapped
    }
}

impl PhaseUnwrapper for GradientUnwrapper {
    fn method(&self) -> UnwrapMethod {
        match self.method {
            InitMethod::Mcf => UnwrapMethod::GradientIntegration,
            InitMethod::Mst => UnwrapMethod::QualityGuided,
        }
    }

    fn unwrap_phase(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        _cost_mode: CostMode,
    ) -> InsarResult<SarRealImage> {
        ensure_same_shape("unwrap phase/coherence", wrapped_phase, coherence)?;
        log::info!("Using in-process {} unwrapping", self.method);

        let unwrapped = match self.method {
            InitMethod::Mcf => {
                let integrated = Self::integrate_gradients(wrapped_phase);
                Self::coherence_blend(&integrated, coherence)
            }
            InitMethod::Mst => Self::quality_guided(wrapped_phase, coherence),
        };
        Ok(unwrapped.mapv(|v| v as f32))
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    quality: f32,
    pixel: (usize, usize),
    parent: (usize, usize),
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on quality; ties broken by raster order for determinism
        self.quality
            .total_cmp(&other.quality)
            .then_with(|| other.pixel.cmp(&self.pixel))
    }
}

fn push_neighbours(
    heap: &mut BinaryHeap<Candidate>,
    wrapped: &SarRealImage,
    visited: &Array2<bool>,
    (i, j): (usize, usize),
    quality: &impl Fn(usize, usize) -> f32,
) {
    let (rows, cols) = wrapped.dim();
    let neighbours = [
        (i.wrapping_sub(1), j),
        (i + 1, j),
        (i, j.wrapping_sub(1)),
        (i, j + 1),
    ];
    for (ni, nj) in neighbours {
        if ni < rows && nj < cols && !visited[[ni, nj]] && wrapped[[ni, nj]].is_finite() {
            heap.push(Candidate {
                quality: quality(ni, nj),
                pixel: (ni, nj),
                parent: (i, j),
            });
        }
    }
}

/// Residue charge of every elementary 2x2 loop, shape `(rows - 1, cols - 1)`.
///
/// Loops touching a NaN pixel carry no charge.
pub fn compute_residues(wrapped: &SarRealImage) -> Array2<i8> {
    let (rows, cols) = wrapped.dim();
    if rows < 2 || cols < 2 {
        return Array2::zeros((rows.saturating_sub(1), cols.saturating_sub(1)));
    }
    Array2::from_shape_fn((rows - 1, cols - 1), |(i, j)| {
        let a = wrapped[[i, j]] as f64;
        let b = wrapped[[i, j + 1]] as f64;
        let c = wrapped[[i + 1, j + 1]] as f64;
        let d = wrapped[[i + 1, j]] as f64;
        let circulation = wrap_phase(b - a) + wrap_phase(c - b) + wrap_phase(d - c) + wrap_phase(a - d);
        if circulation.is_finite() {
            (circulation / TAU).round() as i8
        } else {
            0
        }
    })
}

fn compute_statistics(wrapped: &SarRealImage, unwrapped: &SarRealImage) -> UnwrapStatistics {
    let stats = RasterStatistics::compute(unwrapped.view());
    let residues = compute_residues(wrapped);
    let positive_residues = residues.iter().filter(|&&r| r > 0).count();
    let negative_residues = residues.iter().filter(|&&r| r < 0).count();
    let n_cycles = if stats.valid_pixels > 0 {
        (stats.max - stats.min) / (2.0 * PI)
    } else {
        0.0
    };

    UnwrapStatistics {
        mean: stats.mean,
        std: stats.std,
        min: stats.min,
        max: stats.max,
        n_cycles,
        positive_residues,
        negative_residues,
    }
}
