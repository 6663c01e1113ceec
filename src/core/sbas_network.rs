use crate::types::{InsarError, InsarResult};
use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Calendar date of one SAR acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AcquisitionDate(pub NaiveDate);

impl AcquisitionDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> InsarResult<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(AcquisitionDate)
            .ok_or_else(|| InsarError::InvalidInput(format!("Invalid date: {}-{}-{}", year, month, day)))
    }

    /// Signed number of days from `self` to `later`
    pub fn days_until(&self, later: &AcquisitionDate) -> i64 {
        later.0.signed_duration_since(self.0).num_days()
    }
}

impl FromStr for AcquisitionDate {
    type Err = InsarError;

    /// Accepts `YYYY-MM-DD` and `YYYYMMDD`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
            .map(AcquisitionDate)
            .map_err(|e| InsarError::InvalidInput(format!("Invalid acquisition date '{}': {}", s, e)))
    }
}

impl fmt::Display for AcquisitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// One interferometric pair, indices into the sorted date list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkPair {
    pub master_index: usize,
    pub slave_index: usize,
    pub temporal_baseline_days: i64,
    pub perpendicular_baseline_m: f64,
}

/// Source of perpendicular baselines between acquisitions
pub trait BaselineProvider: Send + Sync {
    /// Baseline in metres between `dates[master]` and `dates[slave]`, if known
    fn perpendicular_baseline(
        &self,
        dates: &[AcquisitionDate],
        master: usize,
        slave: usize,
    ) -> Option<f64>;
}

/// No orbit information: every pair is treated as a zero-baseline pair
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroBaseline;

impl BaselineProvider for ZeroBaseline {
    fn perpendicular_baseline(&self, _: &[AcquisitionDate], _: usize, _: usize) -> Option<f64> {
        Some(0.0)
    }
}

/// Per-date perpendicular positions relative to a common reference orbit
#[derive(Debug, Clone, Default)]
pub struct BaselineTable {
    positions: HashMap<AcquisitionDate, f64>,
}

impl BaselineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: AcquisitionDate, perpendicular_position_m: f64) {
        self.positions.insert(date, perpendicular_position_m);
    }
}

impl BaselineProvider for BaselineTable {
    fn perpendicular_baseline(
        &self,
        dates: &[AcquisitionDate],
        master: usize,
        slave: usize,
    ) -> Option<f64> {
        let a = self.positions.get(dates.get(master)?)?;
        let b = self.positions.get(dates.get(slave)?)?;
        Some((b - a).abs())
    }
}

/// Network selection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkParams {
    pub max_temporal_baseline_days: i64,
    pub max_perpendicular_baseline_m: f64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            max_temporal_baseline_days: 365,
            max_perpendicular_baseline_m: 150.0,
        }
    }
}

/// Reachability of the dates from date 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub is_connected: bool,
    pub n_connected: usize,
    pub n_disconnected: usize,
    /// Per-date reachability flag
    pub reachable: Vec<bool>,
}

/// Serializable network report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub n_dates: usize,
    pub n_pairs: usize,
    pub dates: Vec<AcquisitionDate>,
    pub pairs: Vec<NetworkPair>,
    pub connectivity: Connectivity,
}

/// Small-baseline interferogram network
#[derive(Debug, Clone)]
pub struct SbasNetwork {
    pub dates: Vec<AcquisitionDate>,
    pub pairs: Vec<NetworkPair>,
    /// `M x (N-1)`, interval durations in days
    pub design_matrix: Array2<f64>,
    pub connectivity: Connectivity,
}

impl SbasNetwork {
    /// Network over explicit pairs; dates must already be sorted and distinct
    pub fn from_pairs(dates: Vec<AcquisitionDate>, pairs: Vec<NetworkPair>) -> InsarResult<Self> {
        validate_dates(&dates)?;
        for pair in &pairs {
            if pair.master_index >= pair.slave_index || pair.slave_index >= dates.len() {
                return Err(InsarError::InvalidInput(format!(
                    "Invalid pair ({}, {}) for {} dates",
                    pair.master_index,
                    pair.slave_index,
                    dates.len()
                )));
            }
        }
        let design_matrix = build_design_matrix(&dates, &pairs);
        let connectivity = check_connectivity(dates.len(), &pairs);
        Ok(Self {
            dates,
            pairs,
            design_matrix,
            connectivity,
        })
    }

    pub fn n_dates(&self) -> usize {
        self.dates.len()
    }

    pub fn n_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Durations of the `N-1` consecutive date intervals
    pub fn interval_days(&self) -> Vec<f64> {
        self.dates
            .windows(2)
            .map(|w| w[0].days_until(&w[1]) as f64)
            .collect()
    }

    pub fn total_span_days(&self) -> f64 {
        match (self.dates.first(), self.dates.last()) {
            (Some(first), Some(last)) => first.days_until(last) as f64,
            _ => 0.0,
        }
    }

    /// Reject a network that does not span every date
    pub fn require_connected(&self) -> InsarResult<()> {
        if self.connectivity.is_connected {
            Ok(())
        } else {
            Err(InsarError::DisconnectedNetwork {
                connected: self.connectivity.n_connected,
                total: self.n_dates(),
            })
        }
    }

    /// Restrict the network to the component containing date 0.
    ///
    /// Returns the sub-network and, for each of its pairs, the index of the
    /// pair in `self`.
    pub fn reachable_subnetwork(&self) -> InsarResult<(SbasNetwork, Vec<usize>)> {
        let reachable = &self.connectivity.reachable;
        let mut new_index = vec![usize::MAX; self.n_dates()];
        let mut dates = Vec::new();
        for (k, date) in self.dates.iter().enumerate() {
            if reachable[k] {
                new_index[k] = dates.len();
                dates.push(*date);
            }
        }

        let mut pairs = Vec::new();
        let mut origin = Vec::new();
        for (k, pair) in self.pairs.iter().enumerate() {
            if reachable[pair.master_index] && reachable[pair.slave_index] {
                pairs.push(NetworkPair {
                    master_index: new_index[pair.master_index],
                    slave_index: new_index[pair.slave_index],
                    ..*pair
                });
                origin.push(k);
            }
        }

        log::info!(
            "Reachable sub-network: {} of {} dates, {} of {} pairs",
            dates.len(),
            self.n_dates(),
            pairs.len(),
            self.n_pairs()
        );
        Ok((SbasNetwork::from_pairs(dates, pairs)?, origin))
    }

    pub fn summary(&self) -> NetworkSummary {
        NetworkSummary {
            n_dates: self.n_dates(),
            n_pairs: self.n_pairs(),
            dates: self.dates.clone(),
            pairs: self.pairs.clone(),
            connectivity: self.connectivity.clone(),
        }
    }
}

/// Builds the SBAS network from the acquisition dates
pub struct SbasNetworkBuilder {
    params: NetworkParams,
}

impl SbasNetworkBuilder {
    pub fn new(params: NetworkParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(NetworkParams::default())
    }

    /// Build without orbit information (zero perpendicular baselines)
    pub fn build(&self, dates: &[AcquisitionDate]) -> InsarResult<SbasNetwork> {
        self.build_with_baselines(dates, &ZeroBaseline)
    }

    /// Keep every pair `i < j` within both baseline thresholds
    pub fn build_with_baselines(
        &self,
        dates: &[AcquisitionDate],
        baselines: &dyn BaselineProvider,
    ) -> InsarResult<SbasNetwork> {
        let mut dates = dates.to_vec();
        dates.sort();
        validate_dates(&dates)?;

        log::info!(
            "Building SBAS network over {} dates (max {} days, {} m)",
            dates.len(),
            self.params.max_temporal_baseline_days,
            self.params.max_perpendicular_baseline_m
        );

        let mut pairs = Vec::new();
        for i in 0..dates.len() {
            for j in (i + 1)..dates.len() {
                let temporal = dates[i].days_until(&dates[j]);
                if temporal > self.params.max_temporal_baseline_days {
                    continue;
                }

                let perpendicular = match baselines.perpendicular_baseline(&dates, i, j) {
                    Some(b) => b,
                    None => {
                        log::debug!("No baseline for {} / {}, assuming 0 m", dates[i], dates[j]);
                        0.0
                    }
                };
                if perpendicular.abs() > self.params.max_perpendicular_baseline_m {
                    continue;
                }

                pairs.push(NetworkPair {
                    master_index: i,
                    slave_index: j,
                    temporal_baseline_days: temporal,
                    perpendicular_baseline_m: perpendicular,
                });
            }
        }

        let network = SbasNetwork::from_pairs(dates, pairs)?;
        log::info!("Built network with {} pairs", network.n_pairs());
        if !network.connectivity.is_connected {
            log::warn!(
                "Network is not fully connected: {} of {} dates reachable",
                network.connectivity.n_connected,
                network.n_dates()
            );
        }
        Ok(network)
    }
}

impl Default for SbasNetworkBuilder {
    fn default() -> Self {
        Self::standard()
    }
}

fn validate_dates(dates: &[AcquisitionDate]) -> InsarResult<()> {
    if dates.len() < 2 {
        return Err(InsarError::InvalidInput(format!(
            "SBAS network needs at least 2 dates, got {}",
            dates.len()
        )));
    }
    if let Some(w) = dates.windows(2).find(|w| w[0] >= w[1]) {
        return Err(InsarError::InvalidInput(format!(
            "Acquisition dates must be distinct and sorted: {} then {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Row per pair holding the durations of the intervals it spans
fn build_design_matrix(dates: &[AcquisitionDate], pairs: &[NetworkPair]) -> Array2<f64> {
    let n_unknowns = dates.len().saturating_sub(1);
    let mut a = Array2::<f64>::zeros((pairs.len(), n_unknowns));
    for (k, pair) in pairs.iter().enumerate() {
        for m in pair.master_index..pair.slave_index {
            a[[k, m]] = dates[m].days_until(&dates[m + 1]) as f64;
        }
    }
    a
}

/// Breadth-first traversal from date 0 over undirected pair edges
fn check_connectivity(n_dates: usize, pairs: &[NetworkPair]) -> Connectivity {
    let mut adjacency = vec![Vec::new(); n_dates];
    for pair in pairs {
        adjacency[pair.master_index].push(pair.slave_index);
        adjacency[pair.slave_index].push(pair.master_index);
    }

    let mut reachable = vec![false; n_dates];
    let mut queue = VecDeque::new();
    if n_dates > 0 {
        reachable[0] = true;
        queue.push_back(0);
    }
    while let Some(node) = queue.pop_front() {
        for &next in &adjacency[node] {
            if !reachable[next] {
                reachable[next] = true;
                queue.push_back(next);
            }
        }
    }

    let n_connected = reachable.iter().filter(|&&r| r).count();
    Connectivity {
        is_connected: n_connected == n_dates,
        n_connected,
        n_disconnected: n_dates - n_connected,
        reachable,
    }
}
