use crate::core::sbas_network::{AcquisitionDate, BaselineProvider};
use crate::types::{InsarError, InsarResult, OrbitData, StateVector};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Orbit state interpolation
pub struct OrbitReader;

impl OrbitReader {
    /// Interpolate the satellite state at `target_time`.
    ///
    /// Linear between the two bracketing state vectors; times outside the
    /// orbit span are rejected.
    pub fn interpolate_state(orbit: &OrbitData, target_time: DateTime<Utc>) -> InsarResult<StateVector> {
        log::debug!("Interpolating orbit state for time: {}", target_time);

        let vectors = &orbit.state_vectors;
        let first = vectors
            .first()
            .ok_or_else(|| InsarError::InvalidInput("No state vectors in orbit data".to_string()))?;
        if vectors.len() == 1 {
            return if first.time == target_time {
                Ok(first.clone())
            } else {
                Err(InsarError::InvalidInput(
                    "Single state vector cannot be interpolated".to_string(),
                ))
            };
        }

        for window in vectors.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            if target_time < a.time || target_time > b.time {
                continue;
            }
            let span = seconds_between(a.time, b.time);
            if span <= 0.0 {
                return Ok(a.clone());
            }
            let t = seconds_between(a.time, target_time) / span;
            return Ok(StateVector {
                time: target_time,
                position: lerp3(&a.position, &b.position, t),
                velocity: lerp3(&a.velocity, &b.velocity, t),
            });
        }

        Err(InsarError::InvalidInput(format!(
            "Time {} outside orbit span",
            target_time
        )))
    }

    /// Interpolated position at `target_time`
    pub fn interpolate_position(orbit: &OrbitData, target_time: DateTime<Utc>) -> InsarResult<[f64; 3]> {
        Ok(Self::interpolate_state(orbit, target_time)?.position)
    }
}

/// Perpendicular baselines from per-acquisition orbits and a ground target (ECEF)
pub struct OrbitBaselines {
    orbits: HashMap<AcquisitionDate, OrbitData>,
    target: [f64; 3],
}

impl OrbitBaselines {
    pub fn new(target: [f64; 3]) -> Self {
        Self {
            orbits: HashMap::new(),
            target,
        }
    }

    pub fn insert(&mut self, date: AcquisitionDate, orbit: OrbitData) {
        self.orbits.insert(date, orbit);
    }

    /// Baseline component orthogonal to both the master line of sight and the
    /// master flight direction
    pub fn baseline_between(&self, master: &OrbitData, slave: &OrbitData) -> InsarResult<f64> {
        let m = OrbitReader::interpolate_state(master, master.reference_time)?;
        let s = OrbitReader::interpolate_position(slave, slave.reference_time)?;

        let los = normalize(sub(&self.target, &m.position)).ok_or_else(|| {
            InsarError::NumericDegenerate("Satellite position coincides with target".to_string())
        })?;
        let along = normalize(sub(&m.velocity, &scale(&los, dot(&m.velocity, &los))));

        let mut baseline = sub(&s, &m.position);
        baseline = sub(&baseline, &scale(&los, dot(&baseline, &los)));
        if let Some(along) = along {
            baseline = sub(&baseline, &scale(&along, dot(&baseline, &along)));
        }
        Ok(dot(&baseline, &baseline).sqrt())
    }
}

impl BaselineProvider for OrbitBaselines {
    fn perpendicular_baseline(
        &self,
        dates: &[AcquisitionDate],
        master: usize,
        slave: usize,
    ) -> Option<f64> {
        let m = self.orbits.get(dates.get(master)?)?;
        let s = self.orbits.get(dates.get(slave)?)?;
        match self.baseline_between(m, s) {
            Ok(b) => Some(b),
            Err(e) => {
                log::warn!("Baseline estimation failed for {} / {}: {}", dates[master], dates[slave], e);
                None
            }
        }
    }
}

fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_milliseconds() as f64 / 1000.0
}

fn lerp3(a: &[f64; 3], b: &[f64; 3], t: f64) -> [f64; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: &[f64; 3], k: f64) -> [f64; 3] {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(a: [f64; 3]) -> Option<[f64; 3]> {
    let n = dot(&a, &a).sqrt();
    if n > 0.0 && n.is_finite() {
        Some(scale(&a, 1.0 / n))
    } else {
        None
    }
}
