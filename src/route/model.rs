use serde::{Deserialize, Serialize};

use super::geo::haversine_km;
use crate::error::TrackerError;

/// One raw geographic point of the loaded route. Immutable input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
}

impl RoutePoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        RoutePoint {
            lat,
            lon,
            elevation: None,
        }
    }

    pub fn with_elevation(lat: f64, lon: f64, elevation: f64) -> Self {
        RoutePoint {
            lat,
            lon,
            elevation: Some(elevation),
        }
    }
}

/// A resampled route point with known cumulative distance from the start.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Checkpoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub cumulative_km: f64,
}

/// Distance-indexed polyline. Built once per loaded route, immutable, shared
/// read-only by every device; replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct RouteModel {
    checkpoints: Vec<Checkpoint>,
    total_km: f64,
    step_m: f64,
}

/// Adaptive resolution targets ~400 checkpoints per route.
const TARGET_CHECKPOINTS: f64 = 400.0;
const MIN_STEP_M: f64 = 5.0;
const MAX_STEP_M: f64 = 100.0;

impl RouteModel {
    /// Build from raw route points, resampling at `step_meters` (adaptive
    /// default). Points with non-finite coordinates are discarded; fewer
    /// than 2 surviving points is an invalid route.
    pub fn build(
        points: &[RoutePoint],
        step_meters: Option<f64>,
    ) -> Result<RouteModel, TrackerError> {
        let pts: Vec<RoutePoint> = points
            .iter()
            .filter(|p| p.lat.is_finite() && p.lon.is_finite())
            .copied()
            .collect();
        if pts.len() < 2 {
            return Err(TrackerError::InvalidRoute(pts.len()));
        }

        let mut cum_km = Vec::with_capacity(pts.len());
        cum_km.push(0.0);
        for w in pts.windows(2) {
            let d = haversine_km(w[0].lat, w[0].lon, w[1].lat, w[1].lon);
            cum_km.push(cum_km.last().unwrap() + d);
        }
        let total_km = *cum_km.last().unwrap();

        let step_m = step_meters
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or_else(|| (total_km * 1000.0 / TARGET_CHECKPOINTS).clamp(MIN_STEP_M, MAX_STEP_M));
        let step_km = step_m / 1000.0;

        let n_steps = ((total_km / step_km).floor() as usize).max(1);
        let mut cps = Vec::with_capacity(n_steps + 2);
        for i in 0..=n_steps {
            let target_km = (i as f64 * step_km).min(total_km);
            let seg = locate_segment(&cum_km, target_km);
            let seg_len = (cum_km[seg + 1] - cum_km[seg]).max(0.0);
            let t = if seg_len > 0.0 {
                (target_km - cum_km[seg]) / seg_len
            } else {
                0.0
            };
            let a = &pts[seg];
            let b = &pts[seg + 1];
            let elevation = match (a.elevation, b.elevation) {
                (Some(ea), Some(eb)) => Some(ea + (eb - ea) * t),
                _ => None,
            };
            cps.push(Checkpoint {
                lat: a.lat + (b.lat - a.lat) * t,
                lon: a.lon + (b.lon - a.lon) * t,
                elevation,
                cumulative_km: target_km,
            });
        }

        // The last checkpoint lands exactly on the route end even when the
        // final step is shorter than step_km. Sub-millimeter residue snaps
        // the last resampled point instead of appending a degenerate segment.
        let last = pts.last().unwrap();
        let end_cp = Checkpoint {
            lat: last.lat,
            lon: last.lon,
            elevation: last.elevation,
            cumulative_km: total_km,
        };
        if total_km - cps.last().unwrap().cumulative_km > 1e-6 {
            cps.push(end_cp);
        } else {
            *cps.last_mut().unwrap() = end_cp;
        }

        Ok(RouteModel {
            checkpoints: cps,
            total_km,
            step_m,
        })
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn total_km(&self) -> f64 {
        self.total_km
    }

    pub fn step_m(&self) -> f64 {
        self.step_m
    }

    pub fn segment_count(&self) -> usize {
        self.checkpoints.len().saturating_sub(1)
    }

    /// Checkpoint index whose segment contains the given distance. Clamped to
    /// a valid segment start.
    pub fn index_for_distance(&self, km: f64) -> usize {
        if self.checkpoints.len() < 2 {
            return 0;
        }
        let idx = self
            .checkpoints
            .partition_point(|cp| cp.cumulative_km <= km)
            .saturating_sub(1);
        idx.min(self.checkpoints.len() - 2)
    }
}

fn locate_segment(cum_km: &[f64], target_km: f64) -> usize {
    let idx = cum_km.partition_point(|d| *d <= target_km).saturating_sub(1);
    idx.min(cum_km.len() - 2)
}
