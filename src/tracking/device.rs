use std::collections::VecDeque;

use serde::Serialize;

use crate::config::LocomotionMode;
use crate::route::geo::{format_hms, format_pace, kmh_to_pace_min_per_km};
use crate::route::Projection;
use crate::speed::{ProjectedSample, SpeedEstimator};
use crate::tracking::consistency::Consistency;

/// Display palette, assigned round-robin on first fix.
pub const COLORS: [&str; 5] = ["#e53935", "#1e88e5", "#43a047", "#fb8c00", "#8e24aa"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePhase {
    Active,
    Finished,
}

/// One raw fix as kept for display history.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RawSample {
    pub ts_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
}

/// Personal-best target configured per device.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalBest {
    pub target_time_ms: i64,
    pub target_distance_km: f64,
    pub target_pace_min_per_km: f64,
}

impl PersonalBest {
    pub fn new(target_time_ms: i64, target_distance_km: f64) -> Self {
        PersonalBest {
            target_time_ms,
            target_distance_km,
            target_pace_min_per_km: (target_time_ms as f64 / 1000.0) / 60.0 / target_distance_km,
        }
    }
}

/// Delta against the personal-best target, refreshed each tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub delta_to_target_ms: Option<i64>,
    pub on_target: bool,
    pub gap_pace_sec_per_km: Option<i64>,
}

#[derive(Debug, Default)]
pub(crate) struct EtaState {
    pub armed: bool,
    /// Estimated total race duration, clamped against the previous value.
    pub shown_total_ms: Option<i64>,
    pub frozen: bool,
    pub stationary_since_ms: Option<i64>,
}

/// Mutable per-device record. Created on the first fix, never destroyed
/// except through an explicit engine reset.
#[derive(Debug)]
pub struct DeviceState {
    pub id: String,
    pub color: &'static str,
    pub(crate) phase: DevicePhase,

    pub(crate) raw_history: VecDeque<RawSample>,
    pub(crate) proj_history: VecDeque<ProjectedSample>,
    pub(crate) last_projection: Option<Projection>,

    pub(crate) distance_covered_km: f64,
    pub(crate) distance_remaining_km: f64,
    pub(crate) progress_pct: f64,
    pub(crate) cp_index: usize,
    pub(crate) prev_cp_index: usize,

    pub(crate) estimator: SpeedEstimator,

    pub(crate) strikes: u32,
    pub(crate) off_route: bool,
    pub(crate) outlier_jump: bool,

    pub(crate) eta: EtaState,
    pub(crate) target: Option<PersonalBest>,
    pub(crate) target_status: TargetStatus,
    pub(crate) consistency: Consistency,
    pub(crate) grade_pct: Option<f64>,

    pub(crate) confidence: u8,
    pub(crate) gap_s: f64,
    pub(crate) last_update_ms: Option<i64>,
}

impl DeviceState {
    pub(crate) fn new(id: String, color: &'static str, total_km: f64) -> Self {
        DeviceState {
            id,
            color,
            phase: DevicePhase::Active,
            raw_history: VecDeque::new(),
            proj_history: VecDeque::new(),
            last_projection: None,
            distance_covered_km: 0.0,
            distance_remaining_km: total_km,
            progress_pct: 0.0,
            cp_index: 0,
            prev_cp_index: 0,
            estimator: SpeedEstimator::new(),
            strikes: 0,
            off_route: false,
            outlier_jump: false,
            eta: EtaState::default(),
            target: None,
            target_status: TargetStatus::default(),
            consistency: Consistency::default(),
            grade_pct: None,
            confidence: 100,
            gap_s: 0.0,
            last_update_ms: None,
        }
    }

    /// Raw history is display-only and ages out on wall time alone. The
    /// projected history also feeds consistency, track speed and the
    /// windowed average, so a sample-count floor overrides the age cut:
    /// a multi-minute signal gap degrades confidence, it does not drain
    /// the derived-metric pipeline.
    pub(crate) fn prune_histories(&mut self, now_ms: i64, max_age_s: f64, proj_min_samples: usize) {
        let min_ts = now_ms - (max_age_s * 1000.0) as i64;
        while self.raw_history.front().map_or(false, |s| s.ts_ms < min_ts) {
            self.raw_history.pop_front();
        }
        while self.proj_history.len() > proj_min_samples
            && self.proj_history.front().map_or(false, |s| s.ts_ms < min_ts)
        {
            self.proj_history.pop_front();
        }
    }

    /// Owned point-in-time copy for the read model. Built after a full
    /// update, so collaborators never observe a half-updated device.
    pub fn snapshot(&self, race_elapsed_ms: Option<i64>) -> DeviceSnapshot {
        let last_raw = self.raw_history.back();
        let pace_now = last_raw.and_then(|s| kmh_to_pace_min_per_km(s.speed_kmh));
        let pace_avg = self.estimator.ema_kmh().and_then(kmh_to_pace_min_per_km);
        let eta_remaining_ms = match (self.eta.shown_total_ms, race_elapsed_ms) {
            (Some(total), Some(elapsed)) => Some((total - elapsed).max(0)),
            _ => None,
        };
        DeviceSnapshot {
            id: self.id.clone(),
            color: self.color.to_string(),
            phase: self.phase,
            mode: self.estimator.mode(),
            last_seen_ms: self.last_update_ms,
            lat: last_raw.map(|s| s.lat),
            lon: last_raw.map(|s| s.lon),
            projected_lat: self.last_projection.map(|p| p.lat),
            projected_lon: self.last_projection.map(|p| p.lon),
            lateral_offset_m: self.last_projection.map(|p| p.lateral_offset_m),
            distance_covered_km: self.distance_covered_km,
            distance_remaining_km: self.distance_remaining_km,
            progress_pct: self.progress_pct,
            reported_speed_kmh: last_raw.map(|s| s.speed_kmh).unwrap_or(0.0),
            effective_speed_kmh: self.estimator.effective_kmh(),
            ema_speed_kmh: self.estimator.ema_kmh(),
            using_track_speed: self.estimator.using_track_speed(),
            pace_now_min_per_km: pace_now,
            pace_avg_min_per_km: pace_avg,
            pace_avg_display: format_pace(pace_avg),
            eta_armed: self.eta.armed,
            eta_total_ms: self.eta.shown_total_ms,
            eta_remaining_ms,
            eta_frozen: self.eta.frozen,
            eta_display: self
                .eta
                .shown_total_ms
                .map(format_hms)
                .unwrap_or_else(|| "-".to_string()),
            off_route: self.off_route,
            off_route_strikes: self.strikes,
            outlier_jump: self.outlier_jump,
            gap_s: self.gap_s,
            confidence: self.confidence,
            personal_best: self.target,
            target: self.target_status,
            consistency: self.consistency,
            grade_pct: self.grade_pct,
        }
    }
}

/// Read-model view of one device, serializable for the UI/overlay layers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub color: String,
    pub phase: DevicePhase,
    pub mode: LocomotionMode,
    pub last_seen_ms: Option<i64>,

    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub projected_lat: Option<f64>,
    pub projected_lon: Option<f64>,
    pub lateral_offset_m: Option<f64>,

    pub distance_covered_km: f64,
    pub distance_remaining_km: f64,
    pub progress_pct: f64,

    pub reported_speed_kmh: f64,
    pub effective_speed_kmh: f64,
    pub ema_speed_kmh: Option<f64>,
    pub using_track_speed: bool,
    pub pace_now_min_per_km: Option<f64>,
    pub pace_avg_min_per_km: Option<f64>,
    pub pace_avg_display: String,

    pub eta_armed: bool,
    pub eta_total_ms: Option<i64>,
    pub eta_remaining_ms: Option<i64>,
    pub eta_frozen: bool,
    pub eta_display: String,

    pub off_route: bool,
    pub off_route_strikes: u32,
    pub outlier_jump: bool,
    pub gap_s: f64,
    pub confidence: u8,

    pub personal_best: Option<PersonalBest>,
    pub target: TargetStatus,
    pub consistency: Consistency,
    pub grade_pct: Option<f64>,
}
