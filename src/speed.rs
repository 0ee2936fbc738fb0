use std::collections::VecDeque;

use serde::Serialize;

use crate::config::{LocomotionMode, TrackerConfig};

/// One confirmed projection appended to a device's calculation history.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProjectedSample {
    pub ts_ms: i64,
    pub distance_km: f64,
}

/// Produces the *effective speed* used for all pace/ETA math.
///
/// Raw device-reported speed is unreliable at low magnitudes (GPS noise
/// dominates near zero) and can be absent, so the estimator falls back to a
/// track-derived speed computed from the projected history and only returns
/// to the raw source with hysteresis. A rolling median of effective speeds
/// classifies the locomotion mode, which in turn selects the tuned parameter
/// set for every downstream computation.
#[derive(Debug)]
pub struct SpeedEstimator {
    mode: LocomotionMode,
    using_track_speed: bool,
    ema_kmh: Option<f64>,
    effective_kmh: f64,
    samples: VecDeque<(i64, f64)>,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        SpeedEstimator {
            mode: LocomotionMode::Walk,
            using_track_speed: false,
            ema_kmh: None,
            effective_kmh: 0.0,
            samples: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> LocomotionMode {
        self.mode
    }

    pub fn using_track_speed(&self) -> bool {
        self.using_track_speed
    }

    pub fn ema_kmh(&self) -> Option<f64> {
        self.ema_kmh
    }

    pub fn effective_kmh(&self) -> f64 {
        self.effective_kmh
    }

    pub fn is_stationary(&self, cfg: &TrackerConfig) -> bool {
        self.effective_kmh < cfg.stationary_kmh
    }

    /// Ingest one tick. `history` is the confirmed projected history with the
    /// current sample already appended. Returns the effective speed.
    pub fn update(
        &mut self,
        cfg: &TrackerConfig,
        raw_kmh: f64,
        history: &VecDeque<ProjectedSample>,
        now_ms: i64,
    ) -> f64 {
        let window_s = cfg.params(self.mode).track_speed_window_s;
        let track = track_speed(cfg, history, window_s);

        // Source selection with hysteresis: once on track speed, raw must
        // clear the validity threshold by a margin before it is trusted
        // again, so the source does not toggle at the boundary.
        let raw_valid = raw_kmh >= cfg.raw_speed_min_valid_kmh;
        if self.using_track_speed {
            if raw_kmh >= cfg.raw_speed_min_valid_kmh + cfg.raw_speed_hysteresis_kmh {
                self.using_track_speed = false;
            }
        } else if !raw_valid && track.is_some() {
            self.using_track_speed = true;
        }

        let effective = if self.using_track_speed {
            track.unwrap_or(raw_kmh)
        } else if raw_valid {
            raw_kmh
        } else {
            track.unwrap_or(raw_kmh)
        };
        self.effective_kmh = effective;

        // Mode from the rolling median; the median resists the occasional
        // spike that would whipsaw a mean-based classifier.
        self.samples.push_back((now_ms, effective));
        let min_ts = now_ms - (cfg.mode_buffer_s * 1000.0) as i64;
        while self.samples.front().map_or(false, |(ts, _)| *ts < min_ts) {
            self.samples.pop_front();
        }
        if let Some(median) = median_speed(&self.samples) {
            self.mode = if median < cfg.walk_max_kmh {
                LocomotionMode::Walk
            } else if median < cfg.run_max_kmh {
                LocomotionMode::Run
            } else {
                LocomotionMode::Bike
            };
        }

        // EMA, with alpha doubled while stationary so the average snaps down
        // on a genuine stop instead of coasting.
        let mut alpha = cfg.params(self.mode).ema_alpha;
        if effective < cfg.stationary_kmh {
            alpha = (alpha * 2.0).min(cfg.stationary_alpha_cap);
        }
        self.ema_kmh = match self.ema_kmh {
            Some(ema) => Some(alpha * effective + (1.0 - alpha) * ema),
            None if effective > 0.0 => Some(effective),
            None => None,
        };

        effective
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Speed over the projected history: latest sample vs the newest sample at
/// least `window_s` older. Displacement below the configured minimum reads
/// as not moving (0), not as noise-amplified jitter; spikes are clamped.
fn track_speed(
    cfg: &TrackerConfig,
    history: &VecDeque<ProjectedSample>,
    window_s: f64,
) -> Option<f64> {
    let latest = history.back()?;
    let target_ts = latest.ts_ms - (window_s * 1000.0) as i64;
    let base = history.iter().rev().find(|s| s.ts_ms <= target_ts)?;
    let dt_h = (latest.ts_ms - base.ts_ms) as f64 / 3_600_000.0;
    if dt_h <= 0.0 {
        return None;
    }
    let dist_km = (latest.distance_km - base.distance_km).max(0.0);
    if dist_km * 1000.0 < cfg.min_track_displacement_m {
        return Some(0.0);
    }
    Some((dist_km / dt_h).min(cfg.max_track_speed_kmh))
}

fn median_speed(samples: &VecDeque<(i64, f64)>) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut speeds: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    speeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = speeds.len();
    Some(if n % 2 == 1 {
        speeds[n / 2]
    } else {
        (speeds[n / 2 - 1] + speeds[n / 2]) / 2.0
    })
}
