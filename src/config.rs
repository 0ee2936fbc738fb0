use serde::{Deserialize, Serialize};

/// Locomotion mode derived from the rolling effective-speed median.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocomotionMode {
    Walk,
    Run,
    Bike,
}

impl LocomotionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocomotionMode::Walk => "walk",
            LocomotionMode::Run => "run",
            LocomotionMode::Bike => "bike",
        }
    }
}

impl std::fmt::Display for LocomotionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-mode tuning. A bike moves several segments per fix and corners wide;
/// a walker barely moves between fixes but tracks the line closely.
#[derive(Debug, Clone, Copy)]
pub struct ModeParams {
    /// Time separation between the two projected samples used for track speed.
    pub track_speed_window_s: f64,
    /// EMA smoothing factor for the effective speed.
    pub ema_alpha: f64,
    /// Lateral offset beyond which a tick counts as an off-route strike.
    pub off_route_tolerance_m: f64,
    /// Extra segments behind the hint included in the projection window.
    pub backtrack_segments: usize,
    /// Regression beyond this is ignored once the race clock runs.
    pub backtrack_tolerance_m: f64,
    /// Straight-line speed between consecutive raw fixes above this flags an
    /// outlier jump.
    pub max_jump_kmh: f64,
    /// Lookback for the elevation-derived grade estimate.
    pub slope_window_s: f64,
}

/// All engine tunables in one place. Defaults follow the field-tested values
/// of the tracking pipeline; everything is overridable for tests.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    // Histories
    /// Raw and projected history retention window, seconds.
    pub history_max_s: f64,
    /// Projected samples kept regardless of age. Consistency, track speed
    /// and the windowed average all read this history; a fix gap longer
    /// than the retention window must not drain them.
    pub proj_history_min_samples: usize,

    // Mode classification
    /// Rolling effective-speed buffer used for the mode median, seconds.
    pub mode_buffer_s: f64,
    /// Median below this classifies as walking, km/h.
    pub walk_max_kmh: f64,
    /// Median below this classifies as running, km/h (at/above is cycling).
    pub run_max_kmh: f64,

    // Track-derived speed
    /// Minimum displacement between the two window samples, meters.
    pub min_track_displacement_m: f64,
    /// Ceiling applied to the track-derived speed, km/h.
    pub max_track_speed_kmh: f64,

    // Speed source selection
    /// Raw GPS speed below this is considered noise-dominated, km/h.
    pub raw_speed_min_valid_kmh: f64,
    /// Margin raw speed must clear before switching back from track speed.
    pub raw_speed_hysteresis_kmh: f64,

    // Stationary handling
    /// Effective speed below this counts as stationary, km/h.
    pub stationary_kmh: f64,
    /// Cap for the doubled EMA alpha while stationary.
    pub stationary_alpha_cap: f64,
    /// Stationary time before the ETA freezes, seconds.
    pub stop_grace_s: f64,

    // ETA
    /// Fraction of the route a device must cover before ETA arms.
    pub eta_arm_fraction: f64,
    /// Maximum shown-ETA change per tick, seconds.
    pub eta_clamp_s: f64,
    /// Tighter clamp inside the final stretch, seconds.
    pub eta_clamp_final_s: f64,
    /// Final stretch upper bound, km (effective value adapts to route length).
    pub final_stretch_max_km: f64,
    /// Distance-windowed average speed window upper bound, km (adaptive).
    pub speed_window_max_km: f64,

    // Pace consistency
    pub consistency_window_min_km: f64,
    pub consistency_window_max_km: f64,
    pub consistency_bucket_km: f64,
    /// Label breakpoints in seconds/km: steady / variable boundaries.
    pub consistency_bands_s: [f64; 3],

    // Projection hint
    /// Fix-arrival gap cap used for the expected-travel hint, seconds.
    pub expected_gap_cap_s: f64,
    /// Expected-travel clamp, meters.
    pub hint_min_advance_m: f64,
    pub hint_max_advance_m: f64,
    /// Segments ahead of the hint included in the projection window.
    pub forward_window_segments: usize,

    // Quality
    /// Arrival gap above this degrades confidence, seconds.
    pub gap_short_s: f64,
    /// Minimum horizontal run for a grade estimate, meters.
    pub min_grade_run_m: f64,

    // Race clock
    /// Reaching this checkpoint index auto-starts the race clock.
    pub auto_start_checkpoint: usize,

    // Per-mode tables
    pub walk: ModeParams,
    pub run: ModeParams,
    pub bike: ModeParams,
}

impl TrackerConfig {
    pub fn params(&self, mode: LocomotionMode) -> &ModeParams {
        match mode {
            LocomotionMode::Walk => &self.walk,
            LocomotionMode::Run => &self.run,
            LocomotionMode::Bike => &self.bike,
        }
    }

    /// ETA clamp tightens inside this many km from the finish.
    pub fn final_stretch_km(&self, total_km: f64) -> f64 {
        (total_km * 0.08).clamp(0.1, self.final_stretch_max_km)
    }

    /// Distance window for the recent-average speed, adapted to route length.
    pub fn speed_window_km(&self, total_km: f64) -> f64 {
        (total_km * 0.30).clamp(0.2, self.speed_window_max_km)
    }

    /// Distance window for pace-consistency bucketing.
    pub fn consistency_window_km(&self, total_km: f64) -> f64 {
        (total_km * 0.30).clamp(
            self.consistency_window_min_km,
            self.consistency_window_max_km,
        )
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_max_s: 240.0,
            proj_history_min_samples: 48,

            mode_buffer_s: 25.0,
            walk_max_kmh: 7.0,
            run_max_kmh: 18.0,

            min_track_displacement_m: 28.0,
            max_track_speed_kmh: 90.0,

            raw_speed_min_valid_kmh: 2.5,
            raw_speed_hysteresis_kmh: 0.7,

            stationary_kmh: 0.5,
            stationary_alpha_cap: 0.5,
            stop_grace_s: 8.0,

            eta_arm_fraction: 0.08,
            eta_clamp_s: 5.0,
            eta_clamp_final_s: 3.0,
            final_stretch_max_km: 0.3,
            speed_window_max_km: 0.6,

            consistency_window_min_km: 1.0,
            consistency_window_max_km: 2.0,
            consistency_bucket_km: 0.2,
            consistency_bands_s: [6.0, 12.0, 20.0],

            expected_gap_cap_s: 10.0,
            hint_min_advance_m: 5.0,
            hint_max_advance_m: 120.0,
            forward_window_segments: 5,

            gap_short_s: 4.0,
            min_grade_run_m: 10.0,

            auto_start_checkpoint: 1,

            walk: ModeParams {
                track_speed_window_s: 25.0,
                ema_alpha: 0.25,
                off_route_tolerance_m: 35.0,
                backtrack_segments: 3,
                backtrack_tolerance_m: 10.0,
                max_jump_kmh: 60.0,
                slope_window_s: 30.0,
            },
            run: ModeParams {
                track_speed_window_s: 18.0,
                ema_alpha: 0.20,
                off_route_tolerance_m: 35.0,
                backtrack_segments: 3,
                backtrack_tolerance_m: 15.0,
                max_jump_kmh: 60.0,
                slope_window_s: 20.0,
            },
            bike: ModeParams {
                track_speed_window_s: 12.0,
                ema_alpha: 0.15,
                off_route_tolerance_m: 50.0,
                backtrack_segments: 4,
                backtrack_tolerance_m: 25.0,
                max_jump_kmh: 120.0,
                slope_window_s: 12.0,
            },
        }
    }
}
