use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::fix::{FixMessage, RawFix};
use crate::race_clock::RaceClock;
use crate::route::geo::{haversine_km, kmh_to_pace_min_per_km};
use crate::route::{project_onto, RouteModel, RoutePoint};
use crate::speed::ProjectedSample;
use crate::tracking::consistency;
use crate::tracking::device::{
    DevicePhase, DeviceSnapshot, DeviceState, PersonalBest, RawSample, TargetStatus, COLORS,
};

/// Strike counter cap and the count at which the off-route flag raises.
const STRIKE_CAP: u32 = 5;
const STRIKE_THRESHOLD: u32 = 2;

/// Owns all tracking state: the route model, one record per device, and the
/// shared race clock. All mutation flows through `apply_fix`; collaborators
/// only ever see owned snapshots.
pub struct TrackingEngine {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    route: Option<Arc<RouteModel>>,
    devices: HashMap<String, DeviceState>,
    targets: HashMap<String, PersonalBest>,
    race_clock: Arc<RaceClock>,
    color_cursor: usize,
}

impl TrackingEngine {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        TrackingEngine {
            config,
            clock,
            route: None,
            devices: HashMap::new(),
            targets: HashMap::new(),
            race_clock: Arc::new(RaceClock::new()),
            color_cursor: 0,
        }
    }

    /// Swap the time source. Safe to call repeatedly; re-attaching the
    /// system clock after a replay is the expected detach path.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn route(&self) -> Option<&Arc<RouteModel>> {
        self.route.as_ref()
    }

    pub fn race_clock(&self) -> Arc<RaceClock> {
        self.race_clock.clone()
    }

    /// Build and install a new route model. Progress against a different
    /// route is meaningless, so all device state and the race clock reset;
    /// configured personal-best targets survive and re-apply on first fix.
    pub fn load_route(
        &mut self,
        points: &[RoutePoint],
        step_meters: Option<f64>,
    ) -> Result<Arc<RouteModel>, TrackerError> {
        let model = Arc::new(RouteModel::build(points, step_meters)?);
        info!(
            "route loaded: {:.2} km, {} checkpoints ({}m step)",
            model.total_km(),
            model.checkpoints().len(),
            model.step_m()
        );
        self.route = Some(model.clone());
        self.reset();
        Ok(model)
    }

    /// Drop all device state and stop the race clock. The route stays.
    pub fn reset(&mut self) {
        self.devices.clear();
        self.color_cursor = 0;
        self.race_clock.stop();
    }

    /// Operator start, overriding any auto-start.
    pub fn start_race_clock(&self) {
        self.race_clock.force_start_at(self.clock.now_ms());
    }

    pub fn stop_race_clock(&self) {
        self.race_clock.stop();
    }

    /// Configure the personal-best target for a device. The distance
    /// defaults to the loaded route's length.
    pub fn set_personal_best(
        &mut self,
        device_id: &str,
        target_time_ms: i64,
        target_distance_km: Option<f64>,
    ) -> Result<(), TrackerError> {
        if target_time_ms <= 0 {
            return Err(TrackerError::InvalidTarget(format!(
                "target time must be positive, got {target_time_ms} ms"
            )));
        }
        let distance = match target_distance_km {
            Some(d) if d > 0.0 && d.is_finite() => d,
            Some(d) => {
                return Err(TrackerError::InvalidTarget(format!(
                    "target distance must be positive, got {d} km"
                )))
            }
            None => match &self.route {
                Some(r) => r.total_km(),
                None => {
                    return Err(TrackerError::InvalidTarget(
                        "no route loaded and no target distance given".to_string(),
                    ))
                }
            },
        };
        let pb = PersonalBest::new(target_time_ms, distance);
        self.targets.insert(device_id.to_string(), pb);
        if let Some(dev) = self.devices.get_mut(device_id) {
            dev.target = Some(pb);
        }
        Ok(())
    }

    /// Boundary entry point shared by the live feed and the replay
    /// producer: stamps the receipt time from the engine clock, drops
    /// malformed records silently. Returns whether the fix was applied.
    pub fn ingest(&mut self, msg: FixMessage) -> bool {
        let now = self.clock.now_ms();
        match msg.into_fix(now) {
            Some(fix) => {
                self.apply_fix(fix);
                true
            }
            None => {
                debug!("dropped malformed fix at {now}");
                false
            }
        }
    }

    /// Apply one validated fix. A fix without a loaded route is a no-op,
    /// not an error; a same-device fix older than the last applied one is
    /// rejected (the core never reorders).
    pub fn apply_fix(&mut self, fix: RawFix) {
        let route = match &self.route {
            Some(r) => r.clone(),
            None => {
                debug!("fix for {} ignored: no route loaded", fix.device_id);
                return;
            }
        };

        if !self.devices.contains_key(&fix.device_id) {
            let color = COLORS[self.color_cursor % COLORS.len()];
            self.color_cursor += 1;
            let mut dev = DeviceState::new(fix.device_id.clone(), color, route.total_km());
            if let Some(pb) = self.targets.get(&fix.device_id) {
                dev.target = Some(*pb);
            }
            info!("tracking new device {} ({})", fix.device_id, color);
            self.devices.insert(fix.device_id.clone(), dev);
        }
        let dev = self.devices.get_mut(&fix.device_id).expect("just inserted");

        if let Some(prev) = dev.last_update_ms {
            if fix.received_at_ms < prev {
                warn!(
                    "out-of-order fix for {} ({} < {}), rejected",
                    fix.device_id, fix.received_at_ms, prev
                );
                return;
            }
        }

        update_device(&self.config, &route, &self.race_clock, dev, &fix);
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let elapsed = self.race_clock.elapsed_ms(self.clock.now_ms());
        self.devices.get(device_id).map(|d| d.snapshot(elapsed))
    }

    /// Snapshots of every tracked device, ordered by id.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let elapsed = self.race_clock.elapsed_ms(self.clock.now_ms());
        let mut out: Vec<DeviceSnapshot> =
            self.devices.values().map(|d| d.snapshot(elapsed)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// The per-fix update sequence. Free function so the engine borrow stays
/// simple and the transformation is testable as state + fix -> state.
fn update_device(
    cfg: &TrackerConfig,
    route: &RouteModel,
    race_clock: &RaceClock,
    dev: &mut DeviceState,
    fix: &RawFix,
) {
    let now = fix.received_at_ms;
    let total_km = route.total_km();
    let params = *cfg.params(dev.estimator.mode());

    let prev_ts = dev.last_update_ms.unwrap_or(now);
    dev.gap_s = ((now - prev_ts) as f64 / 1000.0).max(0.0);

    // Geometric outlier: implied straight-line speed vs the previous raw
    // fix above the mode ceiling. Flagged, kept for display, excluded from
    // the confirmed chain below.
    let outlier = match dev.raw_history.back() {
        Some(prev) => {
            let d_km = haversine_km(prev.lat, prev.lon, fix.lat, fix.lon);
            let dt_h = ((now - prev.ts_ms) as f64 / 3_600_000.0).max(1e-9);
            d_km / dt_h > params.max_jump_kmh
        }
        None => false,
    };
    dev.outlier_jump = outlier;

    dev.raw_history.push_back(RawSample {
        ts_ms: now,
        lat: fix.lat,
        lon: fix.lon,
        speed_kmh: fix.reported_speed_kmh,
        altitude: fix.altitude,
        heading: fix.heading,
    });

    // Hint from expected travel distance, not the last matched segment: a
    // fast device (bike, support car) would otherwise stick to a
    // near-motionless index.
    let gap_capped = dev.gap_s.min(cfg.expected_gap_cap_s);
    let expected_m = (dev.estimator.effective_kmh() * gap_capped / 3.6)
        .clamp(cfg.hint_min_advance_m, cfg.hint_max_advance_m);
    let hint = route.index_for_distance(dev.distance_covered_km + expected_m / 1000.0);
    let proj = project_onto(
        route,
        fix.lat,
        fix.lon,
        hint,
        params.backtrack_segments,
        cfg.forward_window_segments,
    );

    // Off-route is a debounced verdict, never a single noisy tick.
    let hard_off = proj.lateral_offset_m > params.off_route_tolerance_m * 2.0;
    if proj.lateral_offset_m > params.off_route_tolerance_m {
        dev.strikes = (dev.strikes + 1).min(STRIKE_CAP);
    } else {
        dev.strikes = dev.strikes.saturating_sub(1);
    }
    dev.off_route = dev.strikes >= STRIKE_THRESHOLD;

    // Once the race clock runs the running max is the authoritative
    // progress. Regression within the mode's backtrack tolerance is turn
    // jitter and holds at the max; anything further back is a lock onto an
    // earlier segment and the whole sample is excluded from the confirmed
    // chain, like an outlier.
    let mut accepted = !outlier && !hard_off;
    if accepted && race_clock.is_running() {
        let floor_km = dev.distance_covered_km - params.backtrack_tolerance_m / 1000.0;
        if proj.distance_km < floor_km {
            accepted = false;
        }
    }
    if accepted {
        let candidate = if race_clock.is_running() {
            proj.distance_km.max(dev.distance_covered_km)
        } else {
            proj.distance_km
        };
        dev.distance_covered_km = candidate.min(total_km);
        dev.distance_remaining_km = (total_km - dev.distance_covered_km).max(0.0);
        dev.progress_pct = if total_km > 0.0 {
            dev.distance_covered_km / total_km * 100.0
        } else {
            0.0
        };
        dev.last_projection = Some(proj);
        dev.proj_history.push_back(ProjectedSample {
            ts_ms: now,
            distance_km: dev.distance_covered_km,
        });

        dev.prev_cp_index = dev.cp_index;
        dev.cp_index = route.index_for_distance(dev.distance_covered_km);
        if !race_clock.is_running()
            && dev.prev_cp_index < cfg.auto_start_checkpoint
            && dev.cp_index >= cfg.auto_start_checkpoint
            && race_clock.start_at(now)
        {
            info!("race clock auto-started by {}", dev.id);
        }
    }
    dev.prune_histories(now, cfg.history_max_s, cfg.proj_history_min_samples);

    let effective = dev
        .estimator
        .update(cfg, fix.reported_speed_kmh, &dev.proj_history, now);

    // Elevation-derived grade; lateral uncertainty makes it meaningless
    // while off-route.
    dev.grade_pct = if dev.off_route {
        None
    } else {
        grade_from_history(cfg, params.slope_window_s, dev, now)
    };

    let elapsed = race_clock.elapsed_ms(now);

    if dev.phase == DevicePhase::Active && dev.distance_covered_km >= total_km - 1e-9 {
        dev.phase = DevicePhase::Finished;
        dev.eta.frozen = false;
        dev.eta.stationary_since_ms = None;
        // The crossing time replaces the estimate.
        if elapsed.is_some() {
            dev.eta.shown_total_ms = elapsed;
        }
        info!("device {} finished at {:?} ms", dev.id, elapsed);
    }

    dev.eta.armed = total_km > 0.0 && dev.distance_covered_km >= cfg.eta_arm_fraction * total_km;

    if dev.phase == DevicePhase::Active {
        let mut eta_raw: Option<i64> = None;
        if let Some(elapsed) = elapsed {
            if dev.eta.armed {
                let stable = stable_speed_kmh(cfg, dev, total_km);
                if stable > 0.0 {
                    let ms_left = dev.distance_remaining_km / stable * 3_600_000.0;
                    eta_raw = Some(elapsed + ms_left.round() as i64);
                }
            }
        }

        // A device parked longer than the grace period keeps its last shown
        // ETA instead of extrapolating from a near-zero speed.
        if dev.estimator.is_stationary(cfg) {
            let since = *dev.eta.stationary_since_ms.get_or_insert(now);
            if (now - since) as f64 / 1000.0 > cfg.stop_grace_s && dev.eta.shown_total_ms.is_some()
            {
                eta_raw = dev.eta.shown_total_ms;
                dev.eta.frozen = true;
            }
        } else {
            dev.eta.stationary_since_ms = None;
            dev.eta.frozen = false;
        }

        if let Some(raw) = eta_raw {
            let clamp_s = if dev.distance_remaining_km <= cfg.final_stretch_km(total_km) {
                cfg.eta_clamp_final_s
            } else {
                cfg.eta_clamp_s
            };
            dev.eta.shown_total_ms = Some(match dev.eta.shown_total_ms {
                Some(prev) => {
                    let max_delta = (clamp_s * 1000.0) as i64;
                    prev + (raw - prev).clamp(-max_delta, max_delta)
                }
                None => raw,
            });
        }
    }

    // Delta against the personal best, once the estimate is meaningful.
    dev.target_status = match (dev.target, elapsed, dev.eta.armed, dev.eta.shown_total_ms) {
        (Some(pb), Some(_), true, Some(eta)) => {
            let adjusted_ms = (pb.target_pace_min_per_km * 60.0 * total_km * 1000.0).round() as i64;
            let delta = eta - adjusted_ms;
            let gap = dev
                .estimator
                .ema_kmh()
                .and_then(kmh_to_pace_min_per_km)
                .map(|pace| ((pace - pb.target_pace_min_per_km) * 60.0).round() as i64);
            TargetStatus {
                delta_to_target_ms: Some(delta),
                on_target: delta <= 0,
                gap_pace_sec_per_km: gap,
            }
        }
        _ => TargetStatus::default(),
    };

    let hist = dev.proj_history.make_contiguous();
    dev.consistency = consistency::compute(
        hist,
        cfg.consistency_window_km(total_km),
        cfg.consistency_bucket_km,
        cfg.consistency_bands_s,
    );

    let mut conf = 100i32;
    if dev.off_route {
        conf -= 20;
    }
    if hard_off {
        conf -= 15;
    }
    if outlier {
        conf -= 25;
    }
    if dev.gap_s > cfg.gap_short_s {
        conf -= 15;
    }
    if effective <= 0.0 {
        conf -= 10;
    }
    if dev.last_projection.is_none() {
        conf -= 10;
    }
    dev.confidence = conf.clamp(0, 100) as u8;

    dev.last_update_ms = Some(now);
}

/// Blend of the EMA and a distance-windowed recent average; either alone is
/// too jumpy (EMA) or too laggy (window) for the ETA divisor.
fn stable_speed_kmh(cfg: &TrackerConfig, dev: &DeviceState, total_km: f64) -> f64 {
    let windowed = windowed_avg_kmh(dev, cfg.speed_window_km(total_km));
    match (dev.estimator.ema_kmh(), windowed) {
        (Some(e), Some(w)) if e > 0.0 && w > 0.0 => 0.5 * e + 0.5 * w,
        (Some(e), _) if e > 0.0 => e,
        (_, Some(w)) => w,
        _ => 0.0,
    }
}

fn windowed_avg_kmh(dev: &DeviceState, window_km: f64) -> Option<f64> {
    let latest = *dev.proj_history.back()?;
    let mut first: Option<ProjectedSample> = None;
    for s in dev.proj_history.iter().rev().skip(1) {
        first = Some(*s);
        if latest.distance_km - s.distance_km >= window_km {
            break;
        }
    }
    let first = first?;
    let dt_h = (latest.ts_ms - first.ts_ms) as f64 / 3_600_000.0;
    if dt_h <= 0.0 {
        return None;
    }
    Some((latest.distance_km - first.distance_km).max(0.0) / dt_h)
}

fn grade_from_history(
    cfg: &TrackerConfig,
    slope_window_s: f64,
    dev: &DeviceState,
    now: i64,
) -> Option<f64> {
    let alt_now = dev.raw_history.back()?.altitude?;
    let target_ts = now - (slope_window_s * 1000.0) as i64;
    let past = dev
        .raw_history
        .iter()
        .rev()
        .find(|s| s.ts_ms <= target_ts && s.altitude.is_some())?;
    let d_then = dev
        .proj_history
        .iter()
        .rev()
        .find(|s| s.ts_ms <= past.ts_ms)
        .map(|s| s.distance_km)?;
    let run_m = (dev.distance_covered_km - d_then) * 1000.0;
    if run_m < cfg.min_grade_run_m {
        return None;
    }
    Some((alt_now - past.altitude.unwrap()) / run_m * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LocomotionMode;
    use crate::tracking::consistency::ConsistencyLabel;
    use approx::assert_relative_eq;

    /// Degrees of latitude per kilometer heading due north, rounded a hair
    /// low so synthetic routes never overshoot their nominal length.
    const DEG_PER_KM: f64 = 1.0 / 111.1951;
    const LON: f64 = -0.4;

    fn lat_at_km(km: f64) -> f64 {
        39.0 + km * DEG_PER_KM
    }

    fn straight_engine(total_km: f64, step_m: f64) -> (TrackingEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut engine = TrackingEngine::with_clock(TrackerConfig::default(), clock.clone());
        let pts = vec![
            RoutePoint::new(lat_at_km(0.0), LON),
            RoutePoint::new(lat_at_km(total_km), LON),
        ];
        engine.load_route(&pts, Some(step_m)).unwrap();
        (engine, clock)
    }

    fn send(
        engine: &mut TrackingEngine,
        clock: &ManualClock,
        id: &str,
        km: f64,
        speed_kmh: f64,
        t_ms: i64,
    ) {
        send_at(engine, clock, id, lat_at_km(km), LON, speed_kmh, t_ms);
    }

    fn send_at(
        engine: &mut TrackingEngine,
        clock: &ManualClock,
        id: &str,
        lat: f64,
        lon: f64,
        speed_kmh: f64,
        t_ms: i64,
    ) {
        clock.set(t_ms);
        let applied = engine.ingest(FixMessage {
            device_id: id.to_string(),
            lat,
            lon,
            reported_speed_kmh: speed_kmh,
            altitude: None,
            heading: None,
        });
        assert!(applied);
    }

    /// Walk a device up the route at constant speed with 1 Hz fixes.
    fn walk_steady(
        engine: &mut TrackingEngine,
        clock: &ManualClock,
        id: &str,
        kmh: f64,
        from_s: i64,
        to_s: i64,
    ) {
        for s in from_s..=to_s {
            send(engine, clock, id, kmh * s as f64 / 3600.0, kmh, s * 1000);
        }
    }

    #[test]
    fn test_fix_without_route_is_noop() {
        let clock = Arc::new(ManualClock::new(0));
        let mut engine = TrackingEngine::with_clock(TrackerConfig::default(), clock.clone());
        let applied = engine.ingest(FixMessage {
            device_id: "A01".into(),
            lat: 39.0,
            lon: LON,
            reported_speed_kmh: 10.0,
            altitude: None,
            heading: None,
        });
        assert!(applied);
        assert_eq!(engine.device_count(), 0);
    }

    #[test]
    fn test_malformed_fix_dropped_at_boundary() {
        let (mut engine, _clock) = straight_engine(2.0, 100.0);
        let applied = engine.ingest(FixMessage {
            device_id: "A01".into(),
            lat: f64::NAN,
            lon: LON,
            reported_speed_kmh: 10.0,
            altitude: None,
            heading: None,
        });
        assert!(!applied);
        assert_eq!(engine.device_count(), 0);
    }

    #[test]
    fn test_three_checkpoint_scenario() {
        // Route of 2 km resampled at 1 km: checkpoints at 0, 1 and 2 km.
        // Fixes at those marks at t = 0 s / 360 s / 720 s (10 km/h).
        let (mut engine, clock) = straight_engine(2.0, 1000.0);
        assert_eq!(engine.route().unwrap().checkpoints().len(), 3);
        let marks: Vec<(f64, f64)> = engine
            .route()
            .unwrap()
            .checkpoints()
            .iter()
            .map(|cp| (cp.lat, cp.lon))
            .collect();

        send_at(&mut engine, &clock, "A01", marks[0].0, marks[0].1, 10.0, 0);
        let snap = engine.snapshot("A01").unwrap();
        assert!(!snap.eta_armed);
        assert!(!engine.race_clock().is_running());

        send_at(&mut engine, &clock, "A01", marks[1].0, marks[1].1, 10.0, 360_000);
        let snap = engine.snapshot("A01").unwrap();
        assert_relative_eq!(snap.distance_covered_km, 1.0, epsilon = 1e-4);
        // Crossing the early checkpoint armed the race clock.
        assert_eq!(engine.race_clock().started_at_ms(), Some(360_000));
        // 8% of 2 km = 0.16 km: well covered, ETA armed.
        assert!(snap.eta_armed);

        send_at(&mut engine, &clock, "A01", marks[2].0, marks[2].1, 10.0, 720_000);
        let snap = engine.snapshot("A01").unwrap();
        assert_relative_eq!(snap.distance_covered_km, 2.0, epsilon = 1e-4);
        assert_eq!(snap.phase, DevicePhase::Finished);
        assert_relative_eq!(snap.pace_avg_min_per_km.unwrap(), 6.0, epsilon = 0.01);
        assert_eq!(snap.consistency.label, Some(ConsistencyLabel::MuyConstante));
        // Finish time: started at the 1 km crossing, finished 360 s later.
        assert_eq!(snap.eta_total_ms, Some(360_000));
    }

    #[test]
    fn test_geometric_outlier_flagged_but_raw_history_kept() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        walk_steady(&mut engine, &clock, "A01", 10.0, 0, 60);
        let covered_before = engine.snapshot("A01").unwrap().distance_covered_km;

        // 0.5 km jump in 2 s: 900 km/h, way past the 60 km/h foot ceiling.
        let jump_km = 10.0 * 60.0 / 3600.0 + 0.5;
        send(&mut engine, &clock, "A01", jump_km, 500.0, 62_000);

        let snap = engine.snapshot("A01").unwrap();
        assert!(snap.outlier_jump);
        // Raw history records the spike position for display.
        assert_relative_eq!(snap.lat.unwrap(), lat_at_km(jump_km), epsilon = 1e-9);
        // Progress ignores it.
        assert_relative_eq!(snap.distance_covered_km, covered_before, epsilon = 1e-6);
        assert!(snap.confidence < 100);
    }

    #[test]
    fn test_off_route_needs_two_strikes() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        walk_steady(&mut engine, &clock, "A01", 10.0, 0, 30);

        // ~50 m east of the line: beyond the 35 m tolerance, below the
        // 70 m hard-reject threshold.
        let off_lon = LON + 0.00058;
        let km = |s: i64| 10.0 * s as f64 / 3600.0;

        send_at(&mut engine, &clock, "A01", lat_at_km(km(31)), off_lon, 10.0, 31_000);
        assert!(!engine.snapshot("A01").unwrap().off_route, "one strike must not flip");

        // Back in tolerance: the strike decays.
        send(&mut engine, &clock, "A01", km(32), 10.0, 32_000);
        assert!(!engine.snapshot("A01").unwrap().off_route);

        // Two consecutive strikes raise the flag.
        send_at(&mut engine, &clock, "A01", lat_at_km(km(33)), off_lon, 10.0, 33_000);
        send_at(&mut engine, &clock, "A01", lat_at_km(km(34)), off_lon, 10.0, 34_000);
        let snap = engine.snapshot("A01").unwrap();
        assert!(snap.off_route);
        assert!(snap.confidence < 100);
    }

    #[test]
    fn test_progress_is_monotonic_once_clock_runs() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        walk_steady(&mut engine, &clock, "A01", 12.0, 0, 120);
        assert!(engine.race_clock().is_running());
        let covered = engine.snapshot("A01").unwrap().distance_covered_km;

        // Jitter 60 m backwards: far past the run-mode tolerance, progress
        // must hold the running max.
        send(&mut engine, &clock, "A01", covered - 0.06, 12.0, 121_000);
        let snap = engine.snapshot("A01").unwrap();
        assert!(snap.distance_covered_km >= covered);

        // Small backward jitter also never shows as regression.
        send(&mut engine, &clock, "A01", covered - 0.005, 12.0, 122_000);
        let snap2 = engine.snapshot("A01").unwrap();
        assert!(snap2.distance_covered_km >= snap.distance_covered_km);
    }

    #[test]
    fn test_eta_change_is_clamped_per_tick() {
        let (mut engine, clock) = straight_engine(2.0, 100.0);
        walk_steady(&mut engine, &clock, "A01", 12.0, 0, 90);
        let before = engine.snapshot("A01").unwrap();
        assert!(before.eta_armed);
        let shown_before = before.eta_total_ms.unwrap();

        // Speed spike: reported speed jumps to 60 km/h and the position
        // leaps 16 m in a second (just under the jump ceiling).
        let covered = before.distance_covered_km;
        send(&mut engine, &clock, "A01", covered + 0.016, 60.0, 91_000);
        let shown_after = engine.snapshot("A01").unwrap().eta_total_ms.unwrap();
        let cfg = TrackerConfig::default();
        assert!(
            (shown_after - shown_before).abs() <= (cfg.eta_clamp_s * 1000.0) as i64,
            "eta moved {} ms",
            shown_after - shown_before
        );
    }

    #[test]
    fn test_eta_freezes_after_prolonged_stop() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        // Well past the 8% arming threshold (0.4 km) before stopping.
        walk_steady(&mut engine, &clock, "A01", 12.0, 0, 130);
        let before = engine.snapshot("A01").unwrap();
        assert!(before.eta_armed);
        let stop_km = before.distance_covered_km;

        // Parked: same position, zero reported speed, for 40 s.
        for s in 131..=170i64 {
            send(&mut engine, &clock, "A01", stop_km, 0.0, s * 1000);
        }
        let frozen_snap = engine.snapshot("A01").unwrap();
        assert!(frozen_snap.eta_frozen);
        let held = frozen_snap.eta_total_ms;

        for s in 171..=180i64 {
            send(&mut engine, &clock, "A01", stop_km, 0.0, s * 1000);
        }
        assert_eq!(engine.snapshot("A01").unwrap().eta_total_ms, held);
    }

    #[test]
    fn test_personal_best_delta_and_on_target() {
        let (mut engine, clock) = straight_engine(2.0, 100.0);
        // Target: 2 km in 16 minutes (pace 8 min/km). At 12 km/h (5 min/km)
        // the device is comfortably ahead.
        engine.set_personal_best("A01", 16 * 60 * 1000, None).unwrap();
        walk_steady(&mut engine, &clock, "A01", 12.0, 0, 90);

        let snap = engine.snapshot("A01").unwrap();
        let delta = snap.target.delta_to_target_ms.unwrap();
        assert!(delta < 0, "ahead of target, got {delta}");
        assert!(snap.target.on_target);
        assert!(snap.target.gap_pace_sec_per_km.unwrap() < 0);

        // An impossible target flips the verdict.
        engine.set_personal_best("A01", 60_000, Some(2.0)).unwrap();
        send(&mut engine, &clock, "A01", 12.0 * 91.0 / 3600.0, 12.0, 91_000);
        let snap = engine.snapshot("A01").unwrap();
        assert!(!snap.target.on_target);
    }

    #[test]
    fn test_invalid_personal_best_rejected() {
        let (mut engine, _clock) = straight_engine(2.0, 100.0);
        assert!(matches!(
            engine.set_personal_best("A01", 0, None),
            Err(TrackerError::InvalidTarget(_))
        ));
        assert!(matches!(
            engine.set_personal_best("A01", 60_000, Some(-1.0)),
            Err(TrackerError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_out_of_order_fix_rejected() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        send(&mut engine, &clock, "A01", 0.1, 10.0, 60_000);
        let covered = engine.snapshot("A01").unwrap().distance_covered_km;

        // Earlier timestamp for the same device: rejected outright.
        send(&mut engine, &clock, "A01", 0.5, 10.0, 30_000);
        let snap = engine.snapshot("A01").unwrap();
        assert_relative_eq!(snap.distance_covered_km, covered, epsilon = 1e-9);
        assert_eq!(snap.last_seen_ms, Some(60_000));
    }

    #[test]
    fn test_route_reload_resets_devices_and_clock() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        walk_steady(&mut engine, &clock, "A01", 12.0, 0, 60);
        assert_eq!(engine.device_count(), 1);
        assert!(engine.race_clock().is_running());

        let pts = vec![
            RoutePoint::new(lat_at_km(0.0), LON),
            RoutePoint::new(lat_at_km(3.0), LON),
        ];
        engine.load_route(&pts, Some(100.0)).unwrap();
        assert_eq!(engine.device_count(), 0);
        assert!(!engine.race_clock().is_running());
    }

    #[test]
    fn test_mode_and_track_speed_follow_the_device() {
        let (mut engine, clock) = straight_engine(10.0, 100.0);
        // Cycling pace with unreliable raw speed: the estimator must lean
        // on the track-derived source and classify bike.
        for s in 0..=60i64 {
            send(&mut engine, &clock, "A01", 25.0 * s as f64 / 3600.0, 0.3, s * 1000);
        }
        let snap = engine.snapshot("A01").unwrap();
        assert_eq!(snap.mode, LocomotionMode::Bike);
        assert!(snap.using_track_speed);
        assert!((20.0..=30.0).contains(&snap.effective_speed_kmh));
    }

    #[test]
    fn test_grade_follows_elevation() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        // 10 km/h with a steady 5% climb, altitude on every fix.
        for s in 0..=60i64 {
            let km = 10.0 * s as f64 / 3600.0;
            clock.set(s * 1000);
            engine.ingest(FixMessage {
                device_id: "A01".into(),
                lat: lat_at_km(km),
                lon: LON,
                reported_speed_kmh: 10.0,
                altitude: Some(100.0 + km * 1000.0 * 0.05),
                heading: None,
            });
        }
        let snap = engine.snapshot("A01").unwrap();
        let grade = snap.grade_pct.unwrap();
        assert!((4.0..=6.0).contains(&grade), "grade {grade}");
    }

    #[test]
    fn test_devices_get_distinct_palette_colors() {
        let (mut engine, clock) = straight_engine(5.0, 100.0);
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            send(&mut engine, &clock, id, 0.0, 5.0, i as i64);
        }
        let snaps = engine.snapshots();
        assert_eq!(snaps.len(), 3);
        assert_ne!(snaps[0].color, snaps[1].color);
        assert_ne!(snaps[1].color, snaps[2].color);
    }
}
