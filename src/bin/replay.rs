use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;

use race_tracker_rs::route::geo::{format_hms, haversine_km, initial_bearing_deg};
use race_tracker_rs::route::route_points_from_gpx;
use race_tracker_rs::{FixMessage, ManualClock, SystemClock, TrackerConfig, TrackingEngine};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replays a recorded NDJSON fix log through the tracking engine", long_about = None)]
struct Args {
    /// GPX route file
    #[arg(long)]
    route: PathBuf,

    /// Recorded fix log, NDJSON or NDJSON.gz
    #[arg(long)]
    log: PathBuf,

    /// Playback speed multiplier (0 = as fast as possible)
    #[arg(long, default_value = "0")]
    speed: f64,

    /// Checkpoint resample step in meters (adaptive when omitted)
    #[arg(long)]
    step_meters: Option<f64>,

    /// Clip start, RFC3339
    #[arg(long)]
    from: Option<String>,

    /// Clip end, RFC3339
    #[arg(long)]
    to: Option<String>,

    /// Progress report interval in virtual seconds (0 = final report only)
    #[arg(long, default_value = "60")]
    report_secs: u64,
}

/// One recorded fix. Field aliases cover the shapes different recorders
/// produce; anything unusable is skipped during load.
#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default, alias = "deviceId", alias = "device")]
    id: Option<String>,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default, alias = "altitude")]
    alt: Option<f64>,
    #[serde(default, alias = "speedKmh", alias = "reportedSpeedKmh")]
    speed_kmh: Option<f64>,
    #[serde(default, alias = "heading")]
    course: Option<f64>,
}

#[derive(Debug, Clone)]
struct PlaybackPoint {
    ts_ms: i64,
    id: String,
    lat: f64,
    lon: f64,
    alt: Option<f64>,
    speed_kmh: Option<f64>,
    course: Option<f64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let route_file = File::open(&args.route)
        .with_context(|| format!("cannot open route {}", args.route.display()))?;
    let points = route_points_from_gpx(BufReader::new(route_file))?;

    let from_ms = args.from.as_deref().map(parse_rfc3339_ms).transpose()?;
    let to_ms = args.to.as_deref().map(parse_rfc3339_ms).transpose()?;

    let mut buffers = load_log(&args.log, from_ms, to_ms)?;
    if buffers.is_empty() {
        bail!("log {} holds no usable fixes", args.log.display());
    }
    for buffer in buffers.values_mut() {
        buffer.sort_by_key(|p| p.ts_ms);
        infill_speed_and_course(buffer);
    }

    let mut timeline: Vec<PlaybackPoint> = buffers.into_values().flatten().collect();
    timeline.sort_by(|a, b| (a.ts_ms, a.id.as_str()).cmp(&(b.ts_ms, b.id.as_str())));
    let t0 = timeline.first().unwrap().ts_ms;
    let t_end = timeline.last().unwrap().ts_ms;
    println!(
        "replaying {} fixes over {} of virtual time",
        timeline.len(),
        format_hms(t_end - t0)
    );

    // The replay clock drives the engine; the producer advances it fix by
    // fix and the core never knows it is not live.
    let clock = Arc::new(ManualClock::new(t0));
    let mut engine = TrackingEngine::with_clock(TrackerConfig::default(), clock.clone());
    engine.load_route(&points, args.step_meters)?;

    let mut last_ts = t0;
    let mut next_report = t0 + args.report_secs as i64 * 1000;
    for point in &timeline {
        if args.speed > 0.0 {
            let dt_ms = (point.ts_ms - last_ts).max(0) as f64 / args.speed;
            if dt_ms >= 1.0 {
                std::thread::sleep(std::time::Duration::from_millis(dt_ms as u64));
            }
        }
        last_ts = point.ts_ms;
        clock.set(point.ts_ms);
        engine.ingest(FixMessage {
            device_id: point.id.clone(),
            lat: point.lat,
            lon: point.lon,
            reported_speed_kmh: point.speed_kmh.unwrap_or(0.0),
            altitude: point.alt,
            heading: point.course,
        });

        if args.report_secs > 0 && point.ts_ms >= next_report {
            report(&engine, point.ts_ms - t0);
            next_report += args.report_secs as i64 * 1000;
        }
    }

    report(&engine, last_ts - t0);
    println!("{}", serde_json::to_string_pretty(&engine.snapshots())?);
    if let Some(elapsed) = engine.race_clock().elapsed_ms(last_ts) {
        println!("race time {}", format_hms(elapsed));
    }

    // Detach the virtual clock; harmless if nothing else runs afterwards.
    engine.set_clock(Arc::new(SystemClock));
    Ok(())
}

fn load_log(
    path: &Path,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
) -> Result<HashMap<String, Vec<PlaybackPoint>>> {
    let file = File::open(path).with_context(|| format!("cannot open log {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut buffers: HashMap<String, Vec<PlaybackPoint>> = HashMap::new();
    let mut skipped = 0u64;
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: LogRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let (ts, lat, lon) = match (rec.ts, rec.lat, rec.lon) {
            (Some(ts), Some(lat), Some(lon))
                if ts.is_finite() && lat.is_finite() && lon.is_finite() =>
            {
                (ts as i64, lat, lon)
            }
            _ => {
                skipped += 1;
                continue;
            }
        };
        if from_ms.map_or(false, |f| ts < f) || to_ms.map_or(false, |t| ts > t) {
            continue;
        }
        let id = rec.id.unwrap_or_else(|| "device".to_string());
        buffers.entry(id.clone()).or_default().push(PlaybackPoint {
            ts_ms: ts,
            id,
            lat,
            lon,
            alt: rec.alt.filter(|v| v.is_finite()),
            speed_kmh: rec.speed_kmh.filter(|v| v.is_finite()),
            course: rec.course.filter(|v| v.is_finite()),
        });
    }
    if skipped > 0 {
        eprintln!("skipped {skipped} unusable log lines");
    }
    Ok(buffers)
}

/// Recorders do not always store speed and course; derive the missing ones
/// from consecutive positions so the engine sees the full contract.
fn infill_speed_and_course(buffer: &mut [PlaybackPoint]) {
    for i in 1..buffer.len() {
        let (prev, cur) = {
            let (a, b) = buffer.split_at_mut(i);
            (&a[i - 1], &mut b[0])
        };
        let dt_h = ((cur.ts_ms - prev.ts_ms) as f64 / 3_600_000.0).max(1e-9);
        if cur.speed_kmh.is_none() {
            let d_km = haversine_km(prev.lat, prev.lon, cur.lat, cur.lon);
            cur.speed_kmh = Some(d_km / dt_h);
        }
        if cur.course.is_none() {
            cur.course = Some(initial_bearing_deg(prev.lat, prev.lon, cur.lat, cur.lon));
        }
    }
    if buffer.len() >= 2 {
        let (second_speed, second_course) = (buffer[1].speed_kmh, buffer[1].course);
        let first = &mut buffer[0];
        if first.speed_kmh.is_none() {
            first.speed_kmh = second_speed;
        }
        if first.course.is_none() {
            first.course = second_course;
        }
    }
}

fn report(engine: &TrackingEngine, virtual_ms: i64) {
    for snap in engine.snapshots() {
        println!(
            "[{}] {}  {:6.2} km ({:5.1}%)  {}  eta {}  {}  conf {}",
            format_hms(virtual_ms),
            snap.id,
            snap.distance_covered_km,
            snap.progress_pct,
            snap.pace_avg_display,
            snap.eta_display,
            snap.mode,
            snap.confidence
        );
    }
}

fn parse_rfc3339_ms(input: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(input)
        .with_context(|| format!("bad RFC3339 timestamp: {input}"))?;
    Ok(dt.timestamp_millis())
}
