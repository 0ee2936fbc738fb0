use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{debug, warn};
use tokio::sync::mpsc::Sender;

use race_tracker_rs::ingest::{self, DEFAULT_QUEUE_DEPTH};
use race_tracker_rs::route::geo::parse_hms_ms;
use race_tracker_rs::route::route_points_from_gpx;
use race_tracker_rs::{FixMessage, TrackerConfig, TrackingEngine};

#[derive(Parser, Debug)]
#[command(name = "race_tracker")]
#[command(about = "Race telemetry tracker - projects live GPS fixes onto a route", long_about = None)]
struct Args {
    /// GPX route file
    #[arg(long)]
    route: PathBuf,

    /// NDJSON fix stream ("-" for stdin)
    #[arg(long, default_value = "-")]
    fixes: String,

    /// Checkpoint resample step in meters (adaptive when omitted)
    #[arg(long)]
    step_meters: Option<f64>,

    /// Snapshot dump interval in seconds
    #[arg(long, default_value = "5")]
    snapshot_secs: u64,

    /// Output directory
    #[arg(long, default_value = "race_sessions")]
    output_dir: String,

    /// Personal-best target per device, as id=H:MM:SS (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Start the race clock immediately instead of waiting for the first
    /// early-checkpoint crossing
    #[arg(long)]
    start_clock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let route_file = File::open(&args.route)
        .with_context(|| format!("cannot open route {}", args.route.display()))?;
    let points = route_points_from_gpx(BufReader::new(route_file))?;

    let mut engine = TrackingEngine::new(TrackerConfig::default());
    let model = engine.load_route(&points, args.step_meters)?;
    println!(
        "[{}] route loaded: {:.2} km, {} checkpoints ({:.0} m step)",
        ts_now(),
        model.total_km(),
        model.checkpoints().len(),
        model.step_m()
    );

    for entry in &args.targets {
        let (id, time_ms) = parse_target(entry)
            .with_context(|| format!("bad --target {entry}, expected id=H:MM:SS"))?;
        engine.set_personal_best(id, time_ms, None)?;
        println!("[{}] target for {}: {} ms", ts_now(), id, time_ms);
    }
    if args.start_clock {
        engine.start_race_clock();
    }

    std::fs::create_dir_all(&args.output_dir)?;
    let engine = Arc::new(Mutex::new(engine));

    let (tx, rx) = ingest::channel(DEFAULT_QUEUE_DEPTH);
    let fixes_src = args.fixes.clone();
    let _reader = tokio::task::spawn_blocking(move || read_fix_lines(&fixes_src, tx));
    let mut ingest_loop = tokio::spawn(ingest::run(engine.clone(), rx));

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(args.snapshot_secs.max(1)));
    interval.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = dump_snapshots(&engine, &args.output_dir) {
                    warn!("snapshot dump failed: {e}");
                }
            }
            _ = &mut ingest_loop => break,
        }
    }

    dump_snapshots(&engine, &args.output_dir)?;
    let engine = engine.lock().unwrap();
    println!("\n=== Final Standings ===");
    for snap in engine.snapshots() {
        println!(
            "{}  {:6.2} km ({:5.1}%)  pace {}  eta {}  conf {}",
            snap.id,
            snap.distance_covered_km,
            snap.progress_pct,
            snap.pace_avg_display,
            snap.eta_display,
            snap.confidence
        );
    }
    Ok(())
}

/// Feed NDJSON fix lines into the ingestion queue. Lines that are not valid
/// JSON are boundary noise: counted and dropped, never an error.
fn read_fix_lines(source: &str, tx: Sender<FixMessage>) {
    let reader: Box<dyn BufRead> = if source == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        match File::open(source) {
            Ok(f) => Box::new(BufReader::new(f)),
            Err(e) => {
                warn!("cannot open fix source {source}: {e}");
                return;
            }
        }
    };

    let mut malformed = 0u64;
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FixMessage>(&line) {
            Ok(msg) => {
                if tx.blocking_send(msg).is_err() {
                    break;
                }
            }
            Err(e) => {
                malformed += 1;
                debug!("malformed fix line ({e}), {malformed} so far");
            }
        }
    }
}

fn dump_snapshots(engine: &Arc<Mutex<TrackingEngine>>, output_dir: &str) -> Result<()> {
    let engine = engine.lock().unwrap();
    let snaps = engine.snapshots();
    if snaps.is_empty() {
        return Ok(());
    }
    let path = format!("{output_dir}/live_snapshot.json");
    std::fs::write(&path, serde_json::to_string_pretty(&snaps)?)?;
    for snap in &snaps {
        println!(
            "[{}] {}  {:6.2} km ({:5.1}%)  {}  eta {}  {}  conf {}",
            ts_now(),
            snap.id,
            snap.distance_covered_km,
            snap.progress_pct,
            snap.pace_avg_display,
            snap.eta_display,
            snap.mode,
            snap.confidence
        );
    }
    Ok(())
}

fn parse_target(entry: &str) -> Option<(&str, i64)> {
    let (id, hms) = entry.split_once('=')?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some((id, parse_hms_ms(hms)?))
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
