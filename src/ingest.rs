use std::sync::{Arc, Mutex};

use log::info;
use tokio::sync::mpsc;

use crate::fix::FixMessage;
use crate::tracking::TrackingEngine;

/// Default depth of the ingestion queue. Matches the burstiness of a
/// multiplexed tracker feed; producers drop on overflow rather than block.
pub const DEFAULT_QUEUE_DEPTH: usize = 500;

/// Channel feeding the single ingestion loop. Live transport handlers and
/// the replay producer both push the same `FixMessage` records here.
pub fn channel(depth: usize) -> (mpsc::Sender<FixMessage>, mpsc::Receiver<FixMessage>) {
    mpsc::channel(depth)
}

/// Single-consumer ingestion loop: applies fixes strictly in arrival order.
/// All projection/speed/ETA math is synchronous and bounded, so the only
/// suspension point is the channel read. Runs until every sender is dropped.
pub async fn run(engine: Arc<Mutex<TrackingEngine>>, mut rx: mpsc::Receiver<FixMessage>) {
    let mut applied = 0u64;
    let mut dropped = 0u64;
    while let Some(msg) = rx.recv().await {
        let ok = engine.lock().unwrap().ingest(msg);
        if ok {
            applied += 1;
        } else {
            dropped += 1;
        }
        if (applied + dropped) % 500 == 0 {
            info!("[ingest] {applied} applied, {dropped} dropped");
        }
    }
    info!("[ingest] feed closed: {applied} applied, {dropped} dropped");
}
