use std::sync::atomic::{AtomicI64, Ordering};

/// Shared elapsed-time reference for average-speed and ETA math.
///
/// The only state shared across devices. The auto-start on the first
/// early-checkpoint crossing is a compare-and-set so that, with devices
/// processed concurrently, exactly one crossing wins; everyone else reads.
/// 0 means "not started".
#[derive(Debug, Default)]
pub struct RaceClock {
    started_at_ms: AtomicI64,
}

impl RaceClock {
    pub fn new() -> Self {
        RaceClock {
            started_at_ms: AtomicI64::new(0),
        }
    }

    /// First-writer-wins start. Returns true when this call started the
    /// clock, false when it was already running.
    pub fn start_at(&self, ms: i64) -> bool {
        self.started_at_ms
            .compare_exchange(0, ms.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Operator override: (re)starts unconditionally.
    pub fn force_start_at(&self, ms: i64) {
        self.started_at_ms.store(ms.max(1), Ordering::Release);
    }

    pub fn stop(&self) {
        self.started_at_ms.store(0, Ordering::Release);
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        match self.started_at_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at_ms().is_some()
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> Option<i64> {
        self.started_at_ms().map(|start| (now_ms - start).max(0))
    }
}
