//! Live race telemetry engine: projects GPS fixes onto a predefined route
//! and derives progress, pace, ETA and pace-consistency metrics per tracked
//! device, staying stable under GPS jitter, signal gaps and mode changes.

pub mod clock;
pub mod config;
pub mod error;
pub mod fix;
pub mod ingest;
pub mod race_clock;
pub mod route;
pub mod speed;
pub mod tracking;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LocomotionMode, ModeParams, TrackerConfig};
pub use error::TrackerError;
pub use fix::{FixMessage, RawFix};
pub use race_clock::RaceClock;
pub use route::{Projection, RouteModel, RoutePoint};
pub use speed::{ProjectedSample, SpeedEstimator};
pub use tracking::{
    Consistency, ConsistencyLabel, DevicePhase, DeviceSnapshot, PersonalBest, TrackingEngine,
};
