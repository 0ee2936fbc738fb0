pub mod consistency;
pub mod device;
pub mod engine;

pub use consistency::{Consistency, ConsistencyLabel};
pub use device::{DevicePhase, DeviceSnapshot, PersonalBest, TargetStatus};
pub use engine::TrackingEngine;
