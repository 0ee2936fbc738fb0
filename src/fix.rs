use serde::{Deserialize, Serialize};

/// Wire-contract fix record, one per incoming telemetry message. Both the
/// live feed and the replay producer emit this exact shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixMessage {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub reported_speed_kmh: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

/// A validated fix stamped with its receipt time. Ephemeral: consumed by one
/// engine update and only survives inside the device histories.
#[derive(Debug, Clone)]
pub struct RawFix {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub reported_speed_kmh: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub received_at_ms: i64,
}

impl FixMessage {
    /// Boundary validation. Malformed records (empty id, non-finite
    /// coordinates) become `None` and are dropped by the caller; they never
    /// reach a device's state. Non-finite optional fields are scrubbed rather
    /// than rejected.
    pub fn into_fix(self, received_at_ms: i64) -> Option<RawFix> {
        if self.device_id.trim().is_empty() {
            return None;
        }
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return None;
        }
        let speed = if self.reported_speed_kmh.is_finite() && self.reported_speed_kmh > 0.0 {
            self.reported_speed_kmh
        } else {
            0.0
        };
        Some(RawFix {
            device_id: self.device_id,
            lat: self.lat,
            lon: self.lon,
            reported_speed_kmh: speed,
            altitude: self.altitude.filter(|a| a.is_finite()),
            heading: self.heading.filter(|h| h.is_finite()),
            received_at_ms,
        })
    }
}
