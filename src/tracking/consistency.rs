use serde::Serialize;

use crate::speed::ProjectedSample;

/// Pace-steadiness label, ordered from steadiest to most erratic. The
/// rendered names are the broadcast-facing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsistencyLabel {
    #[serde(rename = "muy constante")]
    MuyConstante,
    #[serde(rename = "constante")]
    Constante,
    #[serde(rename = "variable")]
    Variable,
    #[serde(rename = "muy variable")]
    MuyVariable,
}

impl ConsistencyLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyLabel::MuyConstante => "muy constante",
            ConsistencyLabel::Constante => "constante",
            ConsistencyLabel::Variable => "variable",
            ConsistencyLabel::MuyVariable => "muy variable",
        }
    }
}

impl std::fmt::Display for ConsistencyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Robust pace spread over the recent projected history.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consistency {
    pub pace_std_sec: Option<f64>,
    pub label: Option<ConsistencyLabel>,
    pub samples: usize,
}

/// Scale factor turning a median absolute deviation into a standard
/// deviation estimate under normality.
const MAD_TO_STD: f64 = 1.4826;
const MIN_BUCKETS: usize = 5;
const MIN_CORE: usize = 3;

/// Partition the recent projected history into fixed-distance buckets,
/// compute a pace per bucket, trim the extreme 10% on both ends and measure
/// the spread of the rest. MAD instead of a plain standard deviation so a
/// single noisy bucket cannot dominate the label.
pub fn compute(
    history: &[ProjectedSample],
    window_km: f64,
    bucket_km: f64,
    bands_s: [f64; 3],
) -> Consistency {
    let (first, latest) = match (history.first(), history.last()) {
        (Some(f), Some(l)) if history.len() >= 2 => (f, l),
        _ => return Consistency::default(),
    };

    let d_end = latest.distance_km;
    let d_start = first.distance_km.max(d_end - window_km);
    let covered = d_end - d_start;
    // Tiny slack so a window that is exactly N buckets wide yields N.
    let n_buckets = (covered / bucket_km + 1e-6).floor() as usize;
    if n_buckets < MIN_BUCKETS {
        return Consistency::default();
    }

    let mut paces_s: Vec<f64> = Vec::with_capacity(n_buckets);
    for i in 0..n_buckets {
        let lo = d_end - (i + 1) as f64 * bucket_km;
        let hi = d_end - i as f64 * bucket_km;
        let (t_lo, t_hi) = (time_at_distance(history, lo), time_at_distance(history, hi));
        if let (Some(t_lo), Some(t_hi)) = (t_lo, t_hi) {
            let pace = ((t_hi - t_lo) as f64 / 1000.0) / bucket_km;
            if pace.is_finite() && pace >= 0.0 {
                paces_s.push(pace);
            }
        }
    }
    if paces_s.len() < MIN_BUCKETS {
        return Consistency::default();
    }

    paces_s.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let cut = paces_s.len() / 10;
    let core = &paces_s[cut..paces_s.len() - cut];
    if core.len() < MIN_CORE {
        return Consistency::default();
    }

    let med = median_sorted(core);
    let mut deviations: Vec<f64> = core.iter().map(|p| (p - med).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let std_s = MAD_TO_STD * median_sorted(&deviations);

    let label = if std_s <= bands_s[0] {
        ConsistencyLabel::MuyConstante
    } else if std_s <= bands_s[1] {
        ConsistencyLabel::Constante
    } else if std_s <= bands_s[2] {
        ConsistencyLabel::Variable
    } else {
        ConsistencyLabel::MuyVariable
    };

    Consistency {
        pace_std_sec: Some(std_s),
        label: Some(label),
        samples: core.len(),
    }
}

/// Timestamp at which the device first reached `km`, linearly interpolated
/// between the surrounding samples. The history's distances are
/// non-decreasing; plateaus resolve to the first sample at the distance.
fn time_at_distance(history: &[ProjectedSample], km: f64) -> Option<i64> {
    let idx = history.partition_point(|s| s.distance_km < km);
    if idx == 0 {
        return Some(history[0].ts_ms);
    }
    if idx >= history.len() {
        return Some(history[history.len() - 1].ts_ms);
    }
    let a = &history[idx - 1];
    let b = &history[idx];
    let span = b.distance_km - a.distance_km;
    if span <= 0.0 {
        return Some(b.ts_ms);
    }
    let t = (km - a.distance_km) / span;
    Some(a.ts_ms + ((b.ts_ms - a.ts_ms) as f64 * t).round() as i64)
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
