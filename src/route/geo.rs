use geo::{HaversineDistance, Point};

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2)) / 1000.0
}

/// Initial bearing from one coordinate to another, degrees [0, 360).
/// Used to infill missing headings in recorded tracks.
pub fn initial_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lon = (lon2 - lon1).to_radians();
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let y = d_lon.sin() * lat2r.cos();
    let x = lat1r.cos() * lat2r.sin() - lat1r.sin() * lat2r.cos() * d_lon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Local equirectangular projection: degrees scaled so that x and y are
/// locally comparable. Only ever used to compare distances inside one
/// segment's neighborhood, never as absolute coordinates.
pub fn equirect(lat: f64, lon: f64, ref_lat: f64) -> (f64, f64) {
    (lon * ref_lat.to_radians().cos(), lat)
}

/// Inverse of `equirect` with the same reference latitude.
pub fn equirect_inv(x: f64, y: f64, ref_lat: f64) -> (f64, f64) {
    (y, x / ref_lat.to_radians().cos())
}

/// km/h to pace in min/km. `None` for non-positive speeds.
pub fn kmh_to_pace_min_per_km(kmh: f64) -> Option<f64> {
    if kmh > 0.0 && kmh.is_finite() {
        Some(60.0 / kmh)
    } else {
        None
    }
}

/// "4:30 min/km" style formatting for snapshots and logs.
pub fn format_pace(min_per_km: Option<f64>) -> String {
    match min_per_km {
        Some(p) if p.is_finite() => {
            let m = p.floor() as i64;
            let s = ((p - p.floor()) * 60.0).round() as i64;
            // Rounding can carry into the next minute.
            let (m, s) = if s >= 60 { (m + 1, 0) } else { (m, s) };
            format!("{}:{:02} min/km", m, s)
        }
        _ => "-".to_string(),
    }
}

/// "HH:MM:SS" from a millisecond duration.
pub fn format_hms(ms: i64) -> String {
    if ms < 0 {
        return "-".to_string();
    }
    let s = ms / 1000;
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}

/// Parse "H:MM:SS", "MM:SS" or "SS" into milliseconds.
pub fn parse_hms_ms(input: &str) -> Option<i64> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut total: i64 = 0;
    for part in &parts {
        let v: i64 = part.trim().parse().ok()?;
        if v < 0 {
            return None;
        }
        total = total * 60 + v;
    }
    Some(total * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_haversine_known_distance() {
        // Valencia -> Barcelona, roughly 303 km.
        let d = haversine_km(39.4699, -0.3763, 41.3874, 2.1686);
        assert!((d - 303.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        assert_relative_eq!(haversine_km(39.5, -0.4, 39.5, -0.4), 0.0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        // Due north and due east from the equator.
        assert_relative_eq!(initial_bearing_deg(0.0, 0.0, 1.0, 0.0), 0.0, epsilon = 0.1);
        assert_relative_eq!(initial_bearing_deg(0.0, 0.0, 0.0, 1.0), 90.0, epsilon = 0.1);
    }

    #[test]
    fn test_equirect_round_trip() {
        let (x, y) = equirect(39.5, -0.4, 39.5);
        let (lat, lon) = equirect_inv(x, y, 39.5);
        assert_relative_eq!(lat, 39.5, epsilon = 1e-12);
        assert_relative_eq!(lon, -0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_pace_conversion_and_formatting() {
        assert_relative_eq!(kmh_to_pace_min_per_km(10.0).unwrap(), 6.0);
        assert!(kmh_to_pace_min_per_km(0.0).is_none());
        assert!(kmh_to_pace_min_per_km(-3.0).is_none());
        assert_eq!(format_pace(Some(4.5)), "4:30 min/km");
        assert_eq!(format_pace(Some(5.9999)), "6:00 min/km");
        assert_eq!(format_pace(None), "-");
    }

    #[test]
    fn test_hms_formatting() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(3_661_000), "01:01:01");
        assert_eq!(format_hms(-5), "-");
    }

    #[test]
    fn test_hms_parsing() {
        assert_eq!(parse_hms_ms("1:01:01"), Some(3_661_000));
        assert_eq!(parse_hms_ms("45:30"), Some(2_730_000));
        assert_eq!(parse_hms_ms("90"), Some(90_000));
        assert_eq!(parse_hms_ms("abc"), None);
        assert_eq!(parse_hms_ms("1:2:3:4"), None);
    }
}
