use serde::Serialize;

use super::geo::{equirect, equirect_inv, haversine_km};
use super::model::RouteModel;

/// Result of projecting one fix onto the route polyline.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Projection {
    pub lat: f64,
    pub lon: f64,
    pub distance_km: f64,
    pub lateral_offset_m: f64,
    pub segment: usize,
    pub fraction: f64,
}

/// Project a fix onto the route, searching only segments in
/// `[hint - backtrack, hint + forward]`. A device moves forward along the
/// route, so the true match is almost always near the previous one; a global
/// nearest-segment search is slower and locks onto geometrically close but
/// topologically wrong segments on switchbacks.
pub fn project_onto(
    route: &RouteModel,
    lat: f64,
    lon: f64,
    hint: usize,
    backtrack: usize,
    forward: usize,
) -> Projection {
    let cps = route.checkpoints();
    if cps.len() < 2 {
        // Degenerate route: report the raw point with zero progress.
        return Projection {
            lat,
            lon,
            distance_km: 0.0,
            lateral_offset_m: 0.0,
            segment: 0,
            fraction: 0.0,
        };
    }

    let last_seg = cps.len() - 2;
    let start = hint.min(last_seg).saturating_sub(backtrack);
    let end = (hint.saturating_add(forward)).min(last_seg);

    let mut best: Option<Projection> = None;
    for seg in start..=end {
        let a = &cps[seg];
        let b = &cps[seg + 1];
        let ref_lat = (a.lat + b.lat) / 2.0;

        let (px, py) = equirect(lat, lon, ref_lat);
        let (ax, ay) = equirect(a.lat, a.lon, ref_lat);
        let (bx, by) = equirect(b.lat, b.lon, ref_lat);

        let dx = bx - ax;
        let dy = by - ay;
        let denom = (dx * dx + dy * dy).max(1e-12);
        let t = (((px - ax) * dx + (py - ay) * dy) / denom).clamp(0.0, 1.0);
        let (proj_lat, proj_lon) = equirect_inv(ax + t * dx, ay + t * dy, ref_lat);

        let offset_m = haversine_km(lat, lon, proj_lat, proj_lon) * 1000.0;
        if best.map_or(true, |p| offset_m < p.lateral_offset_m) {
            let seg_len_km = b.cumulative_km - a.cumulative_km;
            let distance_km = (a.cumulative_km + seg_len_km * t).min(route.total_km());
            best = Some(Projection {
                lat: proj_lat,
                lon: proj_lon,
                distance_km,
                lateral_offset_m: offset_m,
                segment: seg,
                fraction: t,
            });
        }
    }

    // The window is never empty: start <= end always holds after clamping.
    best.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::model::RoutePoint;
    use approx::assert_relative_eq;

    fn straight_route_km(total_km: f64, step_m: f64) -> RouteModel {
        // Heading north along a meridian: 1 km ~= 0.0089932 degrees latitude,
        // rounded a hair low so the built total never overshoots the nominal.
        let deg = total_km / 111.1951;
        let pts = vec![
            RoutePoint::new(39.0, -0.4),
            RoutePoint::new(39.0 + deg, -0.4),
        ];
        RouteModel::build(&pts, Some(step_m)).unwrap()
    }

    #[test]
    fn test_point_on_checkpoint_projects_exactly() {
        let route = straight_route_km(2.0, 100.0);
        for (i, cp) in route.checkpoints().iter().enumerate().step_by(5) {
            let hint = i.min(route.segment_count() - 1);
            let p = project_onto(&route, cp.lat, cp.lon, hint, 3, 5);
            assert_relative_eq!(p.distance_km, cp.cumulative_km, epsilon = 1e-9);
            assert!(p.lateral_offset_m < 0.01, "offset {}", p.lateral_offset_m);
        }
    }

    #[test]
    fn test_lateral_point_reports_offset() {
        let route = straight_route_km(2.0, 100.0);
        let cp = route.checkpoints()[5];
        // ~39 m east of the line at this latitude.
        let p = project_onto(&route, cp.lat, cp.lon + 0.00045, 5, 3, 5);
        assert!(
            (30.0..50.0).contains(&p.lateral_offset_m),
            "offset {}",
            p.lateral_offset_m
        );
        assert_relative_eq!(p.distance_km, cp.cumulative_km, epsilon = 1e-6);
    }

    #[test]
    fn test_search_stays_inside_window() {
        let route = straight_route_km(2.0, 100.0);
        // Point sits at km 1.5 but the hint is stuck near the start: the
        // window cannot reach it, so the match clamps to the window edge.
        let far = route.checkpoints()[15];
        let p = project_onto(&route, far.lat, far.lon, 0, 3, 5);
        assert!(p.segment <= 5);
        assert!(p.distance_km < 0.7);
    }

    #[test]
    fn test_window_clamps_at_route_ends() {
        let route = straight_route_km(2.0, 100.0);
        let cp = route.checkpoints()[0];
        let p = project_onto(&route, cp.lat, cp.lon, 0, 10, 5);
        assert_eq!(p.segment, 0);
        let last = *route.checkpoints().last().unwrap();
        let p = project_onto(&route, last.lat, last.lon, route.segment_count() + 50, 3, 50);
        assert_relative_eq!(p.distance_km, route.total_km(), epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_route_degrades_gracefully() {
        // Build a valid 2-point model, then check the <2 checkpoint path via
        // a model with a single segment is still fine; the true degenerate
        // case cannot be constructed through build(), so exercise the
        // single-segment floor instead.
        let route = straight_route_km(0.05, 100.0);
        let p = project_onto(&route, 39.0, -0.4, 0, 3, 5);
        assert!(p.distance_km >= 0.0);
    }

    #[test]
    fn test_midpoint_fraction_is_half() {
        let route = straight_route_km(1.0, 100.0);
        let a = route.checkpoints()[3];
        let b = route.checkpoints()[4];
        let p = project_onto(
            &route,
            (a.lat + b.lat) / 2.0,
            (a.lon + b.lon) / 2.0,
            3,
            3,
            5,
        );
        assert_eq!(p.segment, 3);
        assert_relative_eq!(p.fraction, 0.5, epsilon = 1e-6);
    }
}
