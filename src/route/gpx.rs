use std::io::Read;

use crate::error::TrackerError;
use crate::route::model::RoutePoint;

/// Extract the route polyline from a GPX document: every track point of
/// every track segment, in order. Elevation is carried when present.
pub fn route_points_from_gpx<R: Read>(input: R) -> Result<Vec<RoutePoint>, TrackerError> {
    let gpx = ::gpx::read(input).map_err(|e| TrackerError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    for track in gpx.tracks {
        for segment in track.segments {
            for wp in segment.points {
                let point = wp.point();
                out.push(RoutePoint {
                    lat: point.y(),
                    lon: point.x(),
                    elevation: wp.elevation,
                });
            }
        }
    }
    Ok(out)
}
