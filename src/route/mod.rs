pub mod geo;
pub mod gpx;
pub mod model;
pub mod projection;

pub use gpx::route_points_from_gpx;
pub use model::{Checkpoint, RouteModel, RoutePoint};
pub use projection::{project_onto, Projection};
