use thiserror::Error;

/// Failures that can surface from the tracking engine.
///
/// Only route construction and explicit configuration calls fail outright;
/// everything downstream of a loaded route degrades confidence/flags on the
/// affected device instead of returning an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("route needs at least 2 valid points, got {0}")]
    InvalidRoute(usize),

    #[error("failed to parse GPX route: {0}")]
    GpxParse(String),

    #[error("invalid personal-best target: {0}")]
    InvalidTarget(String),
}
