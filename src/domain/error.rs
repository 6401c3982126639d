//! Error taxonomy for the safety engine
//!
//! Validation failures are rejected synchronously and never mutate state.
//! Delivery failures and optimizer timeouts are not errors at this level:
//! the former are logged and dropped, the latter degrade to best-so-far.

use crate::domain::types::ZoneId;
use thiserror::Error;

/// Input rejected before any state is touched
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("coordinate is not finite (lat={lat}, lng={lng})")]
    NonFiniteCoordinate { lat: f64, lng: f64 },

    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("waypoint list is empty")]
    EmptyWaypoints,

    #[error("{count} waypoints exceeds the limit of {max}")]
    TooManyWaypoints { count: usize, max: usize },

    #[error("waypoints {first} and {second} share the same coordinates")]
    DuplicateWaypoint { first: usize, second: usize },

    #[error("waypoint {index} is invalid: {source}")]
    InvalidWaypoint {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// A zone set rejected at load time; the previous snapshot stays active
#[derive(Debug, Error)]
pub enum ZoneLoadError {
    #[error("zone {zone_id} has invalid radius {radius}")]
    InvalidRadius { zone_id: ZoneId, radius: f64 },

    #[error("zone {zone_id} has invalid center: {source}")]
    InvalidCenter {
        zone_id: ZoneId,
        #[source]
        source: ValidationError,
    },

    #[error("duplicate zone id {0}")]
    DuplicateId(ZoneId),

    #[error("failed to read zone source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse zone definitions: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("zone endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Route optimization failures surfaced to the caller
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("optimizer worker pool is unavailable")]
    WorkerUnavailable,
}
