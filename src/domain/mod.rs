//! Domain models - core types, geometry and errors
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - sessions, positions, hazard zones, alerts, waypoints
//! - `geo` - haversine distance, containment and bearing
//! - `error` - validation and load error taxonomy

pub mod error;
pub mod geo;
pub mod types;

pub use error::{OptimizeError, ValidationError, ZoneLoadError};
pub use types::{
    epoch_ms, AlertEvent, AlertKind, HazardZone, LatLng, Position, SessionId, SessionStatus,
    Severity, TouristSession, Waypoint, ZoneId,
};
