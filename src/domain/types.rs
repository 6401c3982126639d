//! Shared types for the safety engine

use crate::domain::error::ValidationError;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Opaque session identifier, stable for the lifetime of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Arc<str>);

impl SessionId {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    /// Fresh server-assigned identifier
    pub fn generate() -> Self {
        Self::new(&new_uuid_v7())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for hazard zone IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A WGS84 coordinate pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(ValidationError::NonFiniteCoordinate { lat: self.lat, lng: self.lng });
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::LatitudeOutOfRange(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(ValidationError::LongitudeOutOfRange(self.lng));
        }
        Ok(())
    }
}

/// A timestamped position report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
    pub timestamp_ms: u64,
}

impl Position {
    /// Build a validated position
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: u64) -> Result<Self, ValidationError> {
        LatLng::new(latitude, longitude).validate()?;
        Ok(Self { latitude, longitude, timestamp_ms })
    }

    #[inline]
    pub fn coords(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    /// True if both positions are within `epsilon_m` meters of each other
    pub fn same_place(&self, other: &Position, epsilon_m: f64) -> bool {
        crate::domain::geo::distance_meters(self.coords(), other.coords()) <= epsilon_m
    }
}

/// Hazard severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A circular hazard perimeter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardZone {
    pub zone_id: ZoneId,
    pub name: String,
    pub center: LatLng,
    pub radius_meters: f64,
    pub severity: Severity,
}

/// Safety status of a tourist session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Safe,
    Warning,
    Alerted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Safe => "safe",
            SessionStatus::Warning => "warning",
            SessionStatus::Alerted => "alerted",
        }
    }
}

/// An active tourist session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TouristSession {
    pub session_id: SessionId,
    pub display_name: String,
    pub last_position: Option<Position>,
    pub status: SessionStatus,
    pub last_seen_ms: u64,
}

impl TouristSession {
    #[inline]
    pub fn new(session_id: SessionId, display_name: &str, now_ms: u64) -> Self {
        Self {
            session_id,
            display_name: display_name.to_string(),
            last_position: None,
            status: SessionStatus::Safe,
            last_seen_ms: now_ms,
        }
    }
}

/// Alert classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    Enter,
    Exit,
    Sos,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Enter => "ENTER",
            AlertKind::Exit => "EXIT",
            AlertKind::Sos => "SOS",
        }
    }

    /// Delivery priority; higher is more urgent
    pub fn priority(&self) -> u8 {
        match self {
            AlertKind::Sos => 2,
            AlertKind::Enter => 1,
            AlertKind::Exit => 0,
        }
    }
}

/// An immutable alert produced by containment checks or an SOS signal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub alert_id: String,
    pub session_id: SessionId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<ZoneId>,
    pub zone_name: String,
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Position>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AlertEvent {
    /// Zone transition alert (ENTER or EXIT)
    pub fn zone_transition(
        kind: AlertKind,
        session_id: SessionId,
        display_name: &str,
        zone: &HazardZone,
        location: Position,
    ) -> Self {
        let message = match kind {
            AlertKind::Enter => format!(
                "You have entered {} ({} risk). Please leave the area or take precautions.",
                zone.name,
                zone.severity.as_str()
            ),
            _ => format!("You have left {}.", zone.name),
        };
        Self {
            alert_id: new_uuid_v7(),
            session_id,
            display_name: display_name.to_string(),
            zone_id: Some(zone.zone_id.clone()),
            zone_name: zone.name.clone(),
            kind,
            severity: zone.severity,
            location: Some(location),
            timestamp_ms: location.timestamp_ms,
            message: Some(message),
        }
    }

    /// User-initiated SOS, always critical
    pub fn sos(
        session_id: SessionId,
        display_name: &str,
        location: Option<Position>,
        message: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            alert_id: new_uuid_v7(),
            session_id,
            display_name: display_name.to_string(),
            zone_id: None,
            zone_name: String::new(),
            kind: AlertKind::Sos,
            severity: Severity::Critical,
            location,
            timestamp_ms: now_ms,
            message,
        }
    }
}

/// A stop in a day plan to be ordered by the route optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub label: String,
    pub lat: f64,
    pub lng: f64,
}

impl Waypoint {
    pub fn new(label: &str, lat: f64, lng: f64) -> Self {
        Self { label: label.to_string(), lat, lng }
    }

    #[inline]
    pub fn coords(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// Timestamp that can be either RFC 3339 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    /// Resolve to epoch milliseconds, if the value is usable
    pub fn to_epoch_ms(&self) -> Option<u64> {
        match self {
            TimestampValue::None => None,
            TimestampValue::EpochMs(ms) => Some(*ms),
            TimestampValue::IsoString(s) => OffsetDateTime::parse(s, &Rfc3339)
                .ok()
                .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok()),
        }
    }
}

pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Negative epochs are treated as missing
            Ok(u64::try_from(value).map(TimestampValue::EpochMs).unwrap_or_default())
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value >= 0.0 {
                Ok(TimestampValue::EpochMs(value as u64))
            } else {
                Ok(TimestampValue::None)
            }
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}
