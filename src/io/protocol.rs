//! Wire messages for the live client channel
//!
//! One JSON object per line, discriminated by a `type` field. Client
//! messages are parsed leniently (missing optional fields default); server
//! and admin messages are serialized in camelCase.

use crate::domain::error::ValidationError;
use crate::domain::types::{
    deserialize_timestamp, AlertEvent, LatLng, Position, SessionId, SessionStatus, TimestampValue,
};
use crate::services::session_registry::NearbySession;
use serde::{Deserialize, Serialize};

/// Connection role chosen at join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Tourist,
    Admin,
}

/// Client -> server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        role: Role,
    },
    UpdateLocation {
        lat: f64,
        lng: f64,
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        timestamp: TimestampValue,
    },
    SosSignal {
        #[serde(default)]
        location: Option<LatLng>,
        #[serde(default)]
        message: Option<String>,
    },
    Leave,
}

impl ClientMessage {
    /// Parse one line of input
    pub fn parse(line: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(line).map_err(|e| ValidationError::MalformedMessage(e.to_string()))
    }
}

/// A tourist's accepted position, as pushed to the tourist and to admins
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    pub session_id: SessionId,
    pub display_name: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp_ms: u64,
    pub status: SessionStatus,
}

impl LocationUpdatePayload {
    pub fn new(
        session_id: SessionId,
        display_name: &str,
        position: Position,
        status: SessionStatus,
    ) -> Self {
        Self {
            session_id,
            display_name: display_name.to_string(),
            lat: position.latitude,
            lng: position.longitude,
            timestamp_ms: position.timestamp_ms,
            status,
        }
    }
}

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    Disconnected,
    Expired,
}

/// Server -> session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        role: Role,
    },
    TouristLocationUpdate(LocationUpdatePayload),
    DangerAlert(AlertEvent),
    ZoneExit(AlertEvent),
    NearbyTourists {
        tourists: Vec<NearbySession>,
    },
    SosAcknowledged {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }
}

/// Server -> every admin observer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AdminMessage {
    Alert(AlertEvent),
    Sos(AlertEvent),
    TouristLocationUpdate(LocationUpdatePayload),
    TouristLeft {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "displayName")]
        display_name: String,
        reason: LeaveReason,
    },
}

/// Serialize as a single JSON line (without the trailing newline)
pub fn to_line<T: Serialize>(message: &T) -> Option<String> {
    serde_json::to_string(message).ok()
}
