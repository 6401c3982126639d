//! Message handlers for the SafetyEngine
//!
//! Each handler covers one client action: joining, reporting a position,
//! raising an SOS, leaving. Validation happens before any state is touched.

use super::SafetyEngine;
use crate::domain::error::ValidationError;
use crate::domain::types::{
    epoch_ms, AlertEvent, LatLng, Position, SessionId, SessionStatus, TimestampValue,
};
use crate::io::protocol::{
    AdminMessage, LeaveReason, LocationUpdatePayload, Role, ServerMessage,
};
use crate::services::dispatcher::ConnectionId;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Name used when a client joins without one
const ANONYMOUS_NAME: &str = "anonymous";

/// Result of a successful join
pub struct JoinOutcome {
    pub session_id: SessionId,
    pub display_name: String,
    /// Owner token for this connection's queue, passed back on disconnect
    pub connection: ConnectionId,
    /// Outbound queue for this connection's writer task
    pub outbound: mpsc::Receiver<ServerMessage>,
}

/// What happened to an accepted location update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Same place and zone set as the previous evaluation with nothing
    /// pending; only last-seen refreshed
    Duplicate,
    Processed { status: SessionStatus, alerts: usize, nearby: usize },
}

impl SafetyEngine {
    /// Register a connection and greet it
    ///
    /// Tourists enter the session registry; admins only get a private
    /// channel (for errors and acks) and should also subscribe to the admin
    /// broadcast.
    pub fn join(&self, requested_id: Option<&str>, name: &str, role: Role) -> JoinOutcome {
        let session_id = match requested_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => SessionId::new(id),
            None => SessionId::generate(),
        };
        let display_name = match name.trim() {
            "" => ANONYMOUS_NAME.to_string(),
            trimmed => trimmed.to_string(),
        };

        let (connection, outbound) = self.dispatcher.register(&session_id);
        if role == Role::Tourist {
            self.registry.join(&session_id, &display_name, epoch_ms());
        }
        self.dispatcher
            .send_to(&session_id, ServerMessage::Welcome { session_id: session_id.clone(), role });

        info!(
            session_id = %session_id,
            name = %display_name,
            role = ?role,
            connection = %connection,
            "client_joined"
        );
        JoinOutcome { session_id, display_name, connection, outbound }
    }

    /// Ingest one position report
    ///
    /// Timestamps are normalized (client value, else receive time) and
    /// clamped so a session's time never runs backwards. A report at the
    /// previous spot is skipped unless a boundary flip is pending or the
    /// zone set changed since the session was last evaluated.
    pub fn handle_location_update(
        &self,
        session_id: &SessionId,
        display_name: &str,
        lat: f64,
        lng: f64,
        timestamp: &TimestampValue,
    ) -> Result<UpdateOutcome, ValidationError> {
        let process_start = Instant::now();
        let now_ms = epoch_ms();

        let previous = self.registry.get(session_id).and_then(|s| s.last_position);
        let mut timestamp_ms = timestamp.to_epoch_ms().unwrap_or(now_ms);
        if let Some(prev) = previous {
            if timestamp_ms < prev.timestamp_ms {
                debug!(
                    session_id = %session_id,
                    reported = %timestamp_ms,
                    last = %prev.timestamp_ms,
                    "timestamp_clamped"
                );
                timestamp_ms = prev.timestamp_ms;
            }
        }

        let position = match Position::new(lat, lng, timestamp_ms) {
            Ok(position) => position,
            Err(e) => {
                self.metrics.record_update_rejected();
                warn!(session_id = %session_id, error = %e, "location_rejected");
                return Err(e);
            }
        };

        self.registry.upsert(session_id, position, display_name, now_ms);

        let (zones, generation) = self.zones.versioned_snapshot();
        let duplicate = previous
            .is_some_and(|prev| prev.same_place(&position, self.config.duplicate_epsilon_m()));
        if duplicate && !self.containment.needs_evaluation(session_id, generation) {
            self.metrics.record_duplicate_skipped();
            debug!(session_id = %session_id, "duplicate_location_skipped");
            return Ok(UpdateOutcome::Duplicate);
        }

        let evaluation =
            self.containment.evaluate(session_id, display_name, position, &zones, generation);
        self.registry.set_status(session_id, evaluation.status);
        self.dispatcher.retract(session_id, &evaluation.pruned);

        let mut alerts = 0;
        for event in evaluation.events {
            if self.dispatcher.dispatch(event) {
                alerts += 1;
            }
        }

        let payload =
            LocationUpdatePayload::new(session_id.clone(), display_name, position, evaluation.status);
        self.dispatcher.send_to(session_id, ServerMessage::TouristLocationUpdate(payload.clone()));
        self.dispatcher.broadcast_admin(AdminMessage::TouristLocationUpdate(payload));

        let tourists = self.proximity.nearby_tourists(session_id, now_ms);
        let nearby = tourists.len();
        self.dispatcher.send_to(session_id, ServerMessage::NearbyTourists { tourists });

        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_update_processed(latency_us);

        Ok(UpdateOutcome::Processed { status: evaluation.status, alerts, nearby })
    }

    /// Raise an SOS, bypassing containment
    ///
    /// Uses the supplied location if any, else the last known position
    /// (however old). An SOS raised inside a hazard zone names the nearest
    /// such zone. Returns the alert id.
    pub fn handle_sos(
        &self,
        session_id: &SessionId,
        display_name: &str,
        location: Option<LatLng>,
        message: Option<String>,
    ) -> Result<String, ValidationError> {
        let now_ms = epoch_ms();
        let location = match location {
            Some(coords) => Some(Position::new(coords.lat, coords.lng, now_ms).inspect_err(|e| {
                self.metrics.record_update_rejected();
                warn!(session_id = %session_id, error = %e, "sos_location_rejected");
            })?),
            None => self.registry.get(session_id).and_then(|s| s.last_position),
        };

        let mut event = AlertEvent::sos(session_id.clone(), display_name, location, message, now_ms);
        if let Some(position) = location {
            let nearest = self
                .zones
                .containing(position.coords())
                .into_iter()
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((zone, _)) = nearest {
                event.zone_id = Some(zone.zone_id);
                event.zone_name = zone.name;
            }
        }
        let alert_id = event.alert_id.clone();
        self.dispatcher.dispatch_sos(event);
        Ok(alert_id)
    }

    /// Tear down a connection's state and tell admins a tourist left
    ///
    /// If the session has since rejoined on another connection, only this
    /// connection goes away; the session and its state stay with the newer one.
    pub fn disconnect(&self, session_id: &SessionId, connection: ConnectionId, role: Role) {
        if !self.dispatcher.forget(session_id, connection) {
            info!(
                session_id = %session_id,
                connection = %connection,
                "superseded_connection_closed"
            );
            return;
        }
        self.containment.forget(session_id);

        if role == Role::Tourist {
            if let Some(session) = self.registry.remove(session_id) {
                self.dispatcher.broadcast_admin(AdminMessage::TouristLeft {
                    session_id: session.session_id,
                    display_name: session.display_name,
                    reason: LeaveReason::Disconnected,
                });
            }
        }
        info!(session_id = %session_id, role = ?role, "client_disconnected");
    }

    /// Expire idle sessions; their connections (if any) stay open
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let expired = self.registry.sweep_expired(self.config.session_ttl_ms(), now_ms);
        for session in &expired {
            self.containment.forget(&session.session_id);
            self.dispatcher.clear_announced(&session.session_id);
            self.dispatcher.broadcast_admin(AdminMessage::TouristLeft {
                session_id: session.session_id.clone(),
                display_name: session.display_name.clone(),
                reason: LeaveReason::Expired,
            });
        }
        if !expired.is_empty() {
            self.metrics.record_sessions_expired(expired.len() as u64);
        }
        expired.len()
    }
}
