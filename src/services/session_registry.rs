//! Process-wide table of active tourist sessions
//!
//! Backed by a sharded `DashMap`, so updates for different sessions only
//! contend when they hash to the same shard. Every read API hands out owned
//! snapshots; no caller ever holds a reference into the map.

use crate::domain::geo::{bearing_degrees, distance_meters};
use crate::domain::types::{LatLng, Position, SessionId, SessionStatus, TouristSession};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

/// Another tourist found near a query point
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbySession {
    pub session_id: SessionId,
    pub display_name: String,
    pub position: Position,
    pub distance_meters: f64,
    /// Direction from the query point, degrees clockwise from north
    pub bearing_degrees: f64,
    pub status: SessionStatus,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, TouristSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    /// Register a session without a position yet
    ///
    /// Re-joining an existing session refreshes its name and last-seen stamp.
    pub fn join(&self, session_id: &SessionId, display_name: &str, now_ms: u64) {
        self.sessions
            .entry(session_id.clone())
            .and_modify(|s| {
                s.display_name = display_name.to_string();
                s.last_seen_ms = now_ms;
            })
            .or_insert_with(|| TouristSession::new(session_id.clone(), display_name, now_ms));
        debug!(session_id = %session_id, name = %display_name, "session_joined");
    }

    /// Insert or update a session's position
    ///
    /// Returns the previous position so callers can detect duplicate pushes.
    pub fn upsert(
        &self,
        session_id: &SessionId,
        position: Position,
        display_name: &str,
        now_ms: u64,
    ) -> Option<Position> {
        let mut entry = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| TouristSession::new(session_id.clone(), display_name, now_ms));
        let session = entry.value_mut();
        if !display_name.is_empty() {
            session.display_name.clear();
            session.display_name.push_str(display_name);
        }
        session.last_seen_ms = now_ms;
        session.last_position.replace(position)
    }

    pub fn set_status(&self, session_id: &SessionId, status: SessionStatus) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.status = status;
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<TouristSession> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Explicit disconnect
    pub fn remove(&self, session_id: &SessionId) -> Option<TouristSession> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Remove sessions silent for longer than `ttl_ms`, returning them
    pub fn sweep_expired(&self, ttl_ms: u64, now_ms: u64) -> Vec<TouristSession> {
        let mut expired = Vec::new();
        self.sessions.retain(|_, session| {
            let alive = now_ms.saturating_sub(session.last_seen_ms) <= ttl_ms;
            if !alive {
                expired.push(session.clone());
            }
            alive
        });
        if !expired.is_empty() {
            info!(count = %expired.len(), remaining = %self.sessions.len(), "sessions_expired");
        }
        expired
    }

    /// Sessions within `radius_m` of `point`, nearest first
    ///
    /// Never includes `exclude`, sessions without a position, or sessions
    /// last seen more than `ttl_ms` ago (the sweeper may not have run yet).
    pub fn nearby(
        &self,
        point: LatLng,
        radius_m: f64,
        exclude: &SessionId,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Vec<NearbySession> {
        let mut found: Vec<NearbySession> = self
            .sessions
            .iter()
            .filter(|entry| entry.key() != exclude)
            .filter(|entry| now_ms.saturating_sub(entry.last_seen_ms) <= ttl_ms)
            .filter_map(|entry| {
                let session = entry.value();
                let position = session.last_position?;
                let d = distance_meters(point, position.coords());
                (d <= radius_m).then(|| NearbySession {
                    session_id: session.session_id.clone(),
                    display_name: session.display_name.clone(),
                    position,
                    distance_meters: d,
                    bearing_degrees: bearing_degrees(point, position.coords()),
                    status: session.status,
                })
            })
            .collect();
        found.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        found
    }

    /// Owned copy of every session (admin listing)
    pub fn snapshot(&self) -> Vec<TouristSession> {
        let mut sessions: Vec<TouristSession> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
