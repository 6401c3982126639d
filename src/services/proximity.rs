//! Nearby-traveler lookup for the reporting tourist

use crate::domain::types::SessionId;
use crate::services::session_registry::{NearbySession, SessionRegistry};
use std::sync::Arc;

pub struct ProximityMatcher {
    registry: Arc<SessionRegistry>,
    radius_m: f64,
    ttl_ms: u64,
}

impl ProximityMatcher {
    pub fn new(registry: Arc<SessionRegistry>, radius_m: f64, ttl_ms: u64) -> Self {
        Self { registry, radius_m, ttl_ms }
    }

    /// Other live sessions within the configured radius of `session_id`
    ///
    /// Unknown sessions and sessions without a position yield an empty list.
    pub fn nearby_tourists(&self, session_id: &SessionId, now_ms: u64) -> Vec<NearbySession> {
        let Some(position) = self.registry.get(session_id).and_then(|s| s.last_position) else {
            return Vec::new();
        };
        self.registry.nearby(position.coords(), self.radius_m, session_id, now_ms, self.ttl_ms)
    }
}
