//! Live safety engine - session lifecycle and update orchestration
//!
//! The SafetyEngine is the central processor that coordinates:
//! - Session state (joins, location updates, disconnects, expiry)
//! - Containment checks against the current zone snapshot
//! - Nearby-traveler lookups
//! - Alert and SOS delivery through the dispatcher
//!
//! It is shared as `Arc<SafetyEngine>`; every operation takes `&self` and
//! relies on the per-key locking of the underlying maps, so connection
//! tasks never serialize on a global lock.

mod handlers;

pub use handlers::{JoinOutcome, UpdateOutcome};

use crate::domain::types::{epoch_ms, HazardZone, TouristSession};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::containment::ContainmentEngine;
use crate::services::dispatcher::AlertDispatcher;
use crate::services::proximity::ProximityMatcher;
use crate::services::session_registry::SessionRegistry;
use crate::services::zone_index::ZoneIndex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::info;

pub struct SafetyEngine {
    /// Application configuration
    pub(crate) config: Config,
    /// Active hazard perimeters
    pub(crate) zones: Arc<ZoneIndex>,
    /// Active tourist sessions
    pub(crate) registry: Arc<SessionRegistry>,
    /// Per-(session, zone) transition state
    pub(crate) containment: ContainmentEngine,
    pub(crate) proximity: ProximityMatcher,
    /// Outbound fan-out to sessions and admins
    pub(crate) dispatcher: Arc<AlertDispatcher>,
    pub(crate) metrics: Arc<Metrics>,
}

impl SafetyEngine {
    pub fn new(
        config: Config,
        zones: Arc<ZoneIndex>,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let containment = ContainmentEngine::new(config.hysteresis_ratio(), config.min_dwell_ms());
        let proximity = ProximityMatcher::new(
            registry.clone(),
            config.proximity_radius_m(),
            config.session_ttl_ms(),
        );
        Self { config, zones, registry, containment, proximity, dispatcher, metrics }
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    pub fn zones(&self) -> &Arc<ZoneIndex> {
        &self.zones
    }

    /// Owned copy of every active session
    pub fn sessions_snapshot(&self) -> Vec<TouristSession> {
        self.registry.snapshot()
    }

    pub fn zones_snapshot(&self) -> Vec<HazardZone> {
        self.zones.snapshot().to_vec()
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Refresh gauge metrics from current state
    pub fn sample_gauges(&self) {
        self.metrics.set_sessions_active(self.registry.len() as u64);
        self.metrics.set_zones_active(self.zones.len() as u64);
    }

    /// Periodically expire idle sessions until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.config.sweep_interval());
        info!(
            interval_secs = %self.config.sweep_interval().as_secs(),
            ttl_secs = %self.config.session_ttl().as_secs(),
            "session_sweeper_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("session_sweeper_shutdown");
                        return;
                    }
                }
                _ = tick.tick() => {
                    self.sweep_expired(epoch_ms());
                    self.sample_gauges();
                }
            }
        }
    }
}
