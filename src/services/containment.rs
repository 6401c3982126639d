//! Per-(session, zone) containment state machine
//!
//! Each location update is compared against one zone snapshot. A transition
//! (outside -> inside or inside -> outside) emits exactly one alert; staying
//! on the same side emits nothing, which is what keeps a tourist who lingers
//! in a zone from being re-alerted on every update.
//!
//! Boundary hysteresis: a reading within `hysteresis_ratio * radius` of the
//! perimeter only flips the state once the contrary reading has persisted
//! for `min_dwell_ms` (measured on update timestamps). Readings clear of the
//! band flip immediately.
//!
//! Each session also remembers the zone generation it was last evaluated
//! against, so a stationary tourist is re-checked after a zone refresh.

use crate::domain::geo::distance_meters;
use crate::domain::types::{
    AlertEvent, AlertKind, HazardZone, Position, SessionId, SessionStatus, ZoneId,
};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cmp::Reverse;
use tracing::{debug, info};

/// Containment state for one session in one zone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainmentState {
    pub is_inside: bool,
    pub last_transition_ms: u64,
    /// First timestamp of a contrary reading inside the boundary band
    pub pending_since_ms: Option<u64>,
}

impl ContainmentState {
    fn new(now_ms: u64) -> Self {
        Self { is_inside: false, last_transition_ms: now_ms, pending_since_ms: None }
    }
}

/// Outcome of evaluating one update
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Transitions, ENTER before EXIT
    pub events: SmallVec<[AlertEvent; 2]>,
    /// Status derived from the updated containment state
    pub status: SessionStatus,
    /// Zones the session was inside that have left the snapshot
    pub pruned: SmallVec<[ZoneId; 2]>,
}

/// All zone states of one session
#[derive(Debug, Default)]
struct SessionZones {
    zones: FxHashMap<ZoneId, ContainmentState>,
    /// Zone generation of the last evaluation
    generation: u64,
}

pub struct ContainmentEngine {
    states: DashMap<SessionId, SessionZones>,
    hysteresis_ratio: f64,
    min_dwell_ms: u64,
}

impl ContainmentEngine {
    pub fn new(hysteresis_ratio: f64, min_dwell_ms: u64) -> Self {
        Self { states: DashMap::new(), hysteresis_ratio: hysteresis_ratio.max(0.0), min_dwell_ms }
    }

    /// Evaluate one accepted position against a zone snapshot
    ///
    /// `generation` identifies the snapshot (see `ZoneIndex::versioned_snapshot`).
    pub fn evaluate(
        &self,
        session_id: &SessionId,
        display_name: &str,
        position: Position,
        zones: &[HazardZone],
        generation: u64,
    ) -> Evaluation {
        let now_ms = position.timestamp_ms;
        let point = position.coords();
        let mut evaluation = Evaluation::default();
        let mut near_boundary = false;

        // Holding the entry serializes evaluations for this session only
        let mut entry = self.states.entry(session_id.clone()).or_default();
        let session = entry.value_mut();
        session.generation = generation;
        let zone_states = &mut session.zones;

        // Zones dropped from the snapshot take their state with them
        zone_states.retain(|zone_id, state| {
            let kept = zones.iter().any(|z| &z.zone_id == zone_id);
            if !kept && state.is_inside {
                evaluation.pruned.push(zone_id.clone());
            }
            kept
        });

        for zone in zones {
            let distance = distance_meters(point, zone.center);
            let raw_inside = distance <= zone.radius_meters;
            let band = zone.radius_meters * self.hysteresis_ratio;
            let in_band = (distance - zone.radius_meters).abs() <= band;
            if !raw_inside && distance <= zone.radius_meters + band {
                near_boundary = true;
            }

            let state =
                zone_states.entry(zone.zone_id.clone()).or_insert_with(|| ContainmentState::new(now_ms));

            if raw_inside == state.is_inside {
                if state.pending_since_ms.take().is_some() {
                    debug!(session_id = %session_id, zone = %zone.name, "containment_flip_cancelled");
                }
                continue;
            }

            let flip = if !in_band || self.min_dwell_ms == 0 {
                true
            } else {
                match state.pending_since_ms {
                    None => {
                        state.pending_since_ms = Some(now_ms);
                        debug!(
                            session_id = %session_id,
                            zone = %zone.name,
                            distance_m = format!("{:.1}", distance),
                            "containment_flip_pending"
                        );
                        false
                    }
                    Some(since) => now_ms.saturating_sub(since) >= self.min_dwell_ms,
                }
            };

            if !flip {
                continue;
            }

            state.is_inside = raw_inside;
            state.last_transition_ms = now_ms;
            state.pending_since_ms = None;

            let kind = if raw_inside { AlertKind::Enter } else { AlertKind::Exit };
            info!(
                session_id = %session_id,
                zone = %zone.name,
                kind = %kind.as_str(),
                distance_m = format!("{:.1}", distance),
                "zone_transition"
            );
            evaluation.events.push(AlertEvent::zone_transition(
                kind,
                session_id.clone(),
                display_name,
                zone,
                position,
            ));
        }

        evaluation.events.sort_by_key(|e| Reverse(e.kind.priority()));

        let any_inside = zone_states.values().any(|s| s.is_inside);
        let any_pending = zone_states.values().any(|s| s.pending_since_ms.is_some());
        evaluation.status = if any_inside {
            SessionStatus::Alerted
        } else if any_pending || near_boundary {
            SessionStatus::Warning
        } else {
            SessionStatus::Safe
        };

        evaluation
    }

    /// True if any zone flip is waiting on the dwell timer
    pub fn has_pending(&self, session_id: &SessionId) -> bool {
        self.states
            .get(session_id)
            .is_some_and(|s| s.zones.values().any(|z| z.pending_since_ms.is_some()))
    }

    /// False only if the session was last evaluated against `generation`
    /// and has no flip pending, i.e. an unmoved report cannot change anything
    pub fn needs_evaluation(&self, session_id: &SessionId, generation: u64) -> bool {
        let evaluated_at = self.states.get(session_id).map(|s| s.generation);
        evaluated_at != Some(generation) || self.has_pending(session_id)
    }

    pub fn state(&self, session_id: &SessionId, zone_id: &ZoneId) -> Option<ContainmentState> {
        self.states.get(session_id).and_then(|s| s.zones.get(zone_id).copied())
    }

    /// Drop all state for a session (disconnect or expiry)
    pub fn forget(&self, session_id: &SessionId) {
        self.states.remove(session_id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_sessions(&self) -> usize {
        self.states.len()
    }

    #[cfg(test)]
    fn inside_zones(&self, session_id: &SessionId) -> Vec<ZoneId> {
        let Some(s) = self.states.get(session_id) else {
            return Vec::new();
        };
        let mut inside: Vec<ZoneId> =
            s.zones.iter().filter(|(_, z)| z.is_inside).map(|(id, _)| id.clone()).collect();
        inside.sort();
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{LatLng, Severity};

    fn zone(id: &str, lat: f64, lng: f64, radius: f64) -> HazardZone {
        HazardZone {
            zone_id: ZoneId(id.to_string()),
            name: format!("Zone {id}"),
            center: LatLng::new(lat, lng),
            radius_meters: radius,
            severity: Severity::High,
        }
    }

    fn pos(lat: f64, lng: f64, ts: u64) -> Position {
        Position::new(lat, lng, ts).unwrap()
    }

    /// A point `meters` north of `center`
    fn north_of(center: LatLng, meters: f64, ts: u64) -> Position {
        let dlat = meters / 111_194.93;
        pos(center.lat + dlat, center.lng, ts)
    }

    fn kinds(evaluation: &Evaluation) -> Vec<AlertKind> {
        evaluation.events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_scenario_enter_then_exit() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let zones = vec![zone("z", 12.97, 77.59, 1000.0)];
        let id = SessionId::new("t1");

        let first = engine.evaluate(&id, "Tess", pos(12.9705, 77.5905, 1_000), &zones, 1);
        assert_eq!(kinds(&first), vec![AlertKind::Enter]);
        assert_eq!(first.status, SessionStatus::Alerted);
        assert_eq!(first.events[0].zone_name, "Zone z");
        assert_eq!(first.events[0].severity, Severity::High);

        let second = engine.evaluate(&id, "Tess", pos(13.05, 77.59, 2_000), &zones, 1);
        assert_eq!(kinds(&second), vec![AlertKind::Exit]);
        assert_eq!(second.status, SessionStatus::Safe);
    }

    #[test]
    fn test_repeated_inside_updates_emit_single_enter() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let zones = vec![zone("z", 12.97, 77.59, 1000.0)];
        let id = SessionId::new("t1");

        let mut total = Vec::new();
        for i in 0..10 {
            let p = pos(12.9705 + i as f64 * 0.0001, 77.5905, 1_000 + i * 1_000);
            total.extend(kinds(&engine.evaluate(&id, "Tess", p, &zones, 1)));
        }
        assert_eq!(total, vec![AlertKind::Enter]);
    }

    #[test]
    fn test_boundary_jitter_does_not_flap() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let center = LatLng::new(12.97, 77.59);
        let zones = vec![zone("z", center.lat, center.lng, 1000.0)];
        let id = SessionId::new("t1");

        // Clearly inside first
        assert_eq!(
            kinds(&engine.evaluate(&id, "T", north_of(center, 500.0, 0), &zones, 1)),
            vec![AlertKind::Enter]
        );

        // GPS jitter straddling the edge, each reading within the 20m band
        let mut events = Vec::new();
        for i in 0..8u64 {
            let meters = if i % 2 == 0 { 1010.0 } else { 990.0 };
            let evaluation = engine.evaluate(&id, "T", north_of(center, meters, 1_000 + i * 1_000), &zones, 1);
            events.extend(kinds(&evaluation));
        }
        assert!(events.is_empty(), "unexpected events {events:?}");
        assert!(engine.state(&id, &ZoneId("z".into())).unwrap().is_inside);
    }

    #[test]
    fn test_band_exit_flips_after_dwell() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let center = LatLng::new(12.97, 77.59);
        let zones = vec![zone("z", center.lat, center.lng, 1000.0)];
        let id = SessionId::new("t1");

        engine.evaluate(&id, "T", north_of(center, 500.0, 0), &zones, 1);

        let pending = engine.evaluate(&id, "T", north_of(center, 1010.0, 10_000), &zones, 1);
        assert!(pending.events.is_empty());
        assert_eq!(pending.status, SessionStatus::Alerted);
        assert!(engine.has_pending(&id));

        let still = engine.evaluate(&id, "T", north_of(center, 1012.0, 12_000), &zones, 1);
        assert!(still.events.is_empty());

        let flipped = engine.evaluate(&id, "T", north_of(center, 1011.0, 15_000), &zones, 1);
        assert_eq!(kinds(&flipped), vec![AlertKind::Exit]);
        assert_eq!(flipped.status, SessionStatus::Warning);
        assert!(!engine.has_pending(&id));
    }

    #[test]
    fn test_clear_exit_flips_immediately() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let center = LatLng::new(12.97, 77.59);
        let zones = vec![zone("z", center.lat, center.lng, 1000.0)];
        let id = SessionId::new("t1");

        engine.evaluate(&id, "T", north_of(center, 500.0, 0), &zones, 1);
        let out = engine.evaluate(&id, "T", north_of(center, 1100.0, 100), &zones, 1);
        assert_eq!(kinds(&out), vec![AlertKind::Exit]);
    }

    #[test]
    fn test_enter_ordered_before_exit() {
        let engine = ContainmentEngine::new(0.02, 0);
        let zones = vec![zone("a", 0.0, 0.0, 1000.0), zone("b", 0.0, 0.1, 1000.0)];
        let id = SessionId::new("t1");

        assert_eq!(kinds(&engine.evaluate(&id, "T", pos(0.0, 0.0, 0), &zones, 1)), vec![AlertKind::Enter]);
        let moved = engine.evaluate(&id, "T", pos(0.0, 0.1, 1), &zones, 1);
        assert_eq!(kinds(&moved), vec![AlertKind::Enter, AlertKind::Exit]);
        assert_eq!(moved.events[0].zone_name, "Zone b");
        assert_eq!(moved.events[1].zone_name, "Zone a");
    }

    #[test]
    fn test_removed_zone_state_is_dropped() {
        let engine = ContainmentEngine::new(0.02, 0);
        let id = SessionId::new("t1");
        let zones = vec![zone("a", 0.0, 0.0, 1000.0)];

        engine.evaluate(&id, "T", pos(0.0, 0.0, 0), &zones, 1);
        assert_eq!(engine.inside_zones(&id), vec![ZoneId("a".into())]);

        let evaluation = engine.evaluate(&id, "T", pos(0.0, 0.0, 1), &[], 2);
        assert!(evaluation.events.is_empty());
        assert_eq!(evaluation.status, SessionStatus::Safe);
        assert_eq!(evaluation.pruned.as_slice(), &[ZoneId("a".into())]);
        assert!(engine.inside_zones(&id).is_empty());

        // Re-published zone starts from outside again
        let back = engine.evaluate(&id, "T", pos(0.0, 0.0, 2), &zones, 3);
        assert_eq!(kinds(&back), vec![AlertKind::Enter]);
        assert!(back.pruned.is_empty());
    }

    #[test]
    fn test_needs_evaluation_tracks_generation_and_pending() {
        let engine = ContainmentEngine::new(0.02, 5000);
        let center = LatLng::new(12.97, 77.59);
        let zones = vec![zone("z", center.lat, center.lng, 1000.0)];
        let id = SessionId::new("t1");
        assert!(engine.needs_evaluation(&id, 0));

        engine.evaluate(&id, "T", north_of(center, 500.0, 0), &zones, 4);
        assert!(!engine.needs_evaluation(&id, 4));
        assert!(engine.needs_evaluation(&id, 5));

        engine.evaluate(&id, "T", north_of(center, 1010.0, 1_000), &zones, 4);
        assert!(engine.needs_evaluation(&id, 4));
    }

    #[test]
    fn test_forget() {
        let engine = ContainmentEngine::new(0.02, 0);
        let id = SessionId::new("t1");
        engine.evaluate(&id, "T", pos(0.0, 0.0, 0), &[zone("a", 0.0, 0.0, 10.0)], 1);
        assert_eq!(engine.tracked_sessions(), 1);
        engine.forget(&id);
        assert_eq!(engine.tracked_sessions(), 0);
    }
}
