//! Hazard zone snapshot shared by all containment evaluations
//!
//! Readers clone an `Arc` under a short read lock and then work lock-free on
//! an immutable slice. A refresh validates the whole set first and swaps it
//! in one step; a rejected set leaves the previous snapshot in place.
//!
//! Every successful swap bumps a generation number so callers can tell
//! whether a position was last evaluated against the current set.

use crate::domain::error::ZoneLoadError;
use crate::domain::geo::distance_meters;
use crate::domain::types::{HazardZone, LatLng};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::info;

pub type ZoneSnapshot = Arc<[HazardZone]>;

pub struct ZoneIndex {
    /// Zone list and the generation it was installed at
    zones: RwLock<(ZoneSnapshot, u64)>,
}

impl ZoneIndex {
    /// Empty index (no hazards configured)
    pub fn new() -> Self {
        Self { zones: RwLock::new((Arc::from(Vec::new()), 0)) }
    }

    /// Index pre-loaded with a validated zone set
    pub fn with_zones(zones: Vec<HazardZone>) -> Result<Self, ZoneLoadError> {
        let index = Self::new();
        index.replace(zones)?;
        Ok(index)
    }

    /// Current immutable zone list
    #[inline]
    pub fn snapshot(&self) -> ZoneSnapshot {
        self.zones.read().0.clone()
    }

    /// Current zone list together with its generation
    #[inline]
    pub fn versioned_snapshot(&self) -> (ZoneSnapshot, u64) {
        let guard = self.zones.read();
        (guard.0.clone(), guard.1)
    }

    pub fn len(&self) -> usize {
        self.zones.read().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zones whose circle contains `point`, paired with the distance to center
    pub fn containing(&self, point: LatLng) -> Vec<(HazardZone, f64)> {
        self.snapshot()
            .iter()
            .filter_map(|zone| {
                let d = distance_meters(point, zone.center);
                (d <= zone.radius_meters).then(|| (zone.clone(), d))
            })
            .collect()
    }

    /// Validate and atomically install a new zone set
    pub fn replace(&self, zones: Vec<HazardZone>) -> Result<usize, ZoneLoadError> {
        validate_zones(&zones)?;
        let count = zones.len();
        let generation = {
            let mut guard = self.zones.write();
            let generation = guard.1 + 1;
            *guard = (Arc::from(zones), generation);
            generation
        };
        info!(zones = %count, generation = %generation, "zone_snapshot_replaced");
        Ok(count)
    }
}

impl Default for ZoneIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject the whole set if any zone is malformed
pub fn validate_zones(zones: &[HazardZone]) -> Result<(), ZoneLoadError> {
    let mut seen = FxHashSet::default();
    for zone in zones {
        if !zone.radius_meters.is_finite() || zone.radius_meters <= 0.0 {
            return Err(ZoneLoadError::InvalidRadius {
                zone_id: zone.zone_id.clone(),
                radius: zone.radius_meters,
            });
        }
        zone.center.validate().map_err(|source| ZoneLoadError::InvalidCenter {
            zone_id: zone.zone_id.clone(),
            source,
        })?;
        if !seen.insert(&zone.zone_id) {
            return Err(ZoneLoadError::DuplicateId(zone.zone_id.clone()));
        }
    }
    Ok(())
}
