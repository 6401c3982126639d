//! Hazard zone sources and the periodic refresher
//!
//! Zones arrive as a JSON array of `HazardZone` objects, from a local file or
//! an HTTP endpoint. A failed load (I/O, parse, validation) keeps the last
//! good snapshot in the index and is only logged and counted.

use crate::domain::error::ZoneLoadError;
use crate::domain::types::HazardZone;
use crate::infra::metrics::Metrics;
use crate::services::zone_index::ZoneIndex;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ZoneSource: Send + Sync {
    /// Fetch the full current zone set
    async fn load(&self) -> Result<Vec<HazardZone>, ZoneLoadError>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Zones from a JSON file on disk
pub struct FileZoneSource {
    path: String,
}

impl FileZoneSource {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }
}

#[async_trait]
impl ZoneSource for FileZoneSource {
    async fn load(&self) -> Result<Vec<HazardZone>, ZoneLoadError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ZoneLoadError::Io { path: self.path.clone(), source })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path)
    }
}

/// Zones from an HTTP GET endpoint
pub struct HttpZoneSource {
    http: reqwest::Client,
    url: String,
}

impl HttpZoneSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ZoneLoadError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.to_string() })
    }
}

#[async_trait]
impl ZoneSource for HttpZoneSource {
    async fn load(&self) -> Result<Vec<HazardZone>, ZoneLoadError> {
        let response = self.http.get(&self.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Load once and install into the index
pub async fn refresh_once(
    source: &dyn ZoneSource,
    index: &ZoneIndex,
    metrics: &Metrics,
) -> Result<usize, ZoneLoadError> {
    let result = match source.load().await {
        Ok(zones) => index.replace(zones),
        Err(e) => Err(e),
    };
    metrics.record_zone_refresh(result.is_ok());
    match &result {
        Ok(count) => {
            metrics.set_zones_active(*count as u64);
            debug!(source = %source.describe(), zones = %count, "zone_refresh_ok");
        }
        Err(e) => {
            warn!(
                source = %source.describe(),
                error = %e,
                kept_zones = %index.len(),
                "zone_refresh_failed"
            );
        }
    }
    result
}

/// Refresh on start and then every `period` until shutdown
pub async fn run_zone_refresher(
    source: Box<dyn ZoneSource>,
    index: Arc<ZoneIndex>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        source = %source.describe(),
        interval_secs = %period.as_secs(),
        "zone_refresher_started"
    );
    // First tick fires immediately
    let mut tick = interval(period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("zone_refresher_shutdown");
                    return;
                }
            }
            _ = tick.tick() => {
                let _ = refresh_once(source.as_ref(), &index, &metrics).await;
            }
        }
    }
}
