//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

/// How the optimizer picks its starting tour
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    /// Start from the order the caller supplied
    InputOrder,
    /// Greedy nearest-neighbour tour from waypoint 0, if shorter than the input
    NearestNeighbor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier used as a metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "trailguard".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Persistent client channel port (newline-delimited JSON)
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// HTTP API port (optimize, zones, sessions, metrics); 0 to disable
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Per-connection outbound queue size
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
    /// Admin broadcast channel capacity
    #[serde(default = "default_admin_queue")]
    pub admin_queue: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_client_port() -> u16 {
    7400
}

fn default_http_port() -> u16 {
    7480
}

fn default_client_queue() -> usize {
    64
}

fn default_admin_queue() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            client_port: default_client_port(),
            http_port: default_http_port(),
            client_queue: default_client_queue(),
            admin_queue: default_admin_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Sessions silent for longer than this are removed
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Updates closer than this to the previous position are duplicates
    #[serde(default = "default_duplicate_epsilon_m")]
    pub duplicate_epsilon_m: f64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_duplicate_epsilon_m() -> f64 {
    0.5
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            duplicate_epsilon_m: default_duplicate_epsilon_m(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainmentConfig {
    /// Half-width of the boundary band as a fraction of zone radius
    #[serde(default = "default_hysteresis_ratio")]
    pub hysteresis_ratio: f64,
    /// How long a contrary reading inside the band must persist before flipping
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: u64,
}

fn default_hysteresis_ratio() -> f64 {
    0.02
}

fn default_min_dwell_ms() -> u64 {
    5000
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self { hysteresis_ratio: default_hysteresis_ratio(), min_dwell_ms: default_min_dwell_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    #[serde(default = "default_proximity_radius_m")]
    pub radius_m: f64,
}

fn default_proximity_radius_m() -> f64 {
    2000.0
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self { radius_m: default_proximity_radius_m() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZonesConfig {
    /// JSON file with zone definitions
    #[serde(default)]
    pub file: Option<String>,
    /// HTTP endpoint returning zone definitions (takes precedence over file)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_zone_refresh_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_zone_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_zone_refresh_secs() -> u64 {
    60
}

fn default_zone_timeout_ms() -> u64 {
    3000
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            file: None,
            url: None,
            refresh_interval_secs: default_zone_refresh_secs(),
            timeout_ms: default_zone_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Temperature steps before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Neighbour trials evaluated at each temperature
    #[serde(default = "default_moves_per_temperature")]
    pub moves_per_temperature: u32,
    /// Geometric cooling factor applied per temperature step
    #[serde(default = "default_cooling_rate")]
    pub cooling_rate: f64,
    /// T0 as a fraction of the starting tour distance
    #[serde(default = "default_initial_temperature_ratio")]
    pub initial_temperature_ratio: f64,
    /// Search stops once temperature drops below this (meters)
    #[serde(default = "default_min_temperature")]
    pub min_temperature: f64,
    /// Wall-clock budget per request
    #[serde(default = "default_optimizer_timeout_ms")]
    pub timeout_ms: u64,
    /// Worker threads; 0 means one per core
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_seed_strategy")]
    pub seed_strategy: SeedStrategy,
    /// Fixed RNG seed for reproducible plans
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Largest accepted waypoint list
    #[serde(default = "default_max_waypoints")]
    pub max_waypoints: usize,
}

fn default_max_iterations() -> u32 {
    2000
}

fn default_moves_per_temperature() -> u32 {
    100
}

fn default_cooling_rate() -> f64 {
    0.98
}

fn default_initial_temperature_ratio() -> f64 {
    0.1
}

fn default_min_temperature() -> f64 {
    0.01
}

fn default_optimizer_timeout_ms() -> u64 {
    2000
}

fn default_seed_strategy() -> SeedStrategy {
    SeedStrategy::NearestNeighbor
}

fn default_max_waypoints() -> usize {
    200
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            moves_per_temperature: default_moves_per_temperature(),
            cooling_rate: default_cooling_rate(),
            initial_temperature_ratio: default_initial_temperature_ratio(),
            min_temperature: default_min_temperature(),
            timeout_ms: default_optimizer_timeout_ms(),
            workers: 0,
            seed_strategy: default_seed_strategy(),
            rng_seed: None,
            max_waypoints: default_max_waypoints(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// File path for alert audit log (JSONL format)
    #[serde(default = "default_audit_file")]
    pub file: String,
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_file() -> String {
    "alerts.jsonl".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: default_audit_enabled(), file: default_audit_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub containment: ContainmentConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    client_port: u16,
    http_port: u16,
    client_queue: usize,
    admin_queue: usize,
    session_ttl_secs: u64,
    sweep_interval_secs: u64,
    duplicate_epsilon_m: f64,
    hysteresis_ratio: f64,
    min_dwell_ms: u64,
    proximity_radius_m: f64,
    zones_file: Option<String>,
    zones_url: Option<String>,
    zone_refresh_interval_secs: u64,
    zone_timeout_ms: u64,
    optimizer: OptimizerConfig,
    audit_enabled: bool,
    audit_file: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(
            TomlConfig {
                site: SiteConfig::default(),
                server: ServerConfig::default(),
                sessions: SessionsConfig::default(),
                containment: ContainmentConfig::default(),
                proximity: ProximityConfig::default(),
                zones: ZonesConfig::default(),
                optimizer: OptimizerConfig::default(),
                audit: AuditConfig::default(),
                metrics: MetricsConfig::default(),
            },
            "default".to_string(),
        )
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            client_port: toml_config.server.client_port,
            http_port: toml_config.server.http_port,
            client_queue: toml_config.server.client_queue.max(1),
            admin_queue: toml_config.server.admin_queue.max(1),
            session_ttl_secs: toml_config.sessions.ttl_secs,
            sweep_interval_secs: toml_config.sessions.sweep_interval_secs.max(1),
            duplicate_epsilon_m: toml_config.sessions.duplicate_epsilon_m,
            hysteresis_ratio: toml_config.containment.hysteresis_ratio,
            min_dwell_ms: toml_config.containment.min_dwell_ms,
            proximity_radius_m: toml_config.proximity.radius_m,
            zones_file: toml_config.zones.file,
            zones_url: toml_config.zones.url,
            zone_refresh_interval_secs: toml_config.zones.refresh_interval_secs.max(1),
            zone_timeout_ms: toml_config.zones.timeout_ms,
            optimizer: toml_config.optimizer,
            audit_enabled: toml_config.audit.enabled,
            audit_file: toml_config.audit.file,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file,
        }
    }

    /// Determine config file path from the `--config` value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path.filter(|p| !p.is_empty()) {
            return path.to_string();
        }

        match env::var("CONFIG_FILE") {
            Ok(path) if !path.is_empty() => path,
            _ => DEFAULT_CONFIG_PATH.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(cli_path: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli_path))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn client_queue(&self) -> usize {
        self.client_queue
    }

    pub fn admin_queue(&self) -> usize {
        self.admin_queue
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_ttl_ms(&self) -> u64 {
        self.session_ttl_secs * 1000
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn duplicate_epsilon_m(&self) -> f64 {
        self.duplicate_epsilon_m
    }

    pub fn hysteresis_ratio(&self) -> f64 {
        self.hysteresis_ratio
    }

    pub fn min_dwell_ms(&self) -> u64 {
        self.min_dwell_ms
    }

    pub fn proximity_radius_m(&self) -> f64 {
        self.proximity_radius_m
    }

    pub fn zones_file(&self) -> Option<&str> {
        self.zones_file.as_deref()
    }

    pub fn zones_url(&self) -> Option<&str> {
        self.zones_url.as_deref()
    }

    pub fn zone_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.zone_refresh_interval_secs)
    }

    pub fn zone_timeout(&self) -> Duration {
        Duration::from_millis(self.zone_timeout_ms)
    }

    pub fn optimizer(&self) -> &OptimizerConfig {
        &self.optimizer
    }

    /// Optimizer worker count, resolving 0 to the number of cores
    pub fn optimizer_workers(&self) -> usize {
        if self.optimizer.workers == 0 {
            num_cpus::get()
        } else {
            self.optimizer.workers
        }
    }

    pub fn audit_enabled(&self) -> bool {
        self.audit_enabled
    }

    pub fn audit_file(&self) -> &str {
        &self.audit_file
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set min_dwell_ms
    #[cfg(test)]
    pub fn with_min_dwell_ms(mut self, ms: u64) -> Self {
        self.min_dwell_ms = ms;
        self
    }

    /// Builder method for tests to set the session TTL
    #[cfg(test)]
    pub fn with_session_ttl_secs(mut self, secs: u64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "trailguard");
        assert_eq!(config.client_port(), 7400);
        assert_eq!(config.http_port(), 7480);
        assert_eq!(config.session_ttl(), Duration::from_secs(300));
        assert_eq!(config.hysteresis_ratio(), 0.02);
        assert_eq!(config.min_dwell_ms(), 5000);
        assert_eq!(config.proximity_radius_m(), 2000.0);
        assert_eq!(config.optimizer().seed_strategy, SeedStrategy::NearestNeighbor);
        assert!(config.zones_file().is_none());
    }

    #[test]
    fn test_optimizer_workers_resolves_zero() {
        let config = Config::default();
        assert!(config.optimizer_workers() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[containment]
min_dwell_ms = 1500

[optimizer]
seed_strategy = "input_order"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.min_dwell_ms(), 1500);
        assert_eq!(config.hysteresis_ratio(), 0.02);
        assert_eq!(config.optimizer().seed_strategy, SeedStrategy::InputOrder);
        assert_eq!(config.optimizer().cooling_rate, 0.98);
    }

    #[test]
    fn test_resolve_config_path_precedence() {
        // Only test in this binary touching CONFIG_FILE
        env::remove_var("CONFIG_FILE");
        assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        assert_eq!(Config::resolve_config_path(Some("config/prod.toml")), "config/prod.toml");

        env::set_var("CONFIG_FILE", "config/goa.toml");
        assert_eq!(Config::resolve_config_path(None), "config/goa.toml");
        assert_eq!(Config::resolve_config_path(Some("config/prod.toml")), "config/prod.toml");

        env::set_var("CONFIG_FILE", "");
        assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        env::remove_var("CONFIG_FILE");
    }

    #[test]
    fn test_audit_file_default() {
        let audit = AuditConfig::default();
        assert_eq!(audit.file, "alerts.jsonl");
        assert_eq!(Config::default().audit_file(), "alerts.jsonl");
    }
}
