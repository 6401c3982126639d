//! Integration tests for configuration loading

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use trailguard::infra::{Config, SeedStrategy};

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[server]
bind_address = "127.0.0.1"
client_port = 9400
http_port = 0

[sessions]
ttl_secs = 120
duplicate_epsilon_m = 1.0

[containment]
hysteresis_ratio = 0.05
min_dwell_ms = 2500

[proximity]
radius_m = 500.0

[zones]
url = "http://zones.internal/active"
refresh_interval_secs = 15

[optimizer]
workers = 3
seed_strategy = "input_order"
rng_seed = 42

[audit]
enabled = false

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.client_port(), 9400);
    assert_eq!(config.http_port(), 0);
    assert_eq!(config.session_ttl(), Duration::from_secs(120));
    assert_eq!(config.hysteresis_ratio(), 0.05);
    assert_eq!(config.min_dwell_ms(), 2500);
    assert_eq!(config.proximity_radius_m(), 500.0);
    assert_eq!(config.zones_url(), Some("http://zones.internal/active"));
    assert_eq!(config.zone_refresh_interval(), Duration::from_secs(15));
    assert_eq!(config.optimizer_workers(), 3);
    assert_eq!(config.optimizer().seed_strategy, SeedStrategy::InputOrder);
    assert_eq!(config.optimizer().rng_seed, Some(42));
    assert!(!config.audit_enabled());
    assert_eq!(config.metrics_interval(), Duration::from_secs(15));
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[server\nclient_port = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.site_id(), "trailguard");
    assert_eq!(config.client_port(), 7400);
    assert_eq!(config.min_dwell_ms(), 5000);
    assert_eq!(config.config_file(), "default");
}
