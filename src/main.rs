//! Trailguard - live safety engine for tourist sessions
//!
//! Tracks tourist positions against hazard zones, pushes danger and SOS
//! alerts to tourists and admin observers, and optimizes visit routes.
//!
//! Module structure:
//! - `domain/` - Core types (sessions, zones, alerts, geometry)
//! - `io/` - External interfaces (client listener, HTTP API, audit log)
//! - `services/` - Business logic (engine, containment, dispatcher, optimizer)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use trailguard::infra::{Config, Metrics};
use trailguard::io::{
    create_audit_channel, run_audit_writer, start_client_listener, start_http_server, ApiState,
    AuditLog,
};
use trailguard::services::zone_source::{
    run_zone_refresher, FileZoneSource, HttpZoneSource, ZoneSource,
};
use trailguard::services::{AlertDispatcher, OptimizerPool, SafetyEngine, ZoneIndex};

/// Trailguard - tourist safety engine
#[derive(Parser, Debug)]
#[command(name = "trailguard", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Audit channel depth
const AUDIT_BUFFER: usize = 1000;

/// Upper bound on waiting for queued audit records at shutdown
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-update visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "trailguard starting");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        bind_address = %config.bind_address(),
        client_port = %config.client_port(),
        http_port = %config.http_port(),
        session_ttl_secs = %config.session_ttl().as_secs(),
        hysteresis_ratio = %config.hysteresis_ratio(),
        min_dwell_ms = %config.min_dwell_ms(),
        proximity_radius_m = %config.proximity_radius_m(),
        zones_file = ?config.zones_file(),
        zones_url = ?config.zones_url(),
        optimizer_workers = %config.optimizer_workers(),
        audit_enabled = %config.audit_enabled(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Audit trail (writer drains its queue on shutdown)
    let (audit, audit_writer) = if config.audit_enabled() {
        let (sender, rx) = create_audit_channel(AUDIT_BUFFER, metrics.clone());
        let log = AuditLog::new(config.audit_file());
        let writer = tokio::spawn(run_audit_writer(log, rx, shutdown_rx.clone()));
        (Some(sender), Some(writer))
    } else {
        (None, None)
    };

    // Zones start empty and fill on the first refresh
    let zones = Arc::new(ZoneIndex::new());
    let source: Option<Box<dyn ZoneSource>> = match (config.zones_url(), config.zones_file()) {
        (Some(url), _) => Some(Box::new(
            HttpZoneSource::new(url, config.zone_timeout()).context("building zone http client")?,
        )),
        (None, Some(path)) => Some(Box::new(FileZoneSource::new(path))),
        (None, None) => None,
    };
    match source {
        Some(source) => {
            tokio::spawn(run_zone_refresher(
                source,
                zones.clone(),
                metrics.clone(),
                config.zone_refresh_interval(),
                shutdown_rx.clone(),
            ));
        }
        None => info!("zone_source_not_configured"),
    }

    let dispatcher = Arc::new(AlertDispatcher::new(
        config.client_queue(),
        config.admin_queue(),
        audit,
        metrics.clone(),
    ));
    let engine = Arc::new(SafetyEngine::new(
        config.clone(),
        zones,
        dispatcher,
        metrics.clone(),
    ));

    tokio::spawn(engine.clone().run_sweeper(shutdown_rx.clone()));

    let optimizer = Arc::new(
        OptimizerPool::new(config.optimizer_workers(), config.optimizer().clone(), metrics.clone())
            .context("starting optimizer pool")?,
    );

    // Live client channel
    let listener_engine = engine.clone();
    let listener_shutdown = shutdown_rx.clone();
    let bind_address = config.bind_address().to_string();
    let client_port = config.client_port();
    tokio::spawn(async move {
        if let Err(e) =
            start_client_listener(bind_address, client_port, listener_engine, listener_shutdown).await
        {
            error!(error = %e, "client listener error");
        }
    });

    // HTTP API (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let state = ApiState {
            engine: engine.clone(),
            optimizer,
            metrics: metrics.clone(),
            site_id: Arc::from(config.site_id()),
        };
        let bind_address = config.bind_address().to_string();
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(bind_address, http_port, state, http_shutdown).await {
                error!(error = %e, "http api error");
            }
        });
    }

    // Periodic metrics report
    let reporter_engine = engine.clone();
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        // Skip the immediate first tick
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reporter_engine.sample_gauges();
                    reporter_metrics.report().log();
                }
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Give connection tasks a moment to flush
    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(writer) = audit_writer {
        match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "audit_writer_failed"),
            Err(_) => warn!("audit_drain_timed_out"),
        }
    }

    info!(sessions = %engine.active_sessions(), "trailguard shutdown complete");
    Ok(())
}
