//! End-to-end engine flow: joins, zone alerts, nearby travelers, SOS, audit trail

use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};
use tokio::sync::{broadcast, mpsc, watch};
use trailguard::domain::types::{
    AlertKind, HazardZone, LatLng, SessionStatus, Severity, TimestampValue, ZoneId,
};
use trailguard::infra::{Config, Metrics};
use trailguard::io::protocol::{AdminMessage, Role, ServerMessage};
use trailguard::io::{create_audit_channel, run_audit_writer, AuditLog};
use trailguard::services::engine::UpdateOutcome;
use trailguard::services::{AlertDispatcher, SafetyEngine, ZoneIndex};

fn config_without_dwell() -> Config {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[containment]\nmin_dwell_ms = 0\n\n[proximity]\nradius_m = 5000.0\n")
        .unwrap();
    file.flush().unwrap();
    Config::from_file(file.path()).unwrap()
}

fn lake_zone() -> HazardZone {
    HazardZone {
        zone_id: ZoneId("lake".to_string()),
        name: "Lake Edge".to_string(),
        center: LatLng::new(12.9763, 77.5929),
        radius_meters: 150.0,
        severity: Severity::Medium,
    }
}

fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn drain_admin(rx: &mut broadcast::Receiver<AdminMessage>) -> Vec<AdminMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn ts(ms: u64) -> TimestampValue {
    TimestampValue::EpochMs(ms)
}

#[tokio::test]
async fn test_tourist_walks_through_zone_and_raises_sos() {
    let dir = tempdir().unwrap();
    let audit_path = dir.path().join("alerts.jsonl");

    let metrics = Arc::new(Metrics::new());
    let (audit_sender, audit_rx) = create_audit_channel(64, metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer = tokio::spawn(run_audit_writer(
        AuditLog::new(audit_path.to_str().unwrap()),
        audit_rx,
        shutdown_rx,
    ));

    let zones = Arc::new(ZoneIndex::with_zones(vec![lake_zone()]).unwrap());
    let dispatcher = Arc::new(AlertDispatcher::new(64, 64, Some(audit_sender), metrics.clone()));
    let mut admin_rx = dispatcher.subscribe_admin();
    let engine = SafetyEngine::new(config_without_dwell(), zones, dispatcher, metrics.clone());

    let mut tess = engine.join(Some("tess"), "Tess", Role::Tourist);
    let mut omar = engine.join(Some("omar"), "Omar", Role::Tourist);
    drain(&mut tess.outbound);
    drain(&mut omar.outbound);

    // Omar waits outside the zone, about 1.1 km north
    engine.handle_location_update(&omar.session_id, "Omar", 12.9863, 77.5929, &ts(1_000)).unwrap();
    drain(&mut omar.outbound);

    // Tess walks into the lake perimeter
    let outcome = engine
        .handle_location_update(&tess.session_id, "Tess", 12.9763, 77.5930, &ts(2_000))
        .unwrap();
    assert!(matches!(
        outcome,
        UpdateOutcome::Processed { status: SessionStatus::Alerted, alerts: 1, nearby: 1 }
    ));

    let messages = drain(&mut tess.outbound);
    assert!(matches!(&messages[0], ServerMessage::DangerAlert(e) if e.zone_name == "Lake Edge"));
    let nearby = messages
        .iter()
        .find_map(|m| match m {
            ServerMessage::NearbyTourists { tourists } => Some(tourists),
            _ => None,
        })
        .unwrap();
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].display_name, "Omar");
    assert!(nearby[0].distance_meters > 1000.0 && nearby[0].distance_meters < 1200.0);

    // Repeating the report does not re-alert
    let repeat = engine
        .handle_location_update(&tess.session_id, "Tess", 12.9763, 77.5930, &ts(3_000))
        .unwrap();
    assert_eq!(repeat, UpdateOutcome::Duplicate);

    // Walk out
    engine
        .handle_location_update(&tess.session_id, "Tess", 12.9800, 77.5929, &ts(4_000))
        .unwrap();
    let messages = drain(&mut tess.outbound);
    assert!(matches!(&messages[0], ServerMessage::ZoneExit(e) if e.kind == AlertKind::Exit));

    // SOS with no explicit location falls back to the last known fix
    let alert_id = engine.handle_sos(&tess.session_id, "Tess", None, Some("twisted ankle".into())).unwrap();
    let messages = drain(&mut tess.outbound);
    assert!(messages.contains(&ServerMessage::SosAcknowledged { alert_id: alert_id.clone() }));

    let admin = drain_admin(&mut admin_rx);
    let sos = admin
        .iter()
        .find_map(|m| match m {
            AdminMessage::Sos(event) => Some(event),
            _ => None,
        })
        .unwrap();
    assert_eq!(sos.alert_id, alert_id);
    assert_eq!(sos.location.unwrap().latitude, 12.9800);
    let admin_alerts = admin.iter().filter(|m| matches!(m, AdminMessage::Alert(_))).count();
    assert_eq!(admin_alerts, 2);

    engine.disconnect(&tess.session_id, tess.connection, Role::Tourist);
    engine.disconnect(&omar.session_id, omar.connection, Role::Tourist);
    assert_eq!(engine.active_sessions(), 0);

    // Shutdown drains the queued audit records even though the engine still holds a sender
    shutdown_tx.send(true).unwrap();
    writer.await.unwrap();

    let lines: Vec<serde_json::Value> = fs::read_to_string(&audit_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let kinds: Vec<&str> = lines.iter().map(|l| l["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["ENTER", "EXIT", "SOS"]);
    assert_eq!(lines[2]["message"], "twisted ankle");
}

#[tokio::test]
async fn test_invalid_coordinates_leave_state_untouched() {
    let metrics = Arc::new(Metrics::new());
    let zones = Arc::new(ZoneIndex::with_zones(vec![lake_zone()]).unwrap());
    let dispatcher = Arc::new(AlertDispatcher::new(16, 16, None, metrics.clone()));
    let engine = SafetyEngine::new(config_without_dwell(), zones, dispatcher, metrics);

    let tess = engine.join(Some("tess"), "Tess", Role::Tourist);
    assert!(engine
        .handle_location_update(&tess.session_id, "Tess", 95.0, 77.0, &ts(1_000))
        .is_err());
    assert!(engine
        .handle_location_update(&tess.session_id, "Tess", f64::NAN, 77.0, &ts(1_000))
        .is_err());

    let sessions = engine.sessions_snapshot();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].last_position.is_none());
    assert_eq!(sessions[0].status, SessionStatus::Safe);
}
