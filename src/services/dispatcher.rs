//! Alert fan-out to the originating session and all admin observers
//!
//! Every session gets a bounded `mpsc` queue drained by its connection's
//! writer task; admins share one `broadcast` channel. Each registration is
//! stamped with a connection id so a stale connection closing after a
//! same-id rejoin cannot tear down its successor's queue. Delivery is
//! best-effort and at-most-once: a full or closed queue drops the message,
//! counts it, and moves on. Nothing here ever awaits a slow client.

use crate::domain::types::{AlertEvent, AlertKind, SessionId, ZoneId};
use crate::infra::metrics::Metrics;
use crate::io::audit::AuditSender;
use crate::io::protocol::{AdminMessage, ServerMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Identifies one registration of a session's outbound queue
pub type ConnectionId = u64;

struct SessionChannel {
    connection: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

pub struct AlertDispatcher {
    sessions: DashMap<SessionId, SessionChannel>,
    next_connection: AtomicU64,
    admin_tx: broadcast::Sender<AdminMessage>,
    /// (session, zone) pairs with an ENTER delivered and no EXIT yet
    announced: DashMap<SessionId, FxHashSet<ZoneId>>,
    client_queue: usize,
    audit: Option<AuditSender>,
    metrics: Arc<Metrics>,
    last_drop_warn: Mutex<Instant>,
}

impl AlertDispatcher {
    pub fn new(
        client_queue: usize,
        admin_queue: usize,
        audit: Option<AuditSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (admin_tx, _) = broadcast::channel(admin_queue.max(1));
        Self {
            sessions: DashMap::new(),
            next_connection: AtomicU64::new(1),
            admin_tx,
            announced: DashMap::new(),
            client_queue: client_queue.max(1),
            audit,
            metrics,
            last_drop_warn: Mutex::new(Instant::now() - Duration::from_secs(2)),
        }
    }

    /// Open the outbound queue for a session, replacing any previous one
    pub fn register(
        &self,
        session_id: &SessionId,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_queue);
        if let Some(old) = self.sessions.insert(session_id.clone(), SessionChannel { connection, tx }) {
            info!(
                session_id = %session_id,
                old_connection = %old.connection,
                connection = %connection,
                "session_channel_replaced"
            );
        }
        (connection, rx)
    }

    /// Close the queue if `connection` still owns it; returns whether it did
    pub fn unregister(&self, session_id: &SessionId, connection: ConnectionId) -> bool {
        self.sessions.remove_if(session_id, |_, ch| ch.connection == connection).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn subscribe_admin(&self) -> broadcast::Receiver<AdminMessage> {
        self.admin_tx.subscribe()
    }

    pub fn admin_count(&self) -> usize {
        self.admin_tx.receiver_count()
    }

    /// Deliver a containment event (ENTER/EXIT)
    ///
    /// Returns false if the event was suppressed as a repeated ENTER.
    pub fn dispatch(&self, event: AlertEvent) -> bool {
        if let Some(zone_id) = &event.zone_id {
            match event.kind {
                AlertKind::Enter => {
                    let fresh = self
                        .announced
                        .entry(event.session_id.clone())
                        .or_default()
                        .insert(zone_id.clone());
                    if !fresh {
                        self.metrics.record_enter_deduplicated();
                        debug!(
                            session_id = %event.session_id,
                            zone = %event.zone_name,
                            "enter_deduplicated"
                        );
                        return false;
                    }
                }
                AlertKind::Exit => {
                    if let Some(mut zones) = self.announced.get_mut(&event.session_id) {
                        zones.remove(zone_id);
                    }
                }
                AlertKind::Sos => {}
            }
        }

        self.metrics.record_alert(event.kind);
        if let Some(audit) = &self.audit {
            audit.record(&event);
        }

        let session_id = event.session_id.clone();
        let personal = match event.kind {
            AlertKind::Exit => ServerMessage::ZoneExit(event.clone()),
            _ => ServerMessage::DangerAlert(event.clone()),
        };
        self.send_to(&session_id, personal);
        self.broadcast_admin(AdminMessage::Alert(event));
        true
    }

    /// Deliver an SOS straight to admins and acknowledge the sender
    pub fn dispatch_sos(&self, event: AlertEvent) {
        info!(
            session_id = %event.session_id,
            name = %event.display_name,
            has_location = %event.location.is_some(),
            "sos_dispatched"
        );
        self.metrics.record_alert(AlertKind::Sos);
        if let Some(audit) = &self.audit {
            audit.record(&event);
        }

        let session_id = event.session_id.clone();
        let alert_id = event.alert_id.clone();
        self.broadcast_admin(AdminMessage::Sos(event));
        self.send_to(&session_id, ServerMessage::SosAcknowledged { alert_id });
    }

    /// Non-blocking push to one session; returns true if queued
    pub fn send_to(&self, session_id: &SessionId, message: ServerMessage) -> bool {
        let Some(tx) = self.sessions.get(session_id).map(|ch| ch.tx.clone()) else {
            self.record_drop(session_id, "no_channel");
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.record_drop(session_id, "queue_full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop(session_id, "channel_closed");
                false
            }
        }
    }

    /// Push to every admin observer; silently a no-op with no admins
    pub fn broadcast_admin(&self, message: AdminMessage) {
        // Err only means nobody is subscribed
        let _ = self.admin_tx.send(message);
    }

    /// Clear channel and dedup state for a departed connection
    ///
    /// A no-op returning false when a newer connection owns the session.
    pub fn forget(&self, session_id: &SessionId, connection: ConnectionId) -> bool {
        if !self.unregister(session_id, connection) {
            return false;
        }
        self.announced.remove(session_id);
        true
    }

    /// Clear dedup state only; the session's channel stays open
    pub fn clear_announced(&self, session_id: &SessionId) {
        self.announced.remove(session_id);
    }

    /// Drop announced pairs for zones that no longer exist
    pub fn retract(&self, session_id: &SessionId, zones: &[ZoneId]) {
        if zones.is_empty() {
            return;
        }
        if let Some(mut announced) = self.announced.get_mut(session_id) {
            for zone_id in zones {
                announced.remove(zone_id);
            }
        }
    }

    fn record_drop(&self, session_id: &SessionId, reason: &'static str) {
        self.metrics.record_delivery_dropped();
        let mut last = self.last_drop_warn.lock();
        if last.elapsed() > Duration::from_secs(1) {
            warn!(session_id = %session_id, reason = %reason, "alert_dropped");
            *last = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{HazardZone, LatLng, Position, Severity};

    fn dispatcher(client_queue: usize) -> (AlertDispatcher, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (AlertDispatcher::new(client_queue, 16, None, metrics.clone()), metrics)
    }

    fn zone(id: &str) -> HazardZone {
        HazardZone {
            zone_id: ZoneId(id.to_string()),
            name: format!("Zone {id}"),
            center: LatLng::new(0.0, 0.0),
            radius_meters: 100.0,
            severity: Severity::Critical,
        }
    }

    fn event(kind: AlertKind, session: &SessionId, zone_id: &str) -> AlertEvent {
        AlertEvent::zone_transition(
            kind,
            session.clone(),
            "Tess",
            &zone(zone_id),
            Position::new(0.0, 0.0, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_enter_reaches_session_and_admin() {
        let (dispatcher, metrics) = dispatcher(8);
        let id = SessionId::new("s1");
        let (_, mut rx) = dispatcher.register(&id);
        let mut admin = dispatcher.subscribe_admin();

        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));

        match rx.recv().await.unwrap() {
            ServerMessage::DangerAlert(e) => assert_eq!(e.zone_name, "Zone z"),
            other => panic!("unexpected {other:?}"),
        }
        match admin.recv().await.unwrap() {
            AdminMessage::Alert(e) => assert_eq!(e.kind, AlertKind::Enter),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(metrics.report().alerts_enter, 1);
    }

    #[tokio::test]
    async fn test_repeated_enter_is_deduplicated_until_exit() {
        let (dispatcher, metrics) = dispatcher(8);
        let id = SessionId::new("s1");
        let (_, mut rx) = dispatcher.register(&id);

        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert!(!dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "other")));
        assert!(dispatcher.dispatch(event(AlertKind::Exit, &id, "z")));
        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert_eq!(metrics.enters_deduplicated(), 1);

        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(match msg {
                ServerMessage::DangerAlert(_) => "danger",
                ServerMessage::ZoneExit(_) => "exit",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["danger", "danger", "exit", "danger"]);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (dispatcher, metrics) = dispatcher(1);
        let id = SessionId::new("s1");
        let (_, _rx) = dispatcher.register(&id);

        assert!(dispatcher.send_to(&id, ServerMessage::error("one")));
        assert!(!dispatcher.send_to(&id, ServerMessage::error("two")));
        assert_eq!(metrics.deliveries_dropped(), 1);
    }

    #[test]
    fn test_closed_or_missing_channel_counts_drop() {
        let (dispatcher, metrics) = dispatcher(4);
        let id = SessionId::new("s1");
        drop(dispatcher.register(&id).1);

        assert!(!dispatcher.send_to(&id, ServerMessage::error("gone")));
        assert!(!dispatcher.send_to(&SessionId::new("nobody"), ServerMessage::error("x")));
        assert_eq!(metrics.deliveries_dropped(), 2);
    }

    #[tokio::test]
    async fn test_sos_goes_to_admin_and_acknowledges() {
        let (dispatcher, _) = dispatcher(4);
        let id = SessionId::new("s1");
        let (_, mut rx) = dispatcher.register(&id);
        let mut admin = dispatcher.subscribe_admin();

        let sos = AlertEvent::sos(id.clone(), "Tess", None, Some("lost".into()), 5);
        let alert_id = sos.alert_id.clone();
        dispatcher.dispatch_sos(sos);

        match admin.recv().await.unwrap() {
            AdminMessage::Sos(e) => assert_eq!(e.message.as_deref(), Some("lost")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::SosAcknowledged { alert_id });
    }

    #[test]
    fn test_forget_clears_dedup_state() {
        let (dispatcher, _) = dispatcher(4);
        let id = SessionId::new("s1");
        let (connection, _rx) = dispatcher.register(&id);

        dispatcher.dispatch(event(AlertKind::Enter, &id, "z"));
        assert!(dispatcher.forget(&id, connection));
        assert!(!dispatcher.is_registered(&id));
        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
    }

    #[test]
    fn test_unregister_keeps_dedup_and_admins_are_counted() {
        let (dispatcher, _) = dispatcher(4);
        let id = SessionId::new("s1");
        let (connection, _rx) = dispatcher.register(&id);
        assert_eq!(dispatcher.admin_count(), 0);
        let _admin = dispatcher.subscribe_admin();
        assert_eq!(dispatcher.admin_count(), 1);

        dispatcher.dispatch(event(AlertKind::Enter, &id, "z"));
        assert!(dispatcher.unregister(&id, connection));
        assert!(!dispatcher.is_registered(&id));
        assert!(!dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_drop_successor() {
        let (dispatcher, _) = dispatcher(4);
        let id = SessionId::new("s1");
        let (old, mut old_rx) = dispatcher.register(&id);
        let (new, mut new_rx) = dispatcher.register(&id);
        assert_ne!(old, new);

        // Old queue was replaced, so its writer sees the channel close
        assert!(old_rx.recv().await.is_none());

        assert!(!dispatcher.forget(&id, old));
        assert!(dispatcher.is_registered(&id));
        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert!(matches!(new_rx.recv().await, Some(ServerMessage::DangerAlert(_))));

        assert!(dispatcher.forget(&id, new));
        assert!(!dispatcher.is_registered(&id));
    }

    #[test]
    fn test_retract_allows_fresh_enter() {
        let (dispatcher, metrics) = dispatcher(8);
        let id = SessionId::new("s1");
        let (_, _rx) = dispatcher.register(&id);

        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "keep")));
        dispatcher.retract(&id, &[ZoneId("z".into())]);

        assert!(dispatcher.dispatch(event(AlertKind::Enter, &id, "z")));
        assert!(!dispatcher.dispatch(event(AlertKind::Enter, &id, "keep")));
        assert_eq!(metrics.enters_deduplicated(), 1);
    }
}
