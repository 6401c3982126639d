//! Live client channel over TCP
//!
//! Each connection speaks JSON lines (see `protocol`). The first accepted
//! message must be a `join`; after that the reader feeds the engine and a
//! writer task drains the connection's outbound queue plus, for admins, the
//! admin broadcast.
//!
//! Lines longer than `MAX_LINE_BYTES` are discarded up to the next newline
//! and answered with an `error`.

use crate::domain::types::SessionId;
use crate::io::protocol::{to_line, AdminMessage, ClientMessage, Role, ServerMessage};
use crate::services::engine::SafetyEngine;
use futures::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Longest accepted client line
pub const MAX_LINE_BYTES: usize = 16 * 1024;

type Lines = FramedRead<OwnedReadHalf, LinesCodec>;

/// One read from the client
enum Inbound {
    Line(String),
    /// Over-long line, already discarded
    TooLong,
}

/// Start the client TCP listener
pub async fn start_client_listener(
    bind_address: String,
    port: u16,
    engine: Arc<SafetyEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "client_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("client_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let engine = engine.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, peer, engine, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "client_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> std::io::Result<()> {
    match to_line(message) {
        Some(mut line) => {
            line.push('\n');
            writer.write_all(line.as_bytes()).await
        }
        None => Ok(()),
    }
}

/// Next line, or None on EOF, read error or shutdown
async fn next_line(lines: &mut Lines, shutdown: &mut watch::Receiver<bool>) -> Option<Inbound> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return None;
                }
            }
            line = lines.next() => {
                return match line {
                    Some(Ok(line)) => Some(Inbound::Line(line)),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Some(Inbound::TooLong),
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!(error = %e, "client_read_failed");
                        None
                    }
                    None => None,
                };
            }
        }
    }
}

fn line_too_long() -> ServerMessage {
    ServerMessage::error(format!("line exceeds {MAX_LINE_BYTES} bytes"))
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    engine: Arc<SafetyEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(peer = %peer, "client_connection_accepted");

    let (read_half, mut write_half) = socket.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    // Nothing is routed to the connection until it joins
    let (joined, role) = loop {
        let line = match next_line(&mut lines, &mut shutdown).await {
            Some(Inbound::Line(line)) => line,
            Some(Inbound::TooLong) => {
                warn!(peer = %peer, "client_line_too_long");
                if write_line(&mut write_half, &line_too_long()).await.is_err() {
                    return;
                }
                continue;
            }
            None => {
                debug!(peer = %peer, "client_closed_before_join");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match ClientMessage::parse(&line) {
            Ok(ClientMessage::Join { session_id, name, role }) => {
                break (engine.join(session_id.as_deref(), &name, role), role);
            }
            Ok(_) => ServerMessage::error("join required before other messages"),
            Err(e) => ServerMessage::error(e.to_string()),
        };
        if write_line(&mut write_half, &reply).await.is_err() {
            return;
        }
    };

    let session_id = joined.session_id;
    let display_name = joined.display_name;
    let connection = joined.connection;
    let admin_rx = (role == Role::Admin).then(|| {
        let rx = engine.dispatcher().subscribe_admin();
        info!(
            session_id = %session_id,
            admins = %engine.dispatcher().admin_count(),
            "admin_subscribed"
        );
        rx
    });
    let writer = tokio::spawn(run_writer(
        write_half,
        joined.outbound,
        admin_rx,
        session_id.clone(),
    ));

    while let Some(inbound) = next_line(&mut lines, &mut shutdown).await {
        let line = match inbound {
            Inbound::Line(line) => line,
            Inbound::TooLong => {
                warn!(session_id = %session_id, "client_line_too_long");
                engine.dispatcher().send_to(&session_id, line_too_long());
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match ClientMessage::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "client_message_malformed");
                reply_error(&engine, &session_id, e.to_string());
                continue;
            }
        };

        match message {
            ClientMessage::Leave => break,
            ClientMessage::Join { .. } => {
                reply_error(&engine, &session_id, "already joined");
            }
            ClientMessage::UpdateLocation { .. } | ClientMessage::SosSignal { .. }
                if role == Role::Admin =>
            {
                reply_error(&engine, &session_id, "admin connections cannot report location");
            }
            ClientMessage::UpdateLocation { lat, lng, timestamp } => {
                if let Err(e) =
                    engine.handle_location_update(&session_id, &display_name, lat, lng, &timestamp)
                {
                    reply_error(&engine, &session_id, e.to_string());
                }
            }
            ClientMessage::SosSignal { location, message } => {
                if let Err(e) = engine.handle_sos(&session_id, &display_name, location, message) {
                    reply_error(&engine, &session_id, e.to_string());
                }
            }
        }
    }

    // Dropping the session's sender ends the writer once its queue drains
    engine.disconnect(&session_id, connection, role);
    let _ = writer.await;
    debug!(peer = %peer, session_id = %session_id, "client_connection_closed");
}

fn reply_error(engine: &SafetyEngine, session_id: &SessionId, message: impl Into<String>) {
    engine.dispatcher().send_to(session_id, ServerMessage::error(message));
}

async fn next_admin(rx: &mut Option<broadcast::Receiver<AdminMessage>>) -> Result<AdminMessage, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut admin_rx: Option<broadcast::Receiver<AdminMessage>>,
    session_id: SessionId,
) {
    loop {
        let written = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => write_line(&mut writer, &message).await,
                None => break,
            },
            message = next_admin(&mut admin_rx) => match message {
                Ok(message) => write_line(&mut writer, &message).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped = %skipped, "admin_feed_lagged");
                    Ok(())
                }
                Err(RecvError::Closed) => {
                    admin_rx = None;
                    Ok(())
                }
            },
        };
        if let Err(e) = written {
            debug!(session_id = %session_id, error = %e, "client_write_failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
