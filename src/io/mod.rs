//! IO modules - external system interfaces
//!
//! - `protocol` - JSON-lines wire messages for the live channel
//! - `client_listener` - TCP listener for tourist and admin connections
//! - `http_api` - HTTP endpoints (optimize, listings, metrics, health)
//! - `prometheus` - Prometheus text exposition
//! - `audit` - Alert audit trail to file (JSONL format)

pub mod audit;
pub mod client_listener;
pub mod http_api;
pub mod prometheus;
pub mod protocol;

// Re-export commonly used types
pub use audit::{create_audit_channel, run_audit_writer, AuditLog, AuditSender};
pub use client_listener::start_client_listener;
pub use http_api::{start_http_server, ApiState};
pub use protocol::{AdminMessage, ClientMessage, Role, ServerMessage};
