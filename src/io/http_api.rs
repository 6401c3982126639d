//! HTTP API - route optimization, admin listings, metrics, health
//!
//! Routes:
//! - `POST /optimize`  body `OptimizationRequest`, returns `OptimizationResult`
//! - `GET /zones`      active zone snapshot
//! - `GET /sessions`   active session snapshot
//! - `GET /metrics`    Prometheus text format
//! - `GET /health`     liveness
//!
//! Uses hyper http1 with one task per connection.

use crate::domain::error::OptimizeError;
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::engine::SafetyEngine;
use crate::services::optimizer_pool::OptimizerPool;
use crate::services::route_optimizer::OptimizationRequest;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handles for request handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SafetyEngine>,
    pub optimizer: Arc<OptimizerPool>,
    pub metrics: Arc<Metrics>,
    pub site_id: Arc<str>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "http_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", Bytes::from_static(b"error"))
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { error: message })
}

/// Dispatch one request with its body already read
pub async fn route(
    state: &ApiState,
    method: &Method,
    path: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, "/optimize") => handle_optimize(state, &body).await,
        (&Method::GET, "/zones") => json_response(StatusCode::OK, &state.engine.zones_snapshot()),
        (&Method::GET, "/sessions") => {
            json_response(StatusCode::OK, &state.engine.sessions_snapshot())
        }
        (&Method::GET, "/metrics") => {
            state.engine.sample_gauges();
            let body = format_prometheus_metrics(&state.metrics, &state.site_id);
            response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", Bytes::from(body))
        }
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", Bytes::from_static(b"ok")),
        _ => response(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found")),
    }
}

async fn handle_optimize(state: &ApiState, body: &[u8]) -> Response<Full<Bytes>> {
    let request: OptimizationRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            state.metrics.record_optimization_rejected();
            debug!(error = %e, "optimize_request_malformed");
            return error_response(StatusCode::BAD_REQUEST, &format!("malformed request: {e}"));
        }
    };

    let waypoints = request.waypoints.len();
    match state.optimizer.submit(request).await {
        Ok(result) => {
            info!(
                waypoints = %waypoints,
                saved_m = format!("{:.0}", result.distance_saved_meters),
                iterations = %result.iterations,
                timed_out = %result.timed_out,
                "optimize_completed"
            );
            json_response(StatusCode::OK, &result)
        }
        Err(OptimizeError::Validation(e)) => {
            debug!(error = %e, "optimize_request_rejected");
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e @ OptimizeError::WorkerUnavailable) => {
            warn!(error = %e, "optimize_worker_unavailable");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: ApiState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, path = %path, "http_body_rejected");
            return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
    };

    Ok(route(&state, &method, &path, body).await)
}

/// Start the HTTP API server
pub async fn start_http_server(
    bind_address: String,
    port: u16,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, site = %state.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
