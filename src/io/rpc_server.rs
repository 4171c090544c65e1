//! Inbound RPC endpoint
//!
//! JSON over HTTP/1.1. Each call is `POST /rpc/<Call>` with the request
//! body as JSON; replies are JSON with HTTP 200 even when the call failed
//! at the domain level (the failure is in `message`).
//!
//! Also serves `GET /health` and, when enabled, `GET /metrics`.

use crate::io::prometheus::format_prometheus_metrics;
use crate::services::coordinator::Coordinator;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS};
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything a request handler needs
pub struct RpcState {
    pub coordinator: Arc<Coordinator>,
    pub site_id: String,
    pub metrics_enabled: bool,
}

/// Build a response without going through the fallible builder
pub fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "rpc_serialize_failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "application/json", r#"{"message":"internal error"}"#)
        }
    }
}

fn bad_request(message: String) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "message": message }))
}

pub fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "Not Found")
}

/// Read and decode a JSON request body. An empty body decodes as `{}`.
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Err(bad_request(format!("unreadable body: {}", e))),
    };
    let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
    serde_json::from_slice(body).map_err(|e| bad_request(format!("malformed request: {}", e)))
}

/// CORS preflight reply for the dashboard
pub fn preflight() -> Response<Full<Bytes>> {
    let mut response = respond(StatusCode::OK, "text/plain; charset=utf-8", "");
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    response
}

async fn handle_call(
    call: &str,
    req: Request<Incoming>,
    peer: SocketAddr,
    coordinator: &Coordinator,
) -> Response<Full<Bytes>> {
    macro_rules! body {
        () => {
            match read_json(req).await {
                Ok(body) => body,
                Err(response) => {
                    warn!(call = %call, peer = %peer, "rpc_bad_request");
                    return response;
                }
            }
        };
    }

    match call {
        "RegisterClient" => json_response(StatusCode::OK, &coordinator.register_client(body!(), Some(peer.ip()))),
        "UpdateLightStatus" => json_response(StatusCode::OK, &coordinator.update_light_status(body!()).await),
        "ScheduleRailLights" => json_response(StatusCode::OK, &coordinator.schedule_rail_lights(body!())),
        "ControlBarrier" => json_response(StatusCode::OK, &coordinator.control_barrier(body!())),
        "TriggerSensor" => {
            let source = peer.ip().to_string();
            json_response(StatusCode::OK, &coordinator.trigger_sensor(body!(), &source).await)
        }
        "Login" => json_response(StatusCode::OK, &coordinator.login(body!())),
        "GetLogs" => json_response(StatusCode::OK, &coordinator.get_logs()),
        _ => not_found(),
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<RpcState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(method = %method, path = %path, peer = %peer, "rpc_request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain; charset=utf-8", "ok"),
        (&Method::GET, "/metrics") if state.metrics_enabled => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(state.coordinator.metrics(), &state.site_id),
        ),
        (&Method::OPTIONS, p) if p.starts_with("/rpc/") => preflight(),
        (&Method::POST, p) => match p.strip_prefix("/rpc/") {
            Some(call) => handle_call(call, req, peer, &state.coordinator).await,
            None => not_found(),
        },
        _ => not_found(),
    };
    Ok(response)
}

/// Serve RPC connections on an already bound listener until shutdown
pub async fn serve(listener: TcpListener, state: Arc<RpcState>, mut shutdown: watch::Receiver<bool>) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, site = %state.site_id, "rpc_server_started"),
        Err(e) => warn!(error = %e, "rpc_server_local_addr_unknown"),
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, peer, state.clone()));

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!(peer = %peer, error = %e, "rpc_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "rpc_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("rpc_server_shutdown");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_sets_headers() {
        let response = respond(StatusCode::OK, "text/plain; charset=utf-8", "ok");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[test]
    fn test_preflight_allows_post() {
        let response = preflight();
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
    }

    #[test]
    fn test_not_found() {
        assert_eq!(not_found().status(), StatusCode::NOT_FOUND);
    }
}
