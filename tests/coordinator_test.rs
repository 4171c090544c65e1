//! End-to-end tests: coordinator RPC server against in-process devices over HTTP

use bytes::Bytes;
use crossing_control::domain::messages::{
    ControlBarrierRequest, GetLogsResponse, MessageResponse, UpdateLightStatusRequest,
    UpdateLightStatusResponse,
};
use crossing_control::domain::types::BarrierState;
use crossing_control::infra::{Clock, Config, Metrics, SystemClock};
use crossing_control::io::rpc_server::{json_response, not_found, read_json};
use crossing_control::io::{serve, HttpDeviceLink, RpcState};
use crossing_control::services::interlock::barrier_reply;
use crossing_control::services::{AuditLog, Coordinator, CoordinatorDeps, CredentialStore};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// In-process device answering UpdateLightStatus and ControlBarrier
#[derive(Default)]
struct TestDevice {
    statuses: Mutex<Vec<String>>,
    lowers: AtomicUsize,
    raises: AtomicUsize,
    delay_ms: u64,
}

async fn device_request(
    req: Request<Incoming>,
    device: Arc<TestDevice>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    if device.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(device.delay_ms)).await;
    }
    let response = match (&method, path.as_str()) {
        (&Method::POST, "/rpc/UpdateLightStatus") => {
            match read_json::<UpdateLightStatusRequest>(req).await {
                Ok(update) => {
                    device.statuses.lock().push(update.status.clone());
                    json_response(StatusCode::OK, &MessageResponse::new("ok"))
                }
                Err(response) => response,
            }
        }
        (&Method::POST, "/rpc/ControlBarrier") => match read_json::<ControlBarrierRequest>(req).await {
            Ok(command) => {
                if command.lower_barrier {
                    device.lowers.fetch_add(1, Ordering::SeqCst);
                } else {
                    device.raises.fetch_add(1, Ordering::SeqCst);
                }
                json_response(StatusCode::OK, &barrier_reply(&command))
            }
            Err(response) => response,
        },
        _ => not_found(),
    };
    Ok(response)
}

async fn spawn_device(device: Arc<TestDevice>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let device = device.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| device_request(req, device.clone()));
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });
    format!("http://{}", addr)
}

/// Address nothing listens on
async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

struct Harness {
    base: String,
    coordinator: Arc<Coordinator>,
    client: reqwest::Client,
    _dir: TempDir,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let credentials_path = dir.path().join("credentials.json");
        std::fs::write(&credentials_path, r#"[{"username":"alice","password":"s3cret"}]"#).unwrap();

        let config = Config::default()
            .with_device_timeout_ms(500)
            .with_audit_file(dir.path().join("TrackFile.txt").to_str().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (coordinator, worker) = Coordinator::build(
            &config,
            CoordinatorDeps {
                link: Arc::new(HttpDeviceLink::new(Duration::from_millis(500))),
                clock: clock.clone(),
                audit: Arc::new(AuditLog::with_file(config.audit_file(), clock)),
                credentials: CredentialStore::load(&credentials_path),
                metrics: Arc::new(Metrics::new()),
                egress: None,
                shutdown: shutdown_rx.clone(),
            },
        );
        tokio::spawn(worker.run(shutdown_rx.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let state = Arc::new(RpcState {
            coordinator: coordinator.clone(),
            site_id: "test".to_string(),
            metrics_enabled: true,
        });
        tokio::spawn(serve(listener, state, shutdown_rx));

        Self {
            base: format!("http://{}", addr),
            coordinator,
            client: reqwest::Client::new(),
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    async fn rpc(&self, call: &str, body: Value) -> Value {
        let response = self
            .client
            .post(format!("{}/rpc/{}", self.base, call))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn register(&self, role: &str, id: Option<&str>, address: &str) -> String {
        let reply = self.rpc("RegisterClient", json!({"role": role, "id": id, "address": address})).await;
        reply["message"].as_str().unwrap().to_string()
    }

    async fn logs(&self) -> String {
        let reply: GetLogsResponse =
            serde_json::from_value(self.rpc("GetLogs", json!({})).await).unwrap();
        reply.logs
    }
}

#[tokio::test]
async fn test_reregistration_keeps_latest_address() {
    let h = Harness::start().await;

    assert_eq!(h.register("road_light", Some("north"), "http://10.0.0.1:50052").await, "Registered road_light client.");
    h.register("road_light", Some("north"), "http://10.0.0.2:50052").await;
    h.register("road_light", Some("north"), "http://10.0.0.3:50052").await;

    let registry = h.coordinator.registry();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.lookup("road_light", Some("north")).unwrap().address, "http://10.0.0.3:50052");
    assert_eq!(h.logs().await.matches("ROAD_LIGHT client connected.").count(), 3);
}

#[tokio::test]
async fn test_broadcast_with_one_unreachable_device() {
    let h = Harness::start().await;
    let north = Arc::new(TestDevice::default());
    let south = Arc::new(TestDevice::default());

    h.register("road_light_north", None, &spawn_device(north.clone()).await).await;
    h.register("road_light_south", None, &spawn_device(south.clone()).await).await;
    h.register("road_light", None, &dead_address().await).await;

    let reply: UpdateLightStatusResponse =
        serde_json::from_value(h.rpc("UpdateLightStatus", json!({"status": "RED"})).await).unwrap();

    assert_eq!(reply.message, "Light status updated: RED (1 of 3 devices failed)");
    assert_eq!(reply.results.len(), 3);
    let failed: Vec<_> = reply.results.iter().filter(|r| !r.ok).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].role, "road_light");
    assert_eq!(*north.statuses.lock(), vec!["RED"]);
    assert_eq!(*south.statuses.lock(), vec!["RED"]);
    assert!(h.logs().await.contains("Failed to update road_light"));
}

#[tokio::test]
async fn test_interlock_over_rpc() {
    let h = Harness::start().await;

    let reply = h.rpc("TriggerSensor", json!({"trainDetected": true})).await;
    assert_eq!(reply["message"], "Train detected, but no barrier client connected.");
    assert_eq!(h.coordinator.interlock().status().await.state, BarrierState::Up);

    let barrier = Arc::new(TestDevice { delay_ms: 150, ..Default::default() });
    h.register("train_barrier", None, &spawn_device(barrier.clone()).await).await;

    let (a, b) = tokio::join!(
        h.rpc("TriggerSensor", json!({"trainDetected": true})),
        h.rpc("TriggerSensor", json!({"trainDetected": true})),
    );
    let mut messages = vec![a["message"].as_str().unwrap().to_string(), b["message"].as_str().unwrap().to_string()];
    messages.sort();
    assert_eq!(messages, vec!["Train detected, barrier already down.", "Train detected, barrier lowered."]);
    assert_eq!(barrier.lowers.load(Ordering::SeqCst), 1);
    assert_eq!(h.coordinator.interlock().status().await.state, BarrierState::Down);

    let reply = h.rpc("TriggerSensor", json!({"trainDetected": false})).await;
    assert_eq!(reply["message"], "Train passed, barrier raised.");
    assert_eq!(barrier.raises.load(Ordering::SeqCst), 1);

    let logs = h.logs().await;
    assert!(logs.contains("Train detected, barrier lowered."));
    assert!(logs.contains("Train passed, barrier raised."));
}

#[tokio::test]
async fn test_login_scenarios() {
    let h = Harness::start().await;

    let reply = h.rpc("Login", json!({"username": "bob", "password": "x"})).await;
    assert_eq!(reply["message"], "User not found");
    let reply = h.rpc("Login", json!({"username": "alice", "password": "wrong"})).await;
    assert_eq!(reply["message"], "Incorrect password");
    let reply = h.rpc("Login", json!({"username": "alice", "password": "s3cret"})).await;
    assert_eq!(reply["message"], "Login successful");
}

#[tokio::test]
async fn test_schedule_firing_is_audited() {
    let h = Harness::start().await;

    assert_eq!(h.coordinator.schedule().fire(), "rail_light_cross1 is now RED");

    let logs = h.logs().await;
    let line = logs.lines().find(|l| l.ends_with("rail_light_cross1 is now RED")).unwrap();
    // [DD-MM-YYYY HH:MM:SS] prefix
    assert_eq!(line.len(), "[15-01-2025 08:00:00] ".len() + "rail_light_cross1 is now RED".len());
    assert!(line.starts_with('['));
    assert_eq!(&line[20..22], "] ");

    let reply = h.rpc("ScheduleRailLights", json!({"clientType": "rail_light"})).await;
    assert_eq!(reply["sendOut"], "rail_light is now GREEN");
    assert_eq!(reply["status"], "GREEN");
}

#[tokio::test]
async fn test_transport_errors_and_side_routes() {
    let h = Harness::start().await;

    let response = h
        .client
        .post(format!("{}/rpc/RegisterClient", h.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().starts_with("malformed request"));

    let response = h.client.post(format!("{}/rpc/Teleport", h.base)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let health = h.client.get(format!("{}/health", h.base)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    h.register("sensor", None, "http://10.0.0.9:50052").await;
    let metrics = h.client.get(format!("{}/metrics", h.base)).send().await.unwrap().text().await.unwrap();
    assert!(metrics.contains("crossing_registrations_total{site=\"test\"} 1"));

    let reply = h.rpc("ControlBarrier", json!({"lowerBarrier": true, "status": "approaching"})).await;
    assert_eq!(reply["message"], "The barrier is down.");
}
