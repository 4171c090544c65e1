//! Device simulator
//!
//! Plays one field device against a running coordinator for local testing.
//!
//! Behavior:
//! 1. Serves the device side of the RPC surface on `--port`
//!    (UpdateLightStatus, ControlBarrier, /health)
//! 2. Registers with the coordinator, retrying until it answers
//! 3. Role-specific driving:
//!    - sensor: TriggerSensor(true), then TriggerSensor(false) after `--pass-after-secs`,
//!      every `--interval-secs`
//!    - rail_light: ScheduleRailLights toggle every `--interval-secs` (0 = passive)
//!    - lights and barrier: passive, answer coordinator calls
//!
//! Usage:
//!   cargo run --bin device_sim -- --role train_barrier --port 50060
//!   cargo run --bin device_sim -- --role sensor --port 50061 --interval-secs 20

use bytes::Bytes;
use clap::Parser;
use crossing_control::domain::messages::{
    ControlBarrierRequest, MessageResponse, RegisterClientRequest, ScheduleRailLightsRequest,
    ScheduleRailLightsResponse, TriggerSensorRequest, UpdateLightStatusRequest,
};
use crossing_control::domain::types::roles;
use crossing_control::io::device_link::rpc_url;
use crossing_control::io::rpc_server::{json_response, not_found, read_json, respond};
use crossing_control::services::interlock::barrier_reply;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "device_sim")]
#[command(about = "Simulated crossing device for local runs")]
struct Args {
    /// Device role (road_light, road_light_north, rail_light, train_barrier, sensor, ...)
    #[arg(short, long)]
    role: String,

    /// Optional device id, distinguishes devices sharing a role
    #[arg(long)]
    id: Option<String>,

    /// Coordinator base URL
    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    coordinator: String,

    /// Port this device listens on
    #[arg(short, long, default_value = "50052")]
    port: u16,

    /// Host the coordinator should call back on
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Driving period for sensor and rail_light roles (seconds, 0 = passive)
    #[arg(long, default_value = "30")]
    interval_secs: u64,

    /// Sensor: delay between "train detected" and "train passed" (seconds)
    #[arg(long, default_value = "10")]
    pass_after_secs: u64,
}

/// What the simulated device currently shows
struct DeviceState {
    role: String,
    light: Mutex<Option<String>>,
    barrier_down: Mutex<bool>,
}

async fn handle_request(
    req: Request<Incoming>,
    device: Arc<DeviceState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain; charset=utf-8", "ok"),
        (&Method::POST, "/rpc/UpdateLightStatus") => {
            match read_json::<UpdateLightStatusRequest>(req).await {
                Ok(update) => {
                    *device.light.lock() = Some(update.status.clone());
                    info!(role = %device.role, status = %update.status, "light_status_updated");
                    json_response(
                        StatusCode::OK,
                        &MessageResponse::new(format!("Light status updated to {}", update.status)),
                    )
                }
                Err(response) => response,
            }
        }
        (&Method::POST, "/rpc/ControlBarrier") => match read_json::<ControlBarrierRequest>(req).await {
            Ok(command) => {
                *device.barrier_down.lock() = command.lower_barrier;
                json_response(StatusCode::OK, &barrier_reply(&command))
            }
            Err(response) => response,
        },
        _ => not_found(),
    };
    Ok(response)
}

async fn serve_device(listener: TcpListener, device: Arc<DeviceState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => {
                        let io = TokioIo::new(stream);
                        let device = device.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, device.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!(error = %e, "device_connection_error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "device_accept_error"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn call<Req: Serialize, Resp: DeserializeOwned>(
    client: &reqwest::Client,
    coordinator: &str,
    name: &str,
    body: &Req,
) -> Result<Resp, reqwest::Error> {
    client.post(rpc_url(coordinator, name)).json(body).send().await?.error_for_status()?.json().await
}

async fn register(client: &reqwest::Client, args: &Args, shutdown: &mut watch::Receiver<bool>) -> bool {
    let request = RegisterClientRequest {
        role: args.role.clone(),
        id: args.id.clone(),
        address: Some(format!("http://{}:{}", args.advertise_host, args.port)),
    };

    loop {
        match call::<_, MessageResponse>(client, &args.coordinator, "RegisterClient", &request).await {
            Ok(reply) => {
                info!(role = %args.role, reply = %reply.message, "registered");
                return true;
            }
            Err(e) => warn!(coordinator = %args.coordinator, error = %e, "register_failed_retrying"),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

async fn drive_sensor(client: reqwest::Client, args: Args, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        for (detected, pause) in [(true, args.pass_after_secs), (false, 0)] {
            let request = TriggerSensorRequest { train_detected: detected };
            match call::<_, MessageResponse>(&client, &args.coordinator, "TriggerSensor", &request).await {
                Ok(reply) => info!(train_detected = %detected, reply = %reply.message, "sensor_triggered"),
                Err(e) => warn!(train_detected = %detected, error = %e, "sensor_trigger_failed"),
            }
            if pause > 0 {
                tokio::time::sleep(Duration::from_secs(pause)).await;
            }
        }
    }
}

async fn drive_rail_light(client: reqwest::Client, args: Args, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let request = ScheduleRailLightsRequest { client_type: args.role.clone(), status: None };
                match call::<_, ScheduleRailLightsResponse>(&client, &args.coordinator, "ScheduleRailLights", &request).await {
                    Ok(reply) => info!(send_out = %reply.send_out, "crossing_reported"),
                    Err(e) => warn!(error = %e, "crossing_report_failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339()).with_target(false).init();

    let args = Args::parse();
    info!(role = %args.role, id = ?args.id, port = %args.port, coordinator = %args.coordinator, "device_sim_starting");

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let device = Arc::new(DeviceState {
        role: args.role.clone(),
        light: Mutex::new(None),
        barrier_down: Mutex::new(false),
    });

    let server = tokio::spawn(serve_device(listener, device.clone(), shutdown_rx.clone()));

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
    if register(&client, &args, &mut shutdown_rx).await && args.interval_secs > 0 {
        let role = args.role.clone();
        match role.as_str() {
            roles::SENSOR => {
                tokio::spawn(drive_sensor(client, args, shutdown_rx.clone()));
            }
            roles::RAIL_LIGHT => {
                tokio::spawn(drive_rail_light(client, args, shutdown_rx.clone()));
            }
            _ => {}
        }
    }

    let _ = server.await;
    let light = device.light.lock().clone();
    let barrier_down = *device.barrier_down.lock();
    info!(role = %device.role, light = ?light, barrier_down = %barrier_down, "device_sim_stopped");
    Ok(())
}
