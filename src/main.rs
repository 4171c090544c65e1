//! Crossing coordinator - registry, broadcast, schedule and barrier interlock
//!
//! Module structure:
//! - `domain/` - Core types (DeviceKey, Selector, LightColor, BarrierState) and RPC bodies
//! - `io/` - External interfaces (RPC server, device link, MQTT egress, Prometheus)
//! - `services/` - Coordinator logic (Registry, Dispatcher, Schedule, Interlock, Audit)
//! - `infra/` - Infrastructure (Config, Metrics, Clock)

use anyhow::Context;
use clap::Parser;
use crossing_control::infra::{Clock, Config, Metrics, SystemClock};
use crossing_control::io::{create_egress_channel, serve, HttpDeviceLink, MqttPublisher, RpcState};
use crossing_control::services::{AuditLog, Coordinator, CoordinatorDeps, CredentialStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Crossing coordinator - traffic lights, rail crossing and barrier interlock
#[derive(Parser, Debug)]
#[command(name = "crossing-control", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the RPC listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-call visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "crossing-control starting");

    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => Config::resolve_config_path(&[]),
    };
    let mut config = Config::load_from_path(&config_path);
    if let Some(port) = args.port {
        config = config.with_port(port);
    }

    info!(
        config_file = %config.config_file(),
        listen_addr = %config.listen_addr(),
        device_timeout_ms = %config.device_timeout_ms(),
        barrier_role = %config.barrier_role(),
        light_roles = ?config.light_roles(),
        schedule_enabled = %config.schedule_enabled(),
        schedule_label = %config.schedule_label(),
        schedule_times = %config.schedule_times().len(),
        audit_file = %config.audit_file(),
        mqtt_egress = %config.mqtt_egress_enabled(),
        "config_loaded"
    );

    // Bind before anything else starts: a taken port is fatal
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind RPC address {}", config.listen_addr()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLog::with_file(config.audit_file(), clock.clone()));
    let credentials = CredentialStore::load(config.credentials_file());
    let link = Arc::new(HttpDeviceLink::new(Duration::from_millis(config.device_timeout_ms())));

    // Create MQTT egress channel and publisher (if enabled)
    let egress = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());
        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Some(egress_sender.with_metrics(metrics.clone()))
    } else {
        None
    };

    let (coordinator, dispatch_worker) = Coordinator::build(
        &config,
        CoordinatorDeps {
            link,
            clock,
            audit,
            credentials,
            metrics: metrics.clone(),
            egress,
            shutdown: shutdown_rx.clone(),
        },
    );

    let dispatch_handle = tokio::spawn(dispatch_worker.run(shutdown_rx.clone()));

    let schedule_handle = if config.schedule_enabled() {
        Some(tokio::spawn(coordinator.schedule().clone().run(shutdown_rx.clone())))
    } else {
        info!("schedule_disabled");
        None
    };

    // Start metrics reporter (lock-free reads)
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.report().log(),
                _ = metrics_shutdown.changed() => {
                    if *metrics_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(RpcState {
        coordinator,
        site_id: config.site_id().to_string(),
        metrics_enabled: config.metrics_enabled(),
    });
    serve(listener, state, shutdown_rx).await;

    let _ = dispatch_handle.await;
    if let Some(handle) = schedule_handle {
        let _ = handle.await;
    }

    info!("crossing-control shutdown complete");
    Ok(())
}
