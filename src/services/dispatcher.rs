//! Broadcast dispatcher - fans one status update out to many devices
//!
//! Batches are queued on an mpsc channel and processed by a single worker,
//! so two updates touching the same devices reach them in submission order.
//! Within a batch every device is called concurrently under its own timeout;
//! a failing device is recorded in the report and never aborts the batch.

use crate::domain::error::{CoordinatorError, DeviceError};
use crate::domain::messages::{DeviceResult, UpdateLightStatusRequest};
use crate::domain::types::{DeviceKey, DeviceRecord, LightColor, LightState, Selector};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::io::device_link::DeviceLink;
use crate::io::egress_channel::{EgressSender, LightPayload};
use crate::services::audit_log::AuditLog;
use crate::services::registry::DeviceRegistry;
use futures::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one UpdateStatus batch
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    pub batch_id: Uuid,
    pub selector: Selector,
    pub status: String,
    pub results: Vec<DeviceResult>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }

    /// Combine per-light batches of one request under the request's own status
    pub fn merge(selector: Selector, status: &str, parts: Vec<BroadcastReport>) -> Self {
        let batch_id = parts.first().map(|p| p.batch_id).unwrap_or_else(Uuid::now_v7);
        let results = parts.into_iter().flat_map(|p| p.results).collect();
        Self { batch_id, selector, status: status.to_string(), results }
    }

    /// Human-readable summary for the caller
    pub fn message(&self) -> String {
        if self.results.is_empty() {
            return CoordinatorError::NotRegistered(self.selector.to_string()).to_string();
        }
        match self.failed() {
            0 => format!("Light status updated: {}", self.status),
            failed => format!(
                "Light status updated: {} ({} of {} devices failed)",
                self.status,
                failed,
                self.results.len()
            ),
        }
    }
}

struct BroadcastJob {
    selector: Selector,
    status: String,
    reply_tx: oneshot::Sender<BroadcastReport>,
}

/// Shared pieces the worker needs to run a batch
pub struct DispatcherDeps {
    pub registry: Arc<DeviceRegistry>,
    pub link: Arc<dyn DeviceLink>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub egress: Option<EgressSender>,
    /// Bound on each individual device call
    pub timeout: Duration,
}

/// Cloneable handle used by RPC handlers and the schedule engine
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<BroadcastJob>,
    lights: Arc<RwLock<FxHashMap<DeviceKey, LightState>>>,
}

impl Dispatcher {
    /// Queue a status update and wait for every device call to settle
    pub async fn update_status(&self, selector: Selector, status: &str) -> BroadcastReport {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = BroadcastJob { selector: selector.clone(), status: status.to_string(), reply_tx };

        if self.tx.send(job).await.is_err() {
            warn!(selector = %selector, "dispatcher_unavailable");
            return Self::unavailable(selector, status);
        }

        match reply_rx.await {
            Ok(report) => report,
            Err(_) => {
                warn!(selector = %selector, "dispatcher_batch_cancelled");
                Self::unavailable(selector, status)
            }
        }
    }

    fn unavailable(selector: Selector, status: &str) -> BroadcastReport {
        BroadcastReport {
            batch_id: Uuid::now_v7(),
            selector,
            status: status.to_string(),
            results: Vec::new(),
        }
    }

    /// Last colour a device confirmed through a broadcast
    pub fn light_state(&self, key: &DeviceKey) -> Option<LightState> {
        self.lights.read().get(key).cloned()
    }

    pub fn light_states(&self) -> Vec<(DeviceKey, LightState)> {
        self.lights.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Worker that owns the batch queue
pub struct DispatchWorker {
    rx: mpsc::Receiver<BroadcastJob>,
    deps: DispatcherDeps,
    lights: Arc<RwLock<FxHashMap<DeviceKey, LightState>>>,
}

/// Create a dispatcher handle and the worker that must be spawned to serve it
pub fn create_dispatcher(deps: DispatcherDeps, buffer_size: usize) -> (Dispatcher, DispatchWorker) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let lights = Arc::new(RwLock::new(FxHashMap::default()));
    let handle = Dispatcher { tx, lights: lights.clone() };
    (handle, DispatchWorker { rx, deps, lights })
}

impl DispatchWorker {
    /// Process batches in arrival order until shutdown or all handles drop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("dispatch_worker_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                job = self.rx.recv() => {
                    let Some(job) = job else { break };
                    // A batch in flight is abandoned on shutdown; its caller gets an empty report
                    tokio::select! {
                        report = self.run_batch(&job.selector, &job.status) => {
                            let _ = job.reply_tx.send(report);
                        }
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }
        }

        info!("dispatch_worker_stopped");
    }

    async fn run_batch(&self, selector: &Selector, status: &str) -> BroadcastReport {
        let batch_id = Uuid::now_v7();
        let devices = self.deps.registry.matching(selector);
        self.deps.metrics.record_broadcast();

        if devices.is_empty() {
            info!(batch_id = %batch_id, selector = %selector, "broadcast_no_devices");
            self.deps
                .audit
                .append(format!("Light status {} not sent: no device matches {}", status, selector));
            return BroadcastReport {
                batch_id,
                selector: selector.clone(),
                status: status.to_string(),
                results: Vec::new(),
            };
        }

        info!(
            batch_id = %batch_id,
            selector = %selector,
            status = %status,
            devices = %devices.len(),
            "broadcast_started"
        );

        let calls = devices.iter().map(|device| self.call_device(device, status));
        let results: Vec<DeviceResult> = join_all(calls).await;

        let report = BroadcastReport {
            batch_id,
            selector: selector.clone(),
            status: status.to_string(),
            results,
        };

        info!(
            batch_id = %batch_id,
            delivered = %report.delivered(),
            failed = %report.failed(),
            "broadcast_completed"
        );
        self.deps.audit.append(format!(
            "Light status {} sent to {}: {} of {} delivered",
            status,
            selector,
            report.delivered(),
            report.results.len()
        ));
        report
    }

    async fn call_device(&self, device: &DeviceRecord, status: &str) -> DeviceResult {
        let request = UpdateLightStatusRequest {
            status: status.to_string(),
            role: Some(device.key.role.clone()),
            id: device.key.id.clone(),
        };
        let start = Instant::now();

        let outcome = match tokio::time::timeout(
            self.deps.timeout,
            self.deps.link.update_light_status(device, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.deps.timeout.as_millis() as u64)),
        };

        let latency_us = start.elapsed().as_micros() as u64;
        self.deps.metrics.record_device_call(outcome.is_ok(), latency_us);

        match outcome {
            Ok(reply) => {
                debug!(device = %device.key, latency_us = %latency_us, "broadcast_device_ok");
                self.record_light(device, status);
                DeviceResult {
                    role: device.key.role.clone(),
                    id: device.key.id.clone(),
                    ok: true,
                    detail: reply.message,
                }
            }
            Err(e) => {
                let err = CoordinatorError::downstream(&device.key, e);
                warn!(device = %device.key, latency_us = %latency_us, error = %err, "broadcast_device_failed");
                self.deps.audit.append(format!("Failed to update {}: {}", device.key, err));
                DeviceResult {
                    role: device.key.role.clone(),
                    id: device.key.id.clone(),
                    ok: false,
                    detail: err.to_string(),
                }
            }
        }
    }

    /// Track colour for statuses that name one; anything else is passed through untracked
    fn record_light(&self, device: &DeviceRecord, status: &str) {
        let Ok(color) = status.parse::<LightColor>() else {
            return;
        };
        let now = self.deps.clock.now();
        self.lights.write().insert(
            device.key.clone(),
            LightState { role: device.key.role.clone(), color, updated_at: now },
        );
        if let Some(ref egress) = self.deps.egress {
            egress.send_light(LightPayload {
                site: None,
                ts: now.timestamp_millis(),
                role: device.key.role.clone(),
                id: device.key.id.clone(),
                color: color.to_string(),
                src: "broadcast".to_string(),
            });
        }
    }
}

/// Resolves once the shutdown flag turns true; pends forever if the sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
