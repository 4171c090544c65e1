//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to publish coordinator state changes.
//! Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Device registered or re-registered
    Device(DevicePayload),
    /// Light colour confirmed by a device or toggled by the schedule
    Light(LightPayload),
    /// Barrier command outcome
    Barrier(BarrierPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: i64,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub address: String,
    /// "registered" or "updated"
    pub t: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub ts: i64,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub color: String,
    /// Source of the change (broadcast, schedule, device)
    pub src: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BarrierPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub ts: i64,
    /// Interlock state after the command (UP / DOWN)
    pub state: String,
    /// Command that was attempted (lower / raise)
    pub cmd: String,
    pub ok: bool,
    /// Which sensor call triggered the command
    pub src: String,
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped and counted.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn send(&self, msg: EgressMessage) {
        if self.tx.try_send(msg).is_err() {
            if let Some(ref metrics) = self.metrics {
                metrics.record_egress_dropped();
            }
        }
    }

    /// Injects site_id into the payload
    pub fn send_device(&self, mut payload: DevicePayload) {
        payload.site = Some(self.site_id.clone());
        self.send(EgressMessage::Device(payload));
    }

    pub fn send_light(&self, mut payload: LightPayload) {
        payload.site = Some(self.site_id.clone());
        self.send(EgressMessage::Light(payload));
    }

    pub fn send_barrier(&self, mut payload: BarrierPayload) {
        payload.site = Some(self.site_id.clone());
        self.send(EgressMessage::Barrier(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}
