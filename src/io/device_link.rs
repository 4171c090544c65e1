//! Outbound calls to registered devices
//!
//! Devices serve the same RPC surface as the coordinator, JSON over HTTP/1.1
//! at `<address>/rpc/<Call>`. The coordinator only ever issues two calls to
//! them: UpdateLightStatus (broadcast) and ControlBarrier (interlock).

use crate::domain::error::DeviceError;
use crate::domain::messages::{ControlBarrierRequest, MessageResponse, UpdateLightStatusRequest};
use crate::domain::types::DeviceRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Transport to a single device, resolved from its registry record on every call
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn update_light_status(
        &self,
        device: &DeviceRecord,
        request: &UpdateLightStatusRequest,
    ) -> Result<MessageResponse, DeviceError>;

    async fn control_barrier(
        &self,
        device: &DeviceRecord,
        request: &ControlBarrierRequest,
    ) -> Result<MessageResponse, DeviceError>;
}

/// HTTP implementation sharing one pooled client
pub struct HttpDeviceLink {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeviceLink {
    pub fn new(timeout: Duration) -> Self {
        // Build fails only if the TLS backend cannot initialise; fall back to defaults
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .http1_only()
            .build()
            .unwrap_or_else(|e| {
                error!(error = %e, "device_http_client_build_failed");
                reqwest::Client::new()
            });
        Self { client, timeout }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        device: &DeviceRecord,
        call: &str,
        body: &T,
    ) -> Result<MessageResponse, DeviceError> {
        let url = rpc_url(&device.address, call);
        let start = Instant::now();

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeviceError::Timeout(self.timeout.as_millis() as u64)
            } else {
                DeviceError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Rejected(status.as_u16()));
        }

        let reply = response
            .json::<MessageResponse>()
            .await
            .map_err(|e| DeviceError::InvalidResponse(e.to_string()))?;

        debug!(
            device = %device.key,
            call = %call,
            latency_us = %start.elapsed().as_micros(),
            "device_call_ok"
        );
        Ok(reply)
    }
}

/// `<address>/rpc/<call>`, tolerating a trailing slash on the address
pub fn rpc_url(address: &str, call: &str) -> String {
    format!("{}/rpc/{}", address.trim_end_matches('/'), call)
}

#[async_trait]
impl DeviceLink for HttpDeviceLink {
    async fn update_light_status(
        &self,
        device: &DeviceRecord,
        request: &UpdateLightStatusRequest,
    ) -> Result<MessageResponse, DeviceError> {
        self.post(device, "UpdateLightStatus", request).await
    }

    async fn control_barrier(
        &self,
        device: &DeviceRecord,
        request: &ControlBarrierRequest,
    ) -> Result<MessageResponse, DeviceError> {
        self.post(device, "ControlBarrier", request).await
    }
}
