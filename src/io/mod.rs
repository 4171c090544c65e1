//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `rpc_server` - Inbound JSON-over-HTTP RPC endpoint (hyper)
//! - `device_link` - Outbound calls to registered devices (reqwest)
//! - `mqtt_egress` - MQTT publisher for coordinator state changes
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `prometheus` - Prometheus text exposition of metrics

pub mod device_link;
pub mod egress_channel;
pub mod mqtt_egress;
pub mod prometheus;
pub mod rpc_server;

// Re-export commonly used types
pub use device_link::{DeviceLink, HttpDeviceLink};
pub use egress_channel::{
    create_egress_channel, BarrierPayload, DevicePayload, EgressMessage, EgressSender, LightPayload,
};
pub use mqtt_egress::MqttPublisher;
pub use rpc_server::{serve, RpcState};
