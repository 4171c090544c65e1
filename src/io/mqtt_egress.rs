//! MQTT publisher for coordinator state changes
//!
//! Publishes to MQTT topics for dashboards and loggers:
//! - crossing/devices - Registration events (QoS 0)
//! - crossing/lights - Light colour changes (QoS 0)
//! - crossing/barrier - Barrier command outcomes (QoS 1)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    devices_topic: String,
    lights_topic: String,
    barrier_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("crossing-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            devices_topic: config.mqtt_devices_topic().to_string(),
            lights_topic: config.mqtt_lights_topic().to_string(),
            barrier_topic: config.mqtt_barrier_topic().to_string(),
        }
    }

    /// Run the publisher loop until shutdown, draining what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            devices = %self.devices_topic,
            lights = %self.lights_topic,
            barrier = %self.barrier_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.publish_message(msg).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Device(payload) => {
                self.publish_json(&self.devices_topic, QoS::AtMostOnce, &payload).await;
            }
            EgressMessage::Light(payload) => {
                self.publish_json(&self.lights_topic, QoS::AtMostOnce, &payload).await;
            }
            EgressMessage::Barrier(payload) => {
                // Barrier transitions are safety relevant: at-least-once
                self.publish_json(&self.barrier_topic, QoS::AtLeastOnce, &payload).await;
            }
        }
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, qos: QoS, payload: &T) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, json.into_bytes()).await {
            debug!(topic = %topic, error = %e, "mqtt_egress_publish_failed");
        }
    }
}
