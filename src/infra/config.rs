//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::roles;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_server_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    50051
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    /// Per-call timeout for outbound device RPCs
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
    /// Port assumed for devices that register without an explicit address
    #[serde(default = "default_device_port")]
    pub default_port: u16,
    #[serde(default = "default_barrier_role")]
    pub barrier_role: String,
    /// Broadcast group used when a light update names no role
    #[serde(default = "default_light_roles")]
    pub light_roles: Vec<String>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_device_timeout_ms(),
            default_port: default_device_port(),
            barrier_role: default_barrier_role(),
            light_roles: default_light_roles(),
        }
    }
}

fn default_device_timeout_ms() -> u64 {
    2000
}

fn default_device_port() -> u16 {
    50052
}

fn default_barrier_role() -> String {
    roles::TRAIN_BARRIER.to_string()
}

fn default_light_roles() -> Vec<String> {
    vec![
        roles::ROAD_LIGHT.to_string(),
        roles::ROAD_LIGHT_NORTH.to_string(),
        roles::ROAD_LIGHT_SOUTH.to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_enabled")]
    pub enabled: bool,
    /// Name used in confirmation lines ("<label> is now RED")
    #[serde(default = "default_schedule_label")]
    pub label: String,
    /// Devices of this role receive the toggled colour
    #[serde(default = "default_crossing_role")]
    pub crossing_role: String,
    /// Daily trigger times, "HH:MM" or "HH:MM:SS" local time
    #[serde(default = "default_schedule_times")]
    pub times: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_schedule_enabled(),
            label: default_schedule_label(),
            crossing_role: default_crossing_role(),
            times: default_schedule_times(),
        }
    }
}

fn default_schedule_enabled() -> bool {
    true
}

fn default_schedule_label() -> String {
    "rail_light_cross1".to_string()
}

fn default_crossing_role() -> String {
    roles::RAIL_LIGHT.to_string()
}

/// Train passes every two hours from 08:00 to 22:00, lights held for five minutes
fn default_schedule_times() -> Vec<String> {
    (8..=22)
        .step_by(2)
        .flat_map(|hour| [format!("{:02}:00", hour), format!("{:02}:05", hour)])
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_file")]
    pub file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file() }
    }
}

fn default_audit_file() -> String {
    "TrackFile.txt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { credentials_file: default_credentials_file() }
    }
}

fn default_credentials_file() -> String {
    "credentials.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Topic for registration events (QoS 0)
    #[serde(default = "default_devices_topic")]
    pub devices_topic: String,
    /// Topic for light colour changes (QoS 0)
    #[serde(default = "default_lights_topic")]
    pub lights_topic: String,
    /// Topic for barrier transitions (QoS 1)
    #[serde(default = "default_barrier_topic")]
    pub barrier_topic: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            devices_topic: default_devices_topic(),
            lights_topic: default_lights_topic(),
            barrier_topic: default_barrier_topic(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_devices_topic() -> String {
    "crossing/devices".to_string()
}

fn default_lights_topic() -> String {
    "crossing/lights".to_string()
}

fn default_barrier_topic() -> String {
    "crossing/barrier".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Serve /metrics on the RPC port
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Period of the metrics summary log line
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_metrics_enabled(), interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "crossing".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    port: u16,
    device_timeout_ms: u64,
    device_default_port: u16,
    barrier_role: String,
    light_roles: Vec<String>,
    schedule_enabled: bool,
    schedule_label: String,
    crossing_role: String,
    schedule_times: Vec<String>,
    audit_file: String,
    credentials_file: String,
    metrics_enabled: bool,
    metrics_interval_secs: u64,
    config_file: String,
    // MQTT egress
    mqtt_egress_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_devices_topic: String,
    mqtt_lights_topic: String,
    mqtt_barrier_topic: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            port: toml_config.server.port,
            device_timeout_ms: toml_config.devices.timeout_ms,
            device_default_port: toml_config.devices.default_port,
            barrier_role: toml_config.devices.barrier_role,
            light_roles: toml_config.devices.light_roles,
            schedule_enabled: toml_config.schedule.enabled,
            schedule_label: toml_config.schedule.label,
            crossing_role: toml_config.schedule.crossing_role,
            schedule_times: toml_config.schedule.times,
            audit_file: toml_config.audit.file,
            credentials_file: toml_config.auth.credentials_file,
            metrics_enabled: toml_config.metrics.enabled,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_host: toml_config.mqtt_egress.host,
            mqtt_port: toml_config.mqtt_egress.port,
            mqtt_username: toml_config.mqtt_egress.username,
            mqtt_password: toml_config.mqtt_egress.password,
            mqtt_devices_topic: toml_config.mqtt_egress.devices_topic,
            mqtt_lights_topic: toml_config.mqtt_egress.lights_topic,
            mqtt_barrier_topic: toml_config.mqtt_egress.barrier_topic,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn device_timeout_ms(&self) -> u64 {
        self.device_timeout_ms
    }

    pub fn device_default_port(&self) -> u16 {
        self.device_default_port
    }

    pub fn barrier_role(&self) -> &str {
        &self.barrier_role
    }

    pub fn light_roles(&self) -> &[String] {
        &self.light_roles
    }

    pub fn schedule_enabled(&self) -> bool {
        self.schedule_enabled
    }

    pub fn schedule_label(&self) -> &str {
        &self.schedule_label
    }

    pub fn crossing_role(&self) -> &str {
        &self.crossing_role
    }

    pub fn schedule_times(&self) -> &[String] {
        &self.schedule_times
    }

    pub fn audit_file(&self) -> &str {
        &self.audit_file
    }

    pub fn credentials_file(&self) -> &str {
        &self.credentials_file
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // MQTT egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_devices_topic(&self) -> &str {
        &self.mqtt_devices_topic
    }

    pub fn mqtt_lights_topic(&self) -> &str {
        &self.mqtt_lights_topic
    }

    pub fn mqtt_barrier_topic(&self) -> &str {
        &self.mqtt_barrier_topic
    }

    /// Builder method to set the outbound device timeout
    pub fn with_device_timeout_ms(mut self, ms: u64) -> Self {
        self.device_timeout_ms = ms;
        self
    }

    /// Builder method to point the audit trail at another file
    pub fn with_audit_file(mut self, file: &str) -> Self {
        self.audit_file = file.to_string();
        self
    }

    /// Builder method to set the listen port (0 picks a free port)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}
