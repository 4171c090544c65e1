//! Shared types for the crossing coordinator

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Well-known device roles. Registration is open, so any other string is
/// accepted as a role too.
pub mod roles {
    pub const ROAD_LIGHT: &str = "road_light";
    pub const ROAD_LIGHT_NORTH: &str = "road_light_north";
    pub const ROAD_LIGHT_SOUTH: &str = "road_light_south";
    pub const RAIL_LIGHT: &str = "rail_light";
    pub const TRAIN_BARRIER: &str = "train_barrier";
    pub const SENSOR: &str = "sensor";
}

/// Registry key: a role plus an optional device id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DeviceKey {
    /// Build a key, treating an empty id the same as no id
    pub fn new(role: impl Into<String>, id: Option<String>) -> Self {
        let id = id.filter(|id| !id.trim().is_empty());
        Self { role: role.into(), id }
    }

    pub fn role_only(role: impl Into<String>) -> Self {
        Self { role: role.into(), id: None }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.role, id),
            None => write!(f, "{}", self.role),
        }
    }
}

/// A registered device and where to reach it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    /// Base URL the device serves its RPC surface on
    pub address: String,
    pub registered_at: DateTime<Local>,
    pub last_seen: DateTime<Local>,
}

impl DeviceRecord {
    pub fn role(&self) -> &str {
        &self.key.role
    }

    pub fn id(&self) -> Option<&str> {
        self.key.id.as_deref()
    }
}

/// Which registered devices a broadcast targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every device registered under this role
    Role(String),
    /// Every device registered under any of these roles
    Group(Vec<String>),
    /// Exactly these devices
    Devices(Vec<DeviceKey>),
}

impl Selector {
    pub fn matches(&self, key: &DeviceKey) -> bool {
        match self {
            Selector::Role(role) => key.role == *role,
            Selector::Group(roles) => roles.iter().any(|r| *r == key.role),
            Selector::Devices(keys) => keys.contains(key),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Role(role) => write!(f, "{}", role),
            Selector::Group(roles) => write!(f, "[{}]", roles.join(", ")),
            Selector::Devices(keys) => {
                let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
                write!(f, "[{}]", keys.join(", "))
            }
        }
    }
}

/// Traffic light colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LightColor {
    Green,
    Red,
}

impl LightColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LightColor::Green => "GREEN",
            LightColor::Red => "RED",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            LightColor::Green => LightColor::Red,
            LightColor::Red => LightColor::Green,
        }
    }
}

impl std::fmt::Display for LightColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LightColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GREEN" => Ok(LightColor::Green),
            "RED" => Ok(LightColor::Red),
            other => Err(format!("unknown light colour: {}", other)),
        }
    }
}

/// Last known colour of a light
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightState {
    pub role: String,
    pub color: LightColor,
    pub updated_at: DateTime<Local>,
}

/// Barrier position as known to the interlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BarrierState {
    #[default]
    Up,
    Down,
}

impl BarrierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierState::Up => "UP",
            BarrierState::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for BarrierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit trail line
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

/// Timestamp format used on audit trail lines
pub const AUDIT_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

impl LogEntry {
    pub fn new(timestamp: DateTime<Local>, message: impl Into<String>) -> Self {
        Self { timestamp, message: message.into() }
    }

    /// Render as a single audit trail line (no trailing newline)
    pub fn to_line(&self) -> String {
        format!("[{}] {}", self.timestamp.format(AUDIT_TIME_FORMAT), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_device_key_empty_id_is_role_only() {
        let key = DeviceKey::new("road_light", Some("  ".to_string()));
        assert_eq!(key, DeviceKey::role_only("road_light"));
        assert_eq!(key.to_string(), "road_light");

        let key = DeviceKey::new("road_light", Some("north".to_string()));
        assert_eq!(key.to_string(), "road_light/north");
    }

    #[test]
    fn test_light_color_parse_and_toggle() {
        assert_eq!("green".parse::<LightColor>().unwrap(), LightColor::Green);
        assert_eq!(" RED ".parse::<LightColor>().unwrap(), LightColor::Red);
        assert!("amber".parse::<LightColor>().is_err());
        assert_eq!(LightColor::Green.toggled(), LightColor::Red);
        assert_eq!(LightColor::Red.toggled().toggled(), LightColor::Red);
    }

    #[test]
    fn test_selector_matches() {
        let north = DeviceKey::new("road_light", Some("north".to_string()));
        let barrier = DeviceKey::role_only("train_barrier");

        assert!(Selector::Role("road_light".to_string()).matches(&north));
        assert!(!Selector::Role("road_light".to_string()).matches(&barrier));
        assert!(Selector::Group(vec!["sensor".to_string(), "train_barrier".to_string()])
            .matches(&barrier));
        assert!(Selector::Devices(vec![north.clone()]).matches(&north));
        assert!(!Selector::Devices(vec![north]).matches(&barrier));
    }

    #[test]
    fn test_log_entry_line_format() {
        let ts = Local.with_ymd_and_hms(2025, 3, 7, 8, 5, 9).unwrap();
        let entry = LogEntry::new(ts, "rail_light is now RED");
        assert_eq!(entry.to_line(), "[07-03-2025 08:05:09] rail_light is now RED");
    }

    #[test]
    fn test_barrier_state_default_is_up() {
        assert_eq!(BarrierState::default(), BarrierState::Up);
        assert_eq!(BarrierState::Down.to_string(), "DOWN");
    }
}
