//! Device registry
//!
//! Tracks every device that has called RegisterClient, keyed by (role, id).
//! Writes take the exclusive lock; lookups share the read lock. The lock is
//! never held across an await.

use crate::domain::types::{DeviceKey, DeviceRecord, Selector};
use crate::infra::clock::Clock;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::info;

/// What happened on a register call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Updated,
}

pub struct DeviceRegistry {
    devices: RwLock<FxHashMap<DeviceKey, DeviceRecord>>,
    clock: Arc<dyn Clock>,
}

impl DeviceRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { devices: RwLock::new(FxHashMap::default()), clock }
    }

    /// Insert or refresh a device. Last write wins for the address.
    pub fn register(&self, key: DeviceKey, address: String) -> (Registration, DeviceRecord) {
        let now = self.clock.now();
        let mut devices = self.devices.write();

        let (registration, record) = match devices.get_mut(&key) {
            Some(existing) => {
                existing.address = address;
                existing.last_seen = now;
                (Registration::Updated, existing.clone())
            }
            None => {
                let record = DeviceRecord {
                    key: key.clone(),
                    address,
                    registered_at: now,
                    last_seen: now,
                };
                devices.insert(key, record.clone());
                (Registration::New, record)
            }
        };
        drop(devices);

        info!(
            device = %record.key,
            address = %record.address,
            updated = %(registration == Registration::Updated),
            "device_registered"
        );
        (registration, record)
    }

    /// Exact lookup by role and optional id
    pub fn lookup(&self, role: &str, id: Option<&str>) -> Option<DeviceRecord> {
        let key = DeviceKey::new(role, id.map(str::to_string));
        self.devices.read().get(&key).cloned()
    }

    /// Most recently seen device registered under `role`, whatever its id
    pub fn latest_for_role(&self, role: &str) -> Option<DeviceRecord> {
        self.devices
            .read()
            .values()
            .filter(|record| record.key.role == role)
            .max_by_key(|record| record.last_seen)
            .cloned()
    }

    /// All devices a selector targets, ordered by key for stable output
    pub fn matching(&self, selector: &Selector) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .devices
            .read()
            .values()
            .filter(|record| selector.matches(&record.key))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.key.role.cmp(&b.key.role).then_with(|| a.key.id.cmp(&b.key.id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
