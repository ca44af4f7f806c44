//! Logical device definitions and the snapshot built from one enumeration.
//!
//! A [`LogicalDevice`] is a configured vendor/product signature.  Each scan
//! matches every configured signature against the raw listing produced by the
//! platform and records which hardware instances were found.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Safety cap on instances reported for a single signature.
pub const MAX_INSTANCES: usize = 10;

/// A configured hardware identity the monitor watches for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogicalDevice {
    /// Stable key used in snapshots and the status file (e.g. "4750").
    pub name: String,
    pub vendor_id: String,
    pub product_id: String,
    /// Name given to a second physical unit sharing this signature.  When
    /// set, the first match maps to `name`, the second to `secondary_name`,
    /// and any further units are ignored.
    #[serde(default)]
    pub secondary_name: Option<String>,
}

impl LogicalDevice {
    pub fn new(name: &str, vendor_id: &str, product_id: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor_id: vendor_id.to_string(),
            product_id: product_id.to_string(),
            secondary_name: None,
        }
    }

    pub fn with_secondary(mut self, name: &str) -> Self {
        self.secondary_name = Some(name.to_string());
        self
    }

    /// Every snapshot key this device contributes, primary first.
    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.secondary_name.as_deref())
    }

    /// Case-insensitive containment of both ids within one listing line.
    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        text.contains(&self.vendor_id.to_lowercase())
            && text.contains(&self.product_id.to_lowercase())
    }
}

/// One line of a hardware listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLine {
    /// Identifier of the physical unit (bus/device address, PnP instance path, …).
    pub instance_id: String,
    /// Raw listing text matched against device signatures.
    pub text: String,
}

impl DeviceLine {
    pub fn new(instance_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            text: text.into(),
        }
    }
}

/// Presence of one logical device in the latest scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub count: usize,
    pub instances: Vec<String>,
}

impl DeviceStatus {
    fn from_instances(instances: Vec<String>) -> Self {
        Self {
            connected: !instances.is_empty(),
            count: instances.len(),
            instances,
        }
    }
}

/// Immutable result of one scan cycle, keyed by logical device name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceStatusSnapshot(BTreeMap<String, DeviceStatus>);

impl DeviceStatusSnapshot {
    /// Matches every configured device against `lines`.
    ///
    /// Lines are visited in listing order, which decides which unit becomes
    /// the primary and which the secondary instance.
    pub fn build(devices: &[LogicalDevice], lines: &[DeviceLine]) -> Self {
        let mut entries = BTreeMap::new();

        for device in devices {
            let matched: Vec<String> = lines
                .iter()
                .filter(|line| device.matches(&line.text))
                .map(|line| line.instance_id.clone())
                .take(MAX_INSTANCES)
                .collect();

            match &device.secondary_name {
                Some(secondary) => {
                    let mut units = matched.into_iter();
                    let primary: Vec<String> = units.next().into_iter().collect();
                    let second: Vec<String> = units.next().into_iter().collect();
                    entries.insert(device.name.clone(), DeviceStatus::from_instances(primary));
                    entries.insert(secondary.clone(), DeviceStatus::from_instances(second));
                }
                None => {
                    entries.insert(device.name.clone(), DeviceStatus::from_instances(matched));
                }
            }
        }

        Self(entries)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceStatus> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceStatus)> {
        self.0.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.0.values().filter(|s| s.connected).count()
    }
}
