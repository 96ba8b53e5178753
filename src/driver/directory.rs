//! Slot registry binding discovered devices to stable identifiers.
//!
//! Discovery is a one-shot scan: a [`DriverFactory`] enumerates whatever is
//! reachable and the directory assigns `slotNN` identifiers in enumeration
//! order, closing any previously bound drivers first. The directory owns its
//! own lock, taken only during discovery and lookup, so a rescan never blocks
//! job status reads.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{DeviceInfo, MeasurementDriver};

/// One device produced by a discovery scan.
pub struct DiscoveredDevice {
    /// Port or address the device answers on
    pub port: String,
    /// Hardware serial number, when the transport exposes one
    pub sn: Option<String>,
    /// Capability object bound to the device
    pub driver: Arc<dyn MeasurementDriver>,
}

/// Produces capability objects for whatever hardware is currently attached.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>>;
}

struct DeviceEntry {
    info: DeviceInfo,
    driver: Arc<dyn MeasurementDriver>,
}

/// Slot to driver mapping for the currently attached device bank.
#[derive(Default)]
pub struct DeviceDirectory {
    entries: Mutex<BTreeMap<String, DeviceEntry>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerate devices, rebinding all slots.
    ///
    /// Existing drivers are closed before the scan; slot identifiers are
    /// reassigned from `slot01` upwards. Returns the new slot list.
    pub async fn rescan(&self, factory: &dyn DriverFactory) -> Result<Vec<String>> {
        let discovered = factory.enumerate().await?;

        let mut entries = self.entries.lock().await;
        for entry in entries.values() {
            entry.driver.close().await;
        }
        entries.clear();

        for (i, device) in discovered.into_iter().enumerate() {
            let slot = format!("slot{:02}", i + 1);
            entries.insert(
                slot.clone(),
                DeviceEntry {
                    info: DeviceInfo {
                        slot,
                        port: device.port,
                        sn: device.sn,
                    },
                    driver: device.driver,
                },
            );
        }
        Ok(entries.keys().cloned().collect())
    }

    /// Descriptions of all bound devices, in slot order.
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let entries = self.entries.lock().await;
        entries.values().map(|e| e.info.clone()).collect()
    }

    /// All known slot identifiers, sorted.
    pub async fn slots(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.keys().cloned().collect()
    }

    /// Number of bound devices.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no device is bound.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Driver bound to a slot, if any.
    pub async fn driver(&self, slot: &str) -> Option<Arc<dyn MeasurementDriver>> {
        let entries = self.entries.lock().await;
        entries.get(slot).map(|e| Arc::clone(&e.driver))
    }

    /// Driver of the lowest-numbered slot. The bank is homogeneously
    /// configured, so mode introspection can use any bound device.
    pub async fn first_driver(&self) -> Option<Arc<dyn MeasurementDriver>> {
        let entries = self.entries.lock().await;
        entries.values().next().map(|e| Arc::clone(&e.driver))
    }

    /// Filter a requested slot list down to slots that are actually bound.
    pub async fn filter_known(&self, requested: &[String]) -> Vec<String> {
        let entries = self.entries.lock().await;
        requested
            .iter()
            .filter(|slot| entries.contains_key(*slot))
            .cloned()
            .collect()
    }

    /// Close every bound driver. Called at shutdown.
    pub async fn close_all(&self) {
        let entries = self.entries.lock().await;
        for entry in entries.values() {
            entry.driver.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriverFactory;

    #[tokio::test]
    async fn test_rescan_assigns_slot_identifiers() {
        let directory = DeviceDirectory::new();
        let slots = directory.rescan(&MockDriverFactory::new(3)).await.unwrap();
        assert_eq!(slots, vec!["slot01", "slot02", "slot03"]);
        assert_eq!(directory.len().await, 3);
        assert!(directory.driver("slot02").await.is_some());
        assert!(directory.driver("slot04").await.is_none());
    }

    #[tokio::test]
    async fn test_rescan_rebinds_from_scratch() {
        let directory = DeviceDirectory::new();
        directory.rescan(&MockDriverFactory::new(3)).await.unwrap();
        let slots = directory.rescan(&MockDriverFactory::new(1)).await.unwrap();
        assert_eq!(slots, vec!["slot01"]);
        assert!(directory.driver("slot02").await.is_none());
    }

    #[tokio::test]
    async fn test_filter_known_keeps_order() {
        let directory = DeviceDirectory::new();
        directory.rescan(&MockDriverFactory::new(2)).await.unwrap();
        let filtered = directory
            .filter_known(&["slot02".into(), "slot09".into(), "slot01".into()])
            .await;
        assert_eq!(filtered, vec!["slot02", "slot01"]);
    }
}
