//! BLE client for communicating with an SPatch device.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

/// Vitals service UUIDs
pub const VITALS_SERVICE_UUID: Uuid = Uuid::from_u128(0x66900001_da64_5a97_8c4f_04b8593ff99b);
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x66900002_da64_5a97_8c4f_04b8593ff99b);
pub const LIVE_UUID: Uuid = Uuid::from_u128(0x66900003_da64_5a97_8c4f_04b8593ff99b);
pub const DB_UUID: Uuid = Uuid::from_u128(0x66900005_da64_5a97_8c4f_04b8593ff99b);
pub const MOTION_UUID: Uuid = Uuid::from_u128(0x66900006_da64_5a97_8c4f_04b8593ff99b);

/// Standard SIG UUIDs
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// BLE client for communicating with the SPatch device.
pub struct VitalsClient {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    /// Notifications received so far, grouped by characteristic
    notifications: Arc<Mutex<HashMap<Uuid, Vec<Vec<u8>>>>>,
}

impl VitalsClient {
    /// Scan for a device whose name starts with the given prefix and connect.
    pub async fn connect_by_prefix(prefix: &str, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = Self::find_device_by_prefix(&adapter, prefix, scan_timeout).await?;
        adapter.stop_scan().await?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();

        let notifications: Arc<Mutex<HashMap<Uuid, Vec<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Spawn notification collector
        let collected = notifications.clone();
        let peripheral_clone = peripheral.clone();
        tokio::spawn(async move {
            let mut stream = match peripheral_clone.notifications().await {
                Ok(s) => s,
                Err(_) => return,
            };

            while let Some(data) = stream.next().await {
                let mut map = collected.lock().await;
                map.entry(data.uuid).or_default().push(data.value);
            }
        });

        Ok(Self {
            peripheral,
            characteristics,
            notifications,
        })
    }

    /// Find a device by name prefix within the scan timeout.
    async fn find_device_by_prefix(
        adapter: &Adapter,
        prefix: &str,
        scan_timeout: Duration,
    ) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            let peripherals = adapter.peripherals().await?;

            for peripheral in peripherals {
                if let Some(props) = peripheral.properties().await? {
                    if let Some(local_name) = props.local_name {
                        if local_name.starts_with(prefix) {
                            println!("    Found \"{}\"", local_name);
                            return Ok(peripheral);
                        }
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("No device matching '{}*' found within timeout", prefix))
    }

    /// Look up a characteristic by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| anyhow!("Characteristic {} not found", uuid))
    }

    /// Subscribe to notifications/indications on a characteristic.
    pub async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?.clone();
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    /// Unsubscribe from a characteristic.
    pub async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?.clone();
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    /// Write to the control point with response, so attribute-level
    /// rejections surface as errors.
    pub async fn write_control(&self, payload: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(CONTROL_POINT_UUID)?.clone();
        self.peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    /// Read a characteristic value.
    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?.clone();
        Ok(self.peripheral.read(&characteristic).await?)
    }

    /// Drain the notifications collected so far for one characteristic.
    pub async fn take_notifications(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        let mut map = self.notifications.lock().await;
        map.remove(&uuid).unwrap_or_default()
    }

    /// Wait until at least `count` notifications have arrived on a
    /// characteristic, then drain them.
    pub async fn wait_for_notifications(
        &self,
        uuid: Uuid,
        count: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        let result = timeout(wait_timeout, async {
            loop {
                {
                    let map = self.notifications.lock().await;
                    if map.get(&uuid).map_or(0, |v| v.len()) >= count {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if result.is_err() {
            let partial = self.take_notifications(uuid).await;
            return Err(anyhow!(
                "Timeout waiting for {} notifications (got {})",
                count,
                partial.len()
            ));
        }

        Ok(self.take_notifications(uuid).await)
    }

    /// Discard everything collected so far.
    pub async fn clear_notifications(&self) {
        let mut map = self.notifications.lock().await;
        map.clear();
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
