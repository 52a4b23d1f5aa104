//! BLE Scanner Module
//!
//! Discovers DOT sensors from advertisements. Devices that advertise without
//! a name, or with another name, are held until an advertisement carries the
//! target name. Each device is reported once per scan.

use crate::domain::models::DeviceIdentity;
use std::collections::{HashMap, HashSet};

const TRANSPORT_PREFIX: &str = "BluetoothLE-";

/// Transport id for a 48-bit Bluetooth address, e.g.
/// `BluetoothLE-d4:22:cd:00:1a:2b`.
pub fn transport_id(address: u64) -> String {
    let bytes = address.to_be_bytes();
    let hex: Vec<String> = bytes[2..].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", TRANSPORT_PREFIX, hex.join(":"))
}

/// Inverse of [`transport_id`].
pub fn parse_address(transport_id: &str) -> Option<u64> {
    let tail = transport_id.rsplit('-').next()?;
    let digits: String = tail.chars().filter(|c| *c != ':').collect();
    if digits.len() != 12 {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

/// Held/confirmed bookkeeping for advertisements.
#[derive(Debug, Default)]
pub struct DeviceFilter {
    target_name: String,
    confirmed: HashSet<String>,
    held: HashMap<String, String>,
}

impl DeviceFilter {
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..Default::default()
        }
    }

    /// Sighting of a device. Returns its identity the first time the name
    /// matches.
    pub fn added(&mut self, id: &str, name: &str) -> Option<DeviceIdentity> {
        if self.confirmed.contains(id) || self.held.contains_key(id) {
            return self.updated(id, name);
        }
        if self.matches(name) {
            self.confirmed.insert(id.to_string());
            return Some(DeviceIdentity::new(id, name));
        }
        self.held.insert(id.to_string(), name.to_string());
        None
    }

    /// Later sighting. A held device whose name now matches is promoted.
    pub fn updated(&mut self, id: &str, name: &str) -> Option<DeviceIdentity> {
        if self.confirmed.contains(id) {
            return None;
        }
        let held = self.held.get_mut(id)?;
        if !name.is_empty() {
            *held = name.to_string();
        }
        if !self.matches(name) {
            return None;
        }
        self.held.remove(id);
        self.confirmed.insert(id.to_string());
        Some(DeviceIdentity::new(id, name))
    }

    pub fn is_confirmed(&self, id: &str) -> bool {
        self.confirmed.contains(id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.held.clear();
    }

    fn matches(&self, name: &str) -> bool {
        !name.is_empty() && name == self.target_name
    }
}

#[cfg(windows)]
pub use watcher::BleScanner;

#[cfg(windows)]
mod watcher {
    use super::{transport_id, DeviceFilter};
    use crate::domain::events::EventSink;
    use crate::domain::models::AppEvent;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, info};
    use windows::Devices::Bluetooth::Advertisement::{
        BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
        BluetoothLEScanningMode,
    };
    use windows::Foundation::TypedEventHandler;

    /// Advertisement watcher reporting DOT sensors as [`AppEvent::DeviceFound`].
    pub struct BleScanner {
        watcher: Option<BluetoothLEAdvertisementWatcher>,
        filter: Arc<Mutex<DeviceFilter>>,
        events: EventSink,
    }

    impl BleScanner {
        pub fn new(events: EventSink, target_name: &str) -> Self {
            Self {
                watcher: None,
                filter: Arc::new(Mutex::new(DeviceFilter::new(target_name))),
                events,
            }
        }

        /// Start scanning. Any previous scan is stopped and its results forgotten.
        pub fn start(&mut self) -> Result<()> {
            self.stop()?;
            if let Ok(mut filter) = self.filter.lock() {
                filter.clear();
            }

            info!("Starting BLE scan for DOT sensors");
            self.events.info("[info] Scanning for DOT sensors...");

            let watcher = BluetoothLEAdvertisementWatcher::new()?;
            watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

            let filter = self.filter.clone();
            let events = self.events.clone();
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                      args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let name = args.Advertisement()?.LocalName()?.to_string();
                        let id = transport_id(args.BluetoothAddress()?);

                        let found = match filter.lock() {
                            Ok(mut filter) => filter.added(&id, &name),
                            Err(_) => None,
                        };
                        if let Some(identity) = found {
                            debug!("Advertisement from {} accepted", id);
                            events.send(AppEvent::DeviceFound(identity));
                        }
                    }
                    Ok(())
                },
            );

            watcher.Received(&handler)?;
            watcher.Start()?;
            self.watcher = Some(watcher);
            Ok(())
        }

        pub fn stop(&mut self) -> Result<()> {
            if let Some(watcher) = self.watcher.take() {
                info!("Stopping BLE scan...");
                self.events.info("[info] Scan stopped.");
                watcher.Stop()?;
            }
            Ok(())
        }
    }

    impl Drop for BleScanner {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }
}
