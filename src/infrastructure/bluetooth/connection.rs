//! BLE Connection Module
//!
//! WinRT implementation of [`GattTransport`] for one remote device.

use crate::infrastructure::bluetooth::scanner::parse_address;
use crate::infrastructure::bluetooth::transport::{
    BleError, CccdValue, CharacteristicRef, ConnectFailure, GattTransport, HandlerToken,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{GUID, HRESULT};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattSessionStatus,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Devices::Enumeration::{DeviceAccessStatus, DevicePairingResultStatus};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Polls of the GattSession status before the device counts as unreachable.
const SESSION_ACTIVE_POLLS: u32 = 20;
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(250);

const E_ACCESSDENIED: HRESULT = HRESULT(0x80070005_u32 as i32);

fn uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// Platform handles for one DOT.
pub struct WinRtTransport {
    device: BluetoothLEDevice,
    session: Mutex<Option<GattSession>>,
    services: Mutex<HashMap<Uuid, GattDeviceService>>,
    characteristics: Mutex<HashMap<CharacteristicRef, GattCharacteristic>>,
}

impl WinRtTransport {
    /// Obtain the device object for `transport_id`. This does not connect.
    pub async fn open(transport_id: &str) -> Result<Self, BleError> {
        let address = parse_address(transport_id)
            .ok_or(BleError::ConnectFailed(ConnectFailure::DeviceUnavailable))?;
        info!("Opening Bluetooth device: {:#X}", address);

        let device = async {
            BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await
        }
        .await
        .map_err(|e| {
            warn!("FromBluetoothAddressAsync failed: {}", e);
            BleError::ConnectFailed(connect_failure(&e))
        })?;

        Ok(Self {
            device,
            session: Mutex::new(None),
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
        })
    }

    fn service(&self, service: Uuid) -> Result<GattDeviceService, BleError> {
        self.services
            .lock()
            .ok()
            .and_then(|services| services.get(&service).cloned())
            .ok_or(BleError::ServiceNotFound(service))
    }

    fn characteristic(
        &self,
        characteristic: CharacteristicRef,
    ) -> Result<GattCharacteristic, BleError> {
        self.characteristics
            .lock()
            .ok()
            .and_then(|chars| chars.get(&characteristic).cloned())
            .ok_or(BleError::CharacteristicNotFound(characteristic.characteristic))
    }
}

fn connect_failure(e: &windows::core::Error) -> ConnectFailure {
    ConnectFailure::from_hresult(e.code().0)
}

#[async_trait]
impl GattTransport for WinRtTransport {
    fn is_paired(&self) -> bool {
        self.device
            .DeviceInformation()
            .and_then(|info| info.Pairing())
            .and_then(|pairing| pairing.IsPaired())
            .unwrap_or(false)
    }

    async fn pair(&self) -> Result<(), BleError> {
        let status = async {
            let pairing = self.device.DeviceInformation()?.Pairing()?;
            pairing.PairAsync()?.await?.Status()
        }
        .await
        .map_err(|e| BleError::PairingFailed(e.to_string()))?;

        info!("Pairing result: {:?}", status);
        match status {
            DevicePairingResultStatus::Paired | DevicePairingResultStatus::AlreadyPaired => Ok(()),
            other => Err(BleError::PairingFailed(format!("{:?}", other))),
        }
    }

    async fn connect(&self) -> Result<(), BleError> {
        // A GattSession with MaintainConnection keeps the link up between calls.
        let session = async {
            let device_id = self.device.BluetoothDeviceId()?;
            let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
            session.SetMaintainConnection(true)?;
            Ok::<_, windows::core::Error>(session)
        }
        .await
        .map_err(|e| BleError::ConnectFailed(connect_failure(&e)))?;

        info!("GattSession created, MaintainConnection set to true");
        let mut active = false;
        for _ in 0..SESSION_ACTIVE_POLLS {
            if matches!(session.SessionStatus(), Ok(GattSessionStatus::Active)) {
                active = true;
                break;
            }
            tokio::time::sleep(SESSION_POLL_INTERVAL).await;
        }
        if !active {
            warn!("GattSession never became active");
            let _ = session.Close();
            return Err(BleError::ConnectFailed(ConnectFailure::DeviceUnavailable));
        }

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().ok().and_then(|mut slot| slot.take());
        if let Some(session) = session {
            let _ = session.Close();
        }
        if let Ok(mut chars) = self.characteristics.lock() {
            chars.clear();
        }
        if let Ok(mut services) = self.services.lock() {
            for service in services.values() {
                let _ = service.Close();
            }
            services.clear();
        }
        info!("Disconnected from device");
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>, BleError> {
        let result = async {
            self.device
                .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                .await
        }
        .await
        .map_err(|e| BleError::ReadFailed(e.to_string()))?;

        let status = result
            .Status()
            .map_err(|e| BleError::ReadFailed(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            // Unreachable for now; the caller retries.
            debug!("GetGattServicesAsync status {:?}", status);
            return Ok(Vec::new());
        }

        let found = (|| -> windows::core::Result<Vec<(Uuid, GattDeviceService)>> {
            let services = result.Services()?;
            let mut found = Vec::new();
            for i in 0..services.Size()? {
                let service = services.GetAt(i)?;
                found.push((uuid(service.Uuid()?), service));
            }
            Ok(found)
        })()
        .map_err(|e| BleError::ReadFailed(e.to_string()))?;

        let uuids = found.iter().map(|(id, _)| *id).collect();
        if let Ok(mut services) = self.services.lock() {
            services.extend(found);
        }
        Ok(uuids)
    }

    async fn request_access(&self, service: Uuid) -> Result<(), BleError> {
        let gatt_service = self.service(service)?;
        let status = async { gatt_service.RequestAccessAsync()?.await }
            .await
            .map_err(|_| BleError::AccessDenied(service))?;

        info!("Service access status: {:?}", status);
        if status == DeviceAccessStatus::Allowed {
            Ok(())
        } else {
            Err(BleError::AccessDenied(service))
        }
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BleError> {
        let gatt_service = self.service(service)?;
        let result = async {
            gatt_service
                .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                .await
        }
        .await
        .map_err(|e| {
            if e.code() == E_ACCESSDENIED {
                BleError::AccessDenied(service)
            } else {
                BleError::ReadFailed(e.to_string())
            }
        })?;

        let found = (|| -> windows::core::Result<Vec<(Uuid, GattCharacteristic)>> {
            if result.Status()? != GattCommunicationStatus::Success {
                return Ok(Vec::new());
            }
            let characteristics = result.Characteristics()?;
            let mut found = Vec::new();
            for i in 0..characteristics.Size()? {
                let c = characteristics.GetAt(i)?;
                found.push((uuid(c.Uuid()?), c));
            }
            Ok(found)
        })()
        .map_err(|e| BleError::ReadFailed(e.to_string()))?;

        info!("Found {} characteristics", found.len());
        let uuids = found.iter().map(|(id, _)| *id).collect();
        if let Ok(mut chars) = self.characteristics.lock() {
            for (id, c) in found {
                chars.insert(CharacteristicRef::new(service, id), c);
            }
        }
        Ok(uuids)
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>, BleError> {
        let gatt = self.characteristic(characteristic)?;
        let result = async {
            gatt.ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                .await
        }
        .await
        .map_err(|e| BleError::ReadFailed(e.to_string()))?;

        let status = result
            .Status()
            .map_err(|e| BleError::ReadFailed(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            return Err(BleError::ReadFailed(format!("{:?}", status)));
        }
        result
            .Value()
            .and_then(|buffer| buffer_to_vec(&buffer))
            .map_err(|e| BleError::ReadFailed(e.to_string()))
    }

    async fn write(&self, characteristic: CharacteristicRef, value: &[u8]) -> Result<(), BleError> {
        let gatt = self.characteristic(characteristic)?;
        let buffer = (|| {
            let writer = DataWriter::new()?;
            writer.WriteBytes(value)?;
            writer.DetachBuffer()
        })()
        .map_err(|e| BleError::WriteFailed(e.to_string()))?;

        let status = async { gatt.WriteValueAsync(&buffer)?.await }
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))?;

        if status == GattCommunicationStatus::Success {
            Ok(())
        } else {
            Err(BleError::WriteFailed(format!("{:?}", status)))
        }
    }

    async fn write_cccd(
        &self,
        characteristic: CharacteristicRef,
        value: CccdValue,
    ) -> Result<(), BleError> {
        let gatt = self.characteristic(characteristic)?;
        let descriptor = match value {
            CccdValue::None => GattClientCharacteristicConfigurationDescriptorValue::None,
            CccdValue::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
        };

        let status = async {
            gatt.WriteClientCharacteristicConfigurationDescriptorAsync(descriptor)?
                .await
        }
        .await
        .map_err(|e| {
            if e.code() == E_ACCESSDENIED {
                BleError::SubscriptionUnauthorized(characteristic.characteristic)
            } else {
                BleError::WriteFailed(e.to_string())
            }
        })?;

        if status == GattCommunicationStatus::Success {
            Ok(())
        } else if status == GattCommunicationStatus::AccessDenied {
            Err(BleError::SubscriptionUnauthorized(characteristic.characteristic))
        } else {
            Err(BleError::WriteFailed(format!(
                "Error registering for value changes: {:?}",
                status
            )))
        }
    }

    fn add_value_handler(
        &self,
        characteristic: CharacteristicRef,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<HandlerToken, BleError> {
        let gatt = self.characteristic(characteristic)?;
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = buffer_to_vec(&args.CharacteristicValue()?)?;
                    let _ = sink.send(bytes);
                }
                Ok(())
            },
        );
        gatt.ValueChanged(&handler)
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    fn remove_value_handler(
        &self,
        characteristic: CharacteristicRef,
        token: HandlerToken,
    ) -> Result<(), BleError> {
        let gatt = self.characteristic(characteristic)?;
        gatt.RemoveValueChanged(token)
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }
}
