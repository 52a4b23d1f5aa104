//! GATT Transport
//!
//! The seam between device sessions and the host Bluetooth stack. Sessions
//! only speak in service/characteristic UUIDs; backends map those onto their
//! platform handles.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::infrastructure::bluetooth::protocol::DecodeError;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    RadioOff,
    DeviceUnavailable,
    Unknown,
}

/// HRESULT_FROM_WIN32(ERROR_DEVICE_NOT_AVAILABLE)
pub const E_DEVICE_NOT_AVAILABLE: i32 = 0x800710DF_u32 as i32;
/// HRESULT_FROM_WIN32(ERROR_NOT_FOUND)
pub const E_NOT_FOUND: i32 = 0x80070490_u32 as i32;

impl ConnectFailure {
    /// Classify a host error code. A null async result surfaces as code 0.
    pub fn from_hresult(code: i32) -> Self {
        match code {
            E_DEVICE_NOT_AVAILABLE => Self::RadioOff,
            0 | E_NOT_FOUND => Self::DeviceUnavailable,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::RadioOff => "Bluetooth radio is off",
            Self::DeviceUnavailable => "device unavailable",
            Self::Unknown => "unknown failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BleError {
    #[error("Pairing failed: {0}")]
    PairingFailed(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(ConnectFailure),
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Access to service {0} denied")]
    AccessDenied(Uuid),
    #[error("Characteristic {0} does not honour notify")]
    SubscriptionUnauthorized(Uuid),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(Uuid),
    #[error("Not subscribed to {0}")]
    NotSubscribed(Uuid),
    #[error("Operation requires {expected}, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Heading reset is only possible while streaming")]
    NotStreaming,
    #[error("Heading reset did not converge after {0} attempts")]
    HeadingResetTimeout(u32),
}

/// Client characteristic configuration descriptor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdValue {
    None,
    Notify,
}

/// A resolved characteristic, addressed by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Token identifying one registered value-changed handler.
pub type HandlerToken = i64;

/// Platform access to a single remote device.
#[async_trait]
pub trait GattTransport: Send + Sync {
    fn is_paired(&self) -> bool;

    /// Platform pairing request. May show a consent prompt.
    async fn pair(&self) -> Result<(), BleError>;

    async fn connect(&self) -> Result<(), BleError>;

    async fn disconnect(&self);

    /// One-shot uncached service discovery. An empty list means the platform
    /// has not populated it yet.
    async fn discover_services(&self) -> Result<Vec<Uuid>, BleError>;

    async fn request_access(&self, service: Uuid) -> Result<(), BleError>;

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BleError>;

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>, BleError>;

    async fn write(&self, characteristic: CharacteristicRef, value: &[u8]) -> Result<(), BleError>;

    async fn write_cccd(
        &self,
        characteristic: CharacteristicRef,
        value: CccdValue,
    ) -> Result<(), BleError>;

    /// Forward every value-changed notification of `characteristic` into `sink`.
    fn add_value_handler(
        &self,
        characteristic: CharacteristicRef,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<HandlerToken, BleError>;

    fn remove_value_handler(
        &self,
        characteristic: CharacteristicRef,
        token: HandlerToken,
    ) -> Result<(), BleError>;
}
