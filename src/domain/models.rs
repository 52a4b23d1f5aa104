use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identity of a queued DOT sensor. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    transport_id: String,
    friendly_name: String,
}

impl DeviceIdentity {
    pub fn new(transport_id: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            friendly_name: friendly_name.into(),
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Short, readable name built from the tail of the transport id,
    /// e.g. `BluetoothLE-d4:22:cd:00:1a:2b` becomes `DOT D4:22:CD:00:1A:2B`.
    pub fn short_name(&self) -> String {
        let suffix = self
            .transport_id
            .rsplit('-')
            .next()
            .unwrap_or(&self.transport_id);
        format!("DOT {}", suffix.to_uppercase())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

/// Orientation quaternion as reported by the sensor (not re-normalised).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Euler angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EulerAngles {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Payload codes understood by the DOT control characteristic.
///
/// Codes 1..=26 are streaming formats the sensor can be asked for. 27..=30 are
/// pseudo-types used only to decode reads of battery and control
/// characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    HighFidelityWithMag,
    ExtendedQuaternion,
    CompleteQuaternion,
    OrientationEuler,
    OrientationQuaternion,
    FreeAcceleration,
    ExtendedEuler,
    CompleteEuler,
    HighFidelity,
    DeltaQuantitiesWithMag,
    DeltaQuantities,
    RateQuantitiesWithMag,
    RateQuantities,
    CustomMode1,
    CustomMode2,
    CustomMode3,
    CustomMode4,
    CustomMode5,
    BatteryDetails,
    MeasurementGeneralDetails,
    OrientationResetStatus,
    OrientationResetControlData,
}

impl PayloadType {
    pub fn code(self) -> u8 {
        match self {
            Self::HighFidelityWithMag => 1,
            Self::ExtendedQuaternion => 2,
            Self::CompleteQuaternion => 3,
            Self::OrientationEuler => 4,
            Self::OrientationQuaternion => 5,
            Self::FreeAcceleration => 6,
            Self::ExtendedEuler => 7,
            Self::CompleteEuler => 16,
            Self::HighFidelity => 17,
            Self::DeltaQuantitiesWithMag => 18,
            Self::DeltaQuantities => 19,
            Self::RateQuantitiesWithMag => 20,
            Self::RateQuantities => 21,
            Self::CustomMode1 => 22,
            Self::CustomMode2 => 23,
            Self::CustomMode3 => 24,
            Self::CustomMode4 => 25,
            Self::CustomMode5 => 26,
            Self::BatteryDetails => 27,
            Self::MeasurementGeneralDetails => 28,
            Self::OrientationResetStatus => 29,
            Self::OrientationResetControlData => 30,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let payload = match code {
            1 => Self::HighFidelityWithMag,
            2 => Self::ExtendedQuaternion,
            3 => Self::CompleteQuaternion,
            4 => Self::OrientationEuler,
            5 => Self::OrientationQuaternion,
            6 => Self::FreeAcceleration,
            7 => Self::ExtendedEuler,
            16 => Self::CompleteEuler,
            17 => Self::HighFidelity,
            18 => Self::DeltaQuantitiesWithMag,
            19 => Self::DeltaQuantities,
            20 => Self::RateQuantitiesWithMag,
            21 => Self::RateQuantities,
            22 => Self::CustomMode1,
            23 => Self::CustomMode2,
            24 => Self::CustomMode3,
            25 => Self::CustomMode4,
            26 => Self::CustomMode5,
            27 => Self::BatteryDetails,
            28 => Self::MeasurementGeneralDetails,
            29 => Self::OrientationResetStatus,
            30 => Self::OrientationResetControlData,
            _ => return None,
        };
        Some(payload)
    }

    /// True for formats that may be requested on the control characteristic.
    pub fn is_streaming(self) -> bool {
        self.code() <= 26
    }
}

/// Charging state byte of the battery frame. Unknown codes are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingState {
    Unplugged,
    Plugged,
    Unknown(u8),
}

impl From<u8> for ChargingState {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Unplugged,
            1 => Self::Plugged,
            other => Self::Unknown(other),
        }
    }
}

/// States of the orientation-reset control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingResetState {
    ResetHeading,
    RevertToDefault,
    DefaultStatus,
    Unknown(u8),
}

impl HeadingResetState {
    pub fn code(self) -> u8 {
        match self {
            Self::ResetHeading => 1,
            Self::RevertToDefault => 7,
            Self::DefaultStatus => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u8> for HeadingResetState {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::ResetHeading,
            7 => Self::RevertToDefault,
            8 => Self::DefaultStatus,
            other => Self::Unknown(other),
        }
    }
}

/// Per-device session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unpaired,
    Paired,
    Connected,
    ServicesResolved,
    Subscribed,
    Streaming,
    Disconnected,
}

impl SessionState {
    /// True once a GATT connection exists, regardless of how far the
    /// handshake has progressed.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::ServicesResolved | Self::Subscribed | Self::Streaming
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JointAngleReading {
    pub proximal: DeviceIdentity,
    pub distal: DeviceIdentity,
    pub angles: EulerAngles,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(DeviceIdentity),
    SessionState(DeviceIdentity, SessionState),
    Notify(StatusMessage),
    Stream(String),
    JointAngle(JointAngleReading),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
    pub timestamp: SystemTime,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_uses_id_suffix() {
        let id = DeviceIdentity::new("BluetoothLE#BluetoothLE00:aa-d4:22:cd:00:1a:2b", "Xsens DOT");
        assert_eq!(id.short_name(), "DOT D4:22:CD:00:1A:2B");

        let bare = DeviceIdentity::new("abc", "Xsens DOT");
        assert_eq!(bare.short_name(), "DOT ABC");
    }

    #[test]
    fn test_payload_codes() {
        assert_eq!(PayloadType::CompleteQuaternion.code(), 3);
        assert_eq!(PayloadType::CompleteEuler.code(), 16);
        assert_eq!(PayloadType::from_code(30), Some(PayloadType::OrientationResetControlData));
        assert_eq!(PayloadType::from_code(8), None);
        assert!(PayloadType::CustomMode5.is_streaming());
        assert!(!PayloadType::BatteryDetails.is_streaming());
    }

    #[test]
    fn test_heading_state_codes() {
        assert_eq!(HeadingResetState::from(8), HeadingResetState::DefaultStatus);
        assert_eq!(HeadingResetState::from(42), HeadingResetState::Unknown(42));
        assert_eq!(HeadingResetState::RevertToDefault.code(), 7);
    }
}
