//! Xsens DOT Protocol
//!
//! GATT identifiers, frame layouts and the payload codec for the DOT
//! measurement, battery and control characteristics.

use crate::domain::models::{
    ChargingState, DeviceIdentity, EulerAngles, HeadingResetState, JointAngleReading,
    PayloadType, Quaternion, Vector3,
};
use thiserror::Error;
use uuid::Uuid;

/// Advertised name every DOT sensor uses.
pub const TARGET_DEVICE_NAME: &str = "Xsens DOT";

pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x15173000_4947_11e9_8646_d663bd873d93);
pub const BATTERY_CHAR_UUID: Uuid = Uuid::from_u128(0x15173001_4947_11e9_8646_d663bd873d93);

pub const MEASUREMENT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x15172000_4947_11e9_8646_d663bd873d93);
/// Start/stop streaming and payload selection
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x15172001_4947_11e9_8646_d663bd873d93);
pub const LONG_PAYLOAD_CHAR_UUID: Uuid = Uuid::from_u128(0x15172002_4947_11e9_8646_d663bd873d93);
/// Carries CompleteEuler and CompleteQuaternion notifications
pub const MEDIUM_PAYLOAD_CHAR_UUID: Uuid =
    Uuid::from_u128(0x15172003_4947_11e9_8646_d663bd873d93);
pub const SHORT_PAYLOAD_CHAR_UUID: Uuid = Uuid::from_u128(0x15172004_4947_11e9_8646_d663bd873d93);
pub const ORIENTATION_RESET_CONTROL_CHAR_UUID: Uuid =
    Uuid::from_u128(0x15172006_4947_11e9_8646_d663bd873d93);
pub const ORIENTATION_RESET_STATUS_CHAR_UUID: Uuid =
    Uuid::from_u128(0x15172007_4947_11e9_8646_d663bd873d93);

/// Control frame byte offsets
pub mod control_frame {
    pub const MEASUREMENT_TYPE: usize = 0;
    pub const ACTION: usize = 1;
    pub const PAYLOAD: usize = 2;
    pub const MIN_LEN: usize = 3;

    pub const ACTION_STOP: u8 = 0;
    pub const ACTION_START: u8 = 1;
}

pub const BATTERY_FRAME_LEN: usize = 2;
pub const COMPLETE_EULER_FRAME_LEN: usize = 28;
pub const COMPLETE_QUATERNION_FRAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Insufficient Data: {payload:?} needs {expected} bytes, got {actual}")]
    InsufficientPayload {
        payload: PayloadType,
        expected: usize,
        actual: usize,
    },
    #[error("No decoder for payload type {0:?}")]
    Unsupported(PayloadType),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryFrame {
    pub percentage: u8,
    pub charging: ChargingState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerFrame {
    pub timestamp: u32,
    pub euler: EulerAngles,
    pub free_acceleration: Vector3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuaternionFrame {
    pub timestamp: u32,
    pub quaternion: Quaternion,
    pub free_acceleration: Vector3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementDetails {
    pub measurement_type: u8,
    pub action: u8,
    pub payload_code: u8,
}

/// One decoded notification or characteristic read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedFrame {
    Battery(BatteryFrame),
    CompleteEuler(EulerFrame),
    CompleteQuaternion(QuaternionFrame),
    MeasurementDetails(MeasurementDetails),
    /// 1 = success, 2 = fail
    OrientationResetStatus(u8),
    OrientationResetControl(HeadingResetState),
}

impl DecodedFrame {
    pub fn quaternion(&self) -> Option<Quaternion> {
        match self {
            Self::CompleteQuaternion(frame) => Some(frame.quaternion),
            _ => None,
        }
    }
}

/// Decode a raw buffer as `payload_type`.
///
/// Only the length is checked: NaN floats and unexpected enum bytes are
/// handed through so the stream shows exactly what the sensor sent.
pub fn decode(bytes: &[u8], payload_type: PayloadType) -> Result<DecodedFrame, DecodeError> {
    let require = |expected: usize| {
        if bytes.len() < expected {
            Err(DecodeError::InsufficientPayload {
                payload: payload_type,
                expected,
                actual: bytes.len(),
            })
        } else {
            Ok(())
        }
    };

    match payload_type {
        PayloadType::BatteryDetails => {
            require(BATTERY_FRAME_LEN)?;
            Ok(DecodedFrame::Battery(BatteryFrame {
                percentage: bytes[0],
                charging: ChargingState::from(bytes[1]),
            }))
        }
        PayloadType::CompleteEuler => {
            require(COMPLETE_EULER_FRAME_LEN)?;
            Ok(DecodedFrame::CompleteEuler(EulerFrame {
                timestamp: read_u32(bytes, 0),
                euler: EulerAngles {
                    x: read_f32(bytes, 4),
                    y: read_f32(bytes, 8),
                    z: read_f32(bytes, 12),
                },
                free_acceleration: Vector3 {
                    x: read_f32(bytes, 16),
                    y: read_f32(bytes, 20),
                    z: read_f32(bytes, 24),
                },
            }))
        }
        PayloadType::CompleteQuaternion => {
            require(COMPLETE_QUATERNION_FRAME_LEN)?;
            Ok(DecodedFrame::CompleteQuaternion(QuaternionFrame {
                timestamp: read_u32(bytes, 0),
                quaternion: Quaternion {
                    w: read_f32(bytes, 4),
                    x: read_f32(bytes, 8),
                    y: read_f32(bytes, 12),
                    z: read_f32(bytes, 16),
                },
                free_acceleration: Vector3 {
                    x: read_f32(bytes, 20),
                    y: read_f32(bytes, 24),
                    z: read_f32(bytes, 28),
                },
            }))
        }
        PayloadType::MeasurementGeneralDetails => {
            require(control_frame::MIN_LEN)?;
            Ok(DecodedFrame::MeasurementDetails(MeasurementDetails {
                measurement_type: bytes[control_frame::MEASUREMENT_TYPE],
                action: bytes[control_frame::ACTION],
                payload_code: bytes[control_frame::PAYLOAD],
            }))
        }
        PayloadType::OrientationResetStatus => {
            require(1)?;
            Ok(DecodedFrame::OrientationResetStatus(bytes[0]))
        }
        PayloadType::OrientationResetControlData => {
            require(1)?;
            Ok(DecodedFrame::OrientationResetControl(HeadingResetState::from(
                bytes[0],
            )))
        }
        other => Err(DecodeError::Unsupported(other)),
    }
}

/// Build the control write from the frame currently on the device.
///
/// Everything except the action and payload bytes is carried over.
pub fn encode_control_frame(
    existing: &[u8],
    start: bool,
    payload_type: PayloadType,
) -> Result<Vec<u8>, DecodeError> {
    if existing.len() < control_frame::MIN_LEN {
        return Err(DecodeError::InsufficientPayload {
            payload: PayloadType::MeasurementGeneralDetails,
            expected: control_frame::MIN_LEN,
            actual: existing.len(),
        });
    }

    let mut frame = existing.to_vec();
    frame[control_frame::ACTION] = if start {
        control_frame::ACTION_START
    } else {
        control_frame::ACTION_STOP
    };
    frame[control_frame::PAYLOAD] = payload_type.code();
    Ok(frame)
}

/// Human-readable line for a decoded frame.
pub fn format_frame(device: &DeviceIdentity, frame: &DecodedFrame) -> String {
    let name = device.short_name();
    match frame {
        DecodedFrame::Battery(battery) => {
            let plug = match battery.charging {
                ChargingState::Unplugged => "NOT PLUGGED IN".to_string(),
                ChargingState::Plugged => "PLUGGED IN".to_string(),
                ChargingState::Unknown(code) => format!("CHARGING STATE {}", code),
            };
            format!("[Battery] [{}]: {}% [{}]", name, battery.percentage, plug)
        }
        DecodedFrame::CompleteEuler(f) => format!(
            "[{}] Time: {}, X: {}, Y: {}, Z: {}, AccX: {}, AccY: {}, AccZ: {}",
            name,
            f.timestamp,
            f.euler.x,
            f.euler.y,
            f.euler.z,
            f.free_acceleration.x,
            f.free_acceleration.y,
            f.free_acceleration.z
        ),
        DecodedFrame::CompleteQuaternion(f) => format!(
            "[{}] Time: {}, W: {}, X: {}, Y: {}, Z: {}, AccX: {}, AccY: {}, AccZ: {}",
            name,
            f.timestamp,
            f.quaternion.w,
            f.quaternion.x,
            f.quaternion.y,
            f.quaternion.z,
            f.free_acceleration.x,
            f.free_acceleration.y,
            f.free_acceleration.z
        ),
        DecodedFrame::MeasurementDetails(d) => format!(
            "[MeasurementDetails] [{}]: Type:{}, Action:{}, Payload:{}",
            name, d.measurement_type, d.action, d.payload_code
        ),
        DecodedFrame::OrientationResetStatus(result) => format!(
            "[OrientationResetStatus (1:Success, 2:Fail)] [{}]: Result:{}",
            name, result
        ),
        DecodedFrame::OrientationResetControl(state) => format!(
            "[OrientationResetControlData] [{}]: {:?} ({})",
            name,
            state,
            state.code()
        ),
    }
}

/// Joint angle line, one decimal per axis.
pub fn format_joint_angle(reading: &JointAngleReading) -> String {
    format!(
        "[JointAngle] [{} -> {}]: X: {:.1}, Y: {:.1}, Z: {:.1}",
        reading.proximal.short_name(),
        reading.distal.short_name(),
        reading.angles.x,
        reading.angles.y,
        reading.angles.z
    )
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quaternion_frame(ts: u32, values: [f32; 7]) -> Vec<u8> {
        let mut bytes = ts.to_le_bytes().to_vec();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            MEDIUM_PAYLOAD_CHAR_UUID.to_string(),
            "15172003-4947-11e9-8646-d663bd873d93"
        );
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "15173000-4947-11e9-8646-d663bd873d93"
        );
    }

    #[test]
    fn test_decode_complete_quaternion_exact_values() {
        let values = [0.70710677, -0.5, 1.0e-7, f32::MAX, -9.81, 0.125, 3.5];
        let bytes = quaternion_frame(123_456, values);

        let frame = decode(&bytes, PayloadType::CompleteQuaternion).unwrap();
        let DecodedFrame::CompleteQuaternion(q) = frame else {
            panic!("unexpected frame {:?}", frame);
        };
        assert_eq!(q.timestamp, 123_456);
        assert_eq!(q.quaternion.w.to_bits(), values[0].to_bits());
        assert_eq!(q.quaternion.x.to_bits(), values[1].to_bits());
        assert_eq!(q.quaternion.y.to_bits(), values[2].to_bits());
        assert_eq!(q.quaternion.z.to_bits(), values[3].to_bits());
        assert_eq!(q.free_acceleration.x.to_bits(), values[4].to_bits());
        assert_eq!(q.free_acceleration.z.to_bits(), values[6].to_bits());
        assert_eq!(frame.quaternion(), Some(q.quaternion));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = quaternion_frame(1, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        bytes.extend_from_slice(&[0xAA; 8]);
        assert!(decode(&bytes, PayloadType::CompleteQuaternion).is_ok());
    }

    #[test]
    fn test_decode_complete_euler() {
        let bytes = quaternion_frame(7, [10.0, -20.0, 179.5, 0.1, 0.2, 0.3, 0.0]);
        let frame = decode(&bytes[..28], PayloadType::CompleteEuler).unwrap();
        match frame {
            DecodedFrame::CompleteEuler(e) => {
                assert_eq!(e.timestamp, 7);
                assert_eq!(e.euler.z, 179.5);
                assert_eq!(e.free_acceleration.z, 0.3);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_short_buffers_are_insufficient() {
        let cases = [
            (PayloadType::BatteryDetails, 2),
            (PayloadType::CompleteEuler, 28),
            (PayloadType::CompleteQuaternion, 32),
            (PayloadType::MeasurementGeneralDetails, 3),
            (PayloadType::OrientationResetControlData, 1),
        ];
        for (payload, min) in cases {
            for len in 0..min {
                let bytes = vec![0u8; len];
                assert_eq!(
                    decode(&bytes, payload),
                    Err(DecodeError::InsufficientPayload {
                        payload,
                        expected: min,
                        actual: len,
                    })
                );
            }
        }
    }

    #[test]
    fn test_battery_passes_unknown_charging_code() {
        assert_eq!(
            decode(&[87, 1], PayloadType::BatteryDetails),
            Ok(DecodedFrame::Battery(BatteryFrame {
                percentage: 87,
                charging: ChargingState::Plugged,
            }))
        );
        assert_eq!(
            decode(&[250, 9], PayloadType::BatteryDetails),
            Ok(DecodedFrame::Battery(BatteryFrame {
                percentage: 250,
                charging: ChargingState::Unknown(9),
            }))
        );
    }

    #[test]
    fn test_nan_is_passed_through() {
        let bytes = quaternion_frame(0, [f32::NAN, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let frame = decode(&bytes, PayloadType::CompleteQuaternion).unwrap();
        assert!(frame.quaternion().unwrap().w.is_nan());
    }

    #[test]
    fn test_unsupported_streaming_payload() {
        assert_eq!(
            decode(&[0u8; 64], PayloadType::HighFidelity),
            Err(DecodeError::Unsupported(PayloadType::HighFidelity))
        );
    }

    #[test]
    fn test_encode_control_frame() {
        let existing = [1u8, 0, 16, 0xEE];
        let start = encode_control_frame(&existing, true, PayloadType::CompleteQuaternion).unwrap();
        assert_eq!(start, vec![1, 1, 3, 0xEE]);

        let stop = encode_control_frame(&start, false, PayloadType::CompleteQuaternion).unwrap();
        assert_eq!(stop, vec![1, 0, 3, 0xEE]);

        assert!(matches!(
            encode_control_frame(&[1, 0], true, PayloadType::CompleteEuler),
            Err(DecodeError::InsufficientPayload { actual: 2, .. })
        ));
    }

    #[test]
    fn test_format_frames() {
        let device = DeviceIdentity::new("BluetoothLE-d4:22:cd:00:00:01", TARGET_DEVICE_NAME);
        let battery = decode(&[55, 0], PayloadType::BatteryDetails).unwrap();
        assert_eq!(
            format_frame(&device, &battery),
            "[Battery] [DOT D4:22:CD:00:00:01]: 55% [NOT PLUGGED IN]"
        );

        let details = decode(&[1, 1, 3], PayloadType::MeasurementGeneralDetails).unwrap();
        assert_eq!(
            format_frame(&device, &details),
            "[MeasurementDetails] [DOT D4:22:CD:00:00:01]: Type:1, Action:1, Payload:3"
        );

        let quat = decode(
            &quaternion_frame(9, [1.0, 0.0, 0.5, 0.0, 0.25, 0.0, -1.0]),
            PayloadType::CompleteQuaternion,
        )
        .unwrap();
        assert_eq!(
            format_frame(&device, &quat),
            "[DOT D4:22:CD:00:00:01] Time: 9, W: 1, X: 0, Y: 0.5, Z: 0, AccX: 0.25, AccY: 0, AccZ: -1"
        );
    }
}
