//! Control Characteristic Protocol
//!
//! Read-modify-write of the measurement control frame and the
//! orientation-reset handshake.

use crate::domain::events::EventSink;
use crate::domain::models::{DeviceIdentity, HeadingResetState, PayloadType};
use crate::infrastructure::bluetooth::protocol::{self, DecodedFrame};
use crate::infrastructure::bluetooth::transport::{BleError, CharacteristicRef, GattTransport};
use tracing::{debug, info, warn};

/// Drives the control and orientation-reset characteristics of one device.
pub struct ControlChannel<'a> {
    transport: &'a dyn GattTransport,
    device: &'a DeviceIdentity,
    events: &'a EventSink,
}

impl<'a> ControlChannel<'a> {
    pub fn new(
        transport: &'a dyn GattTransport,
        device: &'a DeviceIdentity,
        events: &'a EventSink,
    ) -> Self {
        Self {
            transport,
            device,
            events,
        }
    }

    /// Start streaming `payload_type`, echoing the control frame before and
    /// after the write.
    pub async fn start(
        &self,
        control: CharacteristicRef,
        payload_type: PayloadType,
    ) -> Result<(), BleError> {
        let current = self.transport.read(control).await?;
        self.echo("[BEFORE]", &current);

        let frame = protocol::encode_control_frame(&current, true, payload_type)?;
        self.transport.write(control, &frame).await?;
        info!("{}: streaming {:?} requested", self.device, payload_type);

        match self.transport.read(control).await {
            Ok(after) => self.echo("[AFTER]", &after),
            Err(e) => debug!("{}: control echo read failed: {}", self.device, e),
        }
        Ok(())
    }

    pub async fn stop(
        &self,
        control: CharacteristicRef,
        payload_type: PayloadType,
    ) -> Result<(), BleError> {
        let current = self.transport.read(control).await?;
        let frame = protocol::encode_control_frame(&current, false, payload_type)?;
        self.transport.write(control, &frame).await?;
        info!("{}: streaming stop requested", self.device);
        Ok(())
    }

    /// Cycle the orientation-reset state until the device reports
    /// `ResetHeading`. Returns the number of write/read round trips.
    pub async fn reset_heading(
        &self,
        reset_control: CharacteristicRef,
        max_iterations: u32,
    ) -> Result<u32, BleError> {
        let mut buffer = self.transport.read(reset_control).await?;
        let mut state = self.heading_state(&buffer)?;
        self.echo_heading("[BEFORE]", state);

        for round in 1..=max_iterations {
            match state {
                HeadingResetState::DefaultStatus | HeadingResetState::Unknown(_) => {
                    self.write_heading(
                        reset_control,
                        &mut buffer,
                        HeadingResetState::RevertToDefault,
                    )
                    .await?;
                }
                HeadingResetState::RevertToDefault => {
                    self.write_heading(reset_control, &mut buffer, HeadingResetState::ResetHeading)
                        .await?;
                }
                HeadingResetState::ResetHeading => {
                    // Already reset: revert first so the device runs a full cycle.
                    self.write_heading(
                        reset_control,
                        &mut buffer,
                        HeadingResetState::RevertToDefault,
                    )
                    .await?;
                    self.write_heading(reset_control, &mut buffer, HeadingResetState::ResetHeading)
                        .await?;
                }
            }

            buffer = self.transport.read(reset_control).await?;
            state = self.heading_state(&buffer)?;
            debug!("{}: heading reset round {} -> {:?}", self.device, round, state);

            if state == HeadingResetState::ResetHeading {
                self.echo_heading("[AFTER]", state);
                return Ok(round);
            }
        }

        warn!(
            "{}: heading reset stuck in {:?} after {} rounds",
            self.device, state, max_iterations
        );
        Err(BleError::HeadingResetTimeout(max_iterations))
    }

    async fn write_heading(
        &self,
        reset_control: CharacteristicRef,
        buffer: &mut Vec<u8>,
        target: HeadingResetState,
    ) -> Result<(), BleError> {
        if buffer.is_empty() {
            buffer.push(0);
        }
        buffer[0] = target.code();
        self.transport.write(reset_control, &buffer[..]).await
    }

    fn heading_state(&self, bytes: &[u8]) -> Result<HeadingResetState, BleError> {
        match protocol::decode(bytes, PayloadType::OrientationResetControlData)? {
            DecodedFrame::OrientationResetControl(state) => Ok(state),
            other => Err(BleError::ReadFailed(format!(
                "unexpected reset control frame {:?}",
                other
            ))),
        }
    }

    fn echo(&self, label: &str, bytes: &[u8]) {
        match protocol::decode(bytes, PayloadType::MeasurementGeneralDetails) {
            Ok(frame) => self
                .events
                .info(format!("{}{}", label, protocol::format_frame(self.device, &frame))),
            Err(e) => self.events.warn(format!("{}[{}] {}", label, self.device, e)),
        }
    }

    fn echo_heading(&self, label: &str, state: HeadingResetState) {
        let frame = DecodedFrame::OrientationResetControl(state);
        self.events
            .info(format!("{}{}", label, protocol::format_frame(self.device, &frame)));
    }
}
