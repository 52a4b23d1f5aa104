//! In-memory GATT transport used by the session and registry tests.

use crate::infrastructure::bluetooth::protocol::{
    BATTERY_CHAR_UUID, BATTERY_SERVICE_UUID, CONTROL_CHAR_UUID, MEASUREMENT_SERVICE_UUID,
    MEDIUM_PAYLOAD_CHAR_UUID, ORIENTATION_RESET_CONTROL_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleError, CccdValue, CharacteristicRef, ConnectFailure, GattTransport, HandlerToken,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
pub struct MockState {
    pub paired: bool,
    pub fail_pairing: bool,
    pub connect_failure: Option<ConnectFailure>,
    pub deny_access: bool,
    pub unauthorized_notify: bool,
    /// Value-changed handler registration fails when set.
    pub fail_handler: bool,
    /// Heading-reset writes are ignored when set.
    pub frozen_heading: bool,
    /// Number of empty discovery results before the service list appears.
    pub empty_discoveries: u32,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub writes: Vec<(Uuid, Vec<u8>)>,
    pub cccd_writes: Vec<(Uuid, CccdValue)>,
    pub pair_calls: u32,
    pub discover_calls: u32,
    pub disconnected: bool,
    handlers: HashMap<HandlerToken, (Uuid, mpsc::UnboundedSender<Vec<u8>>)>,
    next_token: HandlerToken,
}

pub struct MockTransport {
    pub state: Mutex<MockState>,
}

impl MockTransport {
    /// A paired DOT exposing battery, control, medium payload and heading
    /// reset characteristics.
    pub fn dot() -> Self {
        let mut state = MockState {
            paired: true,
            services: vec![
                (BATTERY_SERVICE_UUID, vec![BATTERY_CHAR_UUID]),
                (
                    MEASUREMENT_SERVICE_UUID,
                    vec![
                        CONTROL_CHAR_UUID,
                        MEDIUM_PAYLOAD_CHAR_UUID,
                        ORIENTATION_RESET_CONTROL_CHAR_UUID,
                    ],
                ),
            ],
            ..Default::default()
        };
        state.values.insert(BATTERY_CHAR_UUID, vec![80, 0]);
        state.values.insert(CONTROL_CHAR_UUID, vec![1, 0, 16]);
        state.values.insert(ORIENTATION_RESET_CONTROL_CHAR_UUID, vec![8, 0]);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with<F: FnOnce(&mut MockState)>(self, f: F) -> Self {
        f(&mut *self.state.lock().unwrap());
        self
    }

    pub fn with_state<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut *self.state.lock().unwrap());
    }

    /// Deliver a notification to every handler registered on `characteristic`.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> usize {
        let state = self.state.lock().unwrap();
        state
            .handlers
            .values()
            .filter(|(uuid, _)| *uuid == characteristic)
            .filter(|(_, sink)| sink.send(value.to_vec()).is_ok())
            .count()
    }

    pub fn handler_count(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn cccd_writes_to(&self, characteristic: Uuid) -> Vec<CccdValue> {
        self.state
            .lock()
            .unwrap()
            .cccd_writes
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, v)| *v)
            .collect()
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    fn is_paired(&self) -> bool {
        self.state.lock().unwrap().paired
    }

    async fn pair(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state.pair_calls += 1;
        if state.fail_pairing {
            return Err(BleError::PairingFailed("Failed".into()));
        }
        state.paired = true;
        Ok(())
    }

    async fn connect(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        match state.connect_failure {
            Some(failure) => Err(BleError::ConnectFailed(failure)),
            None => {
                state.disconnected = false;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.disconnected = true;
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>, BleError> {
        let mut state = self.state.lock().unwrap();
        state.discover_calls += 1;
        if state.empty_discoveries > 0 {
            state.empty_discoveries -= 1;
            return Ok(Vec::new());
        }
        Ok(state.services.iter().map(|(uuid, _)| *uuid).collect())
    }

    async fn request_access(&self, service: Uuid) -> Result<(), BleError> {
        if self.state.lock().unwrap().deny_access {
            return Err(BleError::AccessDenied(service));
        }
        Ok(())
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BleError> {
        let state = self.state.lock().unwrap();
        state
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, chars)| chars.clone())
            .ok_or(BleError::ServiceNotFound(service))
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>, BleError> {
        let state = self.state.lock().unwrap();
        state
            .values
            .get(&characteristic.characteristic)
            .cloned()
            .ok_or_else(|| BleError::ReadFailed("Unreachable".into()))
    }

    async fn write(&self, characteristic: CharacteristicRef, value: &[u8]) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        let uuid = characteristic.characteristic;
        state.writes.push((uuid, value.to_vec()));
        if !(uuid == ORIENTATION_RESET_CONTROL_CHAR_UUID && state.frozen_heading) {
            state.values.insert(uuid, value.to_vec());
        }
        Ok(())
    }

    async fn write_cccd(
        &self,
        characteristic: CharacteristicRef,
        value: CccdValue,
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        if state.unauthorized_notify && value == CccdValue::Notify {
            return Err(BleError::SubscriptionUnauthorized(characteristic.characteristic));
        }
        state.cccd_writes.push((characteristic.characteristic, value));
        Ok(())
    }

    fn add_value_handler(
        &self,
        characteristic: CharacteristicRef,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<HandlerToken, BleError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_handler {
            return Err(BleError::SubscriptionUnauthorized(characteristic.characteristic));
        }
        state.next_token += 1;
        let token = state.next_token;
        state
            .handlers
            .insert(token, (characteristic.characteristic, sink));
        Ok(token)
    }

    fn remove_value_handler(
        &self,
        _characteristic: CharacteristicRef,
        token: HandlerToken,
    ) -> Result<(), BleError> {
        self.state.lock().unwrap().handlers.remove(&token);
        Ok(())
    }
}
