//! Device Session
//!
//! Per-device state machine: pairing, connection, GATT resolution,
//! notification subscriptions and streaming control.

use crate::domain::events::EventSink;
use crate::domain::models::{AppEvent, DeviceIdentity, PayloadType, SessionState};
use crate::domain::registry::QuaternionRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::control::ControlChannel;
use crate::infrastructure::bluetooth::protocol::{
    self, DecodeError, BATTERY_CHAR_UUID, BATTERY_SERVICE_UUID, CONTROL_CHAR_UUID,
    MEASUREMENT_SERVICE_UUID, MEDIUM_PAYLOAD_CHAR_UUID, ORIENTATION_RESET_CONTROL_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleError, CccdValue, CharacteristicRef, GattTransport, HandlerToken,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tunables for discovery and the heading-reset loop
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra discovery attempts when the platform returns no services
    pub discovery_max_retries: u32,
    /// Base delay between discovery attempts, doubled each retry
    pub discovery_backoff_ms: u64,
    pub heading_reset_max_iterations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_max_retries: 3,
            discovery_backoff_ms: 100,
            heading_reset_max_iterations: 5,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            discovery_max_retries: settings.discovery_max_retries,
            discovery_backoff_ms: settings.discovery_backoff_ms,
            heading_reset_max_iterations: settings.heading_reset_max_iterations,
        }
    }
}

/// Notification source a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Battery,
    Measurement,
}

impl Channel {
    fn characteristic(self) -> (Uuid, Uuid) {
        match self {
            Self::Battery => (BATTERY_SERVICE_UUID, BATTERY_CHAR_UUID),
            Self::Measurement => (MEASUREMENT_SERVICE_UUID, MEDIUM_PAYLOAD_CHAR_UUID),
        }
    }
}

/// Live notification subscription. Dropping it without [`Subscription::cancel`]
/// leaves the platform handler registered.
#[derive(Debug)]
pub struct Subscription {
    characteristic: CharacteristicRef,
    token: HandlerToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn characteristic(&self) -> CharacteristicRef {
        self.characteristic
    }

    fn cancel(self, transport: &dyn GattTransport) -> Result<(), BleError> {
        self.task.abort();
        transport.remove_value_handler(self.characteristic, self.token)
    }
}

/// Everything the notification task needs, detached from the session.
struct Router {
    device: DeviceIdentity,
    channel: Channel,
    payload: watch::Receiver<PayloadType>,
    registry: Arc<QuaternionRegistry>,
    events: EventSink,
}

impl Router {
    async fn run(self, mut notifications: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(bytes) = notifications.recv().await {
            self.route(&bytes);
        }
        debug!("{}: {:?} notifications closed", self.device, self.channel);
    }

    fn route(&self, bytes: &[u8]) {
        let payload_type = match self.channel {
            Channel::Battery => PayloadType::BatteryDetails,
            Channel::Measurement => *self.payload.borrow(),
        };

        let frame = match protocol::decode(bytes, payload_type) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: dropping frame: {}", self.device, e);
                self.events.warn(format!("[{}] {}", self.device, e));
                return;
            }
        };

        if let Some(quaternion) = frame.quaternion() {
            if let Err(e) = self.registry.update(&self.device, quaternion) {
                self.events.error(format!("[ERR] Cannot update quaternion: {}", e));
            }
        }

        let line = protocol::format_frame(&self.device, &frame);
        match self.channel {
            Channel::Battery => self.events.info(line),
            Channel::Measurement => self.events.stream(line),
        }
    }
}

/// One queued DOT and its connection state.
pub struct DeviceSession {
    identity: DeviceIdentity,
    transport: Arc<dyn GattTransport>,
    registry: Arc<QuaternionRegistry>,
    events: EventSink,
    config: SessionConfig,

    state: SessionState,
    services: Option<Vec<Uuid>>,
    battery_char: Option<CharacteristicRef>,
    measurement_char: Option<CharacteristicRef>,
    control_char: Option<CharacteristicRef>,
    heading_char: Option<CharacteristicRef>,
    battery_sub: Option<Subscription>,
    measurement_sub: Option<Subscription>,
    payload: watch::Sender<PayloadType>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn GattTransport>,
        registry: Arc<QuaternionRegistry>,
        events: EventSink,
        config: SessionConfig,
    ) -> Self {
        let state = if transport.is_paired() {
            SessionState::Paired
        } else {
            SessionState::Unpaired
        };
        let (payload, _) = watch::channel(PayloadType::CompleteEuler);

        Self {
            identity,
            transport,
            registry,
            events,
            config,
            state,
            services: None,
            battery_char: None,
            measurement_char: None,
            control_char: None,
            heading_char: None,
            battery_sub: None,
            measurement_sub: None,
            payload,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn payload_type(&self) -> PayloadType {
        *self.payload.borrow()
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.subscription(channel).is_some()
    }

    pub fn subscription(&self, channel: Channel) -> Option<&Subscription> {
        match channel {
            Channel::Battery => self.battery_sub.as_ref(),
            Channel::Measurement => self.measurement_sub.as_ref(),
        }
    }

    // ---- public operations: failures are reported here and returned ----

    pub async fn pair(&mut self) -> Result<(), BleError> {
        let result = self.try_pair().await;
        self.report("Pairing", result)
    }

    pub async fn connect(&mut self) -> Result<(), BleError> {
        let result = self.try_connect().await;
        self.report("Connect", result)
    }

    pub async fn resolve_services(&mut self) -> Result<Vec<Uuid>, BleError> {
        let result = self.try_resolve_services().await;
        self.report("Service discovery", result)
    }

    pub async fn resolve_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef, BleError> {
        let result = self.try_resolve_characteristic(service, characteristic).await;
        self.report("Characteristic lookup", result)
    }

    pub async fn subscribe(&mut self, channel: Channel) -> Result<(), BleError> {
        let result = self.try_subscribe(channel).await;
        self.report("Subscribe", result)
    }

    pub async fn unsubscribe(&mut self, channel: Channel) -> Result<(), BleError> {
        let result = self.try_unsubscribe(channel).await;
        self.report("Unsubscribe", result)
    }

    /// Subscribe to battery notifications and report the current level once.
    pub async fn subscribe_battery(&mut self) -> Result<(), BleError> {
        let result = self.try_subscribe_battery().await;
        self.report("Battery", result)
    }

    pub async fn start_measurement(&mut self, payload_type: PayloadType) -> Result<(), BleError> {
        let result = self.try_start_measurement(payload_type).await;
        self.report("Start measurement", result)
    }

    pub async fn stop_measurement(&mut self, payload_type: PayloadType) -> Result<(), BleError> {
        let result = self.try_stop_measurement(payload_type).await;
        self.report("Stop measurement", result)
    }

    pub async fn reset_heading(&mut self) -> Result<(), BleError> {
        let result = self.try_reset_heading().await;
        self.report("Heading reset", result)
    }

    /// Unsubscribe everything, then drop the connection.
    pub async fn teardown(&mut self) {
        for channel in [Channel::Measurement, Channel::Battery] {
            if let Err(e) = self.try_unsubscribe(channel).await {
                warn!(
                    "{}: {:?} unsubscribe during teardown failed: {}",
                    self.identity, channel, e
                );
                // The device is going away either way; drop the local handler.
                if let Some(sub) = self.subscription_slot(channel).take() {
                    let _ = sub.cancel(self.transport.as_ref());
                }
            }
        }

        self.transport.disconnect().await;
        self.services = None;
        self.battery_char = None;
        self.measurement_char = None;
        self.control_char = None;
        self.heading_char = None;
        self.set_state(SessionState::Disconnected);
        self.events.info(format!("[info] {} disconnected", self.identity));
    }

    // ---- state machine ----

    async fn try_pair(&mut self) -> Result<(), BleError> {
        if self.transport.is_paired() {
            if self.state == SessionState::Unpaired {
                self.set_state(SessionState::Paired);
            }
            return Ok(());
        }

        self.events.info(format!(
            "[info] Pairing to {} started, please wait...",
            self.identity
        ));
        self.transport.pair().await?;
        self.events
            .success(format!("[info] Pairing result to {} = Paired", self.identity));
        if matches!(self.state, SessionState::Unpaired | SessionState::Disconnected) {
            self.set_state(SessionState::Paired);
        }
        Ok(())
    }

    async fn try_connect(&mut self) -> Result<(), BleError> {
        if self.state.is_connected() {
            return Ok(());
        }
        if !self.transport.is_paired() {
            return Err(self.invalid_state("Paired"));
        }

        self.transport.connect().await?;
        self.set_state(SessionState::Connected);
        self.events
            .info(format!("[info] Connected to {}", self.identity));
        Ok(())
    }

    /// Pair and connect as needed.
    async fn ensure_connected(&mut self) -> Result<(), BleError> {
        self.try_pair().await?;
        self.try_connect().await
    }

    async fn try_resolve_services(&mut self) -> Result<Vec<Uuid>, BleError> {
        if !self.state.is_connected() {
            return Err(self.invalid_state("Connected"));
        }
        if let Some(services) = &self.services {
            return Ok(services.clone());
        }

        let mut delay = Duration::from_millis(self.config.discovery_backoff_ms);
        for attempt in 0..=self.config.discovery_max_retries {
            let services = self.transport.discover_services().await?;
            if !services.is_empty() {
                info!("{}: {} services discovered", self.identity, services.len());
                self.events.info(format!(
                    "[info] Services successfully extracted from {}.",
                    self.identity
                ));
                self.services = Some(services.clone());
                if self.state == SessionState::Connected {
                    self.set_state(SessionState::ServicesResolved);
                }
                return Ok(services);
            }

            if attempt < self.config.discovery_max_retries {
                debug!(
                    "{}: service list empty, retrying in {:?}",
                    self.identity, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        warn!("{}: no services after discovery retries", self.identity);
        Ok(Vec::new())
    }

    async fn try_resolve_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef, BleError> {
        let services = self.try_resolve_services().await?;
        if !services.contains(&service) {
            return Err(BleError::ServiceNotFound(service));
        }
        self.events.info(format!(
            "[info] Service {} of {} found.",
            service, self.identity
        ));

        self.transport.request_access(service).await?;
        let characteristics = self.transport.discover_characteristics(service).await?;
        if !characteristics.contains(&characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }

        self.events.info(format!(
            "[info] Characteristic {} of {} found.",
            characteristic, self.identity
        ));
        Ok(CharacteristicRef::new(service, characteristic))
    }

    async fn channel_characteristic(
        &mut self,
        channel: Channel,
    ) -> Result<CharacteristicRef, BleError> {
        let cached = match channel {
            Channel::Battery => self.battery_char,
            Channel::Measurement => self.measurement_char,
        };
        if let Some(resolved) = cached {
            return Ok(resolved);
        }

        let (service, characteristic) = channel.characteristic();
        let resolved = self
            .try_resolve_characteristic(service, characteristic)
            .await?;
        match channel {
            Channel::Battery => self.battery_char = Some(resolved),
            Channel::Measurement => self.measurement_char = Some(resolved),
        }
        Ok(resolved)
    }

    async fn control_characteristic(&mut self) -> Result<CharacteristicRef, BleError> {
        if let Some(control) = self.control_char {
            return Ok(control);
        }
        let control = self
            .try_resolve_characteristic(MEASUREMENT_SERVICE_UUID, CONTROL_CHAR_UUID)
            .await?;
        self.control_char = Some(control);
        Ok(control)
    }

    async fn heading_characteristic(&mut self) -> Result<CharacteristicRef, BleError> {
        if let Some(heading) = self.heading_char {
            return Ok(heading);
        }
        let heading = self
            .try_resolve_characteristic(
                MEASUREMENT_SERVICE_UUID,
                ORIENTATION_RESET_CONTROL_CHAR_UUID,
            )
            .await?;
        self.heading_char = Some(heading);
        Ok(heading)
    }

    async fn try_subscribe(&mut self, channel: Channel) -> Result<(), BleError> {
        if self.is_subscribed(channel) {
            debug!("{}: already subscribed to {:?}", self.identity, channel);
            return Ok(());
        }
        if !self.state.is_connected() {
            return Err(self.invalid_state("Connected"));
        }

        let characteristic = self.channel_characteristic(channel).await?;
        self.transport
            .write_cccd(characteristic, CccdValue::Notify)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = match self.transport.add_value_handler(characteristic, tx) {
            Ok(token) => token,
            Err(e) => {
                if let Err(undo) = self
                    .transport
                    .write_cccd(characteristic, CccdValue::None)
                    .await
                {
                    warn!("{}: cannot clear CCCD: {}", self.identity, undo);
                }
                return Err(e);
            }
        };
        let router = Router {
            device: self.identity.clone(),
            channel,
            payload: self.payload.subscribe(),
            registry: self.registry.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(router.run(rx));

        *self.subscription_slot(channel) = Some(Subscription {
            characteristic,
            token,
            task,
        });
        if matches!(
            self.state,
            SessionState::Connected | SessionState::ServicesResolved
        ) {
            self.set_state(SessionState::Subscribed);
        }
        self.events.info(format!(
            "[info] {} successfully subscribed for {:?} changes",
            self.identity, channel
        ));
        Ok(())
    }

    async fn try_unsubscribe(&mut self, channel: Channel) -> Result<(), BleError> {
        let Some(characteristic) = self.subscription(channel).map(Subscription::characteristic)
        else {
            debug!("{}: not subscribed to {:?}", self.identity, channel);
            return Ok(());
        };

        self.transport
            .write_cccd(characteristic, CccdValue::None)
            .await?;
        if let Some(sub) = self.subscription_slot(channel).take() {
            sub.cancel(self.transport.as_ref())?;
        }

        if self.battery_sub.is_none() && self.measurement_sub.is_none() {
            if matches!(self.state, SessionState::Subscribed | SessionState::Streaming) {
                self.set_state(SessionState::ServicesResolved);
            }
        } else if channel == Channel::Measurement && self.state == SessionState::Streaming {
            self.set_state(SessionState::Subscribed);
        }
        self.events.info(format!(
            "[info] {} successfully un-subscribed for {:?} changes",
            self.identity, channel
        ));
        Ok(())
    }

    async fn try_subscribe_battery(&mut self) -> Result<(), BleError> {
        self.ensure_connected().await?;
        self.try_subscribe(Channel::Battery).await?;

        let characteristic = self.channel_characteristic(Channel::Battery).await?;
        let value = self.transport.read(characteristic).await?;
        let frame = protocol::decode(&value, PayloadType::BatteryDetails)?;
        self.events.info(protocol::format_frame(&self.identity, &frame));
        Ok(())
    }

    async fn try_start_measurement(&mut self, payload_type: PayloadType) -> Result<(), BleError> {
        if !payload_type.is_streaming() {
            return Err(DecodeError::Unsupported(payload_type).into());
        }

        self.ensure_connected().await?;
        self.channel_characteristic(Channel::Measurement).await?;
        let control = self.control_characteristic().await?;

        // Routing reads this on every frame, so set it before notifications flow.
        let previous = self.payload.send_replace(payload_type);
        let was_subscribed = self.is_subscribed(Channel::Measurement);

        if let Err(e) = self
            .subscribe_and_start(control, payload_type, was_subscribed)
            .await
        {
            self.payload.send_replace(previous);
            if !was_subscribed {
                if let Err(undo) = self.try_unsubscribe(Channel::Measurement).await {
                    warn!("{}: measurement rollback failed: {}", self.identity, undo);
                }
            }
            return Err(e);
        }
        self.set_state(SessionState::Streaming);
        Ok(())
    }

    async fn subscribe_and_start(
        &mut self,
        control: CharacteristicRef,
        payload_type: PayloadType,
        was_subscribed: bool,
    ) -> Result<(), BleError> {
        if was_subscribed {
            self.events.info(format!(
                "[info] {} already subscribed to measurement, switching payload to {:?}",
                self.identity, payload_type
            ));
        } else {
            self.try_subscribe(Channel::Measurement).await?;
        }

        ControlChannel::new(self.transport.as_ref(), &self.identity, &self.events)
            .start(control, payload_type)
            .await
    }

    async fn try_stop_measurement(&mut self, payload_type: PayloadType) -> Result<(), BleError> {
        if !self.is_subscribed(Channel::Measurement) {
            return Err(BleError::NotSubscribed(MEDIUM_PAYLOAD_CHAR_UUID));
        }

        let control = self.control_characteristic().await?;
        ControlChannel::new(self.transport.as_ref(), &self.identity, &self.events)
            .stop(control, payload_type)
            .await?;
        self.try_unsubscribe(Channel::Measurement).await
    }

    async fn try_reset_heading(&mut self) -> Result<(), BleError> {
        if self.state != SessionState::Streaming {
            return Err(BleError::NotStreaming);
        }

        let heading = self.heading_characteristic().await?;
        let rounds = ControlChannel::new(self.transport.as_ref(), &self.identity, &self.events)
            .reset_heading(heading, self.config.heading_reset_max_iterations)
            .await?;
        info!("{}: heading reset after {} rounds", self.identity, rounds);
        Ok(())
    }

    // ---- helpers ----

    fn subscription_slot(&mut self, channel: Channel) -> &mut Option<Subscription> {
        match channel {
            Channel::Battery => &mut self.battery_sub,
            Channel::Measurement => &mut self.measurement_sub,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("{}: {:?} -> {:?}", self.identity, self.state, state);
        self.state = state;
        self.events
            .send(AppEvent::SessionState(self.identity.clone(), state));
    }

    fn invalid_state(&self, expected: &'static str) -> BleError {
        BleError::InvalidState {
            expected,
            actual: state_name(self.state),
        }
    }

    fn report<T>(&self, operation: &str, result: Result<T, BleError>) -> Result<T, BleError> {
        if let Err(e) = &result {
            error!("{}: {} failed: {}", self.identity, operation, e);
            self.events
                .error(format!("[err] {} for {}: {}", operation, self.identity, e));
        }
        result
    }
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Unpaired => "Unpaired",
        SessionState::Paired => "Paired",
        SessionState::Connected => "Connected",
        SessionState::ServicesResolved => "ServicesResolved",
        SessionState::Subscribed => "Subscribed",
        SessionState::Streaming => "Streaming",
        SessionState::Disconnected => "Disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MessageSeverity, Quaternion};
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use crate::infrastructure::bluetooth::transport::ConnectFailure;

    struct Harness {
        transport: Arc<MockTransport>,
        session: DeviceSession,
        registry: Arc<QuaternionRegistry>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn harness(transport: MockTransport) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (recompute_tx, _recompute_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(QuaternionRegistry::new(recompute_tx));
        let identity = DeviceIdentity::new("BluetoothLE-d4:22:cd:00:00:01", "Xsens DOT");
        registry.register(identity.clone()).unwrap();

        let transport = Arc::new(transport);
        let session = DeviceSession::new(
            identity,
            transport.clone(),
            registry.clone(),
            EventSink::new(events_tx),
            SessionConfig {
                discovery_backoff_ms: 1,
                ..SessionConfig::default()
            },
        );
        Harness {
            transport,
            session,
            registry,
            events,
        }
    }

    fn quaternion_frame(q: [f32; 4]) -> Vec<u8> {
        let mut bytes = 42u32.to_le_bytes().to_vec();
        for v in q.iter().chain([0.0f32; 3].iter()) {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_walks_states() {
        let mut h = harness(MockTransport::dot().with(|s| s.paired = false));
        assert_eq!(h.session.state(), SessionState::Unpaired);

        assert!(matches!(
            h.session.connect().await,
            Err(BleError::InvalidState { .. })
        ));

        h.session.pair().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Paired);
        h.session.pair().await.unwrap();
        assert_eq!(h.transport.state.lock().unwrap().pair_calls, 1);

        h.session.connect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);

        h.session.resolve_services().await.unwrap();
        assert_eq!(h.session.state(), SessionState::ServicesResolved);

        let states: Vec<SessionState> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::SessionState(_, s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Paired,
                SessionState::Connected,
                SessionState::ServicesResolved
            ]
        );
    }

    #[tokio::test]
    async fn test_pairing_failure_leaves_state() {
        let mut h = harness(MockTransport::dot().with(|s| {
            s.paired = false;
            s.fail_pairing = true;
        }));
        assert!(matches!(h.session.pair().await, Err(BleError::PairingFailed(_))));
        assert_eq!(h.session.state(), SessionState::Unpaired);

        let reported = drain(&mut h.events).into_iter().any(|e| {
            matches!(e, AppEvent::Notify(m) if m.severity == MessageSeverity::Error)
        });
        assert!(reported);
    }

    #[tokio::test]
    async fn test_connect_failure_stays_paired() {
        let mut h = harness(
            MockTransport::dot().with(|s| s.connect_failure = Some(ConnectFailure::RadioOff)),
        );
        assert_eq!(
            h.session.connect().await,
            Err(BleError::ConnectFailed(ConnectFailure::RadioOff))
        );
        assert_eq!(h.session.state(), SessionState::Paired);
    }

    #[tokio::test]
    async fn test_discovery_retries_until_services_appear() {
        let mut h = harness(MockTransport::dot().with(|s| s.empty_discoveries = 2));
        h.session.connect().await.unwrap();
        let services = h.session.resolve_services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(h.transport.state.lock().unwrap().discover_calls, 3);

        // cached afterwards
        h.session.resolve_services().await.unwrap();
        assert_eq!(h.transport.state.lock().unwrap().discover_calls, 3);
    }

    #[tokio::test]
    async fn test_missing_service_and_characteristic() {
        let mut h = harness(MockTransport::dot().with(|s| s.empty_discoveries = 100));
        h.session.connect().await.unwrap();
        assert_eq!(
            h.session
                .resolve_characteristic(BATTERY_SERVICE_UUID, BATTERY_CHAR_UUID)
                .await,
            Err(BleError::ServiceNotFound(BATTERY_SERVICE_UUID))
        );
        // 1 attempt + 3 retries, not cached
        assert_eq!(h.transport.state.lock().unwrap().discover_calls, 4);

        let mut h = harness(MockTransport::dot());
        h.session.connect().await.unwrap();
        let unknown = Uuid::from_u128(0x15172099_4947_11e9_8646_d663bd873d93);
        assert_eq!(
            h.session
                .resolve_characteristic(MEASUREMENT_SERVICE_UUID, unknown)
                .await,
            Err(BleError::CharacteristicNotFound(unknown))
        );
    }

    #[tokio::test]
    async fn test_access_denied() {
        let mut h = harness(MockTransport::dot().with(|s| s.deny_access = true));
        h.session.connect().await.unwrap();
        assert_eq!(
            h.session
                .resolve_characteristic(BATTERY_SERVICE_UUID, BATTERY_CHAR_UUID)
                .await,
            Err(BleError::AccessDenied(BATTERY_SERVICE_UUID))
        );
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let mut h = harness(MockTransport::dot());
        h.session.connect().await.unwrap();

        h.session.subscribe(Channel::Battery).await.unwrap();
        h.session.subscribe(Channel::Battery).await.unwrap();
        assert_eq!(
            h.transport.cccd_writes_to(BATTERY_CHAR_UUID),
            vec![CccdValue::Notify]
        );
        assert_eq!(h.transport.handler_count(), 1);
        assert_eq!(h.session.state(), SessionState::Subscribed);

        h.session.unsubscribe(Channel::Battery).await.unwrap();
        h.session.unsubscribe(Channel::Battery).await.unwrap();
        assert_eq!(
            h.transport.cccd_writes_to(BATTERY_CHAR_UUID),
            vec![CccdValue::Notify, CccdValue::None]
        );
        assert_eq!(h.transport.handler_count(), 0);
        assert!(!h.session.is_subscribed(Channel::Battery));
    }

    #[tokio::test]
    async fn test_unauthorized_subscription_stays_unsubscribed() {
        let mut h = harness(MockTransport::dot().with(|s| s.unauthorized_notify = true));
        h.session.connect().await.unwrap();

        assert_eq!(
            h.session.subscribe(Channel::Battery).await,
            Err(BleError::SubscriptionUnauthorized(BATTERY_CHAR_UUID))
        );
        assert!(!h.session.is_subscribed(Channel::Battery));
        assert_eq!(h.transport.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_battery_subscription_reads_current_level() {
        let mut h = harness(MockTransport::dot());
        h.session.subscribe_battery().await.unwrap();

        let lines: Vec<String> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::Notify(m) => Some(m.message),
                _ => None,
            })
            .collect();
        assert!(lines
            .iter()
            .any(|l| l == "[Battery] [DOT D4:22:CD:00:00:01]: 80% [NOT PLUGGED IN]"));

        h.transport.notify(BATTERY_CHAR_UUID, &[79, 1]);
        match h.events.recv().await {
            Some(AppEvent::Notify(m)) => assert!(m.message.ends_with("79% [PLUGGED IN]")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streaming_routes_samples_and_quaternions() {
        let mut h = harness(MockTransport::dot());
        h.session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert_eq!(
            h.transport.writes_to(CONTROL_CHAR_UUID),
            vec![vec![1, 1, 3]]
        );
        drain(&mut h.events);

        h.transport
            .notify(MEDIUM_PAYLOAD_CHAR_UUID, &quaternion_frame([0.0, 1.0, 0.0, 0.0]));
        match h.events.recv().await {
            Some(AppEvent::Stream(line)) => {
                assert!(line.starts_with("[DOT D4:22:CD:00:00:01] Time: 42, W: 0, X: 1"))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            h.registry.get(h.session.identity()),
            Some(Quaternion::new(0.0, 1.0, 0.0, 0.0))
        );

        // short frame is reported and dropped, the pipeline keeps going
        h.transport.notify(MEDIUM_PAYLOAD_CHAR_UUID, &[1, 2, 3]);
        match h.events.recv().await {
            Some(AppEvent::Notify(m)) => {
                assert_eq!(m.severity, MessageSeverity::Warning);
                assert!(m.message.contains("Insufficient Data"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        h.transport
            .notify(MEDIUM_PAYLOAD_CHAR_UUID, &quaternion_frame([1.0, 0.0, 0.0, 0.0]));
        assert!(matches!(h.events.recv().await, Some(AppEvent::Stream(_))));
    }

    #[tokio::test]
    async fn test_payload_switch_while_streaming() {
        let mut h = harness(MockTransport::dot());
        h.session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();
        h.session
            .start_measurement(PayloadType::CompleteEuler)
            .await
            .unwrap();

        // one CCCD write, two control writes
        assert_eq!(
            h.transport.cccd_writes_to(MEDIUM_PAYLOAD_CHAR_UUID),
            vec![CccdValue::Notify]
        );
        assert_eq!(
            h.transport.writes_to(CONTROL_CHAR_UUID),
            vec![vec![1, 1, 3], vec![1, 1, 16]]
        );
        assert_eq!(h.session.payload_type(), PayloadType::CompleteEuler);
        drain(&mut h.events);

        let mut euler = 5u32.to_le_bytes().to_vec();
        for v in [10.0f32, 20.0, 30.0, 0.0, 0.0, 0.0] {
            euler.extend_from_slice(&v.to_le_bytes());
        }
        h.transport.notify(MEDIUM_PAYLOAD_CHAR_UUID, &euler);
        match h.events.recv().await {
            Some(AppEvent::Stream(line)) => assert!(line.contains("X: 10, Y: 20, Z: 30")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_payload_switch_keeps_previous_payload() {
        let mut h = harness(MockTransport::dot());
        h.session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();

        h.transport.with_state(|s| {
            s.values.insert(CONTROL_CHAR_UUID, vec![1]);
        });
        assert!(matches!(
            h.session.start_measurement(PayloadType::CompleteEuler).await,
            Err(BleError::Decode(DecodeError::InsufficientPayload { .. }))
        ));
        assert_eq!(h.session.payload_type(), PayloadType::CompleteQuaternion);
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert!(h.session.is_subscribed(Channel::Measurement));
        drain(&mut h.events);

        h.transport
            .notify(MEDIUM_PAYLOAD_CHAR_UUID, &quaternion_frame([0.0, 0.0, 1.0, 0.0]));
        match h.events.recv().await {
            Some(AppEvent::Stream(line)) => {
                assert!(line.starts_with("[DOT D4:22:CD:00:00:01] Time: 42, W: 0, X: 0, Y: 1"))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            h.registry.get(h.session.identity()),
            Some(Quaternion::new(0.0, 0.0, 1.0, 0.0))
        );
    }

    #[tokio::test]
    async fn test_failed_first_start_rolls_back_subscription() {
        let mut h = harness(MockTransport::dot().with(|s| {
            s.values.insert(CONTROL_CHAR_UUID, vec![1]);
        }));
        h.session.connect().await.unwrap();

        assert!(h
            .session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .is_err());
        assert_eq!(h.session.payload_type(), PayloadType::CompleteEuler);
        assert!(!h.session.is_subscribed(Channel::Measurement));
        assert_eq!(h.transport.handler_count(), 0);
        assert_eq!(
            h.transport.cccd_writes_to(MEDIUM_PAYLOAD_CHAR_UUID),
            vec![CccdValue::Notify, CccdValue::None]
        );
        assert_ne!(h.session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_handler_failure_clears_notify() {
        let mut h = harness(MockTransport::dot().with(|s| s.fail_handler = true));
        h.session.connect().await.unwrap();

        assert!(h.session.subscribe(Channel::Battery).await.is_err());
        assert!(!h.session.is_subscribed(Channel::Battery));
        assert_eq!(
            h.transport.cccd_writes_to(BATTERY_CHAR_UUID),
            vec![CccdValue::Notify, CccdValue::None]
        );
    }

    #[tokio::test]
    async fn test_stop_measurement() {
        let mut h = harness(MockTransport::dot());
        assert_eq!(
            h.session.stop_measurement(PayloadType::CompleteEuler).await,
            Err(BleError::NotSubscribed(MEDIUM_PAYLOAD_CHAR_UUID))
        );

        h.session
            .start_measurement(PayloadType::CompleteEuler)
            .await
            .unwrap();
        h.session
            .stop_measurement(PayloadType::CompleteEuler)
            .await
            .unwrap();

        assert_eq!(
            h.transport.writes_to(CONTROL_CHAR_UUID),
            vec![vec![1, 1, 16], vec![1, 0, 16]]
        );
        assert_eq!(
            h.transport.cccd_writes_to(MEDIUM_PAYLOAD_CHAR_UUID),
            vec![CccdValue::Notify, CccdValue::None]
        );
        assert_eq!(h.session.state(), SessionState::ServicesResolved);
        assert_eq!(h.transport.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_heading_reset_requires_streaming() {
        let mut h = harness(MockTransport::dot());
        assert_eq!(h.session.reset_heading().await, Err(BleError::NotStreaming));

        h.session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();
        h.session.reset_heading().await.unwrap();
        assert_eq!(
            h.transport.writes_to(ORIENTATION_RESET_CONTROL_CHAR_UUID),
            vec![vec![7, 0], vec![1, 0]]
        );
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_then_disconnects() {
        let mut h = harness(MockTransport::dot());
        h.session.subscribe_battery().await.unwrap();
        h.session
            .start_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();

        h.session.teardown().await;
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.transport.handler_count(), 0);
        assert!(h.transport.state.lock().unwrap().disconnected);
        assert_eq!(
            h.transport.cccd_writes_to(BATTERY_CHAR_UUID),
            vec![CccdValue::Notify, CccdValue::None]
        );

        // reconnect after teardown
        h.session.connect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            discovery_max_retries: 1,
            heading_reset_max_iterations: 9,
            ..Settings::default()
        };
        let config = SessionConfig::from(&settings);
        assert_eq!(config.discovery_max_retries, 1);
        assert_eq!(config.discovery_backoff_ms, 100);
        assert_eq!(config.heading_reset_max_iterations, 9);
    }

    #[tokio::test]
    async fn test_status_payload_cannot_be_streamed() {
        let mut h = harness(MockTransport::dot());
        assert!(matches!(
            h.session.start_measurement(PayloadType::BatteryDetails).await,
            Err(BleError::Decode(DecodeError::Unsupported(PayloadType::BatteryDetails)))
        ));
        assert!(h.transport.writes_to(CONTROL_CHAR_UUID).is_empty());
    }
}
