//! Session Registry
//!
//! Coordinates every queued DOT: one [`DeviceSession`] per device, the shared
//! quaternion registry and the joint-angle worker.

use crate::domain::events::EventSink;
use crate::domain::models::{AppEvent, DeviceIdentity, PayloadType};
use crate::domain::registry::{spawn_joint_angle_worker, QuaternionRegistry, RegistryError};
use crate::infrastructure::bluetooth::session::{DeviceSession, SessionConfig};
use crate::infrastructure::bluetooth::transport::GattTransport;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No devices queued")]
    NoDevicesQueued,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of [`SessionRegistry::queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueChange {
    Queued,
    Dequeued,
}

/// Queued devices in insertion order.
pub struct SessionRegistry {
    sessions: Vec<DeviceSession>,
    quaternions: Arc<QuaternionRegistry>,
    events: EventSink,
    config: SessionConfig,
    worker: JoinHandle<()>,
}

impl SessionRegistry {
    /// Create the registry and spawn its joint-angle worker. Must be called
    /// inside a tokio runtime.
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>, config: SessionConfig) -> Self {
        let (recompute_tx, recompute_rx) = mpsc::unbounded_channel();
        let worker = spawn_joint_angle_worker(recompute_rx, event_sender.clone());

        Self {
            sessions: Vec::new(),
            quaternions: Arc::new(QuaternionRegistry::new(recompute_tx)),
            events: EventSink::new(event_sender),
            config,
            worker,
        }
    }

    pub fn quaternions(&self) -> &Arc<QuaternionRegistry> {
        &self.quaternions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_queued(&self, identity: &DeviceIdentity) -> bool {
        self.position(identity).is_some()
    }

    pub fn queued(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.sessions.iter().map(DeviceSession::identity)
    }

    pub fn session(&self, identity: &DeviceIdentity) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.identity() == identity)
    }

    /// Queue `identity`, or dequeue it when it is already queued.
    pub async fn queue(
        &mut self,
        identity: DeviceIdentity,
        transport: Arc<dyn GattTransport>,
    ) -> Result<QueueChange, ServiceError> {
        if self.is_queued(&identity) {
            self.dequeue(&identity).await?;
            return Ok(QueueChange::Dequeued);
        }

        self.quaternions.register(identity.clone())?;
        self.sessions.push(DeviceSession::new(
            identity.clone(),
            transport,
            self.quaternions.clone(),
            self.events.clone(),
            self.config.clone(),
        ));

        info!("Queued {}", identity);
        self.events.info(format!(
            "[info] {} queued ({} total)",
            identity,
            self.sessions.len()
        ));
        Ok(QueueChange::Queued)
    }

    /// Tear the session down and forget its quaternion. Returns false when the
    /// device was not queued.
    pub async fn dequeue(&mut self, identity: &DeviceIdentity) -> Result<bool, ServiceError> {
        let Some(index) = self.position(identity) else {
            return Ok(false);
        };

        let mut session = self.sessions.remove(index);
        session.teardown().await;
        self.quaternions.remove(identity)?;

        info!("Dequeued {}", identity);
        self.events.info(format!(
            "[info] {} removed from queue ({} left)",
            identity,
            self.sessions.len()
        ));
        Ok(true)
    }

    /// Subscribe every queued device to battery notifications. Returns the
    /// number of devices that succeeded.
    pub async fn subscribe_battery_all(&mut self) -> Result<usize, ServiceError> {
        self.ensure_queued()?;
        let mut ok = 0;
        for session in &mut self.sessions {
            if session.subscribe_battery().await.is_ok() {
                ok += 1;
            }
        }
        Ok(ok)
    }

    pub async fn start_streaming_all(
        &mut self,
        payload_type: PayloadType,
    ) -> Result<usize, ServiceError> {
        self.ensure_queued()?;
        let mut ok = 0;
        for session in &mut self.sessions {
            if session.start_measurement(payload_type).await.is_ok() {
                ok += 1;
            }
        }
        Ok(ok)
    }

    pub async fn stop_streaming_all(&mut self) -> Result<usize, ServiceError> {
        self.ensure_queued()?;
        let mut ok = 0;
        for session in &mut self.sessions {
            let payload_type = session.payload_type();
            if session.stop_measurement(payload_type).await.is_ok() {
                ok += 1;
            }
        }
        Ok(ok)
    }

    pub async fn reset_heading_all(&mut self) -> Result<usize, ServiceError> {
        self.ensure_queued()?;
        let mut ok = 0;
        for session in &mut self.sessions {
            if session.reset_heading().await.is_ok() {
                ok += 1;
            }
        }
        Ok(ok)
    }

    /// Dequeue everything and stop the joint-angle worker.
    pub async fn shutdown(mut self) {
        let identities: Vec<DeviceIdentity> = self.queued().cloned().collect();
        for identity in identities {
            let _ = self.dequeue(&identity).await;
        }
        self.worker.abort();
    }

    fn position(&self, identity: &DeviceIdentity) -> Option<usize> {
        self.sessions.iter().position(|s| s.identity() == identity)
    }

    fn ensure_queued(&self) -> Result<(), ServiceError> {
        if self.sessions.is_empty() {
            self.events.error("[err] No devices queued.");
            return Err(ServiceError::NoDevicesQueued);
        }
        Ok(())
    }
}
