//! Quaternion Registry
//!
//! Latest orientation per queued device, shared by every session's
//! notification task. Updates that leave two or more devices registered
//! post a recompute request to the joint-angle worker.

use crate::domain::joint_angle;
use crate::domain::models::{AppEvent, DeviceIdentity, JointAngleReading, Quaternion};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("{0} is not in the quaternion registry")]
    UnknownDevice(DeviceIdentity),
    #[error("quaternion registry lock poisoned")]
    Poisoned,
}

/// Snapshot of the pair used for one joint-angle computation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeRequest {
    pub proximal: (DeviceIdentity, Quaternion),
    pub distal: (DeviceIdentity, Quaternion),
}

/// Thread-safe, insertion-ordered map of device to latest quaternion.
///
/// The joint pair is always the first two entries in queue order.
pub struct QuaternionRegistry {
    entries: Mutex<Vec<(DeviceIdentity, Quaternion)>>,
    recompute_tx: mpsc::UnboundedSender<RecomputeRequest>,
}

impl QuaternionRegistry {
    pub fn new(recompute_tx: mpsc::UnboundedSender<RecomputeRequest>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            recompute_tx,
        }
    }

    /// Add a device with the identity quaternion. Returns false if it was
    /// already registered.
    pub fn register(&self, device: DeviceIdentity) -> Result<bool, RegistryError> {
        let request = {
            let mut entries = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
            if entries.iter().any(|(id, _)| *id == device) {
                return Ok(false);
            }
            entries.push((device, Quaternion::IDENTITY));
            Self::pair_request(&entries)
        };
        self.dispatch(request);
        Ok(true)
    }

    /// Remove a device. Returns false if it was not registered.
    pub fn remove(&self, device: &DeviceIdentity) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        let before = entries.len();
        entries.retain(|(id, _)| id != device);
        Ok(entries.len() != before)
    }

    /// Store the latest quaternion for a registered device.
    pub fn update(
        &self,
        device: &DeviceIdentity,
        quaternion: Quaternion,
    ) -> Result<(), RegistryError> {
        let request = {
            let mut entries = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
            let slot = entries
                .iter_mut()
                .find(|(id, _)| id == device)
                .ok_or_else(|| RegistryError::UnknownDevice(device.clone()))?;
            slot.1 = quaternion;
            Self::pair_request(&entries)
        };
        self.dispatch(request);
        Ok(())
    }

    pub fn get(&self, device: &DeviceIdentity) -> Option<Quaternion> {
        let entries = self.entries.lock().ok()?;
        entries.iter().find(|(id, _)| id == device).map(|(_, q)| *q)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pair_request(entries: &[(DeviceIdentity, Quaternion)]) -> Option<RecomputeRequest> {
        match entries {
            [first, second, ..] => Some(RecomputeRequest {
                proximal: first.clone(),
                distal: second.clone(),
            }),
            _ => None,
        }
    }

    fn dispatch(&self, request: Option<RecomputeRequest>) {
        if let Some(request) = request {
            if self.recompute_tx.send(request).is_err() {
                debug!("Joint angle worker has stopped, dropping recompute request");
            }
        }
    }
}

/// Consume recompute requests and publish joint angles as events.
pub fn spawn_joint_angle_worker(
    mut requests: mpsc::UnboundedReceiver<RecomputeRequest>,
    events: mpsc::UnboundedSender<AppEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let (proximal, q_proximal) = request.proximal;
            let (distal, q_distal) = request.distal;
            let angles = joint_angle::compute_joint_angle(q_proximal, q_distal);
            trace!("Joint angle {} -> {}: {:?}", proximal, distal, angles);

            let reading = JointAngleReading {
                proximal,
                distal,
                angles,
            };
            if events.send(AppEvent::JointAngle(reading)).is_err() {
                break;
            }
        }
    })
}
