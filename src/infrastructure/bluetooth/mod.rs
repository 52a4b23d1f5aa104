//! Bluetooth Module
//!
//! BLE communication with Xsens DOT sensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionRegistry                       │
//! │  (queued devices, quaternion registry, joint worker)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ one per device
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DeviceSession                         │
//! │  (pair, connect, resolve, subscribe, route frames)       │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────┐   ┌────────────────┐   ┌────────────┐
//! │  Control   │   │ GattTransport  │   │  Protocol  │
//! │            │   │                │   │            │
//! │ - start/   │   │ - WinRT        │   │ - UUIDs    │
//! │   stop     │   │   (Windows)    │   │ - decode   │
//! │ - heading  │   │ - mock (tests) │   │ - format   │
//! └────────────┘   └────────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, frame decoding, control frame encoding, formatting
//! - [`transport`] - Platform seam and BLE error types
//! - [`control`] - Control characteristic read-modify-write and heading reset
//! - [`session`] - Per-device state machine
//! - [`service`] - Session registry over all queued devices
//! - [`scanner`] - Advertisement filtering and the Windows watcher
//! - `connection` - WinRT transport (Windows only)

#[cfg(windows)]
pub mod connection;
pub mod control;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

pub use service::SessionRegistry;
