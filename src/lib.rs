//! Xsens DOT multi-sensor streamer.
//!
//! Pairs with DOT inertial sensors over BLE, streams their measurements and
//! computes the joint angle between the first two queued sensors.

pub mod app;
pub mod domain;
pub mod infrastructure;
