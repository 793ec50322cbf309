//! Bridges a Bluetooth LE heart rate sensor to OSC parameters.

pub mod app;
pub mod domain;
pub mod infrastructure;
