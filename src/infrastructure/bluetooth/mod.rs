//! Bluetooth Module
//!
//! Connects to a standard BLE heart rate sensor and forwards its
//! measurement notifications as [`AppEvent`](crate::domain::models::AppEvent)s.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (command loop, auto-connect, reconnect with backoff)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - BLE     │  │ - GATT     │  │ - UUIDs   │
//! │  discovery│  │ - notify   │  │ - parsing │
//! │           │  │ - watchdog │  │           │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Heart Rate Service UUIDs and measurement parsing
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Connection, subscription and notification streaming
//! - [`service`] - Main service coordinator
//! - `session` - Reconnect loop for one connected sensor

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
mod session;

use thiserror::Error;

// Re-export main service for convenience
pub use service::{BluetoothCommand, BluetoothService};

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[error("Heart rate service not found")]
    ServiceNotFound,
    #[error("Heart rate characteristic not found")]
    CharacteristicNotFound,
    #[error("Timed out while {0}")]
    Timeout(&'static str),
}
