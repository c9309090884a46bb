//! BLE central workflow for SmartScale peripherals.
//!
//! [`BleClient`] is the entry point: it checks the radio, scans, connects,
//! reads and writes the color characteristic and keeps an observable
//! [`AppState`] in [`BleStore`]. The radio itself sits behind
//! [`BleTransport`]; [`desktop::BtleplugTransport`] drives the host stack and
//! [`simulated::SimulatedTransport`] stands in for it without hardware.

pub use models::*;

pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod desktop;
mod error;
pub mod io;
mod models;
pub mod permissions;
pub mod scanner;
pub mod simulated;
pub mod store;
pub mod transport;

pub use client::BleClient;
pub use config::BleConfig;
pub use connection::ConnectionManager;
pub use error::{Error, ErrorKind, Result};
pub use io::{CharacteristicIo, Subscription};
pub use permissions::{request_permissions, PermissionPlatform};
pub use scanner::DeviceScanner;
pub use store::BleStore;
pub use transport::{BleTransport, UnavailableTransport};
