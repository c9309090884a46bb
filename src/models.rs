use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SCAN_DURATION_MS: u64 = 10_000;
pub const DEFAULT_COLOR: &str = "#FFFFFF";

/// A peripheral observed during a scan. Immutable once recorded; a later
/// advertisement for the same `id` is dropped rather than merged.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReference {
  pub id: String,
  pub name: Option<String>,
  pub rssi: Option<i16>,
  pub service_uuids: Option<BTreeSet<String>>,
  pub is_connectable: Option<bool>,
}

impl DeviceReference {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: None,
      rssi: None,
      service_uuids: None,
      is_connectable: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_rssi(mut self, rssi: i16) -> Self {
    self.rssi = Some(rssi);
    self
  }

  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or("Unknown")
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ScanMode {
  LowPower,
  #[default]
  Balanced,
  LowLatency,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
  #[serde(default = "default_scan_duration_ms")]
  pub duration_ms: u64,
  #[serde(default)]
  pub allow_duplicates: bool,
  /// Duty-cycle hint. Backends that cannot tune the radio ignore it.
  #[serde(default)]
  pub scan_mode: ScanMode,
  /// Only report peripherals advertising all of these services.
  #[serde(default)]
  pub services: Vec<Uuid>,
}

fn default_scan_duration_ms() -> u64 {
  DEFAULT_SCAN_DURATION_MS
}

impl Default for ScanOptions {
  fn default() -> Self {
    Self::new(DEFAULT_SCAN_DURATION_MS)
  }
}

impl ScanOptions {
  pub fn new(duration_ms: u64) -> Self {
    Self {
      duration_ms,
      allow_duplicates: false,
      scan_mode: ScanMode::default(),
      services: Vec::new(),
    }
  }

  pub fn allow_duplicates(mut self, allow: bool) -> Self {
    self.allow_duplicates = allow;
    self
  }
}

/// Power state of the local radio as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
  PoweredOn,
  PoweredOff,
  Unknown,
  Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
  pub uuid: String,
  #[serde(default)]
  pub is_primary: bool,
  #[serde(default)]
  pub characteristics: Vec<CharacteristicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicInfo {
  pub uuid: String,
  #[serde(default)]
  pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicProperties {
  pub broadcast: bool,
  pub read: bool,
  pub write_without_response: bool,
  pub write: bool,
  pub notify: bool,
  pub indicate: bool,
  pub authenticated_signed_writes: bool,
}

/// The live connection as seen by callers: which peripheral, and the GATT
/// layout discovered right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHandle {
  pub device_id: String,
  pub services: Vec<ServiceInfo>,
}

impl ConnectionHandle {
  pub fn device_id(&self) -> &str {
    &self.device_id
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
  pub connected_device: Option<DeviceReference>,
  pub is_scanning: bool,
  pub last_error: Option<String>,
  pub scan_duration_ms: u64,
  pub last_scan_start_time: Option<DateTime<Utc>>,
}

/// Everything the UI reads. Mutated only through `BleStore` transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
  pub discovered_devices: Vec<DeviceReference>,
  pub connection: ConnectionState,
  pub retrieved_color: Option<String>,
  pub current_color: String,
}

impl AppState {
  pub fn new(scan_duration_ms: u64) -> Self {
    Self {
      discovered_devices: Vec::new(),
      connection: ConnectionState {
        connected_device: None,
        is_scanning: false,
        last_error: None,
        scan_duration_ms,
        last_scan_start_time: None,
      },
      retrieved_color: None,
      current_color: DEFAULT_COLOR.to_string(),
    }
  }
}

impl Default for AppState {
  fn default() -> Self {
    Self::new(DEFAULT_SCAN_DURATION_MS)
  }
}
