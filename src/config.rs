use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
  models::{ScanMode, ScanOptions, DEFAULT_SCAN_DURATION_MS},
  Error, Result,
};

pub const DEFAULT_TARGET_DEVICE_NAME: &str = "SmartScale";
/// Battery service / battery level, the channel the demo firmware exposes.
pub const DEFAULT_COLOR_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";
pub const DEFAULT_COLOR_CHARACTERISTIC_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BleConfig {
  #[serde(default = "default_scan_duration_ms")]
  pub scan_duration_ms: u64,
  #[serde(default = "default_min_scan_duration_ms")]
  pub min_scan_duration_ms: u64,
  #[serde(default = "default_max_scan_duration_ms")]
  pub max_scan_duration_ms: u64,
  #[serde(default)]
  pub allow_duplicates: bool,
  #[serde(default)]
  pub scan_mode: ScanMode,
  #[serde(default = "default_target_device_name")]
  pub target_device_name: String,
  #[serde(default = "default_color_service_uuid")]
  pub color_service_uuid: String,
  #[serde(default = "default_color_characteristic_uuid")]
  pub color_characteristic_uuid: String,
  pub command_service_uuid: Option<String>,
  pub command_characteristic_uuid: Option<String>,
  #[serde(default = "default_reconnect_delay_ms")]
  pub reconnect_delay_ms: u64,
  #[serde(default = "default_adapter_poll_interval_ms")]
  pub adapter_poll_interval_ms: u64,
}

fn default_scan_duration_ms() -> u64 {
  DEFAULT_SCAN_DURATION_MS
}

fn default_min_scan_duration_ms() -> u64 {
  1_000
}

fn default_max_scan_duration_ms() -> u64 {
  60_000
}

fn default_target_device_name() -> String {
  DEFAULT_TARGET_DEVICE_NAME.to_string()
}

fn default_color_service_uuid() -> String {
  DEFAULT_COLOR_SERVICE_UUID.to_string()
}

fn default_color_characteristic_uuid() -> String {
  DEFAULT_COLOR_CHARACTERISTIC_UUID.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
  1_000
}

fn default_adapter_poll_interval_ms() -> u64 {
  300
}

impl Default for BleConfig {
  fn default() -> Self {
    Self {
      scan_duration_ms: default_scan_duration_ms(),
      min_scan_duration_ms: default_min_scan_duration_ms(),
      max_scan_duration_ms: default_max_scan_duration_ms(),
      allow_duplicates: false,
      scan_mode: ScanMode::default(),
      target_device_name: default_target_device_name(),
      color_service_uuid: default_color_service_uuid(),
      color_characteristic_uuid: default_color_characteristic_uuid(),
      command_service_uuid: None,
      command_characteristic_uuid: None,
      reconnect_delay_ms: default_reconnect_delay_ms(),
      adapter_poll_interval_ms: default_adapter_poll_interval_ms(),
    }
  }
}

impl BleConfig {
  pub fn from_json_str(raw: &str) -> Result<Self> {
    let config: Self = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let config = Self::from_json_str(&raw)?;
    log::info!("Loaded BLE config | path={}", path.display());
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.min_scan_duration_ms == 0 || self.min_scan_duration_ms > self.max_scan_duration_ms {
      return Err(Error::InvalidRequest(format!(
        "scan duration range {}..={} ms is empty",
        self.min_scan_duration_ms, self.max_scan_duration_ms
      )));
    }
    if self.target_device_name.trim().is_empty() {
      return Err(Error::InvalidRequest("targetDeviceName must not be empty".into()));
    }
    Ok(())
  }

  /// Clamps a requested scan duration into the configured range.
  pub fn clamp_scan_duration(&self, duration_ms: u64) -> u64 {
    duration_ms.clamp(self.min_scan_duration_ms, self.max_scan_duration_ms)
  }

  pub fn scan_options(&self, duration_ms: u64) -> ScanOptions {
    ScanOptions {
      duration_ms,
      allow_duplicates: self.allow_duplicates,
      scan_mode: self.scan_mode,
      services: Vec::new(),
    }
  }

  pub fn reconnect_delay(&self) -> Duration {
    Duration::from_millis(self.reconnect_delay_ms)
  }

  pub fn adapter_poll_interval(&self) -> Duration {
    Duration::from_millis(self.adapter_poll_interval_ms.max(1))
  }
}
