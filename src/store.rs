use chrono::Utc;
use tokio::sync::watch;

use crate::{
  config::BleConfig,
  models::{AppState, DeviceReference},
};

/// Single owner of [`AppState`]. Every mutation goes through one of the
/// named transitions below; observers hold a `watch::Receiver` and see each
/// change that actually modified the state.
pub struct BleStore {
  state: watch::Sender<AppState>,
  min_scan_duration_ms: u64,
  max_scan_duration_ms: u64,
}

impl BleStore {
  pub fn new(config: &BleConfig) -> Self {
    let initial = AppState::new(config.clamp_scan_duration(config.scan_duration_ms));
    Self {
      state: watch::Sender::new(initial),
      min_scan_duration_ms: config.min_scan_duration_ms,
      max_scan_duration_ms: config.max_scan_duration_ms,
    }
  }

  pub fn snapshot(&self) -> AppState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<AppState> {
    self.state.subscribe()
  }

  /// Appends `device` unless its id is already present. The first record
  /// for an id wins.
  pub fn record_discovered_device(&self, device: DeviceReference) -> bool {
    self.state.send_if_modified(|state| {
      if state
        .discovered_devices
        .iter()
        .any(|known| known.id == device.id)
      {
        return false;
      }
      state.discovered_devices.push(device);
      true
    })
  }

  pub fn clear_discovered_devices(&self) {
    self.state.send_if_modified(|state| {
      let had_devices = !state.discovered_devices.is_empty();
      state.discovered_devices.clear();
      had_devices
    });
  }

  /// Records the connected peripheral. A successful connection clears the
  /// last error.
  pub fn set_connected_device(&self, device: Option<DeviceReference>) {
    self.state.send_modify(|state| {
      if device.is_some() {
        state.connection.last_error = None;
      }
      state.connection.connected_device = device;
    });
  }

  pub fn disconnect_device(&self) {
    self.state.send_if_modified(|state| {
      let changed = state.connection.connected_device.is_some() || state.retrieved_color.is_some();
      state.connection.connected_device = None;
      state.retrieved_color = None;
      changed
    });
  }

  pub fn set_scanning(&self, scanning: bool) {
    self.state.send_modify(|state| {
      state.connection.is_scanning = scanning;
      if scanning {
        state.connection.last_scan_start_time = Some(Utc::now());
      }
    });
  }

  /// Flips `is_scanning` on. False, with nothing changed, when a scan is
  /// already recorded as running.
  pub fn try_begin_scan(&self) -> bool {
    self.state.send_if_modified(|state| {
      if state.connection.is_scanning {
        return false;
      }
      state.connection.is_scanning = true;
      state.connection.last_scan_start_time = Some(Utc::now());
      true
    })
  }

  /// Replaces the last error. An empty message clears it.
  pub fn set_error(&self, message: &str) {
    let next = (!message.is_empty()).then(|| message.to_string());
    self.state.send_if_modified(|state| {
      if state.connection.last_error == next {
        return false;
      }
      state.connection.last_error = next;
      true
    });
  }

  pub fn clear_error(&self) {
    self.set_error("");
  }

  /// Stores the duration used by the next scan, clamped to the configured
  /// range. Returns the value actually stored.
  pub fn set_scan_duration(&self, duration_ms: u64) -> u64 {
    let clamped = duration_ms.clamp(self.min_scan_duration_ms, self.max_scan_duration_ms);
    if clamped != duration_ms {
      log::debug!("Scan duration clamped | requested_ms={duration_ms} | stored_ms={clamped}");
    }
    self.state.send_if_modified(|state| {
      let changed = state.connection.scan_duration_ms != clamped;
      state.connection.scan_duration_ms = clamped;
      changed
    });
    clamped
  }

  pub fn scan_duration_ms(&self) -> u64 {
    self.state.borrow().connection.scan_duration_ms
  }

  pub fn set_retrieved_color(&self, color: Option<String>) {
    self.state.send_if_modified(|state| {
      if state.retrieved_color == color {
        return false;
      }
      state.retrieved_color = color;
      true
    });
  }

  pub fn set_current_color(&self, color: impl Into<String>) {
    let color = color.into();
    self.state.send_if_modified(|state| {
      if state.current_color == color {
        return false;
      }
      state.current_color = color;
      true
    });
  }
}
