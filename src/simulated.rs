//! In-process BLE peripheral simulator.
//!
//! Implements [`BleTransport`] without hardware: scripted advertisements on
//! a virtual timeline, an in-memory GATT table per peripheral, injectable
//! notifications and link drops, and per-operation call counters so tests
//! can assert that an operation never reached the transport.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use tokio::{
  task::JoinHandle,
  time::{sleep_until, Instant},
};
use uuid::Uuid;

use crate::{
  codec::bytes_to_base64,
  models::*,
  transport::{BleTransport, DisconnectionStream, DiscoveryStream, NotificationStream},
  Error, Result,
};

/// One entry of the advertisement timeline, offset from scan start.
#[derive(Debug, Clone)]
enum ScanStep {
  Advertise { at: Duration, device: DeviceReference },
  Fail { at: Duration, message: String },
}

impl ScanStep {
  fn at(&self) -> Duration {
    match self {
      ScanStep::Advertise { at, .. } | ScanStep::Fail { at, .. } => *at,
    }
  }
}

#[derive(Debug, Default)]
struct SimPeripheral {
  gatt: BTreeMap<Uuid, BTreeSet<Uuid>>,
  values: HashMap<(Uuid, Uuid), String>,
}

/// How many times each transport operation was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
  pub adapter_state: usize,
  pub start_scan: usize,
  pub stop_scan: usize,
  pub connect: usize,
  pub discover_services: usize,
  pub disconnect: usize,
  pub read: usize,
  pub write: usize,
  pub monitor: usize,
  pub unmonitor: usize,
}

impl CallCounts {
  /// Calls that need a connected peripheral.
  pub fn characteristic_ops(&self) -> usize {
    self.read + self.write + self.monitor + self.unmonitor
  }
}

struct SimState {
  adapter_state: Option<AdapterState>,
  adapter_query_delay: Duration,
  script: Vec<ScanStep>,
  peripherals: HashMap<String, SimPeripheral>,
  connected: HashSet<String>,
  scan_task: Option<JoinHandle<()>>,
  monitors: HashMap<(String, Uuid), Vec<mpsc::UnboundedSender<Result<String>>>>,
  disconnect_listeners: Vec<mpsc::UnboundedSender<String>>,
  fail_next_connect: Option<String>,
  calls: CallCounts,
}

pub struct SimulatedTransport {
  state: Mutex<SimState>,
}

impl Default for SimulatedTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl SimulatedTransport {
  /// A powered-on adapter with no peripherals in range.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(SimState {
        adapter_state: Some(AdapterState::PoweredOn),
        adapter_query_delay: Duration::ZERO,
        script: Vec::new(),
        peripherals: HashMap::new(),
        connected: HashSet::new(),
        scan_task: None,
        monitors: HashMap::new(),
        disconnect_listeners: Vec::new(),
        fail_next_connect: None,
        calls: CallCounts::default(),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, SimState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn set_adapter_state(&self, state: AdapterState) {
    self.lock().adapter_state = Some(state);
  }

  /// Makes the adapter state query itself fail.
  pub fn fail_adapter_query(&self) {
    self.lock().adapter_state = None;
  }

  /// Makes every adapter state query take `delay` before answering.
  pub fn set_adapter_query_delay(&self, delay: Duration) {
    self.lock().adapter_query_delay = delay;
  }

  /// Schedules `device` to be advertised `at_ms` after each scan starts and
  /// makes it connectable.
  pub fn advertise_at(&self, at_ms: u64, device: DeviceReference) {
    let mut state = self.lock();
    state.peripherals.entry(device.id.clone()).or_default();
    state.script.push(ScanStep::Advertise {
      at: Duration::from_millis(at_ms),
      device,
    });
  }

  pub fn fail_scan_at(&self, at_ms: u64, message: impl Into<String>) {
    self.lock().script.push(ScanStep::Fail {
      at: Duration::from_millis(at_ms),
      message: message.into(),
    });
  }

  pub fn add_characteristic(&self, device_id: &str, service: Uuid, characteristic: Uuid) {
    self
      .lock()
      .peripherals
      .entry(device_id.to_string())
      .or_default()
      .gatt
      .entry(service)
      .or_default()
      .insert(characteristic);
  }

  pub fn set_value(&self, device_id: &str, service: Uuid, characteristic: Uuid, bytes: &[u8]) {
    self.add_characteristic(device_id, service, characteristic);
    if let Some(peripheral) = self.lock().peripherals.get_mut(device_id) {
      peripheral
        .values
        .insert((service, characteristic), bytes_to_base64(bytes));
    }
  }

  /// The base64 text last stored for a characteristic.
  pub fn raw_value(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Option<String> {
    self
      .lock()
      .peripherals
      .get(device_id)
      .and_then(|peripheral| peripheral.values.get(&(service, characteristic)).cloned())
  }

  /// Pushes a notification to every monitor of the characteristic. Returns
  /// how many monitors received it.
  pub fn notify(&self, device_id: &str, characteristic: Uuid, bytes: &[u8]) -> usize {
    self.deliver(device_id, characteristic, Ok(bytes_to_base64(bytes)))
  }

  /// Pushes a failed notification, as a stack reports a GATT error.
  pub fn notify_error(&self, device_id: &str, characteristic: Uuid, message: impl Into<String>) -> usize {
    self.deliver(device_id, characteristic, Err(message.into()))
  }

  fn deliver(&self, device_id: &str, characteristic: Uuid, item: std::result::Result<String, String>) -> usize {
    let mut state = self.lock();
    let Some(senders) = state.monitors.get_mut(&(device_id.to_string(), characteristic)) else {
      return 0;
    };
    senders.retain(|sender| !sender.is_closed());
    senders
      .iter()
      .filter(|sender| sender.unbounded_send(item.clone().map_err(Error::Transport)).is_ok())
      .count()
  }

  /// Simulates the peripheral going out of range.
  pub fn drop_connection(&self, device_id: &str) {
    let mut state = self.lock();
    state.connected.remove(device_id);
    state
      .monitors
      .retain(|(monitored, _), _| monitored.as_str() != device_id);
    state
      .disconnect_listeners
      .retain(|listener| listener.unbounded_send(device_id.to_string()).is_ok());
  }

  pub fn fail_next_connect(&self, message: impl Into<String>) {
    self.lock().fail_next_connect = Some(message.into());
  }

  pub fn is_connected(&self, device_id: &str) -> bool {
    self.lock().connected.contains(device_id)
  }

  pub fn active_monitors(&self, device_id: &str, characteristic: Uuid) -> usize {
    self
      .lock()
      .monitors
      .get(&(device_id.to_string(), characteristic))
      .map(|senders| senders.iter().filter(|sender| !sender.is_closed()).count())
      .unwrap_or(0)
  }

  pub fn calls(&self) -> CallCounts {
    self.lock().calls
  }

  fn ensure_connected(state: &SimState, device_id: &str) -> Result<()> {
    if state.connected.contains(device_id) {
      Ok(())
    } else {
      Err(Error::Transport(format!("device {device_id} is not connected")))
    }
  }

  fn ensure_characteristic(state: &SimState, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
    let peripheral = state
      .peripherals
      .get(device_id)
      .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
    let characteristics = peripheral.gatt.get(&service).ok_or_else(|| Error::ServiceNotFound {
      device_id: device_id.to_string(),
      service_uuid: service.to_string(),
    })?;
    if !characteristics.contains(&characteristic) {
      return Err(Error::CharacteristicNotFound {
        device_id: device_id.to_string(),
        characteristic_uuid: characteristic.to_string(),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
  async fn adapter_state(&self) -> Result<AdapterState> {
    let delay = {
      let mut state = self.lock();
      state.calls.adapter_state += 1;
      state.adapter_query_delay
    };
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self
      .lock()
      .adapter_state
      .ok_or_else(|| Error::Transport("adapter state query failed".into()))
  }

  async fn start_scan(&self, _options: &ScanOptions) -> Result<DiscoveryStream> {
    let mut state = self.lock();
    state.calls.start_scan += 1;
    let mut steps = state.script.clone();
    steps.sort_by_key(ScanStep::at);
    let (tx, rx) = mpsc::unbounded();
    let started = Instant::now();
    let task = tokio::spawn(async move {
      for step in steps {
        sleep_until(started + step.at()).await;
        let item = match step {
          ScanStep::Advertise { device, .. } => Ok(device),
          ScanStep::Fail { message, .. } => Err(Error::Transport(message)),
        };
        if tx.unbounded_send(item).is_err() {
          return;
        }
      }
    });
    if let Some(previous) = state.scan_task.replace(task) {
      previous.abort();
    }
    Ok(rx.boxed())
  }

  async fn stop_scan(&self) -> Result<()> {
    let mut state = self.lock();
    state.calls.stop_scan += 1;
    if let Some(task) = state.scan_task.take() {
      task.abort();
    }
    Ok(())
  }

  async fn connect(&self, device_id: &str) -> Result<()> {
    let mut state = self.lock();
    state.calls.connect += 1;
    if let Some(message) = state.fail_next_connect.take() {
      return Err(Error::Transport(message));
    }
    if !state.peripherals.contains_key(device_id) {
      return Err(Error::DeviceNotFound(device_id.to_string()));
    }
    state.connected.insert(device_id.to_string());
    Ok(())
  }

  async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>> {
    let mut state = self.lock();
    state.calls.discover_services += 1;
    Self::ensure_connected(&state, device_id)?;
    let peripheral = state
      .peripherals
      .get(device_id)
      .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
    let services = peripheral
      .gatt
      .iter()
      .map(|(service, characteristics)| ServiceInfo {
        uuid: service.to_string(),
        is_primary: true,
        characteristics: characteristics
          .iter()
          .map(|characteristic| CharacteristicInfo {
            uuid: characteristic.to_string(),
            properties: CharacteristicProperties {
              read: true,
              write: true,
              notify: true,
              ..Default::default()
            },
          })
          .collect(),
      })
      .collect();
    Ok(services)
  }

  /// Like the host stacks, a local disconnect is also reported on
  /// [`BleTransport::disconnections`].
  async fn disconnect(&self, device_id: &str) -> Result<()> {
    let mut state = self.lock();
    state.calls.disconnect += 1;
    let was_connected = state.connected.remove(device_id);
    state
      .monitors
      .retain(|(monitored, _), _| monitored.as_str() != device_id);
    if was_connected {
      state
        .disconnect_listeners
        .retain(|listener| listener.unbounded_send(device_id.to_string()).is_ok());
    }
    Ok(())
  }

  async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Option<String>> {
    let mut state = self.lock();
    state.calls.read += 1;
    Self::ensure_connected(&state, device_id)?;
    Self::ensure_characteristic(&state, device_id, service, characteristic)?;
    let value = state
      .peripherals
      .get(device_id)
      .and_then(|peripheral| peripheral.values.get(&(service, characteristic)))
      .filter(|value| !value.is_empty())
      .cloned();
    Ok(value)
  }

  async fn write_with_response(
    &self,
    device_id: &str,
    service: Uuid,
    characteristic: Uuid,
    value: &str,
  ) -> Result<()> {
    let mut state = self.lock();
    state.calls.write += 1;
    Self::ensure_connected(&state, device_id)?;
    Self::ensure_characteristic(&state, device_id, service, characteristic)?;
    if let Some(peripheral) = state.peripherals.get_mut(device_id) {
      peripheral
        .values
        .insert((service, characteristic), value.to_string());
    }
    Ok(())
  }

  async fn monitor(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
    let mut state = self.lock();
    state.calls.monitor += 1;
    Self::ensure_connected(&state, device_id)?;
    Self::ensure_characteristic(&state, device_id, service, characteristic)?;
    let (tx, rx) = mpsc::unbounded();
    state
      .monitors
      .entry((device_id.to_string(), characteristic))
      .or_default()
      .push(tx);
    Ok(rx.boxed())
  }

  async fn unmonitor(&self, device_id: &str, _service: Uuid, characteristic: Uuid) -> Result<()> {
    let mut state = self.lock();
    state.calls.unmonitor += 1;
    state.monitors.remove(&(device_id.to_string(), characteristic));
    Ok(())
  }

  async fn disconnections(&self) -> Result<DisconnectionStream> {
    let (tx, rx) = mpsc::unbounded();
    self.lock().disconnect_listeners.push(tx);
    Ok(rx.boxed())
  }
}
