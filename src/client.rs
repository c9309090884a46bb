use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::StreamExt;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};

use crate::{
  adapter::{is_adapter_on, wait_for_adapter},
  codec::{color_to_hex, hex_to_color},
  config::BleConfig,
  connection::ConnectionManager,
  desktop,
  io::{CharacteristicIo, Subscription},
  models::{ConnectionHandle, DeviceReference},
  permissions::{request_permissions, PermissionPlatform},
  scanner::DeviceScanner,
  store::BleStore,
  transport::{BleTransport, UnavailableTransport},
  Error, Result,
};

/// The surface a UI drives. Every operation keeps [`BleStore`] in step with
/// what happened on the radio, and every error it returns is also recorded
/// as the store's last error.
pub struct BleClient {
  config: BleConfig,
  transport: Arc<dyn BleTransport>,
  store: Arc<BleStore>,
  scanner: DeviceScanner,
  connection: Arc<ConnectionManager>,
  io: CharacteristicIo,
  color_listener: Mutex<Option<Subscription>>,
  /// Set when the caller connects or disconnects by hand; the
  /// auto-reconnect loop yields to that choice.
  manual_override: AtomicBool,
}

impl BleClient {
  pub fn new(transport: Arc<dyn BleTransport>, config: BleConfig) -> Self {
    let connection = Arc::new(ConnectionManager::new(transport.clone()));
    Self {
      store: Arc::new(BleStore::new(&config)),
      scanner: DeviceScanner::new(transport.clone()),
      io: CharacteristicIo::new(transport.clone(), connection.clone()),
      connection,
      transport,
      config,
      color_listener: Mutex::new(None),
      manual_override: AtomicBool::new(false),
    }
  }

  /// Binds to the host's first Bluetooth adapter. Without one the client
  /// still works, but every radio operation fails as unavailable.
  pub async fn init(config: BleConfig) -> Self {
    let transport: Arc<dyn BleTransport> = match desktop::init().await {
      Ok(transport) => Arc::new(transport),
      Err(err) => {
        log::warn!("Bluetooth unavailable, continuing without it | err={err}");
        Arc::new(UnavailableTransport)
      }
    };
    Self::new(transport, config)
  }

  pub fn config(&self) -> &BleConfig {
    &self.config
  }

  pub fn store(&self) -> &BleStore {
    &self.store
  }

  pub fn io(&self) -> &CharacteristicIo {
    &self.io
  }

  pub fn is_available(&self) -> bool {
    self.transport.is_available()
  }

  pub async fn request_permissions(&self, platform: &dyn PermissionPlatform) -> bool {
    request_permissions(platform).await
  }

  pub async fn wait_for_adapter(&self, timeout: Duration) -> bool {
    wait_for_adapter(self.transport.as_ref(), self.config.adapter_poll_interval(), timeout).await
  }

  pub fn set_scan_duration(&self, duration_ms: u64) -> u64 {
    self.store.set_scan_duration(duration_ms)
  }

  fn record(&self, err: Error) -> Error {
    log::error!("BLE operation failed | kind={:?} | err={}", err.kind(), err);
    self.store.set_error(&err.to_string());
    err
  }

  /// Runs one scan for the store's configured duration, replacing the
  /// discovered devices. Refusals (no stack, radio off, scan already
  /// running) leave the previous results in place.
  pub async fn start_scan(&self) -> Result<()> {
    if !self.transport.is_available() {
      return Err(self.record(Error::Unavailable));
    }
    if !is_adapter_on(self.transport.as_ref()).await {
      return Err(self.record(Error::AdapterOff));
    }
    if !self.store.try_begin_scan() {
      return Err(self.record(Error::ScanInProgress));
    }
    self.store.clear_error();
    self.store.clear_discovered_devices();

    let options = self.config.scan_options(self.store.scan_duration_ms());
    let store = &self.store;
    let result = self
      .scanner
      .scan(&options, |device| {
        store.record_discovered_device(device);
      })
      .await;
    self.store.set_scanning(false);

    match result {
      Ok(()) => {
        log::info!(
          "Scan completed | devices_found={}",
          self.store.snapshot().discovered_devices.len()
        );
        Ok(())
      }
      Err(err) => Err(self.record(err)),
    }
  }

  pub fn stop_scan(&self) -> bool {
    self.scanner.stop_scan()
  }

  pub async fn connect_to_device(&self, device: &DeviceReference) -> Result<ConnectionHandle> {
    self.manual_override.store(true, Ordering::SeqCst);
    self.establish(device).await
  }

  async fn establish(&self, device: &DeviceReference) -> Result<ConnectionHandle> {
    self.stop_scan();
    self.color_listener.lock().await.take();
    match self.connection.connect(&device.id).await {
      Ok(handle) => {
        self.store.set_connected_device(Some(device.clone()));
        log::info!("Device connected | name={} | id={}", device.display_name(), device.id);
        Ok(handle)
      }
      Err(err) => {
        // Any previous link was already released before dialing.
        self.store.disconnect_device();
        Err(self.record(err))
      }
    }
  }

  pub async fn disconnect(&self) {
    self.manual_override.store(true, Ordering::SeqCst);
    self.color_listener.lock().await.take();
    self.connection.disconnect().await;
    self.store.disconnect_device();
  }

  /// Applies a link loss reported by the stack. Returns whether it concerned
  /// the connected device.
  pub async fn handle_remote_disconnect(&self, device_id: &str) -> bool {
    if !self.connection.handle_remote_disconnect(device_id).await {
      return false;
    }
    self.color_listener.lock().await.take();
    self.store.disconnect_device();
    true
  }

  /// Reads the color characteristic and records it as `#rrggbb`.
  pub async fn read_color(&self) -> Result<Option<String>> {
    let value = self
      .io
      .read(&self.config.color_service_uuid, &self.config.color_characteristic_uuid)
      .await
      .map_err(|err| self.record(err))?;
    let color = value
      .as_deref()
      .map(hex_to_color)
      .transpose()
      .map_err(|err| self.record(err))?;
    self.store.set_retrieved_color(color.clone());
    Ok(color)
  }

  pub async fn send_color(&self, color: &str) -> Result<()> {
    let value = color_to_hex(color).map_err(|err| self.record(err))?;
    self
      .io
      .write(
        &self.config.color_service_uuid,
        &self.config.color_characteristic_uuid,
        &value,
      )
      .await
      .map_err(|err| self.record(err))?;
    self.store.set_current_color(color);
    log::info!("Color sent | color={color} | value={value}");
    Ok(())
  }

  /// Records every notified color as the retrieved color. Replaces any
  /// listener started earlier on this connection.
  pub async fn start_listening(&self) -> Result<()> {
    let mut listener = self.color_listener.lock().await;
    if let Some(previous) = listener.take() {
      previous.unsubscribe().await;
    }
    let store = self.store.clone();
    let subscription = self
      .io
      .subscribe(
        &self.config.color_service_uuid,
        &self.config.color_characteristic_uuid,
        move |value| match hex_to_color(&value) {
          Ok(color) => store.set_retrieved_color(Some(color)),
          Err(err) => log::warn!("Ignoring undecodable color notification | value={value} | err={err}"),
        },
      )
      .await
      .map_err(|err| self.record(err))?;
    *listener = Some(subscription);
    Ok(())
  }

  pub async fn stop_listening(&self) -> bool {
    match self.color_listener.lock().await.take() {
      Some(subscription) => {
        subscription.unsubscribe().await;
        true
      }
      None => false,
    }
  }

  pub async fn send_command(&self, command: &str) -> Result<()> {
    let (Some(service), Some(characteristic)) = (
      self.config.command_service_uuid.as_deref(),
      self.config.command_characteristic_uuid.as_deref(),
    ) else {
      return Err(self.record(Error::InvalidRequest(
        "No command characteristic configured".into(),
      )));
    };
    self
      .io
      .send_command(service, characteristic, command)
      .await
      .map_err(|err| self.record(err))
  }

  /// Scans for a device advertising `name` and connects to the first match.
  pub async fn find_and_connect(&self, name: &str) -> Result<Option<ConnectionHandle>> {
    self.manual_override.store(true, Ordering::SeqCst);
    self.find_and_establish(name).await
  }

  async fn find_and_establish(&self, name: &str) -> Result<Option<ConnectionHandle>> {
    if !self.store.try_begin_scan() {
      return Err(self.record(Error::ScanInProgress));
    }
    let options = self.config.scan_options(self.store.scan_duration_ms());
    let found = self.scanner.find_device(name, &options).await;
    self.store.set_scanning(false);

    let Some(device) = found.map_err(|err| self.record(err))? else {
      return Ok(None);
    };
    self.store.record_discovered_device(device.clone());
    self.establish(&device).await.map(Some)
  }

  /// Keeps the configured target device connected: find it, connect, wait
  /// for the link to drop, then start over after the reconnect delay. The
  /// task ends when Bluetooth is unavailable, or once the caller connects or
  /// disconnects by hand.
  pub fn spawn_auto_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
    self.manual_override.store(false, Ordering::SeqCst);
    let client = Arc::clone(self);
    tokio::spawn(async move { client.auto_reconnect().await })
  }

  async fn auto_reconnect(&self) {
    let name = self.config.target_device_name.clone();
    let mut disconnections = match self.transport.disconnections().await {
      Ok(stream) => stream,
      Err(err) => {
        log::error!("Auto-reconnect disabled | err={err}");
        return;
      }
    };
    log::info!("Auto-reconnect started | target={name}");

    loop {
      if self.manual_override.load(Ordering::SeqCst) {
        log::info!("Auto-reconnect stopped by manual connection change | target={name}");
        return;
      }
      match self.find_and_establish(&name).await {
        Ok(Some(handle)) => loop {
          match disconnections.next().await {
            Some(device_id) if device_id == handle.device_id => {
              if self.manual_override.load(Ordering::SeqCst) {
                log::info!("Auto-reconnect stopped by manual connection change | device_id={device_id}");
                return;
              }
              self.handle_remote_disconnect(&device_id).await;
              log::info!("Target device lost, reconnecting | device_id={device_id}");
              break;
            }
            Some(_) => continue,
            None => {
              log::warn!("Disconnection events ended, stopping auto-reconnect");
              return;
            }
          }
        },
        Ok(None) => log::info!("Target device not found | target={name}"),
        Err(Error::Unavailable) => {
          log::error!("Auto-reconnect stopped | err={}", Error::Unavailable);
          return;
        }
        Err(err) => log::warn!("Reconnect attempt failed | target={name} | err={err}"),
      }
      sleep(self.config.reconnect_delay()).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use tokio::time::timeout;

  use super::*;
  use crate::{codec::parse_uuid, models::AdapterState, simulated::SimulatedTransport, ErrorKind};

  const COLOR_SERVICE: &str = "180f";
  const COLOR_LEVEL: &str = "2a19";

  fn sim_with_scale() -> Arc<SimulatedTransport> {
    let sim = Arc::new(SimulatedTransport::new());
    sim.advertise_at(10, DeviceReference::new("scale-1").with_name("SmartScale"));
    sim.add_characteristic(
      "scale-1",
      parse_uuid(COLOR_SERVICE).unwrap(),
      parse_uuid(COLOR_LEVEL).unwrap(),
    );
    sim
  }

  fn client_for(sim: &Arc<SimulatedTransport>) -> BleClient {
    BleClient::new(sim.clone(), BleConfig::default())
  }

  async fn connected_client(sim: &Arc<SimulatedTransport>) -> BleClient {
    let client = client_for(sim);
    client
      .connect_to_device(&DeviceReference::new("scale-1").with_name("SmartScale"))
      .await
      .unwrap();
    client
  }

  #[tokio::test(start_paused = true)]
  async fn scan_replaces_devices_and_clears_error() {
    let sim = Arc::new(SimulatedTransport::new());
    sim.advertise_at(10, DeviceReference::new("A"));
    sim.advertise_at(20, DeviceReference::new("B"));
    sim.advertise_at(30, DeviceReference::new("A"));
    let client = client_for(&sim);
    client.store().record_discovered_device(DeviceReference::new("stale"));
    client.store().set_error("old failure");

    client.start_scan().await.unwrap();

    let state = client.store().snapshot();
    let ids: Vec<&str> = state
      .discovered_devices
      .iter()
      .map(|device| device.id.as_str())
      .collect();
    assert_eq!(ids, ["A", "B"]);
    assert!(!state.connection.is_scanning);
    assert!(state.connection.last_scan_start_time.is_some());
    assert_eq!(state.connection.last_error, None);
  }

  #[tokio::test]
  async fn adapter_off_keeps_previous_results() {
    let sim = Arc::new(SimulatedTransport::new());
    sim.set_adapter_state(AdapterState::PoweredOff);
    let client = client_for(&sim);
    client.store().record_discovered_device(DeviceReference::new("A"));

    let err = client.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterOff);
    let state = client.store().snapshot();
    assert_eq!(state.discovered_devices.len(), 1);
    assert!(!state.connection.is_scanning);
    assert_eq!(
      state.connection.last_error.as_deref(),
      Some("Bluetooth is powered off. Please enable Bluetooth to scan for devices.")
    );
    assert_eq!(sim.calls().start_scan, 0);
  }

  #[tokio::test]
  async fn unavailable_stack_is_recorded() {
    let client = BleClient::new(Arc::new(UnavailableTransport), BleConfig::default());
    assert!(!client.is_available());
    let err = client.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(
      client.store().snapshot().connection.last_error.as_deref(),
      Some("BLE not available on this device")
    );
  }

  #[tokio::test]
  async fn read_color_pads_to_six_digits() {
    let sim = sim_with_scale();
    sim.set_value(
      "scale-1",
      parse_uuid(COLOR_SERVICE).unwrap(),
      parse_uuid(COLOR_LEVEL).unwrap(),
      &[0x64],
    );
    let client = connected_client(&sim).await;

    assert_eq!(client.read_color().await.unwrap().as_deref(), Some("#000064"));
    assert_eq!(client.store().snapshot().retrieved_color.as_deref(), Some("#000064"));
  }

  #[tokio::test]
  async fn send_color_writes_minimal_even_hex() {
    let sim = sim_with_scale();
    let client = connected_client(&sim).await;

    client.send_color("#0000ff").await.unwrap();
    let stored = sim.raw_value(
      "scale-1",
      parse_uuid(COLOR_SERVICE).unwrap(),
      parse_uuid(COLOR_LEVEL).unwrap(),
    );
    assert_eq!(stored.as_deref(), Some("/w=="));
    assert_eq!(client.store().snapshot().current_color, "#0000ff");
  }

  #[tokio::test]
  async fn color_io_without_connection_records_precondition() {
    let sim = sim_with_scale();
    let client = client_for(&sim);

    let err = client.send_color("#00ff00").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    let state = client.store().snapshot();
    assert_eq!(state.connection.last_error.as_deref(), Some("No device connected"));
    assert_eq!(state.current_color, "#FFFFFF");
    assert_eq!(sim.calls().characteristic_ops(), 0);
  }

  #[tokio::test]
  async fn listening_records_notified_colors() {
    let sim = sim_with_scale();
    let client = connected_client(&sim).await;
    let mut changes = client.store().subscribe();

    client.start_listening().await.unwrap();
    sim.notify("scale-1", parse_uuid(COLOR_LEVEL).unwrap(), &[0x00, 0xff, 0x00]);

    timeout(
      Duration::from_secs(1),
      changes.wait_for(|state| state.retrieved_color.as_deref() == Some("#00ff00")),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(client.stop_listening().await);
    assert!(!client.stop_listening().await);
  }

  #[tokio::test]
  async fn disconnect_clears_device_and_color() {
    let sim = sim_with_scale();
    let client = connected_client(&sim).await;
    client.store().set_retrieved_color(Some("#123456".into()));

    client.disconnect().await;
    let state = client.store().snapshot();
    assert!(state.connection.connected_device.is_none());
    assert!(state.retrieved_color.is_none());
    assert!(!sim.is_connected("scale-1"));
  }

  #[tokio::test]
  async fn send_command_needs_a_configured_characteristic() {
    let sim = sim_with_scale();
    let client = connected_client(&sim).await;
    let err = client.send_command("TARE").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let config = BleConfig {
      command_service_uuid: Some(COLOR_SERVICE.into()),
      command_characteristic_uuid: Some(COLOR_LEVEL.into()),
      ..BleConfig::default()
    };
    let client = BleClient::new(sim.clone(), config);
    client
      .connect_to_device(&DeviceReference::new("scale-1"))
      .await
      .unwrap();
    client.send_command("TARE").await.unwrap();
    assert_eq!(sim.calls().write, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn auto_reconnect_follows_link_loss() {
    let sim = sim_with_scale();
    let client = Arc::new(client_for(&sim));
    let mut changes = client.store().subscribe();
    let task = client.spawn_auto_reconnect();

    timeout(
      Duration::from_secs(30),
      changes.wait_for(|state| state.connection.connected_device.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sim.calls().connect, 1);

    sim.drop_connection("scale-1");
    timeout(
      Duration::from_secs(30),
      changes.wait_for(|state| state.connection.connected_device.is_none()),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(
      Duration::from_secs(30),
      changes.wait_for(|state| state.connection.connected_device.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sim.calls().connect, 2);
    assert!(sim.is_connected("scale-1"));

    task.abort();
  }

  #[tokio::test]
  async fn failed_switch_clears_the_previous_device() {
    let sim = sim_with_scale();
    sim.add_characteristic("thermo", parse_uuid(COLOR_SERVICE).unwrap(), parse_uuid(COLOR_LEVEL).unwrap());
    let client = connected_client(&sim).await;
    client.store().set_retrieved_color(Some("#000064".into()));

    sim.fail_next_connect("gatt 133");
    let err = client
      .connect_to_device(&DeviceReference::new("thermo"))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    let state = client.store().snapshot();
    assert!(state.connection.connected_device.is_none());
    assert!(state.retrieved_color.is_none());
    assert_eq!(state.connection.last_error.as_deref(), Some("gatt 133"));
    assert!(!sim.is_connected("scale-1"));
  }

  #[tokio::test]
  async fn find_and_connect_records_refusals() {
    let sim = sim_with_scale();
    sim.set_adapter_state(AdapterState::PoweredOff);
    let client = client_for(&sim);

    let err = client.find_and_connect("SmartScale").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterOff);
    let state = client.store().snapshot();
    assert_eq!(
      state.connection.last_error.as_deref(),
      Some("Bluetooth is powered off. Please enable Bluetooth to scan for devices.")
    );
    assert!(!state.connection.is_scanning);

    client.store().set_error("");
    assert!(client.store().try_begin_scan());
    let err = client.find_and_connect("SmartScale").await.unwrap_err();
    assert!(matches!(err, Error::ScanInProgress));
    assert_eq!(
      client.store().snapshot().connection.last_error.as_deref(),
      Some("A scan is already in progress")
    );
  }

  async fn wait_until_connected(client: &BleClient) {
    let mut changes = client.store().subscribe();
    timeout(
      Duration::from_secs(30),
      changes.wait_for(|state| state.connection.connected_device.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn auto_reconnect_respects_manual_disconnect() {
    let sim = sim_with_scale();
    let client = Arc::new(client_for(&sim));
    let task = client.spawn_auto_reconnect();
    wait_until_connected(&client).await;

    client.disconnect().await;
    timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    assert_eq!(sim.calls().connect, 1);
    assert!(!sim.is_connected("scale-1"));
    assert!(client.store().snapshot().connection.connected_device.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn auto_reconnect_respects_manual_device_switch() {
    let sim = sim_with_scale();
    sim.add_characteristic("thermo", parse_uuid(COLOR_SERVICE).unwrap(), parse_uuid(COLOR_LEVEL).unwrap());
    let client = Arc::new(client_for(&sim));
    let task = client.spawn_auto_reconnect();
    wait_until_connected(&client).await;

    client
      .connect_to_device(&DeviceReference::new("thermo"))
      .await
      .unwrap();
    timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    assert_eq!(sim.calls().connect, 2);
    assert!(sim.is_connected("thermo"));
    assert!(!sim.is_connected("scale-1"));
    let state = client.store().snapshot();
    assert_eq!(
      state.connection.connected_device.map(|device| device.id).as_deref(),
      Some("thermo")
    );
  }

  #[tokio::test]
  async fn auto_reconnect_gives_up_without_bluetooth() {
    let client = Arc::new(BleClient::new(Arc::new(UnavailableTransport), BleConfig::default()));
    timeout(Duration::from_secs(1), client.spawn_auto_reconnect())
      .await
      .unwrap()
      .unwrap();
  }
}
