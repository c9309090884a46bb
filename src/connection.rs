use std::{collections::HashMap, sync::Arc};

use tokio::{sync::Mutex, task::AbortHandle};
use uuid::Uuid;

use crate::{models::ConnectionHandle, transport::BleTransport, Error, Result};

/// Owns the single active connection. Connecting to a new peripheral first
/// closes the previous one and revokes its subscriptions.
pub struct ConnectionManager {
  transport: Arc<dyn BleTransport>,
  active: Mutex<Option<ActiveConnection>>,
}

struct ActiveConnection {
  handle: ConnectionHandle,
  subscriptions: HashMap<Uuid, AbortHandle>,
}

impl ActiveConnection {
  fn revoke_subscriptions(&mut self) {
    for (_, task) in self.subscriptions.drain() {
      task.abort();
    }
  }
}

impl ConnectionManager {
  pub fn new(transport: Arc<dyn BleTransport>) -> Self {
    Self {
      transport,
      active: Mutex::new(None),
    }
  }

  /// Connects and discovers every service and characteristic before
  /// returning. No retry is attempted.
  pub async fn connect(&self, device_id: &str) -> Result<ConnectionHandle> {
    if !self.transport.is_available() {
      return Err(Error::Unavailable);
    }
    let mut active = self.active.lock().await;
    if let Some(previous) = active.take() {
      log::info!(
        "Replacing connection | previous_device_id={} | device_id={}",
        previous.handle.device_id,
        device_id
      );
      self.release(previous).await;
    }

    log::info!("Connecting to peripheral | device_id={device_id}");
    self.transport.connect(device_id).await?;
    let services = match self.transport.discover_services(device_id).await {
      Ok(services) => services,
      Err(err) => {
        log::warn!("Service discovery failed, closing link | device_id={device_id} | err={err}");
        if let Err(close_err) = self.transport.disconnect(device_id).await {
          log::debug!("Close after failed discovery also failed | device_id={device_id} | err={close_err}");
        }
        return Err(err);
      }
    };
    log::info!(
      "Connected | device_id={} | services={}",
      device_id,
      services.len()
    );

    let handle = ConnectionHandle {
      device_id: device_id.to_string(),
      services,
    };
    *active = Some(ActiveConnection {
      handle: handle.clone(),
      subscriptions: HashMap::new(),
    });
    Ok(handle)
  }

  /// Releases the current connection, if any. Close errors are logged,
  /// never returned.
  pub async fn disconnect(&self) {
    let previous = self.active.lock().await.take();
    match previous {
      Some(connection) => self.release(connection).await,
      None => log::debug!("Disconnect requested with no active connection"),
    }
  }

  /// Forgets the handle after the peripheral dropped the link by itself.
  /// Returns whether `device_id` was the active connection.
  pub async fn handle_remote_disconnect(&self, device_id: &str) -> bool {
    let mut active = self.active.lock().await;
    let is_active = active
      .as_ref()
      .is_some_and(|connection| connection.handle.device_id == device_id);
    if !is_active {
      return false;
    }
    if let Some(mut connection) = active.take() {
      connection.revoke_subscriptions();
    }
    log::info!("Peripheral disconnected | device_id={device_id}");
    true
  }

  pub async fn current(&self) -> Option<ConnectionHandle> {
    self
      .active
      .lock()
      .await
      .as_ref()
      .map(|connection| connection.handle.clone())
  }

  /// Identifier of the connected peripheral, or the precondition error.
  pub async fn require_device_id(&self) -> Result<String> {
    self
      .active
      .lock()
      .await
      .as_ref()
      .map(|connection| connection.handle.device_id.clone())
      .ok_or(Error::NotConnected)
  }

  /// Ties a notification task to the connection it was opened on. If that
  /// connection is already gone the task is aborted immediately.
  pub(crate) async fn track_subscription(&self, device_id: &str, id: Uuid, task: AbortHandle) -> bool {
    let mut active = self.active.lock().await;
    match active.as_mut() {
      Some(connection) if connection.handle.device_id == device_id => {
        connection.subscriptions.insert(id, task);
        true
      }
      _ => {
        task.abort();
        false
      }
    }
  }

  pub(crate) async fn untrack_subscription(&self, id: Uuid) {
    if let Some(connection) = self.active.lock().await.as_mut() {
      connection.subscriptions.remove(&id);
    }
  }

  async fn release(&self, mut connection: ActiveConnection) {
    connection.revoke_subscriptions();
    let device_id = connection.handle.device_id;
    match self.transport.disconnect(&device_id).await {
      Ok(()) => log::info!("Disconnected | device_id={device_id}"),
      Err(err) => log::warn!("Disconnect failed | device_id={device_id} | err={err}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{codec::parse_uuid, models::DeviceReference, simulated::SimulatedTransport, ErrorKind};

  fn sim_with_scale() -> Arc<SimulatedTransport> {
    let sim = Arc::new(SimulatedTransport::new());
    sim.add_characteristic("scale", parse_uuid("180f").unwrap(), parse_uuid("2a19").unwrap());
    sim.advertise_at(0, DeviceReference::new("thermo"));
    sim
  }

  #[tokio::test]
  async fn connect_discovers_services() {
    let sim = sim_with_scale();
    let manager = ConnectionManager::new(sim.clone());

    let handle = manager.connect("scale").await.unwrap();
    assert_eq!(handle.device_id(), "scale");
    assert_eq!(handle.services.len(), 1);
    assert_eq!(handle.services[0].characteristics[0].uuid, "00002a19-0000-1000-8000-00805f9b34fb");
    assert_eq!(manager.require_device_id().await.unwrap(), "scale");
    assert_eq!(sim.calls().discover_services, 1);
  }

  #[tokio::test]
  async fn reconnecting_closes_previous_link_first() {
    let sim = sim_with_scale();
    let manager = ConnectionManager::new(sim.clone());

    manager.connect("scale").await.unwrap();
    manager.connect("thermo").await.unwrap();

    assert!(!sim.is_connected("scale"));
    assert!(sim.is_connected("thermo"));
    assert_eq!(sim.calls().disconnect, 1);
    assert_eq!(manager.current().await.unwrap().device_id, "thermo");
  }

  #[tokio::test]
  async fn failed_connect_leaves_no_handle() {
    let sim = sim_with_scale();
    sim.fail_next_connect("gatt error 133");
    let manager = ConnectionManager::new(sim.clone());

    let err = manager.connect("scale").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.to_string(), "gatt error 133");
    assert!(manager.current().await.is_none());
    assert_eq!(sim.calls().connect, 1);
  }

  #[tokio::test]
  async fn disconnect_is_idempotent() {
    let sim = sim_with_scale();
    let manager = ConnectionManager::new(sim.clone());

    manager.disconnect().await;
    assert_eq!(sim.calls().disconnect, 0);

    manager.connect("scale").await.unwrap();
    manager.disconnect().await;
    manager.disconnect().await;
    assert_eq!(sim.calls().disconnect, 1);
    assert!(matches!(manager.require_device_id().await, Err(Error::NotConnected)));
  }

  #[tokio::test]
  async fn remote_disconnect_only_clears_matching_device() {
    let sim = sim_with_scale();
    let manager = ConnectionManager::new(sim.clone());
    manager.connect("scale").await.unwrap();

    assert!(!manager.handle_remote_disconnect("thermo").await);
    assert!(manager.current().await.is_some());
    assert!(manager.handle_remote_disconnect("scale").await);
    assert!(manager.current().await.is_none());
    assert_eq!(sim.calls().disconnect, 0);
  }
}
