use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
  codec::{base64_to_hex, hex_to_base64, parse_uuid, text_to_base64},
  connection::ConnectionManager,
  models::ServiceInfo,
  transport::BleTransport,
  Error, Result,
};

/// Reads, writes and notifications on the connected peripheral. Values are
/// hex text on this side and base64 on the transport side.
pub struct CharacteristicIo {
  transport: Arc<dyn BleTransport>,
  connection: Arc<ConnectionManager>,
}

impl CharacteristicIo {
  pub fn new(transport: Arc<dyn BleTransport>, connection: Arc<ConnectionManager>) -> Self {
    Self {
      transport,
      connection,
    }
  }

  async fn target(&self, service: &str, characteristic: &str) -> Result<(String, Uuid, Uuid)> {
    if !self.transport.is_available() {
      return Err(Error::Unavailable);
    }
    let device_id = self.connection.require_device_id().await?;
    Ok((device_id, parse_uuid(service)?, parse_uuid(characteristic)?))
  }

  /// Current value as lowercase hex, `None` when the characteristic is empty.
  pub async fn read(&self, service: &str, characteristic: &str) -> Result<Option<String>> {
    let (device_id, service, characteristic) = self.target(service, characteristic).await?;
    let Some(wire) = self.transport.read(&device_id, service, characteristic).await? else {
      return Ok(None);
    };
    let value = base64_to_hex(&wire)?;
    log::debug!("Read characteristic | device_id={device_id} | characteristic_uuid={characteristic} | value={value}");
    Ok((!value.is_empty()).then_some(value))
  }

  /// Writes `value` (hex) and waits for the peripheral to acknowledge it.
  pub async fn write(&self, service: &str, characteristic: &str, value: &str) -> Result<()> {
    let (device_id, service, characteristic) = self.target(service, characteristic).await?;
    let wire = hex_to_base64(value)?;
    self
      .transport
      .write_with_response(&device_id, service, characteristic, &wire)
      .await?;
    log::debug!("Wrote characteristic | device_id={device_id} | characteristic_uuid={characteristic} | value={value}");
    Ok(())
  }

  /// Writes UTF-8 text as-is, for peripherals driven by textual commands.
  pub async fn send_command(&self, service: &str, characteristic: &str, command: &str) -> Result<()> {
    let (device_id, service, characteristic) = self.target(service, characteristic).await?;
    self
      .transport
      .write_with_response(&device_id, service, characteristic, &text_to_base64(command))
      .await?;
    log::info!("Command sent | device_id={device_id} | command={command:?}");
    Ok(())
  }

  /// Invokes `on_change` with the hex value of every notification until the
  /// subscription is revoked or the connection ends. A failed notification
  /// is logged and skipped.
  pub async fn subscribe<F>(&self, service: &str, characteristic: &str, mut on_change: F) -> Result<Subscription>
  where
    F: FnMut(String) + Send + 'static,
  {
    let (device_id, service, characteristic) = self.target(service, characteristic).await?;
    let mut stream = self
      .transport
      .monitor(&device_id, service, characteristic)
      .await?;

    let id = Uuid::new_v4();
    let task = tokio::spawn(async move {
      while let Some(item) = stream.next().await {
        match item.and_then(|wire| base64_to_hex(&wire)) {
          Ok(value) if value.is_empty() => {}
          Ok(value) => on_change(value),
          Err(err) => log::error!("Error monitoring characteristic | characteristic_uuid={characteristic} | err={err}"),
        }
      }
      log::debug!("Notification stream ended | characteristic_uuid={characteristic}");
    });
    self
      .connection
      .track_subscription(&device_id, id, task.abort_handle())
      .await;
    log::info!("Subscribed | device_id={device_id} | characteristic_uuid={characteristic} | subscription_id={id}");

    Ok(Subscription {
      id,
      device_id,
      service,
      characteristic,
      task,
      transport: self.transport.clone(),
      connection: self.connection.clone(),
    })
  }

  /// GATT layout discovered when the current connection was made.
  pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
    self
      .connection
      .current()
      .await
      .map(|handle| handle.services)
      .ok_or(Error::NotConnected)
  }
}

/// A standing notification handler. Dropping it leaves the handler running
/// until the connection ends; call [`Subscription::unsubscribe`] to stop it
/// earlier.
pub struct Subscription {
  id: Uuid,
  device_id: String,
  service: Uuid,
  characteristic: Uuid,
  task: JoinHandle<()>,
  transport: Arc<dyn BleTransport>,
  connection: Arc<ConnectionManager>,
}

impl Subscription {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn device_id(&self) -> &str {
    &self.device_id
  }

  pub fn characteristic(&self) -> Uuid {
    self.characteristic
  }

  pub async fn unsubscribe(self) {
    self.task.abort();
    self.connection.untrack_subscription(self.id).await;
    if let Err(err) = self
      .transport
      .unmonitor(&self.device_id, self.service, self.characteristic)
      .await
    {
      log::warn!(
        "Failed to stop notifications | device_id={} | characteristic_uuid={} | err={}",
        self.device_id,
        self.characteristic,
        err
      );
    }
  }
}
