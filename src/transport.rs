//! The seam between the workflow components and a concrete BLE stack.
//!
//! Payloads cross this boundary as base64 text, the envelope native BLE
//! bridges use; hex conversion for callers happens in [`crate::io`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{
  models::{AdapterState, DeviceReference, ScanOptions, ServiceInfo},
  Error, Result,
};

/// Advertisements in arrival order. An `Err` item aborts the scan.
pub type DiscoveryStream = BoxStream<'static, Result<DeviceReference>>;
/// Base64 values pushed by the peripheral. An `Err` item is logged and skipped.
pub type NotificationStream = BoxStream<'static, Result<String>>;
/// Identifiers of peripherals that dropped their connection.
pub type DisconnectionStream = BoxStream<'static, String>;

#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
  /// False when no BLE stack could be initialised on this host.
  fn is_available(&self) -> bool {
    true
  }

  async fn adapter_state(&self) -> Result<AdapterState>;

  async fn start_scan(&self, options: &ScanOptions) -> Result<DiscoveryStream>;

  async fn stop_scan(&self) -> Result<()>;

  async fn connect(&self, device_id: &str) -> Result<()>;

  async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>>;

  async fn disconnect(&self, device_id: &str) -> Result<()>;

  /// Current value, or `None` when the characteristic holds nothing.
  async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Option<String>>;

  /// Write that waits for the peripheral's acknowledgment.
  async fn write_with_response(
    &self,
    device_id: &str,
    service: Uuid,
    characteristic: Uuid,
    value: &str,
  ) -> Result<()>;

  async fn monitor(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

  async fn unmonitor(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<()>;

  async fn disconnections(&self) -> Result<DisconnectionStream>;
}

/// Stand-in used when the platform stack failed to initialise. Every
/// operation short-circuits with [`Error::Unavailable`].
#[derive(Debug, Clone, Default)]
pub struct UnavailableTransport;

#[async_trait]
impl BleTransport for UnavailableTransport {
  fn is_available(&self) -> bool {
    false
  }

  async fn adapter_state(&self) -> Result<AdapterState> {
    Ok(AdapterState::Unsupported)
  }

  async fn start_scan(&self, _options: &ScanOptions) -> Result<DiscoveryStream> {
    Err(Error::Unavailable)
  }

  async fn stop_scan(&self) -> Result<()> {
    Err(Error::Unavailable)
  }

  async fn connect(&self, _device_id: &str) -> Result<()> {
    Err(Error::Unavailable)
  }

  async fn discover_services(&self, _device_id: &str) -> Result<Vec<ServiceInfo>> {
    Err(Error::Unavailable)
  }

  async fn disconnect(&self, _device_id: &str) -> Result<()> {
    Err(Error::Unavailable)
  }

  async fn read(&self, _device_id: &str, _service: Uuid, _characteristic: Uuid) -> Result<Option<String>> {
    Err(Error::Unavailable)
  }

  async fn write_with_response(
    &self,
    _device_id: &str,
    _service: Uuid,
    _characteristic: Uuid,
    _value: &str,
  ) -> Result<()> {
    Err(Error::Unavailable)
  }

  async fn monitor(&self, _device_id: &str, _service: Uuid, _characteristic: Uuid) -> Result<NotificationStream> {
    Err(Error::Unavailable)
  }

  async fn unmonitor(&self, _device_id: &str, _service: Uuid, _characteristic: Uuid) -> Result<()> {
    Err(Error::Unavailable)
  }

  async fn disconnections(&self) -> Result<DisconnectionStream> {
    Err(Error::Unavailable)
  }
}
