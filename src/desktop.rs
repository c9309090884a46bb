use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use btleplug::{
  api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, Service, WriteType,
  },
  platform::{Adapter, Manager as BtleManager, Peripheral, PeripheralId},
};
use futures::{future, StreamExt};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
  codec::{base64_to_bytes, bytes_to_base64},
  models::*,
  transport::{BleTransport, DisconnectionStream, DiscoveryStream, NotificationStream},
  Error, Result,
};

/// [`BleTransport`] backed by the host stack through btleplug, bound to the
/// first adapter the manager reports.
#[derive(Clone)]
pub struct BtleplugTransport {
  inner: Arc<BtleplugState>,
}

struct BtleplugState {
  manager: BtleManager,
  adapter: Adapter,
  adapter_index: usize,
  peripherals: RwLock<HashMap<String, Peripheral>>,
}

pub async fn init() -> Result<BtleplugTransport> {
  let manager = BtleManager::new().await?;
  let mut adapters = manager.adapters().await?;
  if adapters.is_empty() {
    return Err(Error::Unavailable);
  }
  let adapter = adapters.remove(0);
  log::info!("Bluetooth adapter selected | adapter_index=0 | adapters_found={}", adapters.len() + 1);
  Ok(BtleplugTransport {
    inner: Arc::new(BtleplugState {
      manager,
      adapter,
      adapter_index: 0,
      peripherals: RwLock::new(HashMap::new()),
    }),
  })
}

#[async_trait]
impl BleTransport for BtleplugTransport {
  async fn adapter_state(&self) -> Result<AdapterState> {
    let present = self
      .inner
      .manager
      .adapters()
      .await?
      .into_iter()
      .nth(self.inner.adapter_index)
      .is_some();
    if !present {
      return Ok(AdapterState::Unsupported);
    }
    let state = match self.inner.adapter.adapter_state().await? {
      CentralState::PoweredOn => AdapterState::PoweredOn,
      CentralState::PoweredOff => AdapterState::PoweredOff,
      _ => AdapterState::Unknown,
    };
    Ok(state)
  }

  async fn start_scan(&self, options: &ScanOptions) -> Result<DiscoveryStream> {
    let events = self.inner.adapter.events().await?;
    log::debug!(
      "Starting btleplug scan | service_filter_count={} | scan_mode={:?}",
      options.services.len(),
      options.scan_mode
    );
    self
      .inner
      .adapter
      .start_scan(ScanFilter {
        services: options.services.clone(),
      })
      .await?;

    let state = self.inner.clone();
    let stream = events.filter_map(move |event| {
      let state = state.clone();
      async move {
        let id = match event {
          CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
          _ => return None,
        };
        match state.describe_discovered(&id).await {
          Ok(Some(device)) => Some(Ok(device)),
          Ok(None) => None,
          Err(err) => Some(Err(err)),
        }
      }
    });
    Ok(stream.boxed())
  }

  async fn stop_scan(&self) -> Result<()> {
    self.inner.adapter.stop_scan().await?;
    Ok(())
  }

  async fn connect(&self, device_id: &str) -> Result<()> {
    let peripheral = self.inner.get_or_try_load_peripheral(device_id).await?;
    if !peripheral.is_connected().await.unwrap_or(false) {
      peripheral.connect().await?;
    }
    Ok(())
  }

  async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>> {
    let peripheral = self.inner.get_or_try_load_peripheral(device_id).await?;
    peripheral.discover_services().await?;
    Ok(peripheral.services().into_iter().map(service_to_model).collect())
  }

  async fn disconnect(&self, device_id: &str) -> Result<()> {
    let peripheral = self.inner.get_or_try_load_peripheral(device_id).await?;
    if peripheral.is_connected().await.unwrap_or(false) {
      peripheral.disconnect().await?;
    }
    Ok(())
  }

  async fn read(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<Option<String>> {
    let (peripheral, characteristic) = self
      .inner
      .resolve_characteristic(device_id, service, characteristic)
      .await?;
    let bytes = peripheral.read(&characteristic).await?;
    if bytes.is_empty() {
      return Ok(None);
    }
    Ok(Some(bytes_to_base64(&bytes)))
  }

  async fn write_with_response(
    &self,
    device_id: &str,
    service: Uuid,
    characteristic: Uuid,
    value: &str,
  ) -> Result<()> {
    let (peripheral, characteristic) = self
      .inner
      .resolve_characteristic(device_id, service, characteristic)
      .await?;
    let payload = base64_to_bytes(value)?;
    peripheral
      .write(&characteristic, &payload, WriteType::WithResponse)
      .await?;
    Ok(())
  }

  async fn monitor(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
    let (peripheral, characteristic) = self
      .inner
      .resolve_characteristic(device_id, service, characteristic)
      .await?;
    peripheral.subscribe(&characteristic).await?;
    let target = characteristic.uuid;
    let stream = peripheral
      .notifications()
      .await?
      .filter(move |notification| future::ready(notification.uuid == target))
      .map(|notification| Ok(bytes_to_base64(&notification.value)));
    Ok(stream.boxed())
  }

  async fn unmonitor(&self, device_id: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
    let (peripheral, characteristic) = self
      .inner
      .resolve_characteristic(device_id, service, characteristic)
      .await?;
    peripheral.unsubscribe(&characteristic).await?;
    Ok(())
  }

  async fn disconnections(&self) -> Result<DisconnectionStream> {
    let events = self.inner.adapter.events().await?;
    let stream = events.filter_map(|event| {
      future::ready(match event {
        CentralEvent::DeviceDisconnected(id) => Some(peripheral_id_key(&id)),
        _ => None,
      })
    });
    Ok(stream.boxed())
  }
}

impl BtleplugState {
  async fn get_or_try_load_peripheral(&self, device_id: &str) -> Result<Peripheral> {
    if let Some(peripheral) = self.peripherals.read().await.get(device_id) {
      return Ok(peripheral.clone());
    }
    let peripherals = self.adapter.peripherals().await?;
    for peripheral in peripherals {
      if peripheral_key(&peripheral) == device_id {
        let mut cache = self.peripherals.write().await;
        cache.insert(device_id.to_string(), peripheral.clone());
        return Ok(peripheral);
      }
    }
    Err(Error::DeviceNotFound(device_id.to_string()))
  }

  async fn describe_discovered(&self, id: &PeripheralId) -> Result<Option<DeviceReference>> {
    let peripheral = self.adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
      return Ok(None);
    };
    let key = peripheral_key(&peripheral);
    self
      .peripherals
      .write()
      .await
      .insert(key.clone(), peripheral);
    Ok(Some(device_from_properties(key, &properties)))
  }

  async fn resolve_characteristic(
    &self,
    device_id: &str,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
  ) -> Result<(Peripheral, Characteristic)> {
    let peripheral = self.get_or_try_load_peripheral(device_id).await?;
    if peripheral.services().is_empty() {
      peripheral.discover_services().await?;
    }
    let service = peripheral
      .services()
      .into_iter()
      .find(|srv| srv.uuid == service_uuid)
      .ok_or_else(|| Error::ServiceNotFound {
        device_id: device_id.to_string(),
        service_uuid: service_uuid.to_string(),
      })?;
    let characteristic = service
      .characteristics
      .into_iter()
      .find(|chr| chr.uuid == characteristic_uuid)
      .ok_or_else(|| Error::CharacteristicNotFound {
        device_id: device_id.to_string(),
        characteristic_uuid: characteristic_uuid.to_string(),
      })?;
    Ok((peripheral, characteristic))
  }
}

fn device_from_properties(id: String, properties: &PeripheralProperties) -> DeviceReference {
  let service_uuids = if properties.services.is_empty() {
    None
  } else {
    Some(properties.services.iter().map(Uuid::to_string).collect())
  };
  DeviceReference {
    id,
    name: properties.local_name.clone(),
    rssi: properties.rssi,
    service_uuids,
    is_connectable: None,
  }
}

fn service_to_model(service: Service) -> ServiceInfo {
  ServiceInfo {
    uuid: service.uuid.to_string(),
    is_primary: service.primary,
    characteristics: service
      .characteristics
      .iter()
      .map(characteristic_to_model)
      .collect(),
  }
}

fn characteristic_to_model(characteristic: &Characteristic) -> CharacteristicInfo {
  let flags = characteristic.properties;
  CharacteristicInfo {
    uuid: characteristic.uuid.to_string(),
    properties: CharacteristicProperties {
      broadcast: flags.contains(CharPropFlags::BROADCAST),
      read: flags.contains(CharPropFlags::READ),
      write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
      write: flags.contains(CharPropFlags::WRITE),
      notify: flags.contains(CharPropFlags::NOTIFY),
      indicate: flags.contains(CharPropFlags::INDICATE),
      authenticated_signed_writes: flags.contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES),
    },
  }
}

fn peripheral_key(peripheral: &Peripheral) -> String {
  peripheral_id_key(&peripheral.id())
}

fn peripheral_id_key(id: &PeripheralId) -> String {
  id.to_string()
}
