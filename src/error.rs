use serde::{ser::Serializer, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide on user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
  /// No BLE stack or adapter on this host. Never retried.
  Unavailable,
  /// The radio is present but not powered on.
  AdapterOff,
  /// Failure reported by the underlying BLE stack.
  Transport,
  /// The operation was attempted in a state that does not allow it.
  Precondition,
  /// Malformed input: hex, base64, UUID or configuration.
  Invalid,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Btleplug(#[from] btleplug::Error),
  #[error(transparent)]
  UuidParse(#[from] uuid::Error),
  #[error(transparent)]
  Base64Decode(#[from] base64::DecodeError),
  #[error(transparent)]
  HexDecode(#[from] hex::FromHexError),
  #[error(transparent)]
  Config(#[from] serde_json::Error),
  #[error("BLE not available on this device")]
  Unavailable,
  #[error("Bluetooth is powered off. Please enable Bluetooth to scan for devices.")]
  AdapterOff,
  #[error("No device connected")]
  NotConnected,
  #[error("A scan is already in progress")]
  ScanInProgress,
  #[error("Device {0} not found")]
  DeviceNotFound(String),
  #[error("Service {service_uuid} not found for device {device_id}")]
  ServiceNotFound {
    device_id: String,
    service_uuid: String,
  },
  #[error("Characteristic {characteristic_uuid} not found for device {device_id}")]
  CharacteristicNotFound {
    device_id: String,
    characteristic_uuid: String,
  },
  #[error("{0}")]
  Transport(String),
  #[error("{0}")]
  InvalidRequest(String),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Unavailable => ErrorKind::Unavailable,
      Error::AdapterOff => ErrorKind::AdapterOff,
      Error::NotConnected | Error::ScanInProgress => ErrorKind::Precondition,
      Error::Io(_)
      | Error::UuidParse(_)
      | Error::Base64Decode(_)
      | Error::HexDecode(_)
      | Error::Config(_)
      | Error::InvalidRequest(_) => ErrorKind::Invalid,
      Error::Btleplug(_)
      | Error::DeviceNotFound(_)
      | Error::ServiceNotFound { .. }
      | Error::CharacteristicNotFound { .. }
      | Error::Transport(_) => ErrorKind::Transport,
    }
  }
}

impl Serialize for Error {
  fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(self.to_string().as_ref())
  }
}
