use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// First Android API level with the split scan/connect permissions.
pub const SPLIT_BLUETOOTH_PERMISSIONS_API_LEVEL: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
  BluetoothScan,
  BluetoothConnect,
  /// Location access, which the platform requires before it allows BLE scans.
  Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
  Granted,
  Denied,
  NeverAskAgain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPolicy {
  /// Access is granted by installing or pairing (desktop, iOS).
  Implicit,
  /// Each capability must be requested at runtime.
  Runtime { api_level: u32 },
}

/// The host's permission prompt.
#[async_trait]
pub trait PermissionPlatform: Send + Sync {
  fn grant_policy(&self) -> GrantPolicy;

  async fn request_multiple(&self, permissions: &[Permission]) -> Result<HashMap<Permission, PermissionStatus>>;
}

/// Platform where nothing has to be asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImplicitGrants;

#[async_trait]
impl PermissionPlatform for ImplicitGrants {
  fn grant_policy(&self) -> GrantPolicy {
    GrantPolicy::Implicit
  }

  async fn request_multiple(&self, permissions: &[Permission]) -> Result<HashMap<Permission, PermissionStatus>> {
    Ok(
      permissions
        .iter()
        .map(|permission| (*permission, PermissionStatus::Granted))
        .collect(),
    )
  }
}

pub fn required_permissions(policy: GrantPolicy) -> Vec<Permission> {
  match policy {
    GrantPolicy::Implicit => Vec::new(),
    GrantPolicy::Runtime { api_level } if api_level >= SPLIT_BLUETOOTH_PERMISSIONS_API_LEVEL => vec![
      Permission::BluetoothScan,
      Permission::BluetoothConnect,
      Permission::Location,
    ],
    GrantPolicy::Runtime { .. } => vec![Permission::Location],
  }
}

/// Asks for everything BLE needs. True only when all of it was granted; a
/// failing prompt counts as a refusal.
pub async fn request_permissions(platform: &dyn PermissionPlatform) -> bool {
  let policy = platform.grant_policy();
  let required = required_permissions(policy);
  if required.is_empty() {
    return true;
  }
  match platform.request_multiple(&required).await {
    Ok(statuses) => {
      let granted = required
        .iter()
        .all(|permission| statuses.get(permission) == Some(&PermissionStatus::Granted));
      if !granted {
        log::warn!("BLE permissions refused | policy={policy:?} | statuses={statuses:?}");
      }
      granted
    }
    Err(err) => {
      log::error!("Error requesting BLE permissions | err={err}");
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::Error;

  struct ScriptedPlatform {
    api_level: u32,
    denied: Vec<Permission>,
    fail: bool,
    asked: Mutex<Vec<Permission>>,
  }

  impl ScriptedPlatform {
    fn new(api_level: u32) -> Self {
      Self {
        api_level,
        denied: Vec::new(),
        fail: false,
        asked: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl PermissionPlatform for ScriptedPlatform {
    fn grant_policy(&self) -> GrantPolicy {
      GrantPolicy::Runtime {
        api_level: self.api_level,
      }
    }

    async fn request_multiple(&self, permissions: &[Permission]) -> Result<HashMap<Permission, PermissionStatus>> {
      self.asked.lock().unwrap().extend_from_slice(permissions);
      if self.fail {
        return Err(Error::InvalidRequest("activity not attached".into()));
      }
      Ok(
        permissions
          .iter()
          .map(|permission| {
            let status = if self.denied.contains(permission) {
              PermissionStatus::Denied
            } else {
              PermissionStatus::Granted
            };
            (*permission, status)
          })
          .collect(),
      )
    }
  }

  #[tokio::test]
  async fn implicit_platforms_are_always_granted() {
    assert!(request_permissions(&ImplicitGrants).await);
  }

  #[tokio::test]
  async fn modern_android_needs_all_three() {
    let platform = ScriptedPlatform::new(33);
    assert!(request_permissions(&platform).await);
    assert_eq!(platform.asked.lock().unwrap().len(), 3);

    let mut refusing = ScriptedPlatform::new(33);
    refusing.denied.push(Permission::BluetoothConnect);
    assert!(!request_permissions(&refusing).await);
  }

  #[tokio::test]
  async fn legacy_android_only_asks_for_location() {
    let platform = ScriptedPlatform::new(29);
    assert!(request_permissions(&platform).await);
    assert_eq!(*platform.asked.lock().unwrap(), vec![Permission::Location]);
  }

  #[tokio::test]
  async fn prompt_failure_is_a_refusal() {
    let mut platform = ScriptedPlatform::new(31);
    platform.fail = true;
    assert!(!request_permissions(&platform).await);
  }
}
