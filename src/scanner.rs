use std::{
  collections::HashSet,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, MutexGuard, PoisonError,
  },
  time::Duration,
};

use futures::StreamExt;
use tokio::{sync::oneshot, time::sleep};

use crate::{
  adapter::is_adapter_on,
  models::{DeviceReference, ScanOptions},
  transport::BleTransport,
  Error, Result,
};

/// Timed discovery of nearby peripherals. At most one scan runs at a time.
pub struct DeviceScanner {
  transport: Arc<dyn BleTransport>,
  scanning: AtomicBool,
  cancel: StdMutex<Option<oneshot::Sender<()>>>,
}

/// Clears the scanning flag however the scan ends.
struct ScanningFlag<'a>(&'a AtomicBool);

impl Drop for ScanningFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl DeviceScanner {
  pub fn new(transport: Arc<dyn BleTransport>) -> Self {
    Self {
      transport,
      scanning: AtomicBool::new(false),
      cancel: StdMutex::new(None),
    }
  }

  pub fn is_scanning(&self) -> bool {
    self.scanning.load(Ordering::SeqCst)
  }

  /// Scans for `options.duration_ms`, calling `on_found` in arrival order.
  /// Unless `allow_duplicates` is set, each identifier is reported once per
  /// scan.
  pub async fn scan<F>(&self, options: &ScanOptions, mut on_found: F) -> Result<()>
  where
    F: FnMut(DeviceReference) + Send,
  {
    if !self.transport.is_available() {
      return Err(Error::Unavailable);
    }
    if self
      .scanning
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      log::warn!("Scan requested while another scan is running");
      return Err(Error::ScanInProgress);
    }
    let _flag = ScanningFlag(&self.scanning);

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *self.lock_cancel() = Some(cancel_tx);

    if !is_adapter_on(self.transport.as_ref()).await {
      self.lock_cancel().take();
      return Err(Error::AdapterOff);
    }
    if cancel_rx.try_recv().is_ok() {
      log::info!("Scan stopped before discovery started");
      return Ok(());
    }

    log::info!(
      "Starting BLE device scan | duration_ms={} | allow_duplicates={} | scan_mode={:?}",
      options.duration_ms,
      options.allow_duplicates,
      options.scan_mode
    );
    let result = self.run_scan(options, &mut on_found, cancel_rx).await;

    self.lock_cancel().take();
    if let Err(err) = self.transport.stop_scan().await {
      log::warn!("Failed to stop scan cleanly | err={err}");
    }
    result
  }

  async fn run_scan<F>(&self, options: &ScanOptions, on_found: &mut F, mut cancel_rx: oneshot::Receiver<()>) -> Result<()>
  where
    F: FnMut(DeviceReference) + Send,
  {
    let mut stream = self.transport.start_scan(options).await?;
    let deadline = sleep(Duration::from_millis(options.duration_ms));
    tokio::pin!(deadline);

    let mut seen: HashSet<String> = HashSet::new();
    let mut exhausted = false;
    let mut reported = 0usize;
    loop {
      tokio::select! {
        _ = &mut deadline => {
          log::info!("Scan timeout reached, stopping scan | devices_found={reported}");
          return Ok(());
        }
        _ = &mut cancel_rx => {
          log::info!("Scan stopped by caller | devices_found={reported}");
          return Ok(());
        }
        item = stream.next(), if !exhausted => match item {
          Some(Ok(device)) => {
            if !options.allow_duplicates && !seen.insert(device.id.clone()) {
              continue;
            }
            reported += 1;
            log::debug!("Found device | name={} | id={} | rssi={:?}", device.display_name(), device.id, device.rssi);
            on_found(device);
          }
          Some(Err(err)) => {
            log::warn!("Error while scanning for devices | err={err}");
            return Err(err);
          }
          None => exhausted = true,
        }
      }
    }
  }

  /// Ends the running scan early. Returns false when nothing was running.
  pub fn stop_scan(&self) -> bool {
    match self.lock_cancel().take() {
      Some(cancel) => cancel.send(()).is_ok(),
      None => false,
    }
  }

  /// Scans until a device advertising exactly `name` shows up, then stops.
  pub async fn find_device(&self, name: &str, options: &ScanOptions) -> Result<Option<DeviceReference>> {
    let mut found = None;
    self
      .scan(options, |device| {
        if found.is_none() && device.name.as_deref() == Some(name) {
          found = Some(device);
          self.stop_scan();
        }
      })
      .await?;
    Ok(found)
  }

  fn lock_cancel(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
    self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
