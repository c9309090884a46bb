use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::{models::AdapterState, transport::BleTransport};

/// True only when the radio reports powered on. A failed query or an
/// indeterminate state counts as off.
pub async fn is_adapter_on(transport: &dyn BleTransport) -> bool {
  if !transport.is_available() {
    return false;
  }
  match transport.adapter_state().await {
    Ok(AdapterState::PoweredOn) => true,
    Ok(state) => {
      log::debug!("Adapter not ready | state={state:?}");
      false
    }
    Err(err) => {
      log::warn!("Error checking Bluetooth state | err={err}");
      false
    }
  }
}

/// Polls [`is_adapter_on`] until it holds or `timeout` elapses.
pub async fn wait_for_adapter(transport: &dyn BleTransport, poll_interval: Duration, timeout: Duration) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if is_adapter_on(transport).await {
      return true;
    }
    if !transport.is_available() || Instant::now() + poll_interval > deadline {
      return false;
    }
    sleep(poll_interval).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{simulated::SimulatedTransport, transport::UnavailableTransport};

  #[tokio::test]
  async fn unknown_and_failed_queries_count_as_off() {
    let sim = SimulatedTransport::new();
    assert!(is_adapter_on(&sim).await);

    sim.set_adapter_state(AdapterState::Unknown);
    assert!(!is_adapter_on(&sim).await);

    sim.fail_adapter_query();
    assert!(!is_adapter_on(&sim).await);

    assert!(!is_adapter_on(&UnavailableTransport).await);
  }

  #[tokio::test(start_paused = true)]
  async fn wait_gives_up_at_deadline() {
    let sim = SimulatedTransport::new();
    sim.set_adapter_state(AdapterState::PoweredOff);
    let started = Instant::now();
    let on = wait_for_adapter(&sim, Duration::from_millis(100), Duration::from_millis(1_000)).await;
    assert!(!on);
    assert!(started.elapsed() < Duration::from_millis(1_100));
    assert!(sim.calls().adapter_state >= 9);
  }

  #[tokio::test(start_paused = true)]
  async fn wait_returns_once_radio_comes_up() {
    let sim = std::sync::Arc::new(SimulatedTransport::new());
    sim.set_adapter_state(AdapterState::PoweredOff);
    let toggler = sim.clone();
    tokio::spawn(async move {
      sleep(Duration::from_millis(250)).await;
      toggler.set_adapter_state(AdapterState::PoweredOn);
    });
    assert!(wait_for_adapter(sim.as_ref(), Duration::from_millis(100), Duration::from_secs(5)).await);
  }
}
