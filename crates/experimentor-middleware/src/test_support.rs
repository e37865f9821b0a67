//! Helpers shared by the socket-level tests.

use std::time::{Duration, Instant};

use experimentor_types::RelayConfig;

use crate::context::RelayContext;

/// Ephemeral ports and short timings so tests neither collide nor idle.
pub(crate) fn test_config() -> RelayConfig {
    RelayConfig {
        fanin_port: 0,
        fanout_port: 0,
        grace_period: Duration::from_millis(50),
        connect_warmup: Duration::from_secs(2),
        rebind_delay: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        ..RelayConfig::default()
    }
}

pub(crate) fn test_context() -> RelayContext {
    RelayContext::new(test_config())
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
