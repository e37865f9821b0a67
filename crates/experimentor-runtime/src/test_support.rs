use std::time::{Duration, Instant};

use experimentor_middleware::RelayContext;
use experimentor_types::RelayConfig;

/// Ephemeral ports and short timings.
pub(crate) fn test_context() -> RelayContext {
    RelayContext::new(RelayConfig {
        fanin_port: 0,
        fanout_port: 0,
        grace_period: Duration::from_millis(50),
        connect_warmup: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        ..RelayConfig::default()
    })
}

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
