//! Shared configuration and cancellation handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use experimentor_types::RelayConfig;

/// Cooperative stop signal shared between the relay, subscribers and whoever
/// owns the process (e.g. a Ctrl-C handler).  Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.  Loops notice it within one `poll_interval`.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying atomic, for handlers that want to store into it
    /// directly.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Everything a messaging component needs from its surroundings: the relay
/// configuration and the process-wide stop flag.
///
/// Cheap to clone; built once at startup and handed down explicitly.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub stop: StopFlag,
}

impl RelayContext {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            stop: StopFlag::new(),
        }
    }

    pub fn with_stop(config: RelayConfig, stop: StopFlag) -> Self {
        Self {
            config: Arc::new(config),
            stop,
        }
    }

    /// Same configuration and stop flag, but pointing at different ports.
    /// Used once a relay bound to port 0 reports where it actually listens.
    pub fn with_ports(&self, fanin_port: u16, fanout_port: u16) -> Self {
        let config = (*self.config).clone().with_ports(fanin_port, fanout_port);
        Self {
            config: Arc::new(config),
            stop: self.stop.clone(),
        }
    }

    pub fn fanin_url(&self) -> String {
        format!("ws://{}", self.config.fanin_addr())
    }

    pub fn fanout_url(&self) -> String {
        format!("ws://{}", self.config.fanout_addr())
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_clones_share_state() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
        assert!(flag.as_atomic().load(Ordering::SeqCst));
    }

    #[test]
    fn with_ports_keeps_stop_flag() {
        let ctx = RelayContext::default();
        let bound = ctx.with_ports(41000, 41001);
        assert_eq!(bound.fanin_url(), "ws://127.0.0.1:41000");
        assert_eq!(bound.fanout_url(), "ws://127.0.0.1:41001");
        // Original untouched.
        assert_eq!(ctx.config.fanin_port, 5557);

        ctx.stop.set();
        assert!(bound.stop.is_set());
    }
}
