//! [`RelayConfig`] – the single configuration record of the messaging layer.
//!
//! Built once at process start and passed by reference to every component
//! that needs it.  Durations use humantime strings in files (`"1s"`,
//! `"250ms"`).

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ExpError;

/// Ports, sentinels and timings of the relay and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the relay binds and clients connect to.
    pub host: String,

    /// Fan-in port: pushers send here.
    pub fanin_port: u16,

    /// Fan-out port: subscribers receive from here.
    pub fanout_port: u16,

    /// Sent on the empty topic, terminates the relay after rebroadcast.
    pub publisher_exit: String,

    /// Terminates the subscriber whose topic it arrives on.
    pub subscriber_exit: String,

    /// Delay between observing a stop condition and closing the socket, so
    /// in-flight messages can drain.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub grace_period: Duration,

    /// How long a client keeps retrying the initial connection while the
    /// relay comes up.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub connect_warmup: Duration,

    /// Pause between asking a stale relay to exit and retrying the bind.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub rebind_delay: Duration,

    /// How often blocked loops check the shared stop flag.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,

    /// Messages buffered between producer connections and the relay loop.
    pub fanin_capacity: usize,

    /// Messages buffered per subscriber connection.  A subscriber lagging by
    /// more than this loses the oldest messages.
    pub fanout_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            fanin_port: 5557,
            fanout_port: 5556,
            publisher_exit: "stop".to_string(),
            subscriber_exit: "stop".to_string(),
            grace_period: Duration::from_secs(1),
            connect_warmup: Duration::from_secs(1),
            rebind_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            fanin_capacity: 1024,
            fanout_capacity: 8192,
        }
    }
}

impl RelayConfig {
    /// Override both ports (builder-style).
    pub fn with_ports(mut self, fanin_port: u16, fanout_port: u16) -> Self {
        self.fanin_port = fanin_port;
        self.fanout_port = fanout_port;
        self
    }

    /// Override the grace period (builder-style).
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn fanin_addr(&self) -> String {
        format!("{}:{}", self.host, self.fanin_port)
    }

    pub fn fanout_addr(&self) -> String {
        format!("{}:{}", self.host, self.fanout_port)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ExpError> {
        if self.fanin_capacity == 0 || self.fanout_capacity == 0 {
            return Err(ExpError::InvalidConfig(
                "fanin_capacity and fanout_capacity must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ExpError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.fanin_port != 0 && self.fanin_port == self.fanout_port {
            return Err(ExpError::InvalidConfig(format!(
                "fan-in and fan-out share port {}",
                self.fanin_port
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.fanin_port, 5557);
        assert_eq!(cfg.fanout_port, 5556);
        assert_eq!(cfg.fanin_addr(), "127.0.0.1:5557");
        assert_eq!(cfg.grace_period, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            fanin_port = 6001
            grace_period = "250ms"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fanin_port, 6001);
        assert_eq!(cfg.fanout_port, 5556);
        assert_eq!(cfg.grace_period, Duration::from_millis(250));
        assert_eq!(cfg.publisher_exit, "stop");
    }

    #[test]
    fn toml_roundtrip_uses_humantime() {
        let cfg = RelayConfig::default().with_grace_period(Duration::from_millis(50));
        let raw = toml::to_string(&cfg).unwrap();
        assert!(raw.contains("grace_period = \"50ms\""));
        let back: RelayConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn validate_rejects_shared_port_and_zero_capacity() {
        let cfg = RelayConfig::default().with_ports(6000, 6000);
        assert!(matches!(cfg.validate(), Err(ExpError::InvalidConfig(_))));

        let cfg = RelayConfig {
            fanout_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());

        // Ephemeral ports are allowed to coincide.
        assert!(RelayConfig::default().with_ports(0, 0).validate().is_ok());
    }

    #[test]
    fn schema_describes_ports() {
        let schema = schemars::schema_for!(RelayConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("fanin_port"));
        assert!(json.contains("grace_period"));
    }
}
