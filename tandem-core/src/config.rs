//! Session tuning. Every field has a default, so an empty table is a valid config.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Timers and limits for one session. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Data-channel keepalive interval (default 10000).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    /// Control-channel keepalive interval (default 30000).
    #[serde(default = "default_tcp_keepalive_interval")]
    pub tcp_keepalive_interval_ms: u64,
    /// Silence after which an established server counts as dead (default 20000).
    #[serde(default = "default_disconnect_after")]
    pub disconnect_after_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Bounded wait per outbound dequeue (default 200).
    #[serde(default = "default_queue_poll")]
    pub queue_poll_ms: u64,
    /// Bounded wait per inbound receive (default 100).
    #[serde(default = "default_recv_poll")]
    pub recv_poll_ms: u64,
    #[serde(default = "default_suspended_output_sleep")]
    pub suspended_output_sleep_ms: u64,
    #[serde(default = "default_suspended_input_sleep")]
    pub suspended_input_sleep_ms: u64,
    /// Pending pings older than this are dropped (default 10000).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Window during which repeated unhandled packets of one id warn once (default 30000).
    #[serde(default = "default_unhandled_cooldown")]
    pub unhandled_cooldown_ms: u64,
    /// Largest payload the client reassembles, sent with login. 0 means the default (65000).
    #[serde(default = "default_fragmentation_limit")]
    pub fragmentation_limit: u32,
    /// Ask the host whether to retry with the version check disabled on a mismatch.
    #[serde(default)]
    pub allow_protocol_override: bool,
    /// Append a JSON line per packet to this file.
    #[serde(default)]
    pub packet_log: Option<PathBuf>,
}

pub const DEFAULT_FRAGMENTATION_LIMIT: u32 = 65000;

fn default_keepalive_interval() -> u64 {
    10_000
}
fn default_tcp_keepalive_interval() -> u64 {
    30_000
}
fn default_disconnect_after() -> u64 {
    20_000
}
fn default_handshake_timeout() -> u64 {
    5_000
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_queue_poll() -> u64 {
    200
}
fn default_recv_poll() -> u64 {
    100
}
fn default_suspended_output_sleep() -> u64 {
    250
}
fn default_suspended_input_sleep() -> u64 {
    100
}
fn default_ping_timeout() -> u64 {
    10_000
}
fn default_unhandled_cooldown() -> u64 {
    30_000
}
fn default_fragmentation_limit() -> u32 {
    DEFAULT_FRAGMENTATION_LIMIT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
            tcp_keepalive_interval_ms: default_tcp_keepalive_interval(),
            disconnect_after_ms: default_disconnect_after(),
            handshake_timeout_ms: default_handshake_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            queue_poll_ms: default_queue_poll(),
            recv_poll_ms: default_recv_poll(),
            suspended_output_sleep_ms: default_suspended_output_sleep(),
            suspended_input_sleep_ms: default_suspended_input_sleep(),
            ping_timeout_ms: default_ping_timeout(),
            unhandled_cooldown_ms: default_unhandled_cooldown(),
            fragmentation_limit: default_fragmentation_limit(),
            allow_protocol_override: false,
            packet_log: None,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
    pub fn tcp_keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.tcp_keepalive_interval_ms)
    }
    pub fn disconnect_after(&self) -> Duration {
        Duration::from_millis(self.disconnect_after_ms)
    }
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }
    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }
    pub fn suspended_output_sleep(&self) -> Duration {
        Duration::from_millis(self.suspended_output_sleep_ms)
    }
    pub fn suspended_input_sleep(&self) -> Duration {
        Duration::from_millis(self.suspended_input_sleep_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn unhandled_cooldown(&self) -> Duration {
        Duration::from_millis(self.unhandled_cooldown_ms)
    }

    /// Limit advertised in the login packet.
    pub fn effective_fragmentation_limit(&self) -> u32 {
        if self.fragmentation_limit == 0 {
            DEFAULT_FRAGMENTATION_LIMIT
        } else {
            self.fragmentation_limit
        }
    }
}
