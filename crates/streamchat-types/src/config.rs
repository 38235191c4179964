//! Stream session tuning with sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, StreamchatError};

/// Default period between outbound messages, in milliseconds.
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 1_000;

/// Default upper bound on the draining phase, in milliseconds.
pub const DEFAULT_DRAIN_DEADLINE_MS: u64 = 5_000;

/// Default number of messages buffered ahead of the transport.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Timing and buffering parameters for one stream session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Period of the outbound loop: one message per tick.
    pub send_interval_ms: u64,

    /// Hard wall-clock bound on `Draining`. Not refreshed by activity.
    pub drain_deadline_ms: u64,

    /// Capacity of the channel between the loops and the transport.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            drain_deadline_ms: DEFAULT_DRAIN_DEADLINE_MS,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Outbound tick period.
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Draining deadline.
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    /// Validates all values.
    pub fn validate(&self) -> Result<()> {
        if self.send_interval_ms == 0 {
            return Err(StreamchatError::Config {
                reason: "send_interval_ms must be greater than 0".into(),
            });
        }

        if self.drain_deadline_ms == 0 {
            return Err(StreamchatError::Config {
                reason: "drain_deadline_ms must be greater than 0".into(),
            });
        }

        if self.outbound_capacity == 0 {
            return Err(StreamchatError::Config {
                reason: "outbound_capacity must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
