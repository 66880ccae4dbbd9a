//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Soft deadline for processing one batch before a latency warning
    #[serde(rename = "latency-warning-ms", default = "default_latency_warning_ms")]
    pub latency_warning_ms: u64,

    /// How long the owning context waits for work per drain
    #[serde(rename = "poll-timeout-ms", default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Bound on a blocking cross-thread call; null waits indefinitely
    #[serde(rename = "call-timeout-ms", default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
}

fn default_latency_warning_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    1
}

fn default_call_timeout_ms() -> Option<u64> {
    Some(10_000)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        debug!("DispatchConfig::default: called");
        Self {
            latency_warning_ms: default_latency_warning_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn latency_warning(&self) -> Duration {
        Duration::from_millis(self.latency_warning_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}
