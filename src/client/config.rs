// client/config.rs - Client Session Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wait for the registration status on each attempt
    pub registration_timeout_ms: u64,

    /// Wait for the status acknowledging a sent envelope
    pub ack_timeout_ms: u64,

    /// Envelopes buffered for the owner before new ones are refused
    pub inbound_capacity: usize,

    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: 5_000,
            ack_timeout_ms: 5_000,
            inbound_capacity: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.registration_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err("timeouts must be positive".into());
        }
        if self.inbound_capacity == 0 {
            return Err("inbound_capacity must be positive".into());
        }
        self.retry.validate()
    }
}
