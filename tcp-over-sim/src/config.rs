//! Tunable parameters of a transport entity.
//!
//! Defaults match the classroom setup the protocol was written for: eight
//! ephemeral ports (8–15), a few seconds to open or close a connection and a
//! short per-segment retransmit timeout.

use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PORT;

/// How long `connect` waits for a connect reply, and `close` for a close reply.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the sender waits for an ACK before retransmitting.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Capacity of the inbound PDU queue between the network layer and the
/// dispatcher.
pub const INBOUND_CAPACITY: usize = 64;

/// Ports handed out to active opens.
pub const PORT_RANGE: RangeInclusive<u16> = 8..=15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub connection_timeout: Duration,
    /// Retransmit timeout.  Fixed: no backoff is applied.
    pub send_timeout: Duration,
    pub inbound_capacity: usize,
    pub ports: RangeInclusive<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_timeout: CONNECTION_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            inbound_capacity: INBOUND_CAPACITY,
            ports: PORT_RANGE,
        }
    }
}

impl TransportConfig {
    /// Check that the configuration can be used to build a transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ports.is_empty() {
            return Err(ConfigError::EmptyPortRange);
        }
        if *self.ports.end() > MAX_PORT {
            return Err(ConfigError::PortRangeTooWide(*self.ports.end()));
        }
        if self.connection_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("inbound queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("local port range is empty")]
    EmptyPortRange,
    #[error("port {0} does not fit in the header's port field (max {max})", max = MAX_PORT)]
    PortRangeTooWide(u16),
    #[error("timeouts must be non-zero")]
    ZeroTimeout,
}
