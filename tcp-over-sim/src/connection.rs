//! Connection identity.
//!
//! A [`Connection`] is the 4-tuple every piece of per-connection state is
//! keyed by.  It is a plain value: applications hold on to it and pass it
//! back to [`crate::transport::Transport`] for every operation.
//!
//! A listening endpoint has no peer yet, so its remote fields are unbound.
//! When a connect request arrives the dispatcher replaces the listening
//! identity with a fully bound one.

use std::fmt;

use crate::network::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub local_port: u16,
    /// `None` while listening.
    pub remote_port: Option<u16>,
    /// `None` while listening.
    pub remote_addr: Option<Address>,
    pub local_addr: Address,
}

impl Connection {
    /// A fully bound identity.
    pub fn new(local_port: u16, remote_port: u16, remote_addr: Address, local_addr: Address) -> Self {
        Self {
            local_port,
            remote_port: Some(remote_port),
            remote_addr: Some(remote_addr),
            local_addr,
        }
    }

    /// The identity of an endpoint listening on `local_port`.
    pub fn listening(local_port: u16, local_addr: Address) -> Self {
        Self {
            local_port,
            remote_port: None,
            remote_addr: None,
            local_addr,
        }
    }

    /// The identity as seen from the other end.
    ///
    /// Returns `None` for a listening identity.
    pub fn mirrored(&self) -> Option<Self> {
        Some(Self::new(
            self.remote_port?,
            self.local_port,
            self.local_addr,
            self.remote_addr?,
        ))
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> ", self.local_addr, self.local_port)?;
        match (self.remote_addr, self.remote_port) {
            (Some(addr), Some(port)) => write!(f, "{addr}:{port}"),
            _ => f.write_str("*:*"),
        }
    }
}
