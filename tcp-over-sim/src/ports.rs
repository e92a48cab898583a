//! Pool of local ports available to active opens.
//!
//! `connect` draws the lowest free port; the port goes back into the pool
//! when the connection that drew it is torn down.  The pool carries its own
//! lock because `connect` allocates before it touches the connection table.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// A pool with every port of `range` free.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            free: Mutex::new(range.clone().collect()),
            range,
        }
    }

    /// Remove and return the lowest free port, or `None` when exhausted.
    pub fn allocate(&self) -> Option<u16> {
        self.lock().pop_first()
    }

    /// Return `port` to the pool.  Ports outside the pool's range are
    /// ignored.
    pub fn release(&self, port: u16) {
        if !self.range.contains(&port) {
            log::debug!("[ports] ignoring release of foreign port {port}");
            return;
        }
        if !self.lock().insert(port) {
            log::warn!("[ports] port {port} released twice");
        }
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
