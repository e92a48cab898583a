//! In-process network simulator.
//!
//! Real networks drop and duplicate packets.  To exercise the reliability
//! mechanisms without a real network, the [`Simulator`] connects any number
//! of transports by [`Address`] and applies a fault model to every PDU it
//! carries:
//!
//! | Fault       | Description                                         |
//! |-------------|-----------------------------------------------------|
//! | Packet loss | Drop a PDU with probability `loss_rate`.            |
//! | Duplication | Deliver a PDU twice with probability `duplicate_rate`. |
//!
//! Random faults come from a seeded [`StdRng`] so a failing run can be
//! replayed.  Tests that need an exact fault use the scripted one-shot
//! faults instead ([`Simulator::drop_next_from`],
//! [`Simulator::duplicate_next_from`]).
//!
//! The most recent PDUs offered to the simulator are kept in a bounded
//! trace, whether or not they were delivered.
//!
//! ```text
//!   Transport A ──SimLink──▶ ┌───────────┐ ──wire task──▶ Transport B
//!                            │ Simulator │
//!   Transport A ◀──wire task─└───────────┘ ◀──SimLink──── Transport B
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::bits::BitBuffer;
use crate::network::{Address, Network};
use crate::packet::HEADER_BITS;
use crate::transport::Transport;

/// Default segment size: a header plus 64 payload bytes.
pub const DEFAULT_MAX_SEGMENT_BITS: usize = HEADER_BITS + 64 * 8;

/// Default number of frames the trace keeps.
pub const DEFAULT_TRACE_CAPACITY: usize = 4096;

/// Configuration for the fault-injection model.
///
/// Probabilities are clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given PDU is silently dropped.
    pub loss_rate: f64,
    /// Probability that a delivered PDU arrives twice.
    pub duplicate_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
    /// Largest PDU, in bits, reported to attached transports.
    pub max_segment_bits: usize,
    /// Frames kept in the trace; the oldest is evicted first.  Zero turns
    /// tracing off.
    pub trace_capacity: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
            max_segment_bits: DEFAULT_MAX_SEGMENT_BITS,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

/// One PDU in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: Address,
    pub dest: Address,
    pub pdu: BitBuffer,
}

struct Inner {
    hosts: HashMap<Address, mpsc::UnboundedSender<Frame>>,
    rng: StdRng,
    drop_next: HashMap<Address, u32>,
    duplicate_next: HashMap<Address, u32>,
    trace: VecDeque<Frame>,
    offered: u64,
}

/// A fault-injecting network shared by several transports.
pub struct Simulator {
    config: SimulatorConfig,
    inner: Mutex<Inner>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Arc<Self> {
        let inner = Inner {
            hosts: HashMap::new(),
            rng: StdRng::seed_from_u64(config.seed),
            drop_next: HashMap::new(),
            duplicate_next: HashMap::new(),
            trace: VecDeque::new(),
            offered: 0,
        };
        Arc::new(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// The [`Network`] a transport at `address` sends through.
    pub fn link(self: &Arc<Self>, address: Address) -> Arc<SimLink> {
        Arc::new(SimLink {
            sim: Arc::clone(self),
            address,
        })
    }

    /// Route PDUs addressed to `address` into `transport`.
    ///
    /// Spawns a wire task that feeds `Transport::received`.  The task holds
    /// only a weak reference and ends once the transport is dropped.
    /// Attaching a second transport at the same address replaces the first.
    pub fn attach(&self, address: Address, transport: &Arc<Transport>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        if self.inner().hosts.insert(address, tx).is_some() {
            log::warn!("[sim] host {address} re-attached");
        }
        let transport: Weak<Transport> = Arc::downgrade(transport);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                if let Err(e) = transport.received(frame.pdu, frame.source).await {
                    log::debug!("[sim] {address} refused PDU from {}: {e}", frame.source);
                }
            }
            log::debug!("[sim] wire task for {address} exiting");
        });
    }

    /// Drop the next `n` PDUs sent by `source`.
    pub fn drop_next_from(&self, source: Address, n: u32) {
        *self.inner().drop_next.entry(source).or_default() += n;
    }

    /// Deliver the next `n` PDUs sent by `source` twice.
    pub fn duplicate_next_from(&self, source: Address, n: u32) {
        *self.inner().duplicate_next.entry(source).or_default() += n;
    }

    /// The most recent PDUs offered, oldest first.
    pub fn trace(&self) -> Vec<Frame> {
        self.inner().trace.iter().cloned().collect()
    }

    /// Count of every PDU offered so far, including those evicted from the
    /// trace.
    pub fn frames_offered(&self) -> u64 {
        self.inner().offered
    }

    fn transmit(&self, frame: Frame) {
        let mut inner = self.inner();
        inner.offered += 1;
        let capacity = self.config.trace_capacity;
        if capacity > 0 {
            if inner.trace.len() == capacity {
                inner.trace.pop_front();
            }
            inner.trace.push_back(frame.clone());
        }

        if take_one(&mut inner.drop_next, frame.source) {
            log::debug!("[sim] scripted drop {} → {}", frame.source, frame.dest);
            return;
        }
        if roll(&mut inner.rng, self.config.loss_rate) {
            log::debug!("[sim] lost {} → {}", frame.source, frame.dest);
            return;
        }
        let copies = if take_one(&mut inner.duplicate_next, frame.source)
            || roll(&mut inner.rng, self.config.duplicate_rate)
        {
            log::debug!("[sim] duplicating {} → {}", frame.source, frame.dest);
            2
        } else {
            1
        };

        let Some(tx) = inner.hosts.get(&frame.dest) else {
            log::debug!("[sim] no host at {}; PDU lost", frame.dest);
            return;
        };
        for _ in 0..copies {
            if tx.send(frame.clone()).is_err() {
                log::debug!("[sim] host {} is gone; PDU lost", frame.dest);
                break;
            }
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_one(counters: &mut HashMap<Address, u32>, source: Address) -> bool {
    match counters.get_mut(&source) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

fn roll(rng: &mut StdRng, p: f64) -> bool {
    p > 0.0 && rng.random_bool(p.min(1.0))
}

/// One host's attachment to the [`Simulator`].
pub struct SimLink {
    sim: Arc<Simulator>,
    address: Address,
}

impl Network for SimLink {
    fn send(&self, pdu: BitBuffer, dest: Address) {
        self.sim.transmit(Frame {
            source: self.address,
            dest,
            pdu,
        });
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn max_segment_size(&self) -> usize {
        self.sim.config.max_segment_bits
    }
}
