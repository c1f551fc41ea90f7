//! In-process broadcast medium with loss, duplication and reordering
//!
//! Stands in for the radio in tests and demos. Datagrams sit in flight until
//! the caller advances the medium with `deliver_due`, so every run is
//! deterministic for a given seed.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::contracts::LinkAddress;
use crate::errors::{EverlineError, Result};
use crate::transport::{ReceiveCallback, Transport};

/// Impairments applied to every datagram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    /// Chance a datagram never arrives
    pub loss_probability: f64,
    /// Chance a delivered datagram arrives twice
    pub duplicate_probability: f64,
    pub base_latency_ms: u64,
    /// Standard deviation of per-copy latency; non-zero values reorder
    pub jitter_ms: f64,
    pub seed: u64,
}

impl LinkConditions {
    pub fn perfect() -> Self {
        Self {
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            base_latency_ms: 0,
            jitter_ms: 0.0,
            seed: 0,
        }
    }

    pub fn with_loss(mut self, probability: f64) -> Self {
        self.loss_probability = probability;
        self
    }

    pub fn with_duplication(mut self, probability: f64) -> Self {
        self.duplicate_probability = probability;
        self
    }

    pub fn with_latency(mut self, base_ms: u64, jitter_ms: f64) -> Self {
        self.base_latency_ms = base_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::perfect()
    }
}

/// Counters for everything the medium did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediumStats {
    pub sent: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub delivered: u64,
}

struct EndpointSlot {
    address: LinkAddress,
    callback: Option<Arc<ReceiveCallback<LinkAddress>>>,
    fail_sends: bool,
}

struct InFlight {
    deliver_at: u64,
    seq: u64,
    from: usize,
    to: LinkAddress,
    bytes: Vec<u8>,
}

struct MediumInner {
    conditions: LinkConditions,
    rng: StdRng,
    jitter: Option<Normal<f64>>,
    endpoints: Vec<EndpointSlot>,
    in_flight: Vec<InFlight>,
    now_ms: u64,
    next_seq: u64,
    stats: MediumStats,
}

impl MediumInner {
    fn latency(&mut self) -> u64 {
        let jitter = match &self.jitter {
            Some(normal) => normal.sample(&mut self.rng),
            None => 0.0,
        };
        (self.conditions.base_latency_ms as f64 + jitter).max(0.0).round() as u64
    }

    fn enqueue(&mut self, from: usize, to: LinkAddress, bytes: &[u8]) {
        let deliver_at = self.now_ms + self.latency();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(InFlight { deliver_at, seq, from, to, bytes: bytes.to_vec() });
    }
}

/// Shared broadcast channel. Clones refer to the same medium.
#[derive(Clone)]
pub struct SimulatedMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl SimulatedMedium {
    pub fn new(conditions: LinkConditions) -> Result<Self> {
        for (name, p) in [
            ("loss_probability", conditions.loss_probability),
            ("duplicate_probability", conditions.duplicate_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EverlineError::Config(format!("{} must be within 0..=1, got {}", name, p)));
            }
        }
        let jitter = if conditions.jitter_ms > 0.0 {
            Some(
                Normal::new(0.0, conditions.jitter_ms)
                    .map_err(|e| EverlineError::Config(format!("jitter_ms: {}", e)))?,
            )
        } else if conditions.jitter_ms == 0.0 {
            None
        } else {
            return Err(EverlineError::Config(format!(
                "jitter_ms must be non-negative, got {}",
                conditions.jitter_ms
            )));
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(MediumInner {
                conditions,
                rng: StdRng::seed_from_u64(conditions.seed),
                jitter,
                endpoints: Vec::new(),
                in_flight: Vec::new(),
                now_ms: 0,
                next_seq: 0,
                stats: MediumStats::default(),
            })),
        })
    }

    /// No loss, no duplication, zero latency
    pub fn perfect() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MediumInner {
                conditions: LinkConditions::perfect(),
                rng: StdRng::seed_from_u64(0),
                jitter: None,
                endpoints: Vec::new(),
                in_flight: Vec::new(),
                now_ms: 0,
                next_seq: 0,
                stats: MediumStats::default(),
            })),
        }
    }

    /// Attach a node with the given link address
    pub fn endpoint(&self, address: LinkAddress) -> SimulatedEndpoint {
        let mut inner = self.inner.lock();
        inner.endpoints.push(EndpointSlot { address, callback: None, fail_sends: false });
        SimulatedEndpoint {
            address,
            index: inner.endpoints.len() - 1,
            medium: Arc::clone(&self.inner),
        }
    }

    /// Advance the medium clock to `now_ms` and hand every datagram due by
    /// then to its receivers, in arrival order. Returns the number of
    /// callback invocations.
    pub fn deliver_due(&self, now_ms: u64) -> usize {
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.now_ms = inner.now_ms.max(now_ms);

            let (mut due, pending): (Vec<InFlight>, Vec<InFlight>) =
                std::mem::take(&mut inner.in_flight)
                    .into_iter()
                    .partition(|d| d.deliver_at <= now_ms);
            inner.in_flight = pending;
            due.sort_by_key(|d| (d.deliver_at, d.seq));

            let mut deliveries = Vec::new();
            for datagram in due {
                let sender = inner.endpoints[datagram.from].address;
                for (index, slot) in inner.endpoints.iter().enumerate() {
                    let addressed = datagram.to.is_broadcast() || datagram.to == slot.address;
                    if index == datagram.from || !addressed {
                        continue;
                    }
                    if let Some(callback) = &slot.callback {
                        deliveries.push((Arc::clone(callback), sender, datagram.bytes.clone()));
                    }
                }
            }
            inner.stats.delivered += deliveries.len() as u64;
            deliveries
        };

        // callbacks run unlocked so they may send
        for (callback, sender, bytes) in &deliveries {
            callback(*sender, bytes.as_slice());
        }
        deliveries.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn stats(&self) -> MediumStats {
        self.inner.lock().stats
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.lock().now_ms
    }
}

/// One node's attachment to a `SimulatedMedium`
pub struct SimulatedEndpoint {
    address: LinkAddress,
    index: usize,
    medium: Arc<Mutex<MediumInner>>,
}

impl SimulatedEndpoint {
    pub fn address(&self) -> LinkAddress {
        self.address
    }

    /// Make every subsequent send fail at the transport, as a busy radio would
    pub fn set_fail_sends(&self, fail: bool) {
        self.medium.lock().endpoints[self.index].fail_sends = fail;
    }
}

impl Transport for SimulatedEndpoint {
    type Address = LinkAddress;

    fn send(&self, destination: &LinkAddress, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > crate::MAX_DATAGRAM_SIZE {
            return Err(EverlineError::TransportSendFailed(format!(
                "datagram of {} bytes exceeds {}",
                bytes.len(),
                crate::MAX_DATAGRAM_SIZE
            )));
        }

        let mut inner = self.medium.lock();
        if inner.endpoints[self.index].fail_sends {
            return Err(EverlineError::TransportSendFailed("simulated radio failure".to_string()));
        }
        inner.stats.sent += 1;

        let loss = inner.conditions.loss_probability;
        if inner.rng.gen_bool(loss) {
            inner.stats.lost += 1;
            return Ok(bytes.len());
        }

        inner.enqueue(self.index, *destination, bytes);
        let duplicate = inner.conditions.duplicate_probability;
        if inner.rng.gen_bool(duplicate) {
            inner.stats.duplicated += 1;
            inner.enqueue(self.index, *destination, bytes);
        }

        Ok(bytes.len())
    }

    fn register_receive_callback(&mut self, callback: ReceiveCallback<LinkAddress>) -> Result<()> {
        let mut inner = self.medium.lock();
        let slot = &mut inner.endpoints[self.index];
        if slot.callback.is_some() {
            return Err(EverlineError::TransportInitFailed(
                "receive callback already registered".to_string(),
            ));
        }
        slot.callback = Some(Arc::new(callback));
        Ok(())
    }
}
