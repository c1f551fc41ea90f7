//! Follower module - sensor-side counter and heartbeat sender
//!
//! The agent counts level changes on one input and broadcasts its full state
//! every send interval, whether or not anything changed. There is no ACK and
//! no retry: a lost or failed send is repaired by the next interval.

use crate::contracts::{FollowerIdentity, LinkAddress, Packet};
use crate::errors::Result;
use crate::transport::Transport;

/// Send state machine. `Sending` only lasts for the duration of a `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    Sending,
}

/// Everything the follower knows about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerAgentState {
    pub identity: FollowerIdentity,
    pub link_address: LinkAddress,
    pub event_count: u32,
    pub last_input_level: bool,
    /// `None` until the first tick, which then sends immediately
    pub last_send_time: Option<u64>,
}

impl FollowerAgentState {
    pub fn to_packet(&self) -> Packet {
        Packet::data(self.identity, self.link_address, self.event_count)
    }
}

/// Diagnostic counters; never put on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerStats {
    pub transitions: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
}

/// Result of one `tick`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Interval has not elapsed yet
    NotDue,
    /// Packet handed to the transport
    Sent { event_count: u32, bytes: usize },
    /// Transport refused the packet; the next interval resends
    SendFailed { event_count: u32 },
}

/// FollowerAgent - owns the counter and the periodic sender
pub struct FollowerAgent<T: Transport> {
    state: FollowerAgentState,
    phase: AgentPhase,
    send_interval_ms: u64,
    transport: T,
    destination: T::Address,
    stats: FollowerStats,
}

impl<T: Transport> FollowerAgent<T> {
    /// `initial_level` is the input level at start-up; it is not a transition.
    pub fn new(
        identity: FollowerIdentity,
        link_address: LinkAddress,
        initial_level: bool,
        send_interval_ms: u64,
        transport: T,
        destination: T::Address,
    ) -> Self {
        tracing::info!(
            identity = %identity,
            link_address = %link_address,
            initial_level,
            send_interval_ms,
            destination = %destination,
            "follower agent ready"
        );
        Self {
            state: FollowerAgentState {
                identity,
                link_address,
                event_count: 0,
                last_input_level: initial_level,
                last_send_time: None,
            },
            phase: AgentPhase::Idle,
            send_interval_ms,
            transport,
            destination,
            stats: FollowerStats::default(),
        }
    }

    /// Record a sampled level. Returns `true` when it differs from the last
    /// one, in which case the event count went up by exactly one.
    pub fn on_input_observed(&mut self, level: bool) -> bool {
        if level == self.state.last_input_level {
            return false;
        }
        self.state.event_count = self.state.event_count.wrapping_add(1);
        self.state.last_input_level = level;
        self.stats.transitions += 1;

        tracing::debug!(
            input = if level { "HIGH" } else { "LOW" },
            event_count = self.state.event_count,
            "input state changed"
        );
        true
    }

    /// Broadcast current state if the send interval has elapsed.
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        if !self.is_send_due(now_ms) {
            return TickOutcome::NotDue;
        }

        self.phase = AgentPhase::Sending;
        let event_count = self.state.event_count;
        let outcome = match self.send_current_state() {
            Ok(bytes) => {
                self.stats.sends_ok += 1;
                TickOutcome::Sent { event_count, bytes }
            }
            Err(e) => {
                self.stats.sends_failed += 1;
                tracing::warn!(error = %e, event_count, "error sending data packet");
                TickOutcome::SendFailed { event_count }
            }
        };
        self.state.last_send_time = Some(now_ms);
        self.phase = AgentPhase::Idle;

        outcome
    }

    pub fn is_send_due(&self, now_ms: u64) -> bool {
        match self.state.last_send_time {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.send_interval_ms,
        }
    }

    fn send_current_state(&self) -> Result<usize> {
        let bytes = self.state.to_packet().encode();
        self.transport.send(&self.destination, &bytes)
    }

    pub fn state(&self) -> &FollowerAgentState {
        &self.state
    }

    pub fn event_count(&self) -> u32 {
        self.state.event_count
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn stats(&self) -> FollowerStats {
        self.stats
    }

    pub fn send_interval_ms(&self) -> u64 {
        self.send_interval_ms
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::decode;
    use crate::errors::EverlineError;
    use crate::transport::ReceiveCallback;
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    /// Records sends, optionally failing them
    #[derive(Default)]
    struct RecordingTransport {
        sent: RefCell<Vec<(LinkAddress, Vec<u8>)>>,
        fail: Cell<bool>,
    }

    impl Transport for RecordingTransport {
        type Address = LinkAddress;

        fn send(&self, destination: &LinkAddress, bytes: &[u8]) -> Result<usize> {
            if self.fail.get() {
                return Err(EverlineError::TransportSendFailed("radio busy".to_string()));
            }
            self.sent.borrow_mut().push((*destination, bytes.to_vec()));
            Ok(bytes.len())
        }

        fn register_receive_callback(&mut self, _: ReceiveCallback<LinkAddress>) -> Result<()> {
            Ok(())
        }
    }

    fn agent(initial_level: bool) -> FollowerAgent<RecordingTransport> {
        FollowerAgent::new(
            FollowerIdentity::new("F1").unwrap(),
            LinkAddress([0x24, 0x6F, 0x28, 0, 0, 1]),
            initial_level,
            1_000,
            RecordingTransport::default(),
            LinkAddress::BROADCAST,
        )
    }

    #[test]
    fn test_counts_changes_not_calls() {
        let mut agent = agent(false);
        assert!(!agent.on_input_observed(false));
        assert!(agent.on_input_observed(true));
        assert!(!agent.on_input_observed(true));
        assert!(!agent.on_input_observed(true));
        assert!(agent.on_input_observed(false));
        assert_eq!(agent.event_count(), 2);
        assert_eq!(agent.stats().transitions, 2);
    }

    #[test]
    fn test_initial_level_is_not_a_transition() {
        let mut agent = agent(true);
        assert!(!agent.on_input_observed(true));
        assert_eq!(agent.event_count(), 0);
    }

    #[test]
    fn test_first_tick_sends_then_cadence() {
        let mut agent = agent(false);
        assert!(matches!(agent.tick(0), TickOutcome::Sent { event_count: 0, bytes: 27 }));
        assert_eq!(agent.tick(999), TickOutcome::NotDue);
        assert!(matches!(agent.tick(1_000), TickOutcome::Sent { .. }));
        assert_eq!(agent.tick(1_500), TickOutcome::NotDue);
        // late tick re-arms from when it actually fired
        assert!(matches!(agent.tick(2_300), TickOutcome::Sent { .. }));
        assert_eq!(agent.tick(3_000), TickOutcome::NotDue);
        assert!(matches!(agent.tick(3_300), TickOutcome::Sent { .. }));
        assert_eq!(agent.transport().sent.borrow().len(), 4);
    }

    #[test]
    fn test_heartbeat_without_activity() {
        let mut agent = agent(false);
        for t in [0, 1_000, 2_000] {
            agent.tick(t);
        }
        let sent = agent.transport().sent.borrow();
        assert_eq!(sent.len(), 3);
        for (dest, bytes) in sent.iter() {
            assert!(dest.is_broadcast());
            let packet = decode(bytes).unwrap();
            assert_eq!(packet.event_count, 0);
            assert_eq!(packet.identity.to_string(), "F1");
            assert_eq!(packet.link_address, LinkAddress([0x24, 0x6F, 0x28, 0, 0, 1]));
        }
    }

    #[test]
    fn test_send_failure_is_absorbed() {
        let mut agent = agent(false);
        agent.transport().fail.set(true);
        agent.on_input_observed(true);
        assert_eq!(agent.tick(0), TickOutcome::SendFailed { event_count: 1 });
        assert_eq!(agent.state().last_send_time, Some(0));
        assert_eq!(agent.event_count(), 1);
        assert_eq!(agent.phase(), AgentPhase::Idle);
        // no retry before the next interval
        assert_eq!(agent.tick(500), TickOutcome::NotDue);

        agent.transport().fail.set(false);
        assert!(matches!(agent.tick(1_000), TickOutcome::Sent { event_count: 1, .. }));
        assert_eq!(agent.stats().sends_failed, 1);
        assert_eq!(agent.stats().sends_ok, 1);
    }

    #[test]
    fn test_counter_wraps_at_field_width() {
        let mut agent = agent(false);
        agent.state.event_count = u32::MAX;
        agent.on_input_observed(true);
        assert_eq!(agent.event_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_count_equals_level_changes(initial in any::<bool>(), levels in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut agent = agent(initial);
            let mut previous = initial;
            let mut expected = 0u32;
            let mut last_count = 0u32;
            for level in levels {
                if level != previous {
                    expected += 1;
                    previous = level;
                }
                agent.on_input_observed(level);
                prop_assert!(agent.event_count() >= last_count);
                last_count = agent.event_count();
            }
            prop_assert_eq!(agent.event_count(), expected);
        }
    }
}
