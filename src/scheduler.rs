//! Cooperative main loops for both roles
//!
//! Each device runs one loop: sample the clock, do whatever is due, sleep
//! `LOOP_DELAY_MS`, repeat. On the leader the receive callback is the only
//! other entry point into the registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::contracts::FollowerIdentity;
use crate::errors::Result;
use crate::follower::FollowerAgent;
use crate::input::InputSource;
use crate::registry::LeaderRegistry;
use crate::summary::SummarySink;
use crate::transport::Transport;

/// Fixed-period timer re-armed from its own last fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period_ms: u64,
    last_fire_ms: u64,
}

impl Cadence {
    /// First fire at `period_ms` after clock origin.
    pub fn new(period_ms: u64) -> Self {
        Self::starting_at(period_ms, 0)
    }

    pub fn starting_at(period_ms: u64, start_ms: u64) -> Self {
        Self { period_ms, last_fire_ms: start_ms }
    }

    /// Returns `true` and re-arms when at least one period has passed.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_fire_ms) >= self.period_ms {
            self.last_fire_ms = now_ms;
            true
        } else {
            false
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn last_fire_ms(&self) -> u64 {
        self.last_fire_ms
    }
}

/// What one leader poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderTick {
    pub eviction_ran: bool,
    pub evicted: Vec<FollowerIdentity>,
    pub summarized: bool,
}

/// Independent eviction and summary timers sharing one clock.
#[derive(Debug, Clone)]
pub struct LeaderScheduler {
    eviction: Cadence,
    summary: Cadence,
}

impl LeaderScheduler {
    pub fn new(eviction_interval_ms: u64, summary_interval_ms: u64) -> Self {
        Self {
            eviction: Cadence::new(eviction_interval_ms),
            summary: Cadence::new(summary_interval_ms),
        }
    }

    /// Run whichever actions are due. Eviction goes first so a summary never
    /// lists a follower that is already past its timeout.
    pub fn poll<S: SummarySink + ?Sized>(
        &mut self,
        now_ms: u64,
        registry: &LeaderRegistry,
        sink: &mut S,
    ) -> LeaderTick {
        let mut tick = LeaderTick::default();

        if self.eviction.poll(now_ms) {
            tick.eviction_ran = true;
            tick.evicted = registry.evict_stale(now_ms);
        }

        if self.summary.poll(now_ms) {
            let snapshot = registry.snapshot();
            if let Err(e) = sink.render(now_ms, &snapshot) {
                tracing::warn!(error = %e, "summary sink failed");
            }
            tick.summarized = true;
        }

        tick
    }

    pub fn eviction(&self) -> &Cadence {
        &self.eviction
    }

    pub fn summary(&self) -> &Cadence {
        &self.summary
    }
}

impl Default for LeaderScheduler {
    fn default() -> Self {
        Self::new(crate::EVICTION_INTERVAL_MS, crate::DEFAULT_SUMMARY_INTERVAL_MS)
    }
}

/// Route every datagram the transport receives into the registry, stamped
/// with `clock`.
pub fn attach_receiver<T, C>(transport: &mut T, registry: Arc<LeaderRegistry>, clock: C) -> Result<()>
where
    T: Transport,
    C: Clock + 'static,
{
    transport.register_receive_callback(Box::new(move |sender, raw| {
        registry.on_packet_received(raw, sender, clock.now_ms());
    }))
}

/// Leader main loop. Returns when `shutdown` resolves.
pub async fn run_leader<C, S, F>(
    registry: Arc<LeaderRegistry>,
    clock: &C,
    sink: &mut S,
    mut scheduler: LeaderScheduler,
    loop_delay: Duration,
    shutdown: F,
) where
    C: Clock + ?Sized,
    S: SummarySink + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    tracing::info!(
        eviction_interval_ms = scheduler.eviction().period_ms(),
        summary_interval_ms = scheduler.summary().period_ms(),
        timeout_ms = registry.timeout_ms(),
        "leader ready to receive data"
    );

    loop {
        scheduler.poll(clock.now_ms(), &registry, sink);

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(loop_delay) => {}
        }
    }

    tracing::info!(followers = registry.len(), "leader loop stopped");
}

/// Follower main loop: sample input, tick sender. Returns when `shutdown`
/// resolves.
pub async fn run_follower<T, I, C, F>(
    agent: &mut FollowerAgent<T>,
    input: &mut I,
    clock: &C,
    poll_interval: Duration,
    shutdown: F,
) where
    T: Transport,
    I: InputSource + ?Sized,
    C: Clock + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut input_healthy = true;

    loop {
        match input.read_level() {
            Ok(level) => {
                if !input_healthy {
                    tracing::info!("input source recovered");
                    input_healthy = true;
                }
                agent.on_input_observed(level);
            }
            Err(e) => {
                if input_healthy {
                    tracing::warn!(error = %e, "cannot read input, keeping last level");
                    input_healthy = false;
                }
            }
        }

        agent.tick(clock.now_ms());

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    let stats = agent.stats();
    tracing::info!(
        event_count = agent.event_count(),
        sends_ok = stats.sends_ok,
        sends_failed = stats.sends_failed,
        "follower loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::contracts::{FollowerState, LinkAddress, Packet};
    use crate::input::SharedLevel;
    use crate::sim::SimulatedMedium;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct CollectingSink {
        renders: Arc<Mutex<Vec<(u64, Vec<FollowerState>)>>>,
    }

    impl SummarySink for CollectingSink {
        fn render(&mut self, now_ms: u64, snapshot: &[FollowerState]) -> Result<()> {
            self.renders.lock().push((now_ms, snapshot.to_vec()));
            Ok(())
        }
    }

    fn raw(name: &str, count: u32) -> Vec<u8> {
        Packet::data(FollowerIdentity::new(name).unwrap(), LinkAddress::default(), count)
            .encode()
            .to_vec()
    }

    #[test]
    fn test_cadence_rearms_from_own_fire() {
        let mut cadence = Cadence::new(1_000);
        assert!(!cadence.poll(0));
        assert!(!cadence.poll(999));
        assert!(cadence.poll(1_010));
        assert!(!cadence.poll(2_000));
        assert!(cadence.poll(2_010));
        assert_eq!(cadence.last_fire_ms(), 2_010);
    }

    #[test]
    fn test_timers_are_independent() {
        let registry = LeaderRegistry::new(10_000, 20);
        let mut sink = CollectingSink::default();
        let mut scheduler = LeaderScheduler::new(1_000, 5_000);

        let mut evictions = 0;
        let mut summaries = 0;
        for now in (0..=20_000).step_by(10) {
            let tick = scheduler.poll(now, &registry, &mut sink);
            evictions += usize::from(tick.eviction_ran);
            summaries += usize::from(tick.summarized);
        }
        assert_eq!(evictions, 20);
        assert_eq!(summaries, 4);
        let times: Vec<u64> = sink.renders.lock().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![5_000, 10_000, 15_000, 20_000]);
    }

    #[test]
    fn test_summary_after_eviction_in_same_poll() {
        let registry = LeaderRegistry::new(10_000, 20);
        registry.on_packet_received(&raw("GONE", 1), "a", 0);
        registry.on_packet_received(&raw("HERE", 1), "b", 9_000);

        let mut sink = CollectingSink::default();
        let mut scheduler = LeaderScheduler::new(5_000, 5_000);
        scheduler.poll(5_000, &registry, &mut sink);
        let tick = scheduler.poll(10_001, &registry, &mut sink);

        assert_eq!(tick.evicted, vec![FollowerIdentity::new("GONE").unwrap()]);
        let renders = sink.renders.lock();
        let (_, last) = renders.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].identity.to_string(), "HERE");
    }

    #[test]
    fn test_attach_receiver_stamps_with_clock() {
        let medium = SimulatedMedium::perfect();
        let mut leader = medium.endpoint(LinkAddress([2, 0, 0, 0, 0, 1]));
        let follower = medium.endpoint(LinkAddress([2, 0, 0, 0, 0, 2]));
        let registry = Arc::new(LeaderRegistry::new(10_000, 20));
        let clock = ManualClock::new(0);

        attach_receiver(&mut leader, Arc::clone(&registry), clock.clone()).unwrap();

        clock.set(1_234);
        follower.send(&LinkAddress::BROADCAST, &raw("F1", 7)).unwrap();
        medium.deliver_due(1_234);

        let state = registry.get(&FollowerIdentity::new("F1").unwrap()).unwrap();
        assert_eq!(state.event_count, 7);
        assert_eq!(state.last_seen, 1_234);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_loop_summaries_and_eviction() {
        let registry = Arc::new(LeaderRegistry::new(10_000, 20));
        let clock = MonotonicClock::new();
        registry.on_packet_received(&raw("F1", 3), "a", clock.now_ms());

        let mut sink = CollectingSink::default();
        run_leader(
            Arc::clone(&registry),
            &clock,
            &mut sink,
            LeaderScheduler::new(1_000, 5_000),
            Duration::from_millis(crate::LOOP_DELAY_MS),
            tokio::time::sleep(Duration::from_millis(15_500)),
        )
        .await;

        // silent since t=0: still listed at 10000, evicted by the 11000 scan
        let renders = sink.renders.lock();
        assert_eq!(renders.len(), 3);
        assert_eq!(renders[0].1.len(), 1);
        assert_eq!(renders[1].1.len(), 1);
        assert!(renders[2].1.is_empty());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_loop_counts_and_sends() {
        let medium = SimulatedMedium::perfect();
        let leader = medium.endpoint(LinkAddress([2, 0, 0, 0, 0, 1]));
        let transport = medium.endpoint(LinkAddress([2, 0, 0, 0, 0, 2]));
        let level = SharedLevel::new(false);
        let mut agent = FollowerAgent::new(
            FollowerIdentity::new("F1").unwrap(),
            LinkAddress([2, 0, 0, 0, 0, 2]),
            false,
            1_000,
            transport,
            LinkAddress::BROADCAST,
        );

        let toggler = level.clone();
        let toggle_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            toggler.toggle();
        });

        let clock = MonotonicClock::new();
        let mut input = level.clone();
        run_follower(
            &mut agent,
            &mut input,
            &clock,
            Duration::from_millis(crate::LOOP_DELAY_MS),
            tokio::time::sleep(Duration::from_millis(2_500)),
        )
        .await;
        toggle_task.await.unwrap();

        assert_eq!(agent.event_count(), 1);
        // sends at roughly 0, 1000, 2000
        assert_eq!(agent.stats().sends_ok, 3);
        assert_eq!(medium.stats().sent, 3);
        drop(leader);
    }
}
