//! Leader registry - last-known state per follower with liveness expiry
//!
//! Upsert is last-writer-wins: every valid packet replaces the entry for its
//! identity, with no sequence check. A stale duplicate that arrives after a
//! newer packet therefore rolls `event_count` back until the next heartbeat.
//!
//! The map sits behind a mutex because the transport's receive path runs
//! outside the leader loop. The lock is never held across user code.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::contracts::{decode, FollowerIdentity, FollowerState};
use crate::errors::EverlineError;

/// Why a received datagram did not touch the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Wrong length or unknown kind; foreign traffic on a shared channel
    Malformed(EverlineError),
    /// New identity while the registry is at capacity
    RegistryFull,
}

/// Result of `on_packet_received`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// First packet from this identity (or first since eviction)
    Inserted,
    /// Existing entry overwritten
    Replaced,
    Dropped(DropReason),
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

/// Running counters since the registry was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub accepted: u64,
    pub malformed: u64,
    pub rejected_full: u64,
    pub evicted: u64,
}

#[derive(Default)]
struct RegistryInner {
    followers: HashMap<FollowerIdentity, FollowerState>,
    stats: RegistryStats,
}

/// LeaderRegistry - identity -> last-known follower state
pub struct LeaderRegistry {
    inner: Mutex<RegistryInner>,
    timeout_ms: u64,
    max_followers: usize,
}

impl LeaderRegistry {
    pub fn new(timeout_ms: u64, max_followers: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            timeout_ms,
            max_followers,
        }
    }

    /// Decode and upsert one datagram. Malformed input is dropped, never
    /// raised.
    pub fn on_packet_received<A: fmt::Display>(
        &self,
        raw: &[u8],
        sender: A,
        now_ms: u64,
    ) -> ReceiveOutcome {
        let packet = match decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                self.inner.lock().stats.malformed += 1;
                tracing::debug!(sender = %sender, error = %e, "dropping malformed packet");
                return ReceiveOutcome::Dropped(DropReason::Malformed(e));
            }
        };

        let state = FollowerState::from_packet(&packet, now_ms);
        let outcome = {
            let mut inner = self.inner.lock();
            let known = inner.followers.contains_key(&state.identity);
            if !known && inner.followers.len() >= self.max_followers {
                inner.stats.rejected_full += 1;
                ReceiveOutcome::Dropped(DropReason::RegistryFull)
            } else {
                inner.followers.insert(state.identity, state);
                inner.stats.accepted += 1;
                if known {
                    ReceiveOutcome::Replaced
                } else {
                    ReceiveOutcome::Inserted
                }
            }
        };

        match &outcome {
            ReceiveOutcome::Inserted => tracing::info!(
                identity = %state.identity,
                link_address = %state.link_address,
                sender = %sender,
                event_count = state.event_count,
                "new follower joined"
            ),
            ReceiveOutcome::Replaced => tracing::trace!(
                identity = %state.identity,
                event_count = state.event_count,
                "follower updated"
            ),
            ReceiveOutcome::Dropped(_) => tracing::debug!(
                identity = %state.identity,
                max_followers = self.max_followers,
                "registry full, ignoring new follower"
            ),
        }

        outcome
    }

    /// Remove every entry last seen more than `timeout` ago. Returns the
    /// removed identities in ascending order.
    pub fn evict_stale(&self, now_ms: u64) -> Vec<FollowerIdentity> {
        let mut removed: Vec<FollowerIdentity> = {
            let mut inner = self.inner.lock();
            let stale: Vec<FollowerIdentity> = inner
                .followers
                .values()
                .filter(|state| state.is_stale(now_ms, self.timeout_ms))
                .map(|state| state.identity)
                .collect();
            for identity in &stale {
                inner.followers.remove(identity);
            }
            inner.stats.evicted += stale.len() as u64;
            stale
        };
        removed.sort_unstable();

        for identity in &removed {
            tracing::info!(identity = %identity, "removing inactive follower");
        }
        removed
    }

    /// Current entries ordered by identity. Read-only.
    pub fn snapshot(&self) -> Vec<FollowerState> {
        let mut entries: Vec<FollowerState> =
            self.inner.lock().followers.values().copied().collect();
        entries.sort_unstable_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    pub fn get(&self, identity: &FollowerIdentity) -> Option<FollowerState> {
        self.inner.lock().followers.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().followers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.lock().stats
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn max_followers(&self) -> usize {
        self.max_followers
    }
}

impl Default for LeaderRegistry {
    fn default() -> Self {
        Self::new(crate::DEFAULT_FOLLOWER_TIMEOUT_MS, crate::DEFAULT_MAX_FOLLOWERS)
    }
}
