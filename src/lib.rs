//! Everline Core - one-way broadcast telemetry between followers and a leader
//!
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! Followers count level changes on a digital input and broadcast the running
//! total in a fixed 27-byte packet. A leader keeps the latest report from each
//! follower, drops followers that fall silent, and prints a periodic table.
//!
//! # Design Principles
//! - Fire-and-forget: no acks, no retransmission, the next packet supersedes
//! - Fixed packed wire layout, decoded without trusting the sender
//! - Transport behind a trait so UDP, radio and the simulator share one path

pub mod errors;
pub mod contracts;
pub mod clock;
pub mod input;
pub mod transport;
pub mod follower;
pub mod registry;
pub mod summary;
pub mod scheduler;
pub mod config;
pub mod telemetry;
pub mod sim;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::NodeConfig;
pub use contracts::{FollowerIdentity, FollowerState, LinkAddress, Packet, PacketKind, PACKET_SIZE};
pub use errors::{EverlineError, Result};
pub use follower::FollowerAgent;
pub use registry::{LeaderRegistry, ReceiveOutcome};
pub use scheduler::{LeaderScheduler, run_follower, run_leader};
pub use transport::{Transport, UdpBroadcastTransport, UdpTransportBuilder};

/// Largest datagram either transport accepts (radio frame payload limit)
pub const MAX_DATAGRAM_SIZE: usize = 250;

/// Sleep between main loop iterations, both roles
pub const LOOP_DELAY_MS: u64 = 10;

pub const DEFAULT_SEND_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_SUMMARY_INTERVAL_MS: u64 = 5_000;

/// Silence after which the leader forgets a follower
pub const DEFAULT_FOLLOWER_TIMEOUT_MS: u64 = 10_000;

/// Period of the leader's stale-entry scan
pub const EVICTION_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_MAX_FOLLOWERS: usize = 20;

pub const DEFAULT_FOLLOWER_IDENTITY: &str = "FOLLOWER_01";

/// UDP port used when the radio link is emulated over IP
pub const DEFAULT_PORT: u16 = 4210;
