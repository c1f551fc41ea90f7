//! Summary sinks for registry snapshots

use std::fmt::Write as _;
use std::io;

use crate::contracts::FollowerState;
use crate::errors::Result;

const RULE: &str = "--------------------------------------------------";

/// Consumer of periodic registry snapshots
pub trait SummarySink: Send {
    fn render(&mut self, now_ms: u64, snapshot: &[FollowerState]) -> Result<()>;
}

/// Fixed-width follower status table
pub fn render_table(now_ms: u64, snapshot: &[FollowerState]) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = writeln!(out);
    let _ = writeln!(out, "===== FOLLOWER STATUS @ {} ms =====", now_ms);
    let _ = writeln!(out, "Connected followers: {}", snapshot.len());
    let _ = writeln!(out, "DEVICE ID       MAC ADDRESS           COUNT");
    let _ = writeln!(out, "{}", RULE);
    for follower in snapshot {
        let _ = writeln!(
            out,
            "{:<15} {}    {}",
            follower.identity, follower.link_address, follower.event_count
        );
    }
    if snapshot.is_empty() {
        let _ = writeln!(out, "No followers connected yet");
    }
    let _ = writeln!(out, "{}", RULE);
    out
}

/// Writes the status table to any writer (stdout in the leader binary)
pub struct ConsoleSummary<W: io::Write + Send> {
    writer: W,
}

impl<W: io::Write + Send> ConsoleSummary<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl ConsoleSummary<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: io::Write + Send> SummarySink for ConsoleSummary<W> {
    fn render(&mut self, now_ms: u64, snapshot: &[FollowerState]) -> Result<()> {
        self.writer.write_all(render_table(now_ms, snapshot).as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// One structured event per follower, for log shippers
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSummary;

impl SummarySink for TracingSummary {
    fn render(&mut self, now_ms: u64, snapshot: &[FollowerState]) -> Result<()> {
        tracing::info!(now_ms, connected = snapshot.len(), "follower summary");
        for follower in snapshot {
            tracing::info!(
                identity = %follower.identity,
                link_address = %follower.link_address,
                event_count = follower.event_count,
                age_ms = now_ms.saturating_sub(follower.last_seen),
                "follower status"
            );
        }
        Ok(())
    }
}
