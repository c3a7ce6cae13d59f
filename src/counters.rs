// MIT License - Copyright (c) 2026 Peter Wright

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Operational counters shared across components.
///
/// Each counter is write-owned by the component that maintains it; everyone
/// else reads through [`Counters::snapshot`]. Errors never cross task
/// boundaries as raised failures, they end up here (and in the log).
#[derive(Debug, Default)]
pub struct Counters {
    /// Outbound frames dropped because the link buffer was full.
    dropped_frames: AtomicU64,
    /// Inbound frames discarded as malformed.
    malformed_frames: AtomicU64,
    /// Control commands rejected for a bad session token.
    rejected_session: AtomicU64,
    /// Control commands rejected for a bad or missing user code.
    rejected_code: AtomicU64,
    /// Validated commands whose submission was dropped from the link buffer.
    command_dropped: AtomicU64,
    /// Consecutive link failures since the last successful handshake.
    link_failures: AtomicU64,
    /// Set once consecutive link failures pass the degraded threshold.
    link_degraded: AtomicBool,
}

/// Consecutive link failures beyond this flip the degraded flag.
pub const DEGRADED_THRESHOLD: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub dropped_frames: u64,
    pub malformed_frames: u64,
    pub rejected_session: u64,
    pub rejected_code: u64,
    pub command_dropped: u64,
    pub link_failures: u64,
    pub link_degraded: bool,
}

impl Counters {
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_session(&self) {
        self.rejected_session.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_code(&self) {
        self.rejected_code.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dropped(&self) {
        self.command_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one more consecutive link failure and return the new count.
    pub fn record_link_failure(&self) -> u64 {
        let count = self.link_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count > DEGRADED_THRESHOLD {
            self.link_degraded.store(true, Ordering::Relaxed);
        }
        count
    }

    /// Clear the consecutive failure count and the degraded flag. Called
    /// when a panel session completes its handshake.
    pub fn reset_link_failures(&self) {
        self.link_failures.store(0, Ordering::Relaxed);
        self.link_degraded.store(false, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.link_degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            rejected_session: self.rejected_session.load(Ordering::Relaxed),
            rejected_code: self.rejected_code.load(Ordering::Relaxed),
            command_dropped: self.command_dropped.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            link_degraded: self.link_degraded.load(Ordering::Relaxed),
        }
    }
}
