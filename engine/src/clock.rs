// Copyright 2024 Oxide Computer Company
//! Time sources
//!
//! Everything that ends up on disk or feeds the failure model uses wall-clock
//! seconds since the Unix epoch; pacing and load estimation use a monotonic
//! instant.
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

pub const SECS_PER_HOUR: u64 = 60 * 60;
pub const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

pub trait Clock: Send + Sync + Debug {
    /// Wall-clock time, in seconds since the Unix epoch
    fn now(&self) -> u64;

    /// Monotonic time
    fn instant(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Clock which only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicU64,
    base: Instant,
    elapsed_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        ManualClock {
            secs: AtomicU64::new(start_secs),
            base: Instant::now(),
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Moves both the wall clock and the monotonic clock forward
    pub fn advance(&self, d: Duration) {
        self.secs.fetch_add(d.as_secs(), Ordering::SeqCst);
        self.elapsed_ms
            .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the wall clock; the monotonic clock is unaffected
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }

    fn instant(&self) -> Instant {
        self.base
            + Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }
}
