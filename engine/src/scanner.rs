// Copyright 2024 Oxide Computer Company
//! Background media scanner
//!
//! The scanner walks the main device one chunk per cycle, probing every
//! sector with a read.  Each probe feeds the [`HealthStore`]; the resulting
//! record is run through the failure predictor, and sectors which look bad
//! enough are handed to a [`RemapRequester`].
//!
//! Chunk size shrinks as foreground load grows.  Within a chunk the worker
//! yields every `yield_interval` sectors; a stop request is honored at the
//! next yield point.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::allocator::RemapReason;
use crate::clock::Clock;
use crate::config::ScannerConfig;
use crate::device::{submit_and_wait, BlockDevice, IoDirection};
use crate::health::{HealthStore, HealthThresholds};
use crate::predict::{predict, FailurePrediction, Severity};
use crate::SpareError;

/// Something that can move a sector to the spare device
#[async_trait]
pub trait RemapRequester: Send + Sync {
    fn is_remapped(&self, sector: u64) -> bool;

    /// Returns the spare sector the original now maps to
    async fn request_remap(
        &self,
        sector: u64,
        reason: RemapReason,
    ) -> Result<u64, SpareError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

/// Foreground I/O rate over the last full one-second window
#[derive(Debug)]
pub struct LoadEstimator {
    high_load_iops: u64,
    window: Mutex<LoadWindow>,
}

#[derive(Debug)]
struct LoadWindow {
    start: Instant,
    ops: u64,
    last_iops: u64,
}

impl LoadWindow {
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < Duration::from_secs(1) {
            return;
        }
        // A window which ended long ago says nothing about the present
        self.last_iops = if elapsed < Duration::from_secs(2) {
            self.ops * 1000 / elapsed.as_millis().max(1) as u64
        } else {
            0
        };
        self.start = now;
        self.ops = 0;
    }
}

impl LoadEstimator {
    pub fn new(high_load_iops: u64, now: Instant) -> Self {
        LoadEstimator {
            high_load_iops: high_load_iops.max(1),
            window: Mutex::new(LoadWindow {
                start: now,
                ops: 0,
                last_iops: 0,
            }),
        }
    }

    pub fn note_io(&self, now: Instant) {
        let mut w = self.window.lock().unwrap();
        w.roll(now);
        w.ops += 1;
    }

    /// 0-100
    pub fn load_percent(&self, now: Instant) -> u32 {
        let mut w = self.window.lock().unwrap();
        w.roll(now);
        // The current window already shows at least this rate
        let iops = w.last_iops.max(w.ops);
        (iops * 100 / self.high_load_iops).min(100) as u32
    }
}

/// Linear between `max` at no load and `min` at full load
pub fn adaptive_chunk(min: u64, max: u64, load_percent: u32) -> u64 {
    let load = u64::from(load_percent.min(100));
    max - (max - min) * load / 100
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub cursor: u64,
    pub passes: u64,
    pub cycles: u64,
    pub sectors_scanned: u64,
    pub coverage_percent: u32,
    pub hard_errors: u64,
    pub transient_errors: u64,
    pub skipped_remapped: u64,
    pub preventive_remaps: u64,
    pub error_remaps: u64,
    pub remap_failures: u64,
}

/// What one cycle did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub start: u64,
    pub scanned: u64,
    pub chunk: u64,
    pub wrapped: bool,
}

struct ScannerInner {
    main: Arc<dyn BlockDevice>,
    health: Arc<HealthStore>,
    remapper: Arc<dyn RemapRequester>,
    load: Arc<LoadEstimator>,
    clock: Arc<dyn Clock>,
    cfg: ScannerConfig,
    thresholds: HealthThresholds,
    state: Mutex<ScannerState>,
    rng: Mutex<SmallRng>,
    // Held for a whole cycle so that two cycles never share a cursor
    cycle_lock: tokio::sync::Mutex<()>,

    cursor: AtomicU64,
    passes: AtomicU64,
    cycles: AtomicU64,
    sectors_scanned: AtomicU64,
    coverage: AtomicU32,
    hard_errors: AtomicU64,
    transient_errors: AtomicU64,
    skipped_remapped: AtomicU64,
    preventive_remaps: AtomicU64,
    error_remaps: AtomicU64,
    remap_failures: AtomicU64,

    log: Logger,
}

pub struct Scanner {
    inner: Arc<ScannerInner>,
    control: watch::Sender<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main: Arc<dyn BlockDevice>,
        health: Arc<HealthStore>,
        remapper: Arc<dyn RemapRequester>,
        load: Arc<LoadEstimator>,
        clock: Arc<dyn Clock>,
        cfg: &ScannerConfig,
        start_cursor: u64,
        passes: u64,
        log: &Logger,
    ) -> Self {
        let rng = match cfg.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let cursor = if start_cursor < main.sector_count() {
            start_cursor
        } else {
            0
        };
        let thresholds = health.thresholds();
        let (control, _) = watch::channel(Control::Stop);

        let inner = ScannerInner {
            main,
            health,
            remapper,
            load,
            clock,
            cfg: cfg.clone(),
            thresholds,
            state: Mutex::new(ScannerState::Stopped),
            rng: Mutex::new(rng),
            cycle_lock: tokio::sync::Mutex::new(()),
            cursor: AtomicU64::new(cursor),
            passes: AtomicU64::new(passes),
            cycles: AtomicU64::new(0),
            sectors_scanned: AtomicU64::new(0),
            coverage: AtomicU32::new(0),
            hard_errors: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            skipped_remapped: AtomicU64::new(0),
            preventive_remaps: AtomicU64::new(0),
            error_remaps: AtomicU64::new(0),
            remap_failures: AtomicU64::new(0),
            log: log.new(o!("task" => "scanner")),
        };
        inner.update_coverage();

        Scanner {
            inner: Arc::new(inner),
            control,
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScannerState {
        *self.inner.state.lock().unwrap()
    }

    pub fn stats(&self) -> ScanStats {
        self.inner.stats()
    }

    /// Starts (or resumes) the worker.  A no-op if it is already running.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            ScannerState::Running | ScannerState::Starting => {}
            ScannerState::Paused | ScannerState::Pausing => {
                *state = ScannerState::Running;
                self.control.send_replace(Control::Run);
                info!(self.inner.log, "scanner resumed");
            }
            ScannerState::Stopping => {
                warn!(self.inner.log, "start requested while stopping");
            }
            ScannerState::Stopped => {
                *state = ScannerState::Starting;
                self.control.send_replace(Control::Run);
                let rx = self.control.subscribe();
                let inner = Arc::clone(&self.inner);
                *self.handle.lock().unwrap() =
                    Some(tokio::spawn(scan_worker(inner, rx)));
                info!(self.inner.log, "scanner starting");
            }
        }
    }

    /// Lets the current chunk finish, then parks the worker
    pub fn pause(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == ScannerState::Running || *state == ScannerState::Starting
        {
            *state = ScannerState::Pausing;
            self.control.send_replace(Control::Pause);
        }
    }

    /// Cancels pending work and waits up to `stop_timeout_ms` for the
    /// worker to reach a yield point.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == ScannerState::Stopped {
                return;
            }
            *state = ScannerState::Stopping;
        }
        self.control.send_replace(Control::Stop);

        let handle = self.handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            let limit = Duration::from_millis(self.inner.cfg.stop_timeout_ms);
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(self.inner.log, "scanner worker failed: {}", e)
                }
                Err(_) => {
                    warn!(
                        self.inner.log,
                        "scanner did not stop within {:?}, aborting", limit
                    );
                    handle.abort();
                }
            }
        }
        self.inner.set_state(ScannerState::Stopped);
        info!(self.inner.log, "scanner stopped");
    }

    /// Runs one cycle inline, outside the worker.  Refused while the worker
    /// is scanning.
    pub async fn run_cycle(&self) -> Result<CycleReport, SpareError> {
        match self.state() {
            ScannerState::Starting
            | ScannerState::Running
            | ScannerState::Pausing => return Err(SpareError::ScannerBusy),
            _ => {}
        }
        let rx = self.control.subscribe();
        self.inner.run_cycle(&rx, true).await
    }
}

async fn scan_worker(
    inner: Arc<ScannerInner>,
    mut rx: watch::Receiver<Control>,
) {
    inner.transition(ScannerState::Starting, ScannerState::Running);
    let interval = Duration::from_millis(inner.cfg.interval_ms);

    loop {
        let ctl = *rx.borrow_and_update();
        match ctl {
            Control::Stop => break,
            Control::Pause => {
                inner.transition(ScannerState::Pausing, ScannerState::Paused);
                info!(inner.log, "scanner paused");
                if rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            Control::Run => {}
        }

        match inner.run_cycle(&rx, false).await {
            Ok(report) => {
                debug!(inner.log, "scan cycle done"; "start" => report.start,
                    "scanned" => report.scanned, "chunk" => report.chunk);
            }
            Err(SpareError::Cancelled) => break,
            Err(e) => error!(inner.log, "scan cycle failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            r = rx.changed() => {
                if r.is_err() {
                    break;
                }
            }
        }
    }
}

impl ScannerInner {
    fn set_state(&self, s: ScannerState) {
        *self.state.lock().unwrap() = s;
    }

    fn transition(&self, from: ScannerState, to: ScannerState) {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
        }
    }

    fn update_coverage(&self) {
        let count = self.main.sector_count().max(1);
        let pct = if self.passes.load(Ordering::SeqCst) > 0 {
            100
        } else {
            (self.cursor.load(Ordering::SeqCst) * 100 / count) as u32
        };
        self.coverage.store(pct, Ordering::SeqCst);
    }

    fn stats(&self) -> ScanStats {
        ScanStats {
            cursor: self.cursor.load(Ordering::SeqCst),
            passes: self.passes.load(Ordering::SeqCst),
            cycles: self.cycles.load(Ordering::SeqCst),
            sectors_scanned: self.sectors_scanned.load(Ordering::SeqCst),
            coverage_percent: self.coverage.load(Ordering::SeqCst),
            hard_errors: self.hard_errors.load(Ordering::SeqCst),
            transient_errors: self.transient_errors.load(Ordering::SeqCst),
            skipped_remapped: self.skipped_remapped.load(Ordering::SeqCst),
            preventive_remaps: self.preventive_remaps.load(Ordering::SeqCst),
            error_remaps: self.error_remaps.load(Ordering::SeqCst),
            remap_failures: self.remap_failures.load(Ordering::SeqCst),
        }
    }

    /// Scans one chunk from the cursor.  With `inline` set, a `Stop` control
    /// value does not cancel the chunk.
    async fn run_cycle(
        &self,
        rx: &watch::Receiver<Control>,
        inline: bool,
    ) -> Result<CycleReport, SpareError> {
        let _cycle = self.cycle_lock.lock().await;
        let count = self.main.sector_count();
        if count == 0 {
            return Ok(CycleReport::default());
        }

        let load = self.load.load_percent(self.clock.instant());
        let chunk =
            adaptive_chunk(self.cfg.min_chunk, self.cfg.max_chunk, load);
        let start = self.cursor.load(Ordering::SeqCst).min(count - 1);
        let end = start.saturating_add(chunk).min(count);

        let mut report = CycleReport {
            start,
            chunk,
            ..Default::default()
        };

        for (i, sector) in (start..end).enumerate() {
            if i > 0 && i as u64 % self.cfg.yield_interval == 0 {
                tokio::task::yield_now().await;
                if !inline && *rx.borrow() == Control::Stop {
                    debug!(self.log, "scan cancelled at sector {}", sector);
                    return Err(SpareError::Cancelled);
                }
            }
            self.scan_sector(sector).await;
            self.cursor.store(sector + 1, Ordering::SeqCst);
            self.sectors_scanned.fetch_add(1, Ordering::SeqCst);
            report.scanned += 1;
        }

        if end >= count {
            self.cursor.store(0, Ordering::SeqCst);
            let passes = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
            report.wrapped = true;
            info!(self.log, "scan pass {} complete", passes);
        }
        self.update_coverage();
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    /// Reads `sector`, retrying with backoff.  Returns whether any read
    /// succeeded.
    async fn probe(&self, sector: u64) -> bool {
        let mut buf = vec![0u8; self.main.sector_size()];
        let mut backoff = Duration::from_millis(self.cfg.probe_backoff_ms);
        for attempt in 0..=self.cfg.probe_retries {
            match submit_and_wait(
                &*self.main,
                sector,
                &mut buf,
                IoDirection::Read,
            )
            .await
            {
                Ok(()) => return true,
                Err(e) => {
                    if attempt < self.cfg.probe_retries {
                        self.transient_errors.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            self.log,
                            "probe of {} failed (attempt {}): {}",
                            sector,
                            attempt + 1,
                            e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        false
    }

    async fn scan_sector(&self, sector: u64) {
        if self.remapper.is_remapped(sector) {
            self.skipped_remapped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let ok = self.probe(sector).await;
        let rec = self.health.record_scan(sector, ok);

        if !ok {
            self.hard_errors.fetch_add(1, Ordering::SeqCst);
            warn!(self.log, "hard read error at sector {}", sector);
            self.remap(sector, RemapReason::ReadError).await;
            return;
        }

        let prediction = predict(&rec, &self.thresholds, self.clock.now());
        if self.should_remap(&prediction) {
            info!(
                self.log,
                "preventive remap of {}: p={} ({})",
                sector,
                prediction.failure_probability,
                prediction.reason
            );
            self.remap(sector, RemapReason::Preventive).await;
        }
    }

    fn should_remap(&self, p: &FailurePrediction) -> bool {
        if p.failure_probability < self.cfg.proactive_threshold {
            return false;
        }
        match p.severity {
            Severity::Critical => true,
            Severity::High | Severity::Medium => self
                .rng
                .lock()
                .unwrap()
                .gen_bool(self.cfg.medium_remap_probability),
            Severity::Low => false,
        }
    }

    async fn remap(&self, sector: u64, reason: RemapReason) {
        match self.remapper.request_remap(sector, reason).await {
            Ok(spare) => {
                let counter = if reason == RemapReason::Preventive {
                    &self.preventive_remaps
                } else {
                    &self.error_remaps
                };
                counter.fetch_add(1, Ordering::SeqCst);
                debug!(self.log, "sector {} now at spare {}", sector, spare);
            }
            Err(SpareError::AlreadyRemapped(_)) => {}
            Err(e) => {
                self.remap_failures.fetch_add(1, Ordering::SeqCst);
                if e.is_operator_visible() {
                    error!(self.log, "cannot remap sector {}: {}", sector, e);
                } else {
                    warn!(self.log, "remap of sector {} failed: {}", sector, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::HealthConfig;
    use crate::device::InMemoryDevice;
    use sparemap_common::csl;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingRemapper {
        remaps: Mutex<BTreeMap<u64, RemapReason>>,
        fail: bool,
    }

    #[async_trait]
    impl RemapRequester for RecordingRemapper {
        fn is_remapped(&self, sector: u64) -> bool {
            self.remaps.lock().unwrap().contains_key(&sector)
        }

        async fn request_remap(
            &self,
            sector: u64,
            reason: RemapReason,
        ) -> Result<u64, SpareError> {
            if self.fail {
                return Err(SpareError::SpareExhausted);
            }
            let mut remaps = self.remaps.lock().unwrap();
            if remaps.insert(sector, reason).is_some() {
                return Err(SpareError::AlreadyRemapped(sector));
            }
            Ok(1000 + sector)
        }
    }

    struct Harness {
        dev: Arc<InMemoryDevice>,
        health: Arc<HealthStore>,
        remapper: Arc<RecordingRemapper>,
        load: Arc<LoadEstimator>,
        clock: Arc<ManualClock>,
        scanner: Scanner,
    }

    fn cfg() -> ScannerConfig {
        ScannerConfig {
            min_chunk: 4,
            max_chunk: 32,
            yield_interval: 4,
            interval_ms: 1,
            high_load_iops: 100,
            probe_retries: 2,
            probe_backoff_ms: 1,
            rng_seed: Some(42),
            ..Default::default()
        }
    }

    fn harness_with(
        sectors: u64,
        cfg: ScannerConfig,
        remapper: RecordingRemapper,
    ) -> Harness {
        let dev = Arc::new(InMemoryDevice::new(512, sectors));
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let health = Arc::new(HealthStore::new(
            sectors,
            &HealthConfig::default(),
            clock.clone(),
            &csl(),
        ));
        let remapper = Arc::new(remapper);
        let load = Arc::new(LoadEstimator::new(
            cfg.high_load_iops,
            clock.instant(),
        ));
        let scanner = Scanner::new(
            dev.clone(),
            health.clone(),
            remapper.clone(),
            load.clone(),
            clock.clone(),
            &cfg,
            0,
            0,
            &csl(),
        );
        Harness {
            dev,
            health,
            remapper,
            load,
            clock,
            scanner,
        }
    }

    fn harness(sectors: u64) -> Harness {
        harness_with(sectors, cfg(), RecordingRemapper::default())
    }

    #[test]
    fn chunk_shrinks_with_load() {
        assert_eq!(adaptive_chunk(16, 1024, 0), 1024);
        assert_eq!(adaptive_chunk(16, 1024, 100), 16);
        assert_eq!(adaptive_chunk(16, 1024, 50), 520);
        assert_eq!(adaptive_chunk(16, 1024, 250), 16);
        assert_eq!(adaptive_chunk(8, 8, 30), 8);
    }

    #[test]
    fn load_estimate_tracks_rate() {
        let t0 = Instant::now();
        let est = LoadEstimator::new(100, t0);
        assert_eq!(est.load_percent(t0), 0);
        for i in 0..50 {
            est.note_io(t0 + Duration::from_millis(i * 10));
        }
        // Half the high-load rate, seen in the window so far
        assert_eq!(est.load_percent(t0 + Duration::from_millis(600)), 50);
        // The full window closes at 50 IOPS
        assert_eq!(est.load_percent(t0 + Duration::from_millis(1000)), 50);
        // After a long quiet spell the load falls back to zero
        assert_eq!(est.load_percent(t0 + Duration::from_secs(10)), 0);

        for _ in 0..500 {
            est.note_io(t0 + Duration::from_secs(10));
        }
        assert_eq!(est.load_percent(t0 + Duration::from_secs(10)), 100);
    }

    #[tokio::test]
    async fn cycles_walk_and_wrap() {
        let h = harness(80);
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(
            r,
            CycleReport {
                start: 0,
                scanned: 32,
                chunk: 32,
                wrapped: false
            }
        );
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(r.start, 32);
        assert_eq!(h.scanner.stats().coverage_percent, 80);
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(r.scanned, 16);
        assert!(r.wrapped);

        let s = h.scanner.stats();
        assert_eq!(s.cursor, 0);
        assert_eq!(s.passes, 1);
        assert_eq!(s.cycles, 3);
        assert_eq!(s.sectors_scanned, 80);
        assert_eq!(s.coverage_percent, 100);
        assert_eq!(h.health.len(), 80);
        assert_eq!(h.health.get(79).unwrap().scan_count, 1);
        assert!(h.remapper.remaps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_device_gets_small_chunks() {
        let h = harness(80);
        for _ in 0..200 {
            h.load.note_io(h.clock.instant());
        }
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(r.chunk, 4);
        assert_eq!(r.scanned, 4);
    }

    #[tokio::test]
    async fn hard_error_remaps_immediately() {
        let h = harness(40);
        h.dev.fail_reads(7);
        h.scanner.run_cycle().await.unwrap();

        let remaps = h.remapper.remaps.lock().unwrap().clone();
        assert_eq!(remaps.get(&7), Some(&RemapReason::ReadError));
        let s = h.scanner.stats();
        assert_eq!(s.hard_errors, 1);
        assert_eq!(s.error_remaps, 1);
        assert_eq!(s.transient_errors, 2);
        let rec = h.health.get(7).unwrap();
        assert_eq!(rec.read_errors, 1);
    }

    #[tokio::test]
    async fn transient_error_is_retried() {
        let h = harness(40);
        h.dev.fail_reads_transiently(3, 2);
        h.scanner.run_cycle().await.unwrap();
        assert!(h.remapper.remaps.lock().unwrap().is_empty());
        assert_eq!(h.health.get(3).unwrap().read_errors, 0);
        assert_eq!(h.scanner.stats().transient_errors, 2);
    }

    #[tokio::test]
    async fn remapped_sectors_are_skipped() {
        let h = harness(40);
        h.remapper
            .remaps
            .lock()
            .unwrap()
            .insert(5, RemapReason::Manual);
        h.dev.fail_reads(5);
        h.scanner.run_cycle().await.unwrap();
        assert_eq!(h.scanner.stats().skipped_remapped, 1);
        assert_eq!(h.scanner.stats().hard_errors, 0);
        assert!(h.health.get(5).is_none());
    }

    #[tokio::test]
    async fn degraded_sector_is_remapped_preventively() {
        let h = harness(40);
        // A sector that has been failing for a long time
        for _ in 0..20 {
            h.health.update(9, false, true);
        }
        h.clock.advance(Duration::from_secs(30 * 24 * 3600));
        for _ in 0..30 {
            h.health.update(9, true, true);
        }
        h.scanner.run_cycle().await.unwrap();
        let remaps = h.remapper.remaps.lock().unwrap().clone();
        assert_eq!(remaps.get(&9), Some(&RemapReason::Preventive));
        assert_eq!(remaps.len(), 1);
        assert_eq!(h.scanner.stats().preventive_remaps, 1);
    }

    #[tokio::test]
    async fn medium_gate_respects_probability() {
        let mut c = cfg();
        c.medium_remap_probability = 0.0;
        let h = harness_with(40, c, RecordingRemapper::default());
        let th = h.health.thresholds();
        let mut p = predict(
            &h.health.get_or_create(1),
            &th,
            h.clock.now(),
        );
        p.failure_probability = 60;
        p.severity = Severity::High;
        assert!(!h.scanner.inner.should_remap(&p));
        p.failure_probability = 90;
        p.severity = Severity::Critical;
        assert!(h.scanner.inner.should_remap(&p));
        p.failure_probability = 10;
        assert!(!h.scanner.inner.should_remap(&p));

        let mut c = cfg();
        c.medium_remap_probability = 1.0;
        let h = harness_with(40, c, RecordingRemapper::default());
        p.failure_probability = 30;
        p.severity = Severity::Medium;
        assert!(h.scanner.inner.should_remap(&p));
    }

    #[tokio::test]
    async fn remap_failure_does_not_abort_cycle() {
        let h = harness_with(
            40,
            cfg(),
            RecordingRemapper {
                fail: true,
                ..Default::default()
            },
        );
        h.dev.fail_reads(2);
        h.dev.fail_reads(3);
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(r.scanned, 32);
        assert_eq!(h.scanner.stats().remap_failures, 2);
    }

    #[tokio::test]
    async fn resumes_from_saved_cursor() {
        let dev = Arc::new(InMemoryDevice::new(512, 100));
        let clock = Arc::new(ManualClock::new(0));
        let health = Arc::new(HealthStore::new(
            100,
            &HealthConfig::default(),
            clock.clone(),
            &csl(),
        ));
        let scanner = Scanner::new(
            dev,
            health,
            Arc::new(RecordingRemapper::default()),
            Arc::new(LoadEstimator::new(100, clock.instant())),
            clock,
            &cfg(),
            90,
            3,
            &csl(),
        );
        let s = scanner.stats();
        assert_eq!(s.cursor, 90);
        assert_eq!(s.coverage_percent, 100);
        let r = scanner.run_cycle().await.unwrap();
        assert_eq!(r.start, 90);
        assert_eq!(r.scanned, 10);
        assert_eq!(scanner.stats().passes, 4);
    }

    #[tokio::test]
    async fn worker_lifecycle() {
        let h = harness(64);
        assert_eq!(h.scanner.state(), ScannerState::Stopped);
        h.scanner.start();
        // Starting twice is harmless
        h.scanner.start();

        let deadline = Instant::now() + Duration::from_secs(10);
        while h.scanner.stats().passes < 2 {
            assert!(Instant::now() < deadline, "scanner made no progress");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.scanner.state(), ScannerState::Running);

        h.scanner.pause();
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.scanner.state() != ScannerState::Paused {
            assert!(Instant::now() < deadline, "scanner did not pause");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cycles = h.scanner.stats().cycles;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.scanner.stats().cycles, cycles);

        h.scanner.start();
        assert_eq!(h.scanner.state(), ScannerState::Running);
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.scanner.stats().cycles == cycles {
            assert!(Instant::now() < deadline, "scanner did not resume");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.scanner.stop().await;
        assert_eq!(h.scanner.state(), ScannerState::Stopped);
        let cycles = h.scanner.stats().cycles;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.scanner.stats().cycles, cycles);

        // And it can be started again
        h.scanner.start();
        h.scanner.stop().await;
        assert_eq!(h.scanner.state(), ScannerState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_cycles_do_not_overlap() {
        let h = harness(80);
        let (a, b) = tokio::join!(h.scanner.run_cycle(), h.scanner.run_cycle());
        let (a, b) = (a.unwrap(), b.unwrap());
        let (first, second) = if a.start < b.start { (a, b) } else { (b, a) };
        assert_eq!(first.start, 0);
        assert_eq!(second.start, first.start + first.scanned);

        let s = h.scanner.stats();
        assert_eq!(s.cycles, 2);
        assert_eq!(s.cursor, 64);
        assert_eq!(s.sectors_scanned, 64);
        for sector in 0..64 {
            assert_eq!(h.health.get(sector).unwrap().scan_count, 1);
        }
        assert!(h.health.get(64).is_none());
    }

    #[tokio::test]
    async fn inline_cycle_refused_while_worker_runs() {
        let h = harness(64);
        h.scanner.start();
        assert!(matches!(
            h.scanner.run_cycle().await,
            Err(SpareError::ScannerBusy)
        ));

        h.scanner.pause();
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.scanner.state() != ScannerState::Paused {
            assert!(Instant::now() < deadline, "scanner did not pause");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.scanner.run_cycle().await.unwrap();

        h.scanner.stop().await;
        h.scanner.run_cycle().await.unwrap();
    }

    #[tokio::test]
    async fn stop_aborts_a_stalled_worker() {
        let mut c = cfg();
        c.probe_retries = 1;
        c.probe_backoff_ms = 60_000;
        c.stop_timeout_ms = 50;
        let h = harness_with(40, c, RecordingRemapper::default());
        h.dev.fail_reads(0);
        h.scanner.start();

        // Wait until the worker sits in the retry backoff for sector 0
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.scanner.stats().transient_errors == 0 {
            assert!(Instant::now() < deadline, "scanner never read sector 0");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.scanner.state(), ScannerState::Running);

        tokio::time::timeout(Duration::from_secs(5), h.scanner.stop())
            .await
            .expect("stop did not return after its timeout");
        assert_eq!(h.scanner.state(), ScannerState::Stopped);
        let s = h.scanner.stats();
        assert_eq!(s.sectors_scanned, 0);
        assert_eq!(s.cycles, 0);

        // The aborted cycle released its lock
        h.dev.heal(0);
        let r = h.scanner.run_cycle().await.unwrap();
        assert_eq!(r.start, 0);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let h = harness(8);
        h.scanner.stop().await;
        assert_eq!(h.scanner.state(), ScannerState::Stopped);
    }
}
