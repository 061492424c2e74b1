// Copyright 2024 Oxide Computer Company
//! Per-sector health tracking
//!
//! [`HealthStore`] is a hash map from sector number to
//! [`SectorHealthRecord`], split into buckets which each carry their own
//! `RwLock`.  Point lookups take the table lock shared plus one bucket lock,
//! so updates to sectors in different buckets proceed in parallel and
//! updates to the same sector are serialized.  Records are copied out, never
//! borrowed, so a reader sees either the previous or the next version of a
//! record and never a half-written one.
//!
//! When the load factor passes 3/4, the table doubles its bucket count under
//! the exclusive table lock.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};

use crate::clock::Clock;
use crate::config::HealthConfig;

pub const MAX_HEALTH_SCORE: u32 = 1000;

/// Score movement (in either direction) that counts as a trend
const TREND_DELTA: u32 = 50;
/// Accesses needed before an error-free sector earns a bonus
const BONUS_MIN_ACCESSES: u64 = 100;
const MAX_ACCESS_BONUS: u64 = 50;
const STALENESS_PENALTY: u32 = 50;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Risk classification of a sector; ordered from best to worst
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum RiskLevel {
    Safe,
    Caution,
    Danger,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorHealthRecord {
    pub health_score: u32,
    pub read_errors: u32,
    pub write_errors: u32,
    pub access_count: u64,
    pub scan_count: u32,
    /// Zero until the first scan
    pub last_scan_time: u64,
    pub last_access_time: u64,
    /// When the record was created
    pub first_seen: u64,
    pub trend: Trend,
    pub risk_level: RiskLevel,
}

impl SectorHealthRecord {
    pub fn new(now: u64) -> Self {
        SectorHealthRecord {
            health_score: MAX_HEALTH_SCORE,
            read_errors: 0,
            write_errors: 0,
            access_count: 0,
            scan_count: 0,
            last_scan_time: 0,
            last_access_time: 0,
            first_seen: now,
            trend: Trend::Stable,
            risk_level: RiskLevel::Safe,
        }
    }

    pub fn total_errors(&self) -> u64 {
        u64::from(self.read_errors) + u64::from(self.write_errors)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HealthThresholds {
    pub warning: u32,
    pub danger: u32,
    pub staleness_secs: u64,
}

impl HealthThresholds {
    pub fn risk_for(&self, score: u32) -> RiskLevel {
        if score >= self.warning {
            RiskLevel::Safe
        } else if score >= self.danger {
            RiskLevel::Caution
        } else {
            RiskLevel::Danger
        }
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(c: &HealthConfig) -> Self {
        HealthThresholds {
            warning: c.warning_threshold,
            danger: c.danger_threshold,
            staleness_secs: c.staleness_secs,
        }
    }
}

/// Health score for `rec` as of `now`, in `[0, MAX_HEALTH_SCORE]`
pub fn compute_score(
    rec: &SectorHealthRecord,
    th: &HealthThresholds,
    now: u64,
) -> u32 {
    let max = i64::from(MAX_HEALTH_SCORE);
    let errors = rec.total_errors();

    let mut score = max;
    if rec.access_count > 0 {
        let penalty = errors.saturating_mul(1000) / rec.access_count;
        score -= penalty.min(max as u64) as i64;
    }

    if rec.access_count > BONUS_MIN_ACCESSES && errors == 0 {
        score += (rec.access_count / BONUS_MIN_ACCESSES).min(MAX_ACCESS_BONUS)
            as i64;
    }

    if rec.last_scan_time != 0
        && now.saturating_sub(rec.last_scan_time) > th.staleness_secs
    {
        score -= i64::from(STALENESS_PENALTY);
    }

    score.clamp(0, max) as u32
}

/// Recomputes score, trend, and risk together
fn rescore(rec: &mut SectorHealthRecord, th: &HealthThresholds, now: u64) {
    let prev = rec.health_score;
    let score = compute_score(rec, th, now);
    rec.trend = if score > prev + TREND_DELTA {
        Trend::Improving
    } else if score + TREND_DELTA < prev {
        Trend::Declining
    } else {
        Trend::Stable
    };
    rec.health_score = score;
    rec.risk_level = th.risk_for(score);
}

/// Counts of sectors currently in elevated risk levels
///
/// These are owned by a [`HealthStore`]; they start at zero when the store
/// is built and go away with it.
#[derive(Debug, Default)]
pub struct HealthCounters {
    /// Sectors at `Caution` or worse
    warnings: AtomicU64,
    /// Sectors at `Danger`
    high_risk: AtomicU64,
    updates: AtomicU64,
    scans: AtomicU64,
}

impl HealthCounters {
    fn transition(&self, old: RiskLevel, new: RiskLevel) {
        let was_warn = old >= RiskLevel::Caution;
        let is_warn = new >= RiskLevel::Caution;
        if is_warn && !was_warn {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        } else if was_warn && !is_warn {
            self.warnings.fetch_sub(1, Ordering::SeqCst);
        }

        let was_high = old == RiskLevel::Danger;
        let is_high = new == RiskLevel::Danger;
        if is_high && !was_high {
            self.high_risk.fetch_add(1, Ordering::SeqCst);
        } else if was_high && !is_high {
            self.high_risk.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn high_risk(&self) -> u64 {
        self.high_risk.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }
}

/// Aggregate health, persisted with the remap table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub tracked_sectors: u64,
    pub average_score: u32,
    pub total_read_errors: u64,
    pub total_write_errors: u64,
    pub active_warnings: u64,
    pub high_risk_sectors: u64,
    /// Where the scanner will resume
    pub scan_cursor: u64,
    pub scan_passes: u64,
    pub coverage_percent: u32,
}

type Bucket = RwLock<Vec<(u64, SectorHealthRecord)>>;

#[derive(Debug)]
struct Table {
    buckets: Vec<Bucket>,
}

impl Table {
    fn with_buckets(n: usize) -> Self {
        let n = n.max(1).next_power_of_two();
        Table {
            buckets: (0..n).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn index(&self, sector: u64) -> usize {
        // Fibonacci hashing; the bucket count is a power of two
        let h = sector.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (h >> 32) as usize & (self.buckets.len() - 1)
    }

    fn bucket(&self, sector: u64) -> &Bucket {
        &self.buckets[self.index(sector)]
    }
}

#[derive(Debug)]
pub struct HealthStore {
    table: RwLock<Table>,
    len: AtomicUsize,
    sector_count: u64,
    thresholds: HealthThresholds,
    counters: HealthCounters,
    clock: Arc<dyn Clock>,
    log: Logger,
}

impl HealthStore {
    pub fn new(
        sector_count: u64,
        cfg: &HealthConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Self {
        HealthStore {
            table: RwLock::new(Table::with_buckets(cfg.initial_buckets)),
            len: AtomicUsize::new(0),
            sector_count,
            thresholds: HealthThresholds::from(cfg),
            counters: HealthCounters::default(),
            clock,
            log: log.new(o!("task" => "health")),
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    pub fn counters(&self) -> &HealthCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.table.read().unwrap().buckets.len()
    }

    /// Out-of-range sectors are a caller bug, not a device fault
    fn check_sector(&self, sector: u64) {
        assert!(
            sector < self.sector_count,
            "sector {} out of range for device of {} sectors",
            sector,
            self.sector_count
        );
    }

    /// Returns a copy of the record for `sector`, if one exists
    pub fn get(&self, sector: u64) -> Option<SectorHealthRecord> {
        self.check_sector(sector);
        let table = self.table.read().unwrap();
        let bucket = table.bucket(sector).read().unwrap();
        bucket
            .iter()
            .find(|(s, _)| *s == sector)
            .map(|(_, r)| r.clone())
    }

    pub fn get_or_create(&self, sector: u64) -> SectorHealthRecord {
        if let Some(r) = self.get(sector) {
            return r;
        }
        self.modify(sector, |_, _| ())
    }

    /// Records the outcome of one I/O to `sector`
    pub fn update(
        &self,
        sector: u64,
        read_ok: bool,
        write_ok: bool,
    ) -> SectorHealthRecord {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.modify(sector, |rec, now| {
            rec.access_count += 1;
            rec.last_access_time = now;
            if !read_ok {
                rec.read_errors = rec.read_errors.saturating_add(1);
            }
            if !write_ok {
                rec.write_errors = rec.write_errors.saturating_add(1);
            }
        })
    }

    /// Records the outcome of a scanner probe, which is also a read access
    pub fn record_scan(
        &self,
        sector: u64,
        read_ok: bool,
    ) -> SectorHealthRecord {
        self.counters.scans.fetch_add(1, Ordering::SeqCst);
        self.modify(sector, |rec, now| {
            rec.scan_count = rec.scan_count.saturating_add(1);
            rec.last_scan_time = now;
            rec.access_count += 1;
            rec.last_access_time = now;
            if !read_ok {
                rec.read_errors = rec.read_errors.saturating_add(1);
            }
        })
    }

    /// Applies `f` to the record for `sector` (creating it if needed), then
    /// rescores it, all under the bucket lock.
    fn modify<F>(&self, sector: u64, f: F) -> SectorHealthRecord
    where
        F: FnOnce(&mut SectorHealthRecord, u64),
    {
        self.check_sector(sector);
        let now = self.clock.now();

        let (out, inserted) = {
            let table = self.table.read().unwrap();
            let mut bucket = table.bucket(sector).write().unwrap();
            let (pos, inserted) =
                match bucket.iter().position(|(s, _)| *s == sector) {
                    Some(pos) => (pos, false),
                    None => {
                        bucket.push((sector, SectorHealthRecord::new(now)));
                        (bucket.len() - 1, true)
                    }
                };
            let rec = &mut bucket[pos].1;
            let old_risk = rec.risk_level;
            f(rec, now);
            rescore(rec, &self.thresholds, now);
            self.counters.transition(old_risk, rec.risk_level);
            (rec.clone(), inserted)
        };

        if inserted {
            self.len.fetch_add(1, Ordering::SeqCst);
            self.maybe_grow();
        }
        out
    }

    fn maybe_grow(&self) {
        let len = self.len();
        if len * 4 <= self.bucket_count() * 3 {
            return;
        }

        let mut table = self.table.write().unwrap();
        let old_count = table.buckets.len();
        // Someone else may have grown the table while we waited
        if len * 4 <= old_count * 3 {
            return;
        }
        let grown = Table::with_buckets(old_count * 2);
        for bucket in table.buckets.drain(..) {
            for (sector, rec) in bucket.into_inner().unwrap() {
                grown.bucket(sector).write().unwrap().push((sector, rec));
            }
        }
        *table = grown;
        debug!(
            self.log,
            "health map grew from {} to {} buckets ({} records)",
            old_count,
            table.buckets.len(),
            len
        );
    }

    /// Lazy walk over all records
    ///
    /// Each bucket is copied out when the walk reaches it.  Records present
    /// for the whole walk are visited; a walk that races with a resize may
    /// see a record twice.  Calling `iter` again starts over.
    pub fn iter(&self) -> HealthIter<'_> {
        HealthIter {
            store: self,
            bucket: 0,
            pending: Vec::new(),
        }
    }

    /// Evicts healthy, error-free records (least recently accessed first)
    /// until at most `max_records` remain.  Returns how many were evicted.
    pub fn compact(&self, max_records: usize) -> usize {
        let len = self.len();
        if len <= max_records {
            return 0;
        }

        let mut candidates: Vec<(u64, u64)> = self
            .iter()
            .filter(|(_, r)| {
                r.risk_level == RiskLevel::Safe && r.total_errors() == 0
            })
            .map(|(s, r)| (r.last_access_time, s))
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut evicted = 0;
        let table = self.table.read().unwrap();
        for (_, sector) in candidates {
            if len - evicted <= max_records {
                break;
            }
            let mut bucket = table.bucket(sector).write().unwrap();
            // The record may have changed since we looked at it
            if let Some(pos) = bucket.iter().position(|(s, r)| {
                *s == sector
                    && r.risk_level == RiskLevel::Safe
                    && r.total_errors() == 0
            }) {
                bucket.swap_remove(pos);
                self.len.fetch_sub(1, Ordering::SeqCst);
                evicted += 1;
            }
        }
        drop(table);

        if evicted > 0 {
            info!(
                self.log,
                "compacted health map: evicted {} of {} records", evicted, len
            );
        }
        evicted
    }

    /// Aggregate over all records; scan fields are left at zero
    pub fn summary(&self) -> HealthSummary {
        let mut out = summarize(self.iter());
        out.active_warnings = self.counters.warnings();
        out.high_risk_sectors = self.counters.high_risk();
        out
    }
}

/// Totals over `records`, counting each sector once even if a walk that
/// raced with a resize yields it twice
fn summarize<I>(records: I) -> HealthSummary
where
    I: Iterator<Item = (u64, SectorHealthRecord)>,
{
    let mut out = HealthSummary::default();
    let mut seen = BTreeSet::new();
    let mut score_sum = 0u64;
    for (sector, r) in records {
        if !seen.insert(sector) {
            continue;
        }
        out.tracked_sectors += 1;
        score_sum += u64::from(r.health_score);
        out.total_read_errors += u64::from(r.read_errors);
        out.total_write_errors += u64::from(r.write_errors);
    }
    out.average_score = if out.tracked_sectors == 0 {
        MAX_HEALTH_SCORE
    } else {
        (score_sum / out.tracked_sectors) as u32
    };
    out
}

pub struct HealthIter<'a> {
    store: &'a HealthStore,
    bucket: usize,
    pending: Vec<(u64, SectorHealthRecord)>,
}

impl Iterator for HealthIter<'_> {
    type Item = (u64, SectorHealthRecord);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop() {
                return Some(item);
            }
            let table = self.store.table.read().unwrap();
            let b = table.buckets.get(self.bucket)?;
            self.pending = b.read().unwrap().clone();
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::{ManualClock, SECS_PER_DAY};
    use proptest::prelude::*;
    use sparemap_common::csl;
    use test_strategy::proptest;

    const NOW: u64 = 1_700_000_000;

    fn store_with(
        sectors: u64,
        buckets: usize,
    ) -> (HealthStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let cfg = HealthConfig {
            initial_buckets: buckets,
            ..Default::default()
        };
        (HealthStore::new(sectors, &cfg, clock.clone(), &csl()), clock)
    }

    #[test]
    fn new_record_is_perfect() {
        let (store, _) = store_with(100, 4);
        let r = store.get_or_create(5);
        assert_eq!(r.health_score, MAX_HEALTH_SCORE);
        assert_eq!(r.risk_level, RiskLevel::Safe);
        assert_eq!(r.first_seen, NOW);
        assert_eq!(store.len(), 1);
        // A second call does not create another record
        store.get_or_create(5);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_does_not_create() {
        let (store, _) = store_with(100, 4);
        assert!(store.get(7).is_none());
        assert!(store.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_sector_panics() {
        let (store, _) = store_with(100, 4);
        store.update(100, true, true);
    }

    #[test]
    fn error_free_sector_stays_perfect() {
        let (store, _) = store_with(10, 4);
        let mut r = store.get_or_create(1);
        for _ in 0..1000 {
            r = store.update(1, true, true);
        }
        assert_eq!(r.access_count, 1000);
        assert_eq!(r.health_score, MAX_HEALTH_SCORE);
        assert_eq!(r.risk_level, RiskLevel::Safe);
        assert_eq!(r.trend, Trend::Stable);
    }

    #[test]
    fn read_errors_lower_the_score() {
        let (store, _) = store_with(10, 4);
        for i in 0..50 {
            store.update(2, i >= 10, true);
        }
        let r = store.get(2).unwrap();
        assert_eq!(r.read_errors, 10);
        assert_eq!(r.access_count, 50);
        assert_eq!(r.health_score, 800);
        assert_eq!(r.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn risk_thresholds_and_counters() {
        let (store, _) = store_with(10, 4);
        // One bad access out of one: score 0
        let r = store.update(3, false, true);
        assert_eq!(r.health_score, 0);
        assert_eq!(r.risk_level, RiskLevel::Danger);
        assert_eq!(r.trend, Trend::Declining);
        assert_eq!(store.counters().warnings(), 1);
        assert_eq!(store.counters().high_risk(), 1);

        // Good accesses bring it back up through Caution to Safe
        let mut r = r;
        while r.risk_level == RiskLevel::Danger {
            r = store.update(3, true, true);
        }
        assert_eq!(r.risk_level, RiskLevel::Caution);
        assert_eq!(store.counters().warnings(), 1);
        assert_eq!(store.counters().high_risk(), 0);

        while r.risk_level == RiskLevel::Caution {
            r = store.update(3, true, true);
        }
        assert_eq!(r.risk_level, RiskLevel::Safe);
        assert_eq!(store.counters().warnings(), 0);
        assert_eq!(store.counters().high_risk(), 0);
    }

    #[test]
    fn trend_follows_large_moves() {
        let (store, _) = store_with(10, 4);
        let r = store.update(4, false, true);
        assert_eq!(r.trend, Trend::Declining);
        let r = store.update(4, true, true);
        // 1 error in 2 accesses: 0 -> 500
        assert_eq!(r.health_score, 500);
        assert_eq!(r.trend, Trend::Improving);
        for _ in 0..98 {
            store.update(4, true, true);
        }
        let r = store.update(4, true, true);
        // 1 in 101 vs 1 in 100: a move of well under 50 points
        assert_eq!(r.trend, Trend::Stable);
    }

    #[test]
    fn stale_scan_penalty() {
        let (store, clock) = store_with(10, 4);
        store.record_scan(6, true);
        let r = store.update(6, true, true);
        assert_eq!(r.health_score, MAX_HEALTH_SCORE);

        clock.advance(std::time::Duration::from_secs(8 * SECS_PER_DAY));
        let r = store.update(6, true, true);
        assert_eq!(r.health_score, MAX_HEALTH_SCORE - STALENESS_PENALTY);

        // A fresh scan clears it
        let r = store.record_scan(6, true);
        assert_eq!(r.health_score, MAX_HEALTH_SCORE);
        assert_eq!(r.scan_count, 2);
    }

    #[test]
    fn table_grows_past_three_quarters() {
        let (store, _) = store_with(10_000, 4);
        assert_eq!(store.bucket_count(), 4);
        for s in 0..4 {
            store.get_or_create(s);
        }
        assert_eq!(store.bucket_count(), 8);
        for s in 0..1000 {
            store.update(s, true, true);
        }
        assert_eq!(store.len(), 1000);
        assert!(store.len() * 4 <= store.bucket_count() * 3);
        // Nothing lost in the moves
        for s in 0..1000 {
            assert_eq!(store.get(s).unwrap().access_count, 1);
        }
    }

    #[test]
    fn iter_is_restartable() {
        let (store, _) = store_with(1000, 8);
        for s in (0..1000).step_by(7) {
            store.update(s, true, true);
        }
        let mut a: Vec<u64> = store.iter().map(|(s, _)| s).collect();
        let mut b: Vec<u64> = store.iter().map(|(s, _)| s).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
        assert_eq!(a, (0..1000).step_by(7).collect::<Vec<_>>());
    }

    #[test]
    fn compact_evicts_only_healthy() {
        let (store, clock) = store_with(100, 8);
        for s in 0..20 {
            store.update(s, true, true);
            clock.advance(std::time::Duration::from_secs(1));
        }
        store.update(0, false, true);
        assert_eq!(store.compact(5), 15);
        assert_eq!(store.len(), 5);
        // The errored sector survives, as do the most recently used ones
        assert!(store.get(0).is_some());
        for s in 16..20 {
            assert!(store.get(s).is_some(), "sector {s} evicted");
        }
        assert_eq!(store.compact(5), 0);
        assert_eq!(store.counters().warnings(), 1);
    }

    #[test]
    fn summary_aggregates() {
        let (store, _) = store_with(100, 8);
        store.update(1, false, true);
        store.update(1, true, true);
        store.update(2, true, false);
        store.update(3, true, true);
        let s = store.summary();
        assert_eq!(s.tracked_sectors, 3);
        assert_eq!(s.total_read_errors, 1);
        assert_eq!(s.total_write_errors, 1);
        assert_eq!(s.average_score, (500 + 0 + 1000) / 3);
        assert_eq!(s.active_warnings, 2);
        assert_eq!(s.high_risk_sectors, 1);
    }

    #[test]
    fn summary_counts_repeated_sectors_once() {
        let (store, _) = store_with(100, 8);
        store.update(1, false, true);
        store.update(2, true, true);
        let walk: Vec<_> = store.iter().collect();
        // A walk that raced with a resize can hand back the same records
        let s = summarize(walk.iter().cloned().chain(walk.iter().cloned()));
        assert_eq!(s.tracked_sectors, 2);
        assert_eq!(s.total_read_errors, 1);
        assert_eq!(s.average_score, 1000 / 2);
        assert_eq!(s, summarize(walk.into_iter()));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let (store, _) = store_with(512, 2);
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..2000u64 {
                        store.update((i * 13 + t) % 512, i % 97 != 0, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: u64 = store.iter().map(|(_, r)| r.access_count).sum();
        assert_eq!(total, 8 * 2000);
        assert_eq!(store.counters().updates(), 8 * 2000);

        // Counters agree with the records
        let warn = store
            .iter()
            .filter(|(_, r)| r.risk_level >= RiskLevel::Caution)
            .count() as u64;
        assert_eq!(store.counters().warnings(), warn);
    }

    #[proptest]
    fn score_in_range_and_risk_consistent(
        #[strategy(proptest::collection::vec(
            (
                any::<bool>(),
                any::<bool>(),
                any::<bool>(),
                0..(30 * SECS_PER_DAY),
            ),
            1..200,
        ))]
        ops: Vec<(bool, bool, bool, u64)>,
    ) {
        let (store, clock) = store_with(4, 2);
        let th = store.thresholds();
        for (read_ok, write_ok, scan, dt) in ops {
            clock.advance(std::time::Duration::from_secs(dt));
            let r = if scan {
                store.record_scan(1, read_ok)
            } else {
                store.update(1, read_ok, write_ok)
            };
            prop_assert!(r.health_score <= MAX_HEALTH_SCORE);
            prop_assert_eq!(r.risk_level, th.risk_for(r.health_score));
        }
    }

    #[proptest]
    fn risk_is_monotone_in_score(
        #[strategy(0..=MAX_HEALTH_SCORE)] a: u32,
        #[strategy(0..=MAX_HEALTH_SCORE)] b: u32,
    ) {
        let th = HealthThresholds::from(&HealthConfig::default());
        if a > b {
            prop_assert!(th.risk_for(a) <= th.risk_for(b));
        }
    }
}
