// Copyright 2024 Oxide Computer Company
//! Redundant metadata store
//!
//! The store owns the canonical in-memory [`MetadataSnapshot`].  Other
//! components submit a [`MetadataDelta`] with [`MetadataStore::apply`]; a
//! later [`MetadataStore::commit`] writes the staged snapshot to every copy
//! slot on the spare device under a new sequence number.
//!
//! Writes are not atomic across copies.  A crash part way through leaves
//! some slots on the new sequence and some on the old; the read protocol
//! picks the newest valid copy and repair brings the rest up to date.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::Notify;

use crate::allocator::RemapEntry;
use crate::clock::Clock;
use crate::config::{MetadataConfig, PersistedConfig, RepairConfig};
use crate::device::{submit_and_wait, BlockDevice, IoDirection};
use crate::health::HealthSummary;
use crate::metadata::{
    decode, encode, select_best, CopyFault, DecodedCopy, MetadataSnapshot,
};
use crate::SpareError;

/// A change to one section of the snapshot
#[derive(Clone, Debug)]
pub enum MetadataDelta {
    RemapTable(Vec<RemapEntry>),
    HealthSummary(HealthSummary),
    Config(PersistedConfig),
}

/// State of one copy slot, as found on disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    Valid {
        sequence_number: u64,
        timestamp: u64,
        remaps: usize,
    },
    CorruptHeader(String),
    CorruptData(String),
    Unreadable(String),
}

impl CopyStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CopyStatus::Valid { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyInspection {
    pub copy_index: usize,
    pub start_sector: u64,
    pub status: CopyStatus,
}

/// Result of the read protocol
#[derive(Clone, Debug)]
pub struct ReadOutcome {
    pub snapshot: MetadataSnapshot,
    pub sequence_number: u64,
    pub timestamp: u64,
    pub copy_index: usize,
    /// Copies which failed validation
    pub invalid: Vec<usize>,
    /// Valid copies holding something other than the chosen copy
    pub stale: Vec<usize>,
}

impl ReadOutcome {
    pub fn needs_repair(&self) -> bool {
        !self.invalid.is_empty() || !self.stale.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub authoritative_sequence: Option<u64>,
    pub copies_checked: usize,
    pub repaired: Vec<usize>,
    pub failed: Vec<usize>,
    pub fatal: Option<SpareError>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
            && self.failed.is_empty()
            && self.fatal.is_none()
    }

    pub fn into_result(self, max_attempts: u32) -> Result<Self, SpareError> {
        if let Some(e) = self.fatal {
            return Err(e);
        }
        if let Some(&copy) = self.failed.first() {
            return Err(SpareError::RepairFailed {
                copy,
                attempts: max_attempts,
            });
        }
        Ok(self)
    }
}

#[derive(Debug)]
struct Staged {
    snapshot: Option<MetadataSnapshot>,
    dirty: bool,
    /// Bumped on every `apply`, so a commit can tell if it is still current
    generation: u64,
}

pub struct MetadataStore {
    spare: Arc<dyn BlockDevice>,
    copy_sectors: Vec<u64>,
    sectors_per_copy: u64,
    staged: Mutex<Staged>,
    /// Sequence number the next write will carry
    next_sequence: AtomicU64,
    /// Orders multi-copy writes; guards no in-memory state
    write_lock: tokio::sync::Mutex<()>,
    corruption: Notify,
    repair_cfg: RepairConfig,
    clock: Arc<dyn Clock>,
    log: Logger,
}

impl MetadataStore {
    pub fn new(
        spare: Arc<dyn BlockDevice>,
        cfg: &MetadataConfig,
        repair_cfg: &RepairConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Result<Self, SpareError> {
        for &start in &cfg.copy_sectors {
            let end = start.saturating_add(cfg.sectors_per_copy);
            if end > spare.sector_count() {
                return Err(SpareError::SectorOutOfRange {
                    sector: end - 1,
                    count: spare.sector_count(),
                });
            }
        }

        Ok(MetadataStore {
            spare,
            copy_sectors: cfg.copy_sectors.clone(),
            sectors_per_copy: cfg.sectors_per_copy,
            staged: Mutex::new(Staged {
                snapshot: None,
                dirty: false,
                generation: 0,
            }),
            next_sequence: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            corruption: Notify::new(),
            repair_cfg: repair_cfg.clone(),
            clock,
            log: log.new(o!("task" => "metadata")),
        })
    }

    pub fn copy_count(&self) -> usize {
        self.copy_sectors.len()
    }

    fn copy_bytes(&self) -> usize {
        self.sectors_per_copy as usize * self.spare.sector_size()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Snapshot as staged in memory, including uncommitted deltas
    pub fn snapshot(&self) -> Option<MetadataSnapshot> {
        self.staged.lock().unwrap().snapshot.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.staged.lock().unwrap().dirty
    }

    /// Replaces the staged snapshot wholesale, as at format or attach
    pub fn install(&self, snapshot: MetadataSnapshot) {
        let mut staged = self.staged.lock().unwrap();
        staged.snapshot = Some(snapshot);
        staged.dirty = false;
        staged.generation += 1;
    }

    pub fn apply(&self, delta: MetadataDelta) -> Result<(), SpareError> {
        let mut staged = self.staged.lock().unwrap();
        let Some(snap) = staged.snapshot.as_mut() else {
            return Err(SpareError::GenericError(
                "metadata store has no snapshot to update".to_string(),
            ));
        };
        match delta {
            MetadataDelta::RemapTable(remaps) => snap.remaps = remaps,
            MetadataDelta::HealthSummary(health) => snap.health = health,
            MetadataDelta::Config(config) => snap.config = config,
        }
        staged.dirty = true;
        staged.generation += 1;
        Ok(())
    }

    /// Writes the staged snapshot if anything changed since the last write.
    /// Returns the sequence number written, if any.
    pub async fn commit(&self) -> Result<Option<u64>, SpareError> {
        let _guard = self.write_lock.lock().await;
        let (snapshot, generation) = {
            let staged = self.staged.lock().unwrap();
            if !staged.dirty {
                return Ok(None);
            }
            match &staged.snapshot {
                Some(s) => (s.clone(), staged.generation),
                None => return Ok(None),
            }
        };

        let seq = self.write_copies_locked(&snapshot).await?;

        let mut staged = self.staged.lock().unwrap();
        if staged.generation == generation {
            staged.dirty = false;
        }
        Ok(Some(seq))
    }

    /// Writes `snapshot` to every copy slot under the next sequence number
    ///
    /// Copies are written in slot order.  The first failure ends the write;
    /// copies already written are left in place.
    pub async fn write_all_copies(
        &self,
        snapshot: &MetadataSnapshot,
    ) -> Result<u64, SpareError> {
        let _guard = self.write_lock.lock().await;
        self.write_copies_locked(snapshot).await
    }

    async fn write_copies_locked(
        &self,
        snapshot: &MetadataSnapshot,
    ) -> Result<u64, SpareError> {
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.clock.now();

        for (i, &start) in self.copy_sectors.iter().enumerate() {
            let mut buf =
                encode(snapshot, seq, i as u32, timestamp, self.copy_bytes())?;
            let r = submit_and_wait(
                &*self.spare,
                start,
                &mut buf,
                IoDirection::Write,
            )
            .await;
            if let Err(e) = r {
                error!(
                    self.log,
                    "writing metadata copy {} (seq {}) failed: {}", i, seq, e
                );
                return Err(e);
            }
        }
        self.spare.flush().await?;
        debug!(
            self.log,
            "wrote {} metadata copies at seq {}",
            self.copy_sectors.len(),
            seq
        );
        Ok(seq)
    }

    async fn read_copy(&self, index: usize) -> Result<DecodedCopy, CopyStatus> {
        let mut buf = vec![0u8; self.copy_bytes()];
        submit_and_wait(
            &*self.spare,
            self.copy_sectors[index],
            &mut buf,
            IoDirection::Read,
        )
        .await
        .map_err(|e| CopyStatus::Unreadable(e.to_string()))?;

        decode(&buf, index as u32).map_err(|fault: CopyFault| {
            if fault.is_header_fault() {
                CopyStatus::CorruptHeader(fault.to_string())
            } else {
                CopyStatus::CorruptData(fault.to_string())
            }
        })
    }

    async fn read_all(&self) -> Vec<Result<DecodedCopy, CopyStatus>> {
        let mut out = Vec::with_capacity(self.copy_sectors.len());
        for i in 0..self.copy_sectors.len() {
            out.push(self.read_copy(i).await);
        }
        out
    }

    /// Reads every copy and returns the authoritative one
    ///
    /// If any copy is invalid or behind, whoever waits in
    /// [`Self::corruption_detected`] is woken.
    pub async fn read_best_copy(&self) -> Result<ReadOutcome, SpareError> {
        let copies = self.read_all().await;

        let mut invalid = Vec::new();
        for (i, c) in copies.iter().enumerate() {
            if let Err(status) = c {
                warn!(self.log, "metadata copy {} invalid: {:?}", i, status);
                invalid.push(i);
            }
        }

        let Some(best) = select_best(copies.iter().flatten()) else {
            error!(self.log, "no valid metadata copy");
            self.corruption.notify_one();
            return Err(SpareError::NoValidCopy);
        };

        let stale: Vec<usize> = copies
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Ok(c) if !c.same_contents(best) => Some(i),
                _ => None,
            })
            .collect();

        self.next_sequence
            .fetch_max(best.header.sequence_number + 1, Ordering::SeqCst);

        let outcome = ReadOutcome {
            snapshot: best.snapshot.clone(),
            sequence_number: best.header.sequence_number,
            timestamp: best.header.timestamp,
            copy_index: best.header.copy_index as usize,
            invalid,
            stale,
        };
        if outcome.needs_repair() {
            info!(
                self.log,
                "metadata needs repair: invalid {:?}, stale {:?}",
                outcome.invalid,
                outcome.stale
            );
            self.corruption.notify_one();
        }
        Ok(outcome)
    }

    /// Resolves when a read found a bad or lagging copy
    pub async fn corruption_detected(&self) {
        self.corruption.notified().await
    }

    /// Rewrites every copy which is invalid or differs from the
    /// authoritative copy, then re-reads it to make sure it took.
    pub async fn repair(&self) -> RepairReport {
        let _guard = self.write_lock.lock().await;
        let mut report = RepairReport {
            copies_checked: self.copy_sectors.len(),
            ..Default::default()
        };

        let copies = self.read_all().await;
        let Some(best) = select_best(copies.iter().flatten()).cloned() else {
            error!(self.log, "repair: no valid metadata copy to repair from");
            report.fatal = Some(SpareError::NoValidCopy);
            return report;
        };
        let seq = best.header.sequence_number;
        let timestamp = best.header.timestamp;
        report.authoritative_sequence = Some(seq);
        self.next_sequence.fetch_max(seq + 1, Ordering::SeqCst);

        for (i, c) in copies.iter().enumerate() {
            match c {
                Ok(c) if c.same_contents(&best) => continue,
                Ok(c) => info!(
                    self.log,
                    "repair: copy {} at seq {} is behind seq {}",
                    i,
                    c.header.sequence_number,
                    seq
                ),
                Err(status) => {
                    info!(self.log, "repair: copy {} is {:?}", i, status)
                }
            }

            match self.rewrite_copy(i, &best.snapshot, seq, timestamp).await {
                Ok(()) => report.repaired.push(i),
                Err(e) => {
                    error!(self.log, "repair: copy {} not repaired: {}", i, e);
                    report.failed.push(i);
                }
            }
        }

        if !report.is_clean() {
            info!(
                self.log,
                "repair at seq {}: repaired {:?} failed {:?}",
                seq,
                report.repaired,
                report.failed
            );
        }
        report
    }

    async fn rewrite_copy(
        &self,
        index: usize,
        snapshot: &MetadataSnapshot,
        seq: u64,
        timestamp: u64,
    ) -> Result<(), SpareError> {
        let attempts = self.repair_cfg.max_attempts;
        let mut backoff =
            Duration::from_millis(self.repair_cfg.backoff_base_ms);

        for attempt in 1..=attempts {
            let result =
                self.try_rewrite(index, snapshot, seq, timestamp).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        self.log,
                        "rewrite of copy {} failed (attempt {}/{}): {}",
                        index,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(_) => break,
            }
        }
        Err(SpareError::RepairFailed {
            copy: index,
            attempts,
        })
    }

    async fn try_rewrite(
        &self,
        index: usize,
        snapshot: &MetadataSnapshot,
        seq: u64,
        timestamp: u64,
    ) -> Result<(), SpareError> {
        let mut buf =
            encode(snapshot, seq, index as u32, timestamp, self.copy_bytes())?;
        submit_and_wait(
            &*self.spare,
            self.copy_sectors[index],
            &mut buf,
            IoDirection::Write,
        )
        .await?;
        self.spare.flush().await?;

        match self.read_copy(index).await {
            Ok(c) if c.header.sequence_number == seq => Ok(()),
            Ok(c) => Err(SpareError::MetadataCorrupt(format!(
                "copy {} reads back seq {}",
                index, c.header.sequence_number
            ))),
            Err(status) => Err(SpareError::MetadataCorrupt(format!(
                "copy {} reads back as {:?}",
                index, status
            ))),
        }
    }

    /// Per-copy status, without repairing anything
    pub async fn inspect(&self) -> Vec<CopyInspection> {
        self.read_all()
            .await
            .into_iter()
            .enumerate()
            .map(|(i, c)| CopyInspection {
                copy_index: i,
                start_sector: self.copy_sectors[i],
                status: match c {
                    Ok(c) => CopyStatus::Valid {
                        sequence_number: c.header.sequence_number,
                        timestamp: c.header.timestamp,
                        remaps: c.snapshot.remaps.len(),
                    },
                    Err(status) => status,
                },
            })
            .collect()
    }
}
