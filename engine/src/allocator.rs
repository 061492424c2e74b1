// Copyright 2024 Oxide Computer Company
//! Spare-device space management and the remap table
//!
//! The allocator owns two bitmaps over the spare device: sectors reserved
//! for metadata copies, and sectors handed out as remap targets.  A sector
//! is never in both.  Allocation walks forward from a cursor and wraps at
//! most once, so it terminates even when the device is full.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};

use crate::{spare_bail, SpareError};

/// The spare holds no copy of the original contents
pub const REMAP_FLAG_DATA_LOST: u32 = 1 << 0;
/// Original contents were copied to the spare when the remap was made
pub const REMAP_FLAG_COPIED: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemapReason {
    ReadError,
    WriteError,
    Preventive,
    Manual,
}

impl std::fmt::Display for RemapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemapReason::ReadError => "read-error",
            RemapReason::WriteError => "write-error",
            RemapReason::Preventive => "preventive",
            RemapReason::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapEntry {
    pub original_sector: u64,
    pub spare_sector: u64,
    pub creation_timestamp: u64,
    pub access_count: u32,
    pub error_count: u32,
    pub reason: RemapReason,
    pub flags: u32,
}

#[derive(Clone, Debug, Default)]
struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    fn new(bits: u64) -> Self {
        Bitmap {
            words: vec![0; bits.div_ceil(64) as usize],
        }
    }

    fn get(&self, bit: u64) -> bool {
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: u64) {
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}

/// What a resync from disk kept and dropped
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub restored: usize,
    pub out_of_range: usize,
    pub overlaps_metadata: usize,
    pub duplicate_original: usize,
    pub duplicate_spare: usize,
}

impl ResyncReport {
    pub fn dropped(&self) -> usize {
        self.out_of_range
            + self.overlaps_metadata
            + self.duplicate_original
            + self.duplicate_spare
    }
}

#[derive(Debug)]
pub struct RemapAllocator {
    main_sectors: u64,
    spare_sectors: u64,
    max_remaps: usize,
    reserved: Bitmap,
    used: Bitmap,
    /// Spares handed out by `allocate_spare` which are not yet in the table
    pending: BTreeSet<u64>,
    cursor: u64,
    entries: Vec<RemapEntry>,
    /// original sector -> position in `entries`
    index: BTreeMap<u64, usize>,
    dirty: bool,
    log: Logger,
}

impl RemapAllocator {
    pub fn new(
        main_sectors: u64,
        spare_sectors: u64,
        max_remaps: usize,
        log: &Logger,
    ) -> Self {
        RemapAllocator {
            main_sectors,
            spare_sectors,
            max_remaps,
            reserved: Bitmap::new(spare_sectors),
            used: Bitmap::new(spare_sectors),
            pending: BTreeSet::new(),
            cursor: 0,
            entries: Vec::new(),
            index: BTreeMap::new(),
            dirty: false,
            log: log.new(o!("task" => "allocator")),
        }
    }

    /// Marks each `[start, start + sectors_per_copy)` as metadata
    pub fn reserve_metadata_region(
        &mut self,
        copy_sectors: &[u64],
        sectors_per_copy: u64,
    ) -> Result<(), SpareError> {
        for &start in copy_sectors {
            let end = start.checked_add(sectors_per_copy);
            match end {
                Some(end) if end <= self.spare_sectors => {}
                _ => {
                    return Err(SpareError::SectorOutOfRange {
                        sector: start.saturating_add(sectors_per_copy) - 1,
                        count: self.spare_sectors,
                    })
                }
            }
            for s in start..start + sectors_per_copy {
                if self.used.get(s) || self.pending.contains(&s) {
                    spare_bail!(
                        GenericError,
                        "spare sector {} is in use and cannot be reserved",
                        s
                    );
                }
                self.reserved.set(s);
            }
        }
        Ok(())
    }

    pub fn is_reserved(&self, spare: u64) -> bool {
        spare < self.spare_sectors && self.reserved.get(spare)
    }

    fn is_free(&self, spare: u64) -> bool {
        !self.reserved.get(spare)
            && !self.used.get(spare)
            && !self.pending.contains(&spare)
    }

    /// Claims the next free spare sector at or after the cursor
    ///
    /// The sector stays claimed until it is either used by `add_remap` or
    /// handed back with `release_spare` / `retire_spare`.
    pub fn allocate_spare(&mut self) -> Result<u64, SpareError> {
        if self.spare_sectors == 0 {
            spare_bail!(SpareExhausted);
        }
        let start = self.cursor % self.spare_sectors;
        for i in 0..self.spare_sectors {
            let s = (start + i) % self.spare_sectors;
            if self.is_free(s) {
                self.pending.insert(s);
                return Ok(s);
            }
        }
        spare_bail!(SpareExhausted);
    }

    /// Returns an unused spare to the pool
    pub fn release_spare(&mut self, spare: u64) {
        self.pending.remove(&spare);
    }

    /// Takes a spare out of service without mapping anything to it; used
    /// when writing to the spare itself failed.
    pub fn retire_spare(&mut self, spare: u64) {
        self.pending.remove(&spare);
        if spare < self.spare_sectors {
            self.used.set(spare);
        }
        warn!(self.log, "retired spare sector {}", spare);
    }

    pub fn add_remap(&mut self, entry: RemapEntry) -> Result<(), SpareError> {
        if self.entries.len() >= self.max_remaps {
            return Err(SpareError::NoSpace(self.max_remaps));
        }
        if entry.original_sector >= self.main_sectors {
            return Err(SpareError::SectorOutOfRange {
                sector: entry.original_sector,
                count: self.main_sectors,
            });
        }
        if self.index.contains_key(&entry.original_sector) {
            return Err(SpareError::AlreadyRemapped(entry.original_sector));
        }
        let spare = entry.spare_sector;
        if spare >= self.spare_sectors {
            return Err(SpareError::SectorOutOfRange {
                sector: spare,
                count: self.spare_sectors,
            });
        }
        if self.reserved.get(spare) || self.used.get(spare) {
            spare_bail!(
                GenericError,
                "spare sector {} is not available for remapping",
                spare
            );
        }

        self.pending.remove(&spare);
        self.used.set(spare);
        self.cursor = (spare + 1) % self.spare_sectors;
        self.index.insert(entry.original_sector, self.entries.len());
        info!(
            self.log,
            "remapped {} -> {} ({})",
            entry.original_sector,
            spare,
            entry.reason
        );
        self.entries.push(entry);
        self.dirty = true;
        Ok(())
    }

    pub fn lookup(&self, original: u64) -> Option<&RemapEntry> {
        self.index.get(&original).map(|&i| &self.entries[i])
    }

    pub fn is_remapped(&self, original: u64) -> bool {
        self.index.contains_key(&original)
    }

    /// Bumps the counters of the entry for `original` and returns its spare
    pub fn record_access(&mut self, original: u64, error: bool) -> Option<u64> {
        let i = *self.index.get(&original)?;
        let e = &mut self.entries[i];
        e.access_count = e.access_count.saturating_add(1);
        if error {
            e.error_count = e.error_count.saturating_add(1);
        }
        Some(e.spare_sector)
    }

    pub fn entries(&self) -> &[RemapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_remaps
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of spare sectors that could still be allocated
    pub fn free_spares(&self) -> u64 {
        self.spare_sectors
            - self.reserved.count()
            - self.used.count()
            - self.pending.len() as u64
    }

    /// Returns whether the table changed since the last call, and clears the
    /// flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replaces the table with entries read back from disk
    ///
    /// Entries which no longer make sense on this device are dropped.  The
    /// metadata region must already be reserved.
    pub fn restore(&mut self, entries: Vec<RemapEntry>) -> ResyncReport {
        let mut report = ResyncReport::default();
        self.entries.clear();
        self.index.clear();
        self.pending.clear();
        self.used = Bitmap::new(self.spare_sectors);

        let mut last_spare = None;
        for e in entries {
            if e.original_sector >= self.main_sectors
                || e.spare_sector >= self.spare_sectors
            {
                report.out_of_range += 1;
            } else if self.reserved.get(e.spare_sector) {
                report.overlaps_metadata += 1;
            } else if self.index.contains_key(&e.original_sector) {
                report.duplicate_original += 1;
            } else if self.used.get(e.spare_sector) {
                report.duplicate_spare += 1;
            } else if self.entries.len() >= self.max_remaps {
                warn!(
                    self.log,
                    "remap table full on restore, dropping {} -> {}",
                    e.original_sector,
                    e.spare_sector
                );
                report.out_of_range += 1;
            } else {
                self.used.set(e.spare_sector);
                self.index.insert(e.original_sector, self.entries.len());
                last_spare = Some(e.spare_sector);
                self.entries.push(e);
                report.restored += 1;
            }
        }

        self.cursor = match last_spare {
            Some(s) => (s + 1) % self.spare_sectors,
            None => 0,
        };
        // A dropped entry means what is on disk is stale
        self.dirty = report.dropped() > 0;
        if report.dropped() > 0 {
            warn!(self.log, "remap resync dropped entries: {:?}", report);
        }
        report
    }
}
