// Copyright 2024 Oxide Computer Company
//! Engine lifecycle: format, attach, remap, report, detach
//!
//! An [`Engine`] binds a main device to a spare device.  It owns the health
//! store, the allocator, and the metadata store, and drives the scanner and
//! repair tasks.
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{error, info, o, warn, Logger};
use uuid::Uuid;

use crate::allocator::{
    RemapAllocator, RemapEntry, RemapReason, ResyncReport, REMAP_FLAG_COPIED,
    REMAP_FLAG_DATA_LOST,
};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::device::{submit_and_wait, BlockDevice, IoDirection};
use crate::health::{HealthStore, HealthSummary, RiskLevel};
use crate::metadata::{encode, DeviceIdentity, MetadataSnapshot, HEADER_SIZE};
use crate::predict::predict;
use crate::remap_device::RemapDevice;
use crate::repair::{RepairCoordinator, RepairStats};
use crate::report::{AtRiskSector, HealthReport};
use crate::scanner::{
    CycleReport, LoadEstimator, RemapRequester, ScanStats, Scanner,
    ScannerState,
};
use crate::store::{CopyInspection, MetadataDelta, MetadataStore, RepairReport};
use crate::SpareError;

/// Spare sectors tried per remap before giving up
const SPARE_WRITE_ATTEMPTS: usize = 3;

/// What happened while attaching
#[derive(Clone, Debug, Default)]
pub struct AttachInfo {
    pub spare_id: Uuid,
    pub sequence_number: u64,
    pub resync: ResyncReport,
    pub repair: Option<RepairReport>,
}

pub(crate) struct EngineInner {
    pub(crate) main: Arc<dyn BlockDevice>,
    pub(crate) spare: Arc<dyn BlockDevice>,
    pub(crate) health: Arc<HealthStore>,
    pub(crate) allocator: Mutex<RemapAllocator>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) load: Arc<LoadEstimator>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Health summary found on disk at attach
    restored_health: HealthSummary,
    pub(crate) log: Logger,
}

impl EngineInner {
    pub(crate) async fn remap(
        &self,
        original: u64,
        reason: RemapReason,
    ) -> Result<u64, SpareError> {
        let count = self.main.sector_count();
        if original >= count {
            return Err(SpareError::SectorOutOfRange {
                sector: original,
                count,
            });
        }
        if self.allocator.lock().unwrap().is_remapped(original) {
            return Err(SpareError::AlreadyRemapped(original));
        }

        // Carry the old contents over if the sector still reads
        let mut data = vec![0u8; self.main.sector_size()];
        let mut flags = REMAP_FLAG_DATA_LOST;
        if reason != RemapReason::ReadError {
            let r = submit_and_wait(
                &*self.main,
                original,
                &mut data,
                IoDirection::Read,
            )
            .await;
            match r {
                Ok(()) => flags = REMAP_FLAG_COPIED,
                Err(e) => {
                    warn!(
                        self.log,
                        "sector {} unreadable during {} remap: {}",
                        original,
                        reason,
                        e
                    );
                    data.fill(0);
                }
            }
        }

        let mut spare = None;
        let mut last_err = SpareError::SpareExhausted;
        for _ in 0..SPARE_WRITE_ATTEMPTS {
            let s = self.allocator.lock().unwrap().allocate_spare()?;
            let r =
                submit_and_wait(&*self.spare, s, &mut data, IoDirection::Write)
                    .await;
            match r {
                Ok(()) => {
                    spare = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "write to spare sector {} failed: {}", s, e
                    );
                    self.allocator.lock().unwrap().retire_spare(s);
                    last_err = e;
                }
            }
        }
        let Some(spare) = spare else {
            error!(
                self.log,
                "could not remap sector {}: {}", original, last_err
            );
            return Err(last_err);
        };

        let entry = RemapEntry {
            original_sector: original,
            spare_sector: spare,
            creation_timestamp: self.clock.now(),
            access_count: 0,
            error_count: match reason {
                RemapReason::ReadError | RemapReason::WriteError => 1,
                RemapReason::Preventive | RemapReason::Manual => 0,
            },
            reason,
            flags,
        };
        let table = {
            let mut a = self.allocator.lock().unwrap();
            if let Err(e) = a.add_remap(entry) {
                a.release_spare(spare);
                return Err(e);
            }
            a.take_dirty();
            a.entries().to_vec()
        };

        self.store.apply(MetadataDelta::RemapTable(table))?;
        self.store.commit().await?;
        Ok(spare)
    }

    fn summary(&self, scan: &ScanStats) -> HealthSummary {
        let mut s = self.health.summary();
        s.scan_cursor = scan.cursor;
        s.scan_passes = scan.passes;
        s.coverage_percent = scan.coverage_percent;
        s
    }
}

#[async_trait]
impl RemapRequester for EngineInner {
    fn is_remapped(&self, sector: u64) -> bool {
        self.allocator.lock().unwrap().is_remapped(sector)
    }

    async fn request_remap(
        &self,
        sector: u64,
        reason: RemapReason,
    ) -> Result<u64, SpareError> {
        self.remap(sector, reason).await
    }
}

pub struct Engine {
    inner: Arc<EngineInner>,
    scanner: Scanner,
    repair: RepairCoordinator,
    config: EngineConfig,
    attach_info: AttachInfo,
    log: Logger,
}

impl Engine {
    /// Initializes `spare` for use with `main`, writing sequence 0 to every
    /// metadata copy.  Anything already on the spare is ignored.
    pub async fn format(
        main: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Result<Engine, SpareError> {
        config.validate()?;
        check_devices(&*main, &*spare)?;

        let identity = DeviceIdentity {
            spare_id: Uuid::new_v4(),
            main_sectors: main.sector_count(),
            spare_sectors: spare.sector_count(),
            sector_size: main.sector_size() as u32,
        };
        let snapshot = MetadataSnapshot {
            identity,
            remaps: Vec::new(),
            health: HealthSummary::default(),
            config: config.persisted(),
        };
        check_table_fits(&config, &snapshot, spare.sector_size())?;

        let store = Arc::new(MetadataStore::new(
            spare.clone(),
            &config.metadata,
            &config.repair,
            clock.clone(),
            log,
        )?);
        let seq = store.write_all_copies(&snapshot).await?;
        store.install(snapshot.clone());
        info!(
            log,
            "formatted spare {} for {} sectors ({} spare sectors, {} copies)",
            snapshot.identity.spare_id,
            snapshot.identity.main_sectors,
            snapshot.identity.spare_sectors,
            config.metadata.copy_sectors.len()
        );

        let info = AttachInfo {
            spare_id: snapshot.identity.spare_id,
            sequence_number: seq,
            ..Default::default()
        };
        Engine::assemble(
            main, spare, config, clock, log, store, &snapshot, info,
        )
    }

    /// Binds to a previously formatted spare
    ///
    /// The best metadata copy supplies the remap table, persisted settings,
    /// and scanner position.  Remap entries which don't fit this pair of
    /// devices are dropped.  If any copy was bad or behind, it is repaired
    /// before this returns.
    pub async fn attach(
        main: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        mut config: EngineConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Result<Engine, SpareError> {
        config.validate()?;
        check_devices(&*main, &*spare)?;

        let store = Arc::new(MetadataStore::new(
            spare.clone(),
            &config.metadata,
            &config.repair,
            clock.clone(),
            log,
        )?);
        let outcome = store.read_best_copy().await?;
        let snapshot = outcome.snapshot.clone();

        let id = &snapshot.identity;
        if id.main_sectors != main.sector_count()
            || id.spare_sectors != spare.sector_count()
            || id.sector_size as usize != main.sector_size()
        {
            return Err(SpareError::MetadataCorrupt(format!(
                "metadata is for {}x{} main / {} spare sectors, devices are \
                 {}x{} / {}",
                id.main_sectors,
                id.sector_size,
                id.spare_sectors,
                main.sector_count(),
                main.sector_size(),
                spare.sector_count()
            )));
        }

        config.apply_persisted(&snapshot.config);
        config.validate()?;
        store.install(snapshot.clone());

        let info = AttachInfo {
            spare_id: id.spare_id,
            sequence_number: outcome.sequence_number,
            ..Default::default()
        };
        let mut engine = Engine::assemble(
            main, spare, config, clock, log, store, &snapshot, info,
        )?;

        if outcome.needs_repair() {
            let report = engine.repair.run_once().await;
            if let Some(e) = &report.fatal {
                return Err(e.clone());
            }
            engine.attach_info.repair = Some(report);
        }

        let dirty = engine.inner.allocator.lock().unwrap().take_dirty();
        if dirty {
            let table =
                engine.inner.allocator.lock().unwrap().entries().to_vec();
            engine.inner.store.apply(MetadataDelta::RemapTable(table))?;
            engine.inner.store.commit().await?;
        }

        info!(
            engine.log,
            "attached spare {} at seq {}: {} remaps, scan cursor {}",
            engine.attach_info.spare_id,
            engine.attach_info.sequence_number,
            engine.attach_info.resync.restored,
            snapshot.health.scan_cursor
        );
        Ok(engine)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        main: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
        store: Arc<MetadataStore>,
        snapshot: &MetadataSnapshot,
        mut attach_info: AttachInfo,
    ) -> Result<Engine, SpareError> {
        let health = Arc::new(HealthStore::new(
            main.sector_count(),
            &config.health,
            clock.clone(),
            log,
        ));

        let mut allocator = RemapAllocator::new(
            main.sector_count(),
            spare.sector_count(),
            config.metadata.max_remaps,
            log,
        );
        allocator.reserve_metadata_region(
            &config.metadata.copy_sectors,
            config.metadata.sectors_per_copy,
        )?;
        attach_info.resync = allocator.restore(snapshot.remaps.clone());

        let load = Arc::new(LoadEstimator::new(
            config.scanner.high_load_iops,
            clock.instant(),
        ));

        let inner = Arc::new(EngineInner {
            main: main.clone(),
            spare,
            health: health.clone(),
            allocator: Mutex::new(allocator),
            store: store.clone(),
            load: load.clone(),
            clock: clock.clone(),
            restored_health: snapshot.health.clone(),
            log: log.new(o!("task" => "remap")),
        });

        let scanner = Scanner::new(
            main,
            health,
            inner.clone(),
            load,
            clock,
            &config.scanner,
            snapshot.health.scan_cursor,
            snapshot.health.scan_passes,
            log,
        );
        let repair = RepairCoordinator::new(
            store,
            Duration::from_secs(config.repair.scrub_interval_secs),
            log,
        );

        Ok(Engine {
            inner,
            scanner,
            repair,
            config,
            attach_info,
            log: log.new(o!("task" => "engine")),
        })
    }

    /// Starts the scanner and the metadata scrub
    pub fn start(&self) {
        self.scanner.start();
        self.repair.start();
    }

    pub fn pause_scanner(&self) {
        self.scanner.pause();
    }

    pub fn resume_scanner(&self) {
        self.scanner.start();
    }

    /// Stops background work and persists a final snapshot
    pub async fn detach(self) -> Result<(), SpareError> {
        self.scanner.stop().await;
        self.repair.stop().await;
        let seq = self.flush_metadata().await?;
        self.inner.main.flush().await?;
        info!(self.log, "detached"; "final_seq" => seq);
        Ok(())
    }

    /// Moves `original` to a spare sector
    pub async fn remap(
        &self,
        original: u64,
        reason: RemapReason,
    ) -> Result<u64, SpareError> {
        self.inner.remap(original, reason).await
    }

    pub fn lookup(&self, original: u64) -> Option<RemapEntry> {
        self.inner.allocator.lock().unwrap().lookup(original).cloned()
    }

    pub fn remaps(&self) -> Vec<RemapEntry> {
        self.inner.allocator.lock().unwrap().entries().to_vec()
    }

    /// Writes the current remap table and health summary to every copy.
    /// Returns the sequence number written.
    pub async fn flush_metadata(&self) -> Result<u64, SpareError> {
        let summary = self.inner.summary(&self.scanner.stats());
        let table = {
            let mut a = self.inner.allocator.lock().unwrap();
            a.take_dirty();
            a.entries().to_vec()
        };
        let store = &self.inner.store;
        store.apply(MetadataDelta::RemapTable(table))?;
        store.apply(MetadataDelta::HealthSummary(summary))?;
        store.apply(MetadataDelta::Config(self.config.persisted()))?;
        match store.commit().await? {
            Some(seq) => Ok(seq),
            None => Ok(store.next_sequence().saturating_sub(1)),
        }
    }

    /// Trims the health map down to the configured limit
    pub fn compact_health(&self) -> usize {
        self.inner.health.compact(self.config.health.max_records)
    }

    pub async fn run_scan_cycle(&self) -> Result<CycleReport, SpareError> {
        self.scanner.run_cycle().await
    }

    pub async fn run_repair(&self) -> RepairReport {
        self.repair.run_once().await
    }

    pub async fn inspect_metadata(&self) -> Vec<CopyInspection> {
        self.inner.store.inspect().await
    }

    /// Block device which sends remapped sectors to the spare and feeds
    /// every I/O result back into the health store
    pub fn device(&self) -> RemapDevice {
        RemapDevice::new(self.inner.clone())
    }

    pub fn health(&self) -> &HealthStore {
        &self.inner.health
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn attach_info(&self) -> &AttachInfo {
        &self.attach_info
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.scanner.state()
    }

    pub fn scan_stats(&self) -> ScanStats {
        self.scanner.stats()
    }

    pub fn repair_stats(&self) -> RepairStats {
        self.repair.stats()
    }

    /// Current health, with the `top_n` most at-risk sectors
    pub fn report(&self, top_n: usize) -> HealthReport {
        let scan = self.scanner.stats();
        let summary = self.inner.summary(&scan);
        let now = self.inner.clock.now();
        let health = &self.inner.health;
        let th = health.thresholds();

        let (remapped, remaps, capacity, free_spares) = {
            let a = self.inner.allocator.lock().unwrap();
            let remapped: BTreeSet<u64> =
                a.entries().iter().map(|e| e.original_sector).collect();
            (remapped, a.len(), a.capacity(), a.free_spares())
        };

        let mut at_risk: Vec<AtRiskSector> = health
            .iter()
            .filter(|(s, r)| {
                (r.risk_level != RiskLevel::Safe || r.total_errors() > 0)
                    && !remapped.contains(s)
            })
            .map(|(sector, r)| AtRiskSector {
                sector,
                health_score: r.health_score,
                risk_level: r.risk_level,
                prediction: predict(&r, &th, now),
            })
            .collect();
        at_risk.sort_by_key(|a| {
            (Reverse(a.prediction.failure_probability), a.sector)
        });
        at_risk.dedup_by_key(|a| a.sector);
        at_risk.truncate(top_n);

        HealthReport {
            generated_at: now,
            spare_id: self.attach_info.spare_id,
            total_scans: health.counters().scans(),
            sectors_scanned: scan.sectors_scanned,
            active_warnings: summary.active_warnings,
            high_risk_sectors: summary.high_risk_sectors,
            coverage_percent: scan.coverage_percent,
            scanner_state: self.scanner.state(),
            summary,
            last_persisted: self.inner.restored_health.clone(),
            remaps,
            remap_capacity: capacity,
            free_spares,
            metadata_sequence: self
                .inner
                .store
                .next_sequence()
                .saturating_sub(1),
            scan,
            repair: self.repair.stats(),
            at_risk,
        }
    }
}

fn check_devices(
    main: &dyn BlockDevice,
    spare: &dyn BlockDevice,
) -> Result<(), SpareError> {
    if main.sector_size() != spare.sector_size() {
        return Err(SpareError::InvalidConfig(format!(
            "main sector size {} differs from spare sector size {}",
            main.sector_size(),
            spare.sector_size()
        )));
    }
    if main.sector_count() == 0 || spare.sector_count() == 0 {
        return Err(SpareError::InvalidConfig("empty device".to_string()));
    }
    Ok(())
}

/// Makes sure a full remap table still fits in one metadata copy
fn check_table_fits(
    config: &EngineConfig,
    snapshot: &MetadataSnapshot,
    sector_size: usize,
) -> Result<(), SpareError> {
    let mut full = snapshot.clone();
    full.remaps = vec![
        RemapEntry {
            original_sector: u64::MAX,
            spare_sector: u64::MAX,
            creation_timestamp: u64::MAX,
            access_count: u32::MAX,
            error_count: u32::MAX,
            reason: RemapReason::Manual,
            flags: u32::MAX,
        };
        config.metadata.max_remaps
    ];
    let copy_bytes = config.metadata.sectors_per_copy as usize * sector_size;
    encode(&full, 0, 0, 0, copy_bytes).map_err(|_| {
        SpareError::InvalidConfig(format!(
            "{} remap entries do not fit in a {} byte metadata copy \
             ({} byte header)",
            config.metadata.max_remaps, copy_bytes, HEADER_SIZE
        ))
    })?;
    Ok(())
}
