// Copyright 2024 Oxide Computer Company
//! The main device as seen through the remap table
//!
//! I/O is split into single sectors.  Remapped sectors go to the spare
//! device; everything else goes to the main device, and the outcome is
//! recorded in the health store.  A failed write is remapped and retried on
//! the new spare.  A failed read is remapped too, but the error still goes
//! back to the caller since the data is gone.
use std::sync::Arc;

use async_trait::async_trait;
use slog::{error, warn};

use crate::allocator::RemapReason;
use crate::device::{check_io, submit_and_wait, BlockDevice, IoDirection};
use crate::engine::EngineInner;
use crate::SpareError;

pub struct RemapDevice {
    inner: Arc<EngineInner>,
}

impl RemapDevice {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        RemapDevice { inner }
    }

    fn spare_for(&self, sector: u64) -> Option<u64> {
        self.inner
            .allocator
            .lock()
            .unwrap()
            .lookup(sector)
            .map(|e| e.spare_sector)
    }

    fn note_spare_access(&self, sector: u64, failed: bool) {
        self.inner
            .allocator
            .lock()
            .unwrap()
            .record_access(sector, failed);
    }

    async fn spare_io(
        &self,
        original: u64,
        spare: u64,
        buf: &mut [u8],
        dir: IoDirection,
    ) -> Result<(), SpareError> {
        let r = submit_and_wait(&*self.inner.spare, spare, buf, dir).await;
        self.note_spare_access(original, r.is_err());
        if let Err(e) = &r {
            error!(
                self.inner.log,
                "{:?} of sector {} on spare {} failed: {}",
                dir,
                original,
                spare,
                e
            );
        }
        r
    }

    async fn read_one(
        &self,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<(), SpareError> {
        if let Some(spare) = self.spare_for(sector) {
            return self.spare_io(sector, spare, buf, IoDirection::Read).await;
        }

        match submit_and_wait(&*self.inner.main, sector, buf, IoDirection::Read)
            .await
        {
            Ok(()) => {
                self.inner.health.update(sector, true, true);
                Ok(())
            }
            Err(e) => {
                self.inner.health.update(sector, false, true);
                warn!(self.inner.log, "read error at sector {}: {}", sector, e);
                if let Err(re) =
                    self.inner.remap(sector, RemapReason::ReadError).await
                {
                    warn!(self.inner.log, "remap of {} failed: {}", sector, re);
                }
                Err(e)
            }
        }
    }

    async fn write_one(
        &self,
        sector: u64,
        buf: &[u8],
    ) -> Result<(), SpareError> {
        let mut data = buf.to_vec();
        if let Some(spare) = self.spare_for(sector) {
            return self
                .spare_io(sector, spare, &mut data, IoDirection::Write)
                .await;
        }

        let e = match submit_and_wait(
            &*self.inner.main,
            sector,
            &mut data,
            IoDirection::Write,
        )
        .await
        {
            Ok(()) => {
                self.inner.health.update(sector, true, true);
                return Ok(());
            }
            Err(e) => e,
        };

        self.inner.health.update(sector, true, false);
        warn!(self.inner.log, "write error at sector {}: {}", sector, e);
        let remapped =
            self.inner.remap(sector, RemapReason::WriteError).await;
        let spare = match remapped {
            Ok(spare) => spare,
            // Someone else got there first
            Err(SpareError::AlreadyRemapped(_)) => {
                match self.spare_for(sector) {
                    Some(spare) => spare,
                    None => return Err(e),
                }
            }
            Err(re) => {
                error!(self.inner.log, "remap of {} failed: {}", sector, re);
                return Err(e);
            }
        };
        self.spare_io(sector, spare, &mut data, IoDirection::Write)
            .await
    }
}

#[async_trait]
impl BlockDevice for RemapDevice {
    fn sector_size(&self) -> usize {
        self.inner.main.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.inner.main.sector_count()
    }

    async fn read(
        &self,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<(), SpareError> {
        let ss = self.sector_size();
        check_io(ss, self.sector_count(), sector, buf.len())?;
        self.inner.load.note_io(self.inner.clock.instant());

        for (i, chunk) in buf.chunks_mut(ss).enumerate() {
            self.read_one(sector + i as u64, chunk).await?;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), SpareError> {
        let ss = self.sector_size();
        check_io(ss, self.sector_count(), sector, buf.len())?;
        self.inner.load.note_io(self.inner.clock.instant());

        for (i, chunk) in buf.chunks(ss).enumerate() {
            self.write_one(sector + i as u64, chunk).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SpareError> {
        self.inner.main.flush().await?;
        self.inner.spare.flush().await
    }
}
