// Copyright 2024 Oxide Computer Company
//! Block devices
//!
//! The engine does not issue I/O itself beyond what goes through
//! [`BlockDevice`].  Two implementations live here: [`FileBlockDevice`] for
//! files and block special files, and [`InMemoryDevice`], which can be told
//! to fail or corrupt individual sectors.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{spare_bail, SpareError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A device addressed in fixed-size sectors
///
/// Buffers passed to `read` and `write` must be a non-zero multiple of the
/// sector size, and the whole range must fit on the device.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    fn sector_size(&self) -> usize;

    fn sector_count(&self) -> u64;

    async fn read(&self, sector: u64, buf: &mut [u8])
        -> Result<(), SpareError>;

    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), SpareError>;

    async fn flush(&self) -> Result<(), SpareError>;
}

/// Issue one I/O to `dev` and wait for it to complete
pub async fn submit_and_wait(
    dev: &dyn BlockDevice,
    sector: u64,
    buf: &mut [u8],
    dir: IoDirection,
) -> Result<(), SpareError> {
    match dir {
        IoDirection::Read => dev.read(sector, buf).await,
        IoDirection::Write => dev.write(sector, buf).await,
    }
}

/// Checks that `len` bytes at `sector` is a valid I/O for the device,
/// returning the number of sectors covered.
pub fn check_io(
    sector_size: usize,
    sector_count: u64,
    sector: u64,
    len: usize,
) -> Result<u64, SpareError> {
    if len == 0 || len % sector_size != 0 {
        spare_bail!(
            IoError,
            "buffer of {} bytes is not a multiple of sector size {}",
            len,
            sector_size
        );
    }
    let n = (len / sector_size) as u64;
    match sector.checked_add(n) {
        Some(end) if end <= sector_count => Ok(n),
        _ => Err(SpareError::SectorOutOfRange {
            sector: sector.saturating_add(n - 1),
            count: sector_count,
        }),
    }
}

/// Sectors backed by a file (or a block special file)
///
/// Positioned reads and writes are issued directly; `FileExt` needs no
/// shared cursor, so there is no lock here.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    sector_size: usize,
    sector_count: u64,
}

impl FileBlockDevice {
    /// Creates (or truncates) `path` to hold `sector_count` sectors
    pub fn create(
        path: &Path,
        sector_size: usize,
        sector_count: u64,
    ) -> Result<Self, SpareError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sector_size as u64 * sector_count)?;
        Ok(FileBlockDevice {
            file,
            sector_size,
            sector_count,
        })
    }

    /// Opens an existing file; its length must be a whole number of sectors
    pub fn open(path: &Path, sector_size: usize) -> Result<Self, SpareError> {
        if sector_size == 0 {
            spare_bail!(InvalidConfig, "sector size must be non-zero");
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % sector_size as u64 != 0 {
            spare_bail!(
                InvalidConfig,
                "{:?} is {} bytes, not a multiple of {}",
                path,
                len,
                sector_size
            );
        }
        Ok(FileBlockDevice {
            file,
            sector_size,
            sector_count: len / sector_size as u64,
        })
    }
}

#[async_trait]
impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    async fn read(
        &self,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<(), SpareError> {
        check_io(self.sector_size, self.sector_count, sector, buf.len())?;
        self.file
            .read_exact_at(buf, sector * self.sector_size as u64)?;
        Ok(())
    }

    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), SpareError> {
        check_io(self.sector_size, self.sector_count, sector, buf.len())?;
        self.file.write_all_at(buf, sector * self.sector_size as u64)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SpareError> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Sectors which fail every read
    bad_reads: BTreeSet<u64>,
    /// Sectors which fail every write
    bad_writes: BTreeSet<u64>,
    /// Sectors which fail the next N reads, then recover
    transient_reads: BTreeMap<u64, u32>,
    /// Writes left before every write fails; `None` means unlimited
    writes_until_failure: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    faults: Faults,
    reads: u64,
    writes: u64,
}

/// Memory-backed device with fault injection
#[derive(Debug)]
pub struct InMemoryDevice {
    sector_size: usize,
    sector_count: u64,
    inner: Mutex<Inner>,
}

impl InMemoryDevice {
    pub fn new(sector_size: usize, sector_count: u64) -> Self {
        InMemoryDevice {
            sector_size,
            sector_count,
            inner: Mutex::new(Inner {
                bytes: vec![0; sector_size * sector_count as usize],
                faults: Faults::default(),
                reads: 0,
                writes: 0,
            }),
        }
    }

    /// Every read touching `sector` fails until [`heal`](Self::heal)
    pub fn fail_reads(&self, sector: u64) {
        self.inner.lock().unwrap().faults.bad_reads.insert(sector);
    }

    /// Every write touching `sector` fails until [`heal`](Self::heal)
    pub fn fail_writes(&self, sector: u64) {
        self.inner.lock().unwrap().faults.bad_writes.insert(sector);
    }

    /// The next `count` reads touching `sector` fail
    pub fn fail_reads_transiently(&self, sector: u64, count: u32) {
        self.inner
            .lock()
            .unwrap()
            .faults
            .transient_reads
            .insert(sector, count);
    }

    /// After `count` more successful writes, every write fails
    pub fn fail_writes_after(&self, count: Option<u64>) {
        self.inner.lock().unwrap().faults.writes_until_failure = count;
    }

    pub fn heal(&self, sector: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.bad_reads.remove(&sector);
        inner.faults.bad_writes.remove(&sector);
        inner.faults.transient_reads.remove(&sector);
    }

    /// XOR `mask` into one byte on the device, bypassing fault injection
    pub fn corrupt(&self, sector: u64, offset: usize, mask: u8) {
        assert!(offset < self.sector_size);
        let mut inner = self.inner.lock().unwrap();
        let at = sector as usize * self.sector_size + offset;
        inner.bytes[at] ^= mask;
    }

    /// Copy of one sector, bypassing fault injection
    pub fn raw_sector(&self, sector: u64) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let at = sector as usize * self.sector_size;
        inner.bytes[at..at + self.sector_size].to_vec()
    }

    /// Overwrites one sector, bypassing fault injection
    pub fn set_raw_sector(&self, sector: u64, data: &[u8]) {
        assert_eq!(data.len(), self.sector_size);
        let mut inner = self.inner.lock().unwrap();
        let at = sector as usize * self.sector_size;
        inner.bytes[at..at + self.sector_size].copy_from_slice(data);
    }

    /// Number of (read, write) calls seen so far, including failed ones
    pub fn io_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.reads, inner.writes)
    }
}

#[async_trait]
impl BlockDevice for InMemoryDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    async fn read(
        &self,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<(), SpareError> {
        let n =
            check_io(self.sector_size, self.sector_count, sector, buf.len())?;
        let mut inner = self.inner.lock().unwrap();
        inner.reads += 1;

        for s in sector..sector + n {
            if inner.faults.bad_reads.contains(&s) {
                spare_bail!(IoError, "read error at sector {}", s);
            }
            if let Some(left) = inner.faults.transient_reads.get_mut(&s) {
                if *left > 0 {
                    *left -= 1;
                    spare_bail!(
                        IoError,
                        "transient read error at sector {}",
                        s
                    );
                }
            }
        }

        let at = sector as usize * self.sector_size;
        buf.copy_from_slice(&inner.bytes[at..at + buf.len()]);
        Ok(())
    }

    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), SpareError> {
        let n =
            check_io(self.sector_size, self.sector_count, sector, buf.len())?;
        let mut inner = self.inner.lock().unwrap();
        inner.writes += 1;

        if let Some(left) = inner.faults.writes_until_failure.as_mut() {
            if *left == 0 {
                spare_bail!(IoError, "device refuses writes");
            }
            *left -= 1;
        }
        for s in sector..sector + n {
            if inner.faults.bad_writes.contains(&s) {
                spare_bail!(IoError, "write error at sector {}", s);
            }
        }

        let at = sector as usize * self.sector_size;
        inner.bytes[at..at + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SpareError> {
        Ok(())
    }
}
