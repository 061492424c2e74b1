// Copyright 2024 Oxide Computer Company
use std::io::{ErrorKind, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors produced by the remapping engine.
///
/// Only `NoSpace`, `SpareExhausted`, and `NoValidCopy` are expected to reach
/// an operator; everything else is handled (or logged) by the component that
/// produced it.
#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SpareError {
    #[error("IO Error: {0}")]
    IoError(String),

    #[error("sector {sector} out of range for device of {count} sectors")]
    SectorOutOfRange { sector: u64, count: u64 },

    #[error("remap table is full ({0} entries)")]
    NoSpace(usize),

    #[error("no free sectors left on the spare device")]
    SpareExhausted,

    #[error("sector {0} is already remapped")]
    AlreadyRemapped(u64),

    #[error("no valid metadata copy found")]
    NoValidCopy,

    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("rewrite of metadata copy {copy} failed after {attempts} attempts")]
    RepairFailed { copy: usize, attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background scanner is running")]
    ScannerBusy,

    #[error("Error: {0}")]
    GenericError(String),
}

impl SpareError {
    /// Returns true for errors which the operator has to act on, as opposed
    /// to errors which the engine recovers from by itself.
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            SpareError::NoSpace(_)
                | SpareError::SpareExhausted
                | SpareError::NoValidCopy
        )
    }
}

impl From<std::io::Error> for SpareError {
    fn from(e: std::io::Error) -> Self {
        SpareError::IoError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for SpareError {
    fn from(e: anyhow::Error) -> Self {
        SpareError::GenericError(format!("{:?}", e))
    }
}

impl From<bincode::Error> for SpareError {
    fn from(e: bincode::Error) -> Self {
        SpareError::MetadataCorrupt(format!("{}", e))
    }
}

#[macro_export]
macro_rules! spare_bail {
    ($i:ident) => { return Err(SpareError::$i) };
    ($i:ident, $str:expr) => {
        return Err(SpareError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err(SpareError::$i(format!($fmt, $($arg)*)))
    };
}

/// CRC-32 (ISO-HDLC) over the concatenation of `args`
///
/// This is the checksum used for every on-disk metadata record.
pub fn crc32(args: &[&[u8]]) -> u32 {
    let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = algo.digest();
    for arg in args {
        digest.update(arg);
    }
    digest.finalize()
}

pub fn build_logger() -> Logger {
    build_logger_with_level(slog::Level::Info)
}

/// Build a logger which writes to stdout
///
/// If stdout is a terminal the output is human readable; otherwise it is
/// bunyan-formatted JSON so that it can be processed by log tooling.
pub fn build_logger_with_level(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("sparemap", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let drain = slog::LevelFilter::new(main_drain, level).fuse();
    Logger::root(drain, o!())
}

/// Logger that drops everything, for tests
pub fn csl() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Reads a JSON file, or `None` if it does not exist
pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let bytes = match std::fs::read(file) {
        Ok(b) => b,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", file)),
    };
    let v = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {:?}", file))?;
    Ok(Some(v))
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    match read_json_maybe(file)? {
        Some(v) => Ok(v),
        None => bail!("{:?} does not exist", file),
    }
}

/// Writes `data` as pretty-printed JSON through a temporary file in the
/// same directory, then renames it into place.  Unless `clobber` is set an
/// existing `file` is an error.
pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => {
            mkdir_for_file(file)?;
            p
        }
        _ => Path::new("."),
    };

    let mut out = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut out, data)?;
    writeln!(out)?;
    out.as_file().sync_all()?;

    let placed = if clobber {
        out.persist(file).map(|_| ())
    } else {
        out.persist_noclobber(file).map(|_| ())
    };
    placed.with_context(|| format!("writing {:?}", file))
}

pub fn mkdir_for_file(file: &Path) -> Result<()> {
    let Some(parent) = file.parent() else {
        bail!("{:?} has no parent directory", file);
    };
    Ok(std::fs::create_dir_all(parent)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn crc32_matches_reference_value() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32(&[b"123456789"]), 0xCBF4_3926);
    }

    #[proptest]
    fn crc32_is_split_invariant(
        data: Vec<u8>,
        #[strategy(0..=#data.len())] at: usize,
    ) {
        let (a, b) = data.split_at(at);
        proptest::prop_assert_eq!(crc32(&[a, b]), crc32(&[&data]));
    }

    #[test]
    fn bail_macro_forms() {
        fn unit() -> Result<(), SpareError> {
            spare_bail!(NoValidCopy);
        }
        fn with_str() -> Result<(), SpareError> {
            spare_bail!(InvalidConfig, "bad");
        }
        fn with_fmt() -> Result<(), SpareError> {
            spare_bail!(IoError, "sector {} failed", 7);
        }
        assert_eq!(unit(), Err(SpareError::NoValidCopy));
        assert_eq!(with_str(), Err(SpareError::InvalidConfig("bad".into())));
        assert_eq!(
            with_fmt(),
            Err(SpareError::IoError("sector 7 failed".into()))
        );
    }

    #[test]
    fn operator_visible_errors() {
        assert!(SpareError::NoSpace(4).is_operator_visible());
        assert!(SpareError::SpareExhausted.is_operator_visible());
        assert!(SpareError::NoValidCopy.is_operator_visible());
        assert!(!SpareError::IoError("x".into()).is_operator_visible());
        assert!(!SpareError::MetadataCorrupt("x".into()).is_operator_visible());
    }

    #[test]
    fn json_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sub").join("report.json");
        mkdir_for_file(&path)?;

        let missing: Option<Vec<u64>> = read_json_maybe(&path)?;
        assert!(missing.is_none());

        write_json(&path, &vec![1u64, 2, 3], false)?;
        let back: Vec<u64> = read_json(&path)?;
        assert_eq!(back, vec![1, 2, 3]);

        // Refuses to clobber unless asked to
        assert!(write_json(&path, &vec![4u64], false).is_err());
        write_json(&path, &vec![4u64], true)?;
        let back: Vec<u64> = read_json(&path)?;
        assert_eq!(back, vec![4]);
        Ok(())
    }
}
