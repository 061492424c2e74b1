// Copyright 2024 Oxide Computer Company
//! Sector health tracking and bad-sector remapping onto a spare device
//!
//! An [`Engine`] sits between a main block device and a smaller spare
//! device.  A background scanner probes the main device and scores every
//! sector; sectors which fail, or which look likely to fail, are remapped to
//! the spare.  The remap table lives in several checksummed copies on the
//! spare and is scrubbed and repaired in the background.
pub use sparemap_common::*;

pub mod allocator;
pub mod clock;
pub mod config;
pub mod device;
mod engine;
pub mod health;
pub mod metadata;
pub mod predict;
pub mod remap_device;
pub mod repair;
pub mod report;
pub mod scanner;
pub mod store;

pub use allocator::{RemapEntry, RemapReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use device::{
    submit_and_wait, BlockDevice, FileBlockDevice, InMemoryDevice, IoDirection,
};
pub use engine::{AttachInfo, Engine};
pub use report::HealthReport;
pub use scanner::ScannerState;
