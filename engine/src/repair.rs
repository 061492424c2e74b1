// Copyright 2024 Oxide Computer Company
//! Runs a task which scrubs the metadata copies
//!
//! The task repairs on a fixed interval, and also right away whenever a read
//! of the metadata turns up a bad or lagging copy.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{error, info, o, warn, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::{MetadataStore, RepairReport};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairStats {
    pub runs: u64,
    pub copies_repaired: u64,
    pub copies_failed: u64,
    pub fatal_runs: u64,
    pub last_report: Option<RepairReport>,
}

pub struct RepairCoordinator {
    store: Arc<MetadataStore>,
    interval: Duration,
    stats: Arc<Mutex<RepairStats>>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl RepairCoordinator {
    pub fn new(
        store: Arc<MetadataStore>,
        interval: Duration,
        log: &Logger,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        RepairCoordinator {
            store,
            interval,
            stats: Arc::new(Mutex::new(RepairStats::default())),
            stop_tx,
            handle: Mutex::new(None),
            log: log.new(o!("task" => "repair")),
        }
    }

    pub fn stats(&self) -> RepairStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Runs one scrub now, on the caller's task
    pub async fn run_once(&self) -> RepairReport {
        scrub(&self.store, &self.stats, &self.log).await
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.stop_tx.send_replace(false);
        let rx = self.stop_tx.subscribe();
        let store = self.store.clone();
        let stats = self.stats.clone();
        let interval = self.interval;
        let log = self.log.clone();
        *handle = Some(tokio::spawn(async move {
            repair_task(store, stats, interval, rx, log).await
        }));
    }

    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(self.log, "repair task failed: {}", e);
            }
        }
    }
}

async fn repair_task(
    store: Arc<MetadataStore>,
    stats: Arc<Mutex<RepairStats>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    log: Logger,
) {
    info!(log, "metadata scrub every {:?}", interval);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = store.corruption_detected() => {
                info!(log, "metadata corruption reported, repairing");
            }
            r = stop.changed() => {
                if r.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        scrub(&store, &stats, &log).await;
    }
    info!(log, "metadata scrub task exiting");
}

async fn scrub(
    store: &MetadataStore,
    stats: &Mutex<RepairStats>,
    log: &Logger,
) -> RepairReport {
    let report = store.repair().await;

    if let Some(e) = &report.fatal {
        error!(log, "metadata scrub found no usable copy: {}", e);
    } else if !report.failed.is_empty() {
        warn!(log, "metadata copies {:?} could not be repaired", report.failed);
    }

    let mut s = stats.lock().unwrap();
    s.runs += 1;
    s.copies_repaired += report.repaired.len() as u64;
    s.copies_failed += report.failed.len() as u64;
    if report.fatal.is_some() {
        s.fatal_runs += 1;
    }
    s.last_report = Some(report.clone());
    report
}
