// Copyright 2024 Oxide Computer Company
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health::{HealthSummary, RiskLevel};
use crate::predict::FailurePrediction;
use crate::repair::RepairStats;
use crate::scanner::{ScanStats, ScannerState};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtRiskSector {
    pub sector: u64,
    pub health_score: u32,
    pub risk_level: RiskLevel,
    pub prediction: FailurePrediction,
}

/// Point-in-time view of the engine, suitable for export
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: u64,
    pub spare_id: Uuid,
    pub total_scans: u64,
    pub sectors_scanned: u64,
    pub active_warnings: u64,
    pub high_risk_sectors: u64,
    pub coverage_percent: u32,
    pub scanner_state: ScannerState,
    pub summary: HealthSummary,
    /// The summary as it was found on disk at attach
    pub last_persisted: HealthSummary,
    pub remaps: usize,
    pub remap_capacity: usize,
    pub free_spares: u64,
    pub metadata_sequence: u64,
    pub scan: ScanStats,
    pub repair: RepairStats,
    /// Highest failure probability first
    pub at_risk: Vec<AtRiskSector>,
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "spare {}  metadata seq {}",
            self.spare_id, self.metadata_sequence
        )?;
        writeln!(
            f,
            "scanner {:<8} coverage {:>3}%  passes {}  scanned {}  probes {}",
            self.scanner_state.to_string(),
            self.coverage_percent,
            self.scan.passes,
            self.sectors_scanned,
            self.total_scans,
        )?;
        writeln!(
            f,
            "tracked {}  avg score {}  read errs {}  write errs {}",
            self.summary.tracked_sectors,
            self.summary.average_score,
            self.summary.total_read_errors,
            self.summary.total_write_errors,
        )?;
        writeln!(
            f,
            "warnings {}  high risk {}  remaps {}/{}  free spares {}",
            self.active_warnings,
            self.high_risk_sectors,
            self.remaps,
            self.remap_capacity,
            self.free_spares,
        )?;
        writeln!(
            f,
            "scrubs {}  copies repaired {}  failed {}",
            self.repair.runs,
            self.repair.copies_repaired,
            self.repair.copies_failed,
        )?;

        if self.at_risk.is_empty() {
            return writeln!(f, "no sectors at risk");
        }
        writeln!(
            f,
            "{:>12} {:>5} {:>7} {:>4} {:>4} {:>3}  REASON",
            "SECTOR", "SCORE", "RISK", "P%", "CONF", "SEV"
        )?;
        for a in &self.at_risk {
            writeln!(
                f,
                "{:>12} {:>5} {:>7} {:>4} {:>4} {:>3}  {}",
                a.sector,
                a.health_score,
                format!("{:?}", a.risk_level),
                a.prediction.failure_probability,
                a.prediction.confidence_level,
                a.prediction.severity.level(),
                a.prediction.reason,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::predict::{FailureReason, Severity};

    fn report(at_risk: Vec<AtRiskSector>) -> HealthReport {
        HealthReport {
            generated_at: 10,
            spare_id: Uuid::nil(),
            total_scans: 4,
            sectors_scanned: 4,
            active_warnings: 1,
            high_risk_sectors: 0,
            coverage_percent: 50,
            scanner_state: ScannerState::Paused,
            summary: HealthSummary::default(),
            last_persisted: HealthSummary::default(),
            remaps: 0,
            remap_capacity: 8,
            free_spares: 20,
            metadata_sequence: 3,
            scan: ScanStats::default(),
            repair: RepairStats::default(),
            at_risk,
        }
    }

    #[test]
    fn display_without_risk() {
        let s = report(Vec::new()).to_string();
        assert!(s.contains("metadata seq 3"));
        assert!(s.contains("Paused"));
        assert!(s.ends_with("no sectors at risk\n"));
    }

    #[test]
    fn display_lists_sectors() {
        let s = report(vec![AtRiskSector {
            sector: 4242,
            health_score: 510,
            risk_level: RiskLevel::Caution,
            prediction: FailurePrediction {
                failure_probability: 33,
                confidence_level: 60,
                severity: Severity::Medium,
                estimated_failure_time: 99,
                reason: FailureReason::ReadErrorPattern,
            },
        }])
        .to_string();
        let line = s.lines().last().unwrap();
        assert!(line.contains("4242"));
        assert!(line.contains("Caution"));
        assert!(line.ends_with("read error pattern"));
    }

    #[test]
    fn json_export() {
        let r = report(Vec::new());
        let j = serde_json::to_string(&r).unwrap();
        let back: HealthReport = serde_json::from_str(&j).unwrap();
        assert_eq!(back, r);
    }
}
