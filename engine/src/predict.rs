// Copyright 2024 Oxide Computer Company
//! Failure prediction
//!
//! Everything here is a pure function of a [`SectorHealthRecord`], the
//! thresholds it was scored against, and the current wall-clock time.
use serde::{Deserialize, Serialize};

use crate::clock::{SECS_PER_DAY, SECS_PER_HOUR};
use crate::health::{HealthThresholds, SectorHealthRecord, MAX_HEALTH_SCORE};

const MIN_TTF_SECS: u64 = SECS_PER_HOUR;
const MAX_TTF_SECS: u64 = 365 * SECS_PER_DAY;

/// Below these sample counts the confidence is discounted
const MIN_SCAN_SAMPLES: u32 = 3;
const MIN_ACCESS_SAMPLES: u64 = 10;
const MIN_CONFIDENCE: u32 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    /// Errors per thousand accesses, doubled for recently active sectors
    pub error_rate_trend: u64,
    /// Distance from a perfect score, damped by the number of scans
    pub health_score_slope: u64,
    /// 0-100
    pub access_pattern_score: u32,
    /// 0-100; how much the other figures can be trusted
    pub reliability_score: u32,
}

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
pub enum Severity {
    Low = 1,
    Medium = 4,
    High = 7,
    Critical = 9,
}

impl Severity {
    pub fn from_probability(p: u32) -> Self {
        match p {
            80.. => Severity::Critical,
            50..=79 => Severity::High,
            20..=49 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    ReadErrorPattern,
    WriteErrorPattern,
    MediaDegradation,
    RapidDecline,
    IncreasingErrors,
    CriticalThreshold,
    AccessPattern,
    GenericDegradation,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::ReadErrorPattern => "read error pattern",
            FailureReason::WriteErrorPattern => "write error pattern",
            FailureReason::MediaDegradation => "media degradation",
            FailureReason::RapidDecline => "rapid health decline",
            FailureReason::IncreasingErrors => "increasing error trend",
            FailureReason::CriticalThreshold => "below critical threshold",
            FailureReason::AccessPattern => "abnormal access pattern",
            FailureReason::GenericDegradation => "generic degradation",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePrediction {
    /// 0-100
    pub failure_probability: u32,
    /// 0-100
    pub confidence_level: u32,
    pub severity: Severity,
    /// Seconds since the Unix epoch
    pub estimated_failure_time: u64,
    pub reason: FailureReason,
}

pub fn analyze_trend(rec: &SectorHealthRecord, now: u64) -> TrendAnalysis {
    let errors = rec.total_errors();

    let mut error_rate_trend = if rec.access_count > 0 {
        errors.saturating_mul(1000) / rec.access_count
    } else {
        0
    };
    if rec.last_access_time != 0
        && now.saturating_sub(rec.last_access_time) < SECS_PER_HOUR
    {
        error_rate_trend = error_rate_trend.saturating_mul(2);
    }

    let mut health_score_slope =
        u64::from(MAX_HEALTH_SCORE.saturating_sub(rec.health_score));
    if rec.scan_count > 5 {
        health_score_slope = health_score_slope * 5 / u64::from(rec.scan_count);
    }

    let access_pattern_score = (rec.access_count / 1000)
        .saturating_add(errors.saturating_mul(5))
        .min(100) as u32;

    let mut reliability_score: u32 = 50;
    if rec.scan_count >= 10 {
        reliability_score += 30;
    }
    if rec.access_count >= 50 {
        reliability_score += 20;
    }
    if now.saturating_sub(rec.first_seen) < 7 * SECS_PER_DAY {
        reliability_score = reliability_score.saturating_sub(30).max(20);
    }

    TrendAnalysis {
        error_rate_trend,
        health_score_slope,
        access_pattern_score,
        reliability_score,
    }
}

pub fn failure_probability(
    rec: &SectorHealthRecord,
    trend: &TrendAnalysis,
    th: &HealthThresholds,
) -> u32 {
    let base: u64 = if rec.health_score >= th.warning {
        5
    } else if rec.health_score >= th.danger {
        20
    } else {
        50
    };
    let err_term = (trend.error_rate_trend / 5).min(40);
    let slope_term = (trend.health_score_slope / 10).min(30);
    let access_term =
        (u64::from(trend.access_pattern_score) * 30 / 100).min(30);

    let raw = base + err_term + slope_term + access_term;
    (raw * u64::from(trend.reliability_score) / 100).min(100) as u32
}

/// Seconds until the sector is expected to fail
pub fn time_to_failure(
    rec: &SectorHealthRecord,
    trend: &TrendAnalysis,
    probability: u32,
    now: u64,
) -> u64 {
    if trend.health_score_slope == 0 && trend.error_rate_trend == 0 {
        return match probability {
            80.. => 7 * SECS_PER_DAY,
            50..=79 => 30 * SECS_PER_DAY,
            20..=49 => 90 * SECS_PER_DAY,
            _ => 365 * SECS_PER_DAY,
        };
    }

    // Health points lost per day
    let age_days = (now.saturating_sub(rec.first_seen) / SECS_PER_DAY).max(1);
    let rate =
        trend.health_score_slope / age_days + trend.error_rate_trend / 10;
    if rate == 0 {
        return MAX_TTF_SECS;
    }

    let remaining = u64::from(rec.health_score);
    let secs = remaining.saturating_mul(SECS_PER_DAY) / rate;
    let secs = secs * u64::from(100 - probability.min(100)) / 100;
    secs.clamp(MIN_TTF_SECS, MAX_TTF_SECS)
}

pub fn classify(
    rec: &SectorHealthRecord,
    trend: &TrendAnalysis,
    th: &HealthThresholds,
) -> FailureReason {
    let (r, w) = (rec.read_errors, rec.write_errors);
    if r > w.saturating_mul(2) {
        FailureReason::ReadErrorPattern
    } else if w > r.saturating_mul(2) {
        FailureReason::WriteErrorPattern
    } else if r > 0 && w > 0 {
        FailureReason::MediaDegradation
    } else if trend.health_score_slope > 300 {
        FailureReason::RapidDecline
    } else if trend.error_rate_trend > 100 {
        FailureReason::IncreasingErrors
    } else if rec.health_score < th.danger {
        FailureReason::CriticalThreshold
    } else if trend.access_pattern_score > 70 {
        FailureReason::AccessPattern
    } else {
        FailureReason::GenericDegradation
    }
}

pub fn predict(
    rec: &SectorHealthRecord,
    th: &HealthThresholds,
    now: u64,
) -> FailurePrediction {
    let trend = analyze_trend(rec, now);
    let p = failure_probability(rec, &trend, th);

    let mut confidence = trend.reliability_score;
    if rec.scan_count < MIN_SCAN_SAMPLES
        || rec.access_count < MIN_ACCESS_SAMPLES
    {
        confidence = (confidence / 2).max(MIN_CONFIDENCE);
    }

    FailurePrediction {
        failure_probability: p,
        confidence_level: confidence.min(100),
        severity: Severity::from_probability(p),
        estimated_failure_time: now
            .saturating_add(time_to_failure(rec, &trend, p, now)),
        reason: classify(rec, &trend, th),
    }
}
