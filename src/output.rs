//! Output types: records, per-unit outcomes, run statistics, session summary.

use crate::checkpoint::SessionStats;
use crate::error::UnitError;
use crate::extract::RunState;
use crate::pipeline::normalize::NormalizerStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// One record extracted from one unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// 0-indexed unit the record came from.
    pub unit_index: usize,
    /// Service-supplied identifier, or a synthesized `unknown-N`.
    pub record_key: String,
    /// Cleaned, non-empty text.
    pub text: String,
    pub has_visual: bool,
    /// Score in `[0, 1]` when the service gave a usable one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Unrecognised raw fields, response-level info, cleaning flags.
    #[serde(default)]
    pub provenance: BTreeMap<String, Value>,
}

/// What happened to one unit during this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    /// 0-indexed unit.
    pub unit_index: usize,
    pub records_extracted: usize,
    /// Service calls made for this unit, fallback prompt included.
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    /// `Some` when the unit failed.
    pub error: Option<UnitError>,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate statistics for one run of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Units in the input.
    pub total_units: usize,
    /// Units matched by the selection.
    pub selected_units: usize,
    /// Selected units already completed by an earlier run.
    pub skipped_units: usize,
    /// Units attempted in this run.
    pub processed_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
    pub records_extracted: usize,
    pub api_calls: u64,
    pub api_errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_duration_ms: u64,
    /// Normalizer counters for this run.
    pub normalizer: NormalizerStats,
}

/// Everything a caller gets back from a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal state: `Completed` or `Interrupted`.
    pub state: RunState,
    pub summary: SessionSummary,
    /// Records of every completed unit, this run and earlier ones, sorted by unit.
    pub records: Vec<ExtractedRecord>,
    /// Units attempted in this run, sorted by unit.
    pub units: Vec<UnitOutcome>,
    pub stats: RunStats,
    /// Where the session state lives (`.completed` once finalized).
    pub state_path: PathBuf,
}

/// Operator-facing view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_units: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub completion_percent: f64,
    pub errors: BTreeMap<usize, String>,
    pub warnings: BTreeMap<usize, Vec<String>>,
    pub stats: SessionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Plain-text report. Unit numbers are shown 1-indexed.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Session {}", self.session_id);
        let _ = writeln!(
            out,
            "  started {}, last update {}",
            self.created_at.to_rfc3339(),
            self.updated_at.to_rfc3339()
        );
        let _ = writeln!(
            out,
            "  units: {}/{} completed ({:.1}%), {} failed, {} remaining",
            self.completed, self.total_units, self.completion_percent, self.failed, self.remaining
        );
        let _ = writeln!(
            out,
            "  records: {}  service calls: {}  service errors: {}  synthesized keys: {}",
            self.stats.records_extracted,
            self.stats.api_calls,
            self.stats.api_errors,
            self.stats.unknown_keys_generated
        );
        if self.stats.input_tokens > 0 || self.stats.output_tokens > 0 {
            let _ = writeln!(
                out,
                "  tokens: {} in / {} out",
                self.stats.input_tokens, self.stats.output_tokens
            );
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out, "\nErrors:");
            for (unit, message) in &self.errors {
                let _ = writeln!(out, "  unit {}: {}", unit + 1, message);
            }
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for (unit, list) in &self.warnings {
                for warning in list {
                    let _ = writeln!(out, "  unit {}: {}", unit + 1, warning);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> SessionSummary {
        let now = Utc::now();
        SessionSummary {
            session_id: "s-1".into(),
            total_units: 4,
            completed: 2,
            failed: 1,
            remaining: 2,
            completion_percent: 50.0,
            errors: BTreeMap::from([(2, "service call rejected".to_string())]),
            warnings: BTreeMap::from([(0, vec!["expected 3 items but extracted 2".to_string()])]),
            stats: SessionStats {
                records_extracted: 7,
                api_calls: 4,
                api_errors: 1,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn report_lists_errors_one_indexed() {
        let report = summary().render_report();
        assert!(report.contains("2/4 completed (50.0%)"), "{report}");
        assert!(report.contains("unit 3: service call rejected"), "{report}");
        assert!(report.contains("unit 1: expected 3 items"), "{report}");
        assert!(!report.contains("tokens:"));
    }

    #[test]
    fn record_skips_absent_confidence() {
        let record = ExtractedRecord {
            unit_index: 0,
            record_key: "1".into(),
            text: "a".into(),
            has_visual: false,
            confidence: None,
            provenance: BTreeMap::new(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("confidence"));
        let back: ExtractedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
