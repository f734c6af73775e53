use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One triggered downstream workflow run awaiting completion.
///
/// Written by the dispatch step as one JSON file per repo; immutable once
/// read. `run_id` is only a hint and may be absent, in which case it is
/// recovered by correlation-id search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DispatchEntry {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub subdir: String,
    /// Name of the repo config that produced this entry. Filled from the
    /// metadata file stem when the dispatch step leaves it empty.
    #[serde(default)]
    pub config: String,
}

impl DispatchEntry {
    pub fn full_name(&self) -> String { format!("{}/{}", self.owner, self.repo) }
}

/// Lifecycle phase of one dispatched run, as tracked by the hub.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    MissingRunId,
    #[default]
    Unknown,
    Completed,
    TimedOut,
    FetchFailed,
    MissingReport,
    InvalidReport,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRunId => "missing_run_id",
            Self::Unknown => "unknown",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::FetchFailed => "fetch_failed",
            Self::MissingReport => "missing_report",
            Self::InvalidReport => "invalid_report",
        }
    }

    /// Map a raw poll status onto a phase. The API may report any status
    /// string; everything outside the known terminal set stays `Unknown`.
    pub fn from_poll_status(status: &str) -> Self {
        match status {
            "completed" => Self::Completed,
            "timed_out" => Self::TimedOut,
            "fetch_failed" => Self::FetchFailed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Conclusion reported by the control plane for a terminal run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    #[default]
    Unknown,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient mapping from the API's conclusion string; unrecognized values
    /// fall back to `Unknown` rather than failing deserialization.
    pub fn from_api(conclusion: &str) -> Self {
        match conclusion {
            "success" => Self::Success,
            "failure" => Self::Failure,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Per-repo aggregation record, one per dispatch entry.
///
/// Created with every metric field `None` and mutated in place as polling
/// and extraction proceed; never mutated after being appended to the final
/// report. Metric values are carried as raw JSON so that malformed values
/// survive to aggregation, where non-numeric values are excluded from
/// averages. `None` means "not run", which is distinct from a reported zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatus {
    pub config: String,
    pub repo: String,
    pub subdir: String,
    pub language: String,
    pub branch: String,
    pub workflow: String,
    pub run_id: Option<u64>,
    pub correlation_id: String,
    pub status: RunPhase,
    pub conclusion: Conclusion,
    pub coverage: Option<Value>,
    pub mutation_score: Option<Value>,
    pub dependency_critical_vulns: Option<Value>,
    pub dependency_high_vulns: Option<Value>,
    pub dependency_medium_vulns: Option<Value>,
    pub container_critical_vulns: Option<Value>,
    pub container_high_vulns: Option<Value>,
    pub container_medium_vulns: Option<Value>,
    pub lint_issues: Option<Value>,
    pub style_issues: Option<Value>,
    #[serde(default)]
    pub tools_ran: Value,
    #[serde(default)]
    pub tools_configured: Value,
    #[serde(default)]
    pub tools_success: Value,
}

impl RunStatus {
    pub fn from_entry(entry: &DispatchEntry) -> Self {
        Self {
            config: entry.config.clone(),
            repo: entry.full_name(),
            subdir: entry.subdir.clone(),
            language: entry.language.clone(),
            branch: entry.branch.clone(),
            workflow: entry.workflow.clone(),
            run_id: entry.run_id,
            correlation_id: entry.correlation_id.clone(),
            ..Self::default()
        }
    }
}

/// Payload of the `report.json` a downstream job uploads in its artifact.
///
/// Untrusted input: every field defaults, so any shape deviation degrades to
/// a `missing_report`/`invalid_report` status instead of failing the batch.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetReport {
    pub hub_correlation_id: String,
    pub repository: String,
    pub branch: String,
    pub run_id: Option<Value>,
    pub results: serde_json::Map<String, Value>,
    pub tool_metrics: serde_json::Map<String, Value>,
    pub tools_ran: Value,
    pub tools_configured: Value,
    pub tools_success: Value,
}

/// Fleet-wide aggregates folded out of the per-repo records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetMetrics {
    /// Mean over records where coverage is numeric; `None` when no record has one.
    pub average_coverage: Option<f64>,
    pub average_mutation_score: Option<f64>,
    pub total_critical_vulns: u64,
    pub total_high_vulns: u64,
    pub total_medium_vulns: u64,
    pub total_code_quality_issues: u64,
    pub reports_collected: usize,
}

/// Top-level output of one aggregation pass. Write-once.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub hub_run_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub triggered_by: String,
    pub total_repos: usize,
    pub dispatched_repos: usize,
    pub missing_dispatch_metadata: usize,
    pub runs: Vec<RunStatus>,
    #[serde(flatten)]
    pub metrics: FleetMetrics,
    pub thresholds_exceeded: bool,
    pub strict_failed: bool,
}
