//! Normalization of an untrusted report payload into the canonical per-repo
//! result record.

use fleet_hub_core::models::{FleetReport, RunStatus};
use serde_json::{Map, Value};

/// Copy the canonical metric fields out of a report into the run's status
/// record.
///
/// Absent fields stay `None` so "not run" is distinguishable from "zero
/// issues" downstream. Values are copied verbatim, without type checks;
/// non-numeric values are excluded from aggregation later rather than
/// rejected here.
pub fn extract(report: &FleetReport, status: &mut RunStatus) {
    status.coverage = field(&report.results, "coverage");
    status.mutation_score = field(&report.results, "mutation_score");
    status.dependency_critical_vulns =
        tool_field(&report.tool_metrics, "dependency_scan", "critical_vulns");
    status.dependency_high_vulns = tool_field(&report.tool_metrics, "dependency_scan", "high_vulns");
    status.dependency_medium_vulns =
        tool_field(&report.tool_metrics, "dependency_scan", "medium_vulns");
    status.container_critical_vulns =
        tool_field(&report.tool_metrics, "container_scan", "critical_vulns");
    status.container_high_vulns = tool_field(&report.tool_metrics, "container_scan", "high_vulns");
    status.container_medium_vulns =
        tool_field(&report.tool_metrics, "container_scan", "medium_vulns");
    status.lint_issues = tool_field(&report.tool_metrics, "lint", "issues");
    status.style_issues = tool_field(&report.tool_metrics, "style", "issues");
    status.tools_ran = report.tools_ran.clone();
    status.tools_configured = report.tools_configured.clone();
    status.tools_success = report.tools_success.clone();
}

fn field(map: &Map<String, Value>, key: &str) -> Option<Value> { map.get(key).cloned() }

fn tool_field(map: &Map<String, Value>, tool: &str, key: &str) -> Option<Value> {
    map.get(tool)?.get(key).cloned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_extract_defaults_to_none() {
        let report: FleetReport = serde_json::from_value(json!({
            "hub_correlation_id": "1-1-web",
            "results": {"coverage": 92.5},
            "tool_metrics": {"lint": {"issues": 4}},
        }))
        .unwrap();
        let mut status = RunStatus::default();
        extract(&report, &mut status);
        assert_eq!(status.coverage, Some(json!(92.5)));
        assert_eq!(status.lint_issues, Some(json!(4)));
        // Not run is None, never zero
        assert_eq!(status.mutation_score, None);
        assert_eq!(status.dependency_critical_vulns, None);
    }

    #[test]
    fn test_extract_passes_malformed_values_through() {
        let report: FleetReport = serde_json::from_value(json!({
            "results": {"coverage": "n/a"},
            "tool_metrics": {"container_scan": {"critical_vulns": [1, 2]}},
        }))
        .unwrap();
        let mut status = RunStatus::default();
        extract(&report, &mut status);
        assert_eq!(status.coverage, Some(json!("n/a")));
        assert_eq!(status.container_critical_vulns, Some(json!([1, 2])));
    }

    #[test]
    fn test_extract_copies_bookkeeping_maps() {
        let report: FleetReport = serde_json::from_value(json!({
            "tools_ran": {"clippy": true, "audit": true},
            "tools_configured": {"clippy": true},
            "tools_success": {"clippy": false},
        }))
        .unwrap();
        let mut status = RunStatus::default();
        extract(&report, &mut status);
        assert_eq!(status.tools_ran, json!({"clippy": true, "audit": true}));
        assert_eq!(status.tools_success, json!({"clippy": false}));
    }
}
