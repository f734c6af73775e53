//! Fleet-wide fan-out, metric aggregation, and threshold gating.

pub mod extract;

use std::{sync::Arc, time::Duration};

use fleet_hub_core::{
    config::{HubConfig, Thresholds},
    models::{
        AggregateReport, Conclusion, DispatchEntry, FleetMetrics, RunPhase, RunStatus,
    },
};
use fleet_hub_github::{ApiClient, artifacts::ArtifactResolver, poller::RunPoller};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::{sync::Semaphore, task::JoinSet};

/// Identity of the hub run producing the aggregate report.
#[derive(Debug, Clone, Default)]
pub struct HubIdentity {
    pub run_id: String,
    pub triggered_by: String,
}

pub struct Aggregator {
    client: ApiClient,
    hub: HubConfig,
    identity: HubIdentity,
    strict: bool,
}

impl Aggregator {
    pub fn new(client: ApiClient, hub: HubConfig, identity: HubIdentity) -> Self {
        Self { client, hub, identity, strict: false }
    }

    /// In strict mode any per-repo failure, missing report, or threshold
    /// breach fails the batch. Non-strict aggregation is advisory only.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Drive every dispatch entry to a terminal state and fold the results
    /// into one fleet report.
    ///
    /// Entries are resolved by a bounded worker pool sharing one semaphore,
    /// since every worker shares one credential and one API quota. Each
    /// repo's error path is fully local: partial failure never prevents
    /// reporting on the rest, and every dispatched repo appears in the
    /// output with an explicit status.
    pub async fn run(
        &self,
        entries: &[DispatchEntry],
        missing_dispatch_metadata: usize,
        thresholds: &Thresholds,
    ) -> AggregateReport {
        let timeout = Duration::from_secs(self.hub.poll_timeout_secs);
        let sem = Arc::new(Semaphore::new(self.hub.workers.max(1)));
        let mut set = JoinSet::new();
        for (index, entry) in entries.iter().cloned().enumerate() {
            let sem = sem.clone();
            let client = self.client.clone();
            let hub = self.hub.clone();
            set.spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                (index, resolve_entry(&client, &hub, &entry, timeout).await)
            });
        }
        let mut slots: Vec<Option<RunStatus>> = vec![None; entries.len()];
        while let Some(join_result) = set.join_next().await {
            match join_result {
                Ok((index, status)) => slots[index] = Some(status),
                Err(e) => tracing::error!("Aggregation task failed: {e:?}"),
            }
        }
        // A lost task still gets an explicit entry in the report
        let runs: Vec<RunStatus> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| RunStatus::from_entry(&entries[index])))
            .collect();

        let metrics = aggregate(&runs);
        let total_repos = entries.len() + missing_dispatch_metadata;
        let thresholds_exceeded = exceeds_thresholds(&metrics, thresholds);
        let strict_failed = self.strict
            && (thresholds_exceeded
                || metrics.reports_collected < total_repos
                || runs.iter().any(|run| {
                    run.status != RunPhase::Completed || run.conclusion != Conclusion::Success
                }));
        AggregateReport {
            hub_run_id: self.identity.run_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            triggered_by: self.identity.triggered_by.clone(),
            total_repos,
            dispatched_repos: entries.len(),
            missing_dispatch_metadata,
            runs,
            metrics,
            thresholds_exceeded,
            strict_failed,
        }
    }
}

/// Resolve one dispatch entry to a terminal RunStatus: recover the run id if
/// the dispatch metadata lacks one, poll the run, then fetch and extract the
/// report. Every failure ends in a descriptive terminal phase.
async fn resolve_entry(
    client: &ApiClient,
    hub: &HubConfig,
    entry: &DispatchEntry,
    timeout: Duration,
) -> RunStatus {
    let mut status = RunStatus::from_entry(entry);
    let resolver = ArtifactResolver::new(client, &hub.report_artifact_suffix);
    let run_id = match entry.run_id {
        Some(run_id) => run_id,
        None if !entry.correlation_id.is_empty() && !entry.workflow.is_empty() => {
            match resolver
                .find_run_by_correlation(
                    &entry.owner,
                    &entry.repo,
                    &entry.workflow,
                    &entry.correlation_id,
                )
                .await
            {
                Ok(Some(run_id)) => {
                    tracing::info!(
                        "Recovered run id {run_id} for {} via correlation search",
                        entry.full_name()
                    );
                    status.run_id = Some(run_id);
                    run_id
                }
                Ok(None) => {
                    tracing::warn!("No run id recorded or recoverable for {}", entry.full_name());
                    status.status = RunPhase::MissingRunId;
                    return status;
                }
                Err(e) => {
                    tracing::warn!("Run id recovery failed for {}: {e:?}", entry.full_name());
                    status.status = RunPhase::MissingRunId;
                    return status;
                }
            }
        }
        None => {
            tracing::warn!("Dispatch entry for {} has no run id", entry.full_name());
            status.status = RunPhase::MissingRunId;
            return status;
        }
    };

    let poll = RunPoller::new(client).poll(&entry.owner, &entry.repo, run_id, timeout).await;
    status.status = RunPhase::from_poll_status(&poll.status);
    status.conclusion = Conclusion::from_api(&poll.conclusion);
    if status.status != RunPhase::Completed {
        return status;
    }

    match resolver
        .fetch_and_validate(
            &entry.owner,
            &entry.repo,
            run_id,
            &entry.correlation_id,
            &entry.workflow,
        )
        .await
    {
        Ok(Some(report)) => extract::extract(&report, &mut status),
        // No artifact, no report.json, or exhausted recovery
        Ok(None) => status.status = RunPhase::MissingReport,
        // Transient failure that survived the client's retries
        Err(e) => {
            tracing::warn!("Failed to resolve report for {}#{run_id}: {e:?}", entry.full_name());
            status.status = RunPhase::FetchFailed;
        }
    }
    status
}

/// Fold per-repo records into fleet-wide metrics. Pure.
///
/// Averages cover only records where the field is numeric; nulls and
/// malformed values are excluded, not treated as zero. Vulnerability counts
/// are summed across the heterogeneous scanner sources into unified totals.
pub fn aggregate(runs: &[RunStatus]) -> FleetMetrics {
    FleetMetrics {
        average_coverage: mean(runs, |run| run.coverage.as_ref()),
        average_mutation_score: mean(runs, |run| run.mutation_score.as_ref()),
        total_critical_vulns: total(runs, |run| run.dependency_critical_vulns.as_ref())
            + total(runs, |run| run.container_critical_vulns.as_ref()),
        total_high_vulns: total(runs, |run| run.dependency_high_vulns.as_ref())
            + total(runs, |run| run.container_high_vulns.as_ref()),
        total_medium_vulns: total(runs, |run| run.dependency_medium_vulns.as_ref())
            + total(runs, |run| run.container_medium_vulns.as_ref()),
        total_code_quality_issues: total(runs, |run| run.lint_issues.as_ref())
            + total(runs, |run| run.style_issues.as_ref()),
        reports_collected: runs.iter().filter(|run| run.status == RunPhase::Completed).count(),
    }
}

/// `true` when the aggregated totals breach the configured limits. Equality
/// is within budget; only strictly-greater counts as a breach.
pub fn exceeds_thresholds(metrics: &FleetMetrics, thresholds: &Thresholds) -> bool {
    metrics.total_critical_vulns > thresholds.max_critical_vulns
        || metrics.total_high_vulns > thresholds.max_high_vulns
}

fn mean(runs: &[RunStatus], field: impl Fn(&RunStatus) -> Option<&Value>) -> Option<f64> {
    let values: Vec<f64> =
        runs.iter().filter_map(|run| field(run).and_then(Value::as_f64)).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn total(runs: &[RunStatus], field: impl Fn(&RunStatus) -> Option<&Value>) -> u64 {
    runs.iter().filter_map(|run| field(run).and_then(Value::as_u64)).sum()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn completed(coverage: Option<Value>) -> RunStatus {
        RunStatus {
            status: RunPhase::Completed,
            conclusion: Conclusion::Success,
            coverage,
            ..RunStatus::default()
        }
    }

    #[test]
    fn test_mean_excludes_nulls() {
        let runs = vec![
            completed(Some(json!(80.0))),
            completed(None),
            completed(Some(json!(90.0))),
        ];
        let metrics = aggregate(&runs);
        assert_eq!(metrics.average_coverage, Some(85.0));
        assert_eq!(metrics.average_mutation_score, None);
        assert_eq!(metrics.reports_collected, 3);
    }

    #[test]
    fn test_mean_excludes_non_numeric() {
        let runs = vec![completed(Some(json!("broken"))), completed(Some(json!(70.0)))];
        let metrics = aggregate(&runs);
        assert_eq!(metrics.average_coverage, Some(70.0));
    }

    #[test]
    fn test_totals_sum_across_scanners() {
        let mut a = completed(None);
        a.dependency_critical_vulns = Some(json!(1));
        a.dependency_high_vulns = Some(json!(2));
        a.lint_issues = Some(json!(3));
        let mut b = completed(None);
        b.container_critical_vulns = Some(json!(2));
        b.container_medium_vulns = Some(json!(5));
        b.style_issues = Some(json!(4));
        let metrics = aggregate(&[a, b]);
        assert_eq!(metrics.total_critical_vulns, 3);
        assert_eq!(metrics.total_high_vulns, 2);
        assert_eq!(metrics.total_medium_vulns, 5);
        assert_eq!(metrics.total_code_quality_issues, 7);
    }

    #[test]
    fn test_threshold_gate() {
        let thresholds = Thresholds { max_critical_vulns: 0, max_high_vulns: 2 };
        let metrics =
            FleetMetrics { total_critical_vulns: 1, total_high_vulns: 1, ..Default::default() };
        assert!(exceeds_thresholds(&metrics, &thresholds));
        // Equality is within budget
        let metrics =
            FleetMetrics { total_critical_vulns: 0, total_high_vulns: 2, ..Default::default() };
        assert!(!exceeds_thresholds(&metrics, &thresholds));
        let metrics =
            FleetMetrics { total_critical_vulns: 0, total_high_vulns: 3, ..Default::default() };
        assert!(exceeds_thresholds(&metrics, &thresholds));
    }

    #[test]
    fn test_reports_collected_counts_only_completed() {
        let failed = RunStatus { status: RunPhase::MissingReport, ..RunStatus::default() };
        let runs = vec![completed(None), failed];
        assert_eq!(aggregate(&runs).reports_collected, 1);
    }
}
