//! Report artifact resolution: download, unpack, correlation validation,
//! and the recovery search across recent runs.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fleet_hub_core::{correlation, models::FleetReport};
use serde_json::Value;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::ApiClient;

/// How many recent workflow runs to inspect when the recorded run id turns
/// out to be stale.
const RECOVERY_SCAN_DEPTH: usize = 10;

pub struct ArtifactResolver<'a> {
    client: &'a ApiClient,
    report_artifact_suffix: &'a str,
}

impl<'a> ArtifactResolver<'a> {
    pub fn new(client: &'a ApiClient, report_artifact_suffix: &'a str) -> Self {
        Self { client, report_artifact_suffix }
    }

    /// Fetch the report artifact for `run_id` and validate its correlation id
    /// against `expected` (empty `expected` skips validation).
    ///
    /// On mismatch the recorded run id is treated as a stale hint and the
    /// recovery search scans recent runs of `workflow` for the run whose
    /// artifact actually carries `expected`. A recovered run is fetched
    /// without re-validating, so a mismatch can never loop.
    pub async fn fetch_and_validate(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        expected: &str,
        workflow: &str,
    ) -> Result<Option<FleetReport>> {
        let Some(report) = self.fetch_report(owner, repo, run_id).await? else {
            return Ok(None);
        };
        if correlation::validate(expected, Some(report.hub_correlation_id.as_str())) {
            return Ok(Some(report));
        }
        tracing::warn!(
            "Correlation mismatch for {owner}/{repo}#{run_id}: expected {expected:?}, got {:?}",
            report.hub_correlation_id
        );
        let Some(recovered) =
            self.find_run_by_correlation(owner, repo, workflow, expected).await?
        else {
            tracing::warn!("No run of {workflow} in {owner}/{repo} matches {expected:?}");
            return Ok(None);
        };
        if recovered == run_id {
            return Ok(None);
        }
        tracing::info!("Recovered run id {recovered} for {owner}/{repo} via correlation search");
        self.fetch_report(owner, repo, recovered).await
    }

    /// Download and parse the report payload from one run's artifact, without
    /// correlation validation. `None` covers every degraded case: no
    /// artifacts, no redirect, no `report.json`, unparseable JSON.
    pub async fn fetch_report(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Option<FleetReport>> {
        let listing = self
            .client
            .get(&format!("repos/{owner}/{repo}/actions/runs/{run_id}/artifacts"))
            .await
            .with_context(|| format!("Failed to list artifacts for {owner}/{repo}#{run_id}"))?;
        let artifacts = listing.get("artifacts").and_then(Value::as_array);
        let Some(artifact) =
            artifacts.and_then(|a| select_artifact(a, self.report_artifact_suffix))
        else {
            tracing::warn!("No artifacts found for {owner}/{repo}#{run_id}");
            return Ok(None);
        };
        let Some(archive_url) =
            artifact.get("archive_download_url").and_then(Value::as_str)
        else {
            tracing::warn!("Artifact for {owner}/{repo}#{run_id} has no download URL");
            return Ok(None);
        };
        // Scoped per attempt; dropped (and deleted) on all exit paths
        let temp = TempDir::new().context("Failed to create artifact directory")?;
        let Some(dir) = self.client.download_artifact(archive_url, temp.path()).await? else {
            return Ok(None);
        };
        let Some(report_path) = find_report_json(&dir) else {
            tracing::warn!("Artifact for {owner}/{repo}#{run_id} contains no report.json");
            return Ok(None);
        };
        let data = std::fs::read(&report_path)
            .with_context(|| format!("Failed to read {}", report_path.display()))?;
        match serde_json::from_slice::<FleetReport>(&data) {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                tracing::warn!("Invalid report.json in {owner}/{repo}#{run_id}: {e}");
                Ok(None)
            }
        }
    }

    /// Scan the most recent runs of `workflow` for the one whose artifact
    /// carries `expected`. An explicit bounded loop; candidates that fail to
    /// yield a report are skipped, not fatal.
    pub async fn find_run_by_correlation(
        &self,
        owner: &str,
        repo: &str,
        workflow: &str,
        expected: &str,
    ) -> Result<Option<u64>> {
        if expected.is_empty() {
            return Ok(None);
        }
        let listing = self
            .client
            .get(&format!(
                "repos/{owner}/{repo}/actions/workflows/{workflow}/runs?per_page={RECOVERY_SCAN_DEPTH}"
            ))
            .await
            .with_context(|| format!("Failed to list runs of {workflow} in {owner}/{repo}"))?;
        let Some(runs) = listing.get("workflow_runs").and_then(Value::as_array) else {
            return Ok(None);
        };
        for run in runs.iter().take(RECOVERY_SCAN_DEPTH) {
            let Some(id) = run.get("id").and_then(Value::as_u64) else {
                continue;
            };
            match self.fetch_report(owner, repo, id).await {
                Ok(Some(candidate)) if candidate.hub_correlation_id == expected => {
                    return Ok(Some(id));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to inspect {owner}/{repo}#{id} during recovery: {e:?}");
                }
            }
        }
        Ok(None)
    }
}

/// Pick the report artifact from a run's artifact list.
///
/// Naming conventions vary across downstream repos, so this degrades from
/// the configured suffix, to any name containing "report", to the first
/// artifact.
fn select_artifact<'v>(artifacts: &'v [Value], suffix: &str) -> Option<&'v Value> {
    fn name(artifact: &Value) -> &str {
        artifact.get("name").and_then(Value::as_str).unwrap_or_default()
    }
    artifacts
        .iter()
        .find(|a| name(a).ends_with(suffix))
        .or_else(|| artifacts.iter().find(|a| name(a).contains("report")))
        .or_else(|| artifacts.first())
}

fn find_report_json(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_type().is_file() && entry.file_name() == OsStr::new("report.json")
        })
        .map(|entry| entry.into_path())
}
