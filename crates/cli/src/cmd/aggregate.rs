use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use argp::FromArgs;
use fleet_hub_aggregate::{Aggregator, HubIdentity};
use fleet_hub_core::{
    config::{Config, Thresholds, ThresholdsDoc},
    models::DispatchEntry,
};
use fleet_hub_github::ApiClient;

#[derive(FromArgs, PartialEq, Debug)]
/// Wait for dispatched workflow runs and aggregate their reports into a
/// fleet-wide verdict.
#[argp(subcommand, name = "aggregate")]
pub struct Args {
    #[argp(option, short = 'c')]
    /// hub config file (default config.yml, or HUB_TOKEN from the environment)
    config: Option<PathBuf>,
    #[argp(option, short = 'd')]
    /// directory of dispatch metadata JSON files, one per repo
    dispatch_dir: PathBuf,
    #[argp(option, short = 't')]
    /// thresholds document (YAML)
    thresholds: Option<PathBuf>,
    #[argp(option, short = 'o')]
    /// write the aggregate report to this file instead of stdout
    output: Option<PathBuf>,
    #[argp(switch)]
    /// fail on any per-repo failure or threshold breach
    strict: bool,
    #[argp(option)]
    /// per-repo poll timeout in seconds (overrides config)
    timeout_sec: Option<u64>,
    #[argp(option)]
    /// identifier of the hub's own run (default $HUB_RUN_ID)
    hub_run_id: Option<String>,
    #[argp(option)]
    /// actor that triggered the hub run (default $HUB_ACTOR)
    triggered_by: Option<String>,
}

pub async fn run(args: Args) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None if Path::new("config.yml").exists() => Config::load("config.yml")?,
        None => Config::from_env().context("No config.yml found")?,
    };
    if let Some(timeout_sec) = args.timeout_sec {
        config.hub.poll_timeout_secs = timeout_sec;
    }
    let thresholds = match &args.thresholds {
        Some(path) => ThresholdsDoc::load(path)?.thresholds,
        None => Thresholds::default(),
    };
    let (entries, skipped) = load_dispatch_entries(&args.dispatch_dir)?;
    tracing::info!(
        "Aggregating {} dispatched repos ({} skipped) from {}",
        entries.len(),
        skipped,
        args.dispatch_dir.display()
    );

    let client = ApiClient::new(&config.api)?;
    let identity = HubIdentity {
        run_id: args.hub_run_id.or_else(|| std::env::var("HUB_RUN_ID").ok()).unwrap_or_default(),
        triggered_by: args
            .triggered_by
            .or_else(|| std::env::var("HUB_ACTOR").ok())
            .unwrap_or_default(),
    };
    let aggregator = Aggregator::new(client, config.hub.clone(), identity).strict(args.strict);
    let report = aggregator.run(&entries, skipped, &thresholds).await;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    match &args.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    tracing::info!(
        "Collected {}/{} reports (critical: {}, high: {}, thresholds exceeded: {})",
        report.metrics.reports_collected,
        report.total_repos,
        report.metrics.total_critical_vulns,
        report.metrics.total_high_vulns,
        report.thresholds_exceeded
    );
    Ok(if report.strict_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Read every dispatch metadata file in `dir`. Malformed entries are skipped
/// with a warning and counted, never batch-fatal.
fn load_dispatch_entries(dir: &Path) -> Result<(Vec<DispatchEntry>, usize)> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read dispatch directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    let mut skipped = 0;
    for path in paths {
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|data| serde_json::from_slice::<DispatchEntry>(&data).map_err(Into::into));
        match parsed {
            Ok(mut entry) => {
                if entry.owner.is_empty() || entry.repo.is_empty() {
                    tracing::warn!(
                        "Skipping dispatch entry {} without owner/repo",
                        path.display()
                    );
                    skipped += 1;
                    continue;
                }
                if entry.config.is_empty() {
                    entry.config = path
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_default();
                }
                entries.push(entry);
            }
            Err(e) => {
                tracing::warn!("Skipping malformed dispatch entry {}: {e}", path.display());
                skipped += 1;
            }
        }
    }
    Ok((entries, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dispatch_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("web.json"),
            r#"{"owner": "acme", "repo": "web", "run_id": 1, "correlation_id": "1-1-web"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
        std::fs::write(dir.path().join("no-owner.json"), r#"{"owner": "", "repo": "x"}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (entries, skipped) = load_dispatch_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(skipped, 2);
        assert_eq!(entries[0].full_name(), "acme/web");
        // Config name falls back to the file stem
        assert_eq!(entries[0].config, "web");
    }

    #[test]
    fn test_load_dispatch_entries_missing_dir() {
        assert!(load_dispatch_entries(Path::new("/nonexistent/dispatch")).is_err());
    }
}
