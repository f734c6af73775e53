//! Per-dispatch polling of a workflow run to a terminal state.

use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep};

use crate::ApiClient;

/// Statuses from which the run may still transition.
const PENDING_STATUSES: &[&str] = &["queued", "in_progress", "waiting", "pending"];

const INITIAL_DELAY: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(60);
const DELAY_GROWTH: f64 = 1.5;

/// Terminal outcome of polling one run. `status` carries the API's own
/// status string for any non-pending terminal state, or one of the
/// hub-synthesized `timed_out`/`fetch_failed` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub status: String,
    pub conclusion: String,
}

impl PollResult {
    fn timed_out() -> Self {
        Self { status: "timed_out".into(), conclusion: "timed_out".into() }
    }

    fn fetch_failed() -> Self {
        Self { status: "fetch_failed".into(), conclusion: "unknown".into() }
    }
}

pub struct RunPoller<'a> {
    client: &'a ApiClient,
    initial_delay: Duration,
    max_delay: Duration,
}

impl<'a> RunPoller<'a> {
    pub fn new(client: &'a ApiClient) -> Self {
        Self { client, initial_delay: INITIAL_DELAY, max_delay: MAX_DELAY }
    }

    /// Override the backoff window. The defaults are tuned for real workflow
    /// runs; tests shrink them.
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Poll a run until it leaves the pending set or `timeout` elapses.
    ///
    /// The delay between polls grows by ×1.5 per iteration up to the cap.
    /// API errors degrade to a `fetch_failed` result instead of propagating;
    /// a single unreachable repo must not abort the whole fleet. Once the
    /// timeout is hit, no further API calls are made.
    pub async fn poll(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        timeout: Duration,
    ) -> PollResult {
        let start = Instant::now();
        let mut delay = self.initial_delay;
        loop {
            let run = match self
                .client
                .get(&format!("repos/{owner}/{repo}/actions/runs/{run_id}"))
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    tracing::warn!("Failed to fetch run {owner}/{repo}#{run_id}: {e}");
                    return PollResult::fetch_failed();
                }
            };
            let status = run.get("status").and_then(Value::as_str).unwrap_or("unknown");
            if !PENDING_STATUSES.contains(&status) {
                let conclusion =
                    run.get("conclusion").and_then(Value::as_str).unwrap_or("unknown");
                tracing::info!(
                    "Run {owner}/{repo}#{run_id} finished: {status} ({conclusion})"
                );
                return PollResult {
                    status: status.to_string(),
                    conclusion: conclusion.to_string(),
                };
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Run {owner}/{repo}#{run_id} still {status} after {timeout:?}, giving up"
                );
                return PollResult::timed_out();
            }
            tracing::debug!("Run {owner}/{repo}#{run_id} is {status}, next poll in {delay:?}");
            sleep(delay).await;
            delay = delay.mul_f64(DELAY_GROWTH).min(self.max_delay);
        }
    }
}
