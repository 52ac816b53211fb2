//! Polling primitives shared by the tracker and the benchmark executor.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::execution::JobLog;
use crate::logs::clean_log;
use crate::provider::{JobProvider, JobStatus, ProviderError};

/// Placeholder stored when one job's log could not be retrieved.
pub const LOG_FETCH_ERROR: &str = "Error fetching log content";

/// Timing of one polling chain.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Wall-clock budget measured from the instant polling began.
    pub budget: Duration,
}

impl From<&TrackerConfig> for PollSettings {
    fn from(cfg: &TrackerConfig) -> Self {
        Self {
            interval: cfg.poll_interval(),
            budget: cfg.execution_timeout(),
        }
    }
}

/// How a watched pipeline stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    /// Budget exceeded before the stage reported `success` or `failed`.
    TimedOut,
    /// The chain's cancellation token fired.
    Cancelled,
}

/// Poll one stage until it reports `success` or `failed`, the budget runs
/// out, or `cancel` fires.
///
/// `started` is the instant the whole chain began polling, so the budget spans
/// both stages. Status errors are returned to the caller untouched.
pub async fn watch_job<F>(
    provider: &dyn JobProvider,
    project: &str,
    job_id: u64,
    settings: &PollSettings,
    started: Instant,
    cancel: &CancellationToken,
    mut on_status: F,
) -> Result<StageOutcome, ProviderError>
where
    F: FnMut(&JobStatus),
{
    loop {
        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        let status = provider.get_status(project, job_id).await?;
        on_status(&status);

        match status {
            JobStatus::Success => return Ok(StageOutcome::Succeeded),
            JobStatus::Failed => return Ok(StageOutcome::Failed),
            _ => {}
        }

        if started.elapsed() > settings.budget {
            debug!(job_id, %status, "Execution budget exceeded");
            return Ok(StageOutcome::TimedOut);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(StageOutcome::Cancelled),
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

/// Fetch and clean the logs of every job under `job_id`, ordered by job id.
///
/// A failure on one job's log is replaced by [`LOG_FETCH_ERROR`]; only the
/// job listing itself can fail the call.
pub async fn fetch_job_logs(
    provider: &dyn JobProvider,
    project: &str,
    job_id: u64,
) -> Result<Vec<JobLog>, ProviderError> {
    let mut jobs = provider.list_jobs(project, job_id).await?;
    jobs.sort_by_key(|j| j.id);

    let mut logs = Vec::with_capacity(jobs.len());
    for job in jobs {
        let log = match provider.get_job_log(project, job.id).await {
            Ok(raw) => clean_log(&raw),
            Err(e) => {
                warn!(job_id = job.id, job = %job.name, error = %e, "Failed to fetch job log");
                LOG_FETCH_ERROR.to_string()
            }
        };
        logs.push(JobLog {
            job_name: job.name,
            log,
        });
    }
    Ok(logs)
}
