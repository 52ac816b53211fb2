//! Runs pipelines on behalf of a task function during one trial.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::context::{ActivePipeline, RunContext};
use super::{BenchError, ExecutionResult, RESULT_FAILED, RESULT_SUCCESS, RESULT_TIMEOUT};
use crate::execution::{child_job_id, ExecutionConfig, PipelinePhase};
use crate::provider::{JobProvider, JobStatus, TriggerRequest, TriggerResponse};
use crate::tracker::poll::{watch_job, PollSettings, StageOutcome};

/// Settings a run reads and that callers may change between runs. Tasks may
/// override them for the duration of a run; the orchestrator restores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub trial_count: u32,
    pub primary: ExecutionConfig,
    pub secondary: ExecutionConfig,
    pub targets: Vec<String>,
    pub concurrent_runs: usize,
}

pub struct TrialExecutor {
    provider: Arc<dyn JobProvider>,
    project: Option<String>,
    ctx: Arc<RunContext>,
    settings: Arc<Mutex<RunSettings>>,
    poll: PollSettings,
}

impl TrialExecutor {
    pub fn new(
        provider: Arc<dyn JobProvider>,
        project: Option<String>,
        ctx: Arc<RunContext>,
        settings: Arc<Mutex<RunSettings>>,
        poll: PollSettings,
    ) -> Self {
        Self {
            provider,
            project,
            ctx,
            settings,
            poll,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn settings(&self) -> RunSettings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn primary_config(&self) -> ExecutionConfig {
        self.settings().primary
    }

    pub fn secondary_config(&self) -> ExecutionConfig {
        self.settings().secondary
    }

    /// Override the secondary runner until the current run ends.
    pub fn set_secondary(&self, config: ExecutionConfig) {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .secondary = config;
    }

    pub fn targets(&self) -> Vec<String> {
        self.settings().targets
    }

    pub fn concurrent_runs(&self) -> usize {
        self.settings().concurrent_runs
    }

    /// Trigger one pipeline and follow it through both stages.
    ///
    /// A failed trigger is a `failed` result without a job id, not an error.
    /// Returns [`BenchError::Stopped`] if the run is stopped meanwhile.
    pub async fn run_pipeline(
        &self,
        target: &str,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult, BenchError> {
        if self.ctx.should_stop() {
            return Err(BenchError::Stopped);
        }

        let project = match self.project.as_deref() {
            Some(p) if self.provider.has_trigger_credential() => p,
            _ => {
                warn!(target = %target, "Provider not configured, recording failed run");
                return Ok(self.trigger_failed(target, config));
            }
        };

        let req = TriggerRequest {
            git_ref: config.branch.clone(),
            variables: config.variables(target),
        };
        let job_id = match self
            .provider
            .trigger(project, &req)
            .await
            .and_then(TriggerResponse::checked)
        {
            Ok(resp) => resp.job_id,
            Err(e) => {
                warn!(target = %target, error = %e, "Trigger failed");
                return Ok(self.trigger_failed(target, config));
            }
        };

        debug!(target = %target, job_id, "Pipeline triggered");
        self.ctx.register(ActivePipeline {
            backend: self.provider.name().to_string(),
            job_id,
            target_name: target.to_string(),
            config: config.clone(),
            status: JobStatus::Pending,
            phase: PipelinePhase::Parent,
        });

        let started = Instant::now();
        let outcome = watch_job(
            self.provider.as_ref(),
            project,
            job_id,
            &self.poll,
            started,
            self.ctx.token(),
            |s| self.ctx.update_status(job_id, PipelinePhase::Parent, s),
        )
        .await?;

        let status = match outcome {
            StageOutcome::Cancelled => return Err(BenchError::Stopped),
            StageOutcome::TimedOut => RESULT_TIMEOUT,
            StageOutcome::Failed => RESULT_FAILED,
            StageOutcome::Succeeded => {
                let child = child_job_id(job_id);
                let outcome = watch_job(
                    self.provider.as_ref(),
                    project,
                    child,
                    &self.poll,
                    started,
                    self.ctx.token(),
                    |s| self.ctx.update_status(job_id, PipelinePhase::Child, s),
                )
                .await?;
                match outcome {
                    StageOutcome::Cancelled => return Err(BenchError::Stopped),
                    StageOutcome::TimedOut => RESULT_TIMEOUT,
                    StageOutcome::Failed => RESULT_FAILED,
                    StageOutcome::Succeeded => RESULT_SUCCESS,
                }
            }
        };

        let result = ExecutionResult {
            target_name: target.to_string(),
            job_id: Some(job_id),
            status: status.to_string(),
            config: config.clone(),
        };
        debug!(target = %target, job_id, status, "Pipeline finished");
        self.ctx.complete(result.clone());
        Ok(result)
    }

    fn trigger_failed(&self, target: &str, config: &ExecutionConfig) -> ExecutionResult {
        let result = ExecutionResult {
            target_name: target.to_string(),
            job_id: None,
            status: RESULT_FAILED.to_string(),
            config: config.clone(),
        };
        self.ctx.complete(result.clone());
        result
    }

    /// Run several pipelines at once and wait for all of them.
    ///
    /// A stop takes precedence over any other error.
    pub async fn run_all(
        &self,
        runs: Vec<(String, ExecutionConfig)>,
    ) -> Result<Vec<ExecutionResult>, BenchError> {
        let outcomes = join_all(
            runs.iter()
                .map(|(target, config)| self.run_pipeline(target, config)),
        )
        .await;

        if outcomes
            .iter()
            .any(|o| matches!(o, Err(BenchError::Stopped)))
        {
            return Err(BenchError::Stopped);
        }
        outcomes.into_iter().collect()
    }
}
