//! State of one benchmark run, shared between the orchestrator loop, the
//! trial executor and `stop_all`.

use std::sync::Mutex;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::ExecutionResult;
use crate::execution::{ExecutionConfig, PipelinePhase};
use crate::provider::JobStatus;

/// A pipeline of the current trial that has not finished yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePipeline {
    /// Provider that runs the pipeline.
    pub backend: String,
    /// Parent job id.
    pub job_id: u64,
    pub target_name: String,
    pub config: ExecutionConfig,
    pub status: JobStatus,
    pub phase: PipelinePhase,
}

#[derive(Default)]
struct TrialState {
    active: Vec<ActivePipeline>,
    completed: Vec<ExecutionResult>,
    min_job_id: Option<u64>,
}

/// Created by the run that owns it and dropped when that run ends.
#[derive(Default)]
pub struct RunContext {
    stop: CancellationToken,
    state: Mutex<TrialState>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Forget the in-flight bookkeeping of the previous trial.
    pub fn reset_trial(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = TrialState::default();
    }

    pub fn register(&self, pipeline: ActivePipeline) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.min_job_id = Some(match state.min_job_id {
            Some(min) => min.min(pipeline.job_id),
            None => pipeline.job_id,
        });
        state.active.push(pipeline);
    }

    pub fn update_status(&self, job_id: u64, phase: PipelinePhase, status: &JobStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = state.active.iter_mut().find(|p| p.job_id == job_id) {
            p.phase = phase;
            p.status = status.clone();
        }
    }

    /// Move a pipeline from active to completed.
    pub fn complete(&self, result: ExecutionResult) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job_id) = result.job_id {
            state.active.retain(|p| p.job_id != job_id);
        }
        state.completed.push(result);
    }

    pub fn active(&self) -> Vec<ActivePipeline> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.clone()
    }

    pub fn completed(&self) -> Vec<ExecutionResult> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.completed.clone()
    }

    pub fn clear_completed(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.completed.clear();
    }

    /// Results of an abandoned trial: everything completed, plus every
    /// pipeline still active with its last observed status, limited to job
    /// ids at or above the trial's lowest job id.
    pub fn partial_results(&self) -> Vec<ExecutionResult> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let min = state.min_job_id.unwrap_or(0);

        let mut results: Vec<ExecutionResult> = state
            .completed
            .iter()
            .filter(|r| r.job_id.map_or(true, |id| id >= min))
            .cloned()
            .collect();
        results.extend(state.active.iter().filter(|p| p.job_id >= min).map(|p| {
            ExecutionResult {
                target_name: p.target_name.clone(),
                job_id: Some(p.job_id),
                status: p.status.to_string(),
                config: p.config.clone(),
            }
        }));
        results
    }
}
