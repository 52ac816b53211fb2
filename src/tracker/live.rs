//! Live execution state for UI consumers: an in-memory snapshot cache and
//! the typed events the tracker broadcasts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::execution::{Execution, PipelinePhase};
use crate::provider::JobStatus;
use crate::status::ExecutionStatus;

/// Progress notifications emitted by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Triggered {
        execution_id: String,
        target_name: String,
        job_id: u64,
    },
    TriggerFailed {
        target_name: String,
        error: String,
    },
    StageStatus {
        execution_id: String,
        phase: PipelinePhase,
        job_id: u64,
        status: JobStatus,
    },
    Finished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

/// Latest known state of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct LiveExecution {
    pub execution: Execution,
    pub phase: PipelinePhase,
    pub provider_status: Option<JobStatus>,
}

/// What a status chip for a target shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetStatus {
    Execution { status: ExecutionStatus },
    /// The last trigger attempt failed before an execution existed.
    Error { message: String },
}

#[derive(Default)]
struct LiveState {
    executions: HashMap<String, LiveExecution>,
    trigger_errors: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct LiveCache {
    inner: Arc<RwLock<LiveState>>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an execution snapshot.
    pub fn upsert(&self, execution: &Execution) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.trigger_errors.remove(&execution.target_name);
        match state.executions.get_mut(&execution.id) {
            Some(entry) => entry.execution = execution.clone(),
            None => {
                state.executions.insert(
                    execution.id.clone(),
                    LiveExecution {
                        execution: execution.clone(),
                        phase: PipelinePhase::Parent,
                        provider_status: None,
                    },
                );
            }
        }
    }

    /// Record the latest provider status. Returns whether anything changed.
    pub fn record_stage(&self, id: &str, phase: PipelinePhase, status: &JobStatus) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match state.executions.get_mut(id) {
            Some(entry) => {
                let changed =
                    entry.phase != phase || entry.provider_status.as_ref() != Some(status);
                entry.phase = phase;
                entry.provider_status = Some(status.clone());
                changed
            }
            None => false,
        }
    }

    pub fn record_trigger_error(&self, target: &str, message: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state
            .trigger_errors
            .insert(target.to_string(), message.to_string());
    }

    pub fn get(&self, id: &str) -> Option<LiveExecution> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.executions.get(id).cloned()
    }

    /// All cached executions, newest first.
    pub fn snapshot(&self) -> Vec<LiveExecution> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<LiveExecution> = state.executions.values().cloned().collect();
        list.sort_by(|a, b| b.execution.created_at.cmp(&a.execution.created_at));
        list
    }

    /// Status of the most recent execution of `target`, or the trigger error
    /// that prevented one.
    pub fn target_status(&self, target: &str) -> Option<TargetStatus> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = state.trigger_errors.get(target) {
            return Some(TargetStatus::Error {
                message: message.clone(),
            });
        }
        state
            .executions
            .values()
            .filter(|e| e.execution.target_name == target)
            .max_by_key(|e| e.execution.created_at)
            .map(|e| TargetStatus::Execution {
                status: e.execution.status,
            })
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.executions.remove(id);
    }

    pub fn remove_target(&self, target: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state
            .executions
            .retain(|_, e| e.execution.target_name != target);
        state.trigger_errors.remove(target);
    }
}
