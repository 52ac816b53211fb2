//! Benchmark orchestration: run an ordered list of tasks, each for a fixed
//! number of trials, on top of the same polling primitives as the tracker.

pub mod context;
pub mod executor;
pub mod orchestrator;
pub mod report;
pub mod tasks;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::ExecutionConfig;
use crate::provider::ProviderError;
use crate::status::now_millis;
use crate::storage::StoreError;

pub use context::{ActivePipeline, RunContext};
pub use executor::{RunSettings, TrialExecutor};
pub use orchestrator::{BenchEvent, Orchestrator};

/// Result string of a pipeline that reached child `success`.
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILED: &str = "failed";
pub const RESULT_TIMEOUT: &str = "timeout";

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("stopped by user")]
    Stopped,

    #[error("a benchmark run is already active")]
    AlreadyRunning,

    #[error("unknown task index {0}")]
    UnknownTask(usize),

    #[error("task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BenchError {
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            BenchError::Stopped => Some(StopReason::UserRequested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Pending,
    Running,
    Success,
    Failure,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialError {
    pub message: String,
    pub cause: Option<String>,
    /// Set when the trial ended because of a stop request.
    pub stop_reason: Option<StopReason>,
}

impl From<&BenchError> for TrialError {
    fn from(err: &BenchError) -> Self {
        let cause = match err {
            BenchError::Provider(e) => std::error::Error::source(e).map(|s| s.to_string()),
            BenchError::Store(e) => std::error::Error::source(e).map(|s| s.to_string()),
            _ => None,
        };
        Self {
            message: err.to_string(),
            cause,
            stop_reason: err.stop_reason(),
        }
    }
}

/// Outcome of one pipeline run inside a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub target_name: String,
    /// Parent job id; `None` when the trigger itself failed.
    pub job_id: Option<u64>,
    pub status: String,
    pub config: ExecutionConfig,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == RESULT_SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Epoch milliseconds.
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub results: Vec<ExecutionResult>,
    pub status: TaskStatus,
    pub error: Option<TrialError>,
}

impl Trial {
    pub fn started() -> Self {
        Self {
            start_time: Some(now_millis()),
            end_time: None,
            results: Vec::new(),
            status: TaskStatus::Running,
            error: None,
        }
    }

    /// Duration in seconds, if both ends are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start) as f64 / 1000.0),
            _ => None,
        }
    }

    /// Error text to show to a user. Stops are not errors.
    pub fn display_error(&self) -> Option<&str> {
        match &self.error {
            Some(e) if e.stop_reason.is_none() => Some(e.message.as_str()),
            _ => None,
        }
    }

    /// Whether the trial ran to a verdict (kept when a run is continued).
    pub fn is_complete(&self) -> bool {
        matches!(self.status, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// Serializable state of a benchmark task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub description: String,
    pub trials: Vec<Trial>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Mean trial duration in seconds.
    pub average_time: Option<f64>,
    pub status: TaskStatus,
    /// Trial count frozen when the task started running.
    pub expected_trials: Option<u32>,
}

impl TaskReport {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            trials: Vec::new(),
            start_time: None,
            end_time: None,
            average_time: None,
            status: TaskStatus::NotStarted,
            expected_trials: None,
        }
    }

    /// Back to the state of a freshly defined task.
    pub fn reset(&mut self) {
        *self = Self::new(&self.name, &self.description);
    }
}

/// The executable part of a task.
#[async_trait::async_trait]
pub trait TaskFunction: Send + Sync {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError>;
}

#[derive(Clone)]
pub struct BenchmarkTask {
    pub report: TaskReport,
    pub function: Arc<dyn TaskFunction>,
}

impl BenchmarkTask {
    pub fn new(name: &str, description: &str, function: Arc<dyn TaskFunction>) -> Self {
        Self {
            report: TaskReport::new(name, description),
            function,
        }
    }
}

/// Final status of a task from its trials.
///
/// `Stopped` wins if the run was stopped short of `expected` trials or any
/// trial was stopped, then `Failure` if any trial failed, else `Success`.
pub fn compute_final_status(trials: &[Trial], expected: u32, was_stopped: bool) -> TaskStatus {
    if was_stopped && (trials.len() as u32) < expected {
        return TaskStatus::Stopped;
    }
    if trials.iter().any(|t| t.status == TaskStatus::Stopped) {
        return TaskStatus::Stopped;
    }
    if trials.iter().any(|t| t.status == TaskStatus::Failure) {
        return TaskStatus::Failure;
    }
    TaskStatus::Success
}

/// Mean duration in seconds over trials with both timestamps.
pub fn compute_average_time(trials: &[Trial]) -> Option<f64> {
    let durations: Vec<f64> = trials.iter().filter_map(Trial::duration_secs).collect();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<f64>() / durations.len() as f64)
}
