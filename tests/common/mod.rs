//! Scripted in-memory CI provider shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use cibench::config::{BenchmarkConfig, TrackerConfig};
use cibench::execution::ExecutionConfig;
use cibench::provider::{
    JobProvider, JobStatus, JobSummary, ProviderError, TriggerRequest, TriggerResponse,
};
use cibench::storage::{ExecutionStore, MeasurementStore};

pub const PROJECT: &str = "group/pipelines";

#[derive(Default)]
struct FakeState {
    next_job_id: u64,
    /// Replies per job id. The last reply repeats once the queue drains.
    statuses: HashMap<u64, VecDeque<JobStatus>>,
    status_errors: HashSet<u64>,
    default_status: Option<JobStatus>,
    jobs: HashMap<u64, Vec<JobSummary>>,
    logs: HashMap<u64, VecDeque<String>>,
    log_errors: HashSet<u64>,
    trigger_fails: bool,

    triggered: Vec<TriggerRequest>,
    cancelled: Vec<u64>,
    status_calls: Vec<u64>,
    list_calls: Vec<u64>,
}

/// A provider whose answers are set up by the test.
///
/// Triggered parent ids start at 100 and step by 2, so a parent's child
/// (`id + 1`) never collides with the next parent. Unscripted jobs report
/// `default_status` (success unless changed).
pub struct FakeProvider {
    state: Mutex<FakeState>,
    trigger_credential: bool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    pub fn without_trigger_credential() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(trigger_credential: bool) -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_job_id: 100,
                default_status: Some(JobStatus::Success),
                ..FakeState::default()
            }),
            trigger_credential,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn script_status(&self, job_id: u64, replies: &[JobStatus]) {
        self.with_state(|s| {
            s.statuses.insert(job_id, replies.iter().cloned().collect());
        });
    }

    pub fn set_next_job_id(&self, job_id: u64) {
        self.with_state(|s| s.next_job_id = job_id);
    }

    pub fn set_default_status(&self, status: JobStatus) {
        self.with_state(|s| s.default_status = Some(status));
    }

    pub fn fail_status(&self, job_id: u64) {
        self.with_state(|s| {
            s.status_errors.insert(job_id);
        });
    }

    pub fn fail_triggers(&self) {
        self.with_state(|s| s.trigger_fails = true);
    }

    /// Register a job under `stage_job_id` whose log replies are `logs`.
    pub fn add_job(&self, stage_job_id: u64, job_id: u64, name: &str, logs: &[&str]) {
        self.with_state(|s| {
            s.jobs.entry(stage_job_id).or_default().push(JobSummary {
                id: job_id,
                name: name.to_string(),
            });
            s.logs
                .insert(job_id, logs.iter().map(|l| l.to_string()).collect());
        });
    }

    pub fn fail_log(&self, job_id: u64) {
        self.with_state(|s| {
            s.log_errors.insert(job_id);
        });
    }

    pub fn triggered(&self) -> Vec<TriggerRequest> {
        self.with_state(|s| s.triggered.clone())
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.with_state(|s| s.cancelled.clone())
    }

    pub fn status_calls(&self) -> Vec<u64> {
        self.with_state(|s| s.status_calls.clone())
    }

    pub fn list_calls(&self) -> Vec<u64> {
        self.with_state(|s| s.list_calls.clone())
    }
}

fn next_reply<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait::async_trait]
impl JobProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn has_trigger_credential(&self) -> bool {
        self.trigger_credential
    }

    async fn trigger(
        &self,
        _project: &str,
        req: &TriggerRequest,
    ) -> Result<TriggerResponse, ProviderError> {
        if !self.trigger_credential {
            return Err(ProviderError::MissingTriggerCredential);
        }
        self.with_state(|s| {
            if s.trigger_fails {
                return Err(ProviderError::Api {
                    status: 500,
                    message: "trigger rejected".to_string(),
                });
            }
            s.triggered.push(req.clone());
            let job_id = s.next_job_id;
            s.next_job_id = s.next_job_id.saturating_add(2);
            Ok(TriggerResponse { job_id })
        })
    }

    async fn cancel(&self, _project: &str, job_id: u64) -> Result<u64, ProviderError> {
        self.with_state(|s| s.cancelled.push(job_id));
        Ok(job_id)
    }

    async fn get_status(&self, _project: &str, job_id: u64) -> Result<JobStatus, ProviderError> {
        self.with_state(|s| {
            s.status_calls.push(job_id);
            if s.status_errors.contains(&job_id) {
                return Err(ProviderError::Api {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            let scripted = s.statuses.get_mut(&job_id).and_then(next_reply);
            Ok(scripted
                .or_else(|| s.default_status.clone())
                .unwrap_or(JobStatus::Running))
        })
    }

    async fn list_jobs(
        &self,
        _project: &str,
        job_id: u64,
    ) -> Result<Vec<JobSummary>, ProviderError> {
        self.with_state(|s| {
            s.list_calls.push(job_id);
            Ok(s.jobs.get(&job_id).cloned().unwrap_or_default())
        })
    }

    async fn get_job_log(&self, _project: &str, job_id: u64) -> Result<String, ProviderError> {
        self.with_state(|s| {
            if s.log_errors.contains(&job_id) {
                return Err(ProviderError::Api {
                    status: 404,
                    message: "trace not found".to_string(),
                });
            }
            Ok(s.logs.get_mut(&job_id).and_then(next_reply).unwrap_or_default())
        })
    }
}

/// Fast polling so the scenarios finish in milliseconds.
pub fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        poll_interval_ms: 10,
        execution_timeout_secs: 5,
        log_retry_delay_ms: 10,
        log_retry_attempts: 3,
        execution: ExecutionConfig {
            branch: "main".to_string(),
            ..ExecutionConfig::default()
        },
    }
}

pub fn bench_config(trial_count: u32) -> BenchmarkConfig {
    BenchmarkConfig {
        trial_count,
        inter_trial_delay_ms: 10,
        targets: vec!["hello-world".to_string()],
        concurrent_runs: 2,
        ..BenchmarkConfig::default()
    }
}

pub async fn execution_store(dir: &tempfile::TempDir) -> ExecutionStore {
    let store = ExecutionStore::new(dir.path().join("cibench.db"));
    store.init().await.unwrap();
    store
}

pub async fn measurement_store(dir: &tempfile::TempDir) -> MeasurementStore {
    let store = MeasurementStore::new(dir.path().join("cibench.db"));
    store.init().await.unwrap();
    store
}
