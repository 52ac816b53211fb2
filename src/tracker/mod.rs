//! Execution tracker: drives one execution from trigger to a terminal
//! status, persisting every transition and broadcasting progress.
//!
//! Each execution has at most one polling chain. A chain polls the parent
//! stage, then the child stage (`parent + 1`), and finishes with the logs of
//! whichever stage decided the outcome. Terminal writes (from a chain or from
//! [`ExecutionTracker::stop`]) are serialized so the first terminal status wins.

pub mod live;
pub mod poll;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::live::{ExecutionEvent, LiveCache};
use self::poll::{fetch_job_logs, watch_job, PollSettings, StageOutcome};
use crate::config::TrackerConfig;
use crate::execution::{child_job_id, Execution, ExecutionConfig, JobLog, PipelinePhase};
use crate::logs::is_blank;
use crate::provider::{
    JobProvider, JobStatus, ProviderError, TriggerRequest, TriggerResponse,
};
use crate::status::{now_millis, ExecutionStatus};
use crate::storage::{ExecutionStore, StoreError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("unknown execution '{0}'")]
    UnknownExecution(String),

    #[error("execution '{0}' is already being tracked")]
    AlreadyTracked(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The single-execution field older callers set instead of a per-execution
/// record. Used only for its own `id`, and only when no record is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyExecution {
    pub id: String,
    pub target_name: String,
    pub job_id: u64,
}

/// Where an execution's job id comes from, resolved once per chain.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRef {
    PerExecution(Execution),
    Legacy(LegacyExecution),
}

impl JobRef {
    /// Resolve `id`. A legacy field naming a different execution is ignored.
    pub fn resolve(
        id: &str,
        record: Option<Execution>,
        legacy: Option<LegacyExecution>,
    ) -> Option<Self> {
        match (record, legacy) {
            (Some(execution), _) => Some(JobRef::PerExecution(execution)),
            (None, Some(legacy)) if legacy.id == id => Some(JobRef::Legacy(legacy)),
            _ => None,
        }
    }

    /// The execution record this reference stands for. Legacy references get
    /// a synthesized `Running` record.
    pub fn into_execution(self) -> Execution {
        match self {
            JobRef::PerExecution(execution) => execution,
            JobRef::Legacy(legacy) => Execution {
                id: legacy.id,
                target_name: legacy.target_name,
                job_id: legacy.job_id,
                created_at: now_millis(),
                status: ExecutionStatus::Running,
                job_logs: Vec::new(),
            },
        }
    }
}

struct TrackerInner {
    provider: Arc<dyn JobProvider>,
    project: Option<String>,
    store: ExecutionStore,
    live: LiveCache,
    config: TrackerConfig,
    events: broadcast::Sender<ExecutionEvent>,
    legacy: Mutex<Option<LegacyExecution>>,
    chains: Mutex<HashMap<String, CancellationToken>>,
    /// Serializes read-check-write of terminal statuses.
    transition: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ExecutionTracker {
    inner: Arc<TrackerInner>,
}

/// Removes a chain from the registry when polling ends, however it ends.
struct ChainGuard<'a> {
    chains: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        chains.remove(&self.id);
    }
}

impl ExecutionTracker {
    pub fn new(
        provider: Arc<dyn JobProvider>,
        store: ExecutionStore,
        project: Option<String>,
        config: TrackerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                provider,
                project: project.filter(|p| !p.is_empty()),
                store,
                live: LiveCache::new(),
                config,
                events,
                legacy: Mutex::new(None),
                chains: Mutex::new(HashMap::new()),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn live(&self) -> &LiveCache {
        &self.inner.live
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.inner.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Set the single-execution field directly.
    pub fn set_legacy_execution(&self, legacy: Option<LegacyExecution>) {
        *self.inner.legacy.lock().unwrap_or_else(|e| e.into_inner()) = legacy;
    }

    pub fn legacy_execution(&self) -> Option<LegacyExecution> {
        self.inner
            .legacy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a polling chain is currently attached to `id`.
    pub fn is_tracking(&self, id: &str) -> bool {
        let chains = self.inner.chains.lock().unwrap_or_else(|e| e.into_inner());
        chains.contains_key(id)
    }

    fn cancel_chain(&self, id: &str) {
        let chains = self.inner.chains.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = chains.get(id) {
            token.cancel();
        }
    }

    /// Forget the legacy field if `matches` holds for it.
    fn clear_legacy_if(&self, matches: impl Fn(&LegacyExecution) -> bool) {
        let mut legacy = self.inner.legacy.lock().unwrap_or_else(|e| e.into_inner());
        if legacy.as_ref().is_some_and(|l| matches(l)) {
            *legacy = None;
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn project(&self) -> Result<&str, TrackerError> {
        self.inner
            .project
            .as_deref()
            .ok_or_else(|| TrackerError::NotConfigured("no project id configured".to_string()))
    }

    // -----------------------------------------------------------------------
    // Trigger
    // -----------------------------------------------------------------------

    /// Trigger `target` with the default execution configuration.
    pub async fn trigger(&self, target: &str) -> Result<String, TrackerError> {
        let cfg = self.inner.config.execution.clone();
        self.trigger_with(target, &cfg).await
    }

    /// Trigger a pipeline for `target` and record a `Running` execution.
    ///
    /// Configuration and provider failures are reported as an `Error` status
    /// for the target in the live cache; nothing is persisted.
    pub async fn trigger_with(
        &self,
        target: &str,
        cfg: &ExecutionConfig,
    ) -> Result<String, TrackerError> {
        let project = match self.project() {
            Ok(p) if self.inner.provider.has_trigger_credential() => p.to_string(),
            Ok(_) => {
                return Err(self.trigger_failed(
                    target,
                    TrackerError::NotConfigured("no trigger credential configured".to_string()),
                ))
            }
            Err(e) => return Err(self.trigger_failed(target, e)),
        };

        let req = TriggerRequest {
            git_ref: cfg.branch.clone(),
            variables: cfg.variables(target),
        };
        let resp = match self
            .inner
            .provider
            .trigger(&project, &req)
            .await
            .and_then(TriggerResponse::checked)
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.trigger_failed(target, e.into())),
        };

        let execution = Execution::new(target, resp.job_id);
        self.inner.store.add(&execution).await?;
        self.set_legacy_execution(Some(LegacyExecution {
            id: execution.id.clone(),
            target_name: target.to_string(),
            job_id: resp.job_id,
        }));
        self.inner.live.upsert(&execution);

        info!(
            execution_id = %execution.id,
            target = %target,
            job_id = resp.job_id,
            "Execution triggered"
        );
        self.emit(ExecutionEvent::Triggered {
            execution_id: execution.id.clone(),
            target_name: target.to_string(),
            job_id: resp.job_id,
        });
        Ok(execution.id)
    }

    fn trigger_failed(&self, target: &str, err: TrackerError) -> TrackerError {
        let message = err.to_string();
        warn!(target = %target, error = %message, "Trigger failed");
        self.inner.live.record_trigger_error(target, &message);
        self.emit(ExecutionEvent::TriggerFailed {
            target_name: target.to_string(),
            error: message,
        });
        err
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Trigger `target` and wait for its terminal status.
    pub async fn execute(&self, target: &str) -> Result<(String, ExecutionStatus), TrackerError> {
        let id = self.trigger(target).await?;
        let status = self.poll_until_terminal(&id).await?;
        Ok((id, status))
    }

    async fn resolve(&self, id: &str) -> Result<Execution, TrackerError> {
        let record = self.inner.store.get_by_id(id).await?;
        JobRef::resolve(id, record, self.legacy_execution())
            .map(JobRef::into_execution)
            .ok_or_else(|| TrackerError::UnknownExecution(id.to_string()))
    }

    /// Poll `id` until it reaches a terminal status and return that status.
    ///
    /// Provider errors while polling status are returned; the caller decides
    /// whether to start a new chain.
    pub async fn poll_until_terminal(&self, id: &str) -> Result<ExecutionStatus, TrackerError> {
        let token = CancellationToken::new();
        {
            let mut chains = self.inner.chains.lock().unwrap_or_else(|e| e.into_inner());
            if chains.contains_key(id) {
                return Err(TrackerError::AlreadyTracked(id.to_string()));
            }
            chains.insert(id.to_string(), token.clone());
        }
        let _guard = ChainGuard {
            chains: &self.inner.chains,
            id: id.to_string(),
        };

        let execution = self.resolve(id).await?;
        if execution.status.is_terminal() {
            return Ok(execution.status);
        }
        let project = self.project()?.to_string();
        self.inner.live.upsert(&execution);

        let settings = PollSettings::from(&self.inner.config);
        let started = Instant::now();
        let parent = execution.job_id;
        debug!(execution_id = %id, job_id = parent, "Polling parent stage");

        let outcome = watch_job(
            self.inner.provider.as_ref(),
            &project,
            parent,
            &settings,
            started,
            &token,
            |s| self.stage_status(id, PipelinePhase::Parent, parent, s),
        )
        .await?;

        match outcome {
            StageOutcome::Cancelled => self.current_status(id).await,
            StageOutcome::TimedOut => {
                self.finish(execution, ExecutionStatus::TimedOut, Vec::new())
                    .await
            }
            StageOutcome::Failed => {
                self.complete(execution, ExecutionStatus::Failed, parent, &token)
                    .await
            }
            StageOutcome::Succeeded => {
                let child = child_job_id(parent);
                debug!(execution_id = %id, job_id = child, "Polling child stage");
                let outcome = watch_job(
                    self.inner.provider.as_ref(),
                    &project,
                    child,
                    &settings,
                    started,
                    &token,
                    |s| self.stage_status(id, PipelinePhase::Child, child, s),
                )
                .await?;

                match outcome {
                    StageOutcome::Cancelled => self.current_status(id).await,
                    StageOutcome::TimedOut => {
                        self.finish(execution, ExecutionStatus::TimedOut, Vec::new()).await
                    }
                    StageOutcome::Succeeded => {
                        self.complete(execution, ExecutionStatus::Completed, child, &token)
                            .await
                    }
                    StageOutcome::Failed => {
                        self.complete(execution, ExecutionStatus::Failed, child, &token)
                            .await
                    }
                }
            }
        }
    }

    fn stage_status(
        &self,
        id: &str,
        phase: PipelinePhase,
        job_id: u64,
        status: &JobStatus,
    ) {
        if self.inner.live.record_stage(id, phase, status) {
            debug!(execution_id = %id, %phase, job_id, %status, "Stage status changed");
            self.emit(ExecutionEvent::StageStatus {
                execution_id: id.to_string(),
                phase,
                job_id,
                status: status.clone(),
            });
        }
    }

    /// Completion step: fetch logs of `log_job_id`, retrying while every log
    /// is still empty, then record `status`.
    async fn complete(
        &self,
        execution: Execution,
        status: ExecutionStatus,
        log_job_id: u64,
        token: &CancellationToken,
    ) -> Result<ExecutionStatus, TrackerError> {
        let project = self.project()?.to_string();
        let attempts = self.inner.config.log_retry_attempts.max(1);

        let mut attempt = 1;
        let logs = loop {
            let logs =
                fetch_job_logs(self.inner.provider.as_ref(), &project, log_job_id).await?;
            if !logs.iter().all(|l| is_blank(&l.log)) {
                break logs;
            }
            if attempt >= attempts {
                warn!(
                    execution_id = %execution.id,
                    job_id = log_job_id,
                    attempts,
                    "Logs still empty, recording without content"
                );
                break logs;
            }
            debug!(execution_id = %execution.id, attempt, "Logs not yet available, retrying");
            attempt += 1;
            tokio::select! {
                _ = token.cancelled() => return self.current_status(&execution.id).await,
                _ = tokio::time::sleep(self.inner.config.log_retry_delay()) => {}
            }
        };

        self.finish(execution, status, logs).await
    }

    /// Write a terminal status unless another terminal status got there first.
    async fn finish(
        &self,
        mut execution: Execution,
        status: ExecutionStatus,
        logs: Vec<JobLog>,
    ) -> Result<ExecutionStatus, TrackerError> {
        let _lock = self.inner.transition.lock().await;

        match self.inner.store.get_by_id(&execution.id).await? {
            Some(stored) if stored.status.is_terminal() => return Ok(stored.status),
            Some(_) => {}
            // Deleted while the chain ran, unless it only ever lived in the
            // legacy field.
            None => {
                let legacy_id = self.legacy_execution().map(|l| l.id);
                if legacy_id.as_deref() != Some(execution.id.as_str()) {
                    debug!(execution_id = %execution.id, "Execution deleted, dropping result");
                    return Err(TrackerError::UnknownExecution(execution.id));
                }
            }
        }

        execution.status = status;
        execution.job_logs = logs;
        self.inner.store.update(&execution).await?;
        self.inner.live.upsert(&execution);

        info!(
            execution_id = %execution.id,
            target = %execution.target_name,
            %status,
            jobs = execution.job_logs.len(),
            "Execution finished"
        );
        self.emit(ExecutionEvent::Finished {
            execution_id: execution.id.clone(),
            status,
        });
        Ok(status)
    }

    async fn current_status(&self, id: &str) -> Result<ExecutionStatus, TrackerError> {
        Ok(self.resolve(id).await?.status)
    }

    // -----------------------------------------------------------------------
    // Stop / delete / resume
    // -----------------------------------------------------------------------

    /// Cancel an execution. Idempotent: an already-terminal execution is left
    /// as it is and its status returned.
    pub async fn stop(&self, id: &str) -> Result<ExecutionStatus, TrackerError> {
        self.cancel_chain(id);

        let _lock = self.inner.transition.lock().await;
        let mut execution = self.resolve(id).await?;
        if execution.status.is_terminal() {
            debug!(execution_id = %id, status = %execution.status, "Stop on terminal execution");
            return Ok(execution.status);
        }

        match self.project() {
            Ok(project) => {
                for job_id in [execution.job_id, execution.child_job_id()] {
                    if let Err(e) = self.inner.provider.cancel(project, job_id).await {
                        warn!(execution_id = %id, job_id, error = %e, "Cancel request failed");
                    }
                }
            }
            Err(e) => warn!(execution_id = %id, error = %e, "Skipping provider cancel"),
        }

        execution.status = ExecutionStatus::Canceled;
        self.inner.store.update(&execution).await?;
        self.inner.live.upsert(&execution);

        info!(execution_id = %id, target = %execution.target_name, "Execution canceled");
        self.emit(ExecutionEvent::Finished {
            execution_id: id.to_string(),
            status: ExecutionStatus::Canceled,
        });
        Ok(ExecutionStatus::Canceled)
    }

    /// Delete one execution record. A running chain for it is cancelled.
    pub async fn delete(&self, id: &str) -> Result<bool, TrackerError> {
        self.cancel_chain(id);
        self.clear_legacy_if(|l| l.id == id);
        self.inner.live.remove(id);
        Ok(self.inner.store.delete(id).await?)
    }

    /// Delete the whole history of `target`.
    pub async fn delete_target(&self, target: &str) -> Result<usize, TrackerError> {
        for execution in self.inner.store.get_by_target_name(target).await? {
            self.cancel_chain(&execution.id);
        }
        self.clear_legacy_if(|l| l.target_name == target);
        self.inner.live.remove_target(target);
        let removed = self.inner.store.delete_by_target_name(target).await?;
        info!(target = %target, removed, "Execution history deleted");
        Ok(removed)
    }

    /// Poll `id` on a background task, logging the outcome.
    pub fn spawn_tracking(&self, id: String) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            match tracker.poll_until_terminal(&id).await {
                Ok(status) => debug!(execution_id = %id, %status, "Tracking ended"),
                Err(TrackerError::AlreadyTracked(_)) => {}
                Err(TrackerError::UnknownExecution(_)) => {
                    debug!(execution_id = %id, "Execution removed while tracked")
                }
                Err(e) => error!(execution_id = %id, error = %e, "Tracking failed"),
            }
        })
    }

    /// Re-attach polling chains to every stored execution still `Running`,
    /// e.g. after a process restart. Returns the handles of the new chains.
    pub async fn resume_incomplete(
        &self,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, TrackerError> {
        let running = self.inner.store.get_running().await?;
        let mut handles = Vec::new();
        for execution in running {
            if self.is_tracking(&execution.id) {
                continue;
            }
            info!(execution_id = %execution.id, target = %execution.target_name, "Resuming tracking");
            self.inner.live.upsert(&execution);
            handles.push(self.spawn_tracking(execution.id));
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ref_prefers_record() {
        let record = Execution::new("dt-a", 10);
        let legacy = LegacyExecution {
            id: "exec-1".to_string(),
            target_name: "dt-b".to_string(),
            job_id: 99,
        };
        let r = JobRef::resolve(&record.id, Some(record.clone()), Some(legacy.clone())).unwrap();
        assert_eq!(r, JobRef::PerExecution(record));

        let r = JobRef::resolve("exec-1", None, Some(legacy.clone())).unwrap();
        let synthesized = r.into_execution();
        assert_eq!(synthesized.id, "exec-1");
        assert_eq!(synthesized.job_id, 99);
        assert_eq!(synthesized.status, ExecutionStatus::Running);

        assert!(JobRef::resolve("exec-2", None, Some(legacy)).is_none());
        assert!(JobRef::resolve("exec-1", None, None).is_none());
    }
}
