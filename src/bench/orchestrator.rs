//! The benchmark run loop and its stop / continue / restart controls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::context::{ActivePipeline, RunContext};
use super::executor::{RunSettings, TrialExecutor};
use super::{
    compute_average_time, compute_final_status, BenchError, BenchmarkTask, TaskFunction,
    TaskReport, TaskStatus, Trial, TrialError,
};
use crate::config::{BenchmarkConfig, TrackerConfig};
use crate::execution::child_job_id;
use crate::provider::JobProvider;
use crate::status::now_millis;
use crate::storage::MeasurementStore;
use crate::tracker::poll::PollSettings;

const EVENT_CAPACITY: usize = 256;

/// Progress notifications of a benchmark run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BenchEvent {
    RunStarted { start_index: usize },
    TaskUpdated { index: usize, report: TaskReport },
    TrialsUpdated { index: usize, trials: Vec<Trial> },
    RunFinished { stopped: bool },
}

struct OrchestratorInner {
    provider: Arc<dyn JobProvider>,
    project: Option<String>,
    measurements: MeasurementStore,
    poll: PollSettings,
    inter_trial_delay: Duration,
    tasks: Mutex<Vec<BenchmarkTask>>,
    settings: Arc<Mutex<RunSettings>>,
    context: Mutex<Option<Arc<RunContext>>>,
    running: watch::Sender<bool>,
    restarting: AtomicBool,
    events: broadcast::Sender<BenchEvent>,
}

/// Single active run at a time. Clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

/// Held for the lifetime of a run. Dropping it restores the settings saved
/// when the run began and clears the run flag.
struct RunGuard {
    orchestrator: Orchestrator,
    ctx: Arc<RunContext>,
    saved: RunSettings,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let inner = &self.orchestrator.inner;
        *inner.settings.lock().unwrap_or_else(|e| e.into_inner()) = self.saved.clone();
        *inner.context.lock().unwrap_or_else(|e| e.into_inner()) = None;
        inner.running.send_replace(false);
        let _ = inner.events.send(BenchEvent::RunFinished {
            stopped: self.ctx.should_stop(),
        });
    }
}

struct RestartFlag<'a>(&'a AtomicBool);

impl Drop for RestartFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn JobProvider>,
        project: Option<String>,
        measurements: MeasurementStore,
        tracker: &TrackerConfig,
        bench: &BenchmarkConfig,
        tasks: Vec<BenchmarkTask>,
    ) -> Self {
        let settings = RunSettings {
            trial_count: bench.trial_count,
            primary: tracker.execution.clone(),
            secondary: bench.secondary.clone(),
            targets: bench.targets.clone(),
            concurrent_runs: bench.concurrent_runs,
        };
        let (running, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(OrchestratorInner {
                provider,
                project: project.filter(|p| !p.is_empty()),
                measurements,
                poll: PollSettings::from(tracker),
                inter_trial_delay: bench.inter_trial_delay(),
                tasks: Mutex::new(tasks),
                settings: Arc::new(Mutex::new(settings)),
                context: Mutex::new(None),
                running,
                restarting: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Snapshot of every task, in run order.
    pub fn tasks(&self) -> Vec<TaskReport> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.iter().map(|t| t.report.clone()).collect()
    }

    pub fn settings(&self) -> RunSettings {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the run settings. Refused while a run is active.
    pub fn set_settings(&self, settings: RunSettings) -> Result<(), BenchError> {
        if self.is_running() {
            return Err(BenchError::AlreadyRunning);
        }
        *self.inner.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    /// In-flight pipelines of the current trial.
    pub fn active_pipelines(&self) -> Vec<ActivePipeline> {
        match self.context() {
            Some(ctx) => ctx.active(),
            None => Vec::new(),
        }
    }

    fn context(&self) -> Option<Arc<RunContext>> {
        self.inner
            .context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn emit(&self, event: BenchEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_task(&self, index: usize) {
        let report = {
            let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.get(index).map(|t| t.report.clone())
        };
        if let Some(report) = report {
            self.emit(BenchEvent::TaskUpdated { index, report });
        }
    }

    fn with_task<T>(&self, index: usize, f: impl FnOnce(&mut BenchmarkTask) -> T) -> Option<T> {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get_mut(index).map(f)
    }

    fn task_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Claim the single run slot.
    fn begin(&self) -> Result<RunGuard, BenchError> {
        if self.inner.running.send_replace(true) {
            return Err(BenchError::AlreadyRunning);
        }
        let ctx = Arc::new(RunContext::new());
        *self.inner.context.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx.clone());
        Ok(RunGuard {
            orchestrator: self.clone(),
            ctx,
            saved: self.settings(),
        })
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Reset every task and run them all from the first.
    pub async fn start(&self) -> Result<(), BenchError> {
        let guard = self.begin()?;
        self.reset_tasks();
        self.run_with(guard, 0, Vec::new()).await;
        Ok(())
    }

    /// Run tasks from `start_index`, seeding that task with `carry_over`
    /// trials from an earlier partial run.
    pub async fn run(&self, start_index: usize, carry_over: Vec<Trial>) -> Result<(), BenchError> {
        let guard = self.begin()?;
        self.run_with(guard, start_index, carry_over).await;
        Ok(())
    }

    async fn run_with(&self, guard: RunGuard, start_index: usize, carry_over: Vec<Trial>) {
        let ctx = guard.ctx.clone();
        let trial_count = guard.saved.trial_count;

        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks.iter_mut() {
                if task.report.status == TaskStatus::NotStarted {
                    task.report.status = TaskStatus::Pending;
                }
            }
        }

        info!(start_index, trial_count, "Benchmark run started");
        self.emit(BenchEvent::RunStarted { start_index });

        let executor = TrialExecutor::new(
            self.inner.provider.clone(),
            self.inner.project.clone(),
            ctx.clone(),
            self.inner.settings.clone(),
            self.inner.poll,
        );

        let mut carry_over = Some(carry_over);
        for index in start_index..self.task_count() {
            if ctx.should_stop() {
                debug!(index, "Run stopped, leaving remaining tasks");
                break;
            }
            let carried = carry_over.take().unwrap_or_default();
            self.run_task(&ctx, &executor, index, trial_count, carried)
                .await;
        }

        info!(stopped = ctx.should_stop(), "Benchmark run finished");
        drop(guard);
    }

    async fn run_task(
        &self,
        ctx: &RunContext,
        executor: &TrialExecutor,
        index: usize,
        trial_count: u32,
        carried: Vec<Trial>,
    ) {
        let setup = self.with_task(index, |task| {
            task.report.status = TaskStatus::Running;
            if carried.is_empty() {
                task.report.start_time = Some(now_millis());
            }
            task.report.end_time = None;
            task.report.expected_trials = Some(trial_count);
            task.report.trials = carried;
            (task.function.clone(), task.report.name.clone(), task.report.trials.len())
        });
        let Some((function, name, already)) = setup else {
            return;
        };
        self.emit_task(index);

        let remaining = trial_count.saturating_sub(already as u32);
        info!(task = %name, already, remaining, "Task started");

        for n in 0..remaining {
            if ctx.should_stop() {
                break;
            }
            if n > 0 {
                tokio::select! {
                    _ = ctx.token().cancelled() => break,
                    _ = tokio::time::sleep(self.inner.inter_trial_delay) => {}
                }
            }

            let trial = run_trial(ctx, executor, function.as_ref()).await;
            match trial.display_error() {
                Some(err) => warn!(task = %name, trial = n, error = %err, "Trial failed"),
                None => debug!(task = %name, trial = n, status = %trial.status, "Trial finished"),
            }
            ctx.clear_completed();

            let trials = self
                .with_task(index, |task| {
                    task.report.trials.push(trial);
                    task.report.trials.clone()
                })
                .unwrap_or_default();
            self.emit(BenchEvent::TrialsUpdated { index, trials });
        }

        let archive = self.with_task(index, |task| {
            let report = &mut task.report;
            report.status = compute_final_status(&report.trials, trial_count, ctx.should_stop());
            report.average_time = compute_average_time(&report.trials);
            report.end_time = Some(now_millis());
            (report.status == TaskStatus::Success).then(|| report.clone())
        });
        self.emit_task(index);

        if let Some(Some(report)) = archive {
            info!(task = %name, average = ?report.average_time, "Task succeeded, archiving");
            if let Err(e) = self.inner.measurements.add(&report).await {
                warn!(task = %name, error = %e, "Failed to archive task");
            }
        } else {
            info!(task = %name, "Task finished without archiving");
        }
    }

    // -----------------------------------------------------------------------
    // Controls
    // -----------------------------------------------------------------------

    /// Stop the active run: set the stop flag, cancel every in-flight
    /// pipeline (best effort) and mark pending tasks `Stopped`.
    pub async fn stop_all(&self) {
        if let Some(ctx) = self.context() {
            ctx.request_stop();
            if let Some(project) = self.inner.project.as_deref() {
                for pipeline in ctx.active() {
                    for job_id in [pipeline.job_id, child_job_id(pipeline.job_id)] {
                        if let Err(e) = self.inner.provider.cancel(project, job_id).await {
                            warn!(job_id, error = %e, "Cancel request failed");
                        }
                    }
                }
            }
        }

        let stopped: Vec<usize> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks
                .iter_mut()
                .enumerate()
                .filter(|(_, t)| t.report.status == TaskStatus::Pending)
                .map(|(i, t)| {
                    t.report.status = TaskStatus::Stopped;
                    i
                })
                .collect()
        };
        for index in stopped {
            self.emit_task(index);
        }
        info!("Benchmark stop requested");
    }

    /// Resume from the first `Stopped` or `Pending` task, keeping the trials
    /// of that task that reached a verdict. No-op if every task is done.
    pub async fn continue_run(&self) -> Result<(), BenchError> {
        if self.is_running() {
            return Err(BenchError::AlreadyRunning);
        }
        if self.resume_index().is_none() {
            debug!("Nothing to continue");
            return Ok(());
        }
        let guard = self.begin()?;

        let resume = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let found = tasks.iter().position(|t| {
                matches!(t.report.status, TaskStatus::Stopped | TaskStatus::Pending)
            });
            found.map(|index| {
                let kept: Vec<Trial> = tasks[index]
                    .report
                    .trials
                    .iter()
                    .filter(|t| t.is_complete())
                    .cloned()
                    .collect();
                for task in tasks.iter_mut().skip(index) {
                    let start_time = task.report.start_time;
                    task.report.reset();
                    task.report.status = TaskStatus::Pending;
                    task.report.start_time = start_time;
                }
                (index, kept)
            })
        };

        match resume {
            Some((index, kept)) => {
                info!(index, kept = kept.len(), "Continuing benchmark run");
                self.run_with(guard, index, kept).await;
            }
            None => debug!("Nothing to continue"),
        }
        Ok(())
    }

    fn resume_index(&self) -> Option<usize> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .position(|t| matches!(t.report.status, TaskStatus::Stopped | TaskStatus::Pending))
    }

    /// Stop any active run, wait for it to unwind and start over.
    /// A call made while another restart is in progress does nothing.
    pub async fn restart(&self) -> Result<(), BenchError> {
        if self.inner.restarting.swap(true, Ordering::SeqCst) {
            debug!("Restart already in progress");
            return Ok(());
        }
        let flag = RestartFlag(&self.inner.restarting);

        self.stop_all().await;
        let mut rx = self.inner.running.subscribe();
        // The sender lives in `inner`, so this only returns once idle.
        let _ = rx.wait_for(|running| !*running).await;

        let guard = self.begin()?;
        drop(flag);
        self.reset_tasks();
        info!("Benchmark restarted");
        self.run_with(guard, 0, Vec::new()).await;
        Ok(())
    }

    fn reset_tasks(&self) {
        let count = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks.iter_mut() {
                task.report.reset();
            }
            tasks.len()
        };
        for index in 0..count {
            self.emit_task(index);
        }
    }
}

/// One invocation of a task function.
async fn run_trial(ctx: &RunContext, executor: &TrialExecutor, function: &dyn TaskFunction) -> Trial {
    ctx.reset_trial();
    let mut trial = Trial::started();

    match function.run(executor).await {
        Ok(results) => {
            trial.status = if results.iter().all(|r| r.succeeded()) {
                TaskStatus::Success
            } else {
                TaskStatus::Failure
            };
            trial.results = results;
        }
        Err(e) => {
            trial.results = ctx.partial_results();
            trial.status = if e.stop_reason().is_some() {
                TaskStatus::Stopped
            } else {
                TaskStatus::Failure
            };
            trial.error = Some(TrialError::from(&e));
        }
    }

    trial.end_time = Some(now_millis());
    trial
}
