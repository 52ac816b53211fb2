//! Benchmark orchestrator scenarios against the scripted provider.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cibench::bench::tasks::{RunnerComparison, SingleRun};
use cibench::bench::{
    BenchError, BenchmarkTask, ExecutionResult, Orchestrator, StopReason, TaskFunction,
    TaskStatus, TrialExecutor,
};
use cibench::execution::ExecutionConfig;
use cibench::provider::JobStatus;
use cibench::storage::MeasurementStore;

use common::{bench_config, measurement_store, tracker_config, FakeProvider, PROJECT};

fn result(status: &str) -> ExecutionResult {
    ExecutionResult {
        target_name: "hello-world".to_string(),
        job_id: Some(1),
        status: status.to_string(),
        config: ExecutionConfig::default(),
    }
}

/// Succeeds, fails, then stops the run; succeeds on every later call.
struct StopOnThird {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl TaskFunction for StopOnThird {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(vec![result("success")]),
            1 => Ok(vec![result("failed")]),
            2 => {
                executor.context().request_stop();
                Err(BenchError::Stopped)
            }
            _ => Ok(vec![result("success")]),
        }
    }
}

struct AlwaysSucceeds;

#[async_trait::async_trait]
impl TaskFunction for AlwaysSucceeds {
    async fn run(&self, _executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        Ok(vec![result("success")])
    }
}

fn orchestrator(
    provider: Arc<FakeProvider>,
    measurements: MeasurementStore,
    trials: u32,
    tasks: Vec<BenchmarkTask>,
) -> Orchestrator {
    Orchestrator::new(
        provider,
        Some(PROJECT.to_string()),
        measurements,
        &tracker_config(),
        &bench_config(trials),
        tasks,
    )
}

fn single_run() -> BenchmarkTask {
    BenchmarkTask::new(
        "Single Run",
        "One pipeline of hello-world",
        Arc::new(SingleRun {
            target: "hello-world".to_string(),
        }),
    )
}

#[tokio::test]
async fn test_successful_task_is_archived() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    let measurements = measurement_store(&dir).await;
    let orch = orchestrator(provider.clone(), measurements.clone(), 3, vec![single_run()]);

    orch.start().await.unwrap();

    let task = &orch.tasks()[0];
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.trials.len(), 3);
    assert_eq!(task.expected_trials, Some(3));
    assert!(task.average_time.is_some());
    assert!(task.trials.iter().all(|t| t.results[0].status == "success"));
    assert_eq!(provider.triggered().len(), 3);
    assert!(!orch.is_running());

    let archived = measurements.get_all().await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].task.name, "Single Run");
    assert_eq!(archived[0].task.trials.len(), 3);
}

#[tokio::test]
async fn test_failed_pipeline_fails_trial_and_skips_archive() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    provider.script_status(101, &[JobStatus::Failed]);
    let measurements = measurement_store(&dir).await;
    let orch = orchestrator(provider.clone(), measurements.clone(), 2, vec![single_run()]);

    orch.start().await.unwrap();

    let task = &orch.tasks()[0];
    assert_eq!(task.trials[0].status, TaskStatus::Failure);
    assert_eq!(task.trials[0].results[0].status, "failed");
    assert_eq!(task.trials[1].status, TaskStatus::Success);
    assert_eq!(task.status, TaskStatus::Failure);
    assert!(measurements.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_failure_is_a_failed_result() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    provider.fail_triggers();
    let orch = orchestrator(
        provider.clone(),
        measurement_store(&dir).await,
        1,
        vec![single_run()],
    );

    orch.start().await.unwrap();

    let trial = &orch.tasks()[0].trials[0];
    assert_eq!(trial.status, TaskStatus::Failure);
    assert_eq!(trial.results[0].job_id, None);
    assert!(trial.error.is_none());
}

#[tokio::test]
async fn test_continue_runs_only_remaining_trials() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    let function = Arc::new(StopOnThird {
        calls: AtomicUsize::new(0),
    });
    let tasks = vec![
        BenchmarkTask::new("Flaky", "stops on the third trial", function.clone()),
        BenchmarkTask::new("Follow-up", "always succeeds", Arc::new(AlwaysSucceeds)),
    ];
    let orch = orchestrator(provider, measurement_store(&dir).await, 3, tasks);

    orch.start().await.unwrap();

    let before = orch.tasks();
    assert_eq!(before[0].status, TaskStatus::Stopped);
    assert_eq!(before[0].trials.len(), 3);
    let stopped = &before[0].trials[2];
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert_eq!(
        stopped.error.as_ref().and_then(|e| e.stop_reason),
        Some(StopReason::UserRequested)
    );
    assert!(stopped.display_error().is_none());
    assert_eq!(before[1].status, TaskStatus::Pending);

    orch.continue_run().await.unwrap();

    let after = orch.tasks();
    assert_eq!(function.calls.load(Ordering::SeqCst), 4);
    assert_eq!(after[0].trials.len(), 3);
    assert_eq!(after[0].trials[..2], before[0].trials[..2]);
    assert_eq!(after[0].trials[2].status, TaskStatus::Success);
    assert_eq!(after[0].start_time, before[0].start_time);
    assert_eq!(after[0].status, TaskStatus::Failure);
    assert_eq!(after[1].status, TaskStatus::Success);
}

#[tokio::test]
async fn test_continue_without_stopped_task_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    let tasks = vec![BenchmarkTask::new("Ok", "always succeeds", Arc::new(AlwaysSucceeds))];
    let orch = orchestrator(provider, measurement_store(&dir).await, 1, tasks);

    orch.start().await.unwrap();
    let before = orch.tasks();
    let mut events = orch.subscribe();
    orch.continue_run().await.unwrap();
    assert_eq!(orch.tasks(), before);
    assert!(!orch.is_running());
    // a no-op never claims the run slot
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_all_cancels_active_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    provider.script_status(100, &[JobStatus::Running]);
    let tasks = vec![
        single_run(),
        BenchmarkTask::new("Ok", "always succeeds", Arc::new(AlwaysSucceeds)),
    ];
    let orch = orchestrator(provider.clone(), measurement_store(&dir).await, 2, tasks);

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.active_pipelines().len(), 1);

    orch.stop_all().await;
    run.await.unwrap().unwrap();

    assert_eq!(provider.cancelled(), vec![100, 101]);
    let tasks = orch.tasks();
    assert_eq!(tasks[0].status, TaskStatus::Stopped);
    assert_eq!(tasks[1].status, TaskStatus::Stopped);

    let trial = &tasks[0].trials[0];
    assert_eq!(trial.status, TaskStatus::Stopped);
    assert_eq!(trial.results.len(), 1);
    assert_eq!(trial.results[0].job_id, Some(100));
    assert_eq!(trial.results[0].status, "running");
    assert!(orch.active_pipelines().is_empty());
}

#[tokio::test]
async fn test_second_run_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    provider.script_status(100, &[JobStatus::Running]);
    let orch = orchestrator(provider, measurement_store(&dir).await, 1, vec![single_run()]);

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.start().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(orch.start().await, Err(BenchError::AlreadyRunning)));
    assert!(matches!(orch.run(0, Vec::new()).await, Err(BenchError::AlreadyRunning)));

    orch.stop_all().await;
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_restarts_start_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    // only the first pipeline hangs; the restarted run gets fresh job ids
    provider.script_status(100, &[JobStatus::Running]);
    let orch = orchestrator(provider.clone(), measurement_store(&dir).await, 1, vec![single_run()]);

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (a, b) = tokio::join!(orch.restart(), orch.restart());
    a.unwrap();
    b.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(provider.triggered().len(), 2);
    let task = &orch.tasks()[0];
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.trials.len(), 1);
    assert_eq!(task.trials[0].results[0].job_id, Some(102));
}

#[tokio::test]
async fn test_secondary_override_is_restored_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new();
    let override_cfg = ExecutionConfig {
        branch: "next".to_string(),
        runner_tag: "gpu-runner".to_string(),
        ..ExecutionConfig::default()
    };
    let tasks = vec![BenchmarkTask::new(
        "Runner Comparison",
        "primary vs secondary",
        Arc::new(RunnerComparison {
            target: "hello-world".to_string(),
            secondary: Some(override_cfg),
        }),
    )];
    let orch = orchestrator(provider.clone(), measurement_store(&dir).await, 1, tasks);
    let original = orch.settings();

    orch.start().await.unwrap();

    assert_eq!(orch.settings(), original);
    let triggered = provider.triggered();
    assert_eq!(triggered.len(), 2);
    assert!(triggered
        .iter()
        .any(|r| r.git_ref == "next"
            && r.variables.get("RUNNER_TAG").map(String::as_str) == Some("gpu-runner")));
    assert_eq!(orch.tasks()[0].trials[0].results.len(), 2);
}
