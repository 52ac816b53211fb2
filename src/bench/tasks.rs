//! Built-in benchmark task catalogue.

use std::sync::Arc;

use super::{BenchError, BenchmarkTask, ExecutionResult, TaskFunction, TrialExecutor};
use crate::execution::ExecutionConfig;

/// One pipeline of `target` on the primary runner.
pub struct SingleRun {
    pub target: String,
}

#[async_trait::async_trait]
impl TaskFunction for SingleRun {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        let config = executor.primary_config();
        Ok(vec![executor.run_pipeline(&self.target, &config).await?])
    }
}

/// `count` pipelines of the same target at once.
pub struct ConcurrentRuns {
    pub target: String,
    pub count: usize,
}

#[async_trait::async_trait]
impl TaskFunction for ConcurrentRuns {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        let config = executor.primary_config();
        let runs = (0..self.count)
            .map(|_| (self.target.clone(), config.clone()))
            .collect();
        executor.run_all(runs).await
    }
}

/// One pipeline per target, all at once.
pub struct ParallelTargets {
    pub targets: Vec<String>,
}

#[async_trait::async_trait]
impl TaskFunction for ParallelTargets {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        let config = executor.primary_config();
        let runs = self
            .targets
            .iter()
            .map(|t| (t.clone(), config.clone()))
            .collect();
        executor.run_all(runs).await
    }
}

/// The same target on the primary and the secondary runner side by side.
/// `secondary`, when set, replaces the secondary runner settings for the rest
/// of the run.
pub struct RunnerComparison {
    pub target: String,
    pub secondary: Option<ExecutionConfig>,
}

#[async_trait::async_trait]
impl TaskFunction for RunnerComparison {
    async fn run(&self, executor: &TrialExecutor) -> Result<Vec<ExecutionResult>, BenchError> {
        if let Some(secondary) = &self.secondary {
            executor.set_secondary(secondary.clone());
        }
        let runs = vec![
            (self.target.clone(), executor.primary_config()),
            (self.target.clone(), executor.secondary_config()),
        ];
        executor.run_all(runs).await
    }
}

/// The default catalogue for `targets`, in run order.
pub fn defaults(
    targets: &[String],
    concurrent_runs: usize,
    secondary: Option<ExecutionConfig>,
) -> Vec<BenchmarkTask> {
    let Some(first) = targets.first() else {
        return Vec::new();
    };

    let mut tasks = vec![
        BenchmarkTask::new(
            "Single Run",
            &format!("One pipeline of {}", first),
            Arc::new(SingleRun {
                target: first.clone(),
            }),
        ),
        BenchmarkTask::new(
            "Concurrent Runs",
            &format!("{} pipelines of {} at once", concurrent_runs, first),
            Arc::new(ConcurrentRuns {
                target: first.clone(),
                count: concurrent_runs,
            }),
        ),
    ];

    if targets.len() > 1 {
        tasks.push(BenchmarkTask::new(
            "Parallel Targets",
            &format!("One pipeline each of {}", targets.join(", ")),
            Arc::new(ParallelTargets {
                targets: targets.to_vec(),
            }),
        ));
    }

    tasks.push(BenchmarkTask::new(
        "Runner Comparison",
        &format!("{} on the primary and secondary runner", first),
        Arc::new(RunnerComparison {
            target: first.clone(),
            secondary,
        }),
    ));
    tasks
}
