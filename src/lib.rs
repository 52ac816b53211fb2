//! cibench -- trigger, track and benchmark two-stage CI pipelines.
//!
//! This crate provides the execution tracker (trigger, poll parent then
//! child stage, fetch and clean logs), the benchmark orchestrator built on
//! the same polling primitives, their SQLite-backed stores, and an HTTP API.

pub mod api;
pub mod bench;
pub mod config;
pub mod execution;
pub mod logs;
pub mod provider;
pub mod status;
pub mod storage;
pub mod tracker;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::bench::Orchestrator;
use crate::config::AppConfig;
use crate::provider::gitlab::GitLabProvider;
use crate::provider::JobProvider;
use crate::storage::{ExecutionStore, MeasurementStore};
use crate::tracker::ExecutionTracker;

/// Everything a command needs, built from one configuration.
#[derive(Clone)]
pub struct Services {
    pub tracker: ExecutionTracker,
    pub orchestrator: Orchestrator,
    pub measurements: MeasurementStore,
}

impl Services {
    /// Open both stores and wire the GitLab provider into the tracker and
    /// the orchestrator.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let provider: Arc<dyn JobProvider> = Arc::new(
            GitLabProvider::new(&config.provider).context("failed to build CI provider")?,
        );
        Self::with_provider(config, provider).await
    }

    pub async fn with_provider(config: &AppConfig, provider: Arc<dyn JobProvider>) -> Result<Self> {
        let db_path = &config.storage.db_path;
        tracing::info!(db_path = %db_path.display(), "Initializing database");

        let executions = ExecutionStore::new(db_path);
        executions
            .init()
            .await
            .context("failed to open execution store")?;
        let measurements = MeasurementStore::new(db_path);
        measurements
            .init()
            .await
            .context("failed to open measurement store")?;

        let project = config.provider.project_id.clone();
        let tracker = ExecutionTracker::new(
            provider.clone(),
            executions,
            project.clone(),
            config.tracker.clone(),
        );

        let bench = &config.benchmark;
        let tasks = bench::tasks::defaults(
            &bench.targets,
            bench.concurrent_runs,
            Some(bench.secondary.clone()),
        );
        let orchestrator = Orchestrator::new(
            provider,
            project,
            measurements.clone(),
            &config.tracker,
            bench,
            tasks,
        );

        Ok(Self {
            tracker,
            orchestrator,
            measurements,
        })
    }
}

/// Start the daemon: resume unfinished executions, then serve the API.
pub async fn serve(config: &AppConfig) -> Result<()> {
    let services = Services::open(config).await?;

    let resumed = services
        .tracker
        .resume_incomplete()
        .await
        .context("failed to resume running executions")?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "Resumed tracking of running executions");
    }

    let state = api::state::AppState {
        tracker: services.tracker,
        orchestrator: services.orchestrator,
        measurements: services.measurements,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    tracing::info!(%addr, "cibench listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
