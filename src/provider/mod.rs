//! Job provider seam: the contract the core requires from the external CI
//! service (trigger, cancel, status, job listing, job log).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gitlab;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no trigger credential configured")]
    MissingTriggerCredential,

    #[error("provider returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

/// Status string reported by the provider for a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    /// Anything outside the contract, kept verbatim.
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Skipped => "skipped",
            JobStatus::Manual => "manual",
            JobStatus::Other(s) => s,
        }
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "failed" => JobStatus::Failed,
            "canceled" | "cancelled" => JobStatus::Canceled,
            "skipped" => JobStatus::Skipped,
            "manual" => JobStatus::Manual,
            other => JobStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        JobStatus::from(s.as_str())
    }
}

impl From<JobStatus> for String {
    fn from(s: JobStatus) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a pipeline trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    /// Git ref (branch or tag) to run the pipeline on.
    pub git_ref: String,
    pub variables: BTreeMap<String, String>,
}

/// Largest job id accepted from a provider. Leaves room for the child stage
/// at `job_id + 1` and fits a SQLite INTEGER.
pub const MAX_JOB_ID: u64 = i64::MAX as u64 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job_id: u64,
}

impl TriggerResponse {
    /// Reject job ids outside `1..=MAX_JOB_ID`.
    pub fn checked(self) -> Result<Self, ProviderError> {
        if self.job_id == 0 || self.job_id > MAX_JOB_ID {
            return Err(ProviderError::Decode(format!(
                "job id {} out of range",
                self.job_id
            )));
        }
        Ok(self)
    }
}

/// One job listed under a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: u64,
    pub name: String,
}

/// Trait for CI backends the tracker and orchestrator drive.
#[async_trait::async_trait]
pub trait JobProvider: Send + Sync {
    /// Short backend name, used as the handle of in-flight pipelines.
    fn name(&self) -> &str;

    /// Whether a trigger credential is configured.
    fn has_trigger_credential(&self) -> bool;

    /// Start a pipeline and return the parent job id.
    async fn trigger(
        &self,
        project: &str,
        req: &TriggerRequest,
    ) -> Result<TriggerResponse, ProviderError>;

    /// Cancel a pipeline stage. Returns the canceled job id.
    async fn cancel(&self, project: &str, job_id: u64) -> Result<u64, ProviderError>;

    async fn get_status(&self, project: &str, job_id: u64) -> Result<JobStatus, ProviderError>;

    async fn list_jobs(&self, project: &str, job_id: u64)
        -> Result<Vec<JobSummary>, ProviderError>;

    /// Raw log of a single job; may contain escape and section markers.
    async fn get_job_log(&self, project: &str, job_id: u64) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(JobStatus::from("success"), JobStatus::Success);
        assert_eq!(JobStatus::from("cancelled"), JobStatus::Canceled);
        assert_eq!(
            JobStatus::from("waiting_for_resource"),
            JobStatus::Other("waiting_for_resource".to_string())
        );
        assert_eq!(JobStatus::Other("created".into()).to_string(), "created");
    }

    #[test]
    fn test_status_serde_as_string() {
        let json = serde_json::to_string(&JobStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let back: JobStatus = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(back, JobStatus::Manual);
    }

    #[test]
    fn test_trigger_response_job_id_bounds() {
        assert!(TriggerResponse { job_id: 1 }.checked().is_ok());
        assert!(TriggerResponse { job_id: MAX_JOB_ID }.checked().is_ok());
        assert!(matches!(
            TriggerResponse { job_id: 0 }.checked(),
            Err(ProviderError::Decode(_))
        ));
        assert!(matches!(
            TriggerResponse { job_id: u64::MAX }.checked(),
            Err(ProviderError::Decode(_))
        ));
    }
}
