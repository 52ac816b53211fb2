//! The execution record and the execution configuration passed to the CI
//! provider.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::{now_millis, ExecutionStatus};

/// One tracked run of a target through the CI system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub target_name: String,
    /// Provider id of the parent (first stage) job.
    pub job_id: u64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub status: ExecutionStatus,
    /// Populated only after a terminal status is reached.
    pub job_logs: Vec<JobLog>,
}

impl Execution {
    /// A fresh `Running` execution with a newly generated id.
    pub fn new(target_name: &str, job_id: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_name: target_name.to_string(),
            job_id,
            created_at: now_millis(),
            status: ExecutionStatus::Running,
            job_logs: Vec::new(),
        }
    }

    /// Id of the second pipeline stage. Fixed by the CI configuration.
    pub fn child_job_id(&self) -> u64 {
        child_job_id(self.job_id)
    }
}

/// The second stage of every pipeline is always `parent + 1`. Parent ids are
/// bounded by [`MAX_JOB_ID`](crate::provider::MAX_JOB_ID) on trigger.
pub fn child_job_id(parent_job_id: u64) -> u64 {
    parent_job_id.saturating_add(1)
}

/// Cleaned log output of one provider job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_name: String,
    pub log: String,
}

/// Which stage of the two-stage pipeline a job id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Parent,
    Child,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelinePhase::Parent => write!(f, "parent"),
            PipelinePhase::Child => write!(f, "child"),
        }
    }
}

/// Settings a pipeline is triggered with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Git ref the pipeline runs on.
    pub branch: String,
    pub group: String,
    pub library_project: String,
    pub target_directory: String,
    pub runner_tag: String,
}

impl ExecutionConfig {
    /// CI variables passed with the trigger request for `target`.
    pub fn variables(&self, target: &str) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("TARGET_NAME".to_string(), target.to_string());
        let optional = [
            ("GROUP", &self.group),
            ("LIBRARY_PROJECT", &self.library_project),
            ("TARGET_DIRECTORY", &self.target_directory),
            ("RUNNER_TAG", &self.runner_tag),
        ];
        for (key, value) in optional {
            if !value.is_empty() {
                vars.insert(key.to_string(), value.clone());
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_execution_is_running() {
        let e = Execution::new("hello-world", 41);
        assert_eq!(e.status, ExecutionStatus::Running);
        assert!(e.job_logs.is_empty());
        assert_eq!(e.child_job_id(), 42);
        assert_ne!(e.id, Execution::new("hello-world", 41).id);
        assert_eq!(child_job_id(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_variables_skip_empty_fields() {
        let cfg = ExecutionConfig {
            branch: "main".to_string(),
            runner_tag: "gpu".to_string(),
            ..Default::default()
        };
        let vars = cfg.variables("dt-a");
        assert_eq!(vars.get("TARGET_NAME").map(String::as_str), Some("dt-a"));
        assert_eq!(vars.get("RUNNER_TAG").map(String::as_str), Some("gpu"));
        assert!(!vars.contains_key("GROUP"));
    }
}
