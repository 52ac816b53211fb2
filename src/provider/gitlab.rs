//! GitLab-compatible provider over the REST v4 API.
//!
//! The "job id" the core tracks is a GitLab pipeline id: each stage of the
//! two-stage flow is its own (downstream) pipeline, and `list_jobs` returns
//! the jobs that ran inside it.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::{JobProvider, JobStatus, JobSummary, ProviderError, TriggerRequest, TriggerResponse};
use crate::config::ProviderConfig;

pub struct GitLabProvider {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    trigger_token: Option<String>,
}

#[derive(Deserialize)]
struct PipelineBody {
    id: u64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct JobBody {
    id: u64,
    name: String,
}

impl GitLabProvider {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone().filter(|t| !t.is_empty()),
            trigger_token: cfg.trigger_token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn project_url(&self, project: &str, rest: &str) -> String {
        // Namespaced paths ("group/name") must be URL-encoded as one segment.
        format!(
            "{}/api/v4/projects/{}/{}",
            self.base_url,
            project.replace('/', "%2F"),
            rest
        )
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => req.header("PRIVATE-TOKEN", token),
            None => req,
        }
    }

    async fn check(resp: Response) -> Result<Response, ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait::async_trait]
impl JobProvider for GitLabProvider {
    fn name(&self) -> &str {
        "gitlab"
    }

    fn has_trigger_credential(&self) -> bool {
        self.trigger_token.is_some()
    }

    async fn trigger(
        &self,
        project: &str,
        req: &TriggerRequest,
    ) -> Result<TriggerResponse, ProviderError> {
        let token = self
            .trigger_token
            .as_deref()
            .ok_or(ProviderError::MissingTriggerCredential)?;

        let mut form: Vec<(String, String)> = vec![
            ("token".to_string(), token.to_string()),
            ("ref".to_string(), req.git_ref.clone()),
        ];
        for (key, value) in &req.variables {
            form.push((format!("variables[{}]", key), value.clone()));
        }

        let url = self.project_url(project, "trigger/pipeline");
        debug!(%url, git_ref = %req.git_ref, "Triggering pipeline");
        let resp = self.client.post(&url).form(&form).send().await?;
        let body: PipelineBody = Self::check(resp).await?.json().await?;
        Ok(TriggerResponse { job_id: body.id })
    }

    async fn cancel(&self, project: &str, job_id: u64) -> Result<u64, ProviderError> {
        let url = self.project_url(project, &format!("pipelines/{}/cancel", job_id));
        let resp = self.authed(self.client.post(&url)).send().await?;
        let body: PipelineBody = Self::check(resp).await?.json().await?;
        Ok(body.id)
    }

    async fn get_status(&self, project: &str, job_id: u64) -> Result<JobStatus, ProviderError> {
        let url = self.project_url(project, &format!("pipelines/{}", job_id));
        let resp = self.authed(self.client.get(&url)).send().await?;
        let body: PipelineBody = Self::check(resp).await?.json().await?;
        body.status
            .map(JobStatus::from)
            .ok_or_else(|| ProviderError::Decode(format!("pipeline {} has no status", job_id)))
    }

    async fn list_jobs(
        &self,
        project: &str,
        job_id: u64,
    ) -> Result<Vec<JobSummary>, ProviderError> {
        let url = self.project_url(project, &format!("pipelines/{}/jobs", job_id));
        let resp = self.authed(self.client.get(&url)).send().await?;
        let jobs: Vec<JobBody> = Self::check(resp).await?.json().await?;
        Ok(jobs
            .into_iter()
            .map(|j| JobSummary {
                id: j.id,
                name: j.name,
            })
            .collect())
    }

    async fn get_job_log(&self, project: &str, job_id: u64) -> Result<String, ProviderError> {
        let url = self.project_url(project, &format!("jobs/{}/trace", job_id));
        let resp = self.authed(self.client.get(&url)).send().await?;
        Ok(Self::check(resp).await?.text().await?)
    }
}
