use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ServiceError;
use crate::util::{is_valid_job_id, trim_base};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub status: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImproveResponse {
    pub status: String,
    pub job_id: String,
}

#[derive(Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Deserialize)]
struct DownloadUrlResponse {
    download: String,
}

/// Client for the build service contract. The proxy mirrors the same routes,
/// so the client works against either base URL.
#[derive(Clone)]
pub struct BuildServiceClient {
    http: reqwest::Client,
    base: String,
}

impl BuildServiceClient {
    pub fn new(base: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(http: reqwest::Client, base: &str) -> Self {
        Self {
            http,
            base: trim_base(base).to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// `{base}/download/{jobId}` on the build service.
    pub fn archive_url(&self, job_id: &str) -> String {
        format!("{}/download/{job_id}", self.base)
    }

    /// POSTs a JSON body and returns the JSON response untouched.
    pub async fn post_json(&self, path: &str, body: &Value, endpoint: &str) -> Result<Value, ServiceError> {
        debug!(path, "build service POST");
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await?;
        Self::json_or_status(response, endpoint).await
    }

    pub async fn get_json(&self, path: &str, endpoint: &str) -> Result<Value, ServiceError> {
        debug!(path, "build service GET");
        let response = self.http.get(format!("{}{path}", self.base)).send().await?;
        Self::json_or_status(response, endpoint).await
    }

    async fn json_or_status(response: reqwest::Response, endpoint: &str) -> Result<Value, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Job IDs end up as a single URL path segment.
    fn require_job_id(job_id: &str) -> Result<(), ServiceError> {
        if job_id.is_empty() {
            return Err(ServiceError::MissingField("Job ID"));
        }
        if !is_valid_job_id(job_id) {
            return Err(ServiceError::InvalidJobId(job_id.to_string()));
        }
        Ok(())
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ServiceError> {
        serde_json::from_value(value).map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }

    /// Starts generation of a new project from a prompt.
    pub async fn run(&self, prompt: &str) -> Result<RunResponse, ServiceError> {
        if prompt.trim().is_empty() {
            return Err(ServiceError::MissingField("Prompt"));
        }
        let value = self
            .post_json("/run", &serde_json::json!({ "prompt": prompt }), "AI")
            .await?;
        Self::parse(value)
    }

    pub async fn build(&self, job_id: &str) -> Result<BuildResponse, ServiceError> {
        Self::require_job_id(job_id)?;
        let value = self
            .post_json("/build", &serde_json::json!({ "jobId": job_id }), "Build")
            .await?;
        Self::parse(value)
    }

    pub async fn improve(&self, job_id: &str, prompt: &str) -> Result<ImproveResponse, ServiceError> {
        Self::require_job_id(job_id)?;
        if prompt.trim().is_empty() {
            return Err(ServiceError::MissingField("Prompt"));
        }
        let value = self
            .post_json(
                "/improve",
                &serde_json::json!({ "jobId": job_id, "prompt": prompt }),
                "Improve",
            )
            .await?;
        Self::parse(value)
    }

    /// Asks the service to repair a runtime error reported by the preview.
    pub async fn fix_error(&self, job_id: &str, message: &str) -> Result<ImproveResponse, ServiceError> {
        self.improve(job_id, &format!("Fix this error: {message}")).await
    }

    pub async fn logs(&self, job_id: &str) -> Result<Vec<String>, ServiceError> {
        Self::require_job_id(job_id)?;
        let value = self.get_json(&format!("/logs/{job_id}"), "Logs").await?;
        let logs: LogsResponse = Self::parse(value)?;
        Ok(logs.logs)
    }

    /// Proxy only: resolves the real download URL for a job.
    pub async fn download_url(&self, job_id: &str) -> Result<String, ServiceError> {
        Self::require_job_id(job_id)?;
        let value = self.get_json(&format!("/download/{job_id}"), "Download").await?;
        let body: DownloadUrlResponse = Self::parse(value)?;
        Ok(body.download)
    }

    /// Build service only: fetches the binary archive of a job.
    pub async fn download_archive(&self, job_id: &str) -> Result<Vec<u8>, ServiceError> {
        Self::require_job_id(job_id)?;
        let response = self.http.get(self.archive_url(job_id)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                endpoint: "Download".into(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
