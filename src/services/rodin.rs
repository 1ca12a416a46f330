//! Rodin 3D generation through the fal.ai queue API.
//!
//! * `POST {endpoint}/{app}` queues a job and returns a `request_id`.
//! * `GET {endpoint}/{root}/requests/{id}/status?logs=1` reports
//!   `IN_QUEUE`, `IN_PROGRESS` (with logs) or `COMPLETED`.
//! * `GET {endpoint}/{root}/requests/{id}` returns the result document
//!   once completed.
//!
//! `root` is the app id without its sub-path (`fal-ai/hyper3d` for
//! `fal-ai/hyper3d/rodin`).

use super::{check_status, JobService};
use crate::error::{CallError, MalformedResponse, PipelineError};
use crate::model::{ArtifactRefs, JobConfig, JobHandle, JobStatus};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://queue.fal.run";
pub const DEFAULT_APP: &str = "fal-ai/hyper3d/rodin";

/// HTTP client for the Rodin app on the fal.ai queue.
pub struct FalRodinService {
    client: reqwest::Client,
    endpoint: String,
    app: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

/// Queue state reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    InQueue,
    InProgress(Vec<String>),
    Completed,
    Other(String),
}

impl FalRodinService {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            app: DEFAULT_APP.to_string(),
            key: key.into(),
        }
    }

    /// Read the API key from `FAL_KEY`.
    pub fn from_env() -> Result<Self, PipelineError> {
        match std::env::var("FAL_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key.trim())),
            _ => Err(PipelineError::ProviderNotConfigured {
                provider: "fal".to_string(),
                hint: "Set FAL_KEY to a fal.ai API key to submit Rodin jobs.".to_string(),
            }),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into().trim_matches('/').to_string();
        self
    }

    fn app_root(&self) -> String {
        self.app.split('/').take(2).collect::<Vec<_>>().join("/")
    }

    fn request_url(&self, handle: &JobHandle) -> String {
        format!("{}/{}/requests/{}", self.endpoint, self.app_root(), handle.id())
    }

    fn auth(&self) -> String {
        format!("Key {}", self.key)
    }

    async fn get_json(&self, url: &str) -> Result<Value, CallError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .send()
            .await?;
        let response = check_status(response).await?;
        response.json().await.map_err(|e| {
            CallError::Malformed(MalformedResponse::Parse {
                detail: format!("job service returned invalid JSON: {}", e),
            })
        })
    }
}

impl std::fmt::Debug for FalRodinService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalRodinService")
            .field("endpoint", &self.endpoint)
            .field("app", &self.app)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Interpret a status document.
pub fn parse_status(doc: &Value) -> Result<QueueState, MalformedResponse> {
    let status = doc
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| MalformedResponse::SchemaViolation {
            field: "status".into(),
            reason: "missing from status response".into(),
        })?;

    Ok(match status {
        "IN_QUEUE" => QueueState::InQueue,
        "IN_PROGRESS" => {
            let logs = doc
                .get("logs")
                .and_then(Value::as_array)
                .map(|logs| {
                    logs.iter()
                        .filter_map(|l| l.get("message").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            QueueState::InProgress(logs)
        }
        "COMPLETED" => QueueState::Completed,
        other => QueueState::Other(other.to_string()),
    })
}

/// Interpret a completed job's result document.
pub fn parse_result(doc: &Value) -> Result<JobStatus, MalformedResponse> {
    if let Some(err) = doc.get("error").filter(|e| !e.is_null()) {
        let reason = err
            .as_str()
            .map(str::to_string)
            .or_else(|| err.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| err.to_string());
        return Ok(JobStatus::Failed(reason));
    }

    let mesh = doc
        .pointer("/model_mesh/url")
        .and_then(Value::as_str)
        .ok_or_else(|| MalformedResponse::SchemaViolation {
            field: "model_mesh.url".into(),
            reason: "missing from job result".into(),
        })?
        .to_string();

    let textures = doc
        .get("textures")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.get("url").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(JobStatus::Succeeded(ArtifactRefs { mesh, textures }))
}

#[async_trait]
impl JobService for FalRodinService {
    async fn submit(&self, config: &JobConfig) -> Result<JobHandle, CallError> {
        let url = format!("{}/{}", self.endpoint, self.app);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .json(config)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: SubmitResponse = response.json().await.map_err(|e| {
            CallError::Malformed(MalformedResponse::SchemaViolation {
                field: "request_id".into(),
                reason: e.to_string(),
            })
        })?;
        debug!("Queued Rodin request {}", body.request_id);
        Ok(JobHandle::new(body.request_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, CallError> {
        let status_url = format!("{}/status?logs=1", self.request_url(handle));
        let doc = self.get_json(&status_url).await?;

        match parse_status(&doc)? {
            QueueState::InQueue => Ok(JobStatus::Queued),
            QueueState::InProgress(logs) => Ok(JobStatus::Running(logs)),
            QueueState::Completed => {
                let result = self.get_json(&self.request_url(handle)).await?;
                Ok(parse_result(&result)?)
            }
            QueueState::Other(s) => Ok(JobStatus::Failed(format!("job ended with status {}", s))),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, CallError> {
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_states() {
        assert_eq!(parse_status(&json!({"status": "IN_QUEUE"})).unwrap(), QueueState::InQueue);
        assert_eq!(
            parse_status(&json!({
                "status": "IN_PROGRESS",
                "logs": [{"message": "generating geometry"}, {"level": "INFO"}]
            }))
            .unwrap(),
            QueueState::InProgress(vec!["generating geometry".into()])
        );
        assert_eq!(parse_status(&json!({"status": "COMPLETED"})).unwrap(), QueueState::Completed);
        assert!(parse_status(&json!({"state": "x"})).is_err());
    }

    #[test]
    fn result_with_mesh_and_textures() {
        let status = parse_result(&json!({
            "model_mesh": {"url": "https://fal.media/m.glb", "file_size": 10},
            "textures": [{"url": "https://fal.media/t0.png"}, {"url": "https://fal.media/t1.png"}]
        }))
        .unwrap();
        assert_eq!(
            status,
            JobStatus::Succeeded(ArtifactRefs {
                mesh: "https://fal.media/m.glb".into(),
                textures: vec!["https://fal.media/t0.png".into(), "https://fal.media/t1.png".into()],
            })
        );
    }

    #[test]
    fn result_error_is_failure() {
        let status = parse_result(&json!({"error": {"message": "NSFW input"}})).unwrap();
        assert_eq!(status, JobStatus::Failed("NSFW input".into()));
        assert!(parse_result(&json!({"textures": []})).is_err());
    }

    #[test]
    fn request_urls_use_app_root() {
        let svc = FalRodinService::new("k").with_endpoint("https://queue.example/");
        assert_eq!(
            svc.request_url(&JobHandle::new("abc")),
            "https://queue.example/fal-ai/hyper3d/requests/abc"
        );
        assert!(!format!("{:?}", svc).contains("\"k\""));
    }
}
