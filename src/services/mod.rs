//! External collaborators, behind narrow traits.
//!
//! The pipeline never talks to a concrete client. It receives a
//! [`Collaborators`] bundle and calls through these traits, which is how the
//! integration tests swap in deterministic fakes.
//!
//! Every method reports failures as [`CallError`] so the gateway can decide
//! whether to retry.

pub mod images;
pub mod llm;
pub mod rodin;
pub mod scraper;

use crate::error::CallError;
use crate::model::{ImageRef, JobConfig, JobHandle, JobStatus, ProductPage};
use async_trait::async_trait;
use std::sync::Arc;

pub use llm::LlmTextGenerator;
pub use rodin::FalRodinService;
pub use scraper::HttpProductScraper;

/// Fetches a product page and structures it into specs plus image references.
#[async_trait]
pub trait ProductScraper: Send + Sync {
    async fn fetch_product_specs(&self, url: &str) -> Result<ProductPage, CallError>;
}

/// Text (and optionally vision) generation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text for `prompt`. When `images` is non-empty the images are
    /// attached to the request.
    async fn generate_text(&self, prompt: &str, images: &[ImageRef]) -> Result<String, CallError>;
}

/// Remote 3D-generation job service.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn submit(&self, config: &JobConfig) -> Result<JobHandle, CallError>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, CallError>;

    /// Download one artifact by its remote reference.
    async fn download(&self, url: &str) -> Result<Vec<u8>, CallError>;
}

/// The collaborator handles a pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn ProductScraper>,
    pub generator: Arc<dyn TextGenerator>,
    pub jobs: Arc<dyn JobService>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Turn a non-success response into a classified [`CallError`].
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(500).collect();
    Err(CallError::from_status(status.as_u16(), body, retry_after))
}
