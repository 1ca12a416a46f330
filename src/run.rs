//! Convenience entry points that wire the shipped collaborators from a
//! [`PipelineConfig`] and the environment.
//!
//! Library users who bring their own scraper, generator or job service build
//! a [`Pipeline`] directly; everyone else calls [`run_pipeline`].

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, StageRecord};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, RunError};
use crate::model::{ArtifactSet, JobHandle, RunId, Stage};
use crate::output::PipelineOutput;
use crate::pipeline::Pipeline;
use crate::services::{Collaborators, FalRodinService, HttpProductScraper, LlmTextGenerator, TextGenerator};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Run (or resume) the pipeline for `product_url` with the default
/// collaborators and a file checkpoint store under `config.checkpoint_dir`.
///
/// # Example
/// ```rust,no_run
/// use product2mesh::{run_pipeline, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::default();
/// let output = run_pipeline("https://shop.example/p/aviator-52", None, &config).await?;
/// println!("{}", output.artifacts.mesh.display());
/// # Ok(())
/// # }
/// ```
pub async fn run_pipeline(
    product_url: &str,
    run_id: Option<RunId>,
    config: &PipelineConfig,
) -> Result<PipelineOutput, RunError> {
    let pipeline = default_pipeline(config).map_err(RunError::Setup)?;
    pipeline.run(product_url, run_id).await
}

/// Synchronous wrapper around [`run_pipeline`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_pipeline_sync(
    product_url: &str,
    run_id: Option<RunId>,
    config: &PipelineConfig,
) -> Result<PipelineOutput, RunError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| RunError::Setup(PipelineError::Internal(format!("Failed to create tokio runtime: {}", e))))?
        .block_on(run_pipeline(product_url, run_id, config))
}

/// Keep waiting for a job that was already submitted, typically after
/// `JobTimedOut`, and download its artifacts.
///
/// Does not touch the checkpoint store.
pub async fn resume_job(job_id: &str, product_id: &str, config: &PipelineConfig) -> Result<ArtifactSet, PipelineError> {
    let pipeline = default_pipeline(config)?;
    pipeline.await_job(&JobHandle::new(job_id), product_id).await
}

/// Every checkpoint record stored for `run_id`, in stage order.
///
/// Does not require any API key.
pub async fn inspect_run(checkpoint_dir: impl AsRef<Path>, run_id: &RunId) -> Result<Vec<StageRecord>, PipelineError> {
    let store = FileCheckpointStore::new(checkpoint_dir.as_ref());
    let mut records = Vec::new();
    for stage in Stage::ALL {
        records.extend(store.history(run_id, stage).await?);
    }
    debug!("Run {}: {} stored records", run_id, records.len());
    Ok(records)
}

fn default_pipeline(config: &PipelineConfig) -> Result<Pipeline, PipelineError> {
    let collaborators = default_collaborators(config)?;
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    Ok(Pipeline::new(collaborators, store, config.clone()))
}

/// Build the shipped collaborators: an LLM-backed generator, an HTTP scraper
/// that structures pages through that generator, and the fal.ai Rodin client.
pub fn default_collaborators(config: &PipelineConfig) -> Result<Collaborators, PipelineError> {
    let provider = resolve_provider(config)?;
    let generator: Arc<dyn TextGenerator> = Arc::new(
        LlmTextGenerator::new(provider)
            .with_sampling(config.temperature, config.max_tokens)
            .with_image_contrast(config.image_contrast),
    );
    let scraper = HttpProductScraper::new(Arc::clone(&generator))
        .with_page_timeout(Duration::from_secs(config.page_timeout_secs))
        .with_thumbnail_indices(config.thumbnail_indices.clone());
    let jobs = FalRodinService::from_env()?
        .with_endpoint(config.fal_endpoint.as_str())
        .with_app(config.fal_app.as_str());

    info!("Collaborators ready (job app {})", config.fal_app);
    Ok(Collaborators {
        scraper: Arc::new(scraper),
        generator,
        jobs: Arc::new(jobs),
    })
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| PipelineError::ProviderNotConfigured {
        provider: provider_name.to_string(),
        hint: format!("{e}"),
    })
}

/// Resolve the text/vision provider, from most to least specific:
///
/// 1. `config.provider`, used as-is;
/// 2. `config.provider_name` with `config.model` (default `gpt-4.1-nano`);
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 4. OpenAI when `OPENAI_API_KEY` is set;
/// 5. whatever [`ProviderFactory::from_env`] detects.
fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (std::env::var("EDGEQUAKE_LLM_PROVIDER"), std::env::var("EDGEQUAKE_MODEL")) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: format!(
            "No LLM provider could be auto-detected from environment.\n\
            Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
            Error: {}",
            e
        ),
    })?;

    Ok(llm_provider)
}
