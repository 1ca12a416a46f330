//! Configuration for pipeline runs.
//!
//! Every knob lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Settings that change what a stage produces
//! (vision instructions, job defaults, artifact location) are part of that
//! stage's checkpoint fingerprint; settings that only change how calls are
//! made (retries, timeouts, polling) are not.

use crate::error::PipelineError;
use crate::gateway::RetryPolicy;
use crate::model::{ConditionMode, JobDefaults, OutputFormat};
use crate::progress::ProgressCallback;
use crate::prompts::VISION_INSTRUCTIONS;
use crate::services::rodin;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use product2mesh::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .checkpoint_dir("data/checkpoints")
///     .max_attempts(5)
///     .seed(42)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the checkpoint store. Default: `data/checkpoints`.
    pub checkpoint_dir: PathBuf,

    /// Root under which `{product_id}/model.{ext}` is written. Default: `data/3d_models`.
    pub artifact_dir: PathBuf,

    /// Attempts per external call, including the first. Default: 3.
    pub max_attempts: u32,

    /// Initial retry delay; doubles per attempt. Default: 500 ms.
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single retry delay. Default: 8 000 ms.
    pub retry_max_delay_ms: u64,

    /// Hard limit on one attempt of any external call. Default: 120 s.
    ///
    /// Vision requests with two high-detail images regularly take 30–60 s.
    pub call_timeout_secs: u64,

    /// Bounded wait for the product page. Default: 60 s.
    pub page_timeout_secs: u64,

    /// Sleep between job status polls. Default: 5 000 ms.
    pub poll_interval_ms: u64,

    /// Total polling budget before `JobTimedOut`. Default: 900 s.
    pub max_poll_secs: u64,

    /// Concurrent texture downloads. Default: 4.
    pub download_concurrency: usize,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum completion tokens per generation. Default: 4 000.
    pub max_tokens: usize,

    /// Checklist sent with the reference images in the describe stage.
    pub vision_instructions: String,

    /// Contrast adjustment applied to reference images before the vision
    /// request. `None` sends them unchanged. Default: `Some(10.0)`.
    pub image_contrast: Option<f32>,

    /// Defaults merged into every drafted job configuration.
    pub job_defaults: JobDefaults,

    /// Thumbnail numbers picked from the product page. Default: `[1, 4]`
    /// (front and side views).
    pub thumbnail_indices: Vec<usize>,

    /// fal.ai queue endpoint. Default: `https://queue.fal.run`.
    pub fal_endpoint: String,

    /// fal.ai application id. Default: `fal-ai/hyper3d/rodin`.
    pub fal_app: String,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            artifact_dir: PathBuf::from("data/3d_models"),
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            call_timeout_secs: 120,
            page_timeout_secs: 60,
            poll_interval_ms: 5_000,
            max_poll_secs: 900,
            download_concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4_000,
            vision_instructions: VISION_INSTRUCTIONS.to_string(),
            image_contrast: Some(10.0),
            job_defaults: JobDefaults::default(),
            thumbnail_indices: vec![1, 4],
            fal_endpoint: rodin::DEFAULT_ENDPOINT.to_string(),
            fal_app: rodin::DEFAULT_APP.to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("artifact_dir", &self.artifact_dir)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_poll_secs", &self.max_poll_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("job_defaults", &self.job_defaults)
            .field("thumbnail_indices", &self.thumbnail_indices)
            .field("fal_app", &self.fal_app)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = dir.into();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_max_delay_ms = ms;
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs;
        self
    }

    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.page_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_poll_secs(mut self, secs: u64) -> Self {
        self.config.max_poll_secs = secs;
        self
    }

    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.config.download_concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn vision_instructions(mut self, text: impl Into<String>) -> Self {
        self.config.vision_instructions = text.into();
        self
    }

    pub fn image_contrast(mut self, contrast: Option<f32>) -> Self {
        self.config.image_contrast = contrast;
        self
    }

    pub fn job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.config.job_defaults = defaults;
        self
    }

    pub fn condition_mode(mut self, mode: ConditionMode) -> Self {
        self.config.job_defaults.condition_mode = mode;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.job_defaults.output_format = format;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.job_defaults.seed = Some(seed);
        self
    }

    pub fn thumbnail_indices(mut self, indices: Vec<usize>) -> Self {
        self.config.thumbnail_indices = indices;
        self
    }

    pub fn fal_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.fal_endpoint = endpoint.into();
        self
    }

    pub fn fal_app(mut self, app: impl Into<String>) -> Self {
        self.config.fal_app = app.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.call_timeout_secs == 0 || c.page_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.retry_max_delay_ms < c.retry_base_delay_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "retry_max_delay_ms ({}) must be ≥ retry_backoff_ms ({})",
                c.retry_max_delay_ms, c.retry_base_delay_ms
            )));
        }
        if c.max_poll_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_poll_secs must be ≥ 1".into(),
            ));
        }
        if c.vision_instructions.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "vision_instructions must not be empty".into(),
            ));
        }
        if c.thumbnail_indices.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one thumbnail index is required".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.thumbnail_indices, vec![1, 4]);
        assert_eq!(config.job_defaults.output_format, OutputFormat::Glb);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = PipelineConfig::builder().max_attempts(0).build().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn backoff_above_cap_rejected() {
        assert!(PipelineConfig::builder()
            .retry_backoff_ms(10_000)
            .retry_max_delay_ms(1_000)
            .build()
            .is_err());
    }

    #[test]
    fn job_default_setters() {
        let config = PipelineConfig::builder()
            .condition_mode(ConditionMode::Fuse)
            .output_format(OutputFormat::Usdz)
            .seed(9)
            .build()
            .unwrap();
        assert_eq!(config.job_defaults.condition_mode, ConditionMode::Fuse);
        assert_eq!(config.job_defaults.seed, Some(9));
    }

    #[test]
    fn debug_hides_provider() {
        let s = format!("{:?}", PipelineConfig::default());
        assert!(s.contains("PipelineConfig"));
        assert!(s.contains("provider: None"));
    }
}
