//! Pipeline orchestrator: runs the five stages in order, consulting the
//! checkpoint store before each one.
//!
//! ```text
//! scrape ─► describe ─► synthesize_prompt ─► build_config ─► generate_model
//!    │          │               │                  │                │
//!    └──────────┴─────── checkpoint lookup ────────┴────────────────┘
//!          hit: reuse payload        miss: execute, then checkpoint
//! ```
//!
//! A failed stage writes nothing, so the next invocation with the same run
//! id starts again at exactly that stage.

use super::job::{JobController, PollSettings};
use super::stages;
use crate::checkpoint::{CheckpointStore, Fingerprint};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, RunError};
use crate::gateway::{Gateway, RequestKind};
use crate::model::{
    product_id_for, ArtifactLocation, ArtifactSet, GenerationPrompt, JobConfig, JobHandle, ProductPage, RunId, Stage,
};
use crate::output::{PipelineOutput, StageReport};
use crate::services::Collaborators;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A configured pipeline bound to its collaborators and checkpoint store.
pub struct Pipeline {
    collaborators: Collaborators,
    store: Arc<dyn CheckpointStore>,
    gateway: Arc<Gateway>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, store: Arc<dyn CheckpointStore>, config: PipelineConfig) -> Self {
        let gateway = Arc::new(Gateway::new(config.retry_policy()));
        Self {
            collaborators,
            store,
            gateway,
            config,
        }
    }

    /// The gateway all external calls of this pipeline go through.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn job_controller(&self) -> JobController {
        JobController::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.collaborators.jobs),
            PollSettings {
                interval: self.config.poll_interval(),
                max_total: self.config.max_poll(),
            },
        )
        .with_download_concurrency(self.config.download_concurrency)
        .with_progress(self.config.progress_callback.clone())
    }

    fn location(&self, product_id: &str) -> ArtifactLocation {
        ArtifactLocation {
            root: self.config.artifact_dir.clone(),
            product_id: product_id.to_string(),
            format: self.config.job_defaults.output_format,
        }
    }

    /// Run (or resume) the pipeline for one product page.
    ///
    /// Without an explicit `run_id` the id is derived from the URL, so calling
    /// this twice for the same page resumes the first run.
    pub async fn run(&self, product_url: &str, run_id: Option<RunId>) -> Result<PipelineOutput, RunError> {
        let started = Instant::now();
        reqwest::Url::parse(product_url).map_err(|e| {
            RunError::Setup(PipelineError::InvalidConfig(format!(
                "invalid product url '{}': {}",
                product_url, e
            )))
        })?;
        let run_id = run_id.unwrap_or_else(|| RunId::for_product(product_url));
        let product_id = product_id_for(product_url);
        let mut reports = Vec::with_capacity(Stage::ALL.len());

        info!("Starting run {} for {}", run_id, product_url);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_start(run_id.as_str(), Stage::ALL.len());
        }

        // ── Stage 1: scrape ──────────────────────────────────────────────
        let page: ProductPage = self
            .run_stage(
                &run_id,
                Stage::Scrape,
                stages::scrape_fingerprint(product_url, &self.config.thumbnail_indices),
                &mut reports,
                || async {
                    self.gateway
                        .call(RequestKind::RenderPage, || {
                            self.collaborators.scraper.fetch_product_specs(product_url)
                        })
                        .await
                },
            )
            .await?;

        // ── Stage 2: describe ────────────────────────────────────────────
        let instructions = self.config.vision_instructions.as_str();
        let description: String = self
            .run_stage(
                &run_id,
                Stage::Describe,
                stages::describe_fingerprint(&page, instructions, self.config.image_contrast),
                &mut reports,
                || async {
                    if page.images.is_empty() {
                        return Err(PipelineError::InvalidConfig(
                            "the product page yielded no reference images".into(),
                        ));
                    }
                    self.gateway
                        .call(RequestKind::GenerateVision, || {
                            self.collaborators.generator.generate_text(instructions, &page.images)
                        })
                        .await
                },
            )
            .await?;

        // ── Stage 3: synthesize_prompt ───────────────────────────────────
        let request = stages::synthesis_request(&page, &description);
        let prompt: GenerationPrompt = self
            .run_stage(
                &run_id,
                Stage::SynthesizePrompt,
                stages::synthesize_fingerprint(&request),
                &mut reports,
                || async {
                    let raw = self.generate_text(&request).await?;
                    stages::parse_prompt(&raw)
                },
            )
            .await?;

        // ── Stage 4: build_config ────────────────────────────────────────
        let defaults = &self.config.job_defaults;
        let request = stages::config_request(&prompt, &page, defaults);
        let job_config: JobConfig = self
            .run_stage(
                &run_id,
                Stage::BuildConfig,
                stages::build_config_fingerprint(&request, &page, defaults),
                &mut reports,
                || async {
                    let raw = self.generate_text(&request).await?;
                    stages::parse_job_config(&raw, &page, defaults)
                },
            )
            .await?;

        // ── Stage 5: generate_model ──────────────────────────────────────
        let location = self.location(&product_id);
        let artifacts: ArtifactSet = self
            .run_stage(
                &run_id,
                Stage::GenerateModel,
                stages::generate_fingerprint(&job_config, &location),
                &mut reports,
                || async {
                    let jobs = self.job_controller();
                    let handle = jobs.submit(&job_config).await?;
                    jobs.await_completion(&handle, &location).await
                },
            )
            .await?;

        let output = PipelineOutput {
            run_id,
            product_id,
            prompt,
            job_config,
            artifacts,
            stages: reports,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "Run {} complete: {} cached, {} executed, {}ms",
            output.run_id,
            output.cached_stages(),
            output.executed_stages(),
            output.total_duration_ms
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_complete(output.run_id.as_str(), output.cached_stages(), output.executed_stages());
        }
        Ok(output)
    }

    /// Re-poll an already submitted job and download its artifacts.
    ///
    /// This is the way to keep waiting after `JobTimedOut`.
    pub async fn await_job(&self, handle: &JobHandle, product_id: &str) -> Result<ArtifactSet, PipelineError> {
        self.job_controller()
            .await_completion(handle, &self.location(product_id))
            .await
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, PipelineError> {
        self.gateway
            .call(RequestKind::GenerateText, || {
                self.collaborators.generator.generate_text(prompt, &[])
            })
            .await
    }

    /// Look up a stage's checkpoint; on a miss run `exec` and persist its output.
    async fn run_stage<T, F, Fut>(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: Result<Fingerprint, PipelineError>,
        reports: &mut Vec<StageReport>,
        exec: F,
    ) -> Result<T, RunError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let start = Instant::now();
        let fingerprint = fingerprint.map_err(|e| self.stage_error(run_id, stage, e))?;

        let cached = self
            .store
            .get(run_id, stage, &fingerprint)
            .await
            .map_err(|e| self.stage_error(run_id, stage, e))?;

        if let Some(record) = cached {
            match serde_json::from_value::<T>(record.output_payload) {
                Ok(value) => {
                    debug!("Stage {}: checkpoint hit ({})", stage, fingerprint.short());
                    info!("Stage {}: cached", stage);
                    if let Some(cb) = &self.config.progress_callback {
                        cb.on_stage_cached(stage);
                    }
                    reports.push(StageReport {
                        stage,
                        cached: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    return Ok(value);
                }
                Err(e) => warn!("Stage {}: stored payload unreadable ({}), re-running", stage, e),
            }
        } else {
            debug!("Stage {}: no checkpoint for {}", stage, fingerprint.short());
        }

        info!("Stage {}: running", stage);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_stage_start(stage);
        }

        let value = exec().await.map_err(|e| self.stage_error(run_id, stage, e))?;
        let payload = serde_json::to_value(&value)
            .map_err(|e| self.stage_error(run_id, stage, PipelineError::Internal(e.to_string())))?;
        self.store
            .put(run_id, stage, &fingerprint, payload)
            .await
            .map_err(|e| self.stage_error(run_id, stage, e))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("Stage {}: done in {}ms", stage, duration_ms);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_stage_complete(stage, duration_ms);
        }
        reports.push(StageReport {
            stage,
            cached: false,
            duration_ms,
        });
        Ok(value)
    }

    fn stage_error(&self, run_id: &RunId, stage: Stage, source: PipelineError) -> RunError {
        error!("Stage {} failed [{}]: {}", stage, source.kind(), source);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_stage_error(stage, source.kind(), &source.to_string());
        }
        RunError::Stage {
            run_id: run_id.to_string(),
            stage,
            source,
        }
    }
}
