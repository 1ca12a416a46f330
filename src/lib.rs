//! # product2mesh
//!
//! Turn a retailer product page into a textured 3D asset.
//!
//! The crate scrapes a product page, has a vision model describe the
//! reference images, synthesizes a generation prompt, drafts a Rodin job
//! configuration and finally runs the remote 3D generation job. Every stage
//! output is checkpointed under a fingerprint of its inputs, so a crashed or
//! interrupted run picks up where it stopped and an unchanged rerun makes no
//! external calls at all.
//!
//! ## Pipeline Overview
//!
//! ```text
//! product URL
//!  │
//!  ├─ 1. scrape             page text → ProductSpecs + two reference images
//!  ├─ 2. describe           vision model reads the images
//!  ├─ 3. synthesize_prompt  specs + description → GenerationPrompt
//!  ├─ 4. build_config       prompt → JobConfig (JSON, schema-checked)
//!  └─ 5. generate_model     submit, poll, download mesh + textures
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use product2mesh::{run_pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LLM provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / ...
//!     // Rodin jobs need FAL_KEY.
//!     let config = PipelineConfig::default();
//!     let output = run_pipeline("https://shop.example/p/aviator-52", None, &config).await?;
//!     println!("mesh at {}", output.artifacts.mesh.display());
//!     eprintln!("{} stages cached, {} executed", output.cached_stages(), output.executed_stages());
//!     Ok(())
//! }
//! ```
//!
//! ## Bringing your own collaborators
//!
//! [`Pipeline::new`] takes a [`Collaborators`] bundle (scraper, text
//! generator, job service) and any [`CheckpointStore`]. The traits in
//! [`services`] are the only seams the pipeline calls through.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `product2mesh` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{CheckpointStore, FileCheckpointStore, Fingerprint, MemoryCheckpointStore, StageRecord};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ArtifactWarning, CallError, MalformedResponse, PipelineError, RunError};
pub use gateway::{Gateway, RequestKind, RetryPolicy};
pub use model::{
    ArtifactSet, GenerationPrompt, ImageRef, JobConfig, JobDefaults, JobHandle, JobStatus, ProductPage, ProductSpecs,
    RunId, Stage,
};
pub use output::{PipelineOutput, StageReport};
pub use pipeline::Pipeline;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{inspect_run, resume_job, run_pipeline, run_pipeline_sync};
pub use services::{Collaborators, JobService, ProductScraper, TextGenerator};
