//! Result types returned by a pipeline run.

use crate::model::{ArtifactSet, GenerationPrompt, JobConfig, RunId, Stage};
use serde::{Deserialize, Serialize};

/// How one stage was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// `true` when the output came from a checkpoint.
    pub cached: bool,
    /// Wall-clock time spent, including the checkpoint lookup.
    pub duration_ms: u64,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub run_id: RunId,
    pub product_id: String,
    pub prompt: GenerationPrompt,
    pub job_config: JobConfig,
    pub artifacts: ArtifactSet,
    pub stages: Vec<StageReport>,
    pub total_duration_ms: u64,
}

impl PipelineOutput {
    pub fn cached_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.cached).count()
    }

    pub fn executed_stages(&self) -> usize {
        self.stages.len() - self.cached_stages()
    }
}
