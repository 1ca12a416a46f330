//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow a run
//! stage by stage: which stages were served from checkpoints, which ran,
//! what the remote job reported while it was being polled.
//!
//! # Example
//!
//! ```rust
//! use product2mesh::{PipelineProgressCallback, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CacheCounter(AtomicUsize);
//!
//! impl PipelineProgressCallback for CacheCounter {
//!     fn on_stage_cached(&self, _stage: Stage) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::error::ArtifactWarning;
use crate::model::Stage;
use std::sync::Arc;

/// Called by the orchestrator and the job controller as a run progresses.
///
/// All methods have default no-op implementations. Texture downloads run
/// concurrently, so `on_artifact_warning` may be called from several tasks.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage.
    fn on_run_start(&self, run_id: &str, total_stages: usize) {
        let _ = (run_id, total_stages);
    }

    /// Called when a stage has to execute (checkpoint miss).
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage is satisfied from its checkpoint.
    fn on_stage_cached(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when an executed stage has been checkpointed.
    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        let _ = (stage, duration_ms);
    }

    /// Called when a stage fails; the run stops afterwards.
    ///
    /// * `kind`: error taxonomy name, e.g. `GatewayExhausted`
    fn on_stage_error(&self, stage: Stage, kind: &str, error: &str) {
        let _ = (stage, kind, error);
    }

    /// Called after every poll of the remote job.
    fn on_job_status(&self, job_id: &str, status: &str, messages: &[String]) {
        let _ = (job_id, status, messages);
    }

    /// Called for each texture that could not be fetched.
    fn on_artifact_warning(&self, warning: &ArtifactWarning) {
        let _ = warning;
    }

    /// Called once after the last stage succeeded.
    fn on_run_complete(&self, run_id: &str, cached_stages: usize, executed_stages: usize) {
        let _ = (run_id, cached_stages, executed_stages);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgressCallback for Recorder {
        fn on_stage_start(&self, stage: Stage) {
            self.events.lock().unwrap().push(format!("start:{stage}"));
        }

        fn on_stage_cached(&self, stage: Stage) {
            self.events.lock().unwrap().push(format!("cached:{stage}"));
        }

        fn on_stage_error(&self, stage: Stage, kind: &str, _error: &str) {
            self.events.lock().unwrap().push(format!("error:{stage}:{kind}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start("r", 5);
        cb.on_stage_start(Stage::Scrape);
        cb.on_stage_complete(Stage::Scrape, 12);
        cb.on_job_status("job", "running", &["meshing".to_string()]);
        cb.on_run_complete("r", 2, 3);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recorder::default();
        let cb: &dyn PipelineProgressCallback = &rec;
        cb.on_stage_cached(Stage::Scrape);
        cb.on_stage_start(Stage::Describe);
        cb.on_stage_error(Stage::Describe, "GatewayExhausted", "503");
        cb.on_stage_complete(Stage::Describe, 5);
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["cached:scrape", "start:describe", "error:describe:GatewayExhausted"]
        );
    }
}
