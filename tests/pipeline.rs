//! Integration tests for the staged pipeline.
//!
//! Every collaborator is an in-process fake, so these run offline and in
//! milliseconds. Checkpoints and artifacts go to throwaway directories.

use async_trait::async_trait;
use product2mesh::model::ArtifactRefs;
use product2mesh::prompts::CONFIG_INSTRUCTIONS;
use product2mesh::{
    ArtifactWarning, CallError, CheckpointStore, Collaborators, FileCheckpointStore, ImageRef, JobConfig, JobHandle,
    JobService, MemoryCheckpointStore, Pipeline, PipelineConfig, PipelineError, PipelineProgressCallback,
    ProductPage, ProductScraper, ProductSpecs, RunError, RunId, Stage, TextGenerator,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

const URL: &str = "https://shop.example/eyeglasses/durand/jet-black";

// ── Fakes ────────────────────────────────────────────────────────────────────

struct FakeScraper {
    calls: AtomicUsize,
    transient_failures: AtomicUsize,
}

impl FakeScraper {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProductScraper for FakeScraper {
    async fn fetch_product_specs(&self, _url: &str) -> Result<ProductPage, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CallError::Network("connection reset".into()));
        }
        Ok(ProductPage {
            specs: ProductSpecs {
                material: "Cellulose acetate, polished".into(),
                lens_type: "Polycarbonate".into(),
                measurements: BTreeMap::from([
                    ("lens_width".into(), 52.0),
                    ("bridge_width".into(), 20.0),
                    ("temple_length".into(), 145.0),
                ]),
                branding: vec!["Wordmark on left temple".into()],
                features: vec!["Five-barrel hinge".into()],
                roughness: 0.35,
                metallic: 0.0,
                ior: 1.59,
            },
            images: vec![
                ImageRef::new("https://cdn.example/durand/1.jpg"),
                ImageRef::new("https://cdn.example/durand/4.jpg"),
            ],
        })
    }
}

/// Answers each stage deterministically, echoing enough of the request that
/// a changed upstream input changes the reply.
struct FakeGenerator {
    calls: AtomicUsize,
    vision_image_counts: Mutex<Vec<usize>>,
    garbled_config: AtomicBool,
}

impl FakeGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            vision_image_counts: Mutex::new(Vec::new()),
            garbled_config: AtomicBool::new(false),
        })
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let from = text.find(start).map(|i| i + start.len()).unwrap_or(0);
    let rest = &text[from..];
    rest.find(end).map(|i| &rest[..i]).unwrap_or(rest)
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate_text(&self, prompt: &str, images: &[ImageRef]) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !images.is_empty() {
            self.vision_image_counts.lock().unwrap().push(images.len());
            let first_line = prompt.lines().next().unwrap_or_default();
            return Ok(format!("Glossy black acetate, five-barrel hinges. Checked: {first_line}"));
        }
        if prompt.starts_with(CONFIG_INSTRUCTIONS) {
            if self.garbled_config.load(Ordering::SeqCst) {
                return Ok("I'm sorry, I can't produce that configuration.".into());
            }
            let modeling_prompt = between(prompt, "Modeling prompt:\n", "\n\nReference views");
            let reply = json!({
                "prompt": modeling_prompt,
                "condition_mode": "concat",
                "geometry_file_format": "glb",
                "material": "PBR",
                "quality": "high",
                "tier": "Regular",
                "use_hyper": true,
                "input_image_urls": ["https://elsewhere.example/ignored.jpg"]
            });
            return Ok(format!("Here is the configuration:\n```json\n{reply}\n```"));
        }
        let analysis = between(prompt, "Visual analysis:\n", "\n\nThe prompt must");
        Ok(format!(
            "\"Photorealistic glasses, lens width 52 mm, bridge 20 mm. {}\"",
            analysis.replace('\n', " ")
        ))
    }
}

struct FakeJobs {
    submitted: Mutex<Vec<JobConfig>>,
    statuses: Mutex<VecDeque<product2mesh::JobStatus>>,
    final_status: product2mesh::JobStatus,
    polls: AtomicUsize,
    failing_downloads: Vec<String>,
}

impl FakeJobs {
    fn succeeding(textures: usize) -> Self {
        Self::ending_with(product2mesh::JobStatus::Succeeded(ArtifactRefs {
            mesh: "https://fal.example/files/model.glb".into(),
            textures: (0..textures)
                .map(|i| format!("https://fal.example/files/texture_{i}.png"))
                .collect(),
        }))
    }

    fn ending_with(final_status: product2mesh::JobStatus) -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::from([
                product2mesh::JobStatus::Queued,
                product2mesh::JobStatus::Running(vec!["generating geometry".into()]),
            ])),
            final_status,
            polls: AtomicUsize::new(0),
            failing_downloads: Vec::new(),
        }
    }
}

#[async_trait]
impl JobService for FakeJobs {
    async fn submit(&self, config: &JobConfig) -> Result<JobHandle, CallError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(config.clone());
        Ok(JobHandle::new(format!("req-{}", submitted.len())))
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<product2mesh::JobStatus, CallError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.final_status.clone()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, CallError> {
        if self.failing_downloads.iter().any(|u| u == url) {
            return Err(CallError::Http {
                status: 404,
                body: "not found".into(),
            });
        }
        Ok(format!("bytes of {url}").into_bytes())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Harness {
    scraper: Arc<FakeScraper>,
    generator: Arc<FakeGenerator>,
    jobs: Arc<FakeJobs>,
}

impl Harness {
    fn new(jobs: FakeJobs) -> Self {
        Self {
            scraper: FakeScraper::new(),
            generator: FakeGenerator::new(),
            jobs: Arc::new(jobs),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            scraper: self.scraper.clone(),
            generator: self.generator.clone(),
            jobs: self.jobs.clone(),
        }
    }

    fn pipeline(&self, store: Arc<dyn CheckpointStore>, config: PipelineConfig) -> Pipeline {
        Pipeline::new(self.collaborators(), store, config)
    }
}

fn fast_config(root: &Path) -> product2mesh::PipelineConfigBuilder {
    PipelineConfig::builder()
        .checkpoint_dir(root.join("checkpoints"))
        .artifact_dir(root.join("models"))
        .max_attempts(3)
        .retry_backoff_ms(1)
        .retry_max_delay_ms(5)
        .poll_interval_ms(1)
        .max_poll_secs(5)
}

fn stage_of(err: &RunError) -> Option<Stage> {
    err.stage()
}

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
    fn on_artifact_warning(&self, warning: &ArtifactWarning) {
        self.events.lock().unwrap().push(format!("warning:{warning}"));
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_then_rerun_makes_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(2));
    let config = fast_config(dir.path()).build().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));

    let first = harness.pipeline(store.clone(), config.clone()).run(URL, None).await.unwrap();

    assert_eq!(first.executed_stages(), 5);
    assert_eq!(first.product_id, "jet-black");
    assert_eq!(*harness.generator.vision_image_counts.lock().unwrap(), vec![2]);
    let submitted = harness.jobs.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].image_refs.len(), 2);
    assert_eq!(submitted[0].image_refs[0].locator(), "https://cdn.example/durand/1.jpg");
    assert!(submitted[0].prompt.as_str().starts_with("Photorealistic glasses"));

    let model_dir = dir.path().join("models").join("jet-black");
    assert_eq!(first.artifacts.directory, model_dir);
    assert_eq!(first.artifacts.mesh, model_dir.join("model.glb"));
    assert!(first.artifacts.mesh.exists());
    assert_eq!(first.artifacts.textures.len(), 2);
    assert!(model_dir.join("textures").join("texture_1.png").exists());

    let calls_before = harness.generator.calls.load(Ordering::SeqCst);
    let rerun = harness.pipeline(store, config).run(URL, None).await.unwrap();

    assert_eq!(rerun.cached_stages(), 5);
    assert_eq!(rerun.artifacts, first.artifacts);
    assert_eq!(rerun.job_config, first.job_config);
    assert_eq!(harness.scraper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(harness.jobs.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rerun_pipeline_reports_zero_gateway_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(1));
    let config = fast_config(dir.path()).build().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

    let first = harness.pipeline(store.clone(), config.clone());
    first.run(URL, None).await.unwrap();
    assert!(first.gateway().attempt_count() >= 5);

    let second = harness.pipeline(store, config);
    second.run(URL, None).await.unwrap();
    assert_eq!(second.gateway().attempt_count(), 0);
}

#[tokio::test]
async fn transient_scrape_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(0));
    harness.scraper.transient_failures.store(2, Ordering::SeqCst);
    let config = fast_config(dir.path()).build().unwrap();

    let output = assert_ok!(
        harness
            .pipeline(Arc::new(MemoryCheckpointStore::new()), config)
            .run(URL, None)
            .await
    );

    assert_eq!(harness.scraper.calls.load(Ordering::SeqCst), 3);
    assert!(output.artifacts.textures.is_empty());
}

#[tokio::test]
async fn exhausted_scrape_fails_at_first_stage() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(0));
    harness.scraper.transient_failures.store(10, Ordering::SeqCst);
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = fast_config(dir.path()).max_attempts(2).build().unwrap();

    let err = harness.pipeline(store.clone(), config).run(URL, None).await.unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Scrape));
    assert_eq!(err.kind(), "GatewayExhausted");
    assert!(matches!(
        err.error(),
        PipelineError::GatewayExhausted { attempts: 2, .. }
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn failure_mid_run_resumes_from_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(1));
    harness.generator.garbled_config.store(true, Ordering::SeqCst);
    let config = fast_config(dir.path()).build().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let run_id = RunId::new("durand-resume").unwrap();

    let err = harness
        .pipeline(store.clone(), config.clone())
        .run(URL, Some(run_id.clone()))
        .await
        .unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::BuildConfig));
    assert_eq!(err.kind(), "ParseError");
    assert!(store.history(&run_id, Stage::BuildConfig).await.unwrap().is_empty());
    assert_eq!(store.history(&run_id, Stage::SynthesizePrompt).await.unwrap().len(), 1);
    let calls_after_failure = harness.generator.calls.load(Ordering::SeqCst);

    harness.generator.garbled_config.store(false, Ordering::SeqCst);
    let output = harness
        .pipeline(store, config)
        .run(URL, Some(run_id))
        .await
        .unwrap();

    let cached: Vec<Stage> = output.stages.iter().filter(|s| s.cached).map(|s| s.stage).collect();
    assert_eq!(cached, vec![Stage::Scrape, Stage::Describe, Stage::SynthesizePrompt]);
    assert_eq!(harness.scraper.calls.load(Ordering::SeqCst), 1);
    // Only the build_config request was repeated.
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), calls_after_failure + 1);
}

#[tokio::test]
async fn changed_vision_instructions_invalidate_describe_and_downstream_only() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(1));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

    let config = fast_config(dir.path()).build().unwrap();
    let first = harness.pipeline(store.clone(), config).run(URL, None).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let config = fast_config(dir.path())
        .vision_instructions("List only the hinge and screw details.")
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let second = harness.pipeline(store, config).run(URL, None).await.unwrap();

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "cached:scrape",
            "start:describe",
            "start:synthesize_prompt",
            "start:build_config",
            "start:generate_model",
        ]
    );
    assert_ne!(second.prompt, first.prompt);
    assert!(second.prompt.as_str().contains("List only the hinge"));
    assert_eq!(harness.scraper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.jobs.submitted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_job_is_not_retried_and_not_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::ending_with(product2mesh::JobStatus::Failed(
        "geometry generation failed".into(),
    )));
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = fast_config(dir.path()).build().unwrap();

    let err = harness.pipeline(store.clone(), config).run(URL, None).await.unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::GenerateModel));
    assert_eq!(err.kind(), "JobFailed");
    assert!(err.to_string().contains("geometry generation failed"));
    // queued, running, failed
    assert_eq!(harness.jobs.polls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.jobs.submitted.lock().unwrap().len(), 1);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn one_failed_texture_is_skipped_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut jobs = FakeJobs::succeeding(3);
    jobs.failing_downloads = vec!["https://fal.example/files/texture_1.png".into()];
    let harness = Harness::new(jobs);
    let recorder = Arc::new(Recorder::default());
    let config = fast_config(dir.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let output = harness
        .pipeline(Arc::new(MemoryCheckpointStore::new()), config)
        .run(URL, None)
        .await
        .unwrap();

    let indices: Vec<usize> = output.artifacts.textures.iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(output.artifacts.warnings.len(), 1);
    assert!(matches!(
        output.artifacts.warnings[0],
        ArtifactWarning::TextureSkipped { index: 1, .. }
    ));
    let warnings = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with("warning:"))
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn timed_out_job_can_be_awaited_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut jobs = FakeJobs::succeeding(0);
    jobs.statuses = Mutex::new(VecDeque::from(vec![product2mesh::JobStatus::Queued; 500]));
    let harness = Harness::new(jobs);
    let config = fast_config(dir.path())
        .poll_interval_ms(50)
        .max_poll_secs(1)
        .build()
        .unwrap();
    let pipeline = harness.pipeline(Arc::new(MemoryCheckpointStore::new()), config);

    let err = pipeline.run(URL, None).await.unwrap_err();
    let job_id = match err.error() {
        PipelineError::JobTimedOut { job_id, .. } => job_id.clone(),
        other => panic!("expected JobTimedOut, got {other:?}"),
    };
    assert_eq!(job_id, "req-1");

    harness.jobs.statuses.lock().unwrap().clear();
    let artifacts = pipeline.await_job(&JobHandle::new(job_id), "jet-black").await.unwrap();
    assert!(artifacts.mesh.ends_with("jet-black/model.glb"));
    assert_eq!(harness.jobs.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_url_is_a_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeJobs::succeeding(0));
    let config = fast_config(dir.path()).build().unwrap();

    let err = assert_err!(
        harness
            .pipeline(Arc::new(MemoryCheckpointStore::new()), config)
            .run("not a url", None)
            .await
    );

    assert!(matches!(err, RunError::Setup(PipelineError::InvalidConfig(_))));
    assert_eq!(harness.scraper.calls.load(Ordering::SeqCst), 0);
}
