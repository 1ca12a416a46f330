//! CLI binary for product2mesh.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use product2mesh::model::{ConditionMode, OutputFormat};
use product2mesh::{
    inspect_run, resume_job, run_pipeline, ArtifactWarning, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, RunError, RunId, Stage,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar with a step per stage; job polls update the message line.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Mutex<HashMap<Stage, Instant>>,
    last_log: Mutex<String>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:30.green/238}] {pos}/{len} stages  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(Stage::ALL.len() as u64);
        bar.set_style(style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            started: Mutex::new(HashMap::new()),
            last_log: Mutex::new(String::new()),
        })
    }

    fn elapsed(&self, stage: Stage) -> String {
        let secs = self
            .started
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&stage))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        format!("{secs:.1}s")
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, run_id: &str, total_stages: usize) {
        self.bar.set_length(total_stages as u64);
        self.bar.println(format!("{} {}", bold("◆"), bold(&format!("Run {run_id}"))));
    }

    fn on_stage_start(&self, stage: Stage) {
        if let Ok(mut m) = self.started.lock() {
            m.insert(stage, Instant::now());
        }
        self.bar.set_prefix(stage.as_str());
        self.bar.set_message("");
    }

    fn on_stage_cached(&self, stage: Stage) {
        self.bar
            .println(format!("  {} {:<18} {}", dim("↺"), stage.as_str(), dim("cached")));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: Stage, _duration_ms: u64) {
        let elapsed = self.elapsed(stage);
        self.bar
            .println(format!("  {} {:<18} {}", green("✓"), stage.as_str(), dim(&elapsed)));
        self.bar.inc(1);
    }

    fn on_stage_error(&self, stage: Stage, kind: &str, error: &str) {
        let elapsed = self.elapsed(stage);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<18} {} {}  {}",
            red("✗"),
            stage.as_str(),
            red(kind),
            msg,
            dim(&elapsed)
        ));
    }

    fn on_job_status(&self, job_id: &str, status: &str, messages: &[String]) {
        // Only new log lines arrive; keep showing the latest one between them.
        let last = match self.last_log.lock() {
            Ok(mut log) => {
                if let Some(m) = messages.last() {
                    *log = m.clone();
                }
                log.clone()
            }
            Err(_) => String::new(),
        };
        self.bar.set_message(format!("job {job_id}: {status} {}", dim(&last)));
    }

    fn on_artifact_warning(&self, warning: &ArtifactWarning) {
        self.bar.println(format!("  {} {}", yellow("⚠"), warning));
    }

    fn on_run_complete(&self, _run_id: &str, cached_stages: usize, executed_stages: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} stages executed, {} from checkpoints",
            green("✔"),
            bold(&executed_stages.to_string()),
            cached_stages
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Generate a model for a product page (resumes automatically on rerun)
  product2mesh https://shop.example/p/aviator-52

  # Name the run explicitly and keep checkpoints elsewhere
  product2mesh --run-id aviator --checkpoint-dir /tmp/ckpt https://shop.example/p/aviator-52

  # Show what has been checkpointed so far
  product2mesh --inspect-only --run-id aviator https://shop.example/p/aviator-52

  # Keep waiting for a job that timed out
  product2mesh --job-id 0b6c2f9e-... https://shop.example/p/aviator-52

  # JSON output
  product2mesh --json https://shop.example/p/aviator-52 > run.json

ENVIRONMENT VARIABLES:
  FAL_KEY                 fal.ai API key (required for the generate_model stage)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PRODUCT2MESH_*          Any flag below, e.g. PRODUCT2MESH_CHECKPOINT_DIR

  A .env file in the working directory is loaded first.
"#;

/// Turn a product page into a textured 3D model.
#[derive(Parser, Debug)]
#[command(
    name = "product2mesh",
    version,
    about = "Turn a product page into a textured 3D model via vision LLMs and Rodin",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Product page URL.
    url: String,

    /// Run identifier. Default: derived from the URL, so reruns resume.
    #[arg(long, env = "PRODUCT2MESH_RUN_ID")]
    run_id: Option<String>,

    /// Checkpoint store root.
    #[arg(long, env = "PRODUCT2MESH_CHECKPOINT_DIR", default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Root directory for downloaded models.
    #[arg(long, env = "PRODUCT2MESH_ARTIFACT_DIR", default_value = "data/3d_models")]
    artifact_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "PRODUCT2MESH_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "PRODUCT2MESH_PROVIDER")]
    provider: Option<String>,

    /// Attempts per external call, including the first.
    #[arg(long, env = "PRODUCT2MESH_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Initial retry delay in milliseconds; doubles per attempt.
    #[arg(long, env = "PRODUCT2MESH_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per-call timeout in seconds.
    #[arg(long, env = "PRODUCT2MESH_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Delay between job status polls in milliseconds.
    #[arg(long, env = "PRODUCT2MESH_POLL_INTERVAL_MS", default_value_t = 5_000)]
    poll_interval_ms: u64,

    /// Give up polling after this many seconds (the job keeps running remotely).
    #[arg(long, env = "PRODUCT2MESH_MAX_POLL_SECS", default_value_t = 900)]
    max_poll_secs: u64,

    /// Concurrent texture downloads.
    #[arg(short, long, env = "PRODUCT2MESH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// How the reference views are combined.
    #[arg(long, env = "PRODUCT2MESH_CONDITION_MODE", value_enum, default_value = "concat")]
    condition_mode: ConditionArg,

    /// Mesh format.
    #[arg(long, env = "PRODUCT2MESH_FORMAT", value_enum, default_value = "glb")]
    format: FormatArg,

    /// Fixed generation seed.
    #[arg(long, env = "PRODUCT2MESH_SEED")]
    seed: Option<u64>,

    /// Text file replacing the built-in vision checklist.
    #[arg(long, env = "PRODUCT2MESH_VISION_INSTRUCTIONS")]
    vision_instructions: Option<PathBuf>,

    /// Print the run result as JSON.
    #[arg(long, env = "PRODUCT2MESH_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PRODUCT2MESH_NO_PROGRESS")]
    no_progress: bool,

    /// Print the stored checkpoint records for the run and exit.
    #[arg(long)]
    inspect_only: bool,

    /// Re-poll an already submitted job and download its artifacts.
    #[arg(long, env = "PRODUCT2MESH_JOB_ID")]
    job_id: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PRODUCT2MESH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PRODUCT2MESH_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ConditionArg {
    Fuse,
    Concat,
}

impl From<ConditionArg> for ConditionMode {
    fn from(v: ConditionArg) -> Self {
        match v {
            ConditionArg::Fuse => ConditionMode::Fuse,
            ConditionArg::Concat => ConditionMode::Concat,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Glb,
    Usdz,
    Fbx,
    Obj,
    Stl,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Glb => OutputFormat::Glb,
            FormatArg::Usdz => OutputFormat::Usdz,
            FormatArg::Fbx => OutputFormat::Fbx,
            FormatArg::Obj => OutputFormat::Obj,
            FormatArg::Stl => OutputFormat::Stl,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match run(&cli, show_progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<RunError>() {
                Some(RunError::Stage { run_id, stage, source }) => eprintln!(
                    "{} run {} failed at stage {} [{}]: {}",
                    red("✘"),
                    bold(run_id),
                    bold(stage.as_str()),
                    red(source.kind()),
                    source
                ),
                _ => eprintln!("{} {:#}", red("✘"), e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, show_progress: bool) -> Result<()> {
    let run_id = match &cli.run_id {
        Some(id) => RunId::new(id.as_str()).context("Invalid --run-id")?,
        None => RunId::for_product(&cli.url),
    };

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let records = inspect_run(&cli.checkpoint_dir, &run_id)
            .await
            .context("Failed to read checkpoints")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&records).context("Failed to serialise records")?
            );
        } else if records.is_empty() {
            println!("No checkpoints for run {run_id}");
        } else {
            println!("Run:  {run_id}");
            for r in &records {
                println!(
                    "  {:<18} {}  {}",
                    r.stage.as_str(),
                    r.input_fingerprint.short(),
                    r.completed_at.to_rfc3339()
                );
            }
        }
        return Ok(());
    }

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, progress_cb).await?;

    // ── Re-poll a submitted job ──────────────────────────────────────────
    if let Some(ref job_id) = cli.job_id {
        let product_id = product2mesh::model::product_id_for(&cli.url);
        let artifacts = resume_job(job_id, &product_id, &config)
            .await
            .with_context(|| format!("Job {job_id} did not complete"))?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&artifacts).context("Failed to serialise artifacts")?
            );
        } else {
            println!("{}", artifacts.mesh.display());
        }
        return Ok(());
    }

    // ── Run the pipeline ─────────────────────────────────────────────────
    let output = run_pipeline(&cli.url, Some(run_id), &config).await?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        );
        return Ok(());
    }

    println!("{}", output.artifacts.mesh.display());
    if !cli.quiet {
        for t in &output.artifacts.textures {
            eprintln!("   {} {}", dim("texture"), t.path.display());
        }
        for w in &output.artifacts.warnings {
            eprintln!("   {} {}", yellow("⚠"), w);
        }
        if !show_progress {
            eprintln!(
                "Run {}: {} executed, {} cached, {}ms",
                output.run_id,
                output.executed_stages(),
                output.cached_stages(),
                output.total_duration_ms
            );
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .checkpoint_dir(&cli.checkpoint_dir)
        .artifact_dir(&cli.artifact_dir)
        .max_attempts(cli.max_attempts)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .retry_max_delay_ms(cli.retry_backoff_ms.saturating_mul(16))
        .call_timeout_secs(cli.api_timeout)
        .poll_interval_ms(cli.poll_interval_ms)
        .max_poll_secs(cli.max_poll_secs)
        .download_concurrency(cli.concurrency)
        .condition_mode(cli.condition_mode.into())
        .output_format(cli.format.into());

    if let Some(seed) = cli.seed {
        builder = builder.seed(seed);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.as_str());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.as_str());
    }
    if let Some(ref path) = cli.vision_instructions {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read vision instructions from {:?}", path))?;
        builder = builder.vision_instructions(text);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
