//! Job lifecycle: submit → poll → complete/fail → fetch artifacts.
//!
//! ```text
//! submit ──► Queued ──► Running ──► Succeeded ──► fetch mesh + textures
//!              │  ▲        │  ▲
//!              └──┘        └──┘   (sleep poll interval between polls)
//!                                 Failed ──► JobFailed (never retried)
//!                   budget exceeded ──► JobTimedOut (handle kept in the error)
//! ```
//!
//! Transient poll failures are retried by the gateway like any other call;
//! a terminal `Failed` status is a result, not an error, and ends the job.

use crate::error::{ArtifactWarning, PipelineError};
use crate::gateway::{Gateway, RequestKind};
use crate::model::{ArtifactLocation, ArtifactRefs, ArtifactSet, JobConfig, JobHandle, JobStatus, TextureFile};
use crate::progress::ProgressCallback;
use crate::services::JobService;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Polling cadence and budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Total time allowed from the first poll until a terminal status.
    pub max_total: Duration,
}

/// Drives one remote job through its lifecycle.
pub struct JobController {
    gateway: Arc<Gateway>,
    service: Arc<dyn JobService>,
    poll: PollSettings,
    download_concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl JobController {
    pub fn new(gateway: Arc<Gateway>, service: Arc<dyn JobService>, poll: PollSettings) -> Self {
        Self {
            gateway,
            service,
            poll,
            download_concurrency: 4,
            progress: None,
        }
    }

    pub fn with_download_concurrency(mut self, n: usize) -> Self {
        self.download_concurrency = n.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Validate and submit a job configuration.
    pub async fn submit(&self, config: &JobConfig) -> Result<JobHandle, PipelineError> {
        config.validate()?;
        let handle = self
            .gateway
            .call(RequestKind::SubmitJob, || self.service.submit(config))
            .await?;
        info!("Submitted job {} ({} reference images)", handle, config.image_refs.len());
        Ok(handle)
    }

    /// Poll until the job reaches a terminal state, then fetch its artifacts.
    pub async fn await_completion(
        &self,
        handle: &JobHandle,
        location: &ArtifactLocation,
    ) -> Result<ArtifactSet, PipelineError> {
        let started = Instant::now();
        let deadline = started + self.poll.max_total;
        let mut last_label = "";
        // Running statuses carry the job's whole log so far.
        let mut logs_seen = 0usize;

        loop {
            let status = self
                .gateway
                .call(RequestKind::PollJob, || self.service.poll(handle))
                .await?;

            if status.label() != last_label {
                info!("Job {}: {}", handle, status.label());
                last_label = status.label();
            }
            let new_messages: &[String] = match &status {
                JobStatus::Running(m) => {
                    let fresh = new_log_lines(m, logs_seen);
                    logs_seen = m.len();
                    fresh
                }
                _ => &[],
            };
            for m in new_messages {
                debug!("Job {}: {}", handle, m);
            }
            if let Some(cb) = &self.progress {
                cb.on_job_status(handle.id(), status.label(), new_messages);
            }

            match status {
                JobStatus::Queued | JobStatus::Running(_) => {}
                JobStatus::Succeeded(refs) => {
                    info!(
                        "Job {} finished after {:?}: 1 mesh, {} textures",
                        handle,
                        started.elapsed(),
                        refs.textures.len()
                    );
                    return self.fetch_artifacts(&refs, location).await;
                }
                JobStatus::Failed(reason) => {
                    return Err(PipelineError::JobFailed {
                        job_id: handle.id().to_string(),
                        reason,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::JobTimedOut {
                    job_id: handle.id().to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep(self.poll.interval.min(deadline - now)).await;
        }
    }

    /// Download the mesh (fatal on failure) and textures (skipped with a
    /// warning on failure) into `location`.
    pub async fn fetch_artifacts(
        &self,
        refs: &ArtifactRefs,
        location: &ArtifactLocation,
    ) -> Result<ArtifactSet, PipelineError> {
        let mesh_path = location.mesh_path();
        let mesh = self
            .gateway
            .call(RequestKind::FetchArtifact, || self.service.download(&refs.mesh))
            .await?;
        write_atomic(&mesh_path, &mesh).await?;
        debug!("Wrote mesh {} ({} bytes)", mesh_path.display(), mesh.len());

        let results: Vec<(usize, &String, Result<TextureFile, PipelineError>)> =
            stream::iter(refs.textures.iter().enumerate().map(|(index, url)| async move {
                let path = location.texture_path(index, url);
                let result = async move {
                    let bytes = self
                        .gateway
                        .call(RequestKind::FetchArtifact, || self.service.download(url))
                        .await?;
                    write_atomic(&path, &bytes).await?;
                    Ok::<_, PipelineError>(TextureFile { index, path })
                }
                .await;
                (index, url, result)
            }))
            .buffer_unordered(self.download_concurrency)
            .collect()
            .await;

        let mut textures = Vec::new();
        let mut warnings = Vec::new();
        for (index, url, result) in results {
            match result {
                Ok(tex) => textures.push(tex),
                Err(e) => {
                    warn!("Texture {} skipped: {}", index, e);
                    warnings.push(ArtifactWarning::TextureSkipped {
                        index,
                        url: url.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        textures.sort_by_key(|t| t.index);
        warnings.sort_by_key(|w| match w {
            ArtifactWarning::TextureSkipped { index, .. } => *index,
        });

        if let Some(cb) = &self.progress {
            for w in &warnings {
                cb.on_artifact_warning(w);
            }
        }

        Ok(ArtifactSet {
            product_id: location.product_id.clone(),
            directory: location.directory(),
            mesh: mesh_path,
            textures,
            warnings,
        })
    }
}

/// Lines of a cumulative log not yet reported. A log shorter than what was
/// already seen was restarted and is reported whole.
fn new_log_lines(log: &[String], seen: usize) -> &[String] {
    if seen <= log.len() {
        &log[seen..]
    } else {
        log
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let io_err = |e: std::io::Error| PipelineError::ArtifactWrite {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}
