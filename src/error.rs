//! Error types for the product2mesh library.
//!
//! Four layers of failure, each with its own type:
//!
//! * [`CallError`]: what a single external call reported (network blip,
//!   HTTP 503, rate limit, bad request). This is the input vocabulary of the
//!   [`crate::gateway::Gateway`], which decides from it whether to retry.
//!
//! * [`PipelineError`]: **Fatal to a stage**: the gateway gave up, the model
//!   produced unusable output, the job failed remotely. No checkpoint is
//!   written for the stage that raised it.
//!
//! * [`RunError`]: what [`crate::pipeline::Pipeline::run`] returns: the
//!   stage-level error plus the run id and the stage it happened in, so the
//!   caller can report "stage X failed with kind Y" and re-invoke later.
//!
//! * [`ArtifactWarning`]: **Non-fatal**: one texture could not be fetched.
//!   Stored inside [`crate::model::ArtifactSet`] so callers can inspect
//!   partial success instead of losing the whole asset to one file.

use crate::gateway::RequestKind;
use crate::model::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by one attempt of an external call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CallError {
    /// The product page could not be rendered within the bounded wait.
    #[error("product page unavailable: {0}")]
    ScrapeUnavailable(String),

    /// The text/vision generation service could not be reached.
    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),

    /// Connection reset, DNS failure, TLS error, truncated body.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within its hard timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote side answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// HTTP 429 or an equivalent provider signal.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request itself was rejected as invalid; retrying cannot help.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The call succeeded but its payload failed structured extraction.
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),
}

impl CallError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::ScrapeUnavailable(_)
            | CallError::GenerationUnavailable(_)
            | CallError::Network(_)
            | CallError::Timeout
            | CallError::RateLimited { .. } => true,
            CallError::Http { status, .. } => *status >= 500 || *status == 408,
            CallError::MalformedRequest(_) | CallError::Malformed(_) => false,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        match status {
            429 => CallError::RateLimited { retry_after_secs },
            400 | 422 => CallError::MalformedRequest(format!("HTTP {}: {}", status, body.into())),
            _ => CallError::Http {
                status,
                body: body.into(),
            },
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CallError::Timeout
        } else if let Some(status) = e.status() {
            CallError::from_status(status.as_u16(), e.to_string(), None)
        } else if e.is_builder() {
            CallError::MalformedRequest(e.to_string())
        } else {
            CallError::Network(e.to_string())
        }
    }
}

/// Model output that could not be turned into the expected structure.
///
/// `Parse` means no data was found; `SchemaViolation` means data was found
/// but has the wrong shape.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum MalformedResponse {
    /// No structured payload could be located or parsed.
    #[error("could not parse structured response: {detail}")]
    Parse { detail: String },

    /// A payload was parsed but does not satisfy the schema.
    #[error("schema violation at '{field}': {reason}")]
    SchemaViolation { field: String, reason: String },
}

/// Fatal errors for one pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Gateway ───────────────────────────────────────────────────────────
    /// Every attempt failed with a retryable error.
    #[error("{kind} call failed after {attempts} attempts: {last}")]
    GatewayExhausted {
        kind: RequestKind,
        attempts: u32,
        last: CallError,
    },

    /// The call failed with an error that retrying cannot fix.
    #[error("{kind} call rejected: {cause}")]
    GatewayRejected { kind: RequestKind, cause: CallError },

    // ── Model output ──────────────────────────────────────────────────────
    /// Model output was unparsable or violated its schema.
    #[error("malformed model output: {0}")]
    MalformedResponse(#[from] MalformedResponse),

    /// The synthesized prompt is empty or still contains template placeholders.
    #[error("invalid generation prompt: {0}")]
    InvalidPrompt(String),

    /// The job configuration cannot be submitted, or pipeline settings are invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Remote job ────────────────────────────────────────────────────────
    /// The remote job reached a terminal failure state.
    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// Polling exceeded its total budget; the job may still be running remotely.
    #[error("job {job_id} did not finish within {waited_secs}s; re-poll with the same handle to keep waiting")]
    JobTimedOut { job_id: String, waited_secs: u64 },

    // ── Local state ───────────────────────────────────────────────────────
    /// Could not write a downloaded artifact.
    #[error("failed to write artifact '{path}': {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint store I/O failure or corrupt record.
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    // ── Setup ─────────────────────────────────────────────────────────────
    /// A collaborator is missing credentials or cannot be constructed.
    #[error("provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short taxonomy name, stable for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::GatewayExhausted { .. } => "GatewayExhausted",
            PipelineError::GatewayRejected { .. } => "GatewayRejected",
            PipelineError::MalformedResponse(MalformedResponse::Parse { .. }) => "ParseError",
            PipelineError::MalformedResponse(MalformedResponse::SchemaViolation { .. }) => {
                "SchemaViolation"
            }
            PipelineError::InvalidPrompt(_) => "InvalidPrompt",
            PipelineError::InvalidConfig(_) => "InvalidConfig",
            PipelineError::JobFailed { .. } => "JobFailed",
            PipelineError::JobTimedOut { .. } => "JobTimedOut",
            PipelineError::ArtifactWrite { .. } => "ArtifactWrite",
            PipelineError::Checkpoint(_) => "Checkpoint",
            PipelineError::ProviderNotConfigured { .. } => "ProviderNotConfigured",
            PipelineError::Internal(_) => "Internal",
        }
    }
}

/// Error returned by a pipeline run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run could not start (bad run id, missing credentials, ...).
    #[error("pipeline setup failed: {0}")]
    Setup(#[source] PipelineError),

    /// A stage failed. Checkpoints of earlier stages remain in the store.
    #[error("run '{run_id}' failed at stage '{stage}' [{}]: {source}", .source.kind())]
    Stage {
        run_id: String,
        stage: Stage,
        #[source]
        source: PipelineError,
    },
}

impl RunError {
    /// The stage that failed, if the run got that far.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunError::Setup(_) => None,
            RunError::Stage { stage, .. } => Some(*stage),
        }
    }

    /// The underlying stage-level error.
    pub fn error(&self) -> &PipelineError {
        match self {
            RunError::Setup(e) => e,
            RunError::Stage { source, .. } => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.error().kind()
    }
}

/// A non-fatal problem while fetching job artifacts.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ArtifactWarning {
    /// A texture could not be downloaded or written and was left out.
    #[error("texture {index} skipped ({url}): {detail}")]
    TextureSkipped {
        index: usize,
        url: String,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            CallError::from_status(429, "slow down", Some(7)),
            CallError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
        assert!(CallError::from_status(503, "overloaded", None).is_retryable());
        assert!(CallError::from_status(408, "", None).is_retryable());
        assert!(!CallError::from_status(404, "gone", None).is_retryable());
        assert!(!CallError::from_status(400, "bad", None).is_retryable());
        assert!(matches!(
            CallError::from_status(422, "unprocessable", None),
            CallError::MalformedRequest(_)
        ));
    }

    #[test]
    fn malformed_output_is_not_retryable() {
        let e: CallError = MalformedResponse::Parse {
            detail: "no JSON".into(),
        }
        .into();
        assert!(!e.is_retryable());
    }

    #[test]
    fn kind_distinguishes_parse_from_schema() {
        let parse = PipelineError::from(MalformedResponse::Parse {
            detail: "x".into(),
        });
        let schema = PipelineError::from(MalformedResponse::SchemaViolation {
            field: "prompt".into(),
            reason: "missing".into(),
        });
        assert_eq!(parse.kind(), "ParseError");
        assert_eq!(schema.kind(), "SchemaViolation");
    }

    #[test]
    fn stage_error_display_names_stage_and_kind() {
        let e = RunError::Stage {
            run_id: "run-1".into(),
            stage: Stage::BuildConfig,
            source: PipelineError::InvalidConfig("image_refs is empty".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("build_config"), "got: {msg}");
        assert!(msg.contains("InvalidConfig"), "got: {msg}");
        assert_eq!(e.stage(), Some(Stage::BuildConfig));
    }

    #[test]
    fn job_timeout_display() {
        let e = PipelineError::JobTimedOut {
            job_id: "req-9".into(),
            waited_secs: 600,
        };
        assert!(e.to_string().contains("600s"));
        assert!(e.to_string().contains("req-9"));
    }
}
