//! Resilient API gateway: every external call goes through here.
//!
//! Wraps one attempt of a call in a hard timeout, classifies the outcome,
//! and retries transient failures with exponential backoff
//! (`base_delay * 2^(attempt-1)`, clamped to `max_delay`). With the default
//! 500 ms base and 3 attempts the waits are 500 ms → 1 s.
//!
//! Non-retryable failures (bad request, malformed model output) are returned
//! after the first attempt. Malformed output keeps its own error kind so the
//! caller can tell "the model misbehaved" apart from "the network did".

use crate::error::{CallError, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Category of an external call, used in logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    RenderPage,
    GenerateText,
    GenerateVision,
    SubmitJob,
    PollJob,
    FetchArtifact,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::RenderPage => "render_page",
            RequestKind::GenerateText => "generate_text",
            RequestKind::GenerateVision => "generate_vision",
            RequestKind::SubmitJob => "submit_job",
            RequestKind::PollJob => "poll_job",
            RequestKind::FetchArtifact => "fetch_artifact",
        })
    }
}

/// Retry and timeout settings for gateway calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Hard limit on a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << shift;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay after a failed attempt, honouring a server retry-after hint.
    fn delay_after(&self, attempt: u32, err: &CallError) -> Duration {
        match err {
            CallError::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs).min(self.max_delay),
            _ => self.delay_for(attempt),
        }
    }
}

/// Executes external calls under a [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct Gateway {
    policy: RetryPolicy,
    attempts: AtomicU64,
}

impl Gateway {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of attempts made through this gateway since creation.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` is invoked once per attempt and must build a fresh future each
    /// time.
    pub async fn call<T, F, Fut>(&self, kind: RequestKind, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = match timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{}: succeeded on attempt {}/{}", kind, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!("{}: attempt {} failed permanently: {}", kind, attempt, err);
                return Err(match err {
                    CallError::Malformed(m) => PipelineError::MalformedResponse(m),
                    cause => PipelineError::GatewayRejected { kind, cause },
                });
            }

            if attempt >= max_attempts {
                warn!("{}: giving up after {} attempts: {}", kind, attempt, err);
                return Err(PipelineError::GatewayExhausted {
                    kind,
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_after(attempt, &err);
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {}ms",
                kind,
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MalformedResponse;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            ..RetryPolicy::default()
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
        assert_eq!(p.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn retry_after_is_capped() {
        let p = fast_policy(3);
        let d = p.delay_after(
            1,
            &CallError::RateLimited {
                retry_after_secs: Some(60),
            },
        );
        assert_eq!(d, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let gw = Gateway::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = gw
            .call(RequestKind::GenerateText, move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::Network("reset".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(gw.attempt_count(), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_error() {
        let gw = Gateway::new(fast_policy(2));
        let err = gw
            .call(RequestKind::SubmitJob, || async {
                Err::<(), _>(CallError::from_status(503, "busy", None))
            })
            .await
            .unwrap_err();
        match err {
            PipelineError::GatewayExhausted { kind, attempts, last } => {
                assert_eq!(kind, RequestKind::SubmitJob);
                assert_eq!(attempts, 2);
                assert!(matches!(last, CallError::Http { status: 503, .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_output_is_not_retried() {
        let gw = Gateway::new(fast_policy(5));
        let err = gw
            .call(RequestKind::GenerateText, || async {
                Err::<(), _>(CallError::Malformed(MalformedResponse::Parse {
                    detail: "no JSON".into(),
                }))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert_eq!(gw.attempt_count(), 1);
    }

    #[tokio::test]
    async fn bad_request_is_rejected_once() {
        let gw = Gateway::new(fast_policy(5));
        let err = gw
            .call(RequestKind::SubmitJob, || async {
                Err::<(), _>(CallError::from_status(400, "bad field", None))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GatewayRejected { .. }));
        assert_eq!(gw.attempt_count(), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out_and_retries() {
        let gw = Gateway::new(RetryPolicy {
            call_timeout: Duration::from_millis(20),
            ..fast_policy(2)
        });
        let err = gw
            .call(RequestKind::RenderPage, || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::GatewayExhausted {
                last: CallError::Timeout,
                attempts: 2,
                ..
            }
        ));
    }
}
