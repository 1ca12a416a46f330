//! Text and vision generation through an `edgequake_llm` provider.
//!
//! One request per call. Retries happen in the gateway; provider errors are
//! classified here into its error vocabulary.

use super::{images, TextGenerator};
use crate::error::CallError;
use crate::model::ImageRef;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// [`TextGenerator`] backed by an [`LLMProvider`].
pub struct LlmTextGenerator {
    provider: Arc<dyn LLMProvider>,
    http: reqwest::Client,
    temperature: f32,
    max_tokens: usize,
    image_contrast: Option<f32>,
}

impl LlmTextGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            http: reqwest::Client::new(),
            temperature: 0.1,
            max_tokens: 4000,
            image_contrast: None,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_image_contrast(mut self, contrast: Option<f32>) -> Self {
        self.image_contrast = contrast;
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for LlmTextGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmTextGenerator")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("image_contrast", &self.image_contrast)
            .finish_non_exhaustive()
    }
}

/// A single user turn, with the images attached when there are any.
fn build_messages(prompt: &str, images: Vec<ImageData>) -> Vec<ChatMessage> {
    if images.is_empty() {
        vec![ChatMessage::user(prompt)]
    } else {
        vec![ChatMessage::user_with_images(prompt, images)]
    }
}

static RE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d{2})\b").unwrap());

/// Map a provider error onto the gateway's classes.
///
/// Untyped provider failures (`ApiError`, `ProviderError`, `Unknown`) are
/// classified by the first standalone 4xx/5xx status in their message;
/// without one they count as a transient outage.
pub fn classify_llm_error(err: LlmError) -> CallError {
    match err {
        LlmError::RateLimited(_) => CallError::RateLimited {
            retry_after_secs: None,
        },
        LlmError::Timeout => CallError::Timeout,
        LlmError::NetworkError(message) => CallError::Network(message),
        LlmError::AuthError(_)
        | LlmError::InvalidRequest(_)
        | LlmError::TokenLimitExceeded { .. }
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_) => CallError::MalformedRequest(err.to_string()),
        LlmError::SerializationError(e) => {
            CallError::GenerationUnavailable(format!("unreadable provider response: {}", e))
        }
        LlmError::ApiError(message) | LlmError::ProviderError(message) | LlmError::Unknown(message) => {
            classify_api_message(message)
        }
    }
}

fn classify_api_message(message: String) -> CallError {
    let status = RE_STATUS
        .captures(&message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok());
    match status {
        Some(status) => CallError::from_status(status, message, None),
        None if message.to_ascii_lowercase().contains("rate limit") => CallError::RateLimited {
            retry_after_secs: None,
        },
        None => CallError::GenerationUnavailable(message),
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn generate_text(&self, prompt: &str, images: &[ImageRef]) -> Result<String, CallError> {
        let start = Instant::now();
        let attachments = images::prepare_all(&self.http, images, self.image_contrast).await?;
        let messages = build_messages(prompt, attachments);

        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(classify_llm_error)?;

        debug!(
            "{} images, {} input tokens, {} output tokens, {:?}",
            images.len(),
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        if response.content.trim().is_empty() {
            return Err(CallError::GenerationUnavailable(
                "provider returned an empty completion".into(),
            ));
        }
        Ok(response.content)
    }
}
