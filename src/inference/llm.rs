//! [`InferenceService`] backed by `edgequake-llm` providers.
//!
//! Chat tasks become a system message plus a user message (with the image
//! attached for vision tasks); embeddings go to the embedding provider.
//! Provider failures are reduced to [`InferenceError`] here so the
//! rate-limited client can tell throttling from fatal faults.

use super::{InferenceRequest, InferenceResponse, InferenceService, InferenceTask};
use crate::config::IngestionConfig;
use crate::error::{InferenceError, PdfRagError};
use async_trait::async_trait;
use edgequake_llm::{
    ChatMessage, CompletionOptions, EmbeddingProvider, LLMProvider, ProviderFactory,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

static RE_RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:retry[- ]after|try again in)\D{0,4}(\d+(?:\.\d+)?)\s*(ms|s|sec|seconds)?")
        .unwrap()
});

/// Vision chat + embeddings over `edgequake-llm`.
#[derive(Clone)]
pub struct LlmInferenceService {
    llm: Arc<dyn LLMProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmInferenceService {
    pub fn new(llm: Arc<dyn LLMProvider>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            llm,
            embedder,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    pub fn with_options(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Resolve both providers from an ingestion config.
    pub fn from_config(config: &IngestionConfig) -> Result<Self, PdfRagError> {
        let llm = resolve_vision_provider(
            config.provider.clone(),
            config.provider_name.as_deref(),
            config.model.as_deref(),
        )?;
        let embedder = resolve_embedding_provider(config.embedding_provider.clone())?;
        Ok(Self::new(llm, Some(embedder)).with_options(config.temperature, config.max_tokens))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    async fn chat(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        let text = request.inputs.join("\n\n");
        match &request.image {
            Some(image) => {
                messages.push(ChatMessage::user_with_images(text, vec![image.to_image_data()]))
            }
            None => messages.push(ChatMessage::user(text)),
        }

        let start = Instant::now();
        let response = self
            .llm
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| classify(e.to_string()))?;
        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.task,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(InferenceResponse::Text(response.content))
    }

    async fn embed(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let embedder = self.embedder.as_ref().ok_or_else(|| InferenceError::Fatal {
            detail: "no embedding provider configured".into(),
        })?;
        let vectors = embedder
            .embed(&request.inputs)
            .await
            .map_err(|e| classify(e.to_string()))?;
        debug!("embed: {} texts", request.inputs.len());
        Ok(InferenceResponse::Embeddings(vectors))
    }
}

#[async_trait]
impl InferenceService for LlmInferenceService {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        match request.task {
            InferenceTask::Embed => self.embed(request).await,
            _ => self.chat(request).await,
        }
    }
}

/// Classify a provider error message, picking up a server retry hint.
fn classify(message: String) -> InferenceError {
    match InferenceError::from_provider_message(message) {
        InferenceError::Throttled { detail, .. } => InferenceError::Throttled {
            retry_after_ms: retry_after_hint(&detail),
            detail,
        },
        other => other,
    }
}

/// Parse "retry after 2s" / "try again in 350ms" style hints.
fn retry_after_hint(message: &str) -> Option<u64> {
    let caps = RE_RETRY_AFTER.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit == "ms" => value,
        _ => value * 1000.0,
    };
    Some(ms.round() as u64)
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PdfRagError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PdfRagError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, most specific source first:
///
/// 1. a pre-built provider
/// 2. a named provider (+ model)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env` auto-detection
pub fn resolve_vision_provider(
    provider: Option<Arc<dyn LLMProvider>>,
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, PdfRagError> {
    if let Some(provider) = provider {
        return Ok(provider);
    }

    if let Some(name) = provider_name {
        return create_vision_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_vision_provider("openai", model.unwrap_or(DEFAULT_MODEL));
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| PdfRagError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {e}"
            ),
        })?;
    Ok(llm)
}

/// Use the given embedding provider or auto-detect one from the environment.
pub fn resolve_embedding_provider(
    provider: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<dyn EmbeddingProvider>, PdfRagError> {
    if let Some(provider) = provider {
        return Ok(provider);
    }
    let (_llm, embedding) =
        ProviderFactory::from_env().map_err(|e| PdfRagError::ProviderNotConfigured {
            provider: "embedding".to_string(),
            hint: format!("No embedding provider could be auto-detected: {e}"),
        })?;
    Ok(embedding)
}
