//! Inference boundary: typed requests to the external vision/text service.
//!
//! Every call the pipeline makes (layout detection, table structuring,
//! captioning, intent classification, embedding) is an [`InferenceRequest`]
//! tagged with its [`InferenceTask`]. Requests go through
//! [`RateLimitedClient`], which owns retry and backoff; the concrete service
//! behind it is any [`InferenceService`], normally [`LlmInferenceService`].

mod client;
mod llm;

pub use client::{BackoffState, RateLimitedClient, Sleeper, TokioSleeper};
pub use llm::{resolve_embedding_provider, resolve_vision_provider, LlmInferenceService};

use crate::error::InferenceError;
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured task descriptor sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InferenceTask {
    DetectLayout,
    StructureTable,
    Caption,
    ClassifyIntent,
    Embed,
}

impl InferenceTask {
    pub fn as_str(self) -> &'static str {
        match self {
            InferenceTask::DetectLayout => "detect-layout",
            InferenceTask::StructureTable => "structure-table",
            InferenceTask::Caption => "caption",
            InferenceTask::ClassifyIntent => "classify-intent",
            InferenceTask::Embed => "embed",
        }
    }
}

impl fmt::Display for InferenceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to the inference service.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub task: InferenceTask,
    /// System instructions (schema, rules). Unused for embeddings.
    pub system: Option<String>,
    /// User text: one entry for chat tasks, the batch for [`InferenceTask::Embed`].
    pub inputs: Vec<String>,
    /// Image attached to vision tasks.
    pub image: Option<EncodedImage>,
}

impl InferenceRequest {
    /// A vision request: system prompt + image + optional instruction text.
    pub fn vision(
        task: InferenceTask,
        system: impl Into<String>,
        instruction: impl Into<String>,
        image: EncodedImage,
    ) -> Self {
        Self {
            task,
            system: Some(system.into()),
            inputs: vec![instruction.into()],
            image: Some(image),
        }
    }

    /// A text-only chat request.
    pub fn text(task: InferenceTask, system: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            task,
            system: Some(system.into()),
            inputs: vec![text.into()],
            image: None,
        }
    }

    /// An embedding request for a batch of texts.
    pub fn embed(texts: Vec<String>) -> Self {
        Self {
            task: InferenceTask::Embed,
            system: None,
            inputs: texts,
            image: None,
        }
    }
}

/// Service reply. Chat tasks return text, [`InferenceTask::Embed`] returns vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResponse {
    Text(String),
    Embeddings(Vec<Vec<f32>>),
}

impl InferenceResponse {
    pub fn into_text(self) -> Result<String, InferenceError> {
        match self {
            InferenceResponse::Text(t) => Ok(t),
            InferenceResponse::Embeddings(_) => Err(InferenceError::UnexpectedResponse {
                detail: "expected text, got embeddings".into(),
            }),
        }
    }

    pub fn into_embeddings(self) -> Result<Vec<Vec<f32>>, InferenceError> {
        match self {
            InferenceResponse::Embeddings(e) => Ok(e),
            InferenceResponse::Text(_) => Err(InferenceError::UnexpectedResponse {
                detail: "expected embeddings, got text".into(),
            }),
        }
    }
}

/// The external inference service.
///
/// Implementations classify every failure as an [`InferenceError`] so the
/// rate-limited client can decide whether to retry.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}
