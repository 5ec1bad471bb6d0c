//! Fakes shared by the integration tests: a scripted inference service, a
//! renderer that paints blank pages, and a sleeper that records delays.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_pdfrag::inference::Sleeper;
use edgequake_pdfrag::pipeline::render::{PageRenderer, RenderedPage, Resolution};
use edgequake_pdfrag::{
    BackoffConfig, Document, InferenceError, InferenceRequest, InferenceResponse,
    InferenceService, InferenceTask, PageError, PdfRagError, RateLimitedClient,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimal bytes that pass the `%PDF` check; the fake renderer never parses them.
pub fn fake_document(id: &str) -> Document {
    Document::from_bytes(id, b"%PDF-1.7\n%fake\n".to_vec()).unwrap()
}

/// Deterministic, never-zero embedding derived from the text.
pub fn text_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 8];
    for (i, b) in text.bytes().enumerate() {
        v[(i + b as usize) % 7] += (b % 13) as f32 / 13.0;
    }
    v[7] = 1.0;
    v
}

/// `[s, sqrt(1 - s²)]`: cosine similarity `s` against the query `[1, 0]`.
pub fn at_similarity(s: f32) -> Vec<f32> {
    vec![s, (1.0 - s * s).max(0.0).sqrt()]
}

type Embedder = dyn Fn(&str) -> Vec<f32> + Send + Sync;

/// Inference service answering each task from a script.
pub struct ScriptedInference {
    /// Layout JSON per zero-based page; pages not listed get no elements.
    pub layouts: Mutex<HashMap<usize, String>>,
    pub table_markup: Mutex<String>,
    pub caption: Mutex<String>,
    pub intent: Mutex<String>,
    /// Errors returned for every call of a task.
    pub failures: Mutex<HashMap<InferenceTask, InferenceError>>,
    embedder: Box<Embedder>,
    calls: Mutex<Vec<InferenceTask>>,
}

impl Default for ScriptedInference {
    fn default() -> Self {
        Self {
            layouts: Mutex::new(HashMap::new()),
            table_markup: Mutex::new("| Indicator | 2023 |\n|---|---|\n| GDP | 2.1% |".into()),
            caption: Mutex::new("A line chart of inflation over time.".into()),
            intent: Mutex::new(r#"{"intent":"data_grounded","visual_type":null}"#.into()),
            failures: Mutex::new(HashMap::new()),
            embedder: Box::new(text_vector),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every embedding request returns `vector` for each input.
    pub fn with_fixed_embedding(mut self, vector: Vec<f32>) -> Self {
        self.embedder = Box::new(move |_: &str| vector.clone());
        self
    }

    pub fn layout(self, page_index: usize, json: &str) -> Self {
        self.layouts.lock().unwrap().insert(page_index, json.to_string());
        self
    }

    pub fn fail(self, task: InferenceTask, error: InferenceError) -> Self {
        self.failures.lock().unwrap().insert(task, error);
        self
    }

    pub fn calls(&self, task: InferenceTask) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| **t == task).count()
    }
}

fn page_of(instruction: &str) -> usize {
    instruction
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .last()
        .map(|n| n.saturating_sub(1))
        .unwrap_or(0)
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.calls.lock().unwrap().push(request.task);
        if let Some(err) = self.failures.lock().unwrap().get(&request.task) {
            return Err(err.clone());
        }
        let text = |s: &Mutex<String>| -> Result<InferenceResponse, InferenceError> {
            Ok(InferenceResponse::Text(s.lock().unwrap().clone()))
        };
        match request.task {
            InferenceTask::DetectLayout => {
                let page = page_of(request.inputs.first().map(String::as_str).unwrap_or(""));
                let layout = self
                    .layouts
                    .lock()
                    .unwrap()
                    .get(&page)
                    .cloned()
                    .unwrap_or_else(|| r#"{"elements": []}"#.to_string());
                Ok(InferenceResponse::Text(layout))
            }
            InferenceTask::StructureTable => text(&self.table_markup),
            InferenceTask::Caption => text(&self.caption),
            InferenceTask::ClassifyIntent => text(&self.intent),
            InferenceTask::Embed => Ok(InferenceResponse::Embeddings(
                request.inputs.iter().map(|t| (self.embedder)(t)).collect(),
            )),
        }
    }
}

/// Renders solid white pages with a fixed text layer; chosen pages fail.
pub struct FakeRenderer {
    pub pages: usize,
    pub failing: HashSet<usize>,
    /// Delay per render, to keep pages in flight for cancellation tests.
    pub delay: Duration,
}

impl FakeRenderer {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            failing: HashSet::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn failing_page(mut self, page_index: usize) -> Self {
        self.failing.insert(page_index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub fn page_text(page_index: usize) -> String {
    format!(
        "Page {} of the economic outlook. GDP grew 2.1% while inflation eased to 3.4%.",
        page_index + 1
    )
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn page_count(&self, _document: &Document) -> Result<usize, PdfRagError> {
        Ok(self.pages)
    }

    async fn render(
        &self,
        _document: &Document,
        page_index: usize,
        _resolution: Resolution,
    ) -> Result<RenderedPage, PageError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&page_index) {
            return Err(PageError::RenderFailed {
                page: page_index,
                detail: "corrupt content stream".into(),
            });
        }
        Ok(RenderedPage {
            index: page_index,
            image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                200,
                260,
                Rgba([255, 255, 255, 255]),
            )),
            text: page_text(page_index),
        })
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Client over `service` with no real sleeping.
pub fn instant_client(service: Arc<dyn InferenceService>) -> RateLimitedClient {
    RateLimitedClient::new(service, BackoffConfig::default())
        .with_sleeper(Arc::new(RecordingSleeper::default()))
}
