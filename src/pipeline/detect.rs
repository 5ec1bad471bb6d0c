//! Layout detection: one inference call per page → validated [`DetectedElement`]s.
//!
//! The model answers in loosely-typed JSON. The response is parsed into
//! typed elements in three steps:
//!
//! 1. **Parse** — locate the JSON payload; if there is none the page is
//!    degraded with zero elements (a [`DetectionParse`](crate::error::PageError::DetectionParse)
//!    outcome, not a failure). Individual malformed elements are dropped.
//! 2. **Select** — drop elements under `min_confidence`, then suppress
//!    overlapping visual regions: candidates are visited by confidence
//!    (larger area breaks ties) and a visual region whose IoU with an
//!    already-kept visual region exceeds `overlap_threshold` is discarded.
//! 3. **Identify** — sort the survivors in reading order (top to bottom,
//!    then left to right) and assign ids `{document}:p{page}:e{n}`.

use crate::document::{BoundingBox, DetectedElement, ElementKind};
use crate::error::PageError;
use crate::inference::{InferenceRequest, InferenceTask, RateLimitedClient};
use crate::pipeline::encode::EncodedImage;
use crate::pipeline::postprocess::extract_json;
use crate::prompts::{detect_layout_instruction, DETECT_LAYOUT_PROMPT};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Coordinates this far outside `[0,1]` are clamped rather than rejected.
const EDGE_TOLERANCE: f32 = 0.02;

/// A parsed element before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub kind: ElementKind,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Outcome of detecting one page.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub elements: Vec<DetectedElement>,
    /// Set when the response could not be parsed; `elements` is then empty.
    pub parse_error: Option<String>,
}

#[derive(Deserialize)]
struct WireElement {
    #[serde(alias = "type", alias = "label", alias = "category")]
    kind: String,
    #[serde(alias = "box", alias = "bounding_box", alias = "region")]
    bbox: Vec<f32>,
    #[serde(default, alias = "score")]
    confidence: Option<f32>,
    #[serde(default, alias = "caption")]
    title: Option<String>,
    #[serde(default, alias = "content")]
    text: Option<String>,
}

/// Issues the per-page layout call and turns the answer into elements.
#[derive(Clone)]
pub struct LayoutDetector {
    client: RateLimitedClient,
    min_confidence: f32,
    overlap_threshold: f32,
}

impl LayoutDetector {
    pub fn new(client: RateLimitedClient, min_confidence: f32, overlap_threshold: f32) -> Self {
        Self {
            client,
            min_confidence,
            overlap_threshold,
        }
    }

    /// Detect the regions of one page.
    ///
    /// Returns `Err` only when the inference call itself failed for good.
    pub async fn detect(
        &self,
        document_id: &str,
        page_index: usize,
        image: &EncodedImage,
    ) -> Result<Detection, PageError> {
        let request = InferenceRequest::vision(
            InferenceTask::DetectLayout,
            DETECT_LAYOUT_PROMPT,
            detect_layout_instruction(page_index),
            image.clone(),
        );
        let raw = self
            .client
            .complete(&request)
            .await
            .map_err(|e| PageError::InferenceFailed {
                page: page_index,
                stage: InferenceTask::DetectLayout.to_string(),
                detail: e.to_string(),
            })?;

        let candidates = match parse_layout(&raw) {
            Ok(c) => c,
            Err(detail) => {
                warn!(
                    "Page {}: layout response unusable, continuing with no elements: {}",
                    page_index + 1,
                    detail
                );
                return Ok(Detection {
                    elements: Vec::new(),
                    parse_error: Some(detail),
                });
            }
        };

        let parsed = candidates.len();
        let kept = select_elements(candidates, self.min_confidence, self.overlap_threshold);
        debug!(
            "Page {}: {} regions parsed, {} kept",
            page_index + 1,
            parsed,
            kept.len()
        );

        Ok(Detection {
            elements: assign_ids(document_id, page_index, kept),
            parse_error: None,
        })
    }
}

/// Parse a layout answer into candidates.
///
/// Accepts `{"elements": [...]}` or a bare array. `Err` means the answer as
/// a whole is unusable; malformed entries inside a valid answer are skipped.
pub fn parse_layout(raw: &str) -> Result<Vec<Candidate>, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON value in response".to_string())?;
    let value: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("elements").or_else(|| map.remove("regions")) {
            Some(Value::Array(items)) => items,
            _ => return Err("response has no \"elements\" array".into()),
        },
        _ => return Err("response is not an object or array".into()),
    };

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<WireElement>(item)
            .map_err(|e| e.to_string())
            .and_then(validate)
        {
            Ok(c) => out.push(c),
            Err(e) => debug!("Dropping layout element {}: {}", i, e),
        }
    }
    Ok(out)
}

fn validate(w: WireElement) -> Result<Candidate, String> {
    let kind: ElementKind = w.kind.parse()?;
    if w.bbox.len() != 4 {
        return Err(format!("bbox needs 4 coordinates, got {}", w.bbox.len()));
    }

    let fix = |v: f32| -> Result<f32, String> {
        if !v.is_finite() || v < -EDGE_TOLERANCE || v > 1.0 + EDGE_TOLERANCE {
            Err(format!("coordinate {v} outside the page"))
        } else {
            Ok(v.clamp(0.0, 1.0))
        }
    };
    let (a, b, c, d) = (fix(w.bbox[0])?, fix(w.bbox[1])?, fix(w.bbox[2])?, fix(w.bbox[3])?);
    let bbox = BoundingBox::new(a.min(c), b.min(d), a.max(c), b.max(d))?;

    let confidence = match w.confidence {
        None => 1.0,
        Some(c) if c.is_finite() && c > 1.0 && c <= 100.0 => c / 100.0,
        Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c,
        Some(c) => return Err(format!("confidence {c} out of range")),
    };

    let clean = |s: Option<String>| s.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    Ok(Candidate {
        kind,
        bbox,
        confidence,
        title: clean(w.title),
        text: clean(w.text),
    })
}

/// Confidence filter + overlap suppression among visual regions.
pub fn select_elements(
    candidates: Vec<Candidate>,
    min_confidence: f32,
    overlap_threshold: f32,
) -> Vec<Candidate> {
    let mut ordered: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.confidence >= min_confidence)
        .collect();
    ordered.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.bbox.area().partial_cmp(&a.bbox.area()).unwrap_or(Ordering::Equal))
    });

    let mut kept: Vec<Candidate> = Vec::with_capacity(ordered.len());
    for c in ordered {
        let duplicate = c.kind.is_visual()
            && kept
                .iter()
                .any(|k| k.kind.is_visual() && k.bbox.iou(&c.bbox) > overlap_threshold);
        if !duplicate {
            kept.push(c);
        }
    }
    kept
}

/// Reading-order sort and id assignment.
pub fn assign_ids(
    document_id: &str,
    page_index: usize,
    mut kept: Vec<Candidate>,
) -> Vec<DetectedElement> {
    kept.sort_by(|a, b| {
        a.bbox
            .y0
            .partial_cmp(&b.bbox.y0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.bbox.x0.partial_cmp(&b.bbox.x0).unwrap_or(Ordering::Equal))
    });
    kept.into_iter()
        .enumerate()
        .map(|(n, c)| DetectedElement {
            id: format!("{document_id}:p{page_index}:e{n}"),
            kind: c.kind,
            bbox: c.bbox,
            confidence: c.confidence,
            page_index,
            title: c.title,
            text: c.text,
        })
        .collect()
}
