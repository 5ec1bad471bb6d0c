//! Query intent: how much, and which, visual content a question expects.
//!
//! [`RuleBasedClassifier`] works offline from keyword patterns.
//! [`ModelIntentClassifier`] asks the inference service and falls back to
//! the rules whenever the call or its JSON fails.

use crate::document::ElementKind;
use crate::inference::{InferenceRequest, InferenceTask, RateLimitedClient};
use crate::pipeline::postprocess::extract_json;
use crate::prompts::CLASSIFY_INTENT_PROMPT;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Classified purpose of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "intent", content = "kind", rename_all = "snake_case")]
pub enum Intent {
    /// Prose only; no visual search.
    TextOnly,
    /// One particular visual of this kind.
    SpecificVisual(ElementKind),
    /// Every visual of this kind above the similarity cutoff.
    BroadVisual(ElementKind),
    /// A factual question; text plus the best supporting visual.
    DataGrounded,
}

impl Intent {
    /// Kind targeted by a visual intent.
    pub fn visual_kind(&self) -> Option<ElementKind> {
        match self {
            Intent::SpecificVisual(k) | Intent::BroadVisual(k) => Some(*k),
            Intent::TextOnly | Intent::DataGrounded => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::TextOnly => f.write_str("text-only"),
            Intent::SpecificVisual(k) => write!(f, "specific-visual({k})"),
            Intent::BroadVisual(k) => write!(f, "broad-visual({k})"),
            Intent::DataGrounded => f.write_str("data-grounded"),
        }
    }
}

/// Turns query text into an [`Intent`]. Never fails: classifiers fall back
/// to [`Intent::DataGrounded`] when unsure.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Intent;
}

// ── Rules ────────────────────────────────────────────────────────────────

static RE_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(tables?|tabular)\b").unwrap());
static RE_CHART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(charts?|graphs?|plots?|histograms?)\b").unwrap());
static RE_FIGURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(figures?|figs?|images?|pictures?|diagrams?|illustrations?|photos?)\b")
        .unwrap()
});
static RE_PLURAL_KIND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(tables|charts|graphs|plots|histograms|figures|images|pictures|diagrams|illustrations|photos|visuals)\b",
    )
    .unwrap()
});
static RE_QUANTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(all|every|each|list|how many)\b").unwrap()
});
static RE_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d|%|\b(how (much|many)|what (is|was|were|are)|which (year|quarter|month)|rate|growth|total|average|percent(age)?|number|value|amount|compare|increase|decrease|trend|revenue|cost|price)\b)",
    )
    .unwrap()
});
static RE_TEXT_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(summari[sz]e|summary|explain|overview|introduction|conclusion|who|why|define|definition|main (points?|ideas?)|what does .+ (say|argue|mean))\b",
    )
    .unwrap()
});
/// Words that carry no subject when asking for visuals.
static STOP_WORDS: &[&str] = &[
    "a", "an", "the", "me", "show", "display", "give", "find", "see", "view", "list", "all",
    "every", "each", "any", "of", "in", "on", "from", "this", "that", "these", "those", "document",
    "pdf", "report", "paper", "file", "please", "can", "could", "you", "i", "want", "to", "there",
    "are", "is", "what", "which", "how", "many", "do", "does", "have", "has", "available", "visual",
    "visuals", "and", "or", "with", "compare", "contrast", "between", "both", "them", "side", "by",
];

/// Kind named in `query`, if any. Tables win over charts over figures when
/// several are named.
pub fn detect_visual_kind(query: &str) -> Option<ElementKind> {
    if RE_TABLE.is_match(query) {
        Some(ElementKind::Table)
    } else if RE_CHART.is_match(query) {
        Some(ElementKind::Chart)
    } else if RE_FIGURE.is_match(query) {
        Some(ElementKind::Figure)
    } else {
        None
    }
}

/// Keyword-based classifier.
///
/// * a visual kind with a quantifier ("all", "every", "list") or as a bare
///   plural ("show me the charts") → broad
/// * a visual kind otherwise → specific
/// * summary/explanation wording without numbers → text-only
/// * everything else → data-grounded
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedClassifier;

impl RuleBasedClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_text(&self, query: &str) -> Intent {
        let query = query.trim();
        if let Some(kind) = detect_visual_kind(query) {
            let broad = RE_QUANTIFIER.is_match(query)
                || (RE_PLURAL_KIND.is_match(query) && !has_subject(query));
            return if broad {
                Intent::BroadVisual(kind)
            } else {
                Intent::SpecificVisual(kind)
            };
        }
        if RE_TEXT_ONLY.is_match(query) && !RE_DATA.is_match(query) {
            return Intent::TextOnly;
        }
        Intent::DataGrounded
    }
}

/// `true` when the query has words beyond request verbs and kind names.
fn has_subject(query: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .any(|w| {
            !STOP_WORDS.contains(&w.as_str())
                && !RE_TABLE.is_match(&w)
                && !RE_CHART.is_match(&w)
                && !RE_FIGURE.is_match(&w)
        })
}

#[async_trait]
impl IntentClassifier for RuleBasedClassifier {
    async fn classify(&self, query: &str) -> Intent {
        self.classify_text(query)
    }
}

// ── Model ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireIntent {
    intent: String,
    #[serde(default, alias = "visual_type_requested", alias = "kind")]
    visual_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse the `classify-intent` response.
///
/// Visual intents without a usable `visual_type` borrow the kind named in
/// the query; if the query names none either, the response is rejected.
pub fn parse_model_intent(raw: &str, query: &str) -> Result<Intent, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON object in response".to_string())?;
    let wire: WireIntent = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if let Some(reason) = &wire.reason {
        debug!("Intent reason: {}", reason);
    }

    let kind = wire
        .visual_type
        .as_deref()
        .filter(|v| !v.eq_ignore_ascii_case("null"))
        .and_then(|v| v.parse::<ElementKind>().ok())
        .filter(|k| k.is_visual())
        .or_else(|| detect_visual_kind(query));
    let need_kind = || kind.ok_or_else(|| format!("intent '{}' without a visual type", wire.intent));

    match wire.intent.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "text_only" | "text" => Ok(Intent::TextOnly),
        "specific_visual" | "specific" => Ok(Intent::SpecificVisual(need_kind()?)),
        "broad_visual" | "broad" | "all" => Ok(Intent::BroadVisual(need_kind()?)),
        "data_grounded" | "grounded" => Ok(Intent::DataGrounded),
        other => Err(format!("unknown intent '{other}'")),
    }
}

/// Asks the inference service; falls back to [`RuleBasedClassifier`].
#[derive(Clone)]
pub struct ModelIntentClassifier {
    client: RateLimitedClient,
    fallback: RuleBasedClassifier,
}

impl ModelIntentClassifier {
    pub fn new(client: RateLimitedClient) -> Self {
        Self {
            client,
            fallback: RuleBasedClassifier,
        }
    }
}

#[async_trait]
impl IntentClassifier for ModelIntentClassifier {
    async fn classify(&self, query: &str) -> Intent {
        let request =
            InferenceRequest::text(InferenceTask::ClassifyIntent, CLASSIFY_INTENT_PROMPT, query);
        let parsed = match self.client.complete(&request).await {
            Ok(raw) => parse_model_intent(&raw, query),
            Err(e) => Err(e.to_string()),
        };
        match parsed {
            Ok(intent) => {
                debug!("Model intent for '{}': {}", query, intent);
                intent
            }
            Err(detail) => {
                let intent = self.fallback.classify_text(query);
                warn!("Intent model unusable ({}); rules say {}", detail, intent);
                intent
            }
        }
    }
}
