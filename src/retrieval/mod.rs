//! Query side: intent classification and context selection.
//!
//! ```text
//! query text ──▶ IntentClassifier ──▶ Intent ──▶ ContextRetriever ──▶ RetrievalResult
//!                (rules | model)                 (text search + visual selection)
//! ```

mod intent;
mod retriever;

pub use intent::{
    detect_visual_kind, parse_model_intent, Intent, IntentClassifier, ModelIntentClassifier,
    RuleBasedClassifier,
};
pub use retriever::{ContextRetriever, Query, RetrievalResult, TextMatch, VisualMatch};
