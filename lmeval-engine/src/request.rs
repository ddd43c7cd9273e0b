//! Request and result types exchanged with the evaluator

use serde::{Deserialize, Serialize};

/// Score `continuation` given `context`.
///
/// An empty context is scored against a single end-of-text token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LikelihoodRequest {
    pub context: String,
    pub continuation: String,
}

impl LikelihoodRequest {
    pub fn new(context: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            continuation: continuation.into(),
        }
    }
}

/// Score a whole document with disjoint bounded-context windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollingRequest {
    pub document: String,
}

impl RollingRequest {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

/// Greedily continue `context` until the first stop sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub context: String,
    /// Applied in order; the first entry must encode to a single token and
    /// also stops the backend's generation loop.
    #[serde(default, alias = "until", deserialize_with = "one_or_many")]
    pub stop_sequences: Vec<String>,
}

/// Accept either a single stop string or a list of them.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(stop) => vec![stop],
        OneOrMany::Many(stops) => stops,
    })
}

impl GenerationRequest {
    pub fn new<S: Into<String>>(context: impl Into<String>, stop_sequences: Vec<S>) -> Self {
        Self {
            context: context.into(),
            stop_sequences: stop_sequences.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of scoring one continuation (or one rolling window).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    /// Sum of per-token log-probabilities over the continuation
    pub log_probability: f64,
    /// Whether every continuation token was the model's argmax prediction
    pub is_greedy: bool,
}
