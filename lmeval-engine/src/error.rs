//! Error types for evaluation

/// Errors that can occur while scoring or generating.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The request cannot be evaluated with the current model/configuration,
    /// e.g. a continuation longer than the context window.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The backend ran out of device memory (or KV cache slots).
    #[error("backend resources exhausted")]
    ResourceExhausted(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("inference failed")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("download failed")]
    Download(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tokenizer load failed")]
    TokenizerLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("expected {expected} results for reordered requests, got {actual}")]
    ResultCount { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, EvalError>;
