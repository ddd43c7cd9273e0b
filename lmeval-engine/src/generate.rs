//! Greedy generation with stop-sequence truncation

use crate::backend::{ModelBackend, TokenId};
use crate::error::{EvalError, Result};
use crate::request::GenerationRequest;

/// Default number of tokens generated per request.
pub const DEFAULT_MAX_GEN_TOKS: usize = 256;

/// Cut `text` at stop sequences, one stop at a time in listed order.
///
/// Each stop string truncates whatever the previous ones left. This differs
/// from cutting at the globally earliest match when stops overlap: with stops
/// `["cd", "bc"]`, `"abcd"` becomes `"ab"` (the cut at `"cd"` removes the
/// only `"bc"`), not `"a"`. Empty stop strings are ignored.
pub fn truncate_at_stop_sequences<'a, S: AsRef<str>>(text: &'a str, stops: &[S]) -> &'a str {
    stops
        .iter()
        .map(|stop| stop.as_ref())
        .filter(|stop| !stop.is_empty())
        .fold(text, |remaining, stop| match remaining.find(stop) {
            Some(pos) => &remaining[..pos],
            None => remaining,
        })
}

/// Runs deterministic generation on a backend for one request at a time.
#[derive(Debug, Clone, Copy)]
pub struct GreedyDecoder {
    max_new_tokens: usize,
}

impl Default for GreedyDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GEN_TOKS)
    }
}

impl GreedyDecoder {
    pub fn new(max_new_tokens: usize) -> Self {
        Self { max_new_tokens }
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Token that ends the backend's generation loop: the single token of the
    /// first stop sequence, or end-of-text when no stop sequence is given.
    pub fn primary_stop_token<B: ModelBackend>(backend: &B, stops: &[String]) -> Result<TokenId> {
        let Some(first) = stops.first() else {
            return Ok(backend.eot_token_id());
        };
        match backend.tokenize(first)?.as_slice() {
            [token] => Ok(*token),
            tokens => Err(EvalError::MalformedRequest(format!(
                "stop sequence {:?} encodes to {} tokens, expected exactly 1",
                first,
                tokens.len()
            ))),
        }
    }

    /// Tokenize and generate for a single request.
    pub fn generate_until<B: ModelBackend>(
        &self,
        backend: &B,
        request: &GenerationRequest,
    ) -> Result<String> {
        let context = backend.tokenize(&request.context)?;
        self.generate_from_tokens(backend, &context, &request.stop_sequences)
    }

    /// Generate from an already tokenized context.
    ///
    /// The context is left-truncated so that it plus `max_new_tokens` fits in
    /// the backend's window; an empty context is replaced by end-of-text.
    pub fn generate_from_tokens<B: ModelBackend>(
        &self,
        backend: &B,
        context: &[TokenId],
        stops: &[String],
    ) -> Result<String> {
        let max_length = backend.max_length();
        if self.max_new_tokens >= max_length {
            return Err(EvalError::Configuration(format!(
                "max_gen_toks ({}) must be smaller than the context window ({})",
                self.max_new_tokens, max_length
            )));
        }

        let primary_stop = Self::primary_stop_token(backend, stops)?;

        let eot = [backend.eot_token_id()];
        let context = if context.is_empty() { &eot[..] } else { context };
        let keep = max_length - self.max_new_tokens;
        let context = &context[context.len().saturating_sub(keep)..];

        let output = backend.generate(context, context.len() + self.max_new_tokens, primary_stop)?;
        let generated = output.get(context.len()..).unwrap_or_default();
        let text = backend.detokenize(generated)?;

        tracing::debug!(
            "generated {} tokens from a context of {}",
            generated.len(),
            context.len()
        );

        Ok(truncate_at_stop_sequences(&text, stops).to_string())
    }
}
