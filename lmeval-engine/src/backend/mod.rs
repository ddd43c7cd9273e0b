//! Model backends.
//!
//! The evaluator only talks to a model through [`ModelBackend`]; the
//! numerics live behind it.

pub mod hf_download;
pub mod llamacpp;
pub mod table;

use crate::batch::TokenMatrix;
use crate::error::{EvalError, Result};

pub use llamacpp::{LlamaCppBackend, LlamaCppOptions};
pub use table::TableBackend;

/// Vocabulary index of a token.
pub type TokenId = u32;

/// A language model the evaluator can score and generate with.
///
/// Implementations must be deterministic: the same input always yields the
/// same tokens and logits.
pub trait ModelBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>>;

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String>;

    /// Unnormalized scores for every row and position of `tokens`,
    /// shaped `[rows][width][vocab]`.
    fn forward(&self, tokens: &TokenMatrix) -> Result<Logits>;

    /// Greedily extend `context` until the sequence is `max_length` tokens
    /// long or `stop_token` is produced. The returned sequence starts with
    /// the echoed context.
    fn generate(
        &self,
        context: &[TokenId],
        max_length: usize,
        stop_token: TokenId,
    ) -> Result<Vec<TokenId>>;

    /// Maximum number of tokens the model attends over.
    fn max_length(&self) -> usize;

    fn eot_token_id(&self) -> TokenId;

    fn vocab_size(&self) -> usize;
}

impl<B: ModelBackend + ?Sized> ModelBackend for &B {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        (**self).tokenize(text)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        (**self).detokenize(tokens)
    }

    fn forward(&self, tokens: &TokenMatrix) -> Result<Logits> {
        (**self).forward(tokens)
    }

    fn generate(
        &self,
        context: &[TokenId],
        max_length: usize,
        stop_token: TokenId,
    ) -> Result<Vec<TokenId>> {
        (**self).generate(context, max_length, stop_token)
    }

    fn max_length(&self) -> usize {
        (**self).max_length()
    }

    fn eot_token_id(&self) -> TokenId {
        (**self).eot_token_id()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }
}

/// Dense `[rows][positions][vocab]` scores returned by a forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    rows: usize,
    positions: usize,
    vocab: usize,
    data: Vec<f32>,
}

impl Logits {
    pub fn new(rows: usize, positions: usize, vocab: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * positions * vocab {
            return Err(EvalError::Inference(
                format!(
                    "logits buffer has {} values, expected {}x{}x{}",
                    data.len(),
                    rows,
                    positions,
                    vocab
                )
                .into(),
            ));
        }
        Ok(Self {
            rows,
            positions,
            vocab,
            data,
        })
    }

    pub fn zeros(rows: usize, positions: usize, vocab: usize) -> Self {
        Self {
            rows,
            positions,
            vocab,
            data: vec![0.0; rows * positions * vocab],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn row(&self, row: usize) -> RowLogits<'_> {
        let stride = self.positions * self.vocab;
        RowLogits {
            positions: self.positions,
            vocab: self.vocab,
            data: &self.data[row * stride..(row + 1) * stride],
        }
    }

    pub fn position_mut(&mut self, row: usize, position: usize) -> &mut [f32] {
        let start = (row * self.positions + position) * self.vocab;
        &mut self.data[start..start + self.vocab]
    }
}

/// Empty buffer with room for `rows × positions × vocab` logits.
///
/// A batch too large to allocate is reported as
/// [`EvalError::ResourceExhausted`] so batch-size detection can back off.
pub fn logits_buffer(rows: usize, positions: usize, vocab: usize) -> Result<Vec<f32>> {
    let len = rows
        .checked_mul(positions)
        .and_then(|n| n.checked_mul(vocab))
        .ok_or_else(|| {
            EvalError::ResourceExhausted(
                format!("{}x{}x{} logits overflow usize", rows, positions, vocab).into(),
            )
        })?;
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|e| EvalError::ResourceExhausted(e.into()))?;
    Ok(data)
}

/// Scores for a single batch row.
#[derive(Debug, Clone, Copy)]
pub struct RowLogits<'a> {
    positions: usize,
    vocab: usize,
    data: &'a [f32],
}

impl<'a> RowLogits<'a> {
    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn position(&self, position: usize) -> &'a [f32] {
        &self.data[position * self.vocab..(position + 1) * self.vocab]
    }
}
