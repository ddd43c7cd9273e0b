//! Sequence encoding and batch packing for forward passes.
//!
//! ```text
//!              CTX      CONT
//! input      0 1 2 3|4 5 6 7 8 9   <- last token is dropped
//!             \               \
//! logits       1 2 3|4 5 6 7 8 9   <- only the continuation span is read
//! cont_toks          4 5 6 7 8 9
//! ```
//!
//! Output position `i` predicts input token `i + 1`, so the final token of
//! the concatenation never needs to be fed to the model.

use std::borrow::Borrow;

use crate::backend::TokenId;
use crate::error::{EvalError, Result};

/// Pad value for the unused tail of shorter rows.
pub const PAD_TOKEN: TokenId = 0;

/// A tokenized (context, continuation) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EncodedPair {
    pub context: Vec<TokenId>,
    pub continuation: Vec<TokenId>,
}

impl EncodedPair {
    pub fn new(context: Vec<TokenId>, continuation: Vec<TokenId>) -> Self {
        Self {
            context,
            continuation,
        }
    }

    /// Length of context and continuation together, before truncation.
    pub fn total_len(&self) -> usize {
        self.context.len() + self.continuation.len()
    }
}

/// Build the model input for one pair: left-truncate `context ++ continuation`
/// to `max_length + 1` tokens, then drop the last token.
pub fn encode_input(
    context: &[TokenId],
    continuation: &[TokenId],
    max_length: usize,
) -> Result<Vec<TokenId>> {
    if context.is_empty() {
        return Err(EvalError::MalformedRequest("empty context".into()));
    }
    if continuation.is_empty() {
        return Err(EvalError::MalformedRequest("empty continuation".into()));
    }
    if continuation.len() > max_length {
        return Err(EvalError::Configuration(format!(
            "continuation of {} tokens exceeds max context length {}",
            continuation.len(),
            max_length
        )));
    }

    let total = context.len() + continuation.len();
    let start = total.saturating_sub(max_length + 1);
    let mut input: Vec<TokenId> = context
        .iter()
        .chain(continuation.iter())
        .skip(start)
        .copied()
        .collect();
    input.pop();
    Ok(input)
}

/// Row-major `[rows][width]` token matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatrix {
    rows: usize,
    width: usize,
    data: Vec<TokenId>,
}

impl TokenMatrix {
    /// Right-pad every row with `pad` up to the length of the first row.
    ///
    /// Rows must be sorted by descending length.
    pub fn from_rows(rows: &[Vec<TokenId>], pad: TokenId) -> Self {
        let width = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            debug_assert!(row.len() <= width, "rows must be sorted longest first");
            data.extend_from_slice(&row[..row.len().min(width)]);
            data.extend(std::iter::repeat_n(pad, width.saturating_sub(row.len())));
        }
        Self {
            rows: rows.len(),
            width,
            data,
        }
    }

    /// A `rows × width` matrix filled with `token`.
    pub fn filled(rows: usize, width: usize, token: TokenId) -> Self {
        Self {
            rows,
            width,
            data: vec![token; rows * width],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The padding length shared by every row.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, index: usize) -> &[TokenId] {
        &self.data[index * self.width..(index + 1) * self.width]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[TokenId]> {
        (0..self.rows).map(move |i| self.row(i))
    }
}

/// One padded group of encoded pairs ready for a forward pass.
#[derive(Debug, Clone)]
pub struct Batch {
    pub tokens: TokenMatrix,
    /// Unpadded length of each row
    pub input_lengths: Vec<usize>,
    pub continuations: Vec<Vec<TokenId>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.input_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_lengths.is_empty()
    }

    pub fn padding_length(&self) -> usize {
        self.tokens.width()
    }

    /// Encode and pad `pairs`, which must be sorted by descending length.
    pub fn from_pairs<'a, I>(pairs: I, max_length: usize, pad: TokenId) -> Result<Self>
    where
        I: IntoIterator<Item = &'a EncodedPair>,
    {
        let mut inputs = Vec::new();
        let mut continuations = Vec::new();
        for pair in pairs {
            inputs.push(encode_input(&pair.context, &pair.continuation, max_length)?);
            continuations.push(pair.continuation.clone());
        }

        let input_lengths: Vec<usize> = inputs.iter().map(Vec::len).collect();
        // The first row sets the padding length for the whole batch.
        if input_lengths.windows(2).any(|w| w[0] < w[1]) {
            return Err(EvalError::Configuration(
                "batch rows must be sorted by descending length".into(),
            ));
        }

        Ok(Self {
            tokens: TokenMatrix::from_rows(&inputs, pad),
            input_lengths,
            continuations,
        })
    }
}

/// Split pairs (already sorted by descending total length) into padded
/// batches of at most `batch_size` rows.
pub fn make_batches<P: Borrow<EncodedPair>>(
    pairs: &[P],
    batch_size: usize,
    max_length: usize,
    pad: TokenId,
) -> Result<Vec<Batch>> {
    batches(pairs, batch_size, max_length, pad)?.collect()
}

/// Lazy form of [`make_batches`]: one batch is built per step so only the
/// batch in flight is held in memory.
pub fn batches<P: Borrow<EncodedPair>>(
    pairs: &[P],
    batch_size: usize,
    max_length: usize,
    pad: TokenId,
) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
    if batch_size == 0 {
        return Err(EvalError::Configuration("batch size must be at least 1".into()));
    }
    Ok(pairs.chunks(batch_size).map(move |chunk| {
        let chunk = chunk.iter().map(<P as Borrow<EncodedPair>>::borrow);
        Batch::from_pairs(chunk, max_length, pad)
    }))
}
