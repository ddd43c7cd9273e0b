//! Deterministic lookup-table backend.
//!
//! The vocabulary is a list of text pieces and the "model" is a
//! `vocab × vocab` table: the logits at any position are the table row of
//! the token at that position. Good enough to check scoring arithmetic
//! exactly, and to run the whole pipeline without model weights.

use std::path::Path;

use serde::Deserialize;

use super::{Logits, ModelBackend, TokenId, logits_buffer};
use crate::batch::TokenMatrix;
use crate::error::{EvalError, Result};
use crate::scoring::argmax;

/// On-disk description of a [`TableBackend`] (JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub pieces: Vec<String>,
    pub logits: Vec<Vec<f32>>,
    pub eot_token_id: TokenId,
    pub max_length: usize,
    #[serde(default)]
    pub max_batch_tokens: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TableBackend {
    pieces: Vec<String>,
    logits: Vec<Vec<f32>>,
    eot: TokenId,
    max_length: usize,
    /// Forward passes over more tokens than this fail as out-of-memory
    max_batch_tokens: Option<usize>,
}

impl TableBackend {
    pub fn new(
        pieces: Vec<String>,
        logits: Vec<Vec<f32>>,
        eot: TokenId,
        max_length: usize,
    ) -> Result<Self> {
        let vocab = pieces.len();
        if vocab == 0 {
            return Err(EvalError::ModelLoad("table backend needs a vocabulary".into()));
        }
        if logits.len() != vocab || logits.iter().any(|row| row.len() != vocab) {
            return Err(EvalError::ModelLoad(
                format!("logit table must be {}x{}", vocab, vocab).into(),
            ));
        }
        if eot as usize >= vocab {
            return Err(EvalError::ModelLoad(
                format!("end-of-text id {} is outside the vocabulary", eot).into(),
            ));
        }
        if max_length == 0 {
            return Err(EvalError::ModelLoad("max_length must be non-zero".into()));
        }
        Ok(Self {
            pieces,
            logits,
            eot,
            max_length,
            max_batch_tokens: None,
        })
    }

    pub fn from_spec(spec: TableSpec) -> Result<Self> {
        let backend = Self::new(spec.pieces, spec.logits, spec.eot_token_id, spec.max_length)?;
        Ok(match spec.max_batch_tokens {
            Some(limit) => backend.with_max_batch_tokens(limit),
            None => backend,
        })
    }

    /// Load a [`TableSpec`] from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data =
            std::fs::read_to_string(path.as_ref()).map_err(|e| EvalError::ModelLoad(e.into()))?;
        let spec: TableSpec =
            serde_json::from_str(&data).map_err(|e| EvalError::ModelLoad(e.into()))?;
        Self::from_spec(spec)
    }

    pub fn with_max_batch_tokens(mut self, limit: usize) -> Self {
        self.max_batch_tokens = Some(limit);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn row_for(&self, token: TokenId) -> Result<&[f32]> {
        self.logits
            .get(token as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                EvalError::Inference(format!("token {} is outside the vocabulary", token).into())
            })
    }
}

impl ModelBackend for TableBackend {
    /// Greedy longest-match over the vocabulary pieces.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let best = self
                .pieces
                .iter()
                .enumerate()
                .filter(|(_, piece)| !piece.is_empty() && rest.starts_with(piece.as_str()))
                .max_by_key(|(id, piece)| (piece.len(), std::cmp::Reverse(*id)));
            let Some((id, piece)) = best else {
                return Err(EvalError::MalformedRequest(format!(
                    "no vocabulary piece matches {:?}",
                    rest.chars().next().unwrap_or_default()
                )));
            };
            tokens.push(id as TokenId);
            rest = &rest[piece.len()..];
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| {
                self.pieces.get(t as usize).map(String::as_str).ok_or_else(|| {
                    EvalError::Inference(format!("token {} is outside the vocabulary", t).into())
                })
            })
            .collect()
    }

    fn forward(&self, tokens: &TokenMatrix) -> Result<Logits> {
        let total = tokens.rows() * tokens.width();
        if let Some(limit) = self.max_batch_tokens
            && total > limit
        {
            return Err(EvalError::ResourceExhausted(
                format!("batch of {} tokens exceeds limit of {}", total, limit).into(),
            ));
        }

        let vocab = self.pieces.len();
        let mut data = logits_buffer(tokens.rows(), tokens.width(), vocab)?;
        for row in tokens.iter_rows() {
            for &token in row {
                data.extend_from_slice(self.row_for(token)?);
            }
        }
        Logits::new(tokens.rows(), tokens.width(), vocab, data)
    }

    fn generate(
        &self,
        context: &[TokenId],
        max_length: usize,
        stop_token: TokenId,
    ) -> Result<Vec<TokenId>> {
        let mut sequence = context.to_vec();
        while sequence.len() < max_length {
            let Some(&last) = sequence.last() else {
                break;
            };
            let Some(next) = argmax(self.row_for(last)?).map(|i| i as TokenId) else {
                break;
            };
            if next == stop_token || next == self.eot {
                break;
            }
            sequence.push(next);
        }
        Ok(sequence)
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn eot_token_id(&self) -> TokenId {
        self.eot
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a -> b -> c -> a ..., "." is end-of-text
    fn cycle_backend() -> TableBackend {
        let pieces = vec![".".to_string(), "a".into(), "b".into(), "c".into(), "ab".into()];
        let mut logits = vec![vec![0.0f32; 5]; 5];
        logits[0][1] = 1.0;
        logits[1][2] = 1.0;
        logits[2][3] = 1.0;
        logits[3][1] = 1.0;
        logits[4][3] = 1.0;
        TableBackend::new(pieces, logits, 0, 8).unwrap()
    }

    #[test]
    fn test_tokenize_longest_match() {
        let backend = cycle_backend();
        assert_eq!(backend.tokenize("abca").unwrap(), vec![4, 3, 1]);
        assert_eq!(backend.tokenize("").unwrap(), Vec::<TokenId>::new());
    }

    #[test]
    fn test_tokenize_unknown_piece() {
        assert!(matches!(
            cycle_backend().tokenize("az"),
            Err(EvalError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_detokenize_roundtrip() {
        let backend = cycle_backend();
        let tokens = backend.tokenize("cab.").unwrap();
        assert_eq!(backend.detokenize(&tokens).unwrap(), "cab.");
    }

    #[test]
    fn test_forward_shape() {
        let backend = cycle_backend();
        let matrix = TokenMatrix::from_rows(&[vec![1, 2], vec![3]], 0);
        let logits = backend.forward(&matrix).unwrap();
        assert_eq!((logits.rows(), logits.positions(), logits.vocab()), (2, 2, 5));
        assert_eq!(logits.row(1).position(0)[1], 1.0);
    }

    #[test]
    fn test_forward_limit() {
        let backend = cycle_backend().with_max_batch_tokens(3);
        let matrix = TokenMatrix::from_rows(&[vec![1, 2], vec![3, 1]], 0);
        assert!(matches!(
            backend.forward(&matrix),
            Err(EvalError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_generate_greedy_until_length() {
        let backend = cycle_backend();
        let out = backend.generate(&[1], 5, 0).unwrap();
        assert_eq!(out, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_generate_stops_before_stop_token() {
        let backend = cycle_backend();
        let out = backend.generate(&[1], 8, 3).unwrap();
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_invalid_table() {
        let pieces = vec!["a".to_string(), "b".to_string()];
        assert!(TableBackend::new(pieces, vec![vec![0.0; 2]], 0, 4).is_err());
    }
}
