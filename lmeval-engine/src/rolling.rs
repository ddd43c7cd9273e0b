//! Rolling-window decomposition of long documents.
//!
//! A document longer than the context window is scored as a sequence of
//! windows. Every token is predicted exactly once; the very first token is
//! predicted from an artificial prefix token (normally end-of-text).

use crate::backend::TokenId;
use crate::batch::EncodedPair;
use crate::error::{EvalError, Result};

/// `(input tokens, predicted tokens)` for one window.
pub type Window = (Vec<TokenId>, Vec<TokenId>);

/// Lazy iterator over the prediction windows of a token stream.
#[derive(Debug)]
pub struct RollingWindows<'a> {
    tokens: &'a [TokenId],
    prefix_token: TokenId,
    max_seq_len: usize,
    pred_len: usize,
    predicted: usize,
}

/// Split `tokens` into windows of at most `max_seq_len` inputs.
///
/// `context_len` is the minimum number of already-scored tokens each later
/// window keeps as context; it must lie in `1..=max_seq_len`.
pub fn rolling_windows(
    tokens: &[TokenId],
    prefix_token: TokenId,
    max_seq_len: usize,
    context_len: usize,
) -> Result<RollingWindows<'_>> {
    if context_len == 0 || context_len > max_seq_len {
        return Err(EvalError::Configuration(format!(
            "rolling context length {} must be between 1 and {}",
            context_len, max_seq_len
        )));
    }
    Ok(RollingWindows {
        tokens,
        prefix_token,
        max_seq_len,
        pred_len: max_seq_len - context_len + 1,
        predicted: 0,
    })
}

impl Iterator for RollingWindows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let total = self.tokens.len();
        if self.predicted >= total {
            return None;
        }

        if self.predicted == 0 {
            let first = self.max_seq_len.min(total);
            let mut input = Vec::with_capacity(first);
            input.push(self.prefix_token);
            input.extend_from_slice(&self.tokens[..first - 1]);
            self.predicted = first;
            return Some((input, self.tokens[..first].to_vec()));
        }

        let window_pred_len = (total - self.predicted).min(self.pred_len);
        let window_end = self.predicted + window_pred_len;
        let input_start = (window_end - 1).saturating_sub(self.max_seq_len);
        let window = (
            self.tokens[input_start..window_end - 1].to_vec(),
            self.tokens[window_end - window_pred_len..window_end].to_vec(),
        );
        self.predicted = window_end;
        Some(window)
    }
}

/// Trim a window's input so that it overlaps its predictions by at most one
/// token, yielding a (context, continuation) pair for the scoring path.
pub fn make_disjoint((input, predictions): Window) -> EncodedPair {
    let keep = (input.len() + 1).saturating_sub(predictions.len().max(1));
    let mut context = input;
    context.truncate(keep);
    EncodedPair::new(context, predictions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: TokenId = 99;

    fn windows(tokens: &[TokenId], max_seq_len: usize) -> Vec<Window> {
        rolling_windows(tokens, EOT, max_seq_len, 1)
            .unwrap()
            .collect()
    }

    #[test]
    fn test_single_window() {
        let w = windows(&[1, 2, 3], 8);
        assert_eq!(w, vec![(vec![EOT, 1, 2], vec![1, 2, 3])]);
    }

    #[test]
    fn test_multiple_windows() {
        let tokens: Vec<TokenId> = (0..10).collect();
        let w = windows(&tokens, 4);
        assert_eq!(
            w,
            vec![
                (vec![EOT, 0, 1, 2], vec![0, 1, 2, 3]),
                (vec![3, 4, 5, 6], vec![4, 5, 6, 7]),
                (vec![5, 6, 7, 8], vec![8, 9]),
            ]
        );
    }

    #[test]
    fn test_coverage_and_window_count() {
        for len in 1..40usize {
            for max_seq_len in 1..9usize {
                let tokens: Vec<TokenId> = (0..len as TokenId).collect();
                let w = windows(&tokens, max_seq_len);
                assert_eq!(w.len(), len.div_ceil(max_seq_len));

                let predicted: Vec<TokenId> = w.iter().flat_map(|(_, p)| p.clone()).collect();
                assert_eq!(predicted, tokens, "len={} max={}", len, max_seq_len);

                for (input, preds) in &w {
                    assert!(input.len() <= max_seq_len);
                    assert!(preds.len() <= max_seq_len);
                }
            }
        }
    }

    #[test]
    fn test_windows_are_consumed_once() {
        let tokens: Vec<TokenId> = (0..10).collect();
        let mut iter = rolling_windows(&tokens, EOT, 4, 1).unwrap();
        let first: Vec<Window> = iter.by_ref().take(2).collect();
        let rest: Vec<Window> = iter.collect();

        assert_eq!(first.len(), 2);
        assert_eq!(rest, vec![(vec![5, 6, 7, 8], vec![8, 9])]);
    }

    #[test]
    fn test_empty_document_has_no_windows() {
        assert!(windows(&[], 4).is_empty());
    }

    #[test]
    fn test_larger_context_len_overlaps_more() {
        let tokens: Vec<TokenId> = (0..8).collect();
        let w: Vec<Window> = rolling_windows(&tokens, EOT, 4, 3).unwrap().collect();
        // after the first window each one predicts max_seq_len - context_len + 1 = 2 tokens
        assert_eq!(w[1], (vec![1, 2, 3, 4], vec![4, 5]));
        assert_eq!(w.last().unwrap().1, vec![6, 7]);
    }

    #[test]
    fn test_invalid_context_len() {
        assert!(rolling_windows(&[1], EOT, 4, 0).is_err());
        assert!(rolling_windows(&[1], EOT, 4, 5).is_err());
    }

    #[test]
    fn test_make_disjoint() {
        let pair = make_disjoint((vec![5, 6, 7, 8], vec![8, 9]));
        assert_eq!(pair.context, vec![5, 6, 7]);
        assert_eq!(pair.continuation, vec![8, 9]);

        let first = make_disjoint((vec![EOT, 0, 1, 2], vec![0, 1, 2, 3]));
        assert_eq!(first.context, vec![EOT]);
    }

    #[test]
    fn test_disjoint_pairs_encode_to_window_inputs() {
        use crate::batch::encode_input;

        let tokens: Vec<TokenId> = (0..10).collect();
        for window in windows(&tokens, 4) {
            let expected_input = window.0.clone();
            let pair = make_disjoint(window);
            let input = encode_input(&pair.context, &pair.continuation, 4).unwrap();
            assert_eq!(input, expected_input);
        }
    }
}
