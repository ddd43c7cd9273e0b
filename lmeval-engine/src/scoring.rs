//! Log-likelihood extraction from forward-pass logits

use crate::backend::{RowLogits, TokenId};
use crate::error::{EvalError, Result};
use crate::request::ScoredResult;

/// Convert raw logits to log-probabilities.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp: f32 = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln()
        + max_logit;
    logits.iter().map(|&x| x - log_sum_exp).collect()
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Score `continuation` against one row of a forward pass.
///
/// Only positions `[input_length - continuation.len(), input_length)` are
/// read, so padding past `input_length` never affects the result.
pub fn extract(
    row: RowLogits<'_>,
    input_length: usize,
    continuation: &[TokenId],
) -> Result<ScoredResult> {
    let cont_len = continuation.len();
    if cont_len == 0 {
        return Err(EvalError::MalformedRequest("empty continuation".into()));
    }
    if cont_len > input_length || input_length > row.positions() {
        return Err(EvalError::Inference(
            format!(
                "continuation span of {} tokens ending at {} is outside a row of {} positions",
                cont_len,
                input_length,
                row.positions()
            )
            .into(),
        ));
    }

    let start = input_length - cont_len;
    let mut log_probability = 0.0f64;
    let mut is_greedy = true;

    for (k, &token) in continuation.iter().enumerate() {
        let log_probs = log_softmax(row.position(start + k));
        let Some(&lp) = log_probs.get(token as usize) else {
            return Err(EvalError::MalformedRequest(format!(
                "token {} is outside the vocabulary of {}",
                token,
                log_probs.len()
            )));
        };
        if argmax(&log_probs) != Some(token as usize) {
            is_greedy = false;
        }
        log_probability += lp as f64;
    }

    Ok(ScoredResult {
        log_probability,
        is_greedy,
    })
}
