//! End-to-end scoring tests against the table backend.

use std::cell::RefCell;
use std::rc::Rc;

use lmeval_engine::{
    BatchSize, EvalConfig, EvalError, Evaluator, LikelihoodRequest, Logits, ModelBackend,
    RollingRequest, TableBackend, TokenId, TokenMatrix, log_softmax,
};

const LN_2: f64 = std::f64::consts::LN_2;

// ============================================================================
// Fixtures
// ============================================================================

/// Four-token vocabulary with hand-picked logits:
/// - after `<eot>`: `a` is likely
/// - after `a`: uniform
/// - after `b`: `c` has probability 1/2, the rest 1/6
/// - after `c`: `a` is likely
fn four_token_backend(max_length: usize) -> TableBackend {
    let pieces = ["<eot>", "a", "b", "c"].map(String::from).to_vec();
    let logits = vec![
        vec![0.0, 2.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 3.0f32.ln()],
        vec![0.0, 2.0, 1.0, 0.0],
    ];
    TableBackend::new(pieces, logits, 0, max_length).unwrap()
}

fn evaluator(backend: TableBackend, batch_size: usize) -> Evaluator<TableBackend> {
    let config = EvalConfig {
        batch_size: BatchSize::Fixed(batch_size),
        max_gen_toks: 4,
    };
    Evaluator::new(backend, &config).unwrap()
}

/// Records the shape of every forward pass before delegating.
struct RecordingBackend {
    inner: TableBackend,
    passes: Rc<RefCell<Vec<(usize, usize)>>>,
}

impl ModelBackend for RecordingBackend {
    fn tokenize(&self, text: &str) -> lmeval_engine::Result<Vec<TokenId>> {
        self.inner.tokenize(text)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> lmeval_engine::Result<String> {
        self.inner.detokenize(tokens)
    }

    fn forward(&self, tokens: &TokenMatrix) -> lmeval_engine::Result<Logits> {
        self.passes.borrow_mut().push((tokens.rows(), tokens.width()));
        self.inner.forward(tokens)
    }

    fn generate(
        &self,
        context: &[TokenId],
        max_length: usize,
        stop_token: TokenId,
    ) -> lmeval_engine::Result<Vec<TokenId>> {
        self.inner.generate(context, max_length, stop_token)
    }

    fn max_length(&self) -> usize {
        self.inner.max_length()
    }

    fn eot_token_id(&self) -> TokenId {
        self.inner.eot_token_id()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

fn recording_evaluator(
    batch_size: usize,
) -> (Evaluator<RecordingBackend>, Rc<RefCell<Vec<(usize, usize)>>>) {
    recording_evaluator_with(four_token_backend(8), batch_size)
}

fn recording_evaluator_with(
    inner: TableBackend,
    batch_size: usize,
) -> (Evaluator<RecordingBackend>, Rc<RefCell<Vec<(usize, usize)>>>) {
    let passes = Rc::new(RefCell::new(Vec::new()));
    let backend = RecordingBackend {
        inner,
        passes: passes.clone(),
    };
    let config = EvalConfig {
        batch_size: BatchSize::Fixed(batch_size),
        max_gen_toks: 4,
    };
    (Evaluator::new(backend, &config).unwrap(), passes)
}

fn requests() -> Vec<LikelihoodRequest> {
    vec![
        LikelihoodRequest::new("a", "bc"),
        LikelihoodRequest::new("abcab", "c"),
        LikelihoodRequest::new("b", "c"),
        LikelihoodRequest::new("", "a"),
        LikelihoodRequest::new("ca", "bcabc"),
        LikelihoodRequest::new("c", "b"),
    ]
}

// ============================================================================
// Likelihood scoring
// ============================================================================

#[test]
fn test_precomputed_scores() {
    let mut ev = evaluator(four_token_backend(8), 4);
    let results = ev
        .score_likelihoods(&[
            LikelihoodRequest::new("a", "bc"),
            LikelihoodRequest::new("b", "c"),
        ])
        .unwrap();

    // ln(1/4) + ln(1/2); a uniform row has argmax 0, so "b" is not greedy
    assert!((results[0].log_probability - (-8.0f64.ln())).abs() < 1e-5);
    assert!(!results[0].is_greedy);

    assert!((results[1].log_probability - (-LN_2)).abs() < 1e-5);
    assert!(results[1].is_greedy);
}

#[test]
fn test_order_preserved_under_permutation() {
    let reqs = requests();
    let mut ev = evaluator(four_token_backend(8), 2);
    let baseline = ev.score_likelihoods(&reqs).unwrap();

    let permutation = [4, 2, 0, 5, 1, 3];
    let permuted: Vec<LikelihoodRequest> =
        permutation.iter().map(|&i| reqs[i].clone()).collect();
    let results = ev.score_likelihoods(&permuted).unwrap();

    for (k, &i) in permutation.iter().enumerate() {
        assert_eq!(results[k], baseline[i], "request {}", i);
    }
}

#[test]
fn test_padding_does_not_change_scores() {
    let reqs = requests();
    let mut single = evaluator(four_token_backend(8), 1);
    let mut batched = evaluator(four_token_backend(8), 6);

    let alone = single.score_likelihoods(&reqs).unwrap();
    let together = batched.score_likelihoods(&reqs).unwrap();

    for (a, b) in alone.iter().zip(&together) {
        assert_eq!(a.log_probability.to_bits(), b.log_probability.to_bits());
        assert_eq!(a.is_greedy, b.is_greedy);
    }
}

#[test]
fn test_greedy_continuation_and_perturbation() {
    // b -> c -> a is the argmax path
    let mut ev = evaluator(four_token_backend(8), 2);
    let results = ev
        .score_likelihoods(&[
            LikelihoodRequest::new("b", "ca"),
            LikelihoodRequest::new("b", "cb"),
        ])
        .unwrap();
    assert!(results[0].is_greedy);
    assert!(!results[1].is_greedy);
    assert!(results[1].log_probability < results[0].log_probability);
}

#[test]
fn test_empty_context_uses_end_of_text() {
    let mut ev = evaluator(four_token_backend(8), 1);
    let results = ev
        .score_likelihoods(&[LikelihoodRequest::new("", "a")])
        .unwrap();

    let expected = log_softmax(&[0.0, 2.0, 0.0, 0.0])[1] as f64;
    assert!((results[0].log_probability - expected).abs() < 1e-6);
    assert!(results[0].is_greedy);
}

#[test]
fn test_long_context_is_truncated_from_left() {
    let mut ev = evaluator(four_token_backend(4), 1);
    let long = ev
        .score_likelihoods(&[LikelihoodRequest::new("abcabcabcab", "c")])
        .unwrap();
    let short = ev
        .score_likelihoods(&[LikelihoodRequest::new("b", "c")])
        .unwrap();
    assert_eq!(long[0].log_probability.to_bits(), short[0].log_probability.to_bits());
}

#[test]
fn test_continuation_too_long_is_configuration_error() {
    let (mut ev, passes) = recording_evaluator(2);
    let err = ev
        .score_likelihoods(&[
            LikelihoodRequest::new("a", "b"),
            LikelihoodRequest::new("a", "abcabcabc"),
        ])
        .unwrap_err();
    assert!(matches!(err, EvalError::Configuration(_)));
    assert!(passes.borrow().is_empty());
}

#[test]
fn test_batches_run_longest_first() {
    let (mut ev, passes) = recording_evaluator(2);
    ev.score_likelihoods(&requests()).unwrap();

    let passes = passes.borrow();
    assert_eq!(passes.len(), 3);
    assert!(passes.iter().all(|&(rows, _)| rows <= 2));
    assert!(passes.windows(2).all(|w| w[0].1 >= w[1].1));
    // "ca" + "bcabc" is 7 tokens, so the first batch is 6 wide
    assert_eq!(passes[0].1, 6);
}

#[test]
fn test_identical_requests_scored_once() {
    let (mut ev, passes) = recording_evaluator(8);
    let reqs = vec![
        LikelihoodRequest::new("a", "bc"),
        LikelihoodRequest::new("b", "c"),
        LikelihoodRequest::new("a", "bc"),
        LikelihoodRequest::new("a", "bc"),
    ];
    let results = ev.score_likelihoods(&reqs).unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results[0], results[2]);
    assert_eq!(results[0], results[3]);
    assert_eq!(passes.borrow().as_slice(), &[(2, 2)]);
}

#[test]
fn test_progress_counts_duplicates() {
    let done = Rc::new(RefCell::new(0usize));
    let counter = done.clone();
    let mut ev = evaluator(four_token_backend(8), 4)
        .with_progress(move |n| *counter.borrow_mut() += n);

    let mut reqs = requests();
    reqs.extend(requests());
    ev.score_likelihoods(&reqs).unwrap();
    assert_eq!(*done.borrow(), reqs.len());
}

#[test]
fn test_auto_batch_size() {
    // 64, 32 and 16 rows of 8 tokens exceed 100 tokens; 8 rows fit
    let backend = four_token_backend(8).with_max_batch_tokens(100);
    let config = EvalConfig {
        batch_size: BatchSize::Auto,
        max_gen_toks: 4,
    };
    let mut ev = Evaluator::new(backend, &config).unwrap();
    assert_eq!(ev.batch_size(), 8);

    let results = ev.score_likelihoods(&requests()).unwrap();
    assert_eq!(results.len(), requests().len());
}

#[test]
fn test_auto_batch_size_exhausted() {
    let backend = four_token_backend(8).with_max_batch_tokens(4);
    let config = EvalConfig {
        batch_size: BatchSize::Auto,
        max_gen_toks: 4,
    };
    assert!(matches!(
        Evaluator::new(backend, &config),
        Err(EvalError::ResourceExhausted(_))
    ));
}

#[test]
fn test_fixed_batch_exhaustion_is_not_retried() {
    // "abc" + "ab" runs first with a 4-token input, over the 3-token limit
    let (mut ev, passes) =
        recording_evaluator_with(four_token_backend(8).with_max_batch_tokens(3), 1);
    let err = ev
        .score_likelihoods(&[
            LikelihoodRequest::new("a", "b"),
            LikelihoodRequest::new("abc", "ab"),
        ])
        .unwrap_err();

    assert!(matches!(err, EvalError::ResourceExhausted(_)));
    assert_eq!(passes.borrow().as_slice(), &[(1, 4)]);
    assert_eq!(ev.batch_size(), 1);
}

// ============================================================================
// Rolling log-likelihood
// ============================================================================

/// Sum of per-token log-probabilities, each token conditioned on the one
/// before it (or end-of-text for the first).
fn reference_total(backend: &TableBackend, text: &str, table: &[Vec<f32>]) -> f64 {
    let tokens = backend.tokenize(text).unwrap();
    let mut prev = backend.eot_token_id();
    let mut total = 0.0f64;
    for token in tokens {
        total += log_softmax(&table[prev as usize])[token as usize] as f64;
        prev = token;
    }
    total
}

#[test]
fn test_rolling_matches_token_by_token_sum() {
    let table = vec![
        vec![0.0, 2.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 3.0f32.ln()],
        vec![0.0, 2.0, 1.0, 0.0],
    ];
    let docs = ["abcabcab", "c", "", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"];

    for max_length in [1, 3, 4, 100] {
        let backend = four_token_backend(max_length);
        let expected: Vec<f64> = docs
            .iter()
            .map(|d| reference_total(&backend, d, &table))
            .collect();

        let mut ev = evaluator(backend, 3);
        let requests: Vec<RollingRequest> = docs.iter().map(|d| RollingRequest::new(*d)).collect();
        let totals = ev.score_rolling(&requests).unwrap();

        for (doc, (got, want)) in docs.iter().zip(totals.iter().zip(&expected)) {
            assert!(
                (got - want).abs() < 1e-6,
                "max_length={} doc={:?}: {} vs {}",
                max_length,
                doc,
                got,
                want
            );
        }
    }
}

#[test]
fn test_rolling_window_count() {
    let (mut ev, passes) = recording_evaluator(1);
    ev.score_rolling(&[RollingRequest::new("abcabcabcabcabcabcab")])
        .unwrap();
    // 20 tokens in windows of 8
    assert_eq!(passes.borrow().len(), 3);
}
