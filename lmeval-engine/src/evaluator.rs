//! Public entry points: batched log-likelihood scoring, rolling-window
//! document scoring and greedy generation.
//!
//! Every call encodes its requests, processes them in a length-sorted order
//! and hands results back in the caller's order.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backend::{ModelBackend, TokenId};
use crate::batch::{Batch, EncodedPair, PAD_TOKEN, TokenMatrix, batches};
use crate::cache::{CacheHook, GREEDY_UNTIL, NoCache};
use crate::error::{EvalError, Result};
use crate::generate::{DEFAULT_MAX_GEN_TOKS, GreedyDecoder};
use crate::reorder::Reorderer;
use crate::request::{GenerationRequest, LikelihoodRequest, RollingRequest, ScoredResult};
use crate::rolling::{make_disjoint, rolling_windows};
use crate::scoring::extract;

/// First batch size tried by the automatic probe.
pub const AUTO_BATCH_START: usize = 64;

/// Number of rows per forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    Fixed(usize),
    /// Probe once at startup for the largest size that fits in memory
    Auto,
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{}", n),
            Self::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for BatchSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<usize>() {
            Ok(0) => Err("batch size must be at least 1".to_string()),
            Ok(n) => Ok(Self::Fixed(n)),
            Err(_) => Err(format!("invalid batch size '{}': expected a number or 'auto'", s)),
        }
    }
}

impl Serialize for BatchSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(n) => serializer.serialize_u64(*n as u64),
            Self::Auto => serializer.serialize_str("auto"),
        }
    }
}

impl<'de> Deserialize<'de> for BatchSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(usize),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(0) => Err(serde::de::Error::custom("batch size must be at least 1")),
            Raw::Number(n) => Ok(Self::Fixed(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Evaluation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub batch_size: BatchSize,
    /// Maximum number of new tokens per generation request
    pub max_gen_toks: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::default(),
            max_gen_toks: DEFAULT_MAX_GEN_TOKS,
        }
    }
}

/// Find the largest batch size, halving from `start`, for which a full-width
/// forward pass does not exhaust backend resources.
pub fn probe_batch_size<B: ModelBackend>(backend: &B, start: usize) -> Result<usize> {
    let width = backend.max_length();
    let mut size = start.max(1);
    loop {
        let probe = TokenMatrix::filled(size, width, backend.eot_token_id());
        match backend.forward(&probe) {
            Ok(_) => {
                tracing::info!("Using batch size {}", size);
                return Ok(size);
            }
            Err(EvalError::ResourceExhausted(e)) if size > 1 => {
                tracing::warn!(
                    "Out of memory at batch size {} ({}), reducing batch size by factor of 2",
                    size,
                    e
                );
                size /= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

type ProgressFn = Box<dyn FnMut(usize)>;

/// Scores and generates with a [`ModelBackend`].
///
/// Calls take `&mut self`, so one evaluator never runs two calls against its
/// backend at the same time.
pub struct Evaluator<B: ModelBackend> {
    backend: B,
    batch_size: usize,
    decoder: GreedyDecoder,
    cache: Box<dyn CacheHook>,
    progress: Option<ProgressFn>,
}

impl<B: ModelBackend> Evaluator<B> {
    /// Create an evaluator. `BatchSize::Auto` runs the batch-size probe now.
    pub fn new(backend: B, config: &EvalConfig) -> Result<Self> {
        let batch_size = match config.batch_size {
            BatchSize::Fixed(0) => {
                return Err(EvalError::Configuration("batch size must be at least 1".into()));
            }
            BatchSize::Fixed(n) => n,
            BatchSize::Auto => probe_batch_size(&backend, AUTO_BATCH_START)?,
        };

        Ok(Self {
            backend,
            batch_size,
            decoder: GreedyDecoder::new(config.max_gen_toks),
            cache: Box::new(NoCache),
            progress: None,
        })
    }

    /// Report each finished generation to `hook`.
    pub fn with_cache_hook(mut self, hook: impl CacheHook + 'static) -> Self {
        self.cache = Box::new(hook);
        self
    }

    /// Called after every batch (or generation) with the number of input
    /// requests it completed. Rolling calls count windows, not documents.
    pub fn with_progress(mut self, progress: impl FnMut(usize) + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_gen_toks(&self) -> usize {
        self.decoder.max_new_tokens()
    }

    fn report_progress(&mut self, done: usize) {
        if let Some(progress) = self.progress.as_mut() {
            progress(done);
        }
    }

    /// Tokenize one likelihood request. An empty context becomes a single
    /// end-of-text token.
    pub fn encode_likelihood(&self, request: &LikelihoodRequest) -> Result<EncodedPair> {
        let context = if request.context.is_empty() {
            vec![self.backend.eot_token_id()]
        } else {
            self.backend.tokenize(&request.context)?
        };
        let continuation = self.backend.tokenize(&request.continuation)?;
        Ok(EncodedPair::new(context, continuation))
    }

    /// Log-likelihood of each continuation given its context, in input order.
    pub fn score_likelihoods(
        &mut self,
        requests: &[LikelihoodRequest],
    ) -> Result<Vec<ScoredResult>> {
        let pairs = requests
            .iter()
            .map(|r| self.encode_likelihood(r))
            .collect::<Result<Vec<_>>>()?;
        self.score_pairs(pairs)
    }

    /// Total log-likelihood of each document, scored with disjoint windows
    /// of at most the backend's context length. Empty documents score 0.
    pub fn score_rolling(&mut self, requests: &[RollingRequest]) -> Result<Vec<f64>> {
        let max_length = self.backend.max_length();
        let eot = self.backend.eot_token_id();

        let mut pairs = Vec::new();
        let mut windows_per_doc = Vec::with_capacity(requests.len());
        for request in requests {
            let tokens = self.backend.tokenize(&request.document)?;
            let before = pairs.len();
            pairs.extend(rolling_windows(&tokens, eot, max_length, 1)?.map(make_disjoint));
            windows_per_doc.push(pairs.len() - before);
        }
        tracing::debug!(
            "Split {} documents into {} windows",
            requests.len(),
            pairs.len()
        );

        let scored = self.score_pairs(pairs)?;

        // is_greedy is meaningless for a whole document and is dropped
        let mut scored = scored.into_iter();
        Ok(windows_per_doc
            .into_iter()
            .map(|n| scored.by_ref().take(n).map(|r| r.log_probability).sum())
            .collect())
    }

    /// Score already tokenized pairs, in input order.
    ///
    /// Pairs are processed longest first, so the largest batch runs (and
    /// fails, if it is going to run out of memory) first and every batch is
    /// padded to the length of its first row. Identical pairs are scored once.
    pub fn score_pairs(&mut self, pairs: Vec<EncodedPair>) -> Result<Vec<ScoredResult>> {
        let max_length = self.backend.max_length();
        for pair in &pairs {
            validate_pair(pair, max_length)?;
        }

        let started = Instant::now();
        let reorderer = Reorderer::grouped(pairs, |p| {
            (
                Reverse(p.total_len()),
                p.context.clone(),
                p.continuation.clone(),
            )
        });
        let ordered: Vec<&EncodedPair> = reorderer.get_reordered().collect();
        let sizes: Vec<usize> = reorderer.group_sizes().collect();

        let mut results = Vec::with_capacity(ordered.len());
        let batches = batches(&ordered, self.batch_size, max_length, PAD_TOKEN)?;
        for (batch, sizes) in batches.zip(sizes.chunks(self.batch_size)) {
            let batch = batch?;
            results.extend(self.score_batch(&batch)?);
            self.report_progress(sizes.iter().sum());
        }

        tracing::info!(
            "Scored {} requests ({} unique) in {:.2?}",
            reorderer.original_len(),
            reorderer.len(),
            started.elapsed()
        );
        reorderer.get_original(results)
    }

    fn score_batch(&self, batch: &Batch) -> Result<Vec<ScoredResult>> {
        tracing::debug!(
            "Forward pass: {} rows x {} tokens",
            batch.len(),
            batch.padding_length()
        );
        let logits = self.backend.forward(&batch.tokens)?;
        if logits.rows() != batch.len() || logits.positions() < batch.padding_length() {
            return Err(EvalError::Inference(
                format!(
                    "backend returned {}x{} logits for a {}x{} batch",
                    logits.rows(),
                    logits.positions(),
                    batch.len(),
                    batch.padding_length()
                )
                .into(),
            ));
        }

        batch
            .input_lengths
            .iter()
            .zip(&batch.continuations)
            .enumerate()
            .map(|(row, (&input_length, continuation))| {
                extract(logits.row(row), input_length, continuation)
            })
            .collect()
    }

    /// Greedy continuation of each context, cut at its stop sequences, in
    /// input order. Each result is reported to the cache hook as soon as it
    /// is generated.
    pub fn generate_until(&mut self, requests: &[GenerationRequest]) -> Result<Vec<String>> {
        let started = Instant::now();
        let encoded = requests
            .iter()
            .map(|r| Ok((r, self.backend.tokenize(&r.context)?)))
            .collect::<Result<Vec<(&GenerationRequest, Vec<TokenId>)>>>()?;

        let reorderer = Reorderer::new(encoded, |(r, tokens)| (tokens.len(), r.context.clone()));

        let mut results = Vec::with_capacity(reorderer.len());
        for (request, context) in reorderer.get_reordered() {
            let text =
                self.decoder
                    .generate_from_tokens(&self.backend, context, &request.stop_sequences)?;
            self.cache.add_partial(GREEDY_UNTIL, request, &text);
            self.report_progress(1);
            results.push(text);
        }

        tracing::info!(
            "Generated {} continuations in {:.2?}",
            results.len(),
            started.elapsed()
        );
        reorderer.get_original(results)
    }
}

/// Reject pairs that cannot be scored before any forward pass runs.
fn validate_pair(pair: &EncodedPair, max_length: usize) -> Result<()> {
    if pair.context.is_empty() {
        return Err(EvalError::MalformedRequest("empty context".into()));
    }
    if pair.continuation.is_empty() {
        return Err(EvalError::MalformedRequest("empty continuation".into()));
    }
    if pair.continuation.len() > max_length {
        return Err(EvalError::Configuration(format!(
            "continuation of {} tokens exceeds max context length {}",
            pair.continuation.len(),
            max_length
        )));
    }
    Ok(())
}
