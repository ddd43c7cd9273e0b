//! llama.cpp based GGUF backend
//!
//! Scoring needs logits at every position of every row, so `forward`
//! decodes every row as its own sequence in one batch with all logits
//! enabled. Tokenization goes through an external HuggingFace
//! `tokenizer.json`, matching the tokenizer the model was trained with.

use super::hf_download::{download_file, get_tokenizer_path};
use super::{Logits, ModelBackend, TokenId, logits_buffer};
use crate::batch::TokenMatrix;
use crate::error::{EvalError, Result};
use llama_cpp_2::DecodeError;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(EvalError::ModelLoad(
            format!("Failed to initialize llama.cpp backend: {}", e).into(),
        )),
    }
}

/// Load and configure an external HuggingFace tokenizer from a `tokenizer.json` file.
fn load_tokenizer<P: AsRef<Path>>(path: P) -> Result<tokenizers::Tokenizer> {
    let mut tokenizer =
        tokenizers::Tokenizer::from_file(path.as_ref()).map_err(EvalError::TokenizerLoad)?;
    // Batches are padded and truncated by the evaluator, not the tokenizer.
    tokenizer.with_padding(None);
    tokenizer.with_truncation(None).ok();
    Ok(tokenizer)
}

/// A failed decode with no free KV cache slot is the llama.cpp form of
/// running out of device memory.
fn decode_error(e: DecodeError) -> EvalError {
    match e {
        DecodeError::NoKvCacheSlot => EvalError::ResourceExhausted(e.into()),
        other => EvalError::Inference(other.into()),
    }
}

/// Load options for [`LlamaCppBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaCppOptions {
    /// Layers offloaded to the GPU (0 = CPU only)
    pub n_gpu_layers: u32,
    /// Number of threads for inference (0 = llama.cpp default)
    pub n_threads: u32,
    /// Context window override; defaults to the model's training context
    pub max_length: Option<usize>,
}

/// GGUF model served through llama.cpp.
pub struct LlamaCppBackend {
    model: LlamaModel,
    tokenizer: tokenizers::Tokenizer,
    max_length: usize,
    vocab_size: usize,
    n_threads: u32,
}

impl LlamaCppBackend {
    /// Load a GGUF model with an external tokenizer.
    pub fn from_file<P: AsRef<Path>, T: AsRef<Path>>(
        path: P,
        tokenizer_json: T,
        options: &LlamaCppOptions,
    ) -> Result<Self> {
        let backend = get_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(options.n_gpu_layers);
        tracing::info!("Loading GGUF model from {:?}", path.as_ref());
        let model = LlamaModel::load_from_file(backend, path.as_ref(), &model_params)
            .map_err(|e| EvalError::ModelLoad(e.into()))?;
        let tokenizer = load_tokenizer(tokenizer_json)?;

        let max_length = options
            .max_length
            .unwrap_or(model.n_ctx_train() as usize)
            .max(1);
        let vocab_size = model.n_vocab().max(0) as usize;
        tracing::info!(
            "Model loaded: context window {}, vocabulary {}",
            max_length,
            vocab_size
        );

        Ok(Self {
            model,
            tokenizer,
            max_length,
            vocab_size,
            n_threads: options.n_threads,
        })
    }

    /// Download `gguf_filename` and `tokenizer.json` from a HuggingFace repo
    /// at `revision`, then load them.
    pub fn from_pretrained(
        repo_id: &str,
        revision: &str,
        gguf_filename: &str,
        options: &LlamaCppOptions,
    ) -> Result<Self> {
        let gguf = download_file(repo_id, revision, gguf_filename)?;
        let tokenizer = get_tokenizer_path(repo_id, revision)?;
        Self::from_file(gguf, tokenizer, options)
    }

    /// Set the number of threads for inference (0 = default).
    pub fn set_n_threads(&mut self, n: u32) {
        self.n_threads = n;
    }

    /// Context parameters for `n_seq` sequences of up to `seq_len` tokens each,
    /// all decoded in a single batch. The KV cache grows with `n_seq`.
    fn context_params(&self, n_seq: usize, seq_len: usize) -> Result<LlamaContextParams> {
        let total = n_seq
            .checked_mul(seq_len)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                EvalError::ResourceExhausted(
                    format!("{} sequences of {} tokens overflow the context size", n_seq, seq_len)
                        .into(),
                )
            })?;
        let n_ctx = NonZeroU32::new(total)
            .ok_or_else(|| EvalError::Inference("context window must be non-zero".into()))?;
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_seq_max(n_seq as u32)
            .with_n_batch(total)
            .with_n_ubatch(total.min(self.max_length as u32));
        if self.n_threads > 0 {
            Ok(params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32))
        } else {
            Ok(params)
        }
    }

    fn new_context(&self, n_seq: usize, seq_len: usize) -> Result<LlamaContext<'_>> {
        let backend = get_backend()?;
        // Context creation allocates the KV cache; failure is almost always memory.
        self.model
            .new_context(backend, self.context_params(n_seq, seq_len)?)
            .map_err(|e| EvalError::ResourceExhausted(e.into()))
    }

    /// Decode `tokens` from position 0 into a cleared context.
    fn decode_sequence(
        ctx: &mut LlamaContext<'_>,
        batch: &mut LlamaBatch,
        tokens: &[TokenId],
        all_logits: bool,
    ) -> Result<()> {
        ctx.clear_kv_cache();
        batch.clear();
        for (i, &token) in tokens.iter().enumerate() {
            let wants_logits = all_logits || i == tokens.len() - 1;
            batch
                .add(LlamaToken(token as i32), i as i32, &[0], wants_logits)
                .map_err(|e| EvalError::Inference(e.into()))?;
        }
        ctx.decode(batch).map_err(decode_error)
    }

    fn is_end_of_generation(&self, token: LlamaToken, stop_token: TokenId) -> bool {
        token.0 as TokenId == stop_token
            || token == self.model.token_eos()
            || self.model.is_eog_token(token)
    }
}

impl ModelBackend for LlamaCppBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(EvalError::Inference)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        self.tokenizer
            .decode(tokens, false)
            .map_err(EvalError::Inference)
    }

    fn forward(&self, tokens: &TokenMatrix) -> Result<Logits> {
        let (rows, width) = (tokens.rows(), tokens.width());
        if rows == 0 || width == 0 {
            return Ok(Logits::zeros(rows, width, self.vocab_size));
        }
        if width > self.max_length {
            return Err(EvalError::Configuration(format!(
                "batch width {} exceeds the context window {}",
                width, self.max_length
            )));
        }

        // One sequence per row, all rows in one decode, so device memory
        // scales with the batch size and an oversized batch fails here.
        let mut ctx = self.new_context(rows, width)?;
        let mut batch = LlamaBatch::new(rows * width, rows as i32);
        for (seq, row) in tokens.iter_rows().enumerate() {
            for (pos, &token) in row.iter().enumerate() {
                batch
                    .add(LlamaToken(token as i32), pos as i32, &[seq as i32], true)
                    .map_err(|e| EvalError::Inference(e.into()))?;
            }
        }
        let mut data = logits_buffer(rows, width, self.vocab_size)?;
        ctx.decode(&mut batch).map_err(decode_error)?;

        for i in 0..rows * width {
            let logits = ctx.get_logits_ith(i as i32);
            data.extend_from_slice(&logits[..self.vocab_size.min(logits.len())]);
        }

        Logits::new(rows, width, self.vocab_size, data)
    }

    fn generate(
        &self,
        context: &[TokenId],
        max_length: usize,
        stop_token: TokenId,
    ) -> Result<Vec<TokenId>> {
        let mut generated = context.to_vec();
        if context.is_empty() || context.len() >= max_length {
            return Ok(generated);
        }
        let max_length = max_length.min(self.max_length);

        let mut ctx = self.new_context(1, self.max_length)?;
        let mut batch = LlamaBatch::new(self.max_length, 1);
        Self::decode_sequence(&mut ctx, &mut batch, context, false)?;

        let mut sampler = LlamaSampler::greedy();
        let mut n_cur = context.len();

        while n_cur < max_length {
            let new_token = sampler.sample(&ctx, -1);
            if self.is_end_of_generation(new_token, stop_token) {
                break;
            }

            generated.push(new_token.0 as TokenId);

            // Prepare next batch with just the new token
            batch.clear();
            batch
                .add(new_token, n_cur as i32, &[0], true)
                .map_err(|e| EvalError::Inference(e.into()))?;
            ctx.decode(&mut batch).map_err(decode_error)?;
            n_cur += 1;
        }

        Ok(generated)
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn eot_token_id(&self) -> TokenId {
        self.model.token_eos().0 as TokenId
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
