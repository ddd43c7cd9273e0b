pub mod backend;
pub mod batch;
pub mod cache;
pub mod error;
pub mod evaluator;
pub mod generate;
pub mod reorder;
pub mod request;
pub mod rolling;
pub mod scoring;

pub use backend::{LlamaCppBackend, LlamaCppOptions, Logits, ModelBackend, TableBackend, TokenId};
pub use batch::{Batch, EncodedPair, PAD_TOKEN, TokenMatrix, encode_input, make_batches};
pub use cache::{CacheHook, GREEDY_UNTIL, NoCache, PartialEntry, PartialResultLog};
pub use error::{EvalError, Result};
pub use evaluator::{AUTO_BATCH_START, BatchSize, EvalConfig, Evaluator, probe_batch_size};
pub use generate::{DEFAULT_MAX_GEN_TOKS, GreedyDecoder, truncate_at_stop_sequences};
pub use reorder::Reorderer;
pub use request::{GenerationRequest, LikelihoodRequest, RollingRequest, ScoredResult};
pub use rolling::{make_disjoint, rolling_windows};
pub use scoring::{argmax, extract, log_softmax};
