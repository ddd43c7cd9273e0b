//! lmeval: run log-likelihood, rolling and generation requests against a
//! language model.
//!
//! Requests are read from a JSON Lines file and results are written as JSON
//! Lines in the same order, one result per request.

mod settings;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lmeval_engine::backend::hf_download::DEFAULT_REVISION;
use lmeval_engine::{
    BatchSize, Evaluator, GenerationRequest, LikelihoodRequest, LlamaCppBackend, ModelBackend,
    PartialResultLog, RollingRequest, TableBackend,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::{BackendKind, Settings};

/// Language model evaluation runner
#[derive(Parser, Debug)]
#[command(name = "lmeval")]
#[command(about = "Score and generate benchmark requests with a language model", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Settings file (defaults to the per-user config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    /// HuggingFace repository holding the GGUF file and tokenizer.json
    #[arg(long, global = true)]
    repo: Option<String>,

    /// HuggingFace revision
    #[arg(long, global = true)]
    revision: Option<String>,

    /// GGUF file name in --repo, or a local GGUF path
    #[arg(long, global = true)]
    gguf: Option<String>,

    /// Path to tokenizer.json (required with a local --gguf)
    #[arg(long, global = true)]
    tokenizer_json: Option<String>,

    /// Table model JSON (with --backend table)
    #[arg(long, global = true)]
    table: Option<String>,

    /// Rows per forward pass, or "auto"
    #[arg(long, global = true)]
    batch_size: Option<BatchSize>,

    /// Maximum new tokens per generation request
    #[arg(long, global = true)]
    max_gen_toks: Option<usize>,

    /// Context window override
    #[arg(long, global = true)]
    max_length: Option<usize>,

    /// Write results here instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Append finished generations to this JSON Lines file
    #[arg(long, global = true)]
    partial_results: Option<PathBuf>,

    /// Reuse generations already recorded in --partial-results
    #[arg(long, global = true)]
    resume: bool,

    /// Hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score continuations: one {"context", "continuation"} object per line
    Loglikelihood {
        /// Requests file (JSON Lines)
        input: PathBuf,
    },
    /// Score whole documents: one {"document"} object per line
    Rolling {
        /// Requests file (JSON Lines)
        input: PathBuf,
    },
    /// Greedy generation: one {"context", "stop_sequences"} object per line
    Generate {
        /// Requests file (JSON Lines)
        input: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct RollingOutput {
    log_probability: f64,
}

#[derive(Debug, Serialize)]
struct GenerationOutput<'a> {
    text: &'a str,
}

impl Args {
    /// Settings file (or per-user defaults) with command-line overrides applied.
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::load()?,
        };

        let model = &mut settings.model;
        if let Some(backend) = self.backend {
            model.backend = backend;
        }
        if let Some(repo) = &self.repo {
            model.repo = Some(repo.clone());
        }
        if let Some(revision) = &self.revision {
            model.revision = revision.clone();
        }
        if let Some(gguf) = &self.gguf {
            model.gguf = Some(gguf.clone());
        }
        if let Some(tokenizer_json) = &self.tokenizer_json {
            model.tokenizer_json = Some(tokenizer_json.clone());
        }
        if let Some(table) = &self.table {
            model.table = Some(table.clone());
        }
        if self.max_length.is_some() {
            model.max_length = self.max_length;
        }

        if let Some(batch_size) = self.batch_size {
            settings.eval.batch_size = batch_size;
        }
        if let Some(max_gen_toks) = self.max_gen_toks {
            settings.eval.max_gen_toks = max_gen_toks;
        }

        if let Some(path) = &self.partial_results {
            settings.cache.partial_results = Some(path.clone());
        }
        if self.resume {
            settings.cache.resume = true;
        }

        Ok(settings)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Default: info level, with --verbose: debug level
    let default_filter = if args.verbose {
        "lmeval=debug,lmeval_engine=debug"
    } else {
        "lmeval=info,lmeval_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = args.settings()?;

    match settings.model.backend {
        BackendKind::Llama => run(load_llama(&settings)?, &args, &settings),
        BackendKind::Table => {
            let path = settings
                .model
                .table
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("--table is required with --backend table"))?;
            let mut backend = TableBackend::from_file(path)
                .with_context(|| format!("Failed to load table model from {}", path))?;
            if let Some(max_length) = settings.model.max_length {
                backend = backend.with_max_length(max_length);
            }
            run(backend, &args, &settings)
        }
    }
}

fn load_llama(settings: &Settings) -> Result<LlamaCppBackend> {
    let model = &settings.model;
    let options = model.llama_options();
    let gguf = model
        .gguf
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--gguf is required with --backend llama"))?;

    match &model.repo {
        Some(repo) => {
            let revision = if model.revision.is_empty() {
                DEFAULT_REVISION
            } else {
                model.revision.as_str()
            };
            LlamaCppBackend::from_pretrained(repo, revision, gguf, &options)
                .with_context(|| format!("Failed to load {} from {}@{}", gguf, repo, revision))
        }
        None => {
            let tokenizer = model.tokenizer_json.as_deref().ok_or_else(|| {
                anyhow::anyhow!("--tokenizer-json is required when using a local --gguf")
            })?;
            LlamaCppBackend::from_file(gguf, tokenizer, &options)
                .with_context(|| format!("Failed to load {}", gguf))
        }
    }
}

fn run<B: ModelBackend>(backend: B, args: &Args, settings: &Settings) -> Result<()> {
    let evaluator = Evaluator::new(backend, &settings.eval)?;
    tracing::info!(
        "Evaluator ready: batch size {}, max_gen_toks {}",
        evaluator.batch_size(),
        evaluator.max_gen_toks()
    );
    let mut out = open_output(args.output.as_deref())?;

    match &args.command {
        Command::Loglikelihood { input } => {
            let requests: Vec<LikelihoodRequest> = read_jsonl(input)?;
            let pb = progress_bar(requests.len(), args.quiet);
            let mut evaluator = evaluator.with_progress(progress_callback(&pb));
            let results = evaluator.score_likelihoods(&requests)?;
            pb.finish_and_clear();
            write_jsonl(&mut out, &results)?;
        }
        Command::Rolling { input } => {
            let requests: Vec<RollingRequest> = read_jsonl(input)?;
            let pb = window_spinner(args.quiet);
            let mut evaluator = evaluator.with_progress(progress_callback(&pb));
            let totals = evaluator.score_rolling(&requests)?;
            pb.finish_and_clear();
            let results: Vec<RollingOutput> = totals
                .into_iter()
                .map(|log_probability| RollingOutput { log_probability })
                .collect();
            write_jsonl(&mut out, &results)?;
        }
        Command::Generate { input } => {
            let requests: Vec<GenerationRequest> = read_jsonl(input)?;
            let texts = generate(evaluator, &requests, settings, args.quiet)?;
            let results: Vec<GenerationOutput> =
                texts.iter().map(|text| GenerationOutput { text }).collect();
            write_jsonl(&mut out, &results)?;
        }
    }

    out.flush()?;
    Ok(())
}

/// Generate every request, reusing recorded results when resuming.
fn generate<B: ModelBackend>(
    evaluator: Evaluator<B>,
    requests: &[GenerationRequest],
    settings: &Settings,
    quiet: bool,
) -> Result<Vec<String>> {
    let log_path = settings.cache.partial_results.as_deref();

    let recorded = match log_path {
        Some(path) if settings.cache.resume && path.exists() => {
            let recorded = PartialResultLog::load_generations(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            tracing::info!("Loaded {} recorded generations from {:?}", recorded.len(), path);
            recorded
        }
        _ => {
            if settings.cache.resume {
                tracing::warn!("--resume has no effect without an existing --partial-results file");
            }
            HashMap::new()
        }
    };

    let pending: Vec<GenerationRequest> = requests
        .iter()
        .filter(|r| !recorded.contains_key(*r))
        .cloned()
        .collect();
    tracing::info!(
        "{} of {} generations to run",
        pending.len(),
        requests.len()
    );

    let pb = progress_bar(pending.len(), quiet);
    let mut evaluator = evaluator.with_progress(progress_callback(&pb));
    if let Some(path) = log_path {
        let log = PartialResultLog::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        evaluator = evaluator.with_cache_hook(log);
    }
    let generated = evaluator.generate_until(&pending)?;
    pb.finish_and_clear();

    let mut fresh = pending.into_iter().zip(generated);
    requests
        .iter()
        .map(|request| match recorded.get(request) {
            Some(text) => Ok(text.clone()),
            None => fresh
                .next()
                .map(|(_, text)| text)
                .ok_or_else(|| anyhow::anyhow!("missing generation for {:?}", request.context)),
        })
        .collect()
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

/// Rolling calls report windows, whose count is only known inside the call.
fn window_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} windows ({per_sec})")
    {
        pb.set_style(style);
    }
    pb
}

fn progress_callback(pb: &ProgressBar) -> impl FnMut(usize) + 'static {
    let pb = pb.clone();
    move |n| pb.inc(n as u64)
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    })
}

/// Read one JSON value per non-blank line.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut items = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid request", path.display(), lineno + 1))?;
        items.push(item);
    }
    tracing::info!("Read {} requests from {:?}", items.len(), path);
    Ok(items)
}

fn write_jsonl<T: Serialize>(out: &mut dyn Write, items: &[T]) -> Result<()> {
    for item in items {
        serde_json::to_writer(&mut *out, item)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}
