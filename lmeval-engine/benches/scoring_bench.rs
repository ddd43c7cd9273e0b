//! Benchmarks for the batch/extract scoring pipeline
//!
//! Run with: cargo bench
//!
//! Uses the table backend, so the numbers measure encoding, padding,
//! reordering and log-softmax rather than model inference.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lmeval_engine::{
    BatchSize, EvalConfig, Evaluator, LikelihoodRequest, RollingRequest, TableBackend, log_softmax,
};

const VOCAB: usize = 64;

fn backend(max_length: usize) -> TableBackend {
    let pieces: Vec<String> = (0..VOCAB)
        .map(|i| char::from(b'0' + i as u8).to_string())
        .collect();
    let logits: Vec<Vec<f32>> = (0..VOCAB)
        .map(|r| {
            (0..VOCAB)
                .map(|c| ((r * 31 + c * 17) % 13) as f32 * 0.25)
                .collect()
        })
        .collect();
    TableBackend::new(pieces, logits, 0, max_length).unwrap()
}

fn text(seed: usize, len: usize) -> String {
    (0..len)
        .map(|i| char::from(b'0' + ((seed * 7 + i * 3) % VOCAB) as u8))
        .collect()
}

// ============================================================================
// Primitives
// ============================================================================

fn bench_log_softmax(c: &mut Criterion) {
    let row: Vec<f32> = (0..32_000).map(|i| (i % 97) as f32 * 0.01).collect();
    c.bench_function("log_softmax_32k", |b| b.iter(|| log_softmax(black_box(&row))));
}

// ============================================================================
// Evaluator
// ============================================================================

fn bench_loglikelihood(c: &mut Criterion) {
    let requests: Vec<LikelihoodRequest> = (0..256)
        .map(|i| LikelihoodRequest::new(text(i, 20 + i % 40), text(i + 1, 1 + i % 5)))
        .collect();

    let mut group = c.benchmark_group("loglikelihood");
    for batch_size in [1, 8, 32] {
        let config = EvalConfig {
            batch_size: BatchSize::Fixed(batch_size),
            ..Default::default()
        };
        let mut evaluator = Evaluator::new(backend(512), &config).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &requests,
            |b, requests| b.iter(|| evaluator.score_likelihoods(black_box(requests)).unwrap()),
        );
    }
    group.finish();
}

fn bench_rolling(c: &mut Criterion) {
    let documents: Vec<RollingRequest> = (0..16)
        .map(|i| RollingRequest::new(text(i, 2_000)))
        .collect();
    let config = EvalConfig {
        batch_size: BatchSize::Fixed(8),
        ..Default::default()
    };
    let mut evaluator = Evaluator::new(backend(512), &config).unwrap();

    c.bench_function("rolling_2k_tokens", |b| {
        b.iter(|| evaluator.score_rolling(black_box(&documents)).unwrap())
    });
}

criterion_group!(benches, bench_log_softmax, bench_loglikelihood, bench_rolling);
criterion_main!(benches);
