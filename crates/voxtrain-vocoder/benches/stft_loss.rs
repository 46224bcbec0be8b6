//! Benchmarks for the multi-resolution STFT loss.
//!
//! Run with: cargo bench -p voxtrain-vocoder

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mlx_rs::Array;
use voxtrain_vocoder::{MultiResolutionStftLoss, StftLossParams};

/// Deterministic pseudo-waveform `[batch, 1, samples]`.
fn waveform(batch: usize, samples: usize, phase: f32) -> Array {
    let data: Vec<f32> = (0..batch * samples)
        .map(|i| ((i as f32 * 0.0123 + phase).sin() * 0.5))
        .collect();
    Array::from_slice(&data, &[batch as i32, 1, samples as i32])
}

fn bench_multi_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_resolution_stft");
    group.sample_size(20);

    let loss = match MultiResolutionStftLoss::new(&StftLossParams::default()) {
        Ok(loss) => loss,
        Err(e) => panic!("failed to build loss: {}", e),
    };

    let configs = [
        // (batch, samples, description)
        (1, 6000, "1x6k"),
        (4, 12000, "4x12k"),
        (8, 25500, "8x25k"),
    ];

    for (batch, samples, name) in configs {
        let x = waveform(batch, samples, 0.0);
        let y = waveform(batch, samples, 0.3);
        group.throughput(Throughput::Elements((batch * samples) as u64));

        group.bench_with_input(BenchmarkId::new("forward", name), &(&x, &y), |b, (x, y)| {
            b.iter(|| {
                if let Ok((sc, mag)) = loss.forward(x, y) {
                    let _ = black_box(mlx_rs::transforms::eval(&[&sc, &mag]));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_multi_resolution);
criterion_main!(benches);
