//! Ring Buffer Throughput Benchmark
//!
//! Measures write/read throughput of the planar frame ring to verify the
//! lock-free path stays far ahead of realtime.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gapless_engine::engine::ring_buffer::FrameRing;
use gapless_engine::CanonicalBuffer;

fn bench_frame_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_ring");

    group.bench_function("write_read_2048_stereo", |b| {
        let (mut writer, mut reader) = FrameRing::new(2, 4096).split();
        let mut src = CanonicalBuffer::with_capacity(2, 2048);
        for ch in 0..2 {
            for i in 0..2048 {
                src.channel_mut(ch)[i] = i as f64 * 1e-4;
            }
        }
        src.set_frames(2048);
        let mut dst = CanonicalBuffer::with_capacity(2, 2048);

        b.iter(|| {
            let written = writer.write(black_box(&src), 0, 2048);
            let read = reader.read(black_box(&mut dst), 0, 2048);
            black_box((written, read));
        });
    });

    group.bench_function("interleaved_small_chunks", |b| {
        let (mut writer, mut reader) = FrameRing::new(2, 1024).split();
        let mut src = CanonicalBuffer::with_capacity(2, 512);
        src.fill_silence(0, 512);
        let mut dst = CanonicalBuffer::with_capacity(2, 512);

        b.iter(|| {
            for _ in 0..4 {
                writer.write(black_box(&src), 0, 128);
                reader.read(black_box(&mut dst), 0, 128);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_frame_ring);
criterion_main!(benches);
