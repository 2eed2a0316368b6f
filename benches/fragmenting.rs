//! Benchmark fragmentation and processing of a synthetic movie.
//!
//! The input is built in memory: 60 s of 25 fps video with a sync sample
//! every 2 s and 44.1 kHz audio, interleaved in chunks of 5 samples. It
//! measures:
//! - moov parsing and sample table resolution
//! - fragmenting to 2 s fragments
//! - rewriting the fragmented result through the identity processor

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mp4frag_media::fragmenter::{FragmentOptions, Fragmenter};
use mp4frag_media::processor::{IdentityFactory, Processor};
use mp4frag_media::testing::{Mp4Builder, TrackSpec};
use mp4frag_media::Mp4File;
use std::io::Cursor;

fn movie() -> Vec<u8> {
    Mp4Builder::new()
        .track(TrackSpec::video(1, 1500, 400).sync_every(50))
        .track(TrackSpec::audio(2, 2584, 1024))
        .samples_per_chunk(5)
        .build()
}

fn fragment(input: &[u8], file: &Mp4File) -> Vec<u8> {
    let options = FragmentOptions {
        fragment_duration_ms: Some(2000),
        create_segment_index: true,
        ..Default::default()
    };
    let mut output = Cursor::new(Vec::with_capacity(input.len() + 64 * 1024));
    Fragmenter::new(options)
        .fragment(&mut Cursor::new(input), file, &mut output)
        .unwrap();
    output.into_inner()
}

fn bench_fragmenting(c: &mut Criterion) {
    let input = movie();
    let file = Mp4File::parse(&mut Cursor::new(&input)).unwrap();
    let fragmented = fragment(&input, &file);

    let mut group = c.benchmark_group("fragmenting");

    group.bench_function("parse", |b| {
        b.iter(|| Mp4File::parse(&mut Cursor::new(black_box(&input))).unwrap());
    });

    group.bench_function("fragment", |b| {
        b.iter(|| fragment(black_box(&input), &file));
    });

    group.bench_function("process_fragmented", |b| {
        b.iter(|| {
            let mut output = Cursor::new(Vec::with_capacity(fragmented.len()));
            Processor::new()
                .process(
                    &mut Cursor::new(black_box(&fragmented)),
                    &mut output,
                    &mut IdentityFactory,
                    None,
                )
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fragmenting);
criterion_main!(benches);
