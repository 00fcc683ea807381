//! Benchmarks for the `svn-ra` crate.
//!
//! Run with:
//! - `cargo bench`

#![allow(missing_docs)]

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use svn_ra::{DELTA_WINDOW_MAX, DeltaApplier, DiffWindow, SvnUrl, generate};

fn abort_with_error(message: &str) -> ! {
    eprintln!("{message}");
    std::process::abort();
}

/// Line-structured text with a small edit every `stride` lines.
fn sample_pair(lines: usize, stride: usize) -> (Vec<u8>, Vec<u8>) {
    let mut source = Vec::new();
    let mut target = Vec::new();
    for i in 0..lines {
        let line = format!("line {i:06} of some reasonably ordinary source text\n");
        source.extend_from_slice(line.as_bytes());
        if i % stride == 0 {
            target.extend_from_slice(format!("edited {i:06}\n").as_bytes());
        } else {
            target.extend_from_slice(line.as_bytes());
        }
    }
    (source, target)
}

fn bench_window_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_codec");

    for &size in &[4 * 1024usize, DELTA_WINDOW_MAX] {
        let window = DiffWindow::replacement(&vec![7u8; size]);
        let encoded = window.encode();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &window, |b, window| {
            b.iter(|| black_box(window.encode().len()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| match DiffWindow::decode(black_box(encoded)) {
                Ok(window) => black_box(window.target_view_length),
                Err(_) => abort_with_error("DiffWindow::decode failed"),
            });
        });
    }

    group.finish();
}

fn bench_delta_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_apply");

    for &lines in &[1_000usize, 20_000] {
        let (source, target) = sample_pair(lines, 50);
        let windows = generate(&source, &target, DELTA_WINDOW_MAX);
        group.throughput(Throughput::Bytes(target.len() as u64));

        group.bench_with_input(BenchmarkId::new("generated", lines), &windows, |b, windows| {
            b.iter(|| {
                let mut applier = DeltaApplier::new(source.as_slice(), Vec::with_capacity(target.len()));
                for window in windows {
                    if applier.apply(window).is_err() {
                        abort_with_error("DeltaApplier::apply failed");
                    }
                }
                match applier.finish() {
                    Ok((out, _)) => black_box(out.len()),
                    Err(_) => abort_with_error("DeltaApplier::finish failed"),
                }
            });
        });

        let fulltext = DiffWindow::replacement_windows(&target, DELTA_WINDOW_MAX);
        group.bench_with_input(BenchmarkId::new("fulltext", lines), &fulltext, |b, windows| {
            b.iter(|| {
                let mut applier = DeltaApplier::new(&[][..], Vec::with_capacity(target.len()));
                for window in windows {
                    if applier.apply(window).is_err() {
                        abort_with_error("DeltaApplier::apply failed");
                    }
                }
                match applier.finish() {
                    Ok((out, _)) => black_box(out.len()),
                    Err(_) => abort_with_error("DeltaApplier::finish failed"),
                }
            });
        });
    }

    group.finish();
}

fn bench_delta_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_generate");

    for &lines in &[1_000usize, 20_000] {
        let (source, target) = sample_pair(lines, 50);
        group.throughput(Throughput::Bytes(target.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(lines),
            &(source, target),
            |b, (source, target)| {
                b.iter(|| black_box(generate(source, target, DELTA_WINDOW_MAX).len()));
            },
        );
    }

    group.finish();
}

fn bench_url_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_parse");
    for input in [
        "svn://example.com/repo",
        "svn://alice@example.com:3691/repo/trunk",
        "svn://[2001:db8::1]/repo",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(input), input, |b, input| {
            b.iter(|| {
                let url = match SvnUrl::parse(black_box(input)) {
                    Ok(url) => url,
                    Err(_) => abort_with_error("SvnUrl::parse failed for benchmark input"),
                };
                black_box(url.url);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_window_codec,
    bench_delta_apply,
    bench_delta_generate,
    bench_url_parse
);
criterion_main!(benches);
