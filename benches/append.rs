//! Sequential append throughput, with and without a forced fsync per batch.

use std::num::NonZeroU64;

use corfu_logunit::{EntryType, LogEntry, LogUnit, Options, StreamId};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use rand::RngCore;
use tempfile::tempdir;

const APPENDS_PER_ITER: u64 = 2_000;

fn random_payload(rng: &mut impl RngCore, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn open(records_per_segment: u64) -> (tempfile::TempDir, LogUnit) {
    let dir = tempdir().unwrap();
    let log_dir = corfu_logunit::datastore::log_directory(dir.path());
    let store = corfu_logunit::datastore::FileMetadataStore::new(&log_dir);
    let opts = Options {
        records_per_segment: NonZeroU64::new(records_per_segment).unwrap(),
        ..Options::default()
    };
    let log = LogUnit::open(dir.path().to_path_buf(), opts, store).unwrap();
    (dir, log)
}

fn append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.sample_size(10).sampling_mode(SamplingMode::Flat);
    group.throughput(Throughput::Elements(APPENDS_PER_ITER));

    let mut rng = rand::rng();
    let payload = random_payload(&mut rng, 256);
    let sid = StreamId::new(1);

    for fsync_every in [0u64, 32, APPENDS_PER_ITER] {
        let id = BenchmarkId::from_parameter(format!("fsync_every={fsync_every}"));
        group.bench_function(id, |b| {
            b.iter_batched(
                || open(10_000),
                |(dir, log)| {
                    for i in 0..APPENDS_PER_ITER {
                        let entry = LogEntry::data(i, 0, [sid], payload.clone());
                        debug_assert_eq!(entry.entry_type, EntryType::Data);
                        log.append(entry).unwrap();
                        if fsync_every != 0 && (i + 1) % fsync_every == 0 {
                            log.sync(true).unwrap();
                        }
                    }
                    log.sync(true).unwrap();
                    drop(dir);
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, append);
criterion_main!(benches);
