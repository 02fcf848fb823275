use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;

use posecoach_core::{AttemptError, OutcomeCode, TaskId, UploadOutcome};
use posecoach_upload::retry::{next_delay, should_retry};
use posecoach_upload::tasks::{NewTask, TaskPatch};
use posecoach_upload::{StrategyPreset, TaskRegistry, TaskStatus, summarize_scores};

fn bench_backoff_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let strategy = StrategyPreset::Network.strategy();
    let error = AttemptError::server("bad gateway").with_code("HTTP_ERROR");
    let mut rng = StdRng::seed_from_u64(7);

    group.bench_function("next_delay_jittered", |b| {
        b.iter(|| {
            for attempt in 0..=strategy.max_retries() {
                black_box(next_delay(black_box(attempt), &strategy, &mut rng));
            }
        })
    });

    group.bench_function("should_retry", |b| {
        b.iter(|| {
            for attempt in 0..=strategy.max_retries() {
                black_box(should_retry(black_box(attempt), &error, &strategy));
            }
        })
    });

    group.finish();
}

fn bench_registry_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    for task_count in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(task_count as u64));
        group.bench_with_input(
            BenchmarkId::new("create_upload_complete", task_count),
            &task_count,
            |b, &task_count| {
                b.iter(|| {
                    // No runtime: terminal tasks stay in the map, which keeps
                    // eviction timers out of the measurement.
                    let registry = TaskRegistry::new(Duration::from_secs(10));
                    let _sub = registry.subscribe(|event| {
                        black_box(&event.kind);
                    });

                    for i in 0..task_count {
                        let id = TaskId::for_frame(i);
                        registry
                            .create(id.clone(), NewTask::new("/frames/f.jpg", "tree"))
                            .ok();
                        registry.update(&id, TaskStatus::Uploading, TaskPatch::progress(0));
                        registry.update(&id, TaskStatus::Uploading, TaskPatch::progress(50));
                        registry.update(
                            &id,
                            TaskStatus::Completed,
                            TaskPatch::result(UploadOutcome::success("tree", 80.0)),
                        );
                    }
                    black_box(registry.stats())
                })
            },
        );
    }

    group.finish();
}

fn bench_score_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for frame_count in [30usize, 300] {
        let outcomes: Vec<UploadOutcome> = (0..frame_count)
            .map(|i| match i % 5 {
                0 => UploadOutcome::new("tree", OutcomeCode::NoKeypoint, 0.0),
                n => UploadOutcome::success("tree", 50.0 + n as f64 * 10.0),
            })
            .collect();

        group.throughput(Throughput::Elements(frame_count as u64));
        group.bench_with_input(
            BenchmarkId::new("summarize_scores", frame_count),
            &outcomes,
            |b, outcomes| b.iter(|| black_box(summarize_scores(outcomes))),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_backoff_decisions,
    bench_registry_lifecycle,
    bench_score_aggregation
);
criterion_main!(benches);
