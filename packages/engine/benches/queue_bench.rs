// packages/engine/benches/queue_bench.rs
//! Scheduler queue and KPI recording throughput

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use fabric_engine::scheduler::TaskQueue;
use fabric_engine::telemetry::{ExecutionContext, TelemetryCollector};
use fabric_engine::utils::config::TelemetryConfig;
use fabric_engine::{AgentId, ExecutionResult, Priority, ResourceUsage, Task, TaskId};

fn tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            Task::builder(if i % 4 == 0 { "rare" } else { "common" })
                .priority(Priority::ALL[i % Priority::ALL.len()])
                .build()
                .unwrap()
        })
        .collect()
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("push_then_pop", size), &size, |b, &size| {
            b.iter_batched(
                || tasks(size),
                |batch| {
                    let mut queue = TaskQueue::new();
                    for task in batch {
                        queue.push(task);
                    }
                    while let Some(entry) = queue.pop_front() {
                        black_box(entry);
                    }
                },
                BatchSize::LargeInput,
            )
        });

        // Every pop skips the "common" tasks in front of the first "rare" one
        group.bench_with_input(BenchmarkId::new("pop_with_skip", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut queue = TaskQueue::new();
                    for task in tasks(size) {
                        queue.push(task);
                    }
                    queue
                },
                |mut queue| {
                    while let Some(entry) =
                        queue.pop_first_matching(|task| task.capability().as_str() == "rare")
                    {
                        black_box(entry);
                    }
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_kpi_record(c: &mut Criterion) {
    let collector = TelemetryCollector::with_context(
        &TelemetryConfig {
            emit_metrics: false,
            ..Default::default()
        },
        ExecutionContext::detect(),
    );
    let agent = AgentId::new();
    let result = ExecutionResult::succeeded(
        TaskId::new(),
        agent,
        serde_json::Value::Null,
        12,
        ResourceUsage {
            cpu_seconds: 0.01,
            memory_peak_mb: 4.0,
            ..Default::default()
        },
    );

    let mut group = c.benchmark_group("telemetry");
    group.throughput(Throughput::Elements(1));
    group.bench_function("record", |b| b.iter(|| black_box(collector.record(&result))));
    group.bench_function("snapshot", |b| b.iter(|| black_box(collector.snapshot())));
    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_kpi_record);
criterion_main!(benches);
