//! Performance benchmarks for the queue engine core.
//!
//! ## Benchmark breakdown
//!
//! 1. **join_leave**: measures the full join/renumber/leave/renumber cycle
//!    on a queue with a modest number of already-waiting callers — the
//!    hottest path in the engine, since every caller pays it twice.
//! 2. **strategy_select**: measures one member-selection pass (`spec.md`
//!    §4.1.5) across a queue with a realistic member count, for each
//!    strategy, so a regression in the metric computation shows up here
//!    before it shows up as added latency in `serve_caller`.
//! 3. **weight_suppression_scan**: measures [`QueueRegistry::is_weight_suppressed`]
//!    against a registry holding many queues, since it is O(queues) per
//!    ring attempt.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pbxq_core::queue::strategy;
use pbxq_core::queue::types::{Member, Queue, QueueConfig, Strategy};
use pbxq_core::queue::QueueRegistry;
use tokio::runtime::Runtime;

fn queue_with_members(strategy_kind: Strategy, member_count: usize) -> Queue {
    let mut config = QueueConfig::default();
    config.strategy = strategy_kind;
    let mut queue = Queue::new("bench", config);
    for i in 0..member_count {
        queue.members.push(Member::new(format!("SIP/{i:04}"), (i % 3) as u32, false));
    }
    queue
}

/// **BENCHMARK 1: join/leave cycle**
///
/// Expected: sub-microsecond per call on a modern machine; the dominant
/// cost is the `Vec`/`VecDeque` renumbering pass, which is O(n).
fn benchmark_join_leave(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("01_join_leave_cycle", |b| {
        b.to_async(&rt).iter(|| async {
            let registry = QueueRegistry::new();
            registry.define_static_queue("bench", {
                let mut cfg = QueueConfig::default();
                cfg.max_length = 0;
                cfg
            });
            if let Some(queue) = registry.get("bench") {
                queue.write().members.push(Member::new("SIP/1000", 0, false));
            }
            for i in 0..50 {
                let channel_id = format!("caller-{i}");
                registry.join("bench", &channel_id, 0, 0, 0).await.ok();
            }
            registry.leave("bench", "caller-25").ok();
            black_box(registry.get("bench").map(|q| q.read().callers.len()));
        });
    });
}

/// **BENCHMARK 2: strategy selection**
///
/// Expected: linear in member count for every strategy; `Random` carries
/// extra cost from the thread-local RNG draw per member.
fn benchmark_strategy_select(c: &mut Criterion) {
    for strategy_kind in [
        Strategy::RingAll,
        Strategy::RoundRobin,
        Strategy::LeastRecent,
        Strategy::FewestCalls,
        Strategy::Random,
        Strategy::RoundRobinMemory,
    ] {
        let mut queue = queue_with_members(strategy_kind, 200);
        c.bench_function(&format!("02_select_{strategy_kind:?}"), |b| {
            b.iter(|| {
                let selection = strategy::select(&mut queue, 1_000_000);
                black_box(selection.candidates.len());
            });
        });
    }
}

/// **BENCHMARK 3: weight-arbitration scan**
///
/// Expected: linear in the number of registered queues (`spec.md` §4.1.6);
/// this is the per-candidate-per-cycle cost the ring loop pays before
/// dialing, so it directly bounds offer latency under many queues.
fn benchmark_weight_suppression(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let registry = QueueRegistry::new();
    for i in 0..100 {
        let mut cfg = QueueConfig::default();
        cfg.weight = (i % 10) as u32;
        let queue = registry.define_static_queue(&format!("q{i}"), cfg);
        queue.write().members.push(Member::new("SIP/shared", 0, false));
    }
    rt.block_on(async {
        for i in 0..100 {
            registry.join(&format!("q{i}"), &format!("c{i}"), 0, 0, 0).await.ok();
        }
    });

    c.bench_function("03_weight_suppression_scan", |b| {
        b.iter(|| {
            black_box(registry.is_weight_suppressed("q0", "SIP/shared"));
        });
    });
}

criterion_group!(benches, benchmark_join_leave, benchmark_strategy_select, benchmark_weight_suppression);
criterion_main!(benches);
