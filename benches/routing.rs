//! Routing benchmarks — complexity analysis and tier selection.
//!
//! Analysis runs on every request before any model work, so it has to stay
//! in the microsecond range even for a few hundred lines of code.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio_completion_orchestrator::memory::{FixedMemoryProbe, GIB};
use tokio_completion_orchestrator::model::EchoModelLoader;
use tokio_completion_orchestrator::routing::RoutingConfig;
use tokio_completion_orchestrator::{ComplexityAnalyzer, ModelCache, ModelRouter, ResourceAccountant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const HELLO_WORLD: &str = "public class HelloWorld { public static void main(String[] args) { System.out.println(\"Hello\"); } }";

fn synthetic_source(functions: usize) -> String {
    (0..functions)
        .map(|i| {
            format!(
                "def handler_{i}(request, context):\n    if request.valid:\n        for item in request.items:\n            await process_{i}(item)\n    return context\n\n"
            )
        })
        .collect()
}

fn router(free: u64) -> ModelRouter {
    let accountant = ResourceAccountant::new(Arc::new(FixedMemoryProbe::new(16 * GIB, free)));
    let cache = Arc::new(ModelCache::new(
        3,
        accountant,
        Arc::new(EchoModelLoader::new(259)),
    ));
    ModelRouter::new(RoutingConfig::default(), cache)
}

// ---------------------------------------------------------------------------
// Bench: ComplexityAnalyzer::analyze across input sizes
// ---------------------------------------------------------------------------

fn bench_analyze(c: &mut Criterion) {
    let analyzer = ComplexityAnalyzer::new();
    let mut group = c.benchmark_group("complexity_analyze");

    group.bench_function("hello_world", |b| {
        b.iter(|| black_box(analyzer.analyze(black_box(HELLO_WORLD))))
    });

    for functions in [5_usize, 50, 200] {
        let source = synthetic_source(functions);
        group.bench_with_input(
            BenchmarkId::from_parameter(source.lines().count()),
            &source,
            |b, source| b.iter(|| black_box(analyzer.analyze(black_box(source)))),
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: ModelRouter::select_model with and without memory pressure
// ---------------------------------------------------------------------------

fn bench_select_model(c: &mut Criterion) {
    let source = synthetic_source(20);
    let mut group = c.benchmark_group("select_model");

    let roomy = router(8 * GIB);
    group.bench_function("ideal", |b| {
        b.iter(|| black_box(roomy.select_model(black_box(&source))))
    });

    let tight = router(GIB);
    group.bench_function("fallback", |b| {
        b.iter(|| black_box(tight.select_model(black_box(&source))))
    });
    group.finish();
}

criterion_group!(benches, bench_analyze, bench_select_model);
criterion_main!(benches);
