use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use inject_core::{snake_curve, Bounds, ChainPlacer, Command, Vec3I};

/// Every third command conditional, which forces rewinds at every turn.
fn mixed_commands(count: usize) -> Vec<Arc<Command>> {
    (0..count)
        .map(|index| {
            let command = Command::new(format!("say {index}"));
            if index % 3 == 2 {
                command.conditional().into_shared()
            } else {
                command.into_shared()
            }
        })
        .collect()
}

fn bench_chain_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_placement");
    for edge in [4, 8, 16, 32] {
        let bounds = Bounds::new(Vec3I::ZERO, Vec3I::new(edge - 1, edge - 1, edge - 1));
        let placer = match ChainPlacer::new(snake_curve(bounds)) {
            Ok(placer) => placer,
            Err(err) => panic!("snake curve should always be connected: {err}"),
        };
        // Leave headroom for the padding no-ops.
        let commands = mixed_commands(placer.capacity() / 2);

        group.bench_with_input(BenchmarkId::new("snake", edge), &commands, |b, commands| {
            b.iter(|| placer.place(commands))
        });
    }
    group.finish();
}

fn bench_snake_curve(c: &mut Criterion) {
    let mut group = c.benchmark_group("snake_curve");
    for edge in [8, 32, 64] {
        let bounds = Bounds::new(Vec3I::ZERO, Vec3I::new(edge - 1, edge - 1, edge - 1));
        group.bench_with_input(BenchmarkId::new("cube", edge), &bounds, |b, &bounds| {
            b.iter(|| snake_curve(bounds))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain_placement, bench_snake_curve);
criterion_main!(benches);
