use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use forager_core::{SimulationConfig, World};
use std::time::Duration;

fn bench_world_days(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_day");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    for &agents in &[25usize, 50, 100] {
        group.bench_function(format!("days4_agents{agents}"), |b| {
            b.iter_batched(
                || {
                    let config = SimulationConfig {
                        initial_agents: agents as u32,
                        max_population: (agents * 4) as u32,
                        rng_seed: Some(0xBEEF),
                        ..SimulationConfig::default()
                    };
                    let mut world = World::new(config).expect("world");
                    world.initialize();
                    world
                },
                |mut world| {
                    world.advance_days(4).expect("days");
                    world
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_days);
criterion_main!(benches);
