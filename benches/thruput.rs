use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nbody_compute::{
    body::InitialState,
    cpu_ref::{accelerations, host_driver, HostAllocator},
    physics::{AccelerationModel, SimulationConfig},
};

fn benchmark_acceleration(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_acceleration");
    for &count in &[256usize, 1024, 4096] {
        let initial = InitialState::random_cube(count, 16).unwrap();
        for model in [AccelerationModel::Newtonian, AccelerationModel::Relativistic] {
            group.bench_with_input(BenchmarkId::new(model.to_string(), count), &initial, |b, initial| {
                b.iter(|| {
                    black_box(accelerations(
                        model,
                        &initial.positions,
                        &initial.velocities,
                        &initial.positions[..initial.num_grav],
                        1e-6,
                    ))
                });
            });
        }
    }
    group.finish();
}

fn benchmark_host_step(c: &mut Criterion) {
    let initial = InitialState::random_cube(1024, 16).unwrap();
    let config = SimulationConfig::new(1024, 16).with_time_step(3600.0);
    let allocator = HostAllocator::new();
    let mut driver = host_driver(&config, &initial, &allocator).unwrap();
    driver.advance(16).unwrap();

    c.bench_function("host_stage_1k", |b| {
        b.iter(|| black_box(driver.step().unwrap()));
    });
}

criterion_group!(benches, benchmark_acceleration, benchmark_host_step);
criterion_main!(benches);
