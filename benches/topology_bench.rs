use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_daq_scan::scan::{AxisRange, PositionGenerator, TopologyParams};

fn generator(params: TopologyParams, actuators: &[&str]) -> PositionGenerator {
    PositionGenerator::configure(
        params,
        actuators.iter().map(|a| a.to_string()).collect(),
        10_000_000,
    )
    .unwrap()
}

fn benchmark_grid_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_generation");
    for points in [10usize, 100, 300] {
        let stop = (points - 1) as f64;
        let axes = [AxisRange::new(0.0, stop, 1.0), AxisRange::new(0.0, stop, 1.0)];
        let linear = generator(TopologyParams::Linear2D { axes }, &["x", "y"]);
        group.bench_with_input(BenchmarkId::new("linear_2d", points), &linear, |b, g| {
            b.iter(|| black_box(g.generate().unwrap()));
        });
        let random = generator(
            TopologyParams::Random2D {
                axes,
                seed: Some(1),
            },
            &["x", "y"],
        );
        group.bench_with_input(BenchmarkId::new("random_2d", points), &random, |b, g| {
            b.iter(|| black_box(g.generate().unwrap()));
        });
    }
    group.finish();
}

fn benchmark_spiral_and_index(c: &mut Criterion) {
    let spiral = generator(
        TopologyParams::Spiral2D {
            center: [0.0, 0.0],
            rmax: [50.0, 50.0],
            rstep: [1.0, 1.0],
        },
        &["x", "y"],
    );
    c.bench_function("spiral_2d_generate", |b| {
        b.iter(|| black_box(spiral.generate().unwrap()));
    });

    let topology = spiral.generate().unwrap();
    c.bench_function("spiral_2d_index_for", |b| {
        b.iter(|| {
            for (step, position) in topology.positions().iter().enumerate() {
                black_box(topology.index_for(step, position).unwrap());
            }
        });
    });
}

criterion_group!(benches, benchmark_grid_generation, benchmark_spiral_and_index);
criterion_main!(benches);
