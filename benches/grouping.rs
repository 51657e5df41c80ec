use criterion::{Criterion, criterion_group, criterion_main};
use mesh_baker::config::{
    AgglomerativeParams, ClusterConfig, ClusterStrategy, GridParams, KMeansParams, PieParams,
};
use mesh_baker::grouping::group;
use mesh_baker::types::{BoundingBox, MaterialId, Surface};

/// `n` unit-sized surfaces scattered over a 100x100 plane by a fixed hash.
fn scatter(n: usize) -> Vec<Surface> {
    (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let x = (h % 10_000) as f64 / 100.0;
            let z = ((h >> 20) % 10_000) as f64 / 100.0;
            let mut s = Surface::new(i as u64, 0, vec![MaterialId(0)]);
            s.world_bounds = BoundingBox::from_center_extents([x, 0.0, z], [0.5; 3]);
            s
        })
        .collect()
}

fn config(strategy: ClusterStrategy) -> ClusterConfig {
    ClusterConfig {
        strategy,
        ..Default::default()
    }
}

fn bench_spatial(c: &mut Criterion) {
    let surfaces = scatter(10_000);

    let grid = config(ClusterStrategy::Grid(GridParams {
        origin: [0.0; 3],
        cell_size: [10.0; 3],
    }));
    c.bench_function("grid_10k", |b| {
        b.iter(|| group(&surfaces, &grid).unwrap());
    });

    let pie = config(ClusterStrategy::Pie(PieParams {
        origin: [50.0, 0.0, 50.0],
        axis: [0.0, 1.0, 0.0],
        segments: 12,
        ring_spacing: 10.0,
        combine_inner_ring: true,
    }));
    c.bench_function("pie_10k", |b| {
        b.iter(|| group(&surfaces, &pie).unwrap());
    });

    let kmeans = config(ClusterStrategy::KMeans(KMeansParams {
        clusters: 20,
        iterations: 10,
        seed: Some(7),
    }));
    c.bench_function("kmeans_20_10k", |b| {
        b.iter(|| group(&surfaces, &kmeans).unwrap());
    });
}

fn bench_agglomerative(c: &mut Criterion) {
    // The dendrogram build is quadratic; keep the input small
    let surfaces = scatter(500);
    let agglomerative = config(ClusterStrategy::Agglomerative(AgglomerativeParams { max_distance: 8.0 }));

    c.bench_function("agglomerative_500", |b| {
        b.iter(|| group(&surfaces, &agglomerative).unwrap());
    });
}

criterion_group!(benches, bench_spatial, bench_agglomerative);
criterion_main!(benches);
