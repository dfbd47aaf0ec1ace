//! Bundle adjustment and spatial intersection benchmarks on synthetic scenes
//!
//! Scenes are generated on a camera ring with pixel and pose noise, triangulated
//! once during setup, and then refined from the same starting state on every
//! iteration.

use apex_photogrammetry::intersection::{IntersectionConfig, intersect_scene};
use apex_photogrammetry::optimizer::{BundleAdjuster, BundleAdjustmentConfig};
use apex_photogrammetry::scene::{CameraId, Scene, SyntheticSceneBuilder};
use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

fn triangulated_scene(num_cameras: usize, num_points: usize) -> Scene {
    let mut scene = SyntheticSceneBuilder::new()
        .with_cameras(num_cameras)
        .with_points(num_points)
        .with_pose_noise(0.05, 0.5)
        .generate()
        .expect("synthetic scene")
        .scene;
    intersect_scene(&mut scene, &IntersectionConfig::default()).expect("intersection");
    scene
}

fn benchmark_spatial_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_intersection");
    group.measurement_time(Duration::from_secs(5));

    for num_points in [100usize, 1000] {
        let scene = SyntheticSceneBuilder::new()
            .with_cameras(8)
            .with_points(num_points)
            .generate()
            .expect("synthetic scene")
            .scene;
        let config = IntersectionConfig::default();

        group.bench_with_input(BenchmarkId::from_parameter(num_points), &scene, |b, s| {
            b.iter_batched(
                || s.clone(),
                |mut scene| black_box(intersect_scene(&mut scene, &config)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_bundle_adjustment(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_adjustment");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for (num_cameras, num_points) in [(5usize, 100usize), (10, 500), (20, 1000)] {
        let scene = triangulated_scene(num_cameras, num_points);
        let label = format!("{num_cameras}x{num_points}");

        for parallel in [false, true] {
            let adjuster = BundleAdjuster::new(
                BundleAdjustmentConfig::new()
                    .with_fixed_camera(CameraId(0))
                    .with_parallel(parallel),
            );
            let name = if parallel { "parallel" } else { "sequential" };

            group.bench_with_input(BenchmarkId::new(name, &label), &scene, |b, s| {
                b.iter_batched(
                    || s.clone(),
                    |mut scene| black_box(adjuster.optimize(&mut scene)),
                    BatchSize::SmallInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_spatial_intersection,
    benchmark_bundle_adjustment
);
criterion_main!(benches);
