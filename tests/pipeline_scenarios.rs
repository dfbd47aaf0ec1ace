//! End-to-end scenarios for spatial intersection and bundle adjustment
//!
//! Covers exact two-view recovery, noisy refinement with a single fixed
//! camera, near-parallel ray bundles and gauge validation, plus the solver
//! properties (local optimality, idempotence, monotone cost) on synthetic
//! ring scenes.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use apex_photogrammetry::geometry::Pose;
use apex_photogrammetry::intersection::{
    IntersectionConfig, PointOutcome, intersect_scene, triangulate_point,
};
use apex_photogrammetry::linalg::Damping;
use apex_photogrammetry::optimizer::{BundleAdjuster, BundleAdjustmentConfig};
use apex_photogrammetry::scene::{CameraId, InMemorySceneBuilder, PointId, SyntheticSceneBuilder};
use apex_photogrammetry::{Camera, PhotogrammetryError, evaluate};
use nalgebra::{Vector2, Vector3};

use scene_test_utils::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn test_two_view_exact_recovery() -> TestResult {
    let truth = [
        Vector3::new(0.3, -0.2, 5.0),
        Vector3::new(-0.5, 0.4, 8.0),
        Vector3::new(0.1, 0.1, 3.0),
    ];
    let mut scene = exact_scene(&two_view_cameras(), &truth)?;

    let report = intersect_scene(&mut scene, &IntersectionConfig::default())?;

    assert_eq!(report.num_triangulated(), 3);
    for (j, expected) in truth.iter().enumerate() {
        let point = scene.point(PointId(j as u32)).expect("point exists");
        assert!(point.is_valid());
        assert!(
            (point.position - expected).norm() < 1e-6,
            "point {j}: {} vs {}",
            point.position,
            expected
        );
    }

    let evaluation = evaluate(&scene);
    assert_eq!(evaluation.overall.count, 6);
    assert!(evaluation.overall.max < 1e-6);
    Ok(())
}

#[test]
fn test_noisy_refinement_with_one_fixed_camera() -> TestResult {
    let synthetic = SyntheticSceneBuilder::new()
        .with_noise(1.0)
        .with_pose_noise(0.0, 0.5)
        .generate()?;
    let mut scene = synthetic.scene.clone();

    intersect_scene(&mut scene, &IntersectionConfig::default())?;
    let error_after_intersection = synthetic.mean_point_error(&scene);

    let adjuster = BundleAdjuster::new(
        BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_max_iterations(100),
    );
    let summary = adjuster.optimize(&mut scene)?;
    let error_after_adjustment = synthetic.mean_point_error(&scene);

    assert!(
        error_after_adjustment < error_after_intersection,
        "mean point error {error_after_adjustment} not below {error_after_intersection}"
    );
    assert!(summary.final_rms < summary.initial_rms);
    assert!(is_non_increasing(&summary.accepted_costs()));
    assert_eq!(summary.num_fixed_cameras, 1);
    assert_eq!(summary.num_free_cameras, 4);

    // The fixed camera is never touched.
    assert_eq!(
        scene.camera(CameraId(0)).map(|c| c.pose),
        synthetic.scene.camera(CameraId(0)).map(|c| c.pose)
    );
    Ok(())
}

#[test]
fn test_near_parallel_rays_are_degenerate() -> TestResult {
    let cameras = forward_cameras(&[
        Vector3::zeros(),
        Vector3::new(0.02, 0.0, 0.0),
        Vector3::new(0.04, 0.0, 0.0),
    ]);
    let mut scene = exact_scene(&cameras, &[Vector3::new(0.0, 0.0, 10.0)])?;

    let result = triangulate_point(&scene, PointId(0), &IntersectionConfig::default());
    assert!(matches!(
        result,
        Err(PhotogrammetryError::DegenerateConfiguration(_))
    ));

    // Scene-level intersection recovers by invalidating the point.
    let report = intersect_scene(&mut scene, &IntersectionConfig::default())?;
    assert_eq!(report.num_invalid(), 1);
    assert!(matches!(
        report.outcomes.get(&PointId(0)),
        Some(PointOutcome::Invalid(PhotogrammetryError::DegenerateConfiguration(_)))
    ));
    assert!(!scene.point(PointId(0)).expect("point exists").is_valid());
    Ok(())
}

#[test]
fn test_single_observation_is_degenerate() -> TestResult {
    let cameras = two_view_cameras();
    let mut builder = InMemorySceneBuilder::new();
    for camera in &cameras {
        builder.add_camera(camera.id, camera.pose, camera.intrinsics);
    }
    builder
        .add_unestimated_point(PointId(0))
        .add_observation(CameraId(0), PointId(0), Vector2::new(320.0, 240.0));
    let scene = builder.build()?;

    assert!(matches!(
        triangulate_point(&scene, PointId(0), &IntersectionConfig::default()),
        Err(PhotogrammetryError::DegenerateConfiguration(_))
    ));
    Ok(())
}

#[test]
fn test_zero_fixed_cameras_is_rejected() -> TestResult {
    let mut scene = SyntheticSceneBuilder::new().generate()?.scene;
    intersect_scene(&mut scene, &IntersectionConfig::default())?;
    let before = scene.clone();

    let result = BundleAdjuster::new(BundleAdjustmentConfig::default()).optimize(&mut scene);

    assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
    assert_eq!(scene, before);

    let unknown = BundleAdjuster::new(BundleAdjustmentConfig::new().with_fixed_camera(CameraId(99)))
        .optimize(&mut scene);
    assert!(matches!(unknown, Err(PhotogrammetryError::MalformedInput(_))));
    Ok(())
}

#[test]
fn test_intersection_is_locally_optimal() -> TestResult {
    let scene = SyntheticSceneBuilder::new().with_noise(1.0).generate()?.scene;
    let config = IntersectionConfig::default();
    let step = 1e-4;

    for id in [PointId(0), PointId(17), PointId(42)] {
        let estimate = triangulate_point(&scene, id, &config)?.position;
        let rays = rays_of(&scene, id);
        let optimum = sum_squared_ray_distances(&rays, &estimate);

        for axis in 0..3 {
            for sign in [-1.0, 1.0] {
                let mut perturbed = estimate;
                perturbed[axis] += sign * step;
                let value = sum_squared_ray_distances(&rays, &perturbed);
                assert!(
                    value >= optimum - 1e-12,
                    "{id}: moving axis {axis} by {} lowered the cost ({value} < {optimum})",
                    sign * step
                );
            }
        }
    }
    Ok(())
}

#[test]
fn test_robust_intersection_rejects_corrupted_view() -> TestResult {
    let cameras = forward_cameras(&[
        Vector3::new(-1.0, 0.0, 0.0),
        Vector3::zeros(),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
    ]);
    let truth = Vector3::new(0.2, 0.1, 6.0);

    let mut builder = InMemorySceneBuilder::new();
    builder.add_unestimated_point(PointId(0));
    for camera in &cameras {
        builder.add_camera(camera.id, camera.pose, camera.intrinsics);
        let mut pixel = camera.project(&truth)?;
        if camera.id == CameraId(3) {
            pixel.x += 30.0;
        }
        builder.add_observation(camera.id, PointId(0), pixel);
    }
    let scene = builder.build()?;

    let plain = triangulate_point(&scene, PointId(0), &IntersectionConfig::default())?;
    assert!(plain.outliers.is_empty());
    assert!((plain.position - truth).norm() > 1e-3);

    let robust_config = IntersectionConfig::new().with_robust_intersection(true);
    let robust = triangulate_point(&scene, PointId(0), &robust_config)?;
    assert_eq!(robust.outliers, vec![CameraId(3)]);
    assert_eq!(robust.inliers.len(), 3);
    assert!((robust.position - truth).norm() < 1e-6);
    Ok(())
}

#[test]
fn test_adjustment_is_idempotent_on_converged_output() -> TestResult {
    let mut scene = SyntheticSceneBuilder::new()
        .with_pose_noise(0.02, 0.2)
        .generate()?
        .scene;
    intersect_scene(&mut scene, &IntersectionConfig::default())?;

    let tight = BundleAdjuster::new(
        BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_max_iterations(200)
            .with_cost_tolerance(1e-12),
    );
    let first = tight.optimize(&mut scene)?;

    let config = BundleAdjustmentConfig::new().with_fixed_camera(CameraId(0));
    let cost_tolerance = config.cost_tolerance;
    let second = BundleAdjuster::new(config).optimize(&mut scene)?;

    assert!((second.initial_cost - first.final_cost).abs() <= 1e-9 * first.final_cost);
    let change = (second.initial_cost - second.final_cost).abs();
    assert!(
        change <= cost_tolerance * second.initial_cost,
        "second run changed the cost by {change:e}"
    );
    Ok(())
}

#[test]
fn test_accepted_costs_never_increase() -> TestResult {
    for damping in [Damping::Marquardt, Damping::Identity] {
        let mut scene = SyntheticSceneBuilder::new()
            .with_seed(7)
            .with_noise(2.0)
            .with_pose_noise(0.1, 1.0)
            .generate()?
            .scene;
        intersect_scene(&mut scene, &IntersectionConfig::default())?;

        let summary = BundleAdjuster::new(
            BundleAdjustmentConfig::new()
                .with_fixed_camera(CameraId(0))
                .with_damping(damping),
        )
        .optimize(&mut scene)?;

        let costs = summary.accepted_costs();
        assert!(costs.len() > 1, "{damping:?}: no accepted step");
        assert!(is_non_increasing(&costs), "{damping:?}: {costs:?}");
        assert_eq!(costs.last().copied(), Some(summary.final_cost));
    }
    Ok(())
}

#[test]
fn test_project_backproject_round_trip() -> TestResult {
    let pose = Pose::look_at(
        &Vector3::new(4.0, -3.0, 2.0),
        &Vector3::zeros(),
        &Vector3::z(),
    )?;
    let camera = Camera::new(CameraId(0), pose, vga_intrinsics());

    for pixel in [
        Vector2::new(320.0, 240.0),
        Vector2::new(12.5, 470.0),
        Vector2::new(633.0, 3.25),
    ] {
        for depth in [0.5, 4.0, 120.0] {
            let ray = camera.backproject(&pixel);
            let scale = depth / camera.depth_of(&ray.point_at(1.0));
            let point = ray.point_at(scale);

            assert!((camera.depth_of(&point) - depth).abs() < 1e-9 * depth.max(1.0));
            let reprojected = camera.project(&point)?;
            assert!(
                (reprojected - pixel).norm() < 1e-8,
                "{pixel} at depth {depth} reprojected to {reprojected}"
            );
        }
    }
    Ok(())
}
