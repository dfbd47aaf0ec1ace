//! Levenberg-Marquardt bundle adjuster.
//!
//! Each iteration linearizes all residuals at the current state (in parallel),
//! assembles the block normal equations and solves them with the Schur
//! complement. A trial step is accepted only if it lowers the cost; otherwise
//! the damping is increased and the step retried from the same linearization.
//!
//! The solver works on a private copy of the parameters. Accepted states are
//! written back to the [`Scene`] immediately, so whatever way the solve ends
//! the scene holds the lowest-cost state seen and never non-finite values.

use super::{BundleAdjustmentSummary, IterationRecord, TerminationReason};
use crate::error::{PhotogrammetryError, PhotogrammetryResult};
use crate::geometry::{Camera, Intrinsics, Pose};
use crate::linalg::{
    BlockKind, BlockSystem, BlockUpdate, Damping, LinAlgError, ObservationTerm,
    SchurComplementSolver,
};
use crate::scene::{CameraId, PointId, Scene};
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lower bound for the damping parameter after successful steps.
const LAMBDA_FLOOR: f64 = 1e-12;

/// Configuration for [`BundleAdjuster`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentConfig {
    pub max_iterations: usize,
    /// Converged when the relative cost decrease of an accepted step is below this
    pub cost_tolerance: f64,
    /// Converged when the norm of an accepted step is below this
    pub step_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up_factor: f64,
    pub lambda_down_factor: f64,
    /// Stalled when λ exceeds this
    pub lambda_ceiling: f64,
    /// Stalled after this many rejected trials from one linearization
    pub max_consecutive_rejections: usize,
    pub damping: Damping,
    /// Cameras held constant; at least one is required to fix the gauge
    pub fixed_camera_ids: BTreeSet<CameraId>,
    /// Wall-clock budget, checked between iterations
    pub timeout: Option<Duration>,
    /// Evaluate residuals and eliminate points in parallel
    pub parallel: bool,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-6,
            step_tolerance: 1e-8,
            initial_lambda: 1e-3,
            lambda_up_factor: 10.0,
            lambda_down_factor: 10.0,
            lambda_ceiling: 1e10,
            max_consecutive_rejections: 10,
            damping: Damping::Marquardt,
            fixed_camera_ids: BTreeSet::new(),
            timeout: None,
            parallel: true,
        }
    }
}

impl BundleAdjustmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_step_tolerance(mut self, step_tolerance: f64) -> Self {
        self.step_tolerance = step_tolerance;
        self
    }

    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }

    pub fn with_lambda_factors(mut self, up: f64, down: f64) -> Self {
        self.lambda_up_factor = up;
        self.lambda_down_factor = down;
        self
    }

    pub fn with_lambda_ceiling(mut self, ceiling: f64) -> Self {
        self.lambda_ceiling = ceiling;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, rejections: usize) -> Self {
        self.max_consecutive_rejections = rejections;
        self
    }

    pub fn with_damping(mut self, damping: Damping) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_fixed_camera(mut self, id: CameraId) -> Self {
        self.fixed_camera_ids.insert(id);
        self
    }

    pub fn with_fixed_cameras(mut self, ids: impl IntoIterator<Item = CameraId>) -> Self {
        self.fixed_camera_ids.extend(ids);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> PhotogrammetryResult<()> {
        let invalid = |msg: String| Err(PhotogrammetryError::MalformedInput(msg));
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".to_string());
        }
        for (name, value) in [
            ("cost_tolerance", self.cost_tolerance),
            ("step_tolerance", self.step_tolerance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if !(self.initial_lambda.is_finite() && self.initial_lambda > 0.0) {
            return invalid(format!(
                "initial_lambda must be finite and positive, got {}",
                self.initial_lambda
            ));
        }
        if !(self.lambda_up_factor > 1.0 && self.lambda_down_factor > 1.0) {
            return invalid("lambda up/down factors must be greater than 1".to_string());
        }
        if !(self.lambda_ceiling > self.initial_lambda) {
            return invalid(format!(
                "lambda_ceiling {} must exceed initial_lambda {}",
                self.lambda_ceiling, self.initial_lambda
            ));
        }
        if self.max_consecutive_rejections == 0 {
            return invalid("max_consecutive_rejections must be at least 1".to_string());
        }
        Ok(())
    }

    /// The fixed cameras must be non-empty and present in `scene`.
    pub fn check_fixed_cameras(&self, scene: &Scene) -> PhotogrammetryResult<()> {
        if self.fixed_camera_ids.is_empty() {
            return Err(PhotogrammetryError::MalformedInput(
                "bundle adjustment needs at least one fixed camera to remove gauge freedom"
                    .to_string(),
            ));
        }
        if let Some(missing) = self
            .fixed_camera_ids
            .iter()
            .find(|id| scene.camera(**id).is_none())
        {
            return Err(PhotogrammetryError::MalformedInput(format!(
                "fixed {missing} is not part of the scene"
            )));
        }
        Ok(())
    }
}

/// One usable observation, with everything needed to evaluate it.
#[derive(Debug, Clone)]
struct ResidualBlock {
    camera_id: CameraId,
    intrinsics: Intrinsics,
    /// Free camera index, or the constant pose of a fixed camera
    camera: CameraSlot,
    point: usize,
    pixel: Vector2<f64>,
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
enum CameraSlot {
    Free(usize),
    Fixed(Pose),
}

/// Optimized parameters.
#[derive(Debug, Clone)]
struct ParameterState {
    poses: Vec<Pose>,
    points: Vec<Vector3<f64>>,
}

impl ParameterState {
    fn apply(&self, update: &BlockUpdate) -> Self {
        let poses = self
            .poses
            .iter()
            .zip(&update.cameras)
            .map(|(pose, d)| {
                pose.retract(
                    &Vector3::new(d[0], d[1], d[2]),
                    &Vector3::new(d[3], d[4], d[5]),
                )
            })
            .collect();
        let points = self
            .points
            .iter()
            .zip(&update.points)
            .map(|(p, d)| p + d)
            .collect();
        Self { poses, points }
    }
}

/// Parameter layout of a scene.
struct Problem {
    free_cameras: Vec<CameraId>,
    num_fixed_cameras: usize,
    point_ids: Vec<PointId>,
    blocks: Vec<ResidualBlock>,
    point_terms: Vec<Vec<usize>>,
    excluded_observations: usize,
}

impl Problem {
    fn camera(&self, block: &ResidualBlock, state: &ParameterState) -> Camera {
        let pose = match block.camera {
            CameraSlot::Free(index) => state.poses[index],
            CameraSlot::Fixed(pose) => pose,
        };
        Camera::new(block.camera_id, pose, block.intrinsics)
    }

    /// `½ Σ w‖r‖²`, infinite if any point falls behind its camera.
    fn cost(&self, state: &ParameterState, parallel: bool) -> f64 {
        let block_cost = |block: &ResidualBlock| {
            match self.camera(block, state).project(&state.points[block.point]) {
                Ok(projected) => 0.5 * block.weight * (block.pixel - projected).norm_squared(),
                Err(_) => f64::INFINITY,
            }
        };
        if parallel {
            self.blocks.par_iter().map(block_cost).sum()
        } else {
            self.blocks.iter().map(block_cost).sum()
        }
    }

    fn linearize(
        &self,
        state: &ParameterState,
        parallel: bool,
    ) -> PhotogrammetryResult<Vec<ObservationTerm>> {
        let linearize_block = |block: &ResidualBlock| -> PhotogrammetryResult<ObservationTerm> {
            let camera = self.camera(block, state);
            let (projected, jac_camera, jac_point) =
                camera.project_with_jacobians(&state.points[block.point])?;
            Ok(ObservationTerm {
                camera: match block.camera {
                    CameraSlot::Free(index) => Some(index),
                    CameraSlot::Fixed(_) => None,
                },
                point: block.point,
                jac_camera,
                jac_point,
                residual: block.pixel - projected,
                weight: block.weight,
            })
        };
        if parallel {
            self.blocks.par_iter().map(linearize_block).collect()
        } else {
            self.blocks.iter().map(linearize_block).collect()
        }
    }

    fn rms(&self, cost: f64) -> f64 {
        if self.blocks.is_empty() {
            0.0
        } else {
            (2.0 * cost / self.blocks.len() as f64).sqrt()
        }
    }

    fn describe_block(&self, err: &LinAlgError) -> String {
        match *err {
            LinAlgError::SingularBlock {
                kind,
                index,
                min_eigenvalue,
            } => {
                let id = match kind {
                    BlockKind::Camera => self.free_cameras.get(index).map(|id| id.to_string()),
                    BlockKind::Point => self.point_ids.get(index).map(|id| id.to_string()),
                };
                format!(
                    "{} is under-constrained (min eigenvalue {min_eigenvalue:.3e})",
                    id.unwrap_or_else(|| format!("{kind} block {index}"))
                )
            }
            _ => err.to_string(),
        }
    }
}

/// Sparse Levenberg-Marquardt bundle adjuster.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjuster {
    config: BundleAdjustmentConfig,
}

impl BundleAdjuster {
    pub fn new(config: BundleAdjustmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    fn build_problem(&self, scene: &Scene) -> PhotogrammetryResult<(Problem, ParameterState)> {
        self.config.check_fixed_cameras(scene)?;

        let mut free_index = BTreeMap::new();
        let mut free_cameras = Vec::new();
        let mut poses = Vec::new();
        for (id, camera) in scene.cameras() {
            if !self.config.fixed_camera_ids.contains(id) {
                free_index.insert(*id, free_cameras.len());
                free_cameras.push(*id);
                poses.push(camera.pose);
            }
        }

        let mut point_index = BTreeMap::new();
        let mut point_ids = Vec::new();
        let mut points = Vec::new();
        let mut blocks = Vec::new();
        let mut point_terms: Vec<Vec<usize>> = Vec::new();
        let mut excluded_observations = 0;

        for obs in scene.observations() {
            let (Some(camera), Some(point)) = (scene.camera(obs.camera_id), scene.point(obs.point_id))
            else {
                continue;
            };
            if !point.is_valid() {
                continue;
            }
            if camera.project(&point.position).is_err() {
                excluded_observations += 1;
                continue;
            }
            let p = *point_index.entry(obs.point_id).or_insert_with(|| {
                point_ids.push(obs.point_id);
                points.push(point.position);
                point_terms.push(Vec::new());
                point_ids.len() - 1
            });
            point_terms[p].push(blocks.len());
            blocks.push(ResidualBlock {
                camera_id: obs.camera_id,
                intrinsics: camera.intrinsics,
                camera: match free_index.get(&obs.camera_id) {
                    Some(&index) => CameraSlot::Free(index),
                    None => CameraSlot::Fixed(camera.pose),
                },
                point: p,
                pixel: obs.pixel,
                weight: obs.weight,
            });
        }

        if excluded_observations > 0 {
            warn!(
                "Bundle adjustment: {} observations excluded (point behind camera)",
                excluded_observations
            );
        }

        Ok((
            Problem {
                num_fixed_cameras: scene.num_cameras() - free_cameras.len(),
                free_cameras,
                point_ids,
                blocks,
                point_terms,
                excluded_observations,
            },
            ParameterState { poses, points },
        ))
    }

    fn commit(
        &self,
        scene: &mut Scene,
        problem: &Problem,
        state: &ParameterState,
    ) -> PhotogrammetryResult<()> {
        for (id, pose) in problem.free_cameras.iter().zip(&state.poses) {
            scene.set_camera_pose(*id, *pose)?;
        }
        for (id, position) in problem.point_ids.iter().zip(&state.points) {
            scene.set_point_position(*id, *position)?;
        }
        Ok(())
    }

    /// Refine free camera poses and valid points of the scene in place.
    ///
    /// Returns `Err` only for malformed input. Every other way of stopping is
    /// reported through [`BundleAdjustmentSummary::termination`]; use
    /// [`BundleAdjustmentSummary::into_result`] to treat non-convergence as an error.
    pub fn optimize(&self, scene: &mut Scene) -> PhotogrammetryResult<BundleAdjustmentSummary> {
        self.config.validate()?;
        let start_time = Instant::now();
        let (problem, mut state) = self.build_problem(scene)?;
        let parallel = self.config.parallel;
        let solver = SchurComplementSolver::new().with_parallel(parallel);

        info!(
            "Bundle adjustment: {} free cameras, {} fixed, {} points, {} observations",
            problem.free_cameras.len(),
            problem.num_fixed_cameras,
            problem.point_ids.len(),
            problem.blocks.len()
        );

        let initial_cost = problem.cost(&state, parallel);
        if !initial_cost.is_finite() {
            return Err(PhotogrammetryError::NumericalOverflow(format!(
                "initial cost is not finite ({initial_cost})"
            )));
        }

        let mut current_cost = initial_cost;
        let mut lambda = self.config.initial_lambda;
        let mut trace = Vec::new();
        let mut iteration = 0;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut message = None;

        let termination = 'outer: loop {
            if current_cost <= f64::MIN_POSITIVE || problem.blocks.is_empty() {
                break TerminationReason::CostTolerance;
            }
            if iteration >= self.config.max_iterations {
                break TerminationReason::MaxIterations;
            }
            if let Some(timeout) = self.config.timeout
                && start_time.elapsed() >= timeout
            {
                break TerminationReason::Timeout;
            }

            let terms = problem.linearize(&state, parallel)?;
            let system = BlockSystem::assemble(
                problem.free_cameras.len(),
                &problem.point_terms,
                &terms,
                parallel,
            )?;

            if !system.is_finite() {
                message = Some(format!(
                    "non-finite normal equations at iteration {iteration}"
                ));
                break TerminationReason::NumericalOverflow;
            }

            let mut rejections = 0;
            loop {
                // `Some` when the damped system could not be factored.
                let singular = match solver.solve(&system, lambda, self.config.damping) {
                    Err(err @ LinAlgError::SingularBlock { .. }) => {
                        debug!("Iteration {iteration}: singular system at lambda {lambda:.3e}");
                        trace.push(IterationRecord {
                            iteration,
                            cost: current_cost,
                            lambda,
                            step_norm: f64::NAN,
                            accepted: false,
                        });
                        Some(err)
                    }
                    Err(err) => return Err(err.into()),
                    Ok(update) => {
                        let step_norm = update.norm();
                        if !update.is_finite() {
                            message = Some(format!(
                                "non-finite step at iteration {iteration} (lambda {lambda:.3e})"
                            ));
                            break 'outer TerminationReason::NumericalOverflow;
                        }

                        let trial = state.apply(&update);
                        let new_cost = problem.cost(&trial, parallel);
                        if new_cost.is_nan() {
                            message = Some(format!(
                                "non-finite cost at iteration {iteration} (lambda {lambda:.3e})"
                            ));
                            break 'outer TerminationReason::NumericalOverflow;
                        }

                        let accepted = new_cost < current_cost;
                        trace.push(IterationRecord {
                            iteration,
                            cost: new_cost,
                            lambda,
                            step_norm,
                            accepted,
                        });
                        debug!(
                            "Iteration {}: cost = {:.6e}, lambda = {:.3e}, step_norm = {:.3e} [{}]",
                            iteration,
                            new_cost,
                            lambda,
                            step_norm,
                            if accepted { "ACCEPTED" } else { "REJECTED" }
                        );

                        if accepted {
                            let converging =
                                !damping_dominates(lambda, self.config.damping, &system);
                            let relative_decrease = (current_cost - new_cost) / current_cost;
                            state = trial;
                            current_cost = new_cost;
                            successful_steps += 1;
                            self.commit(scene, &problem, &state)?;
                            lambda = (lambda / self.config.lambda_down_factor).max(LAMBDA_FLOOR);
                            iteration += 1;
                            // Step and cost tolerances only count for accepted steps
                            // taken with the curvature in charge.
                            if converging && step_norm < self.config.step_tolerance {
                                break 'outer TerminationReason::StepTolerance;
                            }
                            if converging && relative_decrease < self.config.cost_tolerance {
                                break 'outer TerminationReason::CostTolerance;
                            }
                            break;
                        }
                        None
                    }
                };

                unsuccessful_steps += 1;
                rejections += 1;
                lambda *= self.config.lambda_up_factor;
                if lambda > self.config.lambda_ceiling
                    || rejections >= self.config.max_consecutive_rejections
                {
                    iteration += 1;
                    break 'outer match singular {
                        Some(err) => {
                            message = Some(problem.describe_block(&err));
                            TerminationReason::RankDeficient
                        }
                        None => {
                            message = Some(format!(
                                "no descent step after {rejections} consecutive rejections (lambda {lambda:.3e})"
                            ));
                            TerminationReason::Stalled
                        }
                    };
                }
            }
        };

        let summary = BundleAdjustmentSummary {
            initial_cost,
            final_cost: current_cost,
            initial_rms: problem.rms(initial_cost),
            final_rms: problem.rms(current_cost),
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            final_lambda: lambda,
            termination,
            message,
            num_free_cameras: problem.free_cameras.len(),
            num_fixed_cameras: problem.num_fixed_cameras,
            num_points: problem.point_ids.len(),
            num_observations: problem.blocks.len(),
            excluded_observations: problem.excluded_observations,
            trace,
            total_time: start_time.elapsed(),
        };

        if summary.is_converged() {
            info!(
                "Bundle adjustment converged after {} iterations: cost {:.6e} -> {:.6e}, RMS {:.4} -> {:.4} px",
                summary.iterations,
                summary.initial_cost,
                summary.final_cost,
                summary.initial_rms,
                summary.final_rms
            );
        } else {
            warn!(
                "Bundle adjustment stopped: {} after {} iterations{}",
                summary.termination,
                summary.iterations,
                summary
                    .message
                    .as_ref()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default()
            );
        }
        Ok(summary)
    }
}

/// Whether the damping term outweighs the curvature on every diagonal entry.
///
/// Steps taken in that regime are shrunk by λ, so their size says nothing
/// about how close the state is to a minimum.
fn damping_dominates(lambda: f64, damping: Damping, system: &BlockSystem) -> bool {
    match damping {
        Damping::Marquardt => lambda > 1.0,
        Damping::Identity => lambda > system.max_diagonal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intersection::{IntersectionConfig, intersect_scene};
    use crate::scene::SyntheticSceneBuilder;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn noisy_scene() -> PhotogrammetryResult<Scene> {
        let mut scene = SyntheticSceneBuilder::new()
            .with_points(30)
            .with_pose_noise(0.05, 0.5)
            .generate()?
            .scene;
        intersect_scene(&mut scene, &IntersectionConfig::default())?;
        Ok(scene)
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = BundleAdjustmentConfig::default();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.damping, Damping::Marquardt);
        assert!(config.validate().is_ok());
        assert!(config.clone().with_lambda_factors(1.0, 10.0).validate().is_err());
        assert!(config.clone().with_max_iterations(0).validate().is_err());
        assert!(config.clone().with_lambda_ceiling(1e-4).validate().is_err());
        assert!(config.with_cost_tolerance(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_requires_fixed_camera() -> TestResult {
        let mut scene = noisy_scene()?;
        let before = scene.clone();
        let result = BundleAdjuster::new(BundleAdjustmentConfig::new()).optimize(&mut scene);
        assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
        assert_eq!(scene, before);

        let config = BundleAdjustmentConfig::new().with_fixed_camera(CameraId(99));
        let result = BundleAdjuster::new(config).optimize(&mut scene);
        assert!(matches!(result, Err(PhotogrammetryError::MalformedInput(_))));
        Ok(())
    }

    #[test]
    fn test_reduces_cost_and_commits() -> TestResult {
        let mut scene = noisy_scene()?;
        let before = scene.clone();
        let config = BundleAdjustmentConfig::new().with_fixed_camera(CameraId(0));
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;

        assert!(summary.is_converged(), "{summary}");
        assert!(summary.final_cost < summary.initial_cost);
        assert_eq!(summary.num_free_cameras, 4);
        assert_eq!(summary.num_fixed_cameras, 1);
        assert_eq!(
            scene.camera(CameraId(0)).map(|c| c.pose),
            before.camera(CameraId(0)).map(|c| c.pose)
        );
        assert_ne!(
            scene.camera(CameraId(1)).map(|c| c.pose),
            before.camera(CameraId(1)).map(|c| c.pose)
        );
        for camera in scene.cameras().values() {
            assert!(camera.pose.is_valid(1e-9));
        }
        Ok(())
    }

    #[test]
    fn test_sequential_matches_parallel() -> TestResult {
        let config = BundleAdjustmentConfig::new().with_fixed_camera(CameraId(0));
        let mut a = noisy_scene()?;
        let mut b = a.clone();
        let sa = BundleAdjuster::new(config.clone()).optimize(&mut a)?;
        let sb = BundleAdjuster::new(config.with_parallel(false)).optimize(&mut b)?;
        assert!((sa.final_cost - sb.final_cost).abs() <= 1e-4 * sa.final_cost.max(1e-12));
        Ok(())
    }

    #[test]
    fn test_identity_damping_converges() -> TestResult {
        let mut scene = noisy_scene()?;
        let config = BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_damping(Damping::Identity);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;
        assert!(summary.final_cost < summary.initial_cost);
        Ok(())
    }

    #[test]
    fn test_iteration_budget() -> TestResult {
        let mut scene = noisy_scene()?;
        let config = BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_max_iterations(1)
            .with_cost_tolerance(0.0)
            .with_step_tolerance(0.0);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;
        assert_eq!(summary.termination, TerminationReason::MaxIterations);
        assert_eq!(summary.iterations, 1);
        assert!(matches!(
            summary.into_result(),
            Err(PhotogrammetryError::MaxIterationsExceeded { iterations: 1 })
        ));
        Ok(())
    }

    #[test]
    fn test_zero_timeout() -> TestResult {
        let mut scene = noisy_scene()?;
        let before = scene.clone();
        let config = BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_timeout(Duration::ZERO);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;
        assert_eq!(summary.termination, TerminationReason::Timeout);
        assert_eq!(summary.iterations, 0);
        assert_eq!(scene, before);
        Ok(())
    }

    #[test]
    fn test_unobserved_free_camera_is_rank_deficient() -> TestResult {
        use crate::geometry::Pose;
        use crate::scene::InMemorySceneBuilder;

        let synthetic = SyntheticSceneBuilder::new().with_points(20).generate()?;
        let mut builder = InMemorySceneBuilder::new();
        for camera in synthetic.scene.cameras().values() {
            builder.add_camera(camera.id, camera.pose, camera.intrinsics);
        }
        // A free camera without observations leaves its block unconstrained.
        let lonely = synthetic.scene.camera(CameraId(0)).ok_or("missing camera")?;
        builder.add_camera(CameraId(9), Pose::identity(), lonely.intrinsics);
        for (id, truth) in &synthetic.ground_truth_points {
            builder.add_point(*id, *truth);
        }
        for obs in synthetic.scene.observations() {
            builder.add_observation(obs.camera_id, obs.point_id, obs.pixel);
        }
        let mut scene = builder.build()?;

        let config = BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_damping(Damping::Marquardt);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;
        assert_eq!(summary.termination, TerminationReason::RankDeficient);
        let message = summary.message.clone().unwrap_or_default();
        assert!(message.contains("camera 9"), "{message}");
        assert!(matches!(
            summary.into_result(),
            Err(PhotogrammetryError::RankDeficient(_))
        ));
        Ok(())
    }

    #[test]
    fn test_heavily_damped_start_still_makes_progress() -> TestResult {
        let mut scene = noisy_scene()?;
        let config = BundleAdjustmentConfig::new()
            .with_fixed_camera(CameraId(0))
            .with_initial_lambda(1e8)
            .with_lambda_ceiling(1e12);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;

        assert!(summary.is_converged(), "{summary}");
        assert!(summary.iterations > 8, "{summary}");
        assert!(summary.final_rms < 0.5 * summary.initial_rms, "{summary}");
        // The converging step was taken once λ no longer dominated.
        let last_accepted = summary
            .trace
            .iter()
            .rev()
            .find(|r| r.accepted)
            .ok_or("no accepted step")?;
        assert!(last_accepted.lambda <= 1.0, "{last_accepted:?}");
        Ok(())
    }

    /// Two fixed cameras straddling a point whose vertical residuals cancel,
    /// so the point already sits at the least-squares optimum.
    fn balanced_point_scene() -> PhotogrammetryResult<Scene> {
        use crate::geometry::{Camera, Intrinsics, Pose};
        use crate::scene::InMemorySceneBuilder;
        use nalgebra::UnitQuaternion;

        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
            distortion: Default::default(),
        };
        let point = Vector3::new(0.0, 0.0, 5.0);
        let mut builder = InMemorySceneBuilder::new();
        builder.add_point(PointId(0), point);
        for (id, x, dv) in [(0, -1.0, 4.0), (1, 1.0, -4.0)] {
            let pose = Pose::from_center(UnitQuaternion::identity(), &Vector3::new(x, 0.0, 0.0));
            let camera = Camera::new(CameraId(id), pose, intrinsics);
            let pixel = camera.project(&point)? + Vector2::new(0.0, dv);
            builder.add_camera(camera.id, pose, intrinsics);
            builder.add_observation(camera.id, PointId(0), pixel);
        }
        builder.build()
    }

    #[test]
    fn test_rejected_tiny_step_is_stalled_not_converged() -> TestResult {
        let mut scene = balanced_point_scene()?;
        let before = scene.clone();
        let config = BundleAdjustmentConfig::new()
            .with_fixed_cameras([CameraId(0), CameraId(1)])
            .with_max_consecutive_rejections(1);
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;

        assert_eq!(summary.termination, TerminationReason::Stalled, "{summary}");
        assert!(!summary.is_converged());
        assert_eq!(summary.successful_steps, 0);
        assert_eq!(summary.unsuccessful_steps, 1);
        assert!(summary.trace.iter().all(|r| r.step_norm < 1e-8 && !r.accepted));
        assert_eq!(summary.final_cost, summary.initial_cost);
        assert_eq!(scene, before);
        assert!(matches!(
            summary.into_result(),
            Err(PhotogrammetryError::Stalled(_))
        ));
        Ok(())
    }

    #[test]
    fn test_overflowing_normal_equations_are_reported() -> TestResult {
        use crate::scene::InMemorySceneBuilder;

        let synthetic = SyntheticSceneBuilder::new()
            .with_points(20)
            .with_pose_noise(0.01, 0.1)
            .generate()?;
        let mut builder = InMemorySceneBuilder::new();
        for camera in synthetic.scene.cameras().values() {
            builder.add_camera(camera.id, camera.pose, camera.intrinsics);
        }
        for (id, truth) in &synthetic.ground_truth_points {
            builder.add_point(*id, *truth);
        }
        let mut heavy = None;
        for obs in synthetic.scene.observations() {
            // One observation of a free camera gets a weight whose cost stays
            // finite but whose rotational curvature overflows.
            if heavy.is_none() && obs.camera_id == CameraId(1) {
                heavy = Some(obs.point_id);
                builder.add_weighted_observation(obs.camera_id, obs.point_id, obs.pixel, 1e303);
            } else {
                builder.add_observation(obs.camera_id, obs.point_id, obs.pixel);
            }
        }
        assert!(heavy.is_some());
        let mut scene = builder.build()?;
        let before = scene.clone();

        let config = BundleAdjustmentConfig::new().with_fixed_camera(CameraId(0));
        let summary = BundleAdjuster::new(config).optimize(&mut scene)?;

        assert!(summary.initial_cost.is_finite());
        assert_eq!(summary.termination, TerminationReason::NumericalOverflow, "{summary}");
        assert!(summary.message.as_deref().is_some_and(|m| m.contains("non-finite")));
        assert_eq!(scene, before);
        assert!(matches!(
            summary.into_result(),
            Err(PhotogrammetryError::NumericalOverflow(_))
        ));
        Ok(())
    }

}
