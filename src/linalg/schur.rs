//! Explicit Schur complement solver for bundle adjustment normal equations.
//!
//! # Mathematical Background
//!
//! With camera parameters `c` and point parameters `p`, the damped normal
//! equations have the block structure
//!
//! ```text
//! [ U   W ] [δc]   [b_c]
//! [ Wᵀ  V ] [δp] = [b_p]
//! ```
//!
//! where `U` is block diagonal with one 6×6 block per free camera, `V` is block
//! diagonal with one 3×3 block per point and `W` holds a 6×3 coupling for every
//! (free camera, point) observation. Eliminating `δp` gives the reduced camera
//! system
//!
//! ```text
//! S    = U - W V⁻¹ Wᵀ
//! b_r  = b_c - W V⁻¹ b_p
//! S δc = b_r
//! δp   = V⁻¹ (b_p - Wᵀ δc)
//! ```
//!
//! `S` has size `6·n_c`, which is small compared to the full system, and is
//! solved with a sparse Cholesky factorization. Point blocks are processed
//! independently, so elimination and back-substitution run in parallel over
//! points. `S` is filled row strip by row strip, one strip per free camera.

use super::{BlockKind, Damping, LinAlgError, LinAlgResult};
use faer::sparse::{SparseColMat, Triplet};
use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Matrix6, Matrix6x3, SMatrix, Vector2, Vector3, Vector6};
use rayon::prelude::*;
use tracing::debug;

/// Relative eigenvalue below which a block counts as singular.
const MIN_RELATIVE_EIGENVALUE: f64 = 1e-14;

/// Linearized contribution of a single observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTerm {
    /// Index among the free cameras, `None` for fixed cameras
    pub camera: Option<usize>,
    /// Index among the optimized points
    pub point: usize,
    /// `∂proj/∂[δt; δω]`
    pub jac_camera: SMatrix<f64, 2, 6>,
    /// `∂proj/∂p_w`
    pub jac_point: Matrix2x3<f64>,
    /// `observed - projected`
    pub residual: Vector2<f64>,
    pub weight: f64,
}

/// Undamped block normal equations `JᵀWJ δ = JᵀW r`.
#[derive(Debug, Clone)]
pub struct BlockSystem {
    pub camera_blocks: Vec<Matrix6<f64>>,
    pub camera_gradients: Vec<Vector6<f64>>,
    pub point_blocks: Vec<Matrix3<f64>>,
    pub point_gradients: Vec<Vector3<f64>>,
    /// Per point: (free camera index, `W` block)
    pub couplings: Vec<Vec<(usize, Matrix6x3<f64>)>>,
}

/// Solution of the damped system, split per block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockUpdate {
    pub cameras: Vec<Vector6<f64>>,
    pub points: Vec<Vector3<f64>>,
}

impl BlockUpdate {
    pub fn norm(&self) -> f64 {
        let squared: f64 = self.cameras.iter().map(|c| c.norm_squared()).sum::<f64>()
            + self.points.iter().map(|p| p.norm_squared()).sum::<f64>();
        squared.sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.cameras.iter().all(|c| c.iter().all(|v| v.is_finite()))
            && self.points.iter().all(|p| p.iter().all(|v| v.is_finite()))
    }
}

impl BlockSystem {
    /// Accumulate the normal equations from per-observation terms.
    ///
    /// `point_terms[p]` lists the indices into `terms` that observe point `p`.
    pub fn assemble(
        num_cameras: usize,
        point_terms: &[Vec<usize>],
        terms: &[ObservationTerm],
        parallel: bool,
    ) -> LinAlgResult<Self> {
        if let Some(bad) = terms.iter().find(|t| {
            t.point >= point_terms.len() || t.camera.is_some_and(|c| c >= num_cameras)
        }) {
            return Err(LinAlgError::InvalidInput(format!(
                "observation term references camera {:?} / point {} outside the system",
                bad.camera, bad.point
            )));
        }

        let point_block = |indices: &Vec<usize>| {
            let mut v = Matrix3::zeros();
            let mut b = Vector3::zeros();
            let mut couplings = Vec::with_capacity(indices.len());
            for &k in indices {
                let t = &terms[k];
                let jp_w = t.jac_point.transpose() * t.weight;
                v += jp_w * t.jac_point;
                b += jp_w * t.residual;
                if let Some(c) = t.camera {
                    couplings.push((c, t.jac_camera.transpose() * t.weight * t.jac_point));
                }
            }
            (v, b, couplings)
        };

        let per_point: Vec<(Matrix3<f64>, Vector3<f64>, Vec<(usize, Matrix6x3<f64>)>)> = if parallel {
            point_terms.par_iter().map(point_block).collect()
        } else {
            point_terms.iter().map(point_block).collect()
        };

        let camera_init = || {
            (
                vec![Matrix6::<f64>::zeros(); num_cameras],
                vec![Vector6::<f64>::zeros(); num_cameras],
            )
        };
        let camera_fold = |mut acc: (Vec<Matrix6<f64>>, Vec<Vector6<f64>>), t: &ObservationTerm| {
            if let Some(c) = t.camera {
                let jc_w = t.jac_camera.transpose() * t.weight;
                acc.0[c] += jc_w * t.jac_camera;
                acc.1[c] += jc_w * t.residual;
            }
            acc
        };
        let camera_merge = |mut a: (Vec<Matrix6<f64>>, Vec<Vector6<f64>>),
                            b: (Vec<Matrix6<f64>>, Vec<Vector6<f64>>)| {
            for (lhs, rhs) in a.0.iter_mut().zip(b.0) {
                *lhs += rhs;
            }
            for (lhs, rhs) in a.1.iter_mut().zip(b.1) {
                *lhs += rhs;
            }
            a
        };

        let (camera_blocks, camera_gradients) = if parallel {
            terms
                .par_iter()
                .fold(camera_init, camera_fold)
                .reduce(camera_init, camera_merge)
        } else {
            terms.iter().fold(camera_init(), camera_fold)
        };

        let mut point_blocks = Vec::with_capacity(per_point.len());
        let mut point_gradients = Vec::with_capacity(per_point.len());
        let mut couplings = Vec::with_capacity(per_point.len());
        for (v, b, w) in per_point {
            point_blocks.push(v);
            point_gradients.push(b);
            couplings.push(w);
        }

        Ok(Self {
            camera_blocks,
            camera_gradients,
            point_blocks,
            point_gradients,
            couplings,
        })
    }

    pub fn num_cameras(&self) -> usize {
        self.camera_blocks.len()
    }

    /// Largest diagonal entry of `JᵀWJ`.
    pub fn max_diagonal(&self) -> f64 {
        let cameras = self
            .camera_blocks
            .iter()
            .flat_map(|m| (0..6).map(move |i| m[(i, i)]));
        let points = self
            .point_blocks
            .iter()
            .flat_map(|m| (0..3).map(move |i| m[(i, i)]));
        cameras.chain(points).fold(0.0, f64::max)
    }

    /// Whether every block and gradient is finite.
    pub fn is_finite(&self) -> bool {
        let finite = |values: &[f64]| values.iter().all(|v| v.is_finite());
        self.camera_blocks.iter().all(|m| finite(m.as_slice()))
            && self.camera_gradients.iter().all(|g| finite(g.as_slice()))
            && self.point_blocks.iter().all(|m| finite(m.as_slice()))
            && self.point_gradients.iter().all(|g| finite(g.as_slice()))
            && self
                .couplings
                .iter()
                .flatten()
                .all(|(_, w)| finite(w.as_slice()))
    }

    pub fn num_points(&self) -> usize {
        self.point_blocks.len()
    }
}

fn damp<const D: usize>(
    block: &SMatrix<f64, D, D>,
    lambda: f64,
    damping: Damping,
) -> SMatrix<f64, D, D> {
    let mut damped = *block;
    for i in 0..D {
        let scale = match damping {
            // Zero diagonals stay zero: an unconstrained block must remain singular.
            Damping::Marquardt => block[(i, i)],
            Damping::Identity => 1.0,
        };
        damped[(i, i)] += lambda * scale;
    }
    damped
}

/// Dense reduced camera system accumulated over points.
struct ReducedSystem {
    s: DMatrix<f64>,
    rhs: DVector<f64>,
}

impl ReducedSystem {
    fn zeros(dim: usize) -> Self {
        Self {
            s: DMatrix::zeros(dim, dim),
            rhs: DVector::zeros(dim),
        }
    }
}

/// Schur complement solver over a [`BlockSystem`].
#[derive(Debug, Clone)]
pub struct SchurComplementSolver {
    parallel: bool,
}

impl Default for SchurComplementSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SchurComplementSolver {
    pub fn new() -> Self {
        Self { parallel: true }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Solve `(H + λD) δ = b` for the camera and point updates.
    pub fn solve(
        &self,
        system: &BlockSystem,
        lambda: f64,
        damping: Damping,
    ) -> LinAlgResult<BlockUpdate> {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(LinAlgError::InvalidInput(format!(
                "damping must be finite and non-negative, got {lambda}"
            )));
        }

        let v_inv = self.invert_point_blocks(system, lambda, damping)?;

        let num_cameras = system.num_cameras();
        let delta_c = if num_cameras == 0 {
            Vec::new()
        } else {
            let reduced = self.reduce(system, &v_inv, lambda, damping);
            self.solve_reduced(&reduced, num_cameras)?
        };

        let back_substitute = |p: usize| {
            let mut rhs = system.point_gradients[p];
            for (c, w) in &system.couplings[p] {
                rhs -= w.transpose() * delta_c[*c];
            }
            v_inv[p] * rhs
        };
        let points: Vec<Vector3<f64>> = if self.parallel {
            (0..system.num_points())
                .into_par_iter()
                .map(back_substitute)
                .collect()
        } else {
            (0..system.num_points()).map(back_substitute).collect()
        };

        Ok(BlockUpdate {
            cameras: delta_c,
            points,
        })
    }

    /// Invert every damped 3×3 point block, failing on the first singular one.
    fn invert_point_blocks(
        &self,
        system: &BlockSystem,
        lambda: f64,
        damping: Damping,
    ) -> LinAlgResult<Vec<Matrix3<f64>>> {
        let invert = |(index, block): (usize, &Matrix3<f64>)| {
            let damped = damp(block, lambda, damping);
            let eigenvalues = damped.symmetric_eigenvalues();
            let min_ev = eigenvalues.min();
            let max_ev = eigenvalues.max();
            let singular = LinAlgError::SingularBlock {
                kind: BlockKind::Point,
                index,
                min_eigenvalue: min_ev,
            };
            if !min_ev.is_finite() || min_ev <= max_ev.abs() * MIN_RELATIVE_EIGENVALUE || max_ev <= 0.0 {
                return Err(singular);
            }
            damped.try_inverse().ok_or(singular)
        };

        if self.parallel {
            system.point_blocks.par_iter().enumerate().map(invert).collect()
        } else {
            system.point_blocks.iter().enumerate().map(invert).collect()
        }
    }

    /// Build `S = U - W V⁻¹ Wᵀ` and `b_r = b_c - W V⁻¹ b_p`.
    ///
    /// Every free camera owns one 6-row strip of `S`, so strips are filled
    /// independently from a camera-to-point index and copied into place.
    fn reduce(
        &self,
        system: &BlockSystem,
        v_inv: &[Matrix3<f64>],
        lambda: f64,
        damping: Damping,
    ) -> ReducedSystem {
        let num_cameras = system.num_cameras();
        let dim = num_cameras * 6;

        // (point, coupling slot) pairs seen by each camera
        let mut camera_points: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_cameras];
        for (p, couplings) in system.couplings.iter().enumerate() {
            for (k, (c, _)) in couplings.iter().enumerate() {
                camera_points[*c].push((p, k));
            }
        }

        let camera_strip = |ci: usize| {
            let mut strip = DMatrix::<f64>::zeros(6, dim);
            strip
                .fixed_view_mut::<6, 6>(0, ci * 6)
                .copy_from(&damp(&system.camera_blocks[ci], lambda, damping));
            let mut rhs = system.camera_gradients[ci];
            for &(p, k) in &camera_points[ci] {
                let couplings = &system.couplings[p];
                let t_i = couplings[k].1 * v_inv[p];
                rhs -= t_i * system.point_gradients[p];
                for (cj, wj) in couplings {
                    let mut block = strip.fixed_view_mut::<6, 6>(0, cj * 6);
                    block -= t_i * wj.transpose();
                }
            }
            (strip, rhs)
        };

        let strips: Vec<(DMatrix<f64>, Vector6<f64>)> = if self.parallel {
            (0..num_cameras).into_par_iter().map(camera_strip).collect()
        } else {
            (0..num_cameras).map(camera_strip).collect()
        };

        let mut reduced = ReducedSystem::zeros(dim);
        for (ci, (strip, rhs)) in strips.into_iter().enumerate() {
            reduced.s.rows_mut(ci * 6, 6).copy_from(&strip);
            reduced.rhs.fixed_rows_mut::<6>(ci * 6).copy_from(&rhs);
        }

        // Floating point accumulation order leaves S slightly asymmetric.
        let symmetric = (&reduced.s + reduced.s.transpose()) * 0.5;
        reduced.s = symmetric;
        reduced
    }

    /// Factorize the reduced camera system and solve for the camera updates.
    fn solve_reduced(
        &self,
        reduced: &ReducedSystem,
        num_cameras: usize,
    ) -> LinAlgResult<Vec<Vector6<f64>>> {
        let dim = reduced.s.nrows();
        let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        for col in 0..dim {
            for row in 0..dim {
                let val = reduced.s[(row, col)];
                if val.abs() > 1e-12 || row == col {
                    triplets.push(Triplet::new(row, col, val));
                }
            }
        }
        let s = SparseColMat::try_new_from_triplets(dim, dim, &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("Schur S: {:?}", e)))?;

        let symbolic = SymbolicLlt::try_new(s.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed(format!("Symbolic Cholesky failed: {:?}", e))
        })?;

        let cholesky = match Llt::try_new_with_symbolic(symbolic, s.as_ref(), Side::Lower) {
            Ok(cholesky) => cholesky,
            Err(e) => {
                debug!("Reduced camera system is not positive definite: {:?}", e);
                return Err(weakest_camera_block(&reduced.s, num_cameras));
            }
        };

        let mut rhs = Mat::<f64>::zeros(dim, 1);
        for i in 0..dim {
            rhs[(i, 0)] = reduced.rhs[i];
        }
        let solution = cholesky.solve(&rhs);

        Ok((0..num_cameras)
            .map(|c| Vector6::from_fn(|i, _| solution[(c * 6 + i, 0)]))
            .collect())
    }
}

/// Camera block of `S` with the smallest eigenvalue.
fn weakest_camera_block(s: &DMatrix<f64>, num_cameras: usize) -> LinAlgError {
    let mut weakest = (0, f64::INFINITY);
    for c in 0..num_cameras {
        let block: Matrix6<f64> = s.fixed_view::<6, 6>(c * 6, c * 6).into_owned();
        let min_ev = block.symmetric_eigenvalues().min();
        if min_ev < weakest.1 || !min_ev.is_finite() {
            weakest = (c, min_ev);
        }
    }
    LinAlgError::SingularBlock {
        kind: BlockKind::Camera,
        index: weakest.0,
        min_eigenvalue: weakest.1,
    }
}
