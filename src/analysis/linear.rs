use crate::error::AnalysisError;
use log::debug;
use serde::{Deserialize, Serialize};
use trellis_sparse::cg::{CgWorkspace, ConjugateGradient};
use trellis_sparse::gmres::Gmres;
use trellis_sparse::krylov::{
    IdentityOperator, JacobiPreconditioner, LinearOperator, RelativeResidualCriterion, SolveOutput,
};
use trellis_sparse::multigrid::{MultigridHierarchy, MultigridSettings};
use trellis_sparse::{BlockCyclicMatrix, DistVector};
use trellis_traits::{from_f64, to_f64, Real};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrylovMethod {
    /// Conjugate gradient, for symmetric positive definite systems.
    Cg,
    /// Restarted GMRES with the given restart length.
    Gmres { restart: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreconditionerKind {
    None,
    Jacobi,
    Multigrid(MultigridSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub method: KrylovMethod,
    pub preconditioner: PreconditionerKind,
    /// Relative residual tolerance.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Apply the fine level operator by element contraction instead of the assembled matrix.
    ///
    /// The matrix is still assembled for the preconditioner.
    pub matrix_free: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            method: KrylovMethod::Cg,
            preconditioner: PreconditionerKind::Multigrid(MultigridSettings::default()),
            tolerance: 1e-10,
            max_iterations: 1000,
            matrix_free: false,
        }
    }
}

/// A Krylov method together with the preconditioner state it reuses across solves.
///
/// The multigrid hierarchy is built on the first call to [`prepare`](Self::prepare) and only
/// refreshed afterwards, since the sparsity pattern does not change between assemblies.
#[derive(Debug)]
pub struct LinearSolver<T: Real> {
    settings: SolverSettings,
    hierarchy: Option<MultigridHierarchy<T>>,
    jacobi: Option<JacobiPreconditioner<T>>,
    workspace: CgWorkspace<T>,
}

impl<T: Real> LinearSolver<T> {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            hierarchy: None,
            jacobi: None,
            workspace: CgWorkspace::default(),
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Updates the preconditioner for a newly assembled matrix. This is a collective operation.
    pub fn prepare(&mut self, matrix: &BlockCyclicMatrix<T>) -> Result<(), AnalysisError> {
        match &self.settings.preconditioner {
            PreconditionerKind::None => {}
            PreconditionerKind::Jacobi => self.jacobi = Some(JacobiPreconditioner::from_matrix(matrix)),
            PreconditionerKind::Multigrid(settings) => match &mut self.hierarchy {
                Some(hierarchy) => hierarchy.update(matrix)?,
                None => {
                    let hierarchy = MultigridHierarchy::build(matrix, settings.clone())?;
                    debug!("Built multigrid hierarchy with {} levels", hierarchy.num_levels());
                    self.hierarchy = Some(hierarchy);
                }
            },
        }
        Ok(())
    }

    fn unprepared() -> AnalysisError {
        AnalysisError::Solver("Preconditioner used before it was prepared.".to_string())
    }

    /// Solves `A x = b` with `x` as initial guess. This is a collective operation.
    ///
    /// `operator` must represent the matrix last passed to [`prepare`](Self::prepare).
    pub fn solve(
        &mut self,
        operator: &dyn LinearOperator<T>,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
    ) -> Result<SolveOutput<T>, AnalysisError> {
        self.solve_with(operator, b, x, false)
    }

    /// Solves `A^T x = b`, where `operator` applies the transpose of the prepared matrix.
    ///
    /// Uses GMRES unless conjugate gradient was configured, which assumes a symmetric matrix.
    pub fn solve_transposed(
        &mut self,
        operator: &dyn LinearOperator<T>,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
    ) -> Result<SolveOutput<T>, AnalysisError> {
        self.solve_with(operator, b, x, true)
    }

    fn solve_with(
        &mut self,
        operator: &dyn LinearOperator<T>,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
        transposed: bool,
    ) -> Result<SolveOutput<T>, AnalysisError> {
        let multigrid;
        let preconditioner: &dyn LinearOperator<T> = match &self.settings.preconditioner {
            PreconditionerKind::None => &IdentityOperator,
            PreconditionerKind::Jacobi => self.jacobi.as_ref().ok_or_else(Self::unprepared)?,
            PreconditionerKind::Multigrid(_) => {
                let hierarchy = self.hierarchy.as_ref().ok_or_else(Self::unprepared)?;
                multigrid = if transposed {
                    hierarchy.transposed_preconditioner(operator)
                } else {
                    hierarchy.preconditioner(operator)
                };
                &multigrid
            }
        };

        let criterion = RelativeResidualCriterion::new(from_f64::<T>(self.settings.tolerance));
        let max_iter = self.settings.max_iterations;
        let (name, result) = match self.settings.method {
            KrylovMethod::Cg => (
                "Conjugate gradient",
                ConjugateGradient::with_workspace(&mut self.workspace)
                    .with_operator(operator)
                    .with_preconditioner(preconditioner)
                    .with_stopping_criterion(criterion)
                    .with_max_iter(max_iter)
                    .solve_with_guess(b, x),
            ),
            KrylovMethod::Gmres { restart } => (
                "GMRES",
                Gmres::new(criterion)
                    .with_operator(operator)
                    .with_preconditioner(preconditioner)
                    .with_restart(restart)
                    .with_max_iter(max_iter)
                    .solve_with_guess(b, x),
            ),
        };

        match result {
            Ok(output) => {
                debug!(
                    "{} converged in {} iterations (residual norm {:e})",
                    name,
                    output.num_iterations,
                    to_f64(output.residual_norm)
                );
                Ok(output)
            }
            Err(err) => Err(AnalysisError::from_solve_error(name, err)),
        }
    }
}
