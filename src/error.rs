//! Errors reported by assembly and analysis.
use crate::grad_verify::GradientReport;
use std::error::Error;
use std::fmt;
use trellis_optimize::newton::NewtonError;
use trellis_sparse::krylov::{SolveError, SolveErrorKind};
use trellis_sparse::multigrid::MultigridError;
use trellis_sparse::PatternError;
use trellis_traits::{to_f64, Real};

#[derive(Debug)]
pub enum AnalysisError {
    /// The connectivity is inconsistent with the partition or the sparsity pattern.
    Pattern(PatternError),
    /// An element evaluation failed. The pass was aborted on every rank and no output was
    /// modified.
    ElementEvaluation { element: usize, message: String },
    /// A linear or nonlinear solver exhausted its iteration budget.
    ConvergenceFailure {
        solver: &'static str,
        iterations: usize,
        residual_norm: f64,
    },
    /// Adjoint and finite difference gradients disagree.
    GradientMismatch(GradientReport),
    /// Any other failure of a linear solver or preconditioner.
    Solver(String),
    /// The model or its settings are inconsistent.
    InvalidModel(String),
}

impl AnalysisError {
    pub(crate) fn from_solve_error<T: Real>(solver: &'static str, err: SolveError<T>) -> Self {
        match err.kind {
            SolveErrorKind::MaxIterationsReached { max_iter } => Self::ConvergenceFailure {
                solver,
                iterations: max_iter,
                residual_norm: to_f64(err.output.residual_norm),
            },
            _ => Self::Solver(format!("{} failed: {}", solver, err)),
        }
    }

    /// Whether a driver may recover from the error, for example by reducing the step size.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ElementEvaluation { .. } | Self::ConvergenceFailure { .. } | Self::Solver(_)
        )
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(err) => write!(f, "Invalid sparsity pattern: {}", err),
            Self::ElementEvaluation { element, message } => {
                write!(f, "Evaluation of element {} failed: {}", element, message)
            }
            Self::ConvergenceFailure {
                solver,
                iterations,
                residual_norm,
            } => write!(
                f,
                "{} failed to converge within {} iterations (residual norm {:e}).",
                solver, iterations, residual_norm
            ),
            Self::GradientMismatch(report) => write!(
                f,
                "Adjoint gradient does not match finite differences in {} of {} entries.",
                report.mismatches().count(),
                report.entries.len()
            ),
            Self::Solver(message) => write!(f, "{}", message),
            Self::InvalidModel(message) => write!(f, "Invalid model: {}", message),
        }
    }
}

impl Error for AnalysisError {}

impl From<PatternError> for AnalysisError {
    fn from(err: PatternError) -> Self {
        Self::Pattern(err)
    }
}

impl From<MultigridError> for AnalysisError {
    fn from(err: MultigridError) -> Self {
        match err {
            MultigridError::Pattern(err) => Self::Pattern(err),
            other => Self::Solver(other.to_string()),
        }
    }
}

impl<T: Real> From<NewtonError<T, AnalysisError>> for AnalysisError {
    fn from(err: NewtonError<T, AnalysisError>) -> Self {
        match err {
            NewtonError::MaximumIterationsReached {
                iterations,
                residual_norm,
            } => Self::ConvergenceFailure {
                solver: "Newton",
                iterations,
                residual_norm: to_f64(residual_norm),
            },
            NewtonError::AssemblyError(err) | NewtonError::JacobianError(err) => err,
            NewtonError::LineSearchError { residual_norm, .. } => Self::ConvergenceFailure {
                solver: "Line search",
                iterations: 0,
                residual_norm: to_f64(residual_norm),
            },
        }
    }
}
