//! Operator abstraction and error types shared by the Krylov solvers.
use crate::block_cyclic::BlockCyclicMatrix;
use crate::vector::{DistVector, Synced};
use core::fmt;
use nalgebra::DVector;
use std::error::Error;
use trellis_traits::{to_f64, Real};

/// A linear map between distributed vectors with the same layout.
///
/// The input is passed as a [`Synced`] token, so its halo is guaranteed to be consistent.
/// Implementations only need to write the owned part of `y`.
pub trait LinearOperator<T: Real> {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Real,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T: Real> LinearOperator<T> for BlockCyclicMatrix<T> {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        self.multiply(&x, y);
        Ok(())
    }
}

/// The transpose of an assembled matrix.
#[derive(Debug, Clone, Copy)]
pub struct Transposed<'a, T: Real>(pub &'a BlockCyclicMatrix<T>);

impl<'a, T: Real> LinearOperator<T> for Transposed<'a, T> {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        self.0.transpose_multiply(x.vector(), y);
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T: Real> LinearOperator<T> for IdentityOperator {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        y.owned_mut().copy_from(&x.vector().owned());
        Ok(())
    }
}

/// Diagonal (Jacobi) preconditioner.
///
/// Zero diagonal entries are skipped, so the corresponding components are passed through
/// unchanged.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner<T: Real> {
    inverse_diagonal: DVector<T>,
}

impl<T: Real> JacobiPreconditioner<T> {
    pub fn from_matrix(matrix: &BlockCyclicMatrix<T>) -> Self {
        let inverse_diagonal = matrix
            .extract_diagonal()
            .map(|d| if d == T::zero() { T::one() } else { T::one() / d });
        Self { inverse_diagonal }
    }
}

impl<T: Real> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        let x = x.vector().owned();
        y.owned_mut()
            .zip_zip_apply(&x, &self.inverse_diagonal, |y_i, x_i, d_i| *y_i = x_i * d_i);
        Ok(())
    }
}

/// Relative residual tolerance ||r|| <= tol * ||b||.
#[derive(Debug, Clone, Copy)]
pub struct RelativeResidualCriterion<T> {
    tol: T,
}

impl<T: Real> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }

    pub fn tolerance(&self) -> T {
        self.tol
    }

    pub fn has_converged(&self, residual_norm: T, b_norm: T) -> bool {
        residual_norm <= self.tol * b_norm
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl Default for RelativeResidualCriterion<f32> {
    fn default() -> Self {
        Self::new(1e-4)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SolveOutput<T> {
    /// Number of iterations of the solver.
    ///
    /// Corresponds to the number of updates made to the (initial) solution vector.
    pub num_iterations: usize,
    /// Norm of the last residual known to the solver.
    pub residual_norm: T,
}

impl<T: Real> SolveOutput<T> {
    pub(crate) fn new() -> Self {
        Self {
            num_iterations: 0,
            residual_norm: T::zero(),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error>),
    PreconditionerError(Box<dyn Error>),
    IndefiniteOperator,
    IndefinitePreconditioner,
    MaxIterationsReached { max_iter: usize },
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "Error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::IndefiniteOperator => write!(f, "Operator appears to be indefinite."),
            Self::IndefinitePreconditioner => write!(f, "Indefinite preconditioner."),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    pub output: SolveOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    pub(crate) fn new(output: SolveOutput<T>, kind: SolveErrorKind) -> Self {
        Self { output, kind }
    }
}

impl<T: Real> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Krylov solve failed after {} iterations (residual norm {:e}). ",
            self.output.num_iterations,
            to_f64(self.output.residual_norm)
        )?;
        write!(f, "Error: {}", self.kind)
    }
}

impl<T: Real> std::error::Error for SolveError<T> {}

/// y = Ax
pub(crate) fn apply_operator<T, A>(y: &mut DistVector<T>, a: &A, x: &mut DistVector<T>) -> Result<(), Box<dyn Error>>
where
    T: Real,
    A: ?Sized + LinearOperator<T>,
{
    a.apply(y, x.synchronize())
}
