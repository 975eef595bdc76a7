//! Preconditioned conjugate gradient for distributed symmetric positive definite systems.
use crate::krylov::{
    apply_operator, IdentityOperator, LinearOperator, RelativeResidualCriterion, SolveError, SolveErrorKind,
    SolveOutput,
};
use crate::layout::VectorLayout;
use crate::vector::DistVector;
use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use trellis_traits::{to_f64, Real};

#[derive(Debug, Clone)]
#[allow(non_snake_case)]
struct Buffers<T: Real> {
    r: DistVector<T>,
    z: DistVector<T>,
    p: DistVector<T>,
    Ap: DistVector<T>,
}

/// Reusable vectors for [`ConjugateGradient`].
#[derive(Debug, Clone)]
pub struct CgWorkspace<T: Real> {
    buffers: Option<Buffers<T>>,
}

impl<T: Real> Default for CgWorkspace<T> {
    fn default() -> Self {
        Self { buffers: None }
    }
}

impl<T: Real> CgWorkspace<T> {
    fn prepare_buffers(&mut self, layout: &Arc<VectorLayout>) -> &mut Buffers<T> {
        let compatible = self
            .buffers
            .as_ref()
            .map(|buffers| buffers.r.layout().is_compatible_with(layout))
            .unwrap_or(false);
        if !compatible {
            self.buffers = Some(Buffers {
                r: DistVector::zeros(layout.clone()),
                z: DistVector::zeros(layout.clone()),
                p: DistVector::zeros(layout.clone()),
                Ap: DistVector::zeros(layout.clone()),
            });
        }
        self.buffers
            .as_mut()
            .expect("buffers were allocated above")
    }
}

#[derive(Debug)]
enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

#[derive(Debug)]
pub struct ConjugateGradient<'a, T, A, P, Criterion>
where
    T: Real,
{
    workspace: OwnedOrMutRef<'a, CgWorkspace<T>>,
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    max_iter: Option<usize>,
}

impl<'a, T: Real> ConjugateGradient<'a, T, (), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            workspace: OwnedOrMutRef::Owned(CgWorkspace::default()),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }

    pub fn with_workspace(workspace: &'a mut CgWorkspace<T>) -> Self {
        Self {
            workspace: OwnedOrMutRef::MutRef(workspace),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl<'a, T: Real, P, Criterion> ConjugateGradient<'a, T, (), P, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> ConjugateGradient<'a, T, A, P, Criterion> {
        ConjugateGradient {
            workspace: self.workspace,
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T: Real, A, P, Criterion> ConjugateGradient<'a, T, A, P, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> ConjugateGradient<'a, T, A, P2, Criterion> {
        ConjugateGradient {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    /// Limits the number of iterations. Without a limit, the iteration only stops once the
    /// stopping criterion is met or a breakdown is detected.
    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<'a, T: Real, A, P> ConjugateGradient<'a, T, A, P, ()> {
    pub fn with_stopping_criterion(
        self,
        stopping_criterion: RelativeResidualCriterion<T>,
    ) -> ConjugateGradient<'a, T, A, P, RelativeResidualCriterion<T>> {
        ConjugateGradient {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T, A, P> ConjugateGradient<'a, T, A, P, RelativeResidualCriterion<T>>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
{
    /// Solves `A x = b`, using the content of `x` as the initial guess.
    ///
    /// Only the owned parts of `b` and `x` are read. This is a collective operation, and every
    /// rank takes the same branches since all decisions are based on global reductions.
    #[allow(non_snake_case)]
    pub fn solve_with_guess(&mut self, b: &DistVector<T>, x: &mut DistVector<T>) -> Result<SolveOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;
        assert_eq!(b.num_owned(), x.num_owned());

        let mut output = SolveOutput::new();
        let Buffers { r, z, p, Ap } = self.workspace.prepare_buffers(b.layout());

        // r = b - Ax
        if let Err(err) = apply_operator(r, &self.operator, x) {
            return Err(SolveError::new(output, OperatorError(err)));
        }
        r.axpy(T::one(), b, -T::one());

        // z = Pr
        if let Err(err) = apply_operator(z, &self.preconditioner, r) {
            return Err(SolveError::new(output, PreconditionerError(err)));
        }

        // p = z
        p.copy_from(z);

        let mut zTr = z.dot(r);
        let b_norm = b.norm();

        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        loop {
            output.residual_norm = r.norm();
            debug!(
                "CG iteration {}: residual norm {:e}",
                output.num_iterations,
                to_f64(output.residual_norm)
            );

            if self
                .stopping_criterion
                .has_converged(output.residual_norm, b_norm)
            {
                break;
            } else if let Some(max_iter) = self.max_iter {
                if output.num_iterations >= max_iter {
                    return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
                }
            }

            // Ap = A * p
            if let Err(err) = apply_operator(Ap, &self.operator, p) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            let pAp = p.dot(Ap);

            if pAp <= T::zero() {
                return Err(SolveError::new(output, IndefiniteOperator));
            }
            if zTr <= T::zero() {
                return Err(SolveError::new(output, IndefinitePreconditioner));
            }

            let alpha = zTr / pAp;
            // x <- x + alpha * p
            x.axpy(alpha, p, T::one());
            // r <- r - alpha * Ap
            r.axpy(-alpha, Ap, T::one());

            // Number of iterations corresponds to number of updates to the x vector
            output.num_iterations += 1;

            // z <- P r
            if let Err(err) = apply_operator(z, &self.preconditioner, r) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            let zTr_next = z.dot(r);
            let beta = zTr_next / zTr;

            // p <- z + beta * p
            p.axpy(T::one(), z, beta);

            zTr = zTr_next;
        }

        Ok(output)
    }
}
