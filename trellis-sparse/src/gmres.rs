//! Restarted GMRES with right preconditioning, for nonsymmetric distributed systems.
use crate::krylov::{
    apply_operator, IdentityOperator, LinearOperator, RelativeResidualCriterion, SolveError, SolveErrorKind,
    SolveOutput,
};
use crate::vector::DistVector;
use log::debug;
use nalgebra::{DMatrix, DVector};
use trellis_traits::{to_f64, Real};

/// Iteration limit of a [`Gmres`] solver unless [`with_max_iter`](Gmres::with_max_iter) is used.
///
/// Restarted GMRES can stagnate indefinitely, so unlike conjugate gradient it is always bounded.
pub const DEFAULT_MAX_ITER: usize = 1000;

#[derive(Debug)]
pub struct Gmres<T: Real, A, P> {
    operator: A,
    preconditioner: P,
    stopping_criterion: RelativeResidualCriterion<T>,
    restart: usize,
    max_iter: usize,
}

impl<T: Real> Gmres<T, (), IdentityOperator> {
    pub fn new(stopping_criterion: RelativeResidualCriterion<T>) -> Self {
        Self {
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion,
            restart: 30,
            max_iter: DEFAULT_MAX_ITER,
        }
    }
}

impl<T: Real, P> Gmres<T, (), P> {
    pub fn with_operator<A>(self, operator: A) -> Gmres<T, A, P> {
        Gmres {
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart: self.restart,
            max_iter: self.max_iter,
        }
    }
}

impl<T: Real, A, P> Gmres<T, A, P> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> Gmres<T, A, P2> {
        Gmres {
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart: self.restart,
            max_iter: self.max_iter,
        }
    }

    /// Dimension of the Krylov subspace before restarting.
    pub fn with_restart(self, restart: usize) -> Self {
        assert!(restart > 0, "restart length must be positive");
        Self { restart, ..self }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self { max_iter, ..self }
    }
}

/// Computes the Givens rotation that zeroes `b` in `(a, b)`.
fn givens_rotation<T: Real>(a: T, b: T) -> (T, T) {
    if b == T::zero() {
        (T::one(), T::zero())
    } else if a == T::zero() {
        (T::zero(), T::one())
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

/// Solves the upper triangular system `H[..k, ..k] y = g[..k]`.
fn back_substitute<T: Real>(h: &DMatrix<T>, g: &DVector<T>, k: usize) -> DVector<T> {
    let mut y = DVector::zeros(k);
    for i in (0..k).rev() {
        let mut sum = g[i];
        for j in i + 1..k {
            sum -= h[(i, j)] * y[j];
        }
        y[i] = if h[(i, i)] != T::zero() { sum / h[(i, i)] } else { T::zero() };
    }
    y
}

impl<T, A, P> Gmres<T, A, P>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
{
    /// Solves `A x = b`, using the content of `x` as the initial guess.
    ///
    /// This is a collective operation.
    pub fn solve_with_guess(&mut self, b: &DistVector<T>, x: &mut DistVector<T>) -> Result<SolveOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;
        let m = self.restart;
        let layout = b.layout().clone();
        let mut output = SolveOutput::new();

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        let mut basis: Vec<DistVector<T>> = (0..=m).map(|_| DistVector::zeros(layout.clone())).collect();
        let mut r = DistVector::zeros(layout.clone());
        let mut z = DistVector::zeros(layout.clone());
        let mut w = DistVector::zeros(layout);

        loop {
            // r = b - A x
            if let Err(err) = apply_operator(&mut r, &self.operator, x) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            r.axpy(T::one(), b, -T::one());
            let beta = r.norm();
            output.residual_norm = beta;
            if self.stopping_criterion.has_converged(beta, b_norm) {
                return Ok(output);
            }

            basis[0].copy_from(&r);
            basis[0].scale_mut(T::one() / beta);

            let mut h = DMatrix::<T>::zeros(m + 1, m);
            let mut g = DVector::zeros(m + 1);
            let mut cs = DVector::<T>::zeros(m);
            let mut sn = DVector::<T>::zeros(m);
            g[0] = beta;

            let mut k = 0;
            let mut exhausted = false;
            while k < m {
                if output.num_iterations >= self.max_iter {
                    exhausted = true;
                    break;
                }

                // z = P v_k, w = A z
                if let Err(err) = apply_operator(&mut z, &self.preconditioner, &mut basis[k]) {
                    return Err(SolveError::new(output, PreconditionerError(err)));
                }
                if let Err(err) = apply_operator(&mut w, &self.operator, &mut z) {
                    return Err(SolveError::new(output, OperatorError(err)));
                }

                // Modified Gram-Schmidt
                for i in 0..=k {
                    let h_ik = w.dot(&basis[i]);
                    h[(i, k)] = h_ik;
                    w.axpy(-h_ik, &basis[i], T::one());
                }
                let h_next = w.norm();
                h[(k + 1, k)] = h_next;
                if h_next != T::zero() {
                    basis[k + 1].copy_from(&w);
                    basis[k + 1].scale_mut(T::one() / h_next);
                }

                for i in 0..k {
                    let (c, s) = (cs[i], sn[i]);
                    let upper = h[(i, k)];
                    let lower = h[(i + 1, k)];
                    h[(i, k)] = c * upper + s * lower;
                    h[(i + 1, k)] = -s * upper + c * lower;
                }
                let (c, s) = givens_rotation(h[(k, k)], h[(k + 1, k)]);
                cs[k] = c;
                sn[k] = s;
                h[(k, k)] = c * h[(k, k)] + s * h[(k + 1, k)];
                h[(k + 1, k)] = T::zero();
                g[k + 1] = -s * g[k];
                g[k] = c * g[k];

                k += 1;
                output.num_iterations += 1;
                output.residual_norm = g[k].abs();
                debug!(
                    "GMRES iteration {}: residual norm {:e}",
                    output.num_iterations,
                    to_f64(output.residual_norm)
                );

                if self
                    .stopping_criterion
                    .has_converged(output.residual_norm, b_norm)
                    || h_next == T::zero()
                {
                    // Checked again against the true residual b - A x at the top of the loop
                    break;
                }
            }

            if k > 0 {
                // x <- x + P (V y)
                let y = back_substitute(&h, &g, k);
                w.fill(T::zero());
                for (i, y_i) in y.iter().enumerate() {
                    w.axpy(*y_i, &basis[i], T::one());
                }
                if let Err(err) = apply_operator(&mut z, &self.preconditioner, &mut w) {
                    return Err(SolveError::new(output, PreconditionerError(err)));
                }
                x.axpy(T::one(), &z, T::one());
            }

            if exhausted {
                let max_iter = self.max_iter;
                return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
            }
        }
    }
}
