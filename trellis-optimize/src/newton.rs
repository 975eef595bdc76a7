use itertools::iterate;
use log::{debug, info};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use trellis_traits::{from_f64, to_f64, Real};

/// A nonlinear system `R(u) = 0` that owns its state, residual, Jacobian and update.
///
/// The driver never touches the state directly. Every call is expected to be collective if the
/// system is distributed, and all ranks must return the same norms.
pub trait NewtonSystem<T: Real> {
    type Error;

    /// Assembles the residual and its Jacobian at the current state and returns the residual norm.
    fn assemble(&mut self) -> Result<T, Self::Error>;

    /// Solves `J du = -R` for the update `du` and returns its norm.
    fn solve_update(&mut self) -> Result<T, Self::Error>;

    /// Moves the state by `step * du` and returns the residual norm at the new state.
    ///
    /// The Jacobian does not need to be updated.
    fn advance(&mut self, step: T) -> Result<T, Self::Error>;
}

impl<'a, T: Real, S: ?Sized + NewtonSystem<T>> NewtonSystem<T> for &'a mut S {
    type Error = S::Error;

    fn assemble(&mut self) -> Result<T, Self::Error> {
        S::assemble(self)
    }

    fn solve_update(&mut self) -> Result<T, Self::Error> {
        S::solve_update(self)
    }

    fn advance(&mut self, step: T) -> Result<T, Self::Error> {
        S::advance(self, step)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewtonState {
    Initialized,
    Assembling,
    Solving,
    Converged,
    Diverged,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewtonSettings<T> {
    pub max_iterations: Option<usize>,
    /// Absolute residual tolerance.
    pub tolerance: T,
    /// Residual tolerance relative to the residual norm at the initial state.
    pub relative_tolerance: T,
    /// Converge once a full step is shorter than this.
    pub update_tolerance: Option<T>,
}

impl<T: Real> NewtonSettings<T> {
    /// Residual norm below which the iteration is considered converged.
    pub fn threshold(&self, initial_residual_norm: T) -> T {
        self.tolerance.max(self.relative_tolerance * initial_residual_norm)
    }
}

impl Default for NewtonSettings<f64> {
    fn default() -> Self {
        Self {
            max_iterations: Some(30),
            tolerance: 1e-10,
            relative_tolerance: 1e-9,
            update_tolerance: None,
        }
    }
}

#[derive(Debug)]
pub enum NewtonError<T, E> {
    /// The procedure failed because the maximum number of iterations was reached.
    MaximumIterationsReached { iterations: usize, residual_norm: T },
    /// Assembly or residual evaluation failed.
    AssemblyError(E),
    /// The procedure failed because solving the Jacobian system failed.
    JacobianError(E),
    /// The line search failed to produce a sufficient decrease.
    LineSearchError { step: T, residual_norm: T },
}

impl<T: Real, E: Display> Display for NewtonError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            NewtonError::MaximumIterationsReached {
                iterations,
                residual_norm,
            } => write!(
                f,
                "Failed to converge within maximum number of iterations ({}). Residual norm: {:e}.",
                iterations,
                to_f64(*residual_norm)
            ),
            NewtonError::AssemblyError(err) => write!(f, "Failed to assemble nonlinear system. Error: {}", err),
            NewtonError::JacobianError(err) => write!(f, "Failed to solve Jacobian system. Error: {}", err),
            NewtonError::LineSearchError { step, residual_norm } => write!(
                f,
                "Line search failed to produce valid step direction. \
                Step {:e} is smaller than the minimum allowed step (residual norm {:e}).",
                to_f64(*step),
                to_f64(*residual_norm)
            ),
        }
    }
}

impl<T: Real, E: fmt::Debug + Display> Error for NewtonError<T, E> {}

/// Residual history entry, recorded after each assembly.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewtonIterate<T> {
    pub iteration: usize,
    pub residual_norm: T,
    /// Length of the step taken by the line search after this assembly, if any.
    pub step: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewtonOutput<T> {
    /// Number of updates applied to the state.
    pub iterations: usize,
    pub residual_norm: T,
    pub initial_residual_norm: T,
}

pub trait LineSearch<T: Real, S: NewtonSystem<T>> {
    /// Takes a step along the current update of `system`.
    ///
    /// Returns the accepted step length and the residual norm at the new state.
    fn step(&mut self, system: &mut S, residual_norm: T) -> Result<(T, T), NewtonError<T, S::Error>>;
}

/// Trivial implementation of line search. Equivalent to a single, full Newton step.
#[derive(Clone, Debug, Default)]
pub struct NoLineSearch;

impl<T, S> LineSearch<T, S> for NoLineSearch
where
    T: Real,
    S: NewtonSystem<T>,
{
    fn step(&mut self, system: &mut S, _residual_norm: T) -> Result<(T, T), NewtonError<T, S::Error>> {
        let residual_norm = system
            .advance(T::one())
            .map_err(NewtonError::AssemblyError)?;
        Ok((T::one(), residual_norm))
    }
}

/// Standard backtracking line search using the Armijo condition.
///
/// See Jorge & Nocedal (2006), Numerical Optimization, Chapter 3.1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktrackingLineSearch {
    /// Armijo parameter `c` in `(0, 1)`.
    pub sufficient_decrease: f64,
    pub min_step: f64,
}

impl Default for BacktrackingLineSearch {
    fn default() -> Self {
        Self {
            sufficient_decrease: 1e-4,
            min_step: 1e-6,
        }
    }
}

impl<T, S> LineSearch<T, S> for BacktrackingLineSearch
where
    T: Real,
    S: NewtonSystem<T>,
{
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn step(&mut self, system: &mut S, residual_norm: T) -> Result<(T, T), NewtonError<T, S::Error>> {
        // We seek to solve
        //  R(u) = 0
        // by minimizing
        //  g(u) = (1/2) || R(u) ||^2
        // With p the exact Newton direction, grad g^T p = -|| R ||^2, so the sufficient decrease
        // condition becomes
        //  g(u + alpha * p) <= (1 - c * alpha) * g(u)
        let c: T = from_f64(self.sufficient_decrease);
        let alpha_min: T = from_f64(self.min_step);
        let g_initial = 0.5 * residual_norm * residual_norm;

        // Start out with some alphas that don't decrease too quickly, then
        // start decreasing them much faster if the first few iterations don't let us
        // take a step.
        let initial_alphas = [0.0, 1.0, 0.75, 0.5];
        let mut alpha_iter = initial_alphas
            .into_iter()
            .chain(iterate(0.25, |alpha_i| 0.25 * *alpha_i));

        let mut alpha_prev = alpha_iter.next().unwrap_or(0.0);
        let mut alpha = alpha_iter.next().unwrap_or(1.0);

        loop {
            // u^{k+1} = u^0 + alpha^k p = u^k + (alpha^k - alpha^{k-1}) p
            let new_norm = system
                .advance(alpha - alpha_prev)
                .map_err(NewtonError::AssemblyError)?;

            let g = 0.5 * new_norm * new_norm;
            if g <= (1.0 - c * alpha) * g_initial {
                return Ok((alpha, new_norm));
            } else if alpha < alpha_min {
                return Err(NewtonError::LineSearchError {
                    step: alpha,
                    residual_norm: new_norm,
                });
            } else {
                debug!(
                    "Rejected step {:e}: residual norm {:e} -> {:e}",
                    to_f64(alpha),
                    to_f64(residual_norm),
                    to_f64(new_norm)
                );
                alpha_prev = alpha;
                alpha = alpha_iter.next().unwrap_or(0.25 * alpha);
            }
        }
    }
}

/// Newton iteration driving a [`NewtonSystem`] through the states
/// `Initialized -> Assembling -> Solving -> ... -> Converged | Diverged`.
///
/// The iteration has converged once the residual norm is below
/// [`NewtonSettings::threshold`] or a step shorter than the update tolerance was taken. It
/// diverges when the iteration budget is exhausted or any stage fails.
#[derive(Debug, Clone)]
pub struct NewtonDriver<T, L> {
    settings: NewtonSettings<T>,
    line_search: L,
    state: NewtonState,
    history: Vec<NewtonIterate<T>>,
}

impl<T: Real> NewtonDriver<T, NoLineSearch> {
    pub fn new(settings: NewtonSettings<T>) -> Self {
        Self {
            settings,
            line_search: NoLineSearch,
            state: NewtonState::Initialized,
            history: Vec::new(),
        }
    }
}

impl<T: Real, L> NewtonDriver<T, L> {
    pub fn with_line_search<L2>(self, line_search: L2) -> NewtonDriver<T, L2> {
        NewtonDriver {
            settings: self.settings,
            line_search,
            state: self.state,
            history: self.history,
        }
    }

    pub fn settings(&self) -> &NewtonSettings<T> {
        &self.settings
    }

    pub fn state(&self) -> NewtonState {
        self.state
    }

    /// Residual norms and steps of the most recent solve.
    pub fn history(&self) -> &[NewtonIterate<T>] {
        &self.history
    }

    fn transition(&mut self, state: NewtonState) {
        self.state = state;
    }

    fn diverge<E>(&mut self, error: NewtonError<T, E>) -> NewtonError<T, E> {
        self.transition(NewtonState::Diverged);
        error
    }

    /// Drives `system` from its current state until convergence or divergence.
    pub fn solve<S>(&mut self, system: &mut S) -> Result<NewtonOutput<T>, NewtonError<T, S::Error>>
    where
        S: NewtonSystem<T>,
        L: LineSearch<T, S>,
    {
        self.transition(NewtonState::Initialized);
        self.history.clear();

        let mut iterations = 0;
        let mut initial_residual_norm = None;
        let mut small_update = false;

        loop {
            self.transition(NewtonState::Assembling);
            let residual_norm = match system.assemble() {
                Ok(norm) => norm,
                Err(err) => return Err(self.diverge(NewtonError::AssemblyError(err))),
            };
            let r0 = *initial_residual_norm.get_or_insert(residual_norm);
            debug!(
                "Newton iteration {}: residual norm {:e}",
                iterations,
                to_f64(residual_norm)
            );
            self.history.push(NewtonIterate {
                iteration: iterations,
                residual_norm,
                step: None,
            });

            if residual_norm <= self.settings.threshold(r0) || small_update {
                self.transition(NewtonState::Converged);
                info!(
                    "Newton converged after {} iterations (residual norm {:e})",
                    iterations,
                    to_f64(residual_norm)
                );
                return Ok(NewtonOutput {
                    iterations,
                    residual_norm,
                    initial_residual_norm: r0,
                });
            }

            if self
                .settings
                .max_iterations
                .map(|max_iter| iterations >= max_iter)
                .unwrap_or(false)
            {
                return Err(self.diverge(NewtonError::MaximumIterationsReached {
                    iterations,
                    residual_norm,
                }));
            }

            self.transition(NewtonState::Solving);
            let update_norm = match system.solve_update() {
                Ok(norm) => norm,
                Err(err) => return Err(self.diverge(NewtonError::JacobianError(err))),
            };

            let (step, _) = match self.line_search.step(system, residual_norm) {
                Ok(result) => result,
                Err(err) => return Err(self.diverge(err)),
            };
            if let Some(last) = self.history.last_mut() {
                last.step = Some(step);
            }
            debug!("Newton step length at iter {}: {:e}", iterations, to_f64(step));

            small_update = self
                .settings
                .update_tolerance
                .map(|tol| step * update_norm <= tol)
                .unwrap_or(false);
            iterations += 1;
        }
    }
}
