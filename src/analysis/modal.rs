use crate::analysis::linear::{LinearSolver, SolverSettings};
use crate::assembly::Assembler;
use crate::context::DesignContext;
use crate::element::{ElementEvaluator, JacobianCoefficients};
use crate::error::AnalysisError;
use itertools::Itertools;
use log::{debug, info};
use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use trellis_sparse::{BlockCyclicMatrix, DistVector};
use trellis_traits::{from_f64, to_f64, Real};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencySettings {
    pub num_modes: usize,
    /// Dimension of the iterated subspace, at least `num_modes`.
    pub subspace_size: usize,
    /// Shift $\sigma$ of the shift-invert operator $(\vec K - \sigma \vec M)^{-1} \vec M$.
    pub shift: f64,
    /// Relative change of the eigenvalues below which the iteration stops.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub solver: SolverSettings,
}

impl Default for FrequencySettings {
    fn default() -> Self {
        Self {
            num_modes: 4,
            subspace_size: 8,
            shift: 0.0,
            tolerance: 1e-8,
            max_iterations: 100,
            solver: SolverSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalOutput<T: Real> {
    /// Eigenvalues $\omega^2$ in ascending order.
    pub eigenvalues: Vec<T>,
    /// Natural frequencies $\omega / 2 \pi$.
    pub frequencies: Vec<T>,
    /// Mass-normalized mode shapes, gathered on every rank.
    pub modes: Vec<DVector<T>>,
    pub iterations: usize,
}

/// Lowest natural frequencies of $\vec K \vec \phi = \omega^2 \vec M \vec \phi$ about the
/// undeformed state, by subspace iteration with shift-invert.
///
/// Constrained degrees of freedom are excluded from the eigenproblem.
pub struct FrequencyAnalysis<'s, 'a, T: Real, E> {
    assembler: &'s Assembler<'a, T, E>,
    settings: FrequencySettings,
}

/// Deterministic, partition independent start vector.
fn start_vector<T: Real>(index: usize, num_dofs: usize) -> DVector<T> {
    DVector::from_fn(num_dofs, |i, _| {
        let hash = (i * 7919 + index * 104_729 + (i * index) % 31) % 1009;
        from_f64(1.0 + hash as f64 / 1009.0)
    })
}

/// Rayleigh-Ritz: solves the projected problem `K_r q = mu M_r q`.
fn ritz_pairs<T: Real>(k_r: DMatrix<T>, m_r: DMatrix<T>) -> Result<(DVector<T>, DMatrix<T>), AnalysisError> {
    let cholesky = Cholesky::new(m_r).ok_or_else(|| {
        AnalysisError::Solver("Projected mass matrix is not positive definite.".to_string())
    })?;
    let l = cholesky.l();
    let l_inv = l
        .clone()
        .try_inverse()
        .ok_or_else(|| AnalysisError::Solver("Singular projected mass matrix.".to_string()))?;
    let c = &l_inv * k_r * l_inv.transpose();
    let c = (&c + c.transpose()) / from_f64::<T>(2.0);
    let eigen = SymmetricEigen::new(c);

    let order: Vec<usize> = (0..eigen.eigenvalues.len())
        .sorted_by(|&i, &j| {
            eigen.eigenvalues[i]
                .partial_cmp(&eigen.eigenvalues[j])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .collect();
    let values = DVector::from_iterator(order.len(), order.iter().map(|&i| eigen.eigenvalues[i]));
    let vectors = l_inv.transpose() * eigen.eigenvectors.select_columns(&order);
    Ok((values, vectors))
}

impl<'s, 'a, T, E> FrequencyAnalysis<'s, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    pub fn new(assembler: &'s Assembler<'a, T, E>, settings: FrequencySettings) -> Self {
        Self { assembler, settings }
    }

    fn project(
        &self,
        basis: &mut [DistVector<T>],
        matrix: &BlockCyclicMatrix<T>,
        product: &mut DistVector<T>,
    ) -> DMatrix<T> {
        let p = basis.len();
        let mut projected = DMatrix::zeros(p, p);
        for j in 0..p {
            matrix.multiply(&basis[j].synchronize(), product);
            for i in 0..p {
                projected[(i, j)] = basis[i].dot(product);
            }
        }
        (&projected + projected.transpose()) / from_f64::<T>(2.0)
    }

    /// Computes the lowest [`FrequencySettings::num_modes`] modes. This is a collective
    /// operation.
    pub fn solve(&self, context: &DesignContext<T>) -> Result<ModalOutput<T>, AnalysisError> {
        let assembler = self.assembler;
        let design = context.values().as_slice();
        let settings = &self.settings;
        let p = settings.subspace_size.max(settings.num_modes);
        if settings.num_modes == 0 {
            return Err(AnalysisError::InvalidModel("At least one mode must be requested.".to_string()));
        }
        let free_dofs = assembler.model().num_dofs() - assembler.constrained_dofs().len();
        if p > free_dofs {
            return Err(AnalysisError::InvalidModel(format!(
                "Subspace of size {} exceeds the {} unconstrained degrees of freedom.",
                p, free_dofs
            )));
        }

        let mut state = assembler.create_state();
        let state = state.synchronize();
        let shift: T = from_f64(settings.shift);
        let mut stiffness = assembler.create_matrix();
        let mut mass = assembler.create_matrix();
        let mut shifted = assembler.create_matrix();
        assembler.assemble_matrix(state, design, JacobianCoefficients::stiffness(), T::one(), &mut stiffness)?;
        assembler.assemble_matrix(state, design, JacobianCoefficients::mass(), T::zero(), &mut mass)?;
        assembler.assemble_matrix(state, design, JacobianCoefficients::shifted(shift), T::one(), &mut shifted)?;

        let mut solver = LinearSolver::new(settings.solver.clone());
        solver.prepare(&shifted)?;

        let num_dofs = assembler.model().num_dofs();
        let mut basis: Vec<DistVector<T>> = (0..p)
            .map(|index| {
                let mut x = DistVector::from_global(assembler.layout().clone(), &start_vector(index, num_dofs));
                assembler.zero_constrained(&mut x);
                x
            })
            .collect();

        let mut rhs = assembler.create_vector();
        let mut product = assembler.create_vector();
        let mut previous: Option<DVector<T>> = None;
        let tolerance: T = from_f64(settings.tolerance);
        // Largest relative eigenvalue change of the last iteration
        let mut change = f64::INFINITY;

        for iteration in 1..=settings.max_iterations {
            // Y = (K - sigma M)^{-1} M X
            let mut images = Vec::with_capacity(p);
            for x in &mut basis {
                mass.multiply(&x.synchronize(), &mut rhs);
                let mut y = x.clone();
                solver.solve(&shifted, &rhs, &mut y)?;
                assembler.zero_constrained(&mut y);
                images.push(y);
            }

            let k_r = self.project(&mut images, &stiffness, &mut product);
            let m_r = self.project(&mut images, &mass, &mut product);
            let (values, vectors) = ritz_pairs(k_r, m_r)?;

            for (j, x) in basis.iter_mut().enumerate() {
                x.fill(T::zero());
                for (i, y) in images.iter().enumerate() {
                    x.axpy(vectors[(i, j)], y, T::one());
                }
            }

            let current = values.rows(0, settings.num_modes).into_owned();
            let converged = previous
                .as_ref()
                .map(|previous| {
                    change = current
                        .iter()
                        .zip(previous.iter())
                        .map(|(&new, &old)| relative_change(new, old))
                        .fold(0.0, f64::max);
                    current
                        .iter()
                        .zip(previous.iter())
                        .all(|(&new, &old)| (new - old).abs() <= tolerance * new.abs())
                })
                .unwrap_or(false);
            debug!(
                "Subspace iteration {}: lowest eigenvalue {:e}",
                iteration,
                to_f64(current[0])
            );
            previous = Some(current);

            if converged {
                let eigenvalues: Vec<T> = values.iter().take(settings.num_modes).copied().collect();
                let frequencies: Vec<T> = eigenvalues
                    .iter()
                    .map(|&lambda| lambda.max(T::zero()).sqrt() / T::two_pi())
                    .collect();
                let modes = basis
                    .iter()
                    .take(settings.num_modes)
                    .map(|x| x.gather())
                    .collect();
                info!(
                    "Subspace iteration converged after {} iterations, lowest frequency {:e}",
                    iteration,
                    to_f64(frequencies[0])
                );
                return Ok(ModalOutput {
                    eigenvalues,
                    frequencies,
                    modes,
                    iterations: iteration,
                });
            }
        }

        Err(AnalysisError::ConvergenceFailure {
            solver: "Subspace iteration",
            iterations: settings.max_iterations,
            residual_norm: change,
        })
    }
}

fn relative_change<T: Real>(new: T, old: T) -> f64 {
    let difference = to_f64((new - old).abs());
    let scale = to_f64(new.abs());
    if scale > 0.0 {
        difference / scale
    } else {
        difference
    }
}
