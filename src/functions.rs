//! Scalar structural functions of the displacements and the design.
//!
//! A function provides its value together with the partial derivatives the adjoint method
//! combines into the total design gradient,
//! $$
//! \frac{\mathrm{d} F}{\mathrm{d} \vec x} = \pd{F}{\vec x} - \vec \lambda^T \pd{\vec R}{\vec x},
//! \qquad \vec J^T \vec \lambda = \pd{F}{\vec u}.
//! $$
use crate::assembly::Assembler;
use crate::element::ElementEvaluator;
use crate::error::AnalysisError;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use trellis_sparse::{DistVector, Synced};
use trellis_traits::Real;

/// A differentiable scalar function $F(\vec u, \vec x)$.
///
/// All methods are collective operations and return the same value on every rank.
pub trait StructuralFunction<T: Real> {
    fn value<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        design: &[T],
    ) -> Result<T, AnalysisError>;

    /// Writes $\pd{F}{\vec u}$ into the owned entries of `derivative`.
    fn state_derivative<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        design: &[T],
        derivative: &mut DistVector<T>,
    ) -> Result<(), AnalysisError>;

    /// Adds $\pd{F}{\vec x}$ to the replicated vector `gradient`.
    fn add_design_derivative<E: ElementEvaluator<T>>(
        &self,
        _assembler: &Assembler<T, E>,
        _u: Synced<T>,
        _design: &[T],
        _gradient: &mut DVector<T>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// The work of the full external load, $\vec f^{\text{ext}} \cdot \vec u$.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compliance;

impl<T: Real> StructuralFunction<T> for Compliance {
    fn value<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        _design: &[T],
    ) -> Result<T, AnalysisError> {
        Ok(assembler.external_load(T::one()).dot(u.vector()))
    }

    fn state_derivative<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        _u: Synced<T>,
        _design: &[T],
        derivative: &mut DistVector<T>,
    ) -> Result<(), AnalysisError> {
        derivative.copy_from(&assembler.external_load(T::one()));
        Ok(())
    }
}

/// Total structural mass. Independent of the displacements.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralMass;

impl<T: Real> StructuralFunction<T> for StructuralMass {
    fn value<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        _u: Synced<T>,
        design: &[T],
    ) -> Result<T, AnalysisError> {
        assembler.structural_mass(design)
    }

    fn state_derivative<E: ElementEvaluator<T>>(
        &self,
        _assembler: &Assembler<T, E>,
        _u: Synced<T>,
        _design: &[T],
        derivative: &mut DistVector<T>,
    ) -> Result<(), AnalysisError> {
        derivative.fill(T::zero());
        Ok(())
    }

    fn add_design_derivative<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        _u: Synced<T>,
        design: &[T],
        gradient: &mut DVector<T>,
    ) -> Result<(), AnalysisError> {
        *gradient += assembler.structural_mass_gradient(design)?;
        Ok(())
    }
}

/// The value of a single global degree of freedom.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodalDisplacement {
    pub dof: usize,
}

impl<T: Real> StructuralFunction<T> for NodalDisplacement {
    fn value<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        _design: &[T],
    ) -> Result<T, AnalysisError> {
        let local = u.vector().get_owned(self.dof).unwrap_or_else(T::zero);
        Ok(assembler.comm().all_reduce_sum(local))
    }

    fn state_derivative<E: ElementEvaluator<T>>(
        &self,
        _assembler: &Assembler<T, E>,
        _u: Synced<T>,
        _design: &[T],
        derivative: &mut DistVector<T>,
    ) -> Result<(), AnalysisError> {
        derivative.fill(T::zero());
        derivative.set_owned(self.dof, T::one());
        Ok(())
    }
}

/// Kreisselmeier-Steinhauser aggregate of one displacement component over all nodes,
/// a smooth upper bound of $\max_i s \, u_{i,c}$:
/// $$
/// F = m + \frac{1}{\rho} \ln \sum_i e^{\rho (s \, u_{i,c} - m)}, \quad m = \max_i s \, u_{i,c}.
/// $$
///
/// Larger `rho` tightens the bound. `direction` is the sign `s`; use `-1` to aggregate
/// displacements in the negative direction.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct KsDisplacement<T> {
    pub component: usize,
    pub rho: T,
    pub direction: T,
}

impl<T: Real> KsDisplacement<T> {
    pub fn new(component: usize, rho: T) -> Self {
        Self {
            component,
            rho,
            direction: T::one(),
        }
    }

    pub fn with_direction(self, direction: T) -> Self {
        Self { direction, ..self }
    }

    fn owned_values<'v>(&self, u: &'v DistVector<T>) -> impl Iterator<Item = (usize, T)> + 'v {
        let vpn = u.layout().vars_per_node();
        let component = self.component;
        let direction = self.direction;
        let owned = u.owned();
        (0..u.layout().num_owned_nodes())
            .map(move |node| (node * vpn + component, direction * owned[node * vpn + component]))
    }

    /// Returns the global maximum and the global sum of exponentials.
    fn aggregate<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: &DistVector<T>,
    ) -> Result<(T, T), AnalysisError> {
        if self.component >= u.layout().vars_per_node() {
            return Err(AnalysisError::InvalidModel(format!(
                "Component {} out of bounds for {} variables per node.",
                self.component,
                u.layout().vars_per_node()
            )));
        }
        let local_max = self
            .owned_values(u)
            .map(|(_, value)| value)
            .fold(T::min_value().unwrap_or(-T::one() / T::default_epsilon()), |a, b| a.max(b));
        let max = assembler.comm().all_reduce_max(local_max);
        let local_sum = self
            .owned_values(u)
            .fold(T::zero(), |sum, (_, value)| sum + (self.rho * (value - max)).exp());
        let sum = assembler.comm().all_reduce_sum(local_sum);
        Ok((max, sum))
    }
}

impl<T: Real> StructuralFunction<T> for KsDisplacement<T> {
    fn value<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        _design: &[T],
    ) -> Result<T, AnalysisError> {
        let (max, sum) = self.aggregate(assembler, u.vector())?;
        Ok(max + sum.ln() / self.rho)
    }

    fn state_derivative<E: ElementEvaluator<T>>(
        &self,
        assembler: &Assembler<T, E>,
        u: Synced<T>,
        _design: &[T],
        derivative: &mut DistVector<T>,
    ) -> Result<(), AnalysisError> {
        let (max, sum) = self.aggregate(assembler, u.vector())?;
        derivative.fill(T::zero());
        let mut owned = derivative.owned_mut();
        for (local_dof, value) in self.owned_values(u.vector()) {
            owned[local_dof] = self.direction * (self.rho * (value - max)).exp() / sum;
        }
        Ok(())
    }
}
