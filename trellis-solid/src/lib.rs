//! Constitutive models for `trellis`.
//!
//! Strains and stresses are given in Voigt notation with engineering shear strains, so that
//! $\vec \sigma \cdot \vec \epsilon$ is the strain energy density rate. In plane problems the
//! ordering is $(\epsilon_{xx}, \epsilon_{yy}, \gamma_{xy})$.
use nalgebra::{SMatrix, SVector};
use trellis_traits::Real;

pub mod materials;

/// A material law mapping strain and design variables to stress and its tangent.
///
/// Implementations must be pure: the same input always produces the same output and no state is
/// retained between calls, so that elements may be evaluated concurrently.
pub trait ConstitutiveModel<T: Real, const N: usize> {
    /// Number of (element-local) design variables the model reads.
    fn num_design_variables(&self) -> usize {
        0
    }

    /// Compute the stress $\vec \sigma(\vec \epsilon, \vec x)$ and the tangent
    /// $\pd{\vec \sigma}{\vec \epsilon}$.
    ///
    /// `design` holds the design variables local to the element; models only read the entries
    /// they declare through [`num_design_variables`](Self::num_design_variables).
    fn compute_stress(&self, strain: &SVector<T, N>, design: &[T]) -> (SVector<T, N>, SMatrix<T, N, N>);

    /// Compute $\pd{\vec \sigma}{x_k}$ for local design variable `k`.
    fn compute_stress_design_derivative(&self, strain: &SVector<T, N>, design: &[T], k: usize) -> SVector<T, N> {
        let _ = (strain, design, k);
        SVector::zeros()
    }

    /// Mass density.
    fn density(&self) -> T;
}
