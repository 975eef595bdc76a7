//! The per-element contract consumed by the assembler, and the reference element set.
//!
//! An element maps node coordinates, its local state `(u, v, a)` and its design variables to a
//! residual contribution
//! $$
//! \vec R_e = \vec f^{\text{int}}_e(\vec u_e) + \vec M_e \vec a_e,
//! $$
//! its Jacobian blend $\alpha \pd{\vec R_e}{\vec u} + \beta \pd{\vec R_e}{\vec v} + \gamma \pd{\vec R_e}{\vec a}$
//! and the design derivative $\pd{\vec R_e}{\vec x_e}$. External loads are handled by the model.
use nalgebra::{DMatrix, DVector, DVectorView, Point2};
use serde::{Deserialize, Serialize};
use trellis_traits::Real;

mod bar;
mod beam;
mod quad;

pub use bar::BarElement;
pub use beam::BeamElement;
pub use quad::QuadElement;

/// A scalar element property that is either fixed or taken from a design variable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesignParameter<T> {
    Fixed(T),
    /// Global index of the design variable.
    Variable(usize),
}

impl<T: Real> DesignParameter<T> {
    /// Value of the parameter, given the element-local design values and the local index of
    /// its variable. The index is ignored for fixed parameters.
    pub(crate) fn value(&self, design: &[T], local_index: usize) -> T {
        match self {
            Self::Fixed(value) => *value,
            Self::Variable(global) => {
                debug_assert!(
                    local_index < design.len(),
                    "design variable {} has local index {}, but the element received {} values",
                    global,
                    local_index,
                    design.len()
                );
                design[local_index]
            }
        }
    }

    pub(crate) fn variable(&self) -> Option<usize> {
        match self {
            Self::Fixed(_) => None,
            Self::Variable(global) => Some(*global),
        }
    }
}

/// Coefficients of the Jacobian blend $\alpha \pd{R}{u} + \beta \pd{R}{v} + \gamma \pd{R}{a}$.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct JacobianCoefficients<T> {
    pub alpha: T,
    pub beta: T,
    pub gamma: T,
}

impl<T: Real> JacobianCoefficients<T> {
    pub fn new(alpha: T, beta: T, gamma: T) -> Self {
        Self { alpha, beta, gamma }
    }

    /// The tangent stiffness matrix.
    pub fn stiffness() -> Self {
        Self::new(T::one(), T::zero(), T::zero())
    }

    /// The mass matrix.
    pub fn mass() -> Self {
        Self::new(T::zero(), T::zero(), T::one())
    }

    /// The shifted operator $K - \sigma M$.
    pub fn shifted(sigma: T) -> Self {
        Self::new(T::one(), T::zero(), -sigma)
    }

    /// Effective Jacobian of a Newmark step, $K + \frac{\gamma}{\beta \Delta t} C + \frac{1}{\beta \Delta t^2} M$.
    pub fn newmark(beta: T, gamma: T, dt: T) -> Self {
        Self::new(T::one(), gamma / (beta * dt), T::one() / (beta * dt * dt))
    }
}

/// What an element evaluation should compute.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ElementRequest<T> {
    /// Only the residual.
    Residual,
    /// The residual and the Jacobian blend with the given coefficients.
    Jacobian(JacobianCoefficients<T>),
    /// The derivative of the residual with respect to the element's design variables.
    DesignDerivative,
}

/// Element data gathered by the assembler.
///
/// State vectors hold `vars_per_node` entries per node, in element node order. `design` holds
/// the values of [`ElementEvaluator::design_variables`] in the same order.
#[derive(Debug, Clone)]
pub struct ElementInput<'a, T: Real> {
    pub coordinates: &'a [Point2<T>],
    pub u: DVectorView<'a, T>,
    pub v: DVectorView<'a, T>,
    pub a: DVectorView<'a, T>,
    pub design: &'a [T],
}

/// Buffers an element evaluation writes into.
///
/// Evaluations overwrite the entries they are asked for and leave the others untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementOutput<T: Real> {
    pub residual: DVector<T>,
    pub jacobian: DMatrix<T>,
    /// `num_dofs x num_design_variables`, column `k` is $\pd{\vec R_e}{x_k}$.
    pub design_derivative: DMatrix<T>,
}

impl<T: Real> ElementOutput<T> {
    pub fn zeros(num_dofs: usize, num_design_variables: usize) -> Self {
        Self {
            residual: DVector::zeros(num_dofs),
            jacobian: DMatrix::zeros(num_dofs, num_dofs),
            design_derivative: DMatrix::zeros(num_dofs, num_design_variables),
        }
    }
}

/// The element contract.
///
/// Evaluations must be pure functions of their input, since elements are evaluated
/// concurrently and possibly several times per pass.
pub trait ElementEvaluator<T: Real>: Sync {
    fn num_nodes(&self) -> usize;

    fn vars_per_node(&self) -> usize;

    /// Global indices of the design variables the element depends on, in local order.
    fn design_variables(&self) -> &[usize];

    fn evaluate(
        &self,
        input: &ElementInput<T>,
        request: ElementRequest<T>,
        output: &mut ElementOutput<T>,
    ) -> eyre::Result<()>;

    /// Structural mass of the element.
    fn mass(&self, input: &ElementInput<T>) -> eyre::Result<T>;

    /// Derivative of [`mass`](Self::mass) with respect to the local design variables.
    fn mass_design_derivative(&self, input: &ElementInput<T>, derivative: &mut [T]) -> eyre::Result<()>;
}

/// The closed set of element formulations shipped with the crate.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind<T: Real> {
    Bar(BarElement<T>),
    Beam(BeamElement<T>),
    Quad(QuadElement<T>),
}

impl<T: Real> From<BarElement<T>> for ElementKind<T> {
    fn from(element: BarElement<T>) -> Self {
        Self::Bar(element)
    }
}

impl<T: Real> From<BeamElement<T>> for ElementKind<T> {
    fn from(element: BeamElement<T>) -> Self {
        Self::Beam(element)
    }
}

impl<T: Real> From<QuadElement<T>> for ElementKind<T> {
    fn from(element: QuadElement<T>) -> Self {
        Self::Quad(element)
    }
}

macro_rules! dispatch {
    ($self:ident, $element:ident => $body:expr) => {
        match $self {
            ElementKind::Bar($element) => $body,
            ElementKind::Beam($element) => $body,
            ElementKind::Quad($element) => $body,
        }
    };
}

impl<T: Real> ElementEvaluator<T> for ElementKind<T> {
    fn num_nodes(&self) -> usize {
        dispatch!(self, element => element.num_nodes())
    }

    fn vars_per_node(&self) -> usize {
        dispatch!(self, element => element.vars_per_node())
    }

    fn design_variables(&self) -> &[usize] {
        dispatch!(self, element => element.design_variables())
    }

    fn evaluate(
        &self,
        input: &ElementInput<T>,
        request: ElementRequest<T>,
        output: &mut ElementOutput<T>,
    ) -> eyre::Result<()> {
        dispatch!(self, element => element.evaluate(input, request, output))
    }

    fn mass(&self, input: &ElementInput<T>) -> eyre::Result<T> {
        dispatch!(self, element => element.mass(input))
    }

    fn mass_design_derivative(&self, input: &ElementInput<T>, derivative: &mut [T]) -> eyre::Result<()> {
        dispatch!(self, element => element.mass_design_derivative(input, derivative))
    }
}
