use crate::ConstitutiveModel;
use nalgebra::{Matrix1, Matrix3, Vector1, Vector3};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use trellis_traits::Real;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YoungPoisson<T> {
    pub young: T,
    pub poisson: T,
}

/// Uniaxial material with optional cubic hardening.
///
/// The stress is $\sigma(\epsilon) = E (\epsilon + k \epsilon^3)$. With $k = 0$ this is Hooke's law.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniaxialMaterial<T> {
    pub young: T,
    pub hardening: T,
    pub density: T,
}

impl<T: Real> UniaxialMaterial<T> {
    pub fn linear(young: T, density: T) -> Self {
        Self {
            young,
            hardening: T::zero(),
            density,
        }
    }
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> ConstitutiveModel<T, 1> for UniaxialMaterial<T> {
    fn compute_stress(&self, strain: &Vector1<T>, _design: &[T]) -> (Vector1<T>, Matrix1<T>) {
        let eps = strain[0];
        let Self { young, hardening, .. } = *self;
        let stress = young * (eps + hardening * eps * eps * eps);
        let tangent = young * (1.0 + 3.0 * hardening * eps * eps);
        (Vector1::new(stress), Matrix1::new(tangent))
    }

    fn density(&self) -> T {
        self.density
    }
}

/// Linear isotropic material in plane stress.
///
/// The stress is $\vec \sigma = \vec D \vec \epsilon$ with
/// $$
/// \vec D = \frac{E}{1 - \nu^2}
/// \begin{pmatrix} 1 & \nu & 0 \\\\ \nu & 1 & 0 \\\\ 0 & 0 & \frac{1 - \nu}{2} \end{pmatrix}.
/// $$
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsotropicPlaneStress<T> {
    pub parameters: YoungPoisson<T>,
    pub density: T,
}

impl<T: Real> IsotropicPlaneStress<T> {
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    pub fn stiffness(&self) -> Matrix3<T> {
        let YoungPoisson { young, poisson } = self.parameters;
        let c = young / (1.0 - poisson * poisson);
        Matrix3::new(
            c, c * poisson, 0.0,
            c * poisson, c, 0.0,
            0.0, 0.0, c * 0.5 * (1.0 - poisson),
        )
    }
}

impl<T: Real> ConstitutiveModel<T, 3> for IsotropicPlaneStress<T> {
    fn compute_stress(&self, strain: &Vector3<T>, _design: &[T]) -> (Vector3<T>, Matrix3<T>) {
        let d = self.stiffness();
        (d * strain, d)
    }

    fn density(&self) -> T {
        self.density
    }
}

/// Orientation of a ply relative to the global x-axis, in radians.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlyAngle<T> {
    Fixed(T),
    /// The angle is read from the local design variable with the given index.
    Design(usize),
}

/// Orthotropic ply (lamina) in plane stress, with fibers rotated by the ply angle $\theta$.
///
/// With $\vec Q$ the reduced stiffness in the material axes, the stiffness in global axes is
/// $\bar{\vec Q} = \vec T^T \vec Q \vec T$ where $\vec T(\theta)$ maps global engineering strains
/// to material axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrthotropicPly<T> {
    pub e1: T,
    pub e2: T,
    pub nu12: T,
    pub g12: T,
    pub density: T,
    pub angle: PlyAngle<T>,
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> OrthotropicPly<T> {
    /// Reduced stiffness in material axes.
    pub fn material_stiffness(&self) -> Matrix3<T> {
        let nu21 = self.nu12 * self.e2 / self.e1;
        let denom = 1.0 - self.nu12 * nu21;
        let q11 = self.e1 / denom;
        let q22 = self.e2 / denom;
        let q12 = self.nu12 * self.e2 / denom;
        Matrix3::new(
            q11, q12, 0.0,
            q12, q22, 0.0,
            0.0, 0.0, self.g12,
        )
    }

    pub fn angle(&self, design: &[T]) -> T {
        match self.angle {
            PlyAngle::Fixed(theta) => theta,
            PlyAngle::Design(index) => design[index],
        }
    }

    fn strain_transformation(theta: T) -> Matrix3<T> {
        let (s, c) = theta.sin_cos();
        Matrix3::new(
            c * c, s * s, c * s,
            s * s, c * c, -c * s,
            -2.0 * c * s, 2.0 * c * s, c * c - s * s,
        )
    }

    fn strain_transformation_derivative(theta: T) -> Matrix3<T> {
        let (s, c) = theta.sin_cos();
        let cs = c * s;
        let c2s2 = c * c - s * s;
        Matrix3::new(
            -2.0 * cs, 2.0 * cs, c2s2,
            2.0 * cs, -2.0 * cs, -c2s2,
            -2.0 * c2s2, 2.0 * c2s2, -4.0 * cs,
        )
    }

    /// Stiffness $\bar{\vec Q}(\theta)$ in global axes.
    pub fn stiffness(&self, design: &[T]) -> Matrix3<T> {
        let t = Self::strain_transformation(self.angle(design));
        t.transpose() * self.material_stiffness() * t
    }

    /// Derivative $\frac{d \bar{\vec Q}}{d \theta}$.
    pub fn stiffness_angle_derivative(&self, design: &[T]) -> Matrix3<T> {
        let theta = self.angle(design);
        let t = Self::strain_transformation(theta);
        let dt = Self::strain_transformation_derivative(theta);
        let q = self.material_stiffness();
        let dt_q_t = dt.transpose() * q * t;
        dt_q_t + dt_q_t.transpose()
    }
}

impl<T: Real> ConstitutiveModel<T, 3> for OrthotropicPly<T> {
    fn num_design_variables(&self) -> usize {
        match self.angle {
            PlyAngle::Fixed(_) => 0,
            PlyAngle::Design(index) => index + 1,
        }
    }

    fn compute_stress(&self, strain: &Vector3<T>, design: &[T]) -> (Vector3<T>, Matrix3<T>) {
        let q_bar = self.stiffness(design);
        (q_bar * strain, q_bar)
    }

    fn compute_stress_design_derivative(&self, strain: &Vector3<T>, design: &[T], k: usize) -> Vector3<T> {
        match self.angle {
            PlyAngle::Design(index) if index == k => self.stiffness_angle_derivative(design) * strain,
            _ => Vector3::zeros(),
        }
    }

    fn density(&self) -> T {
        self.density
    }
}

/// The closed set of plane stress materials an element can be configured with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaneStressMaterial<T> {
    Isotropic(IsotropicPlaneStress<T>),
    Orthotropic(OrthotropicPly<T>),
}

impl<T> From<IsotropicPlaneStress<T>> for PlaneStressMaterial<T> {
    fn from(material: IsotropicPlaneStress<T>) -> Self {
        Self::Isotropic(material)
    }
}

impl<T> From<OrthotropicPly<T>> for PlaneStressMaterial<T> {
    fn from(material: OrthotropicPly<T>) -> Self {
        Self::Orthotropic(material)
    }
}

impl<T: Real> ConstitutiveModel<T, 3> for PlaneStressMaterial<T> {
    fn num_design_variables(&self) -> usize {
        match self {
            Self::Isotropic(material) => material.num_design_variables(),
            Self::Orthotropic(material) => material.num_design_variables(),
        }
    }

    fn compute_stress(&self, strain: &Vector3<T>, design: &[T]) -> (Vector3<T>, Matrix3<T>) {
        match self {
            Self::Isotropic(material) => material.compute_stress(strain, design),
            Self::Orthotropic(material) => material.compute_stress(strain, design),
        }
    }

    fn compute_stress_design_derivative(&self, strain: &Vector3<T>, design: &[T], k: usize) -> Vector3<T> {
        match self {
            Self::Isotropic(material) => material.compute_stress_design_derivative(strain, design, k),
            Self::Orthotropic(material) => material.compute_stress_design_derivative(strain, design, k),
        }
    }

    fn density(&self) -> T {
        match self {
            Self::Isotropic(material) => material.density,
            Self::Orthotropic(material) => material.density,
        }
    }
}
