use crate::element::{DesignParameter, ElementEvaluator, ElementInput, ElementOutput, ElementRequest};
use eyre::eyre;
use nalgebra::{Matrix1x4, Matrix2, Matrix2x4, Point2, SMatrix, SVector, Vector2};
use numeric_literals::replace_float_literals;
use trellis_solid::materials::PlaneStressMaterial;
use trellis_solid::ConstitutiveModel;
use trellis_traits::Real;

type Matrix3x8<T> = SMatrix<T, 3, 8>;
type Matrix8<T> = SMatrix<T, 8, 8>;
type Vector8<T> = SVector<T, 8>;

/// Bilinear quadrilateral in plane stress, integrated with a 2x2 Gauss rule.
///
/// Nodes are ordered counter-clockwise. The element's design variables are its thickness (if it
/// is a design parameter) followed by the design variables of the material, for example a ply
/// angle.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadElement<T: Real> {
    material: PlaneStressMaterial<T>,
    thickness: DesignParameter<T>,
    design_variables: Vec<usize>,
    material_offset: usize,
}

/// Quantities at a quadrature point.
struct QuadraturePoint<T: Real> {
    basis: Matrix1x4<T>,
    strain_displacement: Matrix3x8<T>,
    /// Quadrature weight times the Jacobian determinant.
    weight: T,
}

#[rustfmt::skip]
#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
fn reference_basis<T: Real>(xi: &Point2<T>) -> (Matrix1x4<T>, Matrix2x4<T>) {
    let phi = |alpha: T, beta: T| (1.0 + alpha * xi[0]) * (1.0 + beta * xi[1]) / 4.0;
    let phi_grad = |alpha: T, beta: T| Vector2::new(
        alpha * (1.0 + beta * xi[1]) / 4.0,
        beta * (1.0 + alpha * xi[0]) / 4.0,
    );
    let basis = Matrix1x4::new(
        phi(-1.0, -1.0),
        phi( 1.0, -1.0),
        phi( 1.0,  1.0),
        phi(-1.0,  1.0),
    );
    let gradients = Matrix2x4::from_columns(&[
        phi_grad(-1.0, -1.0),
        phi_grad( 1.0, -1.0),
        phi_grad( 1.0,  1.0),
        phi_grad(-1.0,  1.0),
    ]);
    (basis, gradients)
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
fn gauss_points<T: Real>() -> [Point2<T>; 4] {
    let g = 1.0 / T::sqrt(3.0);
    [
        Point2::new(-g, -g),
        Point2::new(g, -g),
        Point2::new(g, g),
        Point2::new(-g, g),
    ]
}

impl<T: Real> QuadElement<T> {
    pub fn new(material: impl Into<PlaneStressMaterial<T>>, thickness: DesignParameter<T>) -> Self {
        let design_variables: Vec<usize> = thickness.variable().into_iter().collect();
        Self {
            material: material.into(),
            thickness,
            material_offset: design_variables.len(),
            design_variables,
        }
    }

    /// Assigns global design variables to the material's local design variables, in order.
    pub fn with_material_design(mut self, variables: impl IntoIterator<Item = usize>) -> Self {
        self.design_variables.truncate(self.material_offset);
        self.design_variables.extend(variables);
        self
    }

    pub fn material(&self) -> &PlaneStressMaterial<T> {
        &self.material
    }

    fn thickness_value(&self, design: &[T]) -> T {
        self.thickness.value(design, 0)
    }

    fn material_design<'a>(&self, design: &'a [T]) -> eyre::Result<&'a [T]> {
        let material_design = &design[self.material_offset..];
        let required = self.material.num_design_variables();
        if material_design.len() < required {
            return Err(eyre!(
                "Material requires {} design variables, but only {} are assigned",
                required,
                material_design.len()
            ));
        }
        Ok(material_design)
    }

    fn quadrature_points(&self, coordinates: &[Point2<T>]) -> eyre::Result<Vec<QuadraturePoint<T>>> {
        if coordinates.len() != 4 {
            return Err(eyre!("Quad element requires 4 nodes, got {}", coordinates.len()));
        }
        let mut points = Vec::with_capacity(4);
        for xi in gauss_points::<T>() {
            let (basis, reference_gradients) = reference_basis(&xi);
            let mut jacobian = Matrix2::zeros();
            for (x, grad) in coordinates.iter().zip(reference_gradients.column_iter()) {
                jacobian += x.coords * grad.transpose();
            }
            let det = jacobian.determinant();
            if det <= T::zero() {
                return Err(eyre!("Inverted quadrilateral (Jacobian determinant {})", det));
            }
            let inverse_transpose = jacobian
                .try_inverse()
                .ok_or_else(|| eyre!("Singular quadrilateral Jacobian"))?
                .transpose();
            let gradients = inverse_transpose * reference_gradients;

            let mut b = Matrix3x8::zeros();
            for (i, grad) in gradients.column_iter().enumerate() {
                b[(0, 2 * i)] = grad[0];
                b[(1, 2 * i + 1)] = grad[1];
                b[(2, 2 * i)] = grad[1];
                b[(2, 2 * i + 1)] = grad[0];
            }
            points.push(QuadraturePoint {
                basis,
                strain_displacement: b,
                weight: det,
            });
        }
        Ok(points)
    }

    /// Consistent mass matrix per unit thickness.
    fn unit_thickness_mass(&self, points: &[QuadraturePoint<T>]) -> Matrix8<T> {
        let density = self.material.density();
        let mut mass = Matrix8::zeros();
        for point in points {
            let nn = point.basis.transpose() * point.basis * (density * point.weight);
            for i in 0..4 {
                for j in 0..4 {
                    mass[(2 * i, 2 * j)] += nn[(i, j)];
                    mass[(2 * i + 1, 2 * j + 1)] += nn[(i, j)];
                }
            }
        }
        mass
    }
}

impl<T: Real> ElementEvaluator<T> for QuadElement<T> {
    fn num_nodes(&self) -> usize {
        4
    }

    fn vars_per_node(&self) -> usize {
        2
    }

    fn design_variables(&self) -> &[usize] {
        &self.design_variables
    }

    fn evaluate(
        &self,
        input: &ElementInput<T>,
        request: ElementRequest<T>,
        output: &mut ElementOutput<T>,
    ) -> eyre::Result<()> {
        let points = self.quadrature_points(input.coordinates)?;
        let thickness = self.thickness_value(input.design);
        let material_design = self.material_design(input.design)?;
        let u = Vector8::from_iterator(input.u.iter().copied());
        let a = Vector8::from_iterator(input.a.iter().copied());
        let unit_mass = self.unit_thickness_mass(&points);

        let mut internal_force = Vector8::zeros();
        let mut stiffness = Matrix8::zeros();
        let mut material_derivatives = vec![Vector8::zeros(); self.design_variables.len() - self.material_offset];
        for point in &points {
            let b = &point.strain_displacement;
            let strain = b * u;
            let (stress, tangent) = self.material.compute_stress(&strain, material_design);
            if stress.iter().any(|s| !s.is_finite()) {
                return Err(eyre!("Non-finite stress at strain {:?}", strain.as_slice()));
            }
            internal_force += b.transpose() * stress * point.weight;
            match request {
                ElementRequest::Jacobian(_) => {
                    stiffness += b.transpose() * tangent * b * point.weight;
                }
                ElementRequest::DesignDerivative => {
                    for (k, derivative) in material_derivatives.iter_mut().enumerate() {
                        let dstress = self
                            .material
                            .compute_stress_design_derivative(&strain, material_design, k);
                        *derivative += b.transpose() * dstress * (point.weight * thickness);
                    }
                }
                ElementRequest::Residual => {}
            }
        }

        match request {
            ElementRequest::Residual | ElementRequest::Jacobian(_) => {
                let residual = (internal_force + unit_mass * a) * thickness;
                output.residual.copy_from(&residual);
                if let ElementRequest::Jacobian(coefficients) = request {
                    let jacobian = (stiffness * coefficients.alpha + unit_mass * coefficients.gamma) * thickness;
                    output.jacobian.copy_from(&jacobian);
                }
            }
            ElementRequest::DesignDerivative => {
                if self.thickness.variable().is_some() {
                    output
                        .design_derivative
                        .column_mut(0)
                        .copy_from(&(internal_force + unit_mass * a));
                }
                for (k, derivative) in material_derivatives.iter().enumerate() {
                    output
                        .design_derivative
                        .column_mut(self.material_offset + k)
                        .copy_from(derivative);
                }
            }
        }
        Ok(())
    }

    fn mass(&self, input: &ElementInput<T>) -> eyre::Result<T> {
        let points = self.quadrature_points(input.coordinates)?;
        let area = points.iter().fold(T::zero(), |area, point| area + point.weight);
        Ok(self.material.density() * self.thickness_value(input.design) * area)
    }

    fn mass_design_derivative(&self, input: &ElementInput<T>, derivative: &mut [T]) -> eyre::Result<()> {
        let points = self.quadrature_points(input.coordinates)?;
        if self.thickness.variable().is_some() {
            let area = points.iter().fold(T::zero(), |area, point| area + point.weight);
            derivative[0] = self.material.density() * area;
        }
        Ok(())
    }
}
