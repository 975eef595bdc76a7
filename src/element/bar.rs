use crate::element::{DesignParameter, ElementEvaluator, ElementInput, ElementOutput, ElementRequest};
use eyre::eyre;
use nalgebra::{Matrix4, Vector1, Vector2, Vector4};
use numeric_literals::replace_float_literals;
use trellis_solid::materials::UniaxialMaterial;
use trellis_solid::ConstitutiveModel;
use trellis_traits::Real;

/// Two-node truss bar in the plane with small-strain kinematics.
///
/// With $\vec e$ the unit vector from node 1 to node 2 and $L$ the undeformed length, the axial
/// strain is $\epsilon = \vec e \cdot (\vec u_2 - \vec u_1) / L$ and the internal force is
/// $A \sigma(\epsilon) (-\vec e, \vec e)$. The mass matrix is the consistent one. There is no
/// damping, so the velocity coefficient of a Jacobian blend has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct BarElement<T: Real> {
    material: UniaxialMaterial<T>,
    area: DesignParameter<T>,
    design_variables: Vec<usize>,
}

struct BarGeometry<T: Real> {
    length: T,
    direction: Vector2<T>,
}

impl<T: Real> BarElement<T> {
    pub fn new(material: UniaxialMaterial<T>, area: DesignParameter<T>) -> Self {
        Self {
            material,
            area,
            design_variables: area.variable().into_iter().collect(),
        }
    }

    pub fn material(&self) -> &UniaxialMaterial<T> {
        &self.material
    }

    fn area_value(&self, design: &[T]) -> T {
        self.area.value(design, 0)
    }

    fn geometry(&self, input: &ElementInput<T>) -> eyre::Result<BarGeometry<T>> {
        let [x1, x2] = match input.coordinates {
            [x1, x2] => [x1, x2],
            _ => return Err(eyre!("Bar element requires 2 nodes, got {}", input.coordinates.len())),
        };
        let d = x2 - x1;
        let length = d.norm();
        if length <= T::default_epsilon() {
            return Err(eyre!("Degenerate bar element of length {}", length));
        }
        Ok(BarGeometry {
            length,
            direction: d / length,
        })
    }

    /// Consistent mass matrix per unit area.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn unit_area_mass(&self, length: T) -> Matrix4<T> {
        let m = self.material.density * length / 6.0;
        let mut mass = Matrix4::zeros();
        for i in 0..2 {
            mass[(i, i)] = 2.0 * m;
            mass[(i + 2, i + 2)] = 2.0 * m;
            mass[(i, i + 2)] = m;
            mass[(i + 2, i)] = m;
        }
        mass
    }
}

impl<T: Real> ElementEvaluator<T> for BarElement<T> {
    fn num_nodes(&self) -> usize {
        2
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
        let BarGeometry { length, direction: e } = self.geometry(input)?;
        let area = self.area_value(input.design);
        let u = Vector4::from_iterator(input.u.iter().copied());
        let a = Vector4::from_iterator(input.a.iter().copied());

        // Gradient of the strain with respect to the element displacements, times L
        let g = Vector4::new(-e.x, -e.y, e.x, e.y);
        let strain = g.dot(&u) / length;
        let (stress, tangent) = self.material.compute_stress(&Vector1::new(strain), &[]);
        if !stress[0].is_finite() || !tangent[(0, 0)].is_finite() {
            return Err(eyre!("Non-finite stress at strain {}", strain));
        }
        let unit_mass = self.unit_area_mass(length);

        match request {
            ElementRequest::Residual | ElementRequest::Jacobian(_) => {
                let residual = g * (stress[0] * area) + unit_mass * a * area;
                output.residual.copy_from(&residual);
            }
            ElementRequest::DesignDerivative => {
                if self.area.variable().is_some() {
                    let derivative = g * stress[0] + unit_mass * a;
                    output
                        .design_derivative
                        .column_mut(0)
                        .copy_from(&derivative);
                }
            }
        }

        if let ElementRequest::Jacobian(coefficients) = request {
            let stiffness = g * g.transpose() * (area * tangent[(0, 0)] / length);
            let jacobian = stiffness * coefficients.alpha + unit_mass * (area * coefficients.gamma);
            output.jacobian.copy_from(&jacobian);
        }
        Ok(())
    }

    fn mass(&self, input: &ElementInput<T>) -> eyre::Result<T> {
        let BarGeometry { length, .. } = self.geometry(input)?;
        Ok(self.material.density * self.area_value(input.design) * length)
    }

    fn mass_design_derivative(&self, input: &ElementInput<T>, derivative: &mut [T]) -> eyre::Result<()> {
        let BarGeometry { length, .. } = self.geometry(input)?;
        if self.area.variable().is_some() {
            derivative[0] = self.material.density * length;
        }
        Ok(())
    }
}
