use crate::element::{DesignParameter, ElementEvaluator, ElementInput, ElementOutput, ElementRequest};
use eyre::eyre;
use nalgebra::{Matrix6, Vector6};
use numeric_literals::replace_float_literals;
use trellis_solid::materials::UniaxialMaterial;
use trellis_traits::Real;

/// Two-node Euler-Bernoulli frame element in the plane.
///
/// Each node carries the displacements $(u_x, u_y)$ and the rotation $\theta$. The cross
/// section is a rectangle of fixed width $b$ and height $h$, so that $A = b h$ and
/// $I = b h^3 / 12$. The element is linear elastic: only the Young's modulus and the density of
/// the material are used.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamElement<T: Real> {
    material: UniaxialMaterial<T>,
    width: T,
    height: DesignParameter<T>,
    design_variables: Vec<usize>,
}

/// Local stiffness split by section property, and the rotation to global axes.
struct BeamMatrices<T: Real> {
    /// Axial stiffness, proportional to $A$.
    axial: Matrix6<T>,
    /// Bending stiffness, proportional to $I$.
    bending: Matrix6<T>,
    /// Consistent mass, proportional to $A$.
    mass: Matrix6<T>,
}

impl<T: Real> BeamElement<T> {
    pub fn new(material: UniaxialMaterial<T>, width: T, height: DesignParameter<T>) -> Self {
        Self {
            material,
            width,
            height,
            design_variables: height.variable().into_iter().collect(),
        }
    }

    fn height_value(&self, design: &[T]) -> T {
        self.height.value(design, 0)
    }

    fn length(&self, input: &ElementInput<T>) -> eyre::Result<(T, T, T)> {
        let [x1, x2] = match input.coordinates {
            [x1, x2] => [x1, x2],
            _ => return Err(eyre!("Beam element requires 2 nodes, got {}", input.coordinates.len())),
        };
        let d = x2 - x1;
        let length = d.norm();
        if length <= T::default_epsilon() {
            return Err(eyre!("Degenerate beam element of length {}", length));
        }
        Ok((length, d.x / length, d.y / length))
    }

    /// Global element matrices for the given section height.
    #[allow(non_snake_case)]
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn matrices(&self, input: &ElementInput<T>, h: T) -> eyre::Result<BeamMatrices<T>> {
        let (L, c, s) = self.length(input)?;
        if h <= 0.0 {
            return Err(eyre!("Beam section height must be positive, got {}", h));
        }
        let E = self.material.young;
        let A = self.width * h;
        let I = self.width * h * h * h / 12.0;
        let L2 = L * L;

        // Local ordering: (u1, w1, theta1, u2, w2, theta2)
        let mut axial = Matrix6::zeros();
        let ka = E * A / L;
        axial[(0, 0)] = ka;
        axial[(3, 3)] = ka;
        axial[(0, 3)] = -ka;
        axial[(3, 0)] = -ka;

        let kb = E * I / (L2 * L);
        let bending_indices = [1, 2, 4, 5];
        #[rustfmt::skip]
        let bending_block = [
            [12.0,     6.0 * L,  -12.0,     6.0 * L],
            [6.0 * L,  4.0 * L2, -6.0 * L,  2.0 * L2],
            [-12.0,    -6.0 * L, 12.0,      -6.0 * L],
            [6.0 * L,  2.0 * L2, -6.0 * L,  4.0 * L2],
        ];
        let mut bending = Matrix6::zeros();
        for (i, &row) in bending_indices.iter().enumerate() {
            for (j, &col) in bending_indices.iter().enumerate() {
                bending[(row, col)] = kb * bending_block[i][j];
            }
        }

        let rho_a_l = self.material.density * A * L;
        let mut mass = Matrix6::zeros();
        mass[(0, 0)] = rho_a_l / 3.0;
        mass[(3, 3)] = rho_a_l / 3.0;
        mass[(0, 3)] = rho_a_l / 6.0;
        mass[(3, 0)] = rho_a_l / 6.0;
        #[rustfmt::skip]
        let mass_block = [
            [156.0,     22.0 * L,  54.0,      -13.0 * L],
            [22.0 * L,  4.0 * L2,  13.0 * L,  -3.0 * L2],
            [54.0,      13.0 * L,  156.0,     -22.0 * L],
            [-13.0 * L, -3.0 * L2, -22.0 * L, 4.0 * L2],
        ];
        for (i, &row) in bending_indices.iter().enumerate() {
            for (j, &col) in bending_indices.iter().enumerate() {
                mass[(row, col)] = rho_a_l / 420.0 * mass_block[i][j];
            }
        }

        // Global to local rotation
        let mut rotation = Matrix6::zeros();
        for node in 0..2 {
            let o = 3 * node;
            rotation[(o, o)] = c;
            rotation[(o, o + 1)] = s;
            rotation[(o + 1, o)] = -s;
            rotation[(o + 1, o + 1)] = c;
            rotation[(o + 2, o + 2)] = 1.0;
        }
        let to_global = |m: Matrix6<T>| rotation.transpose() * m * rotation;

        Ok(BeamMatrices {
            axial: to_global(axial),
            bending: to_global(bending),
            mass: to_global(mass),
        })
    }
}

impl<T: Real> ElementEvaluator<T> for BeamElement<T> {
    fn num_nodes(&self) -> usize {
        2
    }

    fn vars_per_node(&self) -> usize {
        3
    }

    fn design_variables(&self) -> &[usize] {
        &self.design_variables
    }

    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn evaluate(
        &self,
        input: &ElementInput<T>,
        request: ElementRequest<T>,
        output: &mut ElementOutput<T>,
    ) -> eyre::Result<()> {
        let h = self.height_value(input.design);
        let BeamMatrices { axial, bending, mass } = self.matrices(input, h)?;
        let u = Vector6::from_iterator(input.u.iter().copied());
        let a = Vector6::from_iterator(input.a.iter().copied());
        let stiffness = axial + bending;

        match request {
            ElementRequest::Residual => {
                output.residual.copy_from(&(stiffness * u + mass * a));
            }
            ElementRequest::Jacobian(coefficients) => {
                output.residual.copy_from(&(stiffness * u + mass * a));
                output
                    .jacobian
                    .copy_from(&(stiffness * coefficients.alpha + mass * coefficients.gamma));
            }
            ElementRequest::DesignDerivative => {
                if self.height.variable().is_some() {
                    // A is linear and I cubic in h
                    let d_stiffness = axial / h + bending * (3.0 / h);
                    let derivative = d_stiffness * u + mass * a / h;
                    output
                        .design_derivative
                        .column_mut(0)
                        .copy_from(&derivative);
                }
            }
        }
        Ok(())
    }

    fn mass(&self, input: &ElementInput<T>) -> eyre::Result<T> {
        let (length, _, _) = self.length(input)?;
        Ok(self.material.density * self.width * self.height_value(input.design) * length)
    }

    fn mass_design_derivative(&self, input: &ElementInput<T>, derivative: &mut [T]) -> eyre::Result<()> {
        let (length, _, _) = self.length(input)?;
        if self.height.variable().is_some() {
            derivative[0] = self.material.density * self.width * length;
        }
        Ok(())
    }
}
