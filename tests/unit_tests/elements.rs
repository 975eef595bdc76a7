use nalgebra::{DMatrix, DVector, Point2};
use trellis::element::{
    BarElement, BeamElement, DesignParameter, ElementEvaluator, ElementInput, ElementOutput, ElementRequest,
    JacobianCoefficients, QuadElement,
};
use trellis::optimize::calculus::approximate_jacobian_fd;
use trellis::solid::materials::{OrthotropicPly, PlyAngle, UniaxialMaterial};
use util::assert_approx_matrix_eq;

use crate::plane_stress_material;

fn try_evaluate<E: ElementEvaluator<f64>>(
    element: &E,
    coordinates: &[Point2<f64>],
    u: &DVector<f64>,
    a: &DVector<f64>,
    design: &[f64],
    request: ElementRequest<f64>,
) -> eyre::Result<ElementOutput<f64>> {
    let v = DVector::zeros(u.len());
    let input = ElementInput {
        coordinates,
        u: u.into(),
        v: (&v).into(),
        a: a.into(),
        design,
    };
    let mut output = ElementOutput::zeros(u.len(), element.design_variables().len());
    element.evaluate(&input, request, &mut output)?;
    Ok(output)
}

fn evaluate<E: ElementEvaluator<f64>>(
    element: &E,
    coordinates: &[Point2<f64>],
    u: &DVector<f64>,
    a: &DVector<f64>,
    design: &[f64],
    request: ElementRequest<f64>,
) -> ElementOutput<f64> {
    try_evaluate(element, coordinates, u, a, design, request).unwrap()
}

/// Checks the Jacobian blend `dR/du + 2.5 dR/da` against central differences of the residual.
fn check_jacobian<E: ElementEvaluator<f64>>(
    element: &E,
    coordinates: &[Point2<f64>],
    u: &DVector<f64>,
    a: &DVector<f64>,
    design: &[f64],
    abstol: f64,
) {
    let n = u.len();
    let coefficients = JacobianCoefficients::new(1.0, 0.0, 2.5);
    let output = evaluate(element, coordinates, u, a, design, ElementRequest::Jacobian(coefficients));

    let residual_u = |u: &DVector<f64>| evaluate(element, coordinates, u, a, design, ElementRequest::Residual).residual;
    let residual_a = |a: &DVector<f64>| evaluate(element, coordinates, u, a, design, ElementRequest::Residual).residual;
    let mut u_fd = u.clone();
    let mut a_fd = a.clone();
    let du = approximate_jacobian_fd(n, |x, mut r| r.copy_from(&residual_u(&x.clone_owned())), &mut u_fd, 1e-6);
    let da = approximate_jacobian_fd(n, |x, mut r| r.copy_from(&residual_a(&x.clone_owned())), &mut a_fd, 1e-6);

    let expected = du + da * 2.5;
    assert_approx_matrix_eq!(&output.jacobian, &expected, abstol = abstol);
    assert_approx_matrix_eq!(&output.residual, &residual_u(u), abstol = 1e-12);
}

fn check_design_derivative<E: ElementEvaluator<f64>>(
    element: &E,
    coordinates: &[Point2<f64>],
    u: &DVector<f64>,
    a: &DVector<f64>,
    design: &[f64],
    abstol: f64,
) {
    let output = evaluate(element, coordinates, u, a, design, ElementRequest::DesignDerivative);
    let mut x = DVector::from_column_slice(design);
    let expected = approximate_jacobian_fd(
        u.len(),
        |x, mut r| {
            let x = x.clone_owned();
            r.copy_from(&evaluate(element, coordinates, u, a, x.as_slice(), ElementRequest::Residual).residual)
        },
        &mut x,
        1e-6,
    );
    assert_approx_matrix_eq!(&output.design_derivative, &expected, abstol = abstol);
}

fn hardening_bar() -> BarElement<f64> {
    let material = UniaxialMaterial {
        young: 100.0,
        hardening: 50.0,
        density: 2.0,
    };
    BarElement::new(material, DesignParameter::Variable(4))
}

fn inclined_bar() -> [Point2<f64>; 2] {
    [Point2::new(0.2, 0.1), Point2::new(1.4, 0.6)]
}

#[test]
fn bar_jacobian_matches_finite_differences() {
    let u = DVector::from_column_slice(&[0.01, -0.02, 0.15, 0.03]);
    let a = DVector::from_column_slice(&[0.3, -0.1, 0.2, 0.4]);
    check_jacobian(&hardening_bar(), &inclined_bar(), &u, &a, &[0.5], 1e-5);
}

#[test]
fn bar_design_derivative_matches_finite_differences() {
    let u = DVector::from_column_slice(&[0.01, -0.02, 0.15, 0.03]);
    let a = DVector::from_column_slice(&[0.3, -0.1, 0.2, 0.4]);
    check_design_derivative(&hardening_bar(), &inclined_bar(), &u, &a, &[0.5], 1e-6);
}

#[test]
fn linear_bar_stiffness_matches_closed_form() {
    let bar = BarElement::new(UniaxialMaterial::linear(100.0, 1.0), DesignParameter::Fixed(0.5));
    let coordinates = [Point2::new(1.0, 0.0), Point2::new(3.0, 0.0)];
    let zeros = DVector::zeros(4);
    let output = evaluate(
        &bar,
        &coordinates,
        &zeros,
        &zeros,
        &[],
        ElementRequest::Jacobian(JacobianCoefficients::stiffness()),
    );

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(4, 4, &[
         25.0, 0.0, -25.0, 0.0,
          0.0, 0.0,   0.0, 0.0,
        -25.0, 0.0,  25.0, 0.0,
          0.0, 0.0,   0.0, 0.0,
    ]);
    assert_approx_matrix_eq!(&output.jacobian, &expected, abstol = 1e-12);
}

#[test]
fn degenerate_bar_is_an_error() {
    let coordinates = [Point2::new(1.0, 1.0), Point2::new(1.0, 1.0)];
    let zeros = DVector::zeros(4);
    let result = try_evaluate(&hardening_bar(), &coordinates, &zeros, &zeros, &[0.5], ElementRequest::Residual);
    assert!(result.is_err());
}

fn inclined_beam() -> (BeamElement<f64>, [Point2<f64>; 2]) {
    let beam = BeamElement::new(UniaxialMaterial::linear(1.2e5, 3.0), 1.0, DesignParameter::Variable(0));
    (beam, [Point2::new(0.0, 0.0), Point2::new(0.6, 0.8)])
}

#[test]
fn beam_jacobian_matches_finite_differences() {
    let (beam, coordinates) = inclined_beam();
    let u = DVector::from_column_slice(&[0.001, -0.002, 0.01, 0.003, 0.004, -0.02]);
    let a = DVector::from_column_slice(&[0.5, 0.2, -0.3, 0.1, -0.4, 0.6]);
    check_jacobian(&beam, &coordinates, &u, &a, &[0.1], 1e-3);
}

#[test]
fn beam_design_derivative_matches_finite_differences() {
    let (beam, coordinates) = inclined_beam();
    let u = DVector::from_column_slice(&[0.001, -0.002, 0.01, 0.003, 0.004, -0.02]);
    let a = DVector::from_column_slice(&[0.5, 0.2, -0.3, 0.1, -0.4, 0.6]);
    check_design_derivative(&beam, &coordinates, &u, &a, &[0.1], 1e-4);
}

#[test]
fn beam_rigid_body_motion_has_no_internal_force() {
    let (beam, coordinates) = inclined_beam();
    let theta = 1e-3;
    let mut u = DVector::zeros(6);
    for (node, x) in coordinates.iter().enumerate() {
        u[3 * node] = 0.02 - theta * x.y;
        u[3 * node + 1] = -0.01 + theta * x.x;
        u[3 * node + 2] = theta;
    }
    let output = evaluate(&beam, &coordinates, &u, &DVector::zeros(6), &[0.1], ElementRequest::Residual);
    assert_approx_matrix_eq!(&output.residual, &DVector::<f64>::zeros(6), abstol = 1e-9);
}

fn distorted_quad() -> [Point2<f64>; 4] {
    [
        Point2::new(0.0, 0.0),
        Point2::new(1.2, 0.1),
        Point2::new(1.1, 0.9),
        Point2::new(-0.1, 1.0),
    ]
}

fn quad_state() -> (DVector<f64>, DVector<f64>) {
    let u = DVector::from_column_slice(&[0.0, 0.01, 0.02, -0.01, 0.015, 0.03, -0.005, 0.02]);
    let a = DVector::from_column_slice(&[1.0, -0.5, 0.25, 0.5, -1.0, 0.75, 0.5, -0.25]);
    (u, a)
}

#[test]
fn quad_jacobian_matches_finite_differences() {
    let quad = QuadElement::new(plane_stress_material(), DesignParameter::Variable(2));
    let (u, a) = quad_state();
    check_jacobian(&quad, &distorted_quad(), &u, &a, &[0.2], 1e-5);
}

#[test]
fn quad_ply_angle_derivative_matches_finite_differences() {
    let ply = OrthotropicPly {
        e1: 1000.0,
        e2: 200.0,
        nu12: 0.25,
        g12: 100.0,
        density: 1.5,
        angle: PlyAngle::Design(0),
    };
    let quad = QuadElement::new(ply, DesignParameter::Variable(3)).with_material_design([7]);
    assert_eq!(quad.design_variables(), &[3, 7]);

    let (u, a) = quad_state();
    let design = [0.2, 0.4];
    check_jacobian(&quad, &distorted_quad(), &u, &a, &design, 1e-5);
    check_design_derivative(&quad, &distorted_quad(), &u, &a, &design, 1e-6);
}

#[test]
fn quad_rigid_body_motion_has_no_internal_force() {
    let quad = QuadElement::new(plane_stress_material(), DesignParameter::Fixed(0.2));
    let coordinates = distorted_quad();
    let theta = 1e-3;
    let mut u = DVector::zeros(8);
    for (node, x) in coordinates.iter().enumerate() {
        u[2 * node] = 0.5 - theta * x.y;
        u[2 * node + 1] = 0.25 + theta * x.x;
    }
    let output = evaluate(&quad, &coordinates, &u, &DVector::zeros(8), &[], ElementRequest::Residual);
    assert_approx_matrix_eq!(&output.residual, &DVector::<f64>::zeros(8), abstol = 1e-10);
}

#[test]
fn quad_mass_matrix_sums_to_element_mass() {
    let quad = QuadElement::new(plane_stress_material(), DesignParameter::Variable(0));
    let coordinates = distorted_quad();
    let zeros = DVector::zeros(8);
    let design = [0.2];
    let output = evaluate(
        &quad,
        &coordinates,
        &zeros,
        &zeros,
        &design,
        ElementRequest::Jacobian(JacobianCoefficients::mass()),
    );

    let input = ElementInput {
        coordinates: &coordinates,
        u: (&zeros).into(),
        v: (&zeros).into(),
        a: (&zeros).into(),
        design: &design,
    };
    let mass = quad.mass(&input).unwrap();
    let mut total_x = 0.0;
    for i in 0..4 {
        for j in 0..4 {
            total_x += output.jacobian[(2 * i, 2 * j)];
        }
    }
    assert!((total_x - mass).abs() <= 1e-12);

    let mut derivative = [0.0];
    quad.mass_design_derivative(&input, &mut derivative).unwrap();
    assert!((derivative[0] * design[0] - mass).abs() <= 1e-12);
}

#[test]
fn clockwise_quad_is_reported_as_inverted() {
    let quad = QuadElement::new(plane_stress_material(), DesignParameter::Fixed(0.2));
    let mut coordinates = distorted_quad();
    coordinates.reverse();
    let zeros = DVector::zeros(8);
    let err = try_evaluate(&quad, &coordinates, &zeros, &zeros, &[], ElementRequest::Residual).unwrap_err();
    assert!(format!("{}", err).contains("Inverted"));
}

#[test]
#[should_panic]
fn variable_thickness_without_design_value_panics() {
    let quad = QuadElement::new(plane_stress_material(), DesignParameter::Variable(0));
    let zeros = DVector::zeros(8);
    let _ = try_evaluate(&quad, &distorted_quad(), &zeros, &zeros, &[], ElementRequest::Residual);
}
