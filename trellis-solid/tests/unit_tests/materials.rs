use crate::{isotropic_material, plane_strain, ply};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{DVector, DVectorView, DVectorViewMut, Matrix3, Vector1, Vector3};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use trellis_optimize::calculus::{approximate_gradient_fd, approximate_jacobian_fd};
use trellis_solid::materials::{IsotropicPlaneStress, OrthotropicPly, PlaneStressMaterial, PlyAngle, UniaxialMaterial, YoungPoisson};
use trellis_solid::ConstitutiveModel;

/// Finite difference approximation of the tangent of a plane stress model.
fn plane_tangent_fd(model: &impl ConstitutiveModel<f64, 3>, strain: &Vector3<f64>, design: &[f64]) -> Matrix3<f64> {
    let mut x = DVector::from_column_slice(strain.as_slice());
    let j = approximate_jacobian_fd(
        3,
        |eps: DVectorView<f64>, mut sigma: DVectorViewMut<f64>| {
            let eps = Vector3::new(eps[0], eps[1], eps[2]);
            sigma.copy_from(&model.compute_stress(&eps, design).0);
        },
        &mut x,
        1e-6,
    );
    Matrix3::from_iterator(j.iter().copied())
}

#[test]
fn uniaxial_linear_stress() {
    let material = UniaxialMaterial::linear(200.0, 7.8);
    let (stress, tangent) = material.compute_stress(&Vector1::new(0.01), &[]);

    assert_scalar_eq!(stress[0], 2.0, comp = float);
    assert_scalar_eq!(tangent[0], 200.0, comp = float);
    assert_eq!(ConstitutiveModel::<f64, 1>::density(&material), 7.8);
    assert_eq!(ConstitutiveModel::<f64, 1>::num_design_variables(&material), 0);
}

#[test]
fn uniaxial_hardening_tangent_matches_finite_difference() {
    let material = UniaxialMaterial {
        young: 200.0,
        hardening: 5e3,
        density: 1.0,
    };

    for &eps in &[-0.02, 0.0, 0.005, 0.03] {
        let (stress, tangent) = material.compute_stress(&Vector1::new(eps), &[]);
        assert_scalar_eq!(stress[0], 200.0 * (eps + 5e3 * eps * eps * eps), comp = abs, tol = 1e-12);

        let mut x = DVector::from_element(1, eps);
        let tangent_fd = approximate_gradient_fd(
            |x: DVectorView<f64>| material.compute_stress(&Vector1::new(x[0]), &[]).0[0],
            &mut x,
            1e-7,
        );
        assert_scalar_eq!(tangent[(0, 0)], tangent_fd[0], comp = abs, tol = 1e-5 * tangent[(0, 0)]);
    }
}

#[test]
fn isotropic_plane_stress_stiffness() {
    let material = isotropic_material();
    let c = 1e3 / (1.0 - 0.09);
    #[rustfmt::skip]
    let expected = Matrix3::new(c, 0.3 * c, 0.0,
                                0.3 * c, c, 0.0,
                                0.0, 0.0, 0.35 * c);

    let (stress, tangent) = material.compute_stress(&plane_strain(), &[]);
    assert_matrix_eq!(tangent, expected, comp = abs, tol = 1e-9);
    assert_matrix_eq!(stress, expected * plane_strain(), comp = abs, tol = 1e-9);
    assert_matrix_eq!(tangent, plane_tangent_fd(&material, &plane_strain(), &[]), comp = abs, tol = 1e-4);
}

#[test]
fn ply_without_rotation_uses_material_stiffness() {
    let ply = ply(PlyAngle::Fixed(0.0));
    let (_, tangent) = ply.compute_stress(&plane_strain(), &[]);

    let nu21 = 0.3 * 10.0 / 135.0;
    let denom = 1.0 - 0.3 * nu21;
    assert_scalar_eq!(tangent[(0, 0)], 135.0 / denom, comp = abs, tol = 1e-10);
    assert_scalar_eq!(tangent[(1, 1)], 10.0 / denom, comp = abs, tol = 1e-10);
    assert_scalar_eq!(tangent[(0, 1)], 3.0 / denom, comp = abs, tol = 1e-10);
    assert_scalar_eq!(tangent[(2, 2)], 5.0, comp = abs, tol = 1e-10);
    assert_matrix_eq!(tangent, ply.material_stiffness(), comp = abs, tol = 1e-10);
}

#[test]
fn ply_rotated_by_right_angle_swaps_fiber_directions() {
    let q = ply(PlyAngle::Fixed(0.0)).material_stiffness();
    let q_bar = ply(PlyAngle::Fixed(FRAC_PI_2)).stiffness(&[]);

    assert_scalar_eq!(q_bar[(0, 0)], q[(1, 1)], comp = abs, tol = 1e-10);
    assert_scalar_eq!(q_bar[(1, 1)], q[(0, 0)], comp = abs, tol = 1e-10);
    assert_scalar_eq!(q_bar[(0, 1)], q[(0, 1)], comp = abs, tol = 1e-10);
    assert_scalar_eq!(q_bar[(2, 2)], q[(2, 2)], comp = abs, tol = 1e-10);
    assert_scalar_eq!(q_bar[(0, 2)], 0.0, comp = abs, tol = 1e-10);
}

#[test]
fn isotropic_ply_is_invariant_under_rotation() {
    let young = 70.0;
    let poisson = 0.25;
    let isotropic = IsotropicPlaneStress {
        parameters: YoungPoisson { young, poisson },
        density: 1.0,
    };
    for &theta in &[0.3, FRAC_PI_4, 2.0] {
        let ply = OrthotropicPly {
            e1: young,
            e2: young,
            nu12: poisson,
            g12: young / (2.0 * (1.0 + poisson)),
            density: 1.0,
            angle: PlyAngle::Fixed(theta),
        };
        assert_matrix_eq!(ply.stiffness(&[]), isotropic.stiffness(), comp = abs, tol = 1e-10);
    }
}

#[test]
fn rotated_ply_tangent_is_symmetric_and_matches_finite_difference() {
    let ply = ply(PlyAngle::Fixed(0.4));
    let (stress, tangent) = ply.compute_stress(&plane_strain(), &[]);

    assert_matrix_eq!(tangent, tangent.transpose(), comp = abs, tol = 1e-12);
    assert_matrix_eq!(stress, tangent * plane_strain(), comp = abs, tol = 1e-12);
    assert_matrix_eq!(tangent, plane_tangent_fd(&ply, &plane_strain(), &[]), comp = abs, tol = 1e-5);
}

#[test]
fn ply_angle_design_derivative_matches_finite_difference() {
    let design = [0.07, 0.6];
    let ply = ply(PlyAngle::Design(1));
    assert_eq!(ply.num_design_variables(), 2);

    let strain = plane_strain();
    let derivative = ply.compute_stress_design_derivative(&strain, &design, 1);
    assert_eq!(ply.compute_stress_design_derivative(&strain, &design, 0), Vector3::zeros());

    let mut x = DVector::from_column_slice(&design);
    let j = approximate_jacobian_fd(
        3,
        |x: DVectorView<f64>, mut sigma: DVectorViewMut<f64>| {
            sigma.copy_from(&ply.compute_stress(&strain, x.as_slice()).0);
        },
        &mut x,
        1e-6,
    );
    assert_matrix_eq!(j.column(1), derivative, comp = abs, tol = 1e-6);
    assert_matrix_eq!(j.column(0), Vector3::zeros(), comp = abs, tol = 1e-12);
}

#[test]
fn plane_stress_material_dispatches_to_variant() {
    let design = [0.35];
    let materials: Vec<PlaneStressMaterial<f64>> =
        vec![isotropic_material().into(), ply(PlyAngle::Design(0)).into()];

    let (stress, tangent) = materials[0].compute_stress(&plane_strain(), &design);
    assert_eq!((stress, tangent), isotropic_material().compute_stress(&plane_strain(), &design));
    assert_eq!(materials[0].density(), 2.0);
    assert_eq!(materials[0].num_design_variables(), 0);

    let (stress, tangent) = materials[1].compute_stress(&plane_strain(), &design);
    assert_eq!((stress, tangent), ply(PlyAngle::Design(0)).compute_stress(&plane_strain(), &design));
    assert_eq!(materials[1].density(), 1.6);
    assert_eq!(materials[1].num_design_variables(), 1);
    assert_eq!(
        materials[1].compute_stress_design_derivative(&plane_strain(), &design, 0),
        ply(PlyAngle::Design(0)).compute_stress_design_derivative(&plane_strain(), &design, 0)
    );
}
