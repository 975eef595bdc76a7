use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use trellis::assembly::{Assembler, MatrixFreeOperator};
use trellis::element::{
    BarElement, DesignParameter, ElementEvaluator, ElementInput, ElementKind, ElementOutput, ElementRequest,
    JacobianCoefficients, QuadElement,
};
use trellis::error::AnalysisError;
use trellis::mesh::procedural::{bar_chain, distorted_quad_grid, rectangular_quad_grid};
use trellis::mesh::Mesh;
use trellis::model::Model;
use trellis::solid::materials::UniaxialMaterial;
use trellis::sparse::krylov::LinearOperator;
use trellis::sparse::{Communicator, DistVector, PartitionMap, Universe};
use proptest::prelude::*;
use trellis::proptest::{design_vector, quad_grid};
use util::{assert_all_bitwise_eq, assert_approx_matrix_eq};

use crate::{hardening_chain_model, plane_stress_material, plate_model};

/// Deterministic displacements that do not depend on the partition.
fn test_displacement(num_dofs: usize) -> DVector<f64> {
    DVector::from_fn(num_dofs, |i, _| 1e-3 * (((i * 5 + 2) % 9) as f64 - 4.0))
}

fn plate_design(model: &Model<f64>) -> Vec<f64> {
    (0..model.num_design_variables())
        .map(|e| 0.1 + 0.01 * (e % 4) as f64)
        .collect()
}

/// Assembles the residual and tangent stiffness at the test displacement and gathers them.
fn assemble_global<E: ElementEvaluator<f64>>(
    comm: Communicator,
    model: &Model<f64, E>,
    design: &[f64],
    block_size: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let assembler = Assembler::new(comm, model, block_size).unwrap();
    let mut state = assembler.create_state();
    state.u = DistVector::from_global(assembler.layout().clone(), &test_displacement(model.num_dofs()));
    let mut residual = assembler.create_vector();
    let mut jacobian = assembler.create_matrix();
    assembler
        .assemble_residual_and_jacobian(
            state.synchronize(),
            design,
            1.0,
            JacobianCoefficients::stiffness(),
            &mut residual,
            &mut jacobian,
        )
        .unwrap();
    (jacobian.to_dense(), residual.gather())
}

#[test]
fn assembly_does_not_depend_on_partition() {
    let model = plate_model(6, 3);
    let design = plate_design(&model);
    let (reference_matrix, reference_residual) = assemble_global(Communicator::serial(), &model, &design, 1);

    for num_ranks in 1..=4 {
        for block_size in [1, 3, 5] {
            let results = Universe::run(num_ranks, |comm| assemble_global(comm, &model, &design, block_size));
            for (matrix, residual) in results {
                assert_matrix_eq!(matrix, reference_matrix, comp = abs, tol = 1e-10);
                assert_matrix_eq!(residual, reference_residual, comp = abs, tol = 1e-12);
            }
        }
    }
}

fn unconstrained_plate(mesh: Mesh<f64>) -> Model<f64> {
    let material = plane_stress_material();
    Model::from_mesh(mesh, |e, _| QuadElement::new(material, DesignParameter::Variable(e)).into())
        .expect("plate model is valid")
}

#[test]
fn distorted_grid_assembly_does_not_depend_on_partition() {
    let model = unconstrained_plate(distorted_quad_grid(5, 3, 4.0, 1.0, 0.2));
    let design = plate_design(&model);
    let (reference_matrix, reference_residual) = assemble_global(Communicator::serial(), &model, &design, 2);
    for (matrix, residual) in Universe::run(3, |comm| assemble_global(comm, &model, &design, 2)) {
        assert_approx_matrix_eq!(&matrix, &reference_matrix, abstol = 1e-10);
        assert_approx_matrix_eq!(&residual, &reference_residual, abstol = 1e-12);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn arbitrary_grids_assemble_the_same_residual_on_two_ranks(
        (mesh, design) in quad_grid(4).prop_flat_map(|mesh| {
            let num_elements = mesh.num_elements();
            (Just(mesh), design_vector(num_elements, 0.05, 0.5))
        })
    ) {
        let model = unconstrained_plate(mesh);
        let design = design.as_slice();
        let (_, reference) = assemble_global(Communicator::serial(), &model, design, 1);
        for (_, residual) in Universe::run(2, |comm| assemble_global(comm, &model, design, 1)) {
            prop_assert!((&residual - &reference).amax() <= 1e-12);
        }
    }
}

#[test]
fn constrained_rows_and_columns_are_replaced_by_identity() {
    let model = plate_model(2, 1);
    let design = plate_design(&model);
    let (matrix, residual) = assemble_global(Communicator::serial(), &model, &design, 1);
    for dof in model.constrained_dofs() {
        assert_eq!(residual[dof], 0.0);
        for other in 0..model.num_dofs() {
            let expected = if other == dof { 1.0 } else { 0.0 };
            assert_eq!(matrix[(dof, other)], expected);
            assert_eq!(matrix[(other, dof)], expected);
        }
    }
}

#[test]
fn repeated_assembly_is_bitwise_reproducible() {
    let model = plate_model(8, 2);
    let design = plate_design(&model);
    let runs: Vec<_> = (0..3)
        .map(|_| {
            let results = Universe::run(3, |comm| assemble_global(comm, &model, &design, 2));
            let (matrices, residuals): (Vec<_>, Vec<_>) = results.into_iter().unzip();
            (matrices, residuals)
        })
        .collect();
    let matrices: Vec<_> = runs.iter().map(|(matrices, _)| matrices.clone()).collect();
    let residuals: Vec<_> = runs.iter().map(|(_, residuals)| residuals.clone()).collect();
    assert_all_bitwise_eq!(matrices);
    assert_all_bitwise_eq!(residuals);
}

#[test]
fn matrix_free_operator_matches_assembled_matrix() {
    let model = plate_model(5, 2);
    let design = plate_design(&model);
    let n = model.num_dofs();
    let x_global = DVector::from_fn(n, |i, _| ((i * 3 + 1) % 7) as f64 - 3.0);

    let results = Universe::run(3, |comm| {
        let assembler = Assembler::new(comm, &model, 2).unwrap();
        let mut state = assembler.create_state();
        state.u = DistVector::from_global(assembler.layout().clone(), &test_displacement(n));
        let state = state.synchronize();
        let coefficients = JacobianCoefficients::new(1.0, 0.0, 3.0);

        let mut matrix = assembler.create_matrix();
        assembler
            .assemble_matrix(state, &design, coefficients, 1.0, &mut matrix)
            .unwrap();
        let operator = MatrixFreeOperator::new(&assembler, state, &design, coefficients, 1.0).unwrap();

        let mut x = DistVector::from_global(assembler.layout().clone(), &x_global);
        let mut y_assembled = assembler.create_vector();
        let mut y_matrix_free = assembler.create_vector();
        let x = x.synchronize();
        matrix.multiply(&x, &mut y_assembled);
        operator.apply(&mut y_matrix_free, x).unwrap();

        let transposed = operator.transpose();
        let mut y_transposed = assembler.create_vector();
        let mut y_transposed_free = assembler.create_vector();
        matrix.transpose_multiply(x.vector(), &mut y_transposed);
        transposed.apply(&mut y_transposed_free, x).unwrap();

        (
            y_assembled.gather(),
            y_matrix_free.gather(),
            y_transposed.gather(),
            y_transposed_free.gather(),
        )
    });

    for (assembled, matrix_free, transposed, transposed_free) in results {
        assert_approx_matrix_eq!(&matrix_free, &assembled, abstol = 1e-10);
        assert_approx_matrix_eq!(&transposed_free, &transposed, abstol = 1e-10);
    }
}

/// A bar that refuses to be evaluated.
struct FailingBar {
    bar: BarElement<f64>,
    fail: bool,
}

impl ElementEvaluator<f64> for FailingBar {
    fn num_nodes(&self) -> usize {
        self.bar.num_nodes()
    }

    fn vars_per_node(&self) -> usize {
        self.bar.vars_per_node()
    }

    fn design_variables(&self) -> &[usize] {
        self.bar.design_variables()
    }

    fn evaluate(
        &self,
        input: &ElementInput<f64>,
        request: ElementRequest<f64>,
        output: &mut ElementOutput<f64>,
    ) -> eyre::Result<()> {
        if self.fail {
            eyre::bail!("negative strain energy");
        }
        self.bar.evaluate(input, request, output)
    }

    fn mass(&self, input: &ElementInput<f64>) -> eyre::Result<f64> {
        self.bar.mass(input)
    }

    fn mass_design_derivative(&self, input: &ElementInput<f64>, derivative: &mut [f64]) -> eyre::Result<()> {
        self.bar.mass_design_derivative(input, derivative)
    }
}

#[test]
fn element_failure_aborts_assembly_on_every_rank() {
    let material = UniaxialMaterial::linear(100.0, 1.0);
    let mut model = Model::from_mesh(bar_chain(9, 1.0), |e, _| FailingBar {
        bar: BarElement::new(material, DesignParameter::Fixed(0.5)),
        fail: e == 3 || e == 6,
    })
    .unwrap();
    model.fix_node(0).unwrap();

    let results = Universe::run(3, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut state = assembler.create_state();
        let mut residual = assembler.create_vector();
        residual.fill(7.0);
        let result = assembler.assemble_residual(state.synchronize(), &[], 1.0, &mut residual);
        let unchanged = residual.owned().iter().all(|&value| value == 7.0);
        (result, unchanged)
    });

    for (result, unchanged) in results {
        match result {
            Err(AnalysisError::ElementEvaluation { element, message }) => {
                assert_eq!(element, 3);
                assert!(message.contains("negative strain energy"));
            }
            other => panic!("expected an element evaluation error, got {:?}", other),
        }
        assert!(unchanged);
    }
}

#[test]
fn pattern_mismatch_leaves_residual_and_jacobian_untouched() {
    let model = plate_model(4, 2);
    let other_model = plate_model(2, 1);
    let design = plate_design(&model);
    let other_design = plate_design(&other_model);

    let other_assembler = Assembler::new(Communicator::serial(), &other_model, 1).unwrap();
    let mut other_state = other_assembler.create_state();
    let mut jacobian = other_assembler.create_matrix();
    other_assembler
        .assemble_matrix(
            other_state.synchronize(),
            &other_design,
            JacobianCoefficients::stiffness(),
            1.0,
            &mut jacobian,
        )
        .unwrap();
    let jacobian_before = jacobian.to_dense();

    let assembler = Assembler::new(Communicator::serial(), &model, 1).unwrap();
    let mut state = assembler.create_state();
    let mut residual = assembler.create_vector();
    residual.fill(7.0);
    let result = assembler.assemble_residual_and_jacobian(
        state.synchronize(),
        &design,
        1.0,
        JacobianCoefficients::stiffness(),
        &mut residual,
        &mut jacobian,
    );

    assert!(matches!(result, Err(AnalysisError::Pattern(_))), "got {:?}", result);
    assert!(residual.owned().iter().all(|&value| value == 7.0));
    assert_matrix_eq!(jacobian.to_dense(), jacobian_before, comp = exact);

    let result = assembler.assemble_matrix(
        state.synchronize(),
        &design,
        JacobianCoefficients::stiffness(),
        1.0,
        &mut jacobian,
    );
    assert!(matches!(result, Err(AnalysisError::Pattern(_))), "got {:?}", result);
    assert_matrix_eq!(jacobian.to_dense(), jacobian_before, comp = exact);
}

#[test]
fn hardening_chain_residual_matches_internal_forces() {
    // Uniform strain in every bar, so interior nodes are in equilibrium
    // and only the free end carries a net force.
    let model = hardening_chain_model(4, 0.0);
    let strain: f64 = 0.1;
    let force = 0.5 * 100.0 * (strain + 50.0 * strain.powi(3));

    let results = Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut state = assembler.create_state();
        let u: DVector<f64> = DVector::from_fn(model.num_dofs(), |i, _| {
            if i % 2 == 0 {
                strain * 0.25 * (i / 2) as f64
            } else {
                0.0
            }
        });
        state.u = DistVector::from_global(assembler.layout().clone(), &u);
        let mut residual = assembler.create_vector();
        assembler
            .assemble_residual(state.synchronize(), &[], 1.0, &mut residual)
            .unwrap();
        residual.gather()
    });

    let mut expected = DVector::zeros(10);
    expected[8] = force;
    for residual in results {
        assert_approx_matrix_eq!(&residual, &expected, abstol = 1e-12);
    }
}

#[test]
fn structural_mass_and_gradient() {
    let mesh = rectangular_quad_grid(4, 2, 2.0, 1.0);
    let material = plane_stress_material();
    let model: Model<f64> = Model::from_mesh(mesh, |e, _| {
        ElementKind::from(QuadElement::new(material, DesignParameter::Variable(e)))
    })
    .unwrap();
    let design = vec![0.1; 8];

    let results = Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 3).unwrap();
        let mass = assembler.structural_mass(&design).unwrap();
        let gradient = assembler.structural_mass_gradient(&design).unwrap();
        (mass, gradient)
    });

    for (mass, gradient) in results {
        assert!((mass - 0.2).abs() <= 1e-12);
        assert_approx_matrix_eq!(&gradient, &DVector::from_element(8, 0.25), abstol = 1e-12);
    }
}

#[test]
fn partition_must_match_model() {
    let model = plate_model(2, 1);
    let partition = PartitionMap::block_cyclic(model.mesh().num_nodes(), 3, 1, 1);
    let result = Assembler::with_partition(Communicator::serial(), &model, partition);
    assert!(matches!(result, Err(AnalysisError::InvalidModel(_))));
}

