use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;
use trellis::analysis::{FrequencyAnalysis, FrequencySettings, PreconditionerKind, SolverSettings};
use trellis::assembly::Assembler;
use trellis::element::JacobianCoefficients;
use trellis::error::AnalysisError;
use trellis::model::Model;
use trellis::sparse::multigrid::MultigridSettings;
use trellis::sparse::Universe;
use util::assert_approx_matrix_eq;

use crate::{cantilever_model, plate_model, uniform_design, BEAM_HEIGHT};

fn settings(num_modes: usize) -> FrequencySettings {
    FrequencySettings {
        num_modes,
        subspace_size: 2 * num_modes + 2,
        tolerance: 1e-12,
        max_iterations: 200,
        solver: SolverSettings {
            preconditioner: PreconditionerKind::Multigrid(MultigridSettings {
                coarse_size: 100_000,
                ..MultigridSettings::default()
            }),
            tolerance: 1e-12,
            ..SolverSettings::default()
        },
        ..FrequencySettings::default()
    }
}

/// Stiffness and mass matrices restricted to the unconstrained degrees of freedom.
fn free_matrices(stiffness: &DMatrix<f64>, mass: &DMatrix<f64>, constrained: &[usize]) -> (DMatrix<f64>, DMatrix<f64>) {
    let free: Vec<_> = (0..stiffness.nrows())
        .filter(|dof| !constrained.contains(dof))
        .collect();
    let restrict = |matrix: &DMatrix<f64>| DMatrix::from_fn(free.len(), free.len(), |i, j| matrix[(free[i], free[j])]);
    (restrict(stiffness), restrict(mass))
}

/// Ascending eigenvalues of `K x = lambda M x` by dense Cholesky reduction.
fn dense_eigenvalues(stiffness: DMatrix<f64>, mass: DMatrix<f64>) -> Vec<f64> {
    let l = mass.cholesky().unwrap().l();
    let l_inv = l.clone().try_inverse().unwrap();
    let reduced = &l_inv * stiffness * l_inv.transpose();
    let reduced = (&reduced + reduced.transpose()) * 0.5;
    let mut eigenvalues: Vec<f64> = reduced.symmetric_eigen().eigenvalues.iter().copied().collect();
    eigenvalues.sort_by(|a, b| a.partial_cmp(b).unwrap());
    eigenvalues
}

/// Runs the subspace iteration and a dense reference on the same matrices.
fn compare_with_dense(model: &Model<f64>, num_ranks: usize, design: f64, num_modes: usize) -> Vec<f64> {
    let num_variables = model.num_design_variables();
    let results = Universe::run(num_ranks, |comm| {
        let assembler = Assembler::new(comm, model, 2).unwrap();
        let context = uniform_design(num_variables, design);
        let output = FrequencyAnalysis::new(&assembler, settings(num_modes))
            .solve(&context)
            .unwrap();

        let mut state = assembler.create_state();
        let state = state.synchronize();
        let mut stiffness = assembler.create_matrix();
        let mut mass = assembler.create_matrix();
        let design = context.values().as_slice();
        assembler
            .assemble_matrix(state, design, JacobianCoefficients::stiffness(), 1.0, &mut stiffness)
            .unwrap();
        assembler
            .assemble_matrix(state, design, JacobianCoefficients::mass(), 0.0, &mut mass)
            .unwrap();
        (output, stiffness.to_dense(), mass.to_dense())
    });

    let constrained = model.constrained_dofs();
    let mut lowest = Vec::new();
    for (output, stiffness, mass) in results {
        let (k, m) = free_matrices(&stiffness, &mass, &constrained);
        let expected = dense_eigenvalues(k, m);

        assert_eq!(output.eigenvalues.len(), num_modes);
        for (computed, expected) in output.eigenvalues.iter().zip(&expected) {
            assert!((computed - expected).abs() <= 1e-7 * expected, "{} vs {}", computed, expected);
        }
        for (frequency, eigenvalue) in output.frequencies.iter().zip(&output.eigenvalues) {
            assert!((frequency - eigenvalue.sqrt() / (2.0 * PI)).abs() <= 1e-12 * frequency);
        }

        // Mass-orthonormal modes that vanish at constrained degrees of freedom
        let modes = DMatrix::from_columns(&output.modes);
        let gram = modes.transpose() * &mass * &modes;
        assert_approx_matrix_eq!(&gram, &DMatrix::<f64>::identity(num_modes, num_modes), abstol = 1e-8);
        for mode in &output.modes {
            for &dof in &constrained {
                assert_eq!(mode[dof], 0.0);
            }
        }
        lowest = output.eigenvalues.clone();
    }
    lowest
}

#[test]
fn cantilever_frequencies_match_dense_solution() {
    let model = cantilever_model(10);
    for num_ranks in [1, 3] {
        let eigenvalues = compare_with_dense(&model, num_ranks, BEAM_HEIGHT, 3);
        // First bending mode of a clamped beam, (1.8751)^4 EI / (rho A L^4)
        let beam_theory = 1.875_104_068_7_f64.powi(4) / BEAM_HEIGHT;
        assert!((eigenvalues[0] - beam_theory).abs() <= 1e-3 * beam_theory);
    }
}

#[test]
fn plate_frequencies_match_dense_solution() {
    let model = plate_model(6, 2);
    compare_with_dense(&model, 2, 0.1, 4);
}

#[test]
fn frequencies_are_independent_of_rank_count() {
    let model = plate_model(6, 2);
    let solve = |num_ranks| {
        Universe::run(num_ranks, |comm| {
            let assembler = Assembler::new(comm, &model, 1).unwrap();
            FrequencyAnalysis::new(&assembler, settings(2))
                .solve(&uniform_design(12, 0.1))
                .unwrap()
                .eigenvalues
        })
    };
    let reference = DVector::from_vec(solve(1).remove(0));
    for eigenvalues in solve(4) {
        let eigenvalues = DVector::from_vec(eigenvalues);
        assert_approx_matrix_eq!(&eigenvalues, &reference, abstol = 1e-8 * reference[1]);
    }
}

#[test]
fn invalid_mode_counts_are_rejected() {
    let model = cantilever_model(2);
    Universe::run(1, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let context = uniform_design(2, BEAM_HEIGHT);
        for num_modes in [0, 7] {
            let settings = FrequencySettings {
                num_modes,
                subspace_size: num_modes,
                ..FrequencySettings::default()
            };
            let result = FrequencyAnalysis::new(&assembler, settings).solve(&context);
            assert!(matches!(result, Err(AnalysisError::InvalidModel(_))));
        }
    });
}

#[test]
fn unconverged_iteration_reports_last_eigenvalue_change() {
    let model = cantilever_model(4);
    Universe::run(1, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let context = uniform_design(4, BEAM_HEIGHT);
        let settings = FrequencySettings {
            tolerance: 0.0,
            max_iterations: 2,
            ..settings(2)
        };
        match FrequencyAnalysis::new(&assembler, settings).solve(&context) {
            Err(AnalysisError::ConvergenceFailure {
                solver,
                iterations,
                residual_norm,
            }) => {
                assert_eq!(solver, "Subspace iteration");
                assert_eq!(iterations, 2);
                assert!(residual_norm.is_finite());
                assert!(residual_norm > 0.0);
            }
            other => panic!("expected a convergence failure, got {:?}", other.map(|output| output.iterations)),
        }
    });
}
