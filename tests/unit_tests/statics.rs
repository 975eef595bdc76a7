use nalgebra::{DMatrix, DVector, Point2};
use trellis::analysis::{KrylovMethod, LinearSolver, PreconditionerKind, SolverSettings, StaticAnalysis, StaticSettings};
use trellis::assembly::Assembler;
use trellis::element::{ElementEvaluator, ElementInput, ElementOutput, ElementRequest, JacobianCoefficients};
use trellis::error::AnalysisError;
use trellis::model::Model;
use trellis::optimize::newton::{NewtonSettings, NewtonState};
use trellis::sparse::{Communicator, Universe};
use util::assert_approx_matrix_eq;

use crate::{cantilever_model, hardening_chain_model, plate_model, uniform_design, BEAM_HEIGHT};

fn solve_displacement(model: &Model<f64>, num_ranks: usize, design: f64, settings: &StaticSettings<f64>) -> Vec<DVector<f64>> {
    let num_variables = model.num_design_variables();
    Universe::run(num_ranks, |comm| {
        let assembler = Assembler::new(comm, model, 2).unwrap();
        let context = uniform_design(num_variables, design);
        let mut analysis = StaticAnalysis::new(&assembler, settings.clone());
        analysis.solve(&context).unwrap();
        assert_eq!(analysis.newton_state(), NewtonState::Converged);
        analysis.displacement().gather()
    })
}

/// Axial strain of a uniformly stretched hardening chain of unit length.
fn chain_equilibrium_error(u: &DVector<f64>, num_elements: usize, load: f64) -> f64 {
    let strain = u[2 * num_elements];
    let force = 0.5 * 100.0 * (strain + 50.0 * strain.powi(3));
    (force - load).abs()
}

#[test]
fn cantilever_tip_matches_beam_theory() {
    let n = 8;
    let model = cantilever_model(n);
    for num_ranks in [1, 3] {
        for u in solve_displacement(&model, num_ranks, BEAM_HEIGHT, &StaticSettings::default()) {
            // P L^3 / 3 E I and P L^2 / 2 E I with P = L = EI = 1
            assert!((u[3 * n + 1] - 1.0 / 3.0).abs() <= 1e-8);
            assert!((u[3 * n + 2] - 0.5).abs() <= 1e-8);
            assert_eq!(u[0], 0.0);
            assert_eq!(u[1], 0.0);
            assert_eq!(u[2], 0.0);
        }
    }
}

#[test]
fn plate_solution_does_not_depend_on_rank_count() {
    let model = plate_model(8, 2);
    let settings = StaticSettings::default();
    let reference = solve_displacement(&model, 1, 0.1, &settings).remove(0);
    assert!(reference.amax() > 0.0);
    for num_ranks in [2, 3, 4] {
        for u in solve_displacement(&model, num_ranks, 0.1, &settings) {
            assert_approx_matrix_eq!(&u, &reference, abstol = 1e-6 * reference.amax());
        }
    }
}

#[test]
fn matrix_free_solution_matches_assembled_solution() {
    let model = plate_model(8, 2);
    let assembled = solve_displacement(&model, 2, 0.1, &StaticSettings::default());
    let matrix_free_settings = StaticSettings {
        solver: SolverSettings {
            matrix_free: true,
            ..SolverSettings::default()
        },
        ..StaticSettings::default()
    };
    let matrix_free = solve_displacement(&model, 2, 0.1, &matrix_free_settings);
    for (a, b) in assembled.iter().zip(&matrix_free) {
        assert_approx_matrix_eq!(a, b, abstol = 1e-6 * a.amax());
    }
}

#[test]
fn prescribed_values_are_met_exactly() {
    let (nx, ny) = (16, 4);
    let mut model = plate_model(nx, ny);
    let corner = ny * (nx + 1) + nx;
    model.prescribe(2 * corner, 0.01).unwrap();
    let constrained = model.constrained_dofs();

    for u in solve_displacement(&model, 2, 0.1, &StaticSettings::default()) {
        assert_eq!(u[2 * corner], 0.01);
        for &dof in &constrained {
            if dof != 2 * corner {
                assert_eq!(u[dof], 0.0);
            }
        }
    }
}

#[test]
fn newton_iteration_budget_is_reported() {
    let model = hardening_chain_model(2, 30.0);
    let settings = StaticSettings {
        newton: NewtonSettings {
            max_iterations: Some(1),
            ..NewtonSettings::default()
        },
        max_step_cuts: 0,
        ..StaticSettings::default()
    };

    let results = Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut analysis = StaticAnalysis::new(&assembler, settings.clone());
        let result = analysis.solve(&uniform_design(0, 0.0));
        (result, analysis.newton_state(), analysis.newton_history().len())
    });

    for (result, state, history) in results {
        match result {
            Err(AnalysisError::ConvergenceFailure { solver, iterations, .. }) => {
                assert_eq!(solver, "Newton");
                assert_eq!(iterations, 1);
            }
            other => panic!("expected a convergence failure, got {:?}", other),
        }
        assert_eq!(state, NewtonState::Diverged);
        assert_eq!(history, 2);
    }
}

#[test]
fn load_continuation_reaches_full_load() {
    let load = 30.0;
    let model = hardening_chain_model(2, load);
    let settings = StaticSettings {
        load_steps: 4,
        ..StaticSettings::default()
    };

    let results = Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut analysis = StaticAnalysis::new(&assembler, settings.clone());
        let output = analysis.solve(&uniform_design(0, 0.0)).unwrap();
        (output, analysis.load_factor(), analysis.displacement().gather())
    });

    for (output, load_factor, u) in results {
        assert_eq!(output.steps.len(), 4);
        assert_eq!(output.step_cuts, 0);
        assert_eq!(output.steps.last().unwrap().load_factor, 1.0);
        assert_eq!(load_factor, 1.0);
        let factors: Vec<_> = output.steps.iter().map(|step| step.load_factor).collect();
        assert_eq!(factors, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(chain_equilibrium_error(&u, 2, load) <= 1e-8);
    }
}

#[test]
fn failed_increments_are_cut() {
    let load = 100.0;
    let model = hardening_chain_model(2, load);
    let settings = StaticSettings {
        newton: NewtonSettings {
            max_iterations: Some(6),
            ..NewtonSettings::default()
        },
        max_step_cuts: 8,
        ..StaticSettings::default()
    };

    let results = Universe::run(1, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut analysis = StaticAnalysis::new(&assembler, settings.clone());
        let output = analysis.solve(&uniform_design(0, 0.0)).unwrap();
        (output, analysis.displacement().gather())
    });

    for (output, u) in results {
        assert!(output.step_cuts >= 1);
        assert_eq!(output.steps.last().unwrap().load_factor, 1.0);
        assert!(chain_equilibrium_error(&u, 2, load) <= 1e-7);
    }
}

#[test]
fn jacobian_is_reassembled_only_for_new_design_versions() {
    let model = cantilever_model(4);
    Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut context = uniform_design(4, BEAM_HEIGHT);
        let mut analysis = StaticAnalysis::new(&assembler, StaticSettings::default());
        analysis.solve(&context).unwrap();
        assert_eq!(analysis.jacobian_version(), Some(context.version()));

        let assemblies = analysis.jacobian_assemblies();
        analysis.ensure_jacobian(&context).unwrap();
        assert_eq!(analysis.jacobian_assemblies(), assemblies);

        context.set_value(2, 0.12).unwrap();
        assert_ne!(analysis.jacobian_version(), Some(context.version()));
        analysis.ensure_jacobian(&context).unwrap();
        assert_eq!(analysis.jacobian_assemblies(), assemblies + 1);
        assert_eq!(analysis.jacobian_version(), Some(context.version()));

        context.invalidate();
        analysis.ensure_jacobian(&context).unwrap();
        assert_eq!(analysis.jacobian_assemblies(), assemblies + 2);
    });
}

#[test]
fn insufficient_design_is_rejected() {
    let model = cantilever_model(4);
    Universe::run(1, |comm| {
        let assembler = Assembler::new(comm, &model, 1).unwrap();
        let mut analysis = StaticAnalysis::new(&assembler, StaticSettings::default());
        let result = analysis.solve(&uniform_design(3, BEAM_HEIGHT));
        assert!(matches!(result, Err(AnalysisError::InvalidModel(_))));
    });
}

#[test]
fn multigrid_reduces_iterations() {
    let model = plate_model(16, 4);
    let results = Universe::run(2, |comm| {
        let assembler = Assembler::new(comm, &model, 4).unwrap();
        let context = uniform_design(64, 0.1);
        let mut analysis = StaticAnalysis::new(&assembler, StaticSettings::default());
        analysis.solve(&context).unwrap();
        let jacobian = analysis.jacobian();
        let b = assembler.external_load(1.0);

        let mut iterations = Vec::new();
        for preconditioner in [PreconditionerKind::None, PreconditionerKind::Multigrid(Default::default())] {
            let mut solver = LinearSolver::new(SolverSettings {
                method: KrylovMethod::Cg,
                preconditioner,
                tolerance: 1e-8,
                max_iterations: 5000,
                matrix_free: false,
            });
            solver.prepare(jacobian).unwrap();
            let mut x = assembler.create_vector();
            iterations.push(solver.solve(jacobian, &b, &mut x).unwrap().num_iterations);
        }
        iterations
    });

    for iterations in results {
        assert!(iterations[1] < iterations[0], "{:?}", iterations);
    }
}

#[test]
fn static_settings_can_be_read_from_json() {
    let json = r#"{
        "newton": {
            "max_iterations": 12,
            "tolerance": 1e-8,
            "relative_tolerance": 1e-10,
            "update_tolerance": null
        },
        "line_search": { "sufficient_decrease": 1e-4, "min_step": 1e-3 },
        "solver": {
            "method": { "Gmres": { "restart": 40 } },
            "preconditioner": {
                "Multigrid": {
                    "cycle": "F",
                    "pre_smooth": 1,
                    "post_smooth": 3,
                    "smoother_weight": 0.8,
                    "max_levels": 4,
                    "coarse_size": 16
                }
            },
            "tolerance": 1e-9,
            "max_iterations": 200,
            "matrix_free": true
        },
        "load_steps": 3,
        "max_step_cuts": 2
    }"#;
    let settings: StaticSettings<f64> = serde_json::from_str(json).unwrap();

    assert_eq!(settings.newton.max_iterations, Some(12));
    assert_eq!(settings.line_search.as_ref().map(|search| search.min_step), Some(1e-3));
    assert_eq!(settings.solver.method, KrylovMethod::Gmres { restart: 40 });
    match &settings.solver.preconditioner {
        PreconditionerKind::Multigrid(multigrid) => {
            assert_eq!(multigrid.post_smooth, 3);
            assert_eq!(multigrid.coarse_size, 16);
        }
        other => panic!("unexpected preconditioner {:?}", other),
    }
    assert!(settings.solver.matrix_free);
    assert_eq!(settings.load_steps, 3);

    let roundtrip: StaticSettings<f64> = serde_json::from_str(&serde_json::to_string(&settings).unwrap()).unwrap();
    assert_eq!(roundtrip, settings);
}

#[test]
fn single_quad_matches_dense_reference_solve() {
    let model = plate_model(1, 1);
    let design = [0.2];
    let assembler = Assembler::new(Communicator::serial(), &model, 1).unwrap();
    let mut analysis = StaticAnalysis::new(&assembler, StaticSettings::default());
    analysis.solve(&uniform_design(1, design[0])).unwrap();
    let u = analysis.displacement().gather();

    // Element stiffness at the undeformed state, scattered into the global dense system
    let nodes = model.mesh().element_nodes(0);
    let coordinates: Vec<Point2<f64>> = nodes.iter().map(|&node| model.mesh().vertices()[node]).collect();
    let zeros = DVector::zeros(8);
    let input = ElementInput {
        coordinates: &coordinates,
        u: (&zeros).into(),
        v: (&zeros).into(),
        a: (&zeros).into(),
        design: &design,
    };
    let element = &model.elements()[0];
    let mut output = ElementOutput::zeros(8, element.design_variables().len());
    element
        .evaluate(&input, ElementRequest::Jacobian(JacobianCoefficients::stiffness()), &mut output)
        .unwrap();

    let num_dofs = model.num_dofs();
    let mut stiffness = DMatrix::zeros(num_dofs, num_dofs);
    for (i, &a) in nodes.iter().enumerate() {
        for (j, &b) in nodes.iter().enumerate() {
            for r in 0..2 {
                for c in 0..2 {
                    stiffness[(2 * a + r, 2 * b + c)] += output.jacobian[(2 * i + r, 2 * j + c)];
                }
            }
        }
    }
    let mut load = DVector::zeros(num_dofs);
    for (dof, value) in model.loads() {
        load[dof] += value;
    }

    let constrained = model.constrained_dofs();
    let free: Vec<usize> = (0..num_dofs).filter(|dof| !constrained.contains(dof)).collect();
    let reduced_stiffness = stiffness.select_rows(&free).select_columns(&free);
    let reduced_load = load.select_rows(&free);
    let reduced_solution = reduced_stiffness.lu().solve(&reduced_load).unwrap();

    let mut expected = DVector::zeros(num_dofs);
    for (k, &dof) in free.iter().enumerate() {
        expected[dof] = reduced_solution[k];
    }
    assert_approx_matrix_eq!(&u, &expected, abstol = 1e-10);
}
