//! Design gradients of structural functions by the adjoint method.
use crate::analysis::linear::{KrylovMethod, LinearSolver, PreconditionerKind, SolverSettings};
use crate::analysis::statics::StaticAnalysis;
use crate::assembly::MatrixFreeOperator;
use crate::context::DesignContext;
use crate::element::{ElementEvaluator, JacobianCoefficients};
use crate::error::AnalysisError;
use crate::functions::StructuralFunction;
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use trellis_sparse::krylov::{SolveOutput, Transposed};
use trellis_traits::{to_f64, Real};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjointSettings {
    /// Reuse the forward solver and its preconditioner, which requires a symmetric Jacobian.
    pub symmetric: bool,
    /// Solver for $\vec J^T \vec \lambda = \pd{F}{\vec u}$ when the Jacobian is not symmetric.
    pub transposed_solver: SolverSettings,
}

impl Default for AdjointSettings {
    fn default() -> Self {
        Self {
            symmetric: true,
            transposed_solver: SolverSettings {
                method: KrylovMethod::Gmres { restart: 50 },
                preconditioner: PreconditionerKind::Jacobi,
                ..SolverSettings::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjointSolution<T: Real> {
    pub value: T,
    /// Total derivative $\frac{\mathrm{d} F}{\mathrm{d} \vec x}$, replicated on every rank.
    pub gradient: DVector<T>,
    /// Iterations of the adjoint linear solve.
    pub adjoint_iterations: usize,
}

/// Computes function values and design gradients at the equilibrium of a [`StaticAnalysis`].
#[derive(Debug)]
pub struct AdjointSolver<T: Real> {
    settings: AdjointSettings,
    transposed_solver: LinearSolver<T>,
}

impl<T: Real> Default for AdjointSolver<T> {
    fn default() -> Self {
        Self::new(AdjointSettings::default())
    }
}

impl<T: Real> AdjointSolver<T> {
    pub fn new(settings: AdjointSettings) -> Self {
        Self {
            transposed_solver: LinearSolver::new(settings.transposed_solver.clone()),
            settings,
        }
    }

    pub fn settings(&self) -> &AdjointSettings {
        &self.settings
    }

    /// Evaluates `function` and its design gradient at the current equilibrium of `analysis`.
    ///
    /// The analysis must have been solved for the design in `context`. Its Jacobian is reused if
    /// it is current for the design version and reassembled otherwise. This is a collective
    /// operation.
    pub fn solve<E, F>(
        &mut self,
        analysis: &mut StaticAnalysis<'_, '_, T, E>,
        context: &DesignContext<T>,
        function: &F,
    ) -> Result<AdjointSolution<T>, AnalysisError>
    where
        E: ElementEvaluator<T>,
        F: StructuralFunction<T>,
    {
        analysis.ensure_jacobian(context)?;
        let design = context.values().as_slice();
        let assembler = analysis.assembler();
        let mut rhs = assembler.create_vector();
        let mut adjoint = assembler.create_vector();

        let (state, jacobian, forward_solver) = analysis.linearization();
        let value = function.value(assembler, state.u, design)?;
        function.state_derivative(assembler, state.u, design, &mut rhs)?;
        assembler.zero_constrained(&mut rhs);

        let matrix_free = forward_solver.settings().matrix_free;
        let output: SolveOutput<T> = match (self.settings.symmetric, matrix_free) {
            (true, false) => forward_solver.solve(jacobian, &rhs, &mut adjoint)?,
            (true, true) => {
                let operator =
                    MatrixFreeOperator::new(assembler, state, design, JacobianCoefficients::stiffness(), T::one())?;
                forward_solver.solve(&operator, &rhs, &mut adjoint)?
            }
            (false, false) => {
                self.transposed_solver.prepare(jacobian)?;
                self.transposed_solver
                    .solve_transposed(&Transposed(jacobian), &rhs, &mut adjoint)?
            }
            (false, true) => {
                self.transposed_solver.prepare(jacobian)?;
                let operator =
                    MatrixFreeOperator::new(assembler, state, design, JacobianCoefficients::stiffness(), T::one())?
                        .transpose();
                self.transposed_solver
                    .solve_transposed(&operator, &rhs, &mut adjoint)?
            }
        };
        debug!(
            "Adjoint solve took {} iterations (residual norm {:e})",
            output.num_iterations,
            to_f64(output.residual_norm)
        );

        let mut gradient = DVector::zeros(design.len());
        function.add_design_derivative(assembler, state.u, design, &mut gradient)?;
        assembler.add_design_derivative_product(state, design, adjoint.synchronize(), &mut gradient)?;

        Ok(AdjointSolution {
            value,
            gradient,
            adjoint_iterations: output.num_iterations,
        })
    }
}
