use crate::analysis::linear::{LinearSolver, SolverSettings};
use crate::assembly::{Assembler, DynamicState, MatrixFreeOperator, State};
use crate::context::{DesignContext, DesignVersion};
use crate::element::{ElementEvaluator, JacobianCoefficients};
use crate::error::AnalysisError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use trellis_optimize::newton::{
    BacktrackingLineSearch, LineSearch, NewtonDriver, NewtonError, NewtonIterate, NewtonSettings, NewtonState,
    NewtonSystem, NoLineSearch,
};
use trellis_sparse::{BlockCyclicMatrix, DistVector};
use trellis_traits::{to_f64, Real};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSettings<T> {
    pub newton: NewtonSettings<T>,
    /// Backtracking line search, or full Newton steps if `None`.
    pub line_search: Option<BacktrackingLineSearch>,
    pub solver: SolverSettings,
    /// Number of equal load increments the full load is applied in.
    pub load_steps: usize,
    /// How often a failed increment may be halved before the analysis fails.
    pub max_step_cuts: usize,
}

impl Default for StaticSettings<f64> {
    fn default() -> Self {
        Self {
            newton: NewtonSettings::default(),
            line_search: None,
            solver: SolverSettings::default(),
            load_steps: 1,
            max_step_cuts: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStep<T> {
    pub load_factor: T,
    pub iterations: usize,
    pub residual_norm: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaticOutput<T> {
    /// Converged load increments.
    pub steps: Vec<LoadStep<T>>,
    pub step_cuts: usize,
    pub newton_iterations: usize,
}

#[derive(Debug, Clone)]
struct SelectedLineSearch(Option<BacktrackingLineSearch>);

impl<T, S> LineSearch<T, S> for SelectedLineSearch
where
    T: Real,
    S: NewtonSystem<T>,
{
    fn step(&mut self, system: &mut S, residual_norm: T) -> Result<(T, T), NewtonError<T, S::Error>> {
        match &mut self.0 {
            Some(line_search) => LineSearch::<T, S>::step(line_search, system, residual_norm),
            None => LineSearch::<T, S>::step(&mut NoLineSearch, system, residual_norm),
        }
    }
}

/// Nonlinear static equilibrium $\vec R(\vec u) = \vec 0$ with load continuation.
///
/// Every solve starts from zero displacements. The full load is applied in
/// [`StaticSettings::load_steps`] increments, each solved by Newton's method. A failed increment
/// is retried with half the size.
#[derive(Debug)]
pub struct StaticAnalysis<'s, 'a, T: Real, E> {
    assembler: &'s Assembler<'a, T, E>,
    settings: StaticSettings<T>,
    state: DynamicState<T>,
    residual: DistVector<T>,
    /// `J^{-1} R` of the current Newton iteration.
    update: DistVector<T>,
    jacobian: BlockCyclicMatrix<T>,
    jacobian_version: Option<DesignVersion>,
    jacobian_assemblies: usize,
    linear_solver: LinearSolver<T>,
    load_factor: T,
    newton_state: NewtonState,
    newton_history: Vec<NewtonIterate<T>>,
}

/// The Newton view of a static analysis for a fixed design and load factor.
struct StaticSystem<'r, 's, 'a, T: Real, E> {
    analysis: &'r mut StaticAnalysis<'s, 'a, T, E>,
    design: &'r [T],
    version: DesignVersion,
}

impl<'r, 's, 'a, T, E> NewtonSystem<T> for StaticSystem<'r, 's, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    type Error = AnalysisError;

    fn assemble(&mut self) -> Result<T, AnalysisError> {
        self.analysis.assemble_jacobian(self.design, self.version)?;
        Ok(self.analysis.residual.norm())
    }

    fn solve_update(&mut self) -> Result<T, AnalysisError> {
        let analysis = &mut *self.analysis;
        analysis.update.fill(T::zero());
        if analysis.linear_solver.settings().matrix_free {
            let state = analysis.state.synchronize();
            let operator = MatrixFreeOperator::new(
                analysis.assembler,
                state,
                self.design,
                JacobianCoefficients::stiffness(),
                T::one(),
            )?;
            analysis
                .linear_solver
                .solve(&operator, &analysis.residual, &mut analysis.update)?;
        } else {
            analysis
                .linear_solver
                .solve(&analysis.jacobian, &analysis.residual, &mut analysis.update)?;
        }
        // Coarse grid corrections may leak into constrained entries
        analysis.assembler.zero_constrained(&mut analysis.update);
        Ok(analysis.update.norm())
    }

    fn advance(&mut self, step: T) -> Result<T, AnalysisError> {
        let analysis = &mut *self.analysis;
        analysis.state.u.axpy(-step, &analysis.update, T::one());
        let state = analysis.state.synchronize();
        analysis
            .assembler
            .assemble_residual(state, self.design, analysis.load_factor, &mut analysis.residual)?;
        Ok(analysis.residual.norm())
    }
}

impl<'s, 'a, T, E> StaticAnalysis<'s, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    pub fn new(assembler: &'s Assembler<'a, T, E>, settings: StaticSettings<T>) -> Self {
        Self {
            assembler,
            state: assembler.create_state(),
            residual: assembler.create_vector(),
            update: assembler.create_vector(),
            jacobian: assembler.create_matrix(),
            jacobian_version: None,
            jacobian_assemblies: 0,
            linear_solver: LinearSolver::new(settings.solver.clone()),
            load_factor: T::zero(),
            newton_state: NewtonState::Initialized,
            newton_history: Vec::new(),
            settings,
        }
    }

    pub fn assembler(&self) -> &'s Assembler<'a, T, E> {
        self.assembler
    }

    pub fn settings(&self) -> &StaticSettings<T> {
        &self.settings
    }

    pub fn displacement(&self) -> &DistVector<T> {
        &self.state.u
    }

    pub fn load_factor(&self) -> T {
        self.load_factor
    }

    pub fn jacobian(&self) -> &BlockCyclicMatrix<T> {
        &self.jacobian
    }

    /// The design version the current Jacobian was assembled for, if any.
    pub fn jacobian_version(&self) -> Option<DesignVersion> {
        self.jacobian_version
    }

    /// Number of Jacobian assemblies since the analysis was created.
    pub fn jacobian_assemblies(&self) -> usize {
        self.jacobian_assemblies
    }

    /// State of the Newton iteration of the most recent load increment.
    pub fn newton_state(&self) -> NewtonState {
        self.newton_state
    }

    pub fn newton_history(&self) -> &[NewtonIterate<T>] {
        &self.newton_history
    }

    /// The synchronized state, the Jacobian and the solver prepared for it.
    pub(crate) fn linearization(&mut self) -> (State<'_, T>, &BlockCyclicMatrix<T>, &mut LinearSolver<T>) {
        (self.state.synchronize(), &self.jacobian, &mut self.linear_solver)
    }

    /// Halo-consistent view of the state.
    pub fn synchronized_state(&mut self) -> State<'_, T> {
        self.state.synchronize()
    }

    fn assemble_jacobian(&mut self, design: &[T], version: DesignVersion) -> Result<(), AnalysisError> {
        self.jacobian_version = None;
        let state = self.state.synchronize();
        self.assembler.assemble_residual_and_jacobian(
            state,
            design,
            self.load_factor,
            JacobianCoefficients::stiffness(),
            &mut self.residual,
            &mut self.jacobian,
        )?;
        self.jacobian_assemblies += 1;
        self.linear_solver.prepare(&self.jacobian)?;
        self.jacobian_version = Some(version);
        Ok(())
    }

    /// Reassembles the Jacobian at the current state unless it is current for the design.
    ///
    /// This is a collective operation.
    pub fn ensure_jacobian(&mut self, context: &DesignContext<T>) -> Result<(), AnalysisError> {
        if self.jacobian_version != Some(context.version()) {
            self.assemble_jacobian(context.values().as_slice(), context.version())?;
        }
        Ok(())
    }

    fn solve_increment(&mut self, context: &DesignContext<T>, load_factor: T) -> Result<usize, AnalysisError> {
        self.load_factor = load_factor;
        self.assembler
            .apply_prescribed_values(&mut self.state.u, load_factor);

        let mut driver = NewtonDriver::new(self.settings.newton)
            .with_line_search(SelectedLineSearch(self.settings.line_search.clone()));
        let result = {
            let mut system = StaticSystem {
                analysis: &mut *self,
                design: context.values().as_slice(),
                version: context.version(),
            };
            driver.solve(&mut system)
        };
        self.newton_state = driver.state();
        self.newton_history = driver.history().to_vec();
        Ok(result?.iterations)
    }

    /// Solves for equilibrium under the full load. This is a collective operation.
    pub fn solve(&mut self, context: &DesignContext<T>) -> Result<StaticOutput<T>, AnalysisError> {
        self.assembler.model().check_design(context.values().as_slice())?;
        self.state.u.fill(T::zero());
        self.jacobian_version = None;

        let load_steps = T::from_usize(self.settings.load_steps.max(1)).expect("Must be able to fit usize in T");
        let mut increment = T::one() / load_steps;
        let mut load_factor = T::zero();
        let mut output = StaticOutput {
            steps: Vec::new(),
            step_cuts: 0,
            newton_iterations: 0,
        };

        while load_factor < T::one() {
            let target = (load_factor + increment).min(T::one());
            let previous = self.state.u.clone();
            match self.solve_increment(context, target) {
                Ok(iterations) => {
                    info!(
                        "Load factor {:.4} reached after {} Newton iterations",
                        to_f64(target),
                        iterations
                    );
                    load_factor = target;
                    output.newton_iterations += iterations;
                    output.steps.push(LoadStep {
                        load_factor: target,
                        iterations,
                        residual_norm: self.residual.norm(),
                    });
                }
                Err(err) if err.is_recoverable() && output.step_cuts < self.settings.max_step_cuts => {
                    warn!(
                        "Load increment to {:.4} failed, halving the increment. Error: {}",
                        to_f64(target),
                        err
                    );
                    self.state.u.copy_from(&previous);
                    self.jacobian_version = None;
                    increment /= T::one() + T::one();
                    output.step_cuts += 1;
                }
                Err(err) => {
                    self.jacobian_version = None;
                    return Err(err);
                }
            }
        }
        Ok(output)
    }
}
