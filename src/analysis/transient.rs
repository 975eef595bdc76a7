use crate::analysis::linear::{LinearSolver, SolverSettings};
use crate::assembly::{Assembler, DynamicState};
use crate::context::DesignContext;
use crate::element::{ElementEvaluator, JacobianCoefficients};
use crate::error::AnalysisError;
use log::{debug, info, warn};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use trellis_optimize::newton::{NewtonDriver, NewtonSettings, NewtonSystem};
use trellis_sparse::{BlockCyclicMatrix, DistVector};
use trellis_traits::{from_f64, to_f64, Real};

/// Newmark time integration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewmarkSettings<T> {
    pub beta: T,
    pub gamma: T,
    pub time_step: T,
    pub num_steps: usize,
    pub newton: NewtonSettings<T>,
    pub solver: SolverSettings,
    /// How often a failed step may be split in half.
    pub max_step_cuts: usize,
}

impl Default for NewmarkSettings<f64> {
    /// Average acceleration: unconditionally stable and free of numerical damping.
    fn default() -> Self {
        Self {
            beta: 0.25,
            gamma: 0.5,
            time_step: 1e-2,
            num_steps: 100,
            newton: NewtonSettings::default(),
            solver: SolverSettings::default(),
            max_step_cuts: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeStep<T> {
    pub time: T,
    pub time_step: T,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransientOutput<T> {
    pub steps: Vec<TimeStep<T>>,
    pub step_cuts: usize,
    pub newton_iterations: usize,
}

/// Implicit Newmark integration of $\vec f^{\text{int}}(\vec u) + \vec M \ddot{\vec u} = \lambda(t) \vec f^{\text{ext}}$.
///
/// Each step is solved by Newton's method in the displacements, with velocities and
/// accelerations following from the Newmark relations
/// $$
/// \vec u_{n+1} = \vec u_n + \Delta t \vec v_n + \Delta t^2 \left((\tfrac{1}{2} - \beta) \vec a_n + \beta \vec a_{n+1}\right), \quad
/// \vec v_{n+1} = \vec v_n + \Delta t \left((1 - \gamma) \vec a_n + \gamma \vec a_{n+1}\right).
/// $$
pub struct TransientAnalysis<'s, 'a, T: Real, E> {
    assembler: &'s Assembler<'a, T, E>,
    settings: NewmarkSettings<T>,
    load: Box<dyn Fn(T) -> T + Sync + 's>,
    time: T,
    state: DynamicState<T>,
    previous: DynamicState<T>,
    residual: DistVector<T>,
    update: DistVector<T>,
    jacobian: BlockCyclicMatrix<T>,
    linear_solver: LinearSolver<T>,
}

struct NewmarkSystem<'r, 's, 'a, T: Real, E> {
    analysis: &'r mut TransientAnalysis<'s, 'a, T, E>,
    design: &'r [T],
    time_step: T,
    load_factor: T,
}

impl<'r, 's, 'a, T, E> NewtonSystem<T> for NewmarkSystem<'r, 's, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    type Error = AnalysisError;

    fn assemble(&mut self) -> Result<T, AnalysisError> {
        let analysis = &mut *self.analysis;
        let coefficients = JacobianCoefficients::newmark(analysis.settings.beta, analysis.settings.gamma, self.time_step);
        let state = analysis.state.synchronize();
        analysis.assembler.assemble_residual_and_jacobian(
            state,
            self.design,
            self.load_factor,
            coefficients,
            &mut analysis.residual,
            &mut analysis.jacobian,
        )?;
        analysis.linear_solver.prepare(&analysis.jacobian)?;
        Ok(analysis.residual.norm())
    }

    fn solve_update(&mut self) -> Result<T, AnalysisError> {
        let analysis = &mut *self.analysis;
        analysis.update.fill(T::zero());
        analysis
            .linear_solver
            .solve(&analysis.jacobian, &analysis.residual, &mut analysis.update)?;
        analysis.assembler.zero_constrained(&mut analysis.update);
        Ok(analysis.update.norm())
    }

    fn advance(&mut self, step: T) -> Result<T, AnalysisError> {
        let analysis = &mut *self.analysis;
        let NewmarkSettings { beta, gamma, .. } = analysis.settings;
        let dt = self.time_step;
        analysis.state.u.axpy(-step, &analysis.update, T::one());
        analysis
            .state
            .a
            .axpy(-step / (beta * dt * dt), &analysis.update, T::one());
        analysis
            .state
            .v
            .axpy(-step * gamma / (beta * dt), &analysis.update, T::one());
        let state = analysis.state.synchronize();
        analysis
            .assembler
            .assemble_residual(state, self.design, self.load_factor, &mut analysis.residual)?;
        Ok(analysis.residual.norm())
    }
}

impl<'s, 'a, T, E> TransientAnalysis<'s, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    /// A transient analysis under constant full load, starting at rest from zero displacements.
    pub fn new(assembler: &'s Assembler<'a, T, E>, settings: NewmarkSettings<T>) -> Self {
        let mut state = assembler.create_state();
        assembler.apply_prescribed_values(&mut state.u, T::one());
        Self {
            assembler,
            load: Box::new(|_| T::one()),
            time: T::zero(),
            previous: state.clone(),
            state,
            residual: assembler.create_vector(),
            update: assembler.create_vector(),
            jacobian: assembler.create_matrix(),
            linear_solver: LinearSolver::new(settings.solver.clone()),
            settings,
        }
    }

    /// Scales the external load by `load(t)`.
    pub fn with_load_history(self, load: impl Fn(T) -> T + Sync + 's) -> Self {
        Self {
            load: Box::new(load),
            ..self
        }
    }

    /// Replaces the initial displacements and velocities. Prescribed values are reapplied.
    pub fn with_initial_state(mut self, u: &DistVector<T>, v: &DistVector<T>) -> Self {
        self.state.u.copy_from(u);
        self.state.v.copy_from(v);
        self.assembler
            .apply_prescribed_values(&mut self.state.u, T::one());
        self.assembler.zero_constrained(&mut self.state.v);
        self
    }

    pub fn time(&self) -> T {
        self.time
    }

    pub fn state(&self) -> &DynamicState<T> {
        &self.state
    }

    /// Solves $\vec M \vec a_0 = \lambda(t) \vec f^{\text{ext}} - \vec f^{\text{int}}(\vec u_0)$ for the
    /// current acceleration. This is a collective operation.
    pub fn initialize_acceleration(&mut self, context: &DesignContext<T>) -> Result<(), AnalysisError> {
        let design = context.values().as_slice();
        self.state.a.fill(T::zero());
        let state = self.state.synchronize();
        let load_factor = (self.load)(self.time);
        self.assembler
            .assemble_residual(state, design, load_factor, &mut self.residual)?;
        self.residual.scale_mut(-T::one());

        let mut mass = self.assembler.create_matrix();
        self.assembler
            .assemble_matrix(state, design, JacobianCoefficients::mass(), T::one(), &mut mass)?;
        let mut mass_solver = LinearSolver::new(self.settings.solver.clone());
        mass_solver.prepare(&mass)?;
        mass_solver.solve(&mass, &self.residual, &mut self.state.a)?;
        Ok(())
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn try_step(&mut self, design: &[T], dt: T) -> Result<usize, AnalysisError> {
        let NewmarkSettings { beta, gamma, .. } = self.settings;
        self.previous.clone_from(&self.state);

        // Predictor with unchanged displacements
        let previous = &self.previous;
        self.state.a.copy_from(&previous.a);
        self.state.a.scale_mut(-(0.5 - beta) / beta);
        self.state
            .a
            .axpy(-1.0 / (beta * dt), &previous.v, 1.0);
        self.state.v.copy_from(&previous.v);
        self.state
            .v
            .axpy(dt * (1.0 - gamma), &previous.a, 1.0);
        self.state.v.axpy(dt * gamma, &self.state.a, 1.0);
        self.assembler.zero_constrained(&mut self.state.v);
        self.assembler.zero_constrained(&mut self.state.a);

        let load_factor = (self.load)(self.time + dt);
        let mut driver = NewtonDriver::new(self.settings.newton);
        let result = driver.solve(&mut NewmarkSystem {
            analysis: &mut *self,
            design,
            time_step: dt,
            load_factor,
        });
        match result {
            Ok(output) => Ok(output.iterations),
            Err(err) => {
                self.state.clone_from(&self.previous);
                Err(err.into())
            }
        }
    }

    fn advance_interval(
        &mut self,
        design: &[T],
        dt: T,
        cuts: usize,
        output: &mut TransientOutput<T>,
    ) -> Result<(), AnalysisError> {
        match self.try_step(design, dt) {
            Ok(iterations) => {
                self.time += dt;
                debug!(
                    "Time step to t = {:e} converged after {} iterations",
                    to_f64(self.time),
                    iterations
                );
                output.newton_iterations += iterations;
                output.steps.push(TimeStep {
                    time: self.time,
                    time_step: dt,
                    iterations,
                });
                Ok(())
            }
            Err(err) if err.is_recoverable() && cuts < self.settings.max_step_cuts => {
                warn!(
                    "Time step {:e} at t = {:e} failed, splitting it in half. Error: {}",
                    to_f64(dt),
                    to_f64(self.time),
                    err
                );
                output.step_cuts += 1;
                let half = dt / from_f64(2.0);
                self.advance_interval(design, half, cuts + 1, output)?;
                self.advance_interval(design, half, cuts + 1, output)
            }
            Err(err) => Err(err),
        }
    }

    /// Integrates `num_steps` steps from the current state. This is a collective operation.
    ///
    /// The initial acceleration is computed from equilibrium if the analysis is at `t = 0`.
    pub fn run(&mut self, context: &DesignContext<T>) -> Result<TransientOutput<T>, AnalysisError> {
        let design = context.values().as_slice();
        self.assembler.model().check_design(design)?;
        if self.time == T::zero() {
            self.initialize_acceleration(context)?;
        }

        let mut output = TransientOutput {
            steps: Vec::new(),
            step_cuts: 0,
            newton_iterations: 0,
        };
        for _ in 0..self.settings.num_steps {
            self.advance_interval(design, self.settings.time_step, 0, &mut output)?;
        }
        info!(
            "Integrated to t = {:e} in {} steps ({} cuts)",
            to_f64(self.time),
            output.steps.len(),
            output.step_cuts
        );
        Ok(output)
    }

    /// Kinetic plus linearized strain energy, $\frac{1}{2} \vec v^T \vec M \vec v + \frac{1}{2} \vec u^T \vec K \vec u$.
    ///
    /// The stiffness is evaluated at the current state, so for nonlinear materials this is only
    /// an approximation of the stored energy. This is a collective operation.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn energy(&mut self, context: &DesignContext<T>) -> Result<T, AnalysisError> {
        let design = context.values().as_slice();
        let mut stiffness = self.assembler.create_matrix();
        let mut mass = self.assembler.create_matrix();
        let mut product = self.assembler.create_vector();
        let state = self.state.synchronize();
        self.assembler
            .assemble_matrix(state, design, JacobianCoefficients::stiffness(), 0.0, &mut stiffness)?;
        self.assembler
            .assemble_matrix(state, design, JacobianCoefficients::mass(), 0.0, &mut mass)?;

        stiffness.multiply(&state.u, &mut product);
        let strain_energy = 0.5 * product.dot(state.u.vector());
        mass.multiply(&state.v, &mut product);
        let kinetic_energy = 0.5 * product.dot(state.v.vector());
        Ok(strain_energy + kinetic_energy)
    }
}
