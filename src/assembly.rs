//! Distributed assembly of residuals, Jacobians and design derivatives.
//!
//! Every rank evaluates the elements it owns. Element evaluations run on the rayon pool and
//! their results are collected in ascending element order before anything is scattered, so
//! that the assembled values do not depend on the number of threads. If any element on any
//! rank fails, every rank returns the same error and the output is left untouched.
use crate::element::{ElementEvaluator, ElementInput, ElementOutput, ElementRequest, JacobianCoefficients};
use crate::error::AnalysisError;
use crate::model::Model;
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView, Point2};
use rayon::prelude::*;
use std::cell::RefCell;
use std::error::Error;
use std::sync::Arc;
use thread_local::ThreadLocal;
use trellis_sparse::krylov::LinearOperator;
use trellis_sparse::{BlockCyclicMatrix, Communicator, DistVector, PartitionMap, Synced, VectorLayout};
use trellis_traits::Real;

/// Halo-consistent views of the state vectors an element pass reads.
#[derive(Debug, Clone, Copy)]
pub struct State<'a, T: Real> {
    pub u: Synced<'a, T>,
    pub v: Synced<'a, T>,
    pub a: Synced<'a, T>,
}

/// Displacements, velocities and accelerations.
#[derive(Debug, Clone)]
pub struct DynamicState<T: Real> {
    pub u: DistVector<T>,
    pub v: DistVector<T>,
    pub a: DistVector<T>,
}

impl<T: Real> DynamicState<T> {
    pub fn zeros(layout: &Arc<VectorLayout>) -> Self {
        Self {
            u: DistVector::zeros(layout.clone()),
            v: DistVector::zeros(layout.clone()),
            a: DistVector::zeros(layout.clone()),
        }
    }

    /// Refreshes the halos of all three vectors. This is a collective operation.
    pub fn synchronize(&mut self) -> State<'_, T> {
        State {
            u: self.u.synchronize(),
            v: self.v.synchronize(),
            a: self.a.synchronize(),
        }
    }
}

#[derive(Debug)]
struct ElementWorkspace<T: Real> {
    coordinates: Vec<Point2<T>>,
    u: DVector<T>,
    v: DVector<T>,
    a: DVector<T>,
    design: Vec<T>,
}

impl<T: Real> Default for ElementWorkspace<T> {
    fn default() -> Self {
        Self {
            coordinates: Vec::new(),
            u: DVector::zeros(0),
            v: DVector::zeros(0),
            a: DVector::zeros(0),
            design: Vec::new(),
        }
    }
}

/// Copies the values of `nodes` from an extended vector into an element vector.
fn gather_nodal<T: Real>(target: &mut DVector<T>, source: DVectorView<T>, layout: &VectorLayout, nodes: &[usize]) {
    let vpn = layout.vars_per_node();
    if target.len() != nodes.len() * vpn {
        *target = DVector::zeros(nodes.len() * vpn);
    }
    for (k, &node) in nodes.iter().enumerate() {
        let local = layout
            .extended_node(node)
            .expect("nodes of owned elements are part of the layout");
        target
            .rows_mut(k * vpn, vpn)
            .copy_from(&source.rows(local * vpn, vpn));
    }
}

impl<T: Real> ElementWorkspace<T> {
    fn gather<E: ElementEvaluator<T>>(
        &mut self,
        model: &Model<T, E>,
        element: usize,
        state: Option<State<T>>,
        design: &[T],
        layout: &VectorLayout,
    ) {
        let nodes = model.mesh().element_nodes(element);
        let vertices = model.mesh().vertices();
        self.coordinates.clear();
        self.coordinates
            .extend(nodes.iter().map(|&node| vertices[node]));

        match state {
            Some(state) => {
                gather_nodal(&mut self.u, state.u.extended(), layout, nodes);
                gather_nodal(&mut self.v, state.v.extended(), layout, nodes);
                gather_nodal(&mut self.a, state.a.extended(), layout, nodes);
            }
            None => {
                let n = nodes.len() * layout.vars_per_node();
                for vector in [&mut self.u, &mut self.v, &mut self.a] {
                    *vector = DVector::zeros(n);
                }
            }
        }

        self.design.clear();
        self.design.extend(
            model.elements()[element]
                .design_variables()
                .iter()
                .map(|&i| design[i]),
        );
    }

    fn input(&self) -> ElementInput<'_, T> {
        ElementInput {
            coordinates: &self.coordinates,
            u: DVectorView::from(&self.u),
            v: DVectorView::from(&self.v),
            a: DVectorView::from(&self.a),
            design: &self.design,
        }
    }
}

/// Assembles global quantities of a [`Model`] on one rank.
#[derive(Debug)]
pub struct Assembler<'a, T: Real, E> {
    model: &'a Model<T, E>,
    template: BlockCyclicMatrix<T>,
    owned_elements: Vec<usize>,
    constrained_dofs: Vec<usize>,
    /// Whether an extended degree of freedom is constrained.
    constrained_mask: Vec<bool>,
    workspace: ThreadLocal<RefCell<ElementWorkspace<T>>>,
}

impl<'a, T, E> Assembler<'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    /// Distributes the model block-cyclically with `block_size` consecutive nodes per block.
    ///
    /// This is a collective operation.
    pub fn new(comm: Communicator, model: &'a Model<T, E>, block_size: usize) -> Result<Self, AnalysisError> {
        let partition = PartitionMap::block_cyclic(
            model.mesh().num_nodes(),
            model.vars_per_node(),
            block_size,
            comm.size(),
        );
        Self::with_partition(comm, model, partition)
    }

    /// Distributes the model according to the node ownership of `partition`.
    ///
    /// Element ownership is derived from the mesh connectivity. This is a collective operation.
    pub fn with_partition(
        comm: Communicator,
        model: &'a Model<T, E>,
        partition: PartitionMap,
    ) -> Result<Self, AnalysisError> {
        let connectivity = model.mesh().connectivity();
        if partition.vars_per_node() != model.vars_per_node() || partition.num_nodes() != model.mesh().num_nodes() {
            return Err(AnalysisError::InvalidModel(format!(
                "Partition covers {} nodes with {} variables each, model has {} nodes with {}.",
                partition.num_nodes(),
                partition.vars_per_node(),
                model.mesh().num_nodes(),
                model.vars_per_node()
            )));
        }
        let partition = Arc::new(partition.with_elements(connectivity)?);
        let template = BlockCyclicMatrix::initialize(comm.clone(), partition.clone(), connectivity)?;
        let layout = template.layout().clone();

        let constrained_dofs = model.constrained_dofs();
        let mut constrained_mask = vec![false; layout.num_extended_dofs()];
        for &dof in &constrained_dofs {
            if let Some(local) = layout.extended_dof(dof) {
                constrained_mask[local] = true;
            }
        }

        let owned_elements = partition.owned_elements(comm.rank());
        debug!(
            "Rank {} owns {} nodes and {} elements",
            comm.rank(),
            layout.num_owned_nodes(),
            owned_elements.len()
        );

        Ok(Self {
            model,
            template,
            owned_elements,
            constrained_dofs,
            constrained_mask,
            workspace: ThreadLocal::new(),
        })
    }

    pub fn model(&self) -> &'a Model<T, E> {
        self.model
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        self.template.layout()
    }

    pub fn comm(&self) -> &Communicator {
        self.layout().comm()
    }

    pub fn owned_elements(&self) -> &[usize] {
        &self.owned_elements
    }

    pub fn constrained_dofs(&self) -> &[usize] {
        &self.constrained_dofs
    }

    pub fn create_vector(&self) -> DistVector<T> {
        DistVector::zeros(self.layout().clone())
    }

    pub fn create_state(&self) -> DynamicState<T> {
        DynamicState::zeros(self.layout())
    }

    /// A zero matrix with the sparsity pattern of the model.
    pub fn create_matrix(&self) -> BlockCyclicMatrix<T> {
        self.template.clone()
    }

    /// Runs `f` on every owned element and collects the results in element order.
    ///
    /// Without a state, elements see zero displacements, velocities and accelerations. This is a
    /// collective operation: the first failure (lowest element id) across all ranks is reported
    /// on every rank.
    fn for_owned_elements<R, F>(&self, state: Option<State<T>>, design: &[T], f: F) -> Result<Vec<R>, AnalysisError>
    where
        R: Send,
        F: Fn(usize, &E, &ElementInput<T>) -> eyre::Result<R> + Sync,
    {
        self.model.check_design(design)?;
        let layout = self.layout();
        let results: Vec<Result<R, (usize, String)>> = self
            .owned_elements
            .par_iter()
            .with_min_len(16)
            .map(|&element| {
                let ws = &mut *self.workspace.get_or_default().borrow_mut();
                ws.gather(self.model, element, state, design, layout);
                let evaluator = &self.model.elements()[element];
                f(element, evaluator, &ws.input()).map_err(|err| (element, format!("{:#}", err)))
            })
            .collect();

        let mut outputs = Vec::with_capacity(results.len());
        let mut local_error = None;
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    local_error = Some(err);
                    break;
                }
            }
        }

        let errors = self.comm().all_gather(local_error);
        if let Some((element, message)) = errors
            .into_iter()
            .flatten()
            .min_by_key(|(element, _)| *element)
        {
            return Err(AnalysisError::ElementEvaluation { element, message });
        }
        Ok(outputs)
    }

    fn evaluate_owned(
        &self,
        state: State<T>,
        design: &[T],
        request: ElementRequest<T>,
    ) -> Result<Vec<ElementOutput<T>>, AnalysisError> {
        let vpn = self.model.vars_per_node();
        self.for_owned_elements(Some(state), design, |_, evaluator, input| {
            let mut output =
                ElementOutput::zeros(evaluator.num_nodes() * vpn, evaluator.design_variables().len());
            evaluator.evaluate(input, request, &mut output)?;
            Ok(output)
        })
    }

    /// Sums element vectors into a new vector and accumulates halo contributions into their owners.
    fn scatter_vectors<'v>(&self, contributions: impl Iterator<Item = &'v DVector<T>>) -> DistVector<T>
    where
        T: 'v,
    {
        let layout = self.layout().clone();
        let vpn = layout.vars_per_node();
        let mut target = self.create_vector();
        {
            let mut extended = target.extended_mut();
            for (&element, contribution) in self.owned_elements.iter().zip(contributions) {
                let nodes = self.model.mesh().element_nodes(element);
                for (k, &node) in nodes.iter().enumerate() {
                    let local = layout
                        .extended_node(node)
                        .expect("nodes of owned elements are part of the layout");
                    let mut rows = extended.rows_mut(local * vpn, vpn);
                    rows += contribution.rows(k * vpn, vpn);
                }
            }
        }
        target.accumulate_halo();
        target
    }

    /// Sums element matrices into a zeroed copy of `template`.
    ///
    /// The copy is returned only if every rank accepted all of its contributions, so callers can
    /// leave their matrix untouched on failure.
    fn scatter_matrices<'m>(
        &self,
        template: &BlockCyclicMatrix<T>,
        contributions: impl Iterator<Item = &'m DMatrix<T>>,
        bc_diagonal: T,
    ) -> Result<BlockCyclicMatrix<T>, AnalysisError>
    where
        T: 'm,
    {
        let mut matrix = template.clone();
        matrix.zero();
        let mut local_error = None;
        for (&element, contribution) in self.owned_elements.iter().zip(contributions) {
            let nodes = self.model.mesh().element_nodes(element);
            if let Err(err) = matrix.add_element_contribution(nodes, contribution.into()) {
                local_error.get_or_insert(err);
            }
        }
        // Collective, so it runs even if a local contribution was rejected
        matrix.finalize_assembly()?;
        if let Some(err) = self.comm().all_gather(local_error).into_iter().flatten().next() {
            return Err(err.into());
        }
        matrix.apply_boundary_conditions(&self.constrained_dofs, bc_diagonal);
        Ok(matrix)
    }

    fn subtract_external_load(&self, residual: &mut DistVector<T>, load_factor: T) {
        for (dof, load) in self.model.loads() {
            if let Some(value) = residual.get_owned(dof) {
                residual.set_owned(dof, value - load * load_factor);
            }
        }
    }

    /// The external load vector scaled by `load_factor`.
    pub fn external_load(&self, load_factor: T) -> DistVector<T> {
        let mut load = self.create_vector();
        for (dof, value) in self.model.loads() {
            load.set_owned(dof, value * load_factor);
        }
        load
    }

    /// Sets the owned constrained degrees of freedom of `u` to `scale` times their prescribed
    /// values.
    pub fn apply_prescribed_values(&self, u: &mut DistVector<T>, scale: T) {
        for (dof, value) in self.model.boundary_conditions() {
            u.set_owned(dof, value * scale);
        }
    }

    /// Zeroes the owned constrained degrees of freedom.
    pub fn zero_constrained(&self, x: &mut DistVector<T>) {
        for &dof in &self.constrained_dofs {
            x.set_owned(dof, T::zero());
        }
    }

    /// Assembles $\vec R = \vec f^{\text{int}}(\vec u) + \vec M \vec a - \lambda \vec f^{\text{ext}}$,
    /// with zero entries for constrained degrees of freedom.
    pub fn assemble_residual(
        &self,
        state: State<T>,
        design: &[T],
        load_factor: T,
        residual: &mut DistVector<T>,
    ) -> Result<(), AnalysisError> {
        let outputs = self.evaluate_owned(state, design, ElementRequest::Residual)?;
        let mut assembled = self.scatter_vectors(outputs.iter().map(|output| &output.residual));
        self.subtract_external_load(&mut assembled, load_factor);
        self.zero_constrained(&mut assembled);
        *residual = assembled;
        Ok(())
    }

    /// Assembles the residual together with the Jacobian blend for the given coefficients.
    ///
    /// Constrained rows and columns of the Jacobian are replaced by the identity.
    pub fn assemble_residual_and_jacobian(
        &self,
        state: State<T>,
        design: &[T],
        load_factor: T,
        coefficients: JacobianCoefficients<T>,
        residual: &mut DistVector<T>,
        jacobian: &mut BlockCyclicMatrix<T>,
    ) -> Result<(), AnalysisError> {
        let outputs = self.evaluate_owned(state, design, ElementRequest::Jacobian(coefficients))?;
        let assembled_matrix = self.scatter_matrices(jacobian, outputs.iter().map(|output| &output.jacobian), T::one())?;
        let mut assembled = self.scatter_vectors(outputs.iter().map(|output| &output.residual));
        self.subtract_external_load(&mut assembled, load_factor);
        self.zero_constrained(&mut assembled);
        *residual = assembled;
        *jacobian = assembled_matrix;
        Ok(())
    }

    /// Assembles the Jacobian blend with `bc_diagonal` on the diagonal of constrained rows.
    pub fn assemble_matrix(
        &self,
        state: State<T>,
        design: &[T],
        coefficients: JacobianCoefficients<T>,
        bc_diagonal: T,
        matrix: &mut BlockCyclicMatrix<T>,
    ) -> Result<(), AnalysisError> {
        let outputs = self.evaluate_owned(state, design, ElementRequest::Jacobian(coefficients))?;
        *matrix = self.scatter_matrices(matrix, outputs.iter().map(|output| &output.jacobian), bc_diagonal)?;
        Ok(())
    }

    /// Accumulates $-\vec \lambda^T \pd{\vec R}{\vec x}$ into the replicated vector `dfdx`.
    ///
    /// Entries of `adjoint` at constrained degrees of freedom are ignored, since the residual
    /// there does not depend on the design. This is a collective operation.
    pub fn add_design_derivative_product(
        &self,
        state: State<T>,
        design: &[T],
        adjoint: Synced<T>,
        dfdx: &mut DVector<T>,
    ) -> Result<(), AnalysisError> {
        if dfdx.len() != design.len() {
            return Err(AnalysisError::InvalidModel(format!(
                "Gradient has {} entries, but there are {} design variables.",
                dfdx.len(),
                design.len()
            )));
        }
        let layout = self.layout();
        let products = self.for_owned_elements(Some(state), design, |element, evaluator, input| {
            let mut output = ElementOutput::zeros(input.u.len(), evaluator.design_variables().len());
            evaluator.evaluate(input, ElementRequest::DesignDerivative, &mut output)?;

            let nodes = self.model.mesh().element_nodes(element);
            let mut lambda = DVector::zeros(0);
            gather_nodal(&mut lambda, adjoint.extended(), layout, nodes);
            let vpn = layout.vars_per_node();
            for (k, &node) in nodes.iter().enumerate() {
                let local = layout
                    .extended_node(node)
                    .expect("nodes of owned elements are part of the layout");
                for c in 0..vpn {
                    if self.constrained_mask[local * vpn + c] {
                        lambda[k * vpn + c] = T::zero();
                    }
                }
            }
            Ok(output.design_derivative.tr_mul(&lambda))
        })?;

        let mut local = DVector::zeros(dfdx.len());
        for (&element, product) in self.owned_elements.iter().zip(&products) {
            for (&variable, &value) in self.model.elements()[element]
                .design_variables()
                .iter()
                .zip(product.iter())
            {
                local[variable] += value;
            }
        }
        *dfdx -= self.comm().all_reduce_sum_vector(&local);
        Ok(())
    }

    /// Total structural mass. This is a collective operation.
    pub fn structural_mass(&self, design: &[T]) -> Result<T, AnalysisError> {
        let masses = self.for_owned_elements(None, design, |_, evaluator, input| evaluator.mass(input))?;
        let local = masses
            .into_iter()
            .fold(T::zero(), |total, mass| total + mass);
        Ok(self.comm().all_reduce_sum(local))
    }

    /// Gradient of the structural mass with respect to the design. This is a collective
    /// operation.
    pub fn structural_mass_gradient(&self, design: &[T]) -> Result<DVector<T>, AnalysisError> {
        let derivatives = self.for_owned_elements(None, design, |_, evaluator, input| {
            let mut derivative = vec![T::zero(); evaluator.design_variables().len()];
            evaluator.mass_design_derivative(input, &mut derivative)?;
            Ok(derivative)
        })?;
        let mut local = DVector::zeros(design.len());
        for (&element, derivative) in self.owned_elements.iter().zip(&derivatives) {
            for (&variable, &value) in self.model.elements()[element]
                .design_variables()
                .iter()
                .zip(derivative)
            {
                local[variable] += value;
            }
        }
        Ok(self.comm().all_reduce_sum_vector(&local))
    }
}

/// Applies an assembled Jacobian blend without forming the global matrix.
///
/// Element matrices are evaluated once on construction and contracted with the element values
/// of the input on every application. Constrained degrees of freedom are treated like
/// [`BlockCyclicMatrix::apply_boundary_conditions`] does, so the operator agrees with the
/// assembled matrix with the same diagonal value.
pub struct MatrixFreeOperator<'s, 'a, T: Real, E> {
    assembler: &'s Assembler<'a, T, E>,
    element_matrices: Vec<DMatrix<T>>,
    bc_diagonal: T,
    transposed: bool,
}

impl<'s, 'a, T, E> MatrixFreeOperator<'s, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    /// Evaluates the element Jacobians at the given state. This is a collective operation.
    pub fn new(
        assembler: &'s Assembler<'a, T, E>,
        state: State<T>,
        design: &[T],
        coefficients: JacobianCoefficients<T>,
        bc_diagonal: T,
    ) -> Result<Self, AnalysisError> {
        let element_matrices = assembler
            .evaluate_owned(state, design, ElementRequest::Jacobian(coefficients))?
            .into_iter()
            .map(|output| output.jacobian)
            .collect();
        Ok(Self {
            assembler,
            element_matrices,
            bc_diagonal,
            transposed: false,
        })
    }

    /// The operator applying the transpose.
    pub fn transpose(self) -> Self {
        Self {
            transposed: !self.transposed,
            ..self
        }
    }
}

impl<'s, 'a, T, E> LinearOperator<T> for MatrixFreeOperator<'s, 'a, T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        let assembler = self.assembler;
        let layout = x.layout();
        let vpn = layout.vars_per_node();
        let x_extended = x.extended();

        y.fill(T::zero());
        {
            let mut y_extended = y.extended_mut();
            let mut x_element = DVector::zeros(0);
            for (&element, matrix) in assembler.owned_elements.iter().zip(&self.element_matrices) {
                let nodes = assembler.model.mesh().element_nodes(element);
                gather_nodal(&mut x_element, x_extended, layout, nodes);
                let locals: Vec<usize> = nodes
                    .iter()
                    .map(|&node| {
                        layout
                            .extended_node(node)
                            .expect("nodes of owned elements are part of the layout")
                    })
                    .collect();
                for (k, &local) in locals.iter().enumerate() {
                    for c in 0..vpn {
                        if assembler.constrained_mask[local * vpn + c] {
                            x_element[k * vpn + c] = T::zero();
                        }
                    }
                }

                let y_element = if self.transposed {
                    matrix.tr_mul(&x_element)
                } else {
                    matrix * &x_element
                };
                for (k, &local) in locals.iter().enumerate() {
                    let mut rows = y_extended.rows_mut(local * vpn, vpn);
                    rows += y_element.rows(k * vpn, vpn);
                }
            }
        }
        y.accumulate_halo();

        for &dof in &assembler.constrained_dofs {
            if let Some(value) = x.vector().get_owned(dof) {
                y.set_owned(dof, self.bc_diagonal * value);
            }
        }
        Ok(())
    }
}
