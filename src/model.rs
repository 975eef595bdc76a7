//! A mesh together with its element evaluators, boundary conditions and loads.
use crate::context::DesignContext;
use crate::element::{ElementEvaluator, ElementKind};
use crate::error::AnalysisError;
use crate::mesh::{ElementTag, Mesh};
use nalgebra::Point2;
use std::collections::BTreeMap;
use trellis_traits::Real;

/// The complete description of a structural problem, replicated on every rank.
///
/// Boundary conditions prescribe the value of individual degrees of freedom. Nodal loads are
/// summed per degree of freedom and scaled by the load factor of the analysis.
#[derive(Debug, Clone)]
pub struct Model<T: Real, E = ElementKind<T>> {
    mesh: Mesh<T>,
    elements: Vec<E>,
    vars_per_node: usize,
    boundary: BTreeMap<usize, T>,
    loads: BTreeMap<usize, T>,
    num_design_variables: usize,
}

impl<T, E> Model<T, E>
where
    T: Real,
    E: ElementEvaluator<T>,
{
    /// Combines a mesh with one evaluator per mesh element.
    ///
    /// Fails if the number of evaluators does not match the number of cells, if an evaluator
    /// expects a different number of nodes than its cell has, or if evaluators disagree on the
    /// number of variables per node.
    pub fn new(mesh: Mesh<T>, elements: Vec<E>) -> Result<Self, AnalysisError> {
        if elements.len() != mesh.num_elements() {
            return Err(AnalysisError::InvalidModel(format!(
                "Mesh has {} elements, but {} evaluators were given.",
                mesh.num_elements(),
                elements.len()
            )));
        }
        let vars_per_node = elements
            .first()
            .map(|element| element.vars_per_node())
            .ok_or_else(|| AnalysisError::InvalidModel("Model has no elements.".to_string()))?;

        for (index, element) in elements.iter().enumerate() {
            let nodes = mesh.element_nodes(index);
            if element.num_nodes() != nodes.len() {
                return Err(AnalysisError::InvalidModel(format!(
                    "Element {} has {} nodes, but its evaluator expects {}.",
                    index,
                    nodes.len(),
                    element.num_nodes()
                )));
            }
            if element.vars_per_node() != vars_per_node {
                return Err(AnalysisError::InvalidModel(format!(
                    "Element {} has {} variables per node, expected {}.",
                    index,
                    element.vars_per_node(),
                    vars_per_node
                )));
            }
        }

        let num_design_variables = elements
            .iter()
            .flat_map(|element| element.design_variables().iter().map(|&i| i + 1))
            .max()
            .unwrap_or(0);

        Ok(Self {
            mesh,
            elements,
            vars_per_node,
            boundary: BTreeMap::new(),
            loads: BTreeMap::new(),
            num_design_variables,
        })
    }

    /// Creates one evaluator per mesh cell from its index and tag.
    pub fn from_mesh(mesh: Mesh<T>, mut element: impl FnMut(usize, ElementTag) -> E) -> Result<Self, AnalysisError> {
        let elements = mesh
            .tags()
            .iter()
            .enumerate()
            .map(|(index, &tag)| element(index, tag))
            .collect();
        Self::new(mesh, elements)
    }

    fn check_dof(&self, dof: usize) -> Result<(), AnalysisError> {
        if dof >= self.num_dofs() {
            return Err(AnalysisError::InvalidModel(format!(
                "Degree of freedom {} is out of bounds, model has {} degrees of freedom.",
                dof,
                self.num_dofs()
            )));
        }
        Ok(())
    }

    /// Prescribes the value of a degree of freedom, replacing an earlier prescription.
    pub fn prescribe(&mut self, dof: usize, value: T) -> Result<(), AnalysisError> {
        self.check_dof(dof)?;
        self.boundary.insert(dof, value);
        Ok(())
    }

    /// Fixes all variables of a node at zero.
    pub fn fix_node(&mut self, node: usize) -> Result<(), AnalysisError> {
        for c in 0..self.vars_per_node {
            self.prescribe(node * self.vars_per_node + c, T::zero())?;
        }
        Ok(())
    }

    /// Adds a nodal load to a degree of freedom.
    pub fn add_load(&mut self, dof: usize, value: T) -> Result<(), AnalysisError> {
        self.check_dof(dof)?;
        let load = self.loads.entry(dof).or_insert_with(T::zero);
        *load += value;
        Ok(())
    }

    pub fn with_fixed_nodes(mut self, nodes: impl IntoIterator<Item = usize>) -> Result<Self, AnalysisError> {
        for node in nodes {
            self.fix_node(node)?;
        }
        Ok(self)
    }

    pub fn with_load(mut self, dof: usize, value: T) -> Result<Self, AnalysisError> {
        self.add_load(dof, value)?;
        Ok(self)
    }

    /// Moves mesh nodes and marks everything derived from the old geometry as stale.
    pub fn update_coordinates(
        &mut self,
        context: &mut DesignContext<T>,
        mut update: impl FnMut(usize, &mut Point2<T>),
    ) {
        for (node, vertex) in self.mesh.vertices_mut().iter_mut().enumerate() {
            update(node, vertex);
        }
        context.invalidate();
    }

    /// Checks that the design context provides every variable an element refers to.
    pub fn check_design(&self, design: &[T]) -> Result<(), AnalysisError> {
        if design.len() < self.num_design_variables {
            return Err(AnalysisError::InvalidModel(format!(
                "Elements refer to {} design variables, but only {} are given.",
                self.num_design_variables,
                design.len()
            )));
        }
        Ok(())
    }
}

impl<T: Real, E> Model<T, E> {
    pub fn mesh(&self) -> &Mesh<T> {
        &self.mesh
    }

    pub fn elements(&self) -> &[E] {
        &self.elements
    }

    pub fn vars_per_node(&self) -> usize {
        self.vars_per_node
    }

    pub fn num_dofs(&self) -> usize {
        self.mesh.num_nodes() * self.vars_per_node
    }

    /// The minimum number of design variables required by the elements.
    pub fn num_design_variables(&self) -> usize {
        self.num_design_variables
    }

    /// Constrained degrees of freedom in ascending order, with their prescribed values.
    pub fn boundary_conditions(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.boundary.iter().map(|(&dof, &value)| (dof, value))
    }

    /// Constrained degrees of freedom in ascending order.
    pub fn constrained_dofs(&self) -> Vec<usize> {
        self.boundary.keys().copied().collect()
    }

    /// Loaded degrees of freedom in ascending order, with the total load.
    pub fn loads(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.loads.iter().map(|(&dof, &value)| (dof, value))
    }
}
