use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use trellis_sparse::PatternError;
use trellis_traits::Real;

pub mod procedural;

/// Kind of element a mesh cell represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementTag {
    /// Two-node truss bar.
    Bar,
    /// Two-node Euler-Bernoulli frame element.
    Beam,
    /// Four-node bilinear plane stress quadrilateral, counter-clockwise node order.
    Quad,
}

impl ElementTag {
    pub fn num_nodes(&self) -> usize {
        match self {
            Self::Bar | Self::Beam => 2,
            Self::Quad => 4,
        }
    }
}

/// Index-based data structure for planar meshes.
///
/// The position of a vertex is its global node id, the position of a cell its global element
/// id. Both orderings are fixed once the mesh is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct Mesh<T: Real> {
    vertices: Vec<Point2<T>>,
    connectivity: Vec<Vec<usize>>,
    tags: Vec<ElementTag>,
}

impl<T: Real> Mesh<T> {
    /// Construct a mesh from vertices and tagged cells.
    ///
    /// Fails if a cell is empty, references a vertex that does not exist or has a node count
    /// that does not match its tag.
    pub fn from_vertices_and_cells(
        vertices: Vec<Point2<T>>,
        cells: Vec<(ElementTag, Vec<usize>)>,
    ) -> Result<Self, PatternError> {
        let (tags, connectivity): (Vec<_>, Vec<_>) = cells.into_iter().unzip();
        for (element, (tag, nodes)) in tags.iter().zip(&connectivity).enumerate() {
            if nodes.is_empty() || nodes.len() != tag.num_nodes() {
                return Err(PatternError::EmptyElement { element });
            }
            if let Some(&node) = nodes.iter().find(|&&node| node >= vertices.len()) {
                return Err(PatternError::UnmappedNode {
                    element,
                    node,
                    num_nodes: vertices.len(),
                });
            }
        }
        Ok(Self {
            vertices,
            connectivity,
            tags,
        })
    }

    pub fn vertices(&self) -> &[Point2<T>] {
        &self.vertices
    }

    pub(crate) fn vertices_mut(&mut self) -> &mut [Point2<T>] {
        &mut self.vertices
    }

    pub fn connectivity(&self) -> &[Vec<usize>] {
        &self.connectivity
    }

    pub fn element_nodes(&self, element: usize) -> &[usize] {
        &self.connectivity[element]
    }

    pub fn tags(&self) -> &[ElementTag] {
        &self.tags
    }

    pub fn num_nodes(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.len()
    }

    /// Nodes whose coordinates satisfy the predicate, ascending.
    pub fn find_nodes(&self, predicate: impl Fn(&Point2<T>) -> bool) -> Vec<usize> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| predicate(v))
            .map(|(i, _)| i)
            .collect()
    }
}
