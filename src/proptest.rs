use crate::mesh::procedural::rectangular_quad_grid;
use crate::mesh::Mesh;
use ::proptest::collection::vec;
use ::proptest::prelude::*;
use nalgebra::{DVector, Point2};

pub fn point2() -> impl Strategy<Value = Point2<f64>> {
    // Pick a reasonably small range to pick coordinates from,
    // otherwise we can easily get floating point numbers that are
    // so ridiculously large as to break anything we might want to do with them
    let range = -10.0..10.0;
    [range.clone(), range.clone()].prop_map(|[x, y]| Point2::new(x, y))
}

/// Counter-clockwise convex quadrilaterals, obtained by perturbing the corners of a
/// translated and scaled unit square by less than a quarter of its side.
pub fn convex_quad() -> impl Strategy<Value = [Point2<f64>; 4]> {
    let perturbation = [-0.2..0.2, -0.2..0.2];
    (point2(), 0.1..5.0, [perturbation.clone(), perturbation.clone(), perturbation.clone(), perturbation])
        .prop_map(|(origin, scale, perturbations)| {
            let corners = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
            let mut quad = [origin; 4];
            for ((vertex, [x, y]), [dx, dy]) in quad.iter_mut().zip(corners).zip(perturbations) {
                vertex.x += scale * (x + dx);
                vertex.y += scale * (y + dy);
            }
            quad
        })
}

/// Design vectors of the given length with entries in `[lower, upper)`.
pub fn design_vector(len: usize, lower: f64, upper: f64) -> impl Strategy<Value = DVector<f64>> {
    vec(lower..upper, len).prop_map(DVector::from_vec)
}

/// Rectangular quad grids with at most `max_cells` cells per direction.
pub fn quad_grid(max_cells: usize) -> impl Strategy<Value = Mesh<f64>> {
    (1..=max_cells.max(1), 1..=max_cells.max(1), 0.5..4.0, 0.5..4.0)
        .prop_map(|(nx, ny, width, height)| rectangular_quad_grid(nx, ny, width, height))
}

/// Arbitrary owner ranks for `num_nodes` nodes, each rank owning at least one node.
pub fn node_owners(num_nodes: usize, num_ranks: usize) -> impl Strategy<Value = Vec<usize>> {
    assert!(num_nodes >= num_ranks);
    vec(0..num_ranks, num_nodes).prop_map(move |mut owners| {
        for rank in 0..num_ranks {
            owners[rank * (num_nodes / num_ranks)] = rank;
        }
        owners
    })
}
