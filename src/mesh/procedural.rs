//! Basic procedural mesh generation routines.
use crate::mesh::{ElementTag, Mesh};
use nalgebra::Point2;
use trellis_traits::{from_f64, Real};

fn from_usize<T: Real>(value: usize) -> T {
    T::from_usize(value).expect("Must be able to fit usize in T")
}

fn line_mesh<T: Real>(tag: ElementTag, num_elements: usize, length: T) -> Mesh<T> {
    let h = length / from_usize(num_elements.max(1));
    let vertices = (0..=num_elements)
        .map(|i| Point2::new(from_usize::<T>(i) * h, T::zero()))
        .collect();
    let cells = (0..num_elements).map(|e| (tag, vec![e, e + 1])).collect();
    Mesh::from_vertices_and_cells(vertices, cells).expect("line connectivity is valid")
}

/// A chain of `num_elements` bars along the x-axis, from the origin to `(length, 0)`.
pub fn bar_chain<T: Real>(num_elements: usize, length: T) -> Mesh<T> {
    line_mesh(ElementTag::Bar, num_elements, length)
}

/// A straight beam along the x-axis with `num_elements` frame elements.
///
/// Node 0 sits at the origin and is the conventional clamped end.
pub fn cantilever_beam<T: Real>(num_elements: usize, length: T) -> Mesh<T> {
    line_mesh(ElementTag::Beam, num_elements, length)
}

/// An axis-aligned `width x height` rectangle with `nx x ny` uniform quadrilateral cells.
///
/// The lower left corner is the origin. Node `(i, j)` has global id `j * (nx + 1) + i`, and
/// cells are numbered row by row with counter-clockwise connectivity.
pub fn rectangular_quad_grid<T: Real>(nx: usize, ny: usize, width: T, height: T) -> Mesh<T> {
    let dx = width / from_usize(nx.max(1));
    let dy = height / from_usize(ny.max(1));
    let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
    for j in 0..=ny {
        for i in 0..=nx {
            vertices.push(Point2::new(from_usize::<T>(i) * dx, from_usize::<T>(j) * dy));
        }
    }

    let to_global_vertex_index = |i: usize, j: usize| (nx + 1) * j + i;
    let mut cells = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            let quad = vec![
                to_global_vertex_index(i, j),
                to_global_vertex_index(i + 1, j),
                to_global_vertex_index(i + 1, j + 1),
                to_global_vertex_index(i, j + 1),
            ];
            cells.push((ElementTag::Quad, quad));
        }
    }
    Mesh::from_vertices_and_cells(vertices, cells).expect("grid connectivity is valid")
}

/// A `width x height` quad grid whose interior nodes are displaced by a smooth perturbation.
///
/// Useful to exercise elements with non-rectangular geometry. `amplitude` is relative to the
/// cell size and must be below `0.25` to keep cells convex.
pub fn distorted_quad_grid<T: Real>(nx: usize, ny: usize, width: T, height: T, amplitude: f64) -> Mesh<T> {
    let mut mesh = rectangular_quad_grid(nx, ny, width, height);
    let dx = width / from_usize(nx.max(1));
    let dy = height / from_usize(ny.max(1));
    let a: T = from_f64(amplitude);
    for j in 1..ny {
        for i in 1..nx {
            let phase: T = from_f64((3 * i + 5 * j) as f64);
            let v = &mut mesh.vertices_mut()[(nx + 1) * j + i];
            v.x += a * dx * phase.sin();
            v.y += a * dy * phase.cos();
        }
    }
    mesh
}
