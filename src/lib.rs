//! Distributed structural finite element analysis with adjoint design sensitivities.
//!
//! A [`Model`](model::Model) is replicated on every rank, while vectors and matrices are
//! distributed by node ownership. Ranks are threads started by
//! [`Universe::run`](sparse::Universe::run); all assembly and analysis routines are collective.
pub mod adjoint;
pub mod analysis;
pub mod assembly;
pub mod context;
pub mod element;
pub mod error;
pub mod functions;
pub mod grad_verify;
pub mod mesh;
pub mod model;

pub mod sparse {
    pub use trellis_sparse::*;
}

pub mod optimize {
    pub use trellis_optimize::*;
}

pub mod solid {
    pub use trellis_solid::*;
}

#[cfg(feature = "proptest-support")]
pub mod proptest;

pub extern crate nalgebra;
