//! Distributed sparse linear algebra for trellis.
//!
//! Ranks are threads that communicate through a [`Communicator`]. Degrees of freedom are
//! assigned to ranks by a [`PartitionMap`], vectors carry a halo of remote values that is
//! refreshed explicitly, and matrices are stored as node-level blocks of the owned rows.

/// In-process message passing between ranks
pub mod comm;
/// Ownership of nodes and elements
pub mod partition;
/// Owned/halo numbering and halo exchange plans
pub mod layout;
/// Distributed vectors and halo synchronization tokens
pub mod vector;
/// Distributed block sparse matrices
pub mod block_cyclic;
/// Operator abstraction and solver errors shared by the Krylov methods
pub mod krylov;
/// Preconditioned conjugate gradient
pub mod cg;
/// Restarted GMRES
pub mod gmres;
/// Aggregation multigrid
pub mod multigrid;

pub use block_cyclic::BlockCyclicMatrix;
pub use comm::{Communicator, Universe};
pub use layout::VectorLayout;
pub use partition::{PartitionMap, PatternError};
pub use vector::{DistVector, Synced};

pub use nalgebra_sparse::CsrMatrix;
