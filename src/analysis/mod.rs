//! Analysis drivers built on the assembler.
//!
//! All drivers are collective: every rank must call the same methods in the same order.
pub mod linear;
pub mod modal;
pub mod statics;
pub mod transient;

pub use linear::{KrylovMethod, LinearSolver, PreconditionerKind, SolverSettings};
pub use modal::{FrequencyAnalysis, FrequencySettings, ModalOutput};
pub use statics::{LoadStep, StaticAnalysis, StaticOutput, StaticSettings};
pub use transient::{NewmarkSettings, TimeStep, TransientAnalysis, TransientOutput};
