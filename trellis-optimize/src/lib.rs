/// Numerical differentiation
pub mod calculus;
/// Newton iteration as a state machine over an abstract nonlinear system, with line search
pub mod newton;
