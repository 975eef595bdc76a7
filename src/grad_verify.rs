//! Comparison of adjoint gradients against central finite differences.
use crate::adjoint::AdjointSolver;
use crate::analysis::statics::StaticAnalysis;
use crate::context::DesignContext;
use crate::element::ElementEvaluator;
use crate::error::AnalysisError;
use crate::functions::StructuralFunction;
use log::{info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use trellis_optimize::calculus::try_approximate_gradient_fd;
use trellis_traits::{from_f64, to_f64, Real};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSettings {
    /// Finite difference step.
    pub step: f64,
    pub relative_tolerance: f64,
    /// Differences below this are accepted regardless of the relative error.
    pub absolute_tolerance: f64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            step: 1e-6,
            relative_tolerance: 1e-4,
            absolute_tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientEntry {
    pub variable: usize,
    pub adjoint: f64,
    pub finite_difference: f64,
    pub relative_error: f64,
    pub mismatch: bool,
}

/// Entry-wise comparison of an adjoint gradient with finite differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientReport {
    pub entries: Vec<GradientEntry>,
}

impl GradientReport {
    pub fn mismatches(&self) -> impl Iterator<Item = &GradientEntry> {
        self.entries.iter().filter(|entry| entry.mismatch)
    }

    pub fn max_relative_error(&self) -> f64 {
        self.entries
            .iter()
            .map(|entry| entry.relative_error)
            .fold(0.0, f64::max)
    }

    fn compare<T: Real>(adjoint: &DVector<T>, finite_difference: &DVector<T>, settings: &VerificationSettings) -> Self {
        let entries = adjoint
            .iter()
            .zip(finite_difference.iter())
            .enumerate()
            .map(|(variable, (&adjoint, &finite_difference))| {
                let adjoint = to_f64(adjoint);
                let finite_difference = to_f64(finite_difference);
                let difference = (adjoint - finite_difference).abs();
                let scale = adjoint.abs().max(finite_difference.abs());
                let relative_error = if scale > 0.0 { difference / scale } else { 0.0 };
                GradientEntry {
                    variable,
                    adjoint,
                    finite_difference,
                    relative_error,
                    mismatch: difference > settings.absolute_tolerance
                        && relative_error > settings.relative_tolerance,
                }
            })
            .collect();
        Self { entries }
    }
}

/// Checks the adjoint gradient of `function` at the design in `context` against central
/// differences of the full nonlinear solve.
///
/// Each design variable is perturbed in turn and the static analysis re-solved. The context is
/// restored to its original values and the analysis re-solved before returning, so that its state
/// corresponds to the unperturbed design. Returns
/// [`GradientMismatch`](AnalysisError::GradientMismatch) if any entry exceeds both tolerances.
/// Perturbations must stay within the design bounds.
///
/// This is a collective operation.
pub fn verify_gradient<T, E, F>(
    analysis: &mut StaticAnalysis<'_, '_, T, E>,
    context: &mut DesignContext<T>,
    function: &F,
    adjoint_solver: &mut AdjointSolver<T>,
    settings: &VerificationSettings,
) -> Result<GradientReport, AnalysisError>
where
    T: Real,
    E: ElementEvaluator<T>,
    F: StructuralFunction<T>,
{
    analysis.solve(context)?;
    let adjoint = adjoint_solver.solve(analysis, context, function)?;

    let original = context.values().clone();
    let mut x = original.clone();
    let finite_difference = try_approximate_gradient_fd(
        |x| {
            context.set_values(x.clone_owned())?;
            analysis.solve(context)?;
            let design = context.values().as_slice();
            let assembler = analysis.assembler();
            let state = analysis.synchronized_state();
            function.value(assembler, state.u, design)
        },
        &mut x,
        from_f64(settings.step),
    );

    // Restore regardless of the outcome
    context.set_values(original)?;
    analysis.solve(context)?;
    let finite_difference = finite_difference?;

    let report = GradientReport::compare(&adjoint.gradient, &finite_difference, settings);
    let num_mismatches = report.mismatches().count();
    if num_mismatches > 0 {
        for entry in report.mismatches() {
            warn!(
                "Gradient mismatch for design variable {}: adjoint {:e}, finite difference {:e}",
                entry.variable, entry.adjoint, entry.finite_difference
            );
        }
        return Err(AnalysisError::GradientMismatch(report));
    }
    info!(
        "Adjoint gradient verified for {} design variables (max relative error {:e})",
        report.entries.len(),
        report.max_relative_error()
    );
    Ok(report)
}
