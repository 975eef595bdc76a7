//! Design variables shared by all ranks and their version marker.
use crate::error::AnalysisError;
use nalgebra::DVector;
use trellis_traits::{to_f64, Real};

/// Version of the design (and mesh geometry) that derived data was computed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DesignVersion(u64);

/// The design variable vector with its bounds.
///
/// Every rank holds an identical copy. The values are read-only during an analysis; every
/// modification between analyses bumps the [`DesignVersion`], which invalidates cached
/// Jacobians assembled for an older design.
#[derive(Debug, Clone)]
pub struct DesignContext<T: Real> {
    values: DVector<T>,
    lower: DVector<T>,
    upper: DVector<T>,
    version: u64,
}

impl<T: Real> DesignContext<T> {
    /// Unbounded design variables with the given initial values.
    pub fn new(values: DVector<T>) -> Self {
        let n = values.len();
        Self {
            values,
            lower: DVector::from_element(n, T::min_value().unwrap_or(-T::one() / T::default_epsilon())),
            upper: DVector::from_element(n, T::max_value().unwrap_or(T::one() / T::default_epsilon())),
            version: 0,
        }
    }

    pub fn with_bounds(self, lower: DVector<T>, upper: DVector<T>) -> Result<Self, AnalysisError> {
        let n = self.values.len();
        if lower.len() != n || upper.len() != n {
            return Err(AnalysisError::InvalidModel(format!(
                "Expected {} design variable bounds, got {} lower and {} upper bounds.",
                n,
                lower.len(),
                upper.len()
            )));
        }
        let context = Self { lower, upper, ..self };
        context.check_bounds(&context.values)?;
        Ok(context)
    }

    pub fn num_variables(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &DVector<T> {
        &self.values
    }

    pub fn lower_bounds(&self) -> &DVector<T> {
        &self.lower
    }

    pub fn upper_bounds(&self) -> &DVector<T> {
        &self.upper
    }

    pub fn version(&self) -> DesignVersion {
        DesignVersion(self.version)
    }

    /// Marks all derived data as stale without changing the values.
    ///
    /// Used when the mesh geometry changes.
    pub fn invalidate(&mut self) {
        self.version += 1;
    }

    fn check_bounds(&self, values: &DVector<T>) -> Result<(), AnalysisError> {
        if values.len() != self.values.len() {
            return Err(AnalysisError::InvalidModel(format!(
                "Expected {} design variables, got {}.",
                self.values.len(),
                values.len()
            )));
        }
        for i in 0..values.len() {
            if values[i] < self.lower[i] || values[i] > self.upper[i] {
                return Err(AnalysisError::InvalidModel(format!(
                    "Design variable {} = {:e} violates its bounds [{:e}, {:e}].",
                    i,
                    to_f64(values[i]),
                    to_f64(self.lower[i]),
                    to_f64(self.upper[i])
                )));
            }
        }
        Ok(())
    }

    /// Replaces all design variables. Fails without modification if a bound is violated.
    pub fn set_values(&mut self, values: DVector<T>) -> Result<(), AnalysisError> {
        self.check_bounds(&values)?;
        self.values = values;
        self.version += 1;
        Ok(())
    }

    /// Replaces a single design variable. Fails without modification if a bound is violated.
    pub fn set_value(&mut self, index: usize, value: T) -> Result<(), AnalysisError> {
        if index >= self.num_variables() {
            return Err(AnalysisError::InvalidModel(format!(
                "Design variable {} is out of range for {} variables.",
                index,
                self.num_variables()
            )));
        }
        let mut values = self.values.clone();
        values[index] = value;
        self.set_values(values)
    }

    /// Projects `values` onto the bounds.
    pub fn clamp(&self, values: &DVector<T>) -> DVector<T> {
        DVector::from_fn(values.len(), |i, _| values[i].max(self.lower[i]).min(self.upper[i]))
    }
}
