use nalgebra::RealField;

pub use nalgebra;

pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Converts a scalar to `f64` for reporting purposes.
///
/// Returns `NaN` if the value cannot be represented.
pub fn to_f64<T: Real>(value: T) -> f64 {
    let converted: Option<f64> = value.to_subset();
    converted.unwrap_or(f64::NAN)
}

/// Converts an `f64` constant (tolerances, settings) into the scalar type.
///
/// # Panics
///
/// Panics if the constant cannot be represented by `T`.
pub fn from_f64<T: Real>(value: f64) -> T {
    T::from_f64(value).expect("constant must fit in T")
}
