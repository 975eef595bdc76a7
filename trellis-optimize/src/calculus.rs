use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorView, DVectorViewMut};
use numeric_literals::replace_float_literals;
use trellis_traits::Real;

/// Approximates the derivative of the function `f: R^n -> R` with central finite differences.
///
/// The parameter `h` determines the step size of the finite difference approximation.
///
/// The vector `x` is mutable in order to contain intermediate computations, but upon returning,
/// its content remains unchanged.
pub fn approximate_gradient_fd<'a, T>(
    mut f: impl FnMut(DVectorView<T>) -> T,
    x: impl Into<DVectorViewMut<'a, T>>,
    h: T,
) -> DVector<T>
where
    T: Real,
{
    let x = x.into();
    let mut df = DVector::zeros(x.len());
    let result: Result<(), std::convert::Infallible> =
        try_approximate_gradient_fd_into_(DVectorViewMut::from(&mut df), |x| Ok(f(x)), x, h);
    match result {
        Ok(()) => df,
        Err(never) => match never {},
    }
}

/// Approximates the gradient of a fallible function `f: R^n -> R` with central finite
/// differences.
///
/// Evaluation stops at the first error, which is returned. The content of `x` is restored in
/// either case.
pub fn try_approximate_gradient_fd<'a, T, E>(
    f: impl FnMut(DVectorView<T>) -> Result<T, E>,
    x: impl Into<DVectorViewMut<'a, T>>,
    h: T,
) -> Result<DVector<T>, E>
where
    T: Real,
{
    let x = x.into();
    let mut df = DVector::zeros(x.len());
    try_approximate_gradient_fd_into_(DVectorViewMut::from(&mut df), f, x, h)?;
    Ok(df)
}

#[replace_float_literals(T::from_f64(literal).unwrap())]
fn try_approximate_gradient_fd_into_<T, E>(
    mut df: DVectorViewMut<T>,
    mut f: impl FnMut(DVectorView<T>) -> Result<T, E>,
    mut x: DVectorViewMut<T>,
    h: T,
) -> Result<(), E>
where
    T: Real,
{
    assert_eq!(df.len(), x.len());
    for i in 0..x.len() {
        let x_i = x[i];
        x[i] = x_i + h;
        let values = f(DVectorView::from(&x)).and_then(|f_plus| {
            x[i] = x_i - h;
            Ok((f_plus, f(DVectorView::from(&x))?))
        });
        x[i] = x_i;
        let (f_plus, f_minus) = values?;
        df[i] = (f_plus - f_minus) / (2.0 * h);
    }
    Ok(())
}

/// Approximates the Jacobian of the function $f: \mathbb{R}^n \rightarrow \mathbb{R}^m$
/// with central finite differences.
///
/// The Jacobian matrix is the $m \times n$ matrix whose entries are given by
/// $$ J_{ij} := \pd{f_i}{x_j}.$$
///
/// The parameter `h` determines the step size of the finite difference approximation.
pub fn approximate_jacobian_fd<'a, T>(
    m: usize,
    f: impl FnMut(DVectorView<T>, DVectorViewMut<T>),
    x: impl Into<DVectorViewMut<'a, T>>,
    h: T,
) -> DMatrix<T>
where
    T: Real,
{
    let x = x.into();
    let n = x.len();
    let mut jacobian = DMatrix::zeros(m, n);
    approximate_jacobian_fd_into_(DMatrixViewMut::from(&mut jacobian), f, x, h);
    jacobian
}

#[replace_float_literals(T::from_f64(literal).unwrap())]
fn approximate_jacobian_fd_into_<T>(
    mut j: DMatrixViewMut<T>,
    mut f: impl FnMut(DVectorView<T>, DVectorViewMut<T>),
    mut x: DVectorViewMut<T>,
    h: T,
) where
    T: Real,
{
    let m = j.nrows();
    let n = x.len();
    assert_eq!(n, j.ncols());

    let mut f_plus = DVector::zeros(m);
    let mut f_minus = DVector::zeros(m);

    for i in 0..n {
        // df_dxi ~ (f(x + h e_i) - f(x - h e_i)) / (2 h)
        let xi = x[i];
        x[i] = xi + h;
        f(DVectorView::from(&x), DVectorViewMut::from(&mut f_plus));
        x[i] = xi - h;
        f(DVectorView::from(&x), DVectorViewMut::from(&mut f_minus));
        x[i] = xi;

        let mut df_dxi = j.column_mut(i);
        df_dxi.copy_from(&f_plus);
        df_dxi -= &f_minus;
        df_dxi /= 2.0 * h;
    }
}
