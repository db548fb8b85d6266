//! Finite difference approximations of derivatives, used to verify analytic sensitivities.
use log::debug;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorView, DVectorViewMut, RealField};
use numeric_literals::replace_float_literals;

/// Scalar types supported by the finite difference approximations.
pub trait Real: RealField + Copy {}

impl<T> Real for T where T: RealField + Copy {}

/// Approximates the derivative of the function `f: R^n -> R` with central finite differences.
///
/// The parameter `h` determines the step size of the finite difference approximation.
///
/// The vector `x` is mutable in order to contain intermediate computations, but upon returning,
/// its content remains unchanged.
pub fn approximate_gradient_fd<'a, T>(
    f: impl FnMut(DVectorView<T>) -> T,
    x: impl Into<DVectorViewMut<'a, T>>,
    h: T,
) -> DVector<T>
where
    T: Real,
{
    let x = x.into();
    let mut df = DVector::zeros(x.len());
    approximate_gradient_fd_into_(DVectorViewMut::from(&mut df), f, x, h);
    df
}

#[replace_float_literals(T::from_f64(literal).unwrap())]
fn approximate_gradient_fd_into_<T>(
    mut df: DVectorViewMut<T>,
    mut f: impl FnMut(DVectorView<T>) -> T,
    mut x: DVectorViewMut<T>,
    h: T,
) where
    T: Real,
{
    let n = x.len();
    for i in 0..n {
        let x_i = x[i];
        x[i] = x_i + h;
        let f_plus = f(DVectorView::from(&x));
        x[i] = x_i - h;
        let f_minus = f(DVectorView::from(&x));
        df[i] = (f_plus - f_minus) / (2.0 * h);
        x[i] = x_i;
    }
}

/// Approximates the Jacobian of the function `f: R^n -> R^m` with central finite differences.
///
/// The Jacobian matrix is the `m x n` matrix whose entries are given by `J_ij = df_i/dx_j`.
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

    // Buffers to hold f(x + e_i h) and f(x - e_i h)
    let mut f_plus = DVector::zeros(m);
    let mut f_minus = DVector::zeros(m);

    for i in 0..n {
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

/// Approximates the derivative of `f` at `x` along `direction` with a central finite difference.
///
/// Only two evaluations of `f` are needed regardless of the dimension of `x`, which makes this
/// the preferred check for expensive functions such as full structural analyses.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn approximate_directional_derivative_fd<T>(
    mut f: impl FnMut(&DVector<T>) -> T,
    x: &DVector<T>,
    direction: &DVector<T>,
    h: T,
) -> T
where
    T: Real,
{
    assert_eq!(x.len(), direction.len());
    let x_plus = x + direction * h;
    let x_minus = x - direction * h;
    (f(&x_plus) - f(&x_minus)) / (2.0 * h)
}

/// Relative error `|approx - exact| / max(|exact|, floor)`.
///
/// The floor prevents division by (nearly) zero for vanishing exact values.
pub fn relative_error<T: Real>(approx: T, exact: T, floor: T) -> T {
    (approx - exact).abs() / exact.abs().max(floor)
}

/// Observed order of convergence from errors at successively refined step sizes.
///
/// Given pairs `(h_i, e_i)`, returns the slopes `log(e_i / e_{i+1}) / log(h_i / h_{i+1})`
/// between consecutive pairs.
pub fn convergence_rates<T: Real>(errors: &[(T, T)]) -> Vec<T> {
    let rates: Vec<T> = errors
        .windows(2)
        .map(|pair| {
            let (h0, e0) = pair[0];
            let (h1, e1) = pair[1];
            (e0 / e1).ln() / (h0 / h1).ln()
        })
        .collect();
    debug!("Observed convergence rates: {:?}", rates);
    rates
}
