//! Gauss-Legendre quadrature rules on the reference interval `[-1, 1]` and square `[-1, 1]^2`.
use crate::Real;
use nalgebra::{Point1, Point2};

pub type QuadraturePair<T, P> = (Vec<T>, Vec<P>);
pub type QuadraturePair1d<T> = QuadraturePair<T, Point1<T>>;
pub type QuadraturePair2d<T> = QuadraturePair<T, Point2<T>>;

const GAUSS_1: [(f64, f64); 1] = [(0.0, 2.0)];
const GAUSS_2: [(f64, f64); 2] = [(-0.5773502691896257, 1.0), (0.5773502691896257, 1.0)];
const GAUSS_3: [(f64, f64); 3] = [
    (-0.7745966692414834, 0.5555555555555556),
    (0.0, 0.8888888888888888),
    (0.7745966692414834, 0.5555555555555556),
];
const GAUSS_4: [(f64, f64); 4] = [
    (-0.8611363115940526, 0.3478548451374538),
    (-0.3399810435848563, 0.6521451548625461),
    (0.3399810435848563, 0.6521451548625461),
    (0.8611363115940526, 0.3478548451374538),
];

fn gauss_table(num_points: usize) -> &'static [(f64, f64)] {
    match num_points {
        1 => &GAUSS_1,
        2 => &GAUSS_2,
        3 => &GAUSS_3,
        4 => &GAUSS_4,
        _ => panic!("Gauss-Legendre rules are available for 1 to 4 points, got {}", num_points),
    }
}

fn convert<T: Real>(value: f64) -> T {
    T::from_f64(value).expect("Quadrature constants must fit in T")
}

/// Gauss-Legendre rule with `num_points` points on `[-1, 1]`, exact for polynomials of degree
/// `2 * num_points - 1`.
///
/// # Panics
///
/// Panics unless `1 <= num_points <= 4`.
pub fn gauss<T: Real>(num_points: usize) -> QuadraturePair1d<T> {
    gauss_table(num_points)
        .iter()
        .map(|&(x, w)| (convert::<T>(w), Point1::new(convert::<T>(x))))
        .unzip()
}

/// Tensor-product Gauss-Legendre rule with `num_points^2` points on `[-1, 1]^2`.
///
/// Points are ordered with the first coordinate varying fastest.
pub fn quad_gauss<T: Real>(num_points: usize) -> QuadraturePair2d<T> {
    let table = gauss_table(num_points);
    let mut weights = Vec::with_capacity(table.len() * table.len());
    let mut points = Vec::with_capacity(table.len() * table.len());
    for &(y, w_y) in table {
        for &(x, w_x) in table {
            weights.push(convert::<T>(w_x * w_y));
            points.push(Point2::new(convert::<T>(x), convert::<T>(y)));
        }
    }
    (weights, points)
}
