use crate::constitutive::ConstitutiveModel;
use crate::element::{KinematicPoint, LinearKinematics};
use crate::quadrature::quad_gauss;
use crate::Real;
use eyre::eyre;
use nalgebra::{DMatrix, Matrix2, Point2, Point3, Vector2};
use numeric_literals::replace_float_literals;
use std::sync::Arc;

/// Bilinear four-node quadrilateral in the xy plane with plane stress kinematics.
///
/// Nodes are ordered counter-clockwise and carry the displacements `u` and `v`. Strains are
/// `[eps_xx, eps_yy, gamma_xy]`.
pub struct Quad4PlaneStress<T: Real> {
    constitutive: Arc<dyn ConstitutiveModel<T>>,
    weights: Vec<T>,
    points: Vec<Point2<T>>,
}

impl<T: Real> Quad4PlaneStress<T> {
    pub fn new(constitutive: Arc<dyn ConstitutiveModel<T>>) -> Self {
        let (weights, points) = quad_gauss::<T>(2);
        Self {
            constitutive,
            weights,
            points,
        }
    }
}

impl<T: Real> std::fmt::Debug for Quad4PlaneStress<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quad4PlaneStress")
            .field("constitutive", &self.constitutive.object_name())
            .finish()
    }
}

/// Values and reference gradients of the bilinear basis functions.
#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
fn quad4_basis<T: Real>(xi: &Point2<T>) -> ([T; 4], [Vector2<T>; 4]) {
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    let values = corners.map(|(a, b)| 0.25 * (1.0 + a * xi.x) * (1.0 + b * xi.y));
    let gradients = corners.map(|(a, b)| Vector2::new(0.25 * a * (1.0 + b * xi.y), 0.25 * b * (1.0 + a * xi.x)));
    (values, gradients)
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> LinearKinematics<T> for Quad4PlaneStress<T> {
    fn object_name(&self) -> &'static str {
        "Quad4PlaneStress"
    }

    fn vars_per_node(&self) -> usize {
        2
    }

    fn num_nodes(&self) -> usize {
        4
    }

    fn constitutive(&self) -> &Arc<dyn ConstitutiveModel<T>> {
        &self.constitutive
    }

    fn num_quadrature_points(&self) -> usize {
        self.points.len()
    }

    fn eval_kinematics(&self, n: usize, xpts: &[T]) -> eyre::Result<KinematicPoint<T>> {
        assert_eq!(xpts.len(), 12);
        let xi = &self.points[n];
        let (values, gradients) = quad4_basis(xi);

        let mut x = Point3::origin();
        let mut jacobian = Matrix2::zeros();
        for (i, (phi, grad)) in values.iter().zip(&gradients).enumerate() {
            let node = Vector2::new(xpts[3 * i], xpts[3 * i + 1]);
            x.coords += Point3::new(xpts[3 * i], xpts[3 * i + 1], xpts[3 * i + 2]).coords * *phi;
            jacobian += node * grad.transpose();
        }
        let det = jacobian.determinant();
        if det <= 0.0 {
            return Err(eyre!("non-positive Jacobian determinant {:?}", det));
        }
        let inverse_transpose = jacobian
            .try_inverse()
            .ok_or_else(|| eyre!("singular element Jacobian"))?
            .transpose();

        let mut strain_matrix = DMatrix::zeros(3, 8);
        let mut displacement_matrix = DMatrix::zeros(2, 8);
        for (i, (phi, grad)) in values.iter().zip(&gradients).enumerate() {
            let physical_grad = inverse_transpose * grad;
            let (dx, dy) = (physical_grad.x, physical_grad.y);
            strain_matrix[(0, 2 * i)] = dx;
            strain_matrix[(1, 2 * i + 1)] = dy;
            strain_matrix[(2, 2 * i)] = dy;
            strain_matrix[(2, 2 * i + 1)] = dx;
            displacement_matrix[(0, 2 * i)] = *phi;
            displacement_matrix[(1, 2 * i + 1)] = *phi;
        }

        Ok(KinematicPoint {
            pt: vec![xi.x, xi.y],
            x,
            weight: self.weights[n] * det,
            strain_matrix,
            displacement_matrix,
        })
    }
}
