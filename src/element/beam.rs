use crate::constitutive::ConstitutiveModel;
use crate::element::{KinematicPoint, LinearKinematics};
use crate::quadrature::gauss;
use crate::Real;
use eyre::eyre;
use nalgebra::{DMatrix, Point3};
use numeric_literals::replace_float_literals;
use std::sync::Arc;

/// Planar two-node Euler-Bernoulli beam in the xy plane.
///
/// Each node carries the displacements `u`, `v` and the rotation `theta` about the z axis.
/// Axial displacement is interpolated linearly and transverse displacement with cubic Hermite
/// polynomials. Strains are passed to the constitutive model as
/// `[axial, 0, 0, curvature_z, 0, 0]`, so the bending stiffness is `E Iz`.
pub struct EulerBernoulliBeam2d<T: Real> {
    constitutive: Arc<dyn ConstitutiveModel<T>>,
    weights: Vec<T>,
    points: Vec<T>,
}

impl<T: Real> EulerBernoulliBeam2d<T> {
    pub fn new(constitutive: Arc<dyn ConstitutiveModel<T>>) -> Self {
        let (weights, points) = gauss::<T>(4);
        Self {
            constitutive,
            weights,
            points: points.into_iter().map(|p| p.x).collect(),
        }
    }
}

impl<T: Real> std::fmt::Debug for EulerBernoulliBeam2d<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EulerBernoulliBeam2d")
            .field("constitutive", &self.constitutive.object_name())
            .finish()
    }
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> LinearKinematics<T> for EulerBernoulliBeam2d<T> {
    fn object_name(&self) -> &'static str {
        "EulerBernoulliBeam2d"
    }

    fn vars_per_node(&self) -> usize {
        3
    }

    fn num_nodes(&self) -> usize {
        2
    }

    fn constitutive(&self) -> &Arc<dyn ConstitutiveModel<T>> {
        &self.constitutive
    }

    fn num_quadrature_points(&self) -> usize {
        self.points.len()
    }

    #[allow(non_snake_case)]
    fn eval_kinematics(&self, n: usize, xpts: &[T]) -> eyre::Result<KinematicPoint<T>> {
        assert_eq!(xpts.len(), 6);
        let dx = xpts[3] - xpts[0];
        let dy = xpts[4] - xpts[1];
        let L = (dx * dx + dy * dy).sqrt();
        if L <= 0.0 {
            return Err(eyre!("beam has non-positive length {:?}", L));
        }
        let (c, s) = (dx / L, dy / L);

        let xi = self.points[n];
        let weight = self.weights[n] * 0.5 * L;
        let t = 0.5 * (xi + 1.0);
        let x = Point3::new(
            xpts[0] + t * dx,
            xpts[1] + t * dy,
            xpts[2] + t * (xpts[5] - xpts[2]),
        );

        // Rotation from global to local element variables
        let mut rotation = DMatrix::zeros(6, 6);
        for node in 0..2 {
            let o = 3 * node;
            rotation[(o, o)] = c;
            rotation[(o, o + 1)] = s;
            rotation[(o + 1, o)] = -s;
            rotation[(o + 1, o + 1)] = c;
            rotation[(o + 2, o + 2)] = 1.0;
        }

        // Local strain-displacement relation in terms of [u1, v1, theta1, u2, v2, theta2]
        let mut local_strain = DMatrix::zeros(6, 6);
        local_strain[(0, 0)] = -1.0 / L;
        local_strain[(0, 3)] = 1.0 / L;
        local_strain[(3, 1)] = (-6.0 + 12.0 * t) / (L * L);
        local_strain[(3, 2)] = (-4.0 + 6.0 * t) / L;
        local_strain[(3, 4)] = (6.0 - 12.0 * t) / (L * L);
        local_strain[(3, 5)] = (-2.0 + 6.0 * t) / L;

        // Local displacement interpolation
        let mut local_displacement = DMatrix::zeros(2, 6);
        local_displacement[(0, 0)] = 1.0 - t;
        local_displacement[(0, 3)] = t;
        local_displacement[(1, 1)] = 1.0 - 3.0 * t * t + 2.0 * t * t * t;
        local_displacement[(1, 2)] = L * (t - 2.0 * t * t + t * t * t);
        local_displacement[(1, 4)] = 3.0 * t * t - 2.0 * t * t * t;
        local_displacement[(1, 5)] = L * (t * t * t - t * t);
        let to_global = DMatrix::from_row_slice(2, 2, &[c, -s, s, c]);
        let displacement_matrix = to_global * &local_displacement * &rotation;

        Ok(KinematicPoint {
            pt: vec![xi],
            x,
            weight,
            strain_matrix: local_strain * rotation,
            displacement_matrix,
        })
    }
}
