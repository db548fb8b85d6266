//! Element families mapping nodal state and a constitutive model to local residuals and Jacobians.
//!
//! Element variables are ordered per node, with `vars_per_node` entries for each node. Node
//! coordinates are always passed with three entries per node.
use crate::constitutive::ConstitutiveModel;
use crate::Real;
use nalgebra::{DMatrix, DVector, DVectorView, Point3};
use std::sync::Arc;

pub mod beam;
pub mod quadrilateral;

pub use beam::EulerBernoulliBeam2d;
pub use quadrilateral::Quad4PlaneStress;

/// Nodal state of one element.
#[derive(Debug, Copy, Clone)]
pub struct ElementState<'a, T> {
    pub time: T,
    /// Node coordinates, three entries per node.
    pub xpts: &'a [T],
    pub vars: &'a [T],
    pub dvars: &'a [T],
    pub ddvars: &'a [T],
}

/// Coefficients of the Jacobian `alpha * dR/du + beta * dR/du' + gamma * dR/du''`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct JacobianCoefficients<T> {
    pub alpha: T,
    pub beta: T,
    pub gamma: T,
}

/// Pointwise quantities that elements can evaluate at their quadrature points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ElementQuantity {
    /// Mass per unit length, area or volume.
    Density,
    /// The failure index of the constitutive model.
    Failure,
    /// The product `strain · stress`.
    StrainEnergyDensity,
}

/// Value of an [`ElementQuantity`] at a quadrature point together with its integration weight.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PointQuantity<T> {
    pub weight: T,
    pub value: T,
}

/// An element family.
///
/// Sensitivities of point quantities are derivatives of the value only: the integration weights
/// of the supplied element families do not depend on the state or the design variables.
pub trait Element<T: Real>: Send + Sync {
    fn object_name(&self) -> &'static str;

    fn vars_per_node(&self) -> usize;

    fn num_nodes(&self) -> usize;

    fn num_variables(&self) -> usize {
        self.vars_per_node() * self.num_nodes()
    }

    fn constitutive(&self) -> &Arc<dyn ConstitutiveModel<T>>;

    fn num_quadrature_points(&self) -> usize;

    fn add_residual(&self, elem_index: usize, state: &ElementState<T>, res: &mut [T]) -> eyre::Result<()>;

    /// Adds the residual to `res` and the Jacobian to `mat`.
    fn add_jacobian(
        &self,
        elem_index: usize,
        state: &ElementState<T>,
        coefficients: &JacobianCoefficients<T>,
        res: &mut [T],
        mat: &mut DMatrix<T>,
    ) -> eyre::Result<()>;

    /// Accumulates `scale * psi^T dR/dx` into `dfdx`, indexed by global design variable.
    fn add_adjoint_res_product(
        &self,
        elem_index: usize,
        state: &ElementState<T>,
        scale: T,
        psi: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    fn eval_point_quantity(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
    ) -> eyre::Result<PointQuantity<T>>;

    /// Accumulates `scale * d(value)/du` into the element vector `dfdu`.
    fn add_point_quantity_sv_sens(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
        scale: T,
        dfdu: &mut [T],
    ) -> eyre::Result<()>;

    /// Accumulates `scale * d(value)/dx` into `dfdx`, indexed by global design variable.
    fn add_point_quantity_dv_sens(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
        scale: T,
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    /// Element average of a design field of the constitutive model.
    fn eval_design_field_value(&self, elem_index: usize, xpts: &[T], index: usize) -> eyre::Result<Option<T>>;
}

/// Strain-displacement and displacement interpolation at a quadrature point.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicPoint<T: Real> {
    /// Parametric coordinates.
    pub pt: Vec<T>,
    /// Physical location.
    pub x: Point3<T>,
    /// Quadrature weight times the Jacobian determinant.
    pub weight: T,
    /// Maps element variables to the strain vector of the constitutive model.
    pub strain_matrix: DMatrix<T>,
    /// Maps element variables to translational displacements.
    pub displacement_matrix: DMatrix<T>,
}

/// Element families whose strains and displacements are linear in the element variables.
///
/// Every such family is an [`Element`]: the residual is `∫ B^T σ(B u) + m0 N^T N ü` and the
/// Jacobian `α ∫ B^T C B + γ ∫ m0 N^T N`, where `m0` is the first mass moment.
///
/// These families are undamped: the velocities and the coefficient `β` do not contribute. Mass
/// moments beyond `m0` are ignored, so the mass matrix carries no rotary inertia.
pub trait LinearKinematics<T: Real>: Send + Sync {
    fn object_name(&self) -> &'static str;

    fn vars_per_node(&self) -> usize;

    fn num_nodes(&self) -> usize;

    fn constitutive(&self) -> &Arc<dyn ConstitutiveModel<T>>;

    fn num_quadrature_points(&self) -> usize;

    fn eval_kinematics(&self, n: usize, xpts: &[T]) -> eyre::Result<KinematicPoint<T>>;
}

/// Per-point evaluation shared by the element kernels.
struct PointEvaluation<T: Real> {
    point: KinematicPoint<T>,
    strain: DVector<T>,
}

fn evaluate_point<T: Real, K: LinearKinematics<T> + ?Sized>(
    kinematics: &K,
    n: usize,
    state: &ElementState<T>,
) -> eyre::Result<PointEvaluation<T>> {
    let point = kinematics.eval_kinematics(n, state.xpts)?;
    let strain = &point.strain_matrix * DVectorView::from_slice(state.vars, state.vars.len());
    Ok(PointEvaluation { point, strain })
}

fn first_mass_moment<T: Real>(
    constitutive: &dyn ConstitutiveModel<T>,
    elem_index: usize,
    point: &KinematicPoint<T>,
) -> eyre::Result<T> {
    let mut moments = vec![T::zero(); constitutive.num_mass_moments()];
    constitutive.eval_mass_moments(elem_index, &point.pt, &point.x, &mut moments)?;
    Ok(moments[0])
}

fn add_to_slice<T: Real>(target: &mut [T], scale: T, values: &DVector<T>) {
    assert_eq!(target.len(), values.len());
    for (t, v) in target.iter_mut().zip(values.iter()) {
        *t += scale * *v;
    }
}

impl<T: Real, K: LinearKinematics<T>> Element<T> for K {
    fn object_name(&self) -> &'static str {
        LinearKinematics::object_name(self)
    }

    fn vars_per_node(&self) -> usize {
        LinearKinematics::vars_per_node(self)
    }

    fn num_nodes(&self) -> usize {
        LinearKinematics::num_nodes(self)
    }

    fn constitutive(&self) -> &Arc<dyn ConstitutiveModel<T>> {
        LinearKinematics::constitutive(self)
    }

    fn num_quadrature_points(&self) -> usize {
        LinearKinematics::num_quadrature_points(self)
    }

    fn add_residual(&self, elem_index: usize, state: &ElementState<T>, res: &mut [T]) -> eyre::Result<()> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let num_stresses = constitutive.num_stresses();
        let ddvars = DVectorView::from_slice(state.ddvars, state.ddvars.len());
        for n in 0..LinearKinematics::num_quadrature_points(self) {
            let PointEvaluation { point, strain } = evaluate_point(self, n, state)?;
            let mut stress = DVector::zeros(num_stresses);
            constitutive.eval_stress(elem_index, &point.pt, &point.x, strain.as_slice(), stress.as_mut_slice())?;
            add_to_slice(res, point.weight, &point.strain_matrix.tr_mul(&stress));

            let m0 = first_mass_moment(constitutive, elem_index, &point)?;
            let acceleration = &point.displacement_matrix * ddvars;
            add_to_slice(res, point.weight * m0, &point.displacement_matrix.tr_mul(&acceleration));
        }
        Ok(())
    }

    fn add_jacobian(
        &self,
        elem_index: usize,
        state: &ElementState<T>,
        coefficients: &JacobianCoefficients<T>,
        res: &mut [T],
        mat: &mut DMatrix<T>,
    ) -> eyre::Result<()> {
        let num_variables = Element::num_variables(self);
        assert_eq!(mat.shape(), (num_variables, num_variables));
        self.add_residual(elem_index, state, res)?;

        let constitutive = &**LinearKinematics::constitutive(self);
        let mut c = DMatrix::zeros(0, 0);
        for n in 0..LinearKinematics::num_quadrature_points(self) {
            let point = self.eval_kinematics(n, state.xpts)?;
            constitutive.eval_tangent_stiffness(elem_index, &point.pt, &point.x, &mut c)?;
            let b = &point.strain_matrix;
            *mat += (b.tr_mul(&(&c * b))) * (coefficients.alpha * point.weight);

            let m0 = first_mass_moment(constitutive, elem_index, &point)?;
            let nm = &point.displacement_matrix;
            *mat += nm.tr_mul(nm) * (coefficients.gamma * point.weight * m0);
        }
        Ok(())
    }

    fn add_adjoint_res_product(
        &self,
        elem_index: usize,
        state: &ElementState<T>,
        scale: T,
        psi: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let psi = DVectorView::from_slice(psi, psi.len());
        let ddvars = DVectorView::from_slice(state.ddvars, state.ddvars.len());
        let mut moment_scale = vec![T::zero(); constitutive.num_mass_moments()];
        for n in 0..LinearKinematics::num_quadrature_points(self) {
            let PointEvaluation { point, strain } = evaluate_point(self, n, state)?;
            let psi_strain = &point.strain_matrix * psi;
            constitutive.add_stress_dv_sens(
                elem_index,
                scale * point.weight,
                &point.pt,
                &point.x,
                strain.as_slice(),
                psi_strain.as_slice(),
                dfdx,
            )?;

            let acceleration = &point.displacement_matrix * ddvars;
            let psi_displacement = &point.displacement_matrix * psi;
            moment_scale[0] = scale * point.weight * psi_displacement.dot(&acceleration);
            constitutive.add_mass_moments_dv_sens(elem_index, &point.pt, &point.x, &moment_scale, dfdx)?;
        }
        Ok(())
    }

    fn eval_point_quantity(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
    ) -> eyre::Result<PointQuantity<T>> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let PointEvaluation { point, strain } = evaluate_point(self, n, state)?;
        let value = match quantity {
            ElementQuantity::Density => constitutive.eval_density(elem_index, &point.pt, &point.x)?,
            ElementQuantity::Failure => constitutive.eval_failure(elem_index, &point.pt, &point.x, strain.as_slice())?,
            ElementQuantity::StrainEnergyDensity => {
                let mut stress = DVector::zeros(constitutive.num_stresses());
                constitutive.eval_stress(elem_index, &point.pt, &point.x, strain.as_slice(), stress.as_mut_slice())?;
                strain.dot(&stress)
            }
        };
        Ok(PointQuantity {
            weight: point.weight,
            value,
        })
    }

    fn add_point_quantity_sv_sens(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
        scale: T,
        dfdu: &mut [T],
    ) -> eyre::Result<()> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let PointEvaluation { point, strain } = evaluate_point(self, n, state)?;
        let strain_sens = match quantity {
            ElementQuantity::Density => return Ok(()),
            ElementQuantity::Failure => {
                let mut sens = DVector::zeros(constitutive.num_stresses());
                constitutive.eval_failure_strain_sens(
                    elem_index,
                    &point.pt,
                    &point.x,
                    strain.as_slice(),
                    sens.as_mut_slice(),
                )?;
                sens
            }
            ElementQuantity::StrainEnergyDensity => {
                // d(e · s(e))/de = s + C^T e
                let mut stress = DVector::zeros(constitutive.num_stresses());
                constitutive.eval_stress(elem_index, &point.pt, &point.x, strain.as_slice(), stress.as_mut_slice())?;
                let mut c = DMatrix::zeros(0, 0);
                constitutive.eval_tangent_stiffness(elem_index, &point.pt, &point.x, &mut c)?;
                stress + c.tr_mul(&strain)
            }
        };
        add_to_slice(dfdu, scale, &point.strain_matrix.tr_mul(&strain_sens));
        Ok(())
    }

    fn add_point_quantity_dv_sens(
        &self,
        elem_index: usize,
        quantity: ElementQuantity,
        n: usize,
        state: &ElementState<T>,
        scale: T,
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let PointEvaluation { point, strain } = evaluate_point(self, n, state)?;
        match quantity {
            ElementQuantity::Density => constitutive.add_density_dv_sens(elem_index, scale, &point.pt, &point.x, dfdx),
            ElementQuantity::Failure => {
                constitutive.add_failure_dv_sens(elem_index, scale, &point.pt, &point.x, strain.as_slice(), dfdx)
            }
            ElementQuantity::StrainEnergyDensity => constitutive.add_stress_dv_sens(
                elem_index,
                scale,
                &point.pt,
                &point.x,
                strain.as_slice(),
                strain.as_slice(),
                dfdx,
            ),
        }
    }

    fn eval_design_field_value(&self, elem_index: usize, xpts: &[T], index: usize) -> eyre::Result<Option<T>> {
        let constitutive = &**LinearKinematics::constitutive(self);
        let mut weighted_sum = T::zero();
        let mut total_weight = T::zero();
        for n in 0..LinearKinematics::num_quadrature_points(self) {
            let point = self.eval_kinematics(n, xpts)?;
            match constitutive.eval_design_field_value(elem_index, &point.pt, &point.x, index) {
                Some(value) => {
                    weighted_sum += point.weight * value;
                    total_weight += point.weight;
                }
                None => return Ok(None),
            }
        }
        Ok((total_weight > T::zero()).then(|| weighted_sum / total_weight))
    }
}
