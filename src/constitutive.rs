//! Design-variable dependent material response evaluated at element quadrature points.
//!
//! A [`ConstitutiveModel`] may be shared by many elements through an `Arc`. Every evaluation is
//! scoped by the global index of the calling element and evaluated at a parametric point `pt`
//! with physical location `x`.
//!
//! The `add_*_dv_sens` methods accumulate `scale * d(quantity)/dx` into a buffer indexed by global
//! design-variable index. They are the analytic derivatives of the corresponding `eval_*` methods.
use crate::Real;
use eyre::eyre;
use nalgebra::{DMatrix, Point3};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};

pub mod beam;
pub mod plane_stress;

pub use beam::IsoRectangleBeamConstitutive;
pub use plane_stress::PlaneStressConstitutive;

/// Isotropic material properties.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialProperties<T> {
    pub density: T,
    pub young: T,
    pub poisson: T,
    pub yield_stress: T,
    pub specific_heat: T,
}

impl<T: Real> Default for MaterialProperties<T> {
    /// Properties of a generic aluminium alloy in SI units.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn default() -> Self {
        Self {
            density: 2700.0,
            young: 70e9,
            poisson: 0.3,
            yield_stress: 270e6,
            specific_heat: 921.0,
        }
    }
}

impl<T: Real> MaterialProperties<T> {
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    pub fn shear_modulus(&self) -> T {
        0.5 * self.young / (1.0 + self.poisson)
    }
}

/// A scalar model parameter that is optionally exposed as a design variable.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DesignVariable<T> {
    pub value: T,
    /// Global design-variable index. `None` keeps the value fixed.
    pub num: Option<usize>,
    pub lower: T,
    pub upper: T,
}

impl<T: Real> DesignVariable<T> {
    pub fn new(value: T, num: usize, lower: T, upper: T) -> Self {
        Self {
            value,
            num: Some(num),
            lower,
            upper,
        }
    }

    /// A parameter that is not a design variable.
    pub fn fixed(value: T) -> Self {
        Self {
            value,
            num: None,
            lower: value,
            upper: value,
        }
    }

    /// Adds `sens` to `dfdx` at the index of this variable, if any.
    pub(crate) fn accumulate(&self, dfdx: &mut [T], sens: T) {
        if let Some(num) = self.num {
            dfdx[num] += sens;
        }
    }
}

pub(crate) fn design_var_nums<T: Real>(vars: &[DesignVariable<T>]) -> Vec<usize> {
    vars.iter().filter_map(|var| var.num).collect()
}

pub(crate) fn set_design_vars<T: Real>(vars: &mut [DesignVariable<T>], values: &[T]) {
    for var in vars {
        if let Some(value) = var.num.and_then(|num| values.get(num)) {
            var.value = *value;
        }
    }
}

pub(crate) fn get_design_vars<T: Real>(vars: &[DesignVariable<T>], values: &mut [T]) {
    for var in vars {
        if let Some(value) = var.num.and_then(|num| values.get_mut(num)) {
            *value = var.value;
        }
    }
}

pub(crate) fn get_design_var_range<T: Real>(vars: &[DesignVariable<T>], lower: &mut [T], upper: &mut [T]) {
    for var in vars {
        if let Some(num) = var.num {
            lower[num] = var.lower;
            upper[num] = var.upper;
        }
    }
}

pub(crate) fn check_positive<T: Real>(name: &str, value: T) -> eyre::Result<()> {
    if value > T::zero() {
        Ok(())
    } else {
        Err(eyre!("non-positive {} {:?}", name, value))
    }
}

/// Discrete Kreisselmeier-Steinhauser aggregate of `values` and the weights `d(ks)/d(value_i)`.
pub(crate) fn ks_aggregate<T: Real>(values: &[T], ks_weight: T) -> (T, Vec<T>) {
    let max = values
        .iter()
        .copied()
        .reduce(|a, b| a.max(b))
        .unwrap_or_else(T::zero);
    let exponentials: Vec<T> = values
        .iter()
        .map(|&value| (ks_weight * (value - max)).exp())
        .collect();
    let sum: T = exponentials.iter().copied().fold(T::zero(), |a, b| a + b);
    let ks = max + sum.ln() / ks_weight;
    let weights = exponentials.into_iter().map(|e| e / sum).collect();
    (ks, weights)
}

/// Per-element material and design response.
pub trait ConstitutiveModel<T: Real>: Send + Sync {
    fn object_name(&self) -> &'static str;

    /// Number of entries of strain and stress vectors.
    fn num_stresses(&self) -> usize;

    fn num_mass_moments(&self) -> usize;

    fn eval_density(&self, elem_index: usize, pt: &[T], x: &Point3<T>) -> eyre::Result<T>;

    fn add_density_dv_sens(
        &self,
        elem_index: usize,
        scale: T,
        pt: &[T],
        x: &Point3<T>,
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    fn eval_specific_heat(&self, elem_index: usize, pt: &[T], x: &Point3<T>) -> eyre::Result<T>;

    fn eval_mass_moments(&self, elem_index: usize, pt: &[T], x: &Point3<T>, moments: &mut [T]) -> eyre::Result<()>;

    /// Accumulates `sum_k scale[k] * d(moment_k)/dx`.
    fn add_mass_moments_dv_sens(
        &self,
        elem_index: usize,
        pt: &[T],
        x: &Point3<T>,
        scale: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    fn eval_stress(&self, elem_index: usize, pt: &[T], x: &Point3<T>, strain: &[T], stress: &mut [T])
        -> eyre::Result<()>;

    /// Accumulates `scale * psi · d(stress(strain))/dx`.
    fn add_stress_dv_sens(
        &self,
        elem_index: usize,
        scale: T,
        pt: &[T],
        x: &Point3<T>,
        strain: &[T],
        psi: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    /// Evaluates the Jacobian of the stress with respect to the strain.
    fn eval_tangent_stiffness(&self, elem_index: usize, pt: &[T], x: &Point3<T>, c: &mut DMatrix<T>)
        -> eyre::Result<()>;

    fn eval_failure(&self, elem_index: usize, pt: &[T], x: &Point3<T>, strain: &[T]) -> eyre::Result<T>;

    /// Evaluates the failure index and writes its gradient with respect to the strain to `sens`.
    fn eval_failure_strain_sens(
        &self,
        elem_index: usize,
        pt: &[T],
        x: &Point3<T>,
        strain: &[T],
        sens: &mut [T],
    ) -> eyre::Result<T>;

    fn add_failure_dv_sens(
        &self,
        elem_index: usize,
        scale: T,
        pt: &[T],
        x: &Point3<T>,
        strain: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()>;

    /// Global indices of the design variables used by the given element.
    fn design_var_nums(&self, elem_index: usize) -> Vec<usize>;

    /// Selects the values of the owned design variables from `values`, which may be a superset.
    fn set_design_vars(&self, elem_index: usize, values: &[T]);

    fn get_design_vars(&self, elem_index: usize, values: &mut [T]);

    fn get_design_var_range(&self, elem_index: usize, lower: &mut [T], upper: &mut [T]);

    /// Value of a named design field for export, or `None` if the model has no such field.
    fn eval_design_field_value(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, _index: usize) -> Option<T> {
        None
    }
}
