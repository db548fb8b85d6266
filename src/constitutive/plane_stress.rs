use crate::constitutive::{
    check_positive, design_var_nums, get_design_var_range, get_design_vars, set_design_vars, ConstitutiveModel,
    DesignVariable, MaterialProperties,
};
use crate::Real;
use nalgebra::{DMatrix, Matrix3, Point3, Vector3};
use numeric_literals::replace_float_literals;
use parking_lot::RwLock;

/// Isotropic linear elastic plane stress with a thickness design variable.
///
/// Strains are ordered as `[eps_xx, eps_yy, gamma_xy]` with engineering shear strain. Stresses are
/// resultants per unit length, i.e. the membrane stress integrated through the thickness.
#[derive(Debug)]
pub struct PlaneStressConstitutive<T> {
    properties: MaterialProperties<T>,
    thickness: RwLock<DesignVariable<T>>,
}

impl<T: Real> PlaneStressConstitutive<T> {
    pub fn new(properties: MaterialProperties<T>, thickness: DesignVariable<T>) -> Self {
        Self {
            properties,
            thickness: RwLock::new(thickness),
        }
    }

    pub fn properties(&self) -> &MaterialProperties<T> {
        &self.properties
    }

    fn thickness(&self) -> eyre::Result<T> {
        let t = self.thickness.read().value;
        check_positive("thickness", t)?;
        Ok(t)
    }

    /// Elasticity matrix of the material, not scaled by the thickness.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn material_stiffness(&self) -> Matrix3<T> {
        let MaterialProperties { young, poisson, .. } = self.properties;
        let factor = young / (1.0 - poisson * poisson);
        Matrix3::new(
            1.0, poisson, 0.0,
            poisson, 1.0, 0.0,
            0.0, 0.0, 0.5 * (1.0 - poisson),
        ) * factor
    }

    fn membrane_stress(&self, strain: &[T]) -> Vector3<T> {
        assert_eq!(strain.len(), 3);
        self.material_stiffness() * Vector3::from_column_slice(strain)
    }

    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn von_mises(&self, s: &Vector3<T>) -> T {
        (s[0] * s[0] + s[1] * s[1] - s[0] * s[1] + 3.0 * s[2] * s[2]).sqrt() / self.properties.yield_stress
    }
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> ConstitutiveModel<T> for PlaneStressConstitutive<T> {
    fn object_name(&self) -> &'static str {
        "PlaneStressConstitutive"
    }

    fn num_stresses(&self) -> usize {
        3
    }

    fn num_mass_moments(&self) -> usize {
        1
    }

    fn eval_density(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>) -> eyre::Result<T> {
        Ok(self.properties.density * self.thickness()?)
    }

    fn add_density_dv_sens(
        &self,
        _elem_index: usize,
        scale: T,
        _pt: &[T],
        _x: &Point3<T>,
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        self.thickness.read().accumulate(dfdx, scale * self.properties.density);
        Ok(())
    }

    fn eval_specific_heat(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>) -> eyre::Result<T> {
        Ok(self.properties.specific_heat)
    }

    fn eval_mass_moments(&self, elem_index: usize, pt: &[T], x: &Point3<T>, moments: &mut [T]) -> eyre::Result<()> {
        assert_eq!(moments.len(), 1);
        moments[0] = self.eval_density(elem_index, pt, x)?;
        Ok(())
    }

    fn add_mass_moments_dv_sens(
        &self,
        elem_index: usize,
        pt: &[T],
        x: &Point3<T>,
        scale: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        assert_eq!(scale.len(), 1);
        self.add_density_dv_sens(elem_index, scale[0], pt, x, dfdx)
    }

    fn eval_stress(
        &self,
        _elem_index: usize,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        stress: &mut [T],
    ) -> eyre::Result<()> {
        let t = self.thickness()?;
        let s = self.membrane_stress(strain) * t;
        stress.copy_from_slice(s.as_slice());
        Ok(())
    }

    fn add_stress_dv_sens(
        &self,
        _elem_index: usize,
        scale: T,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        psi: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        let s = self.membrane_stress(strain);
        let product = Vector3::from_column_slice(psi).dot(&s);
        self.thickness.read().accumulate(dfdx, scale * product);
        Ok(())
    }

    fn eval_tangent_stiffness(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, c: &mut DMatrix<T>) -> eyre::Result<()> {
        let t = self.thickness()?;
        let stiffness = self.material_stiffness() * t;
        *c = DMatrix::from_column_slice(3, 3, stiffness.as_slice());
        Ok(())
    }

    fn eval_failure(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, strain: &[T]) -> eyre::Result<T> {
        Ok(self.von_mises(&self.membrane_stress(strain)))
    }

    fn eval_failure_strain_sens(
        &self,
        _elem_index: usize,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        sens: &mut [T],
    ) -> eyre::Result<T> {
        assert_eq!(sens.len(), 3);
        let s = self.membrane_stress(strain);
        let vm = self.von_mises(&s);
        if vm == 0.0 {
            sens.fill(0.0);
            return Ok(vm);
        }
        let ys2 = self.properties.yield_stress * self.properties.yield_stress;
        let d_stress = Vector3::new(
            (2.0 * s[0] - s[1]) / (2.0 * vm * ys2),
            (2.0 * s[1] - s[0]) / (2.0 * vm * ys2),
            3.0 * s[2] / (vm * ys2),
        );
        let d_strain = self.material_stiffness().transpose() * d_stress;
        sens.copy_from_slice(d_strain.as_slice());
        Ok(vm)
    }

    fn add_failure_dv_sens(
        &self,
        _elem_index: usize,
        _scale: T,
        _pt: &[T],
        _x: &Point3<T>,
        _strain: &[T],
        _dfdx: &mut [T],
    ) -> eyre::Result<()> {
        // The membrane stress does not depend on the thickness
        Ok(())
    }

    fn design_var_nums(&self, _elem_index: usize) -> Vec<usize> {
        design_var_nums(&[*self.thickness.read()])
    }

    fn set_design_vars(&self, _elem_index: usize, values: &[T]) {
        set_design_vars(std::slice::from_mut(&mut *self.thickness.write()), values);
    }

    fn get_design_vars(&self, _elem_index: usize, values: &mut [T]) {
        get_design_vars(&[*self.thickness.read()], values);
    }

    fn get_design_var_range(&self, _elem_index: usize, lower: &mut [T], upper: &mut [T]) {
        get_design_var_range(&[*self.thickness.read()], lower, upper);
    }

    fn eval_design_field_value(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, index: usize) -> Option<T> {
        (index == 0).then(|| self.thickness.read().value)
    }
}
