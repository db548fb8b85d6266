use crate::constitutive::{
    check_positive, design_var_nums, get_design_var_range, get_design_vars, ks_aggregate, set_design_vars,
    ConstitutiveModel, DesignVariable, MaterialProperties,
};
use crate::Real;
use nalgebra::{DMatrix, DVector, Point3};
use numeric_literals::replace_float_literals;
use parking_lot::RwLock;

const WIDTH: usize = 0;
const THICKNESS: usize = 1;

/// Geometric properties of a solid rectangular cross-section and their derivatives.
///
/// The width extends along the local z axis and the thickness along the local y axis.
#[derive(Debug, Copy, Clone, PartialEq)]
struct RectangleSection<T> {
    width: T,
    thickness: T,
    area: T,
    /// Second moment of area about the y axis.
    iy: T,
    /// Second moment of area about the z axis.
    iz: T,
    /// Saint-Venant torsion constant.
    j: T,
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> RectangleSection<T> {
    fn new(width: T, thickness: T) -> eyre::Result<Self> {
        check_positive("width", width)?;
        check_positive("thickness", thickness)?;
        let (a, b) = Self::long_short(width, thickness);
        Ok(Self {
            width,
            thickness,
            area: width * thickness,
            iy: thickness * width.powi(3) / 12.0,
            iz: width * thickness.powi(3) / 12.0,
            j: a * b.powi(3) / 3.0 - 0.21 * b.powi(4) + 0.0175 * b.powi(8) / a.powi(4),
        })
    }

    fn long_short(width: T, thickness: T) -> (T, T) {
        if width >= thickness {
            (width, thickness)
        } else {
            (thickness, width)
        }
    }

    /// Derivatives `[d/dwidth, d/dthickness]` of the area.
    fn area_sens(&self) -> [T; 2] {
        [self.thickness, self.width]
    }

    fn iy_sens(&self) -> [T; 2] {
        [self.thickness * self.width.powi(2) / 4.0, self.width.powi(3) / 12.0]
    }

    fn iz_sens(&self) -> [T; 2] {
        [self.thickness.powi(3) / 12.0, self.width * self.thickness.powi(2) / 4.0]
    }

    fn j_sens(&self) -> [T; 2] {
        let (a, b) = Self::long_short(self.width, self.thickness);
        let dj_da = b.powi(3) / 3.0 - 0.07 * b.powi(8) / a.powi(5);
        let dj_db = a * b.powi(2) - 0.84 * b.powi(3) + 0.14 * b.powi(7) / a.powi(4);
        if self.width >= self.thickness {
            [dj_da, dj_db]
        } else {
            [dj_db, dj_da]
        }
    }
}

/// Isotropic beam with a solid rectangular cross-section whose width and thickness may be
/// design variables.
///
/// Strains and stress resultants are ordered as
/// `[axial, twist, curvature_y, curvature_z, shear_y, shear_z]`. The failure index is the
/// Kreisselmeier-Steinhauser aggregate of the von Mises index at the four corners of the section.
#[derive(Debug)]
pub struct IsoRectangleBeamConstitutive<T> {
    properties: MaterialProperties<T>,
    shear_correction: T,
    ks_weight: T,
    // [width, thickness]
    design_vars: RwLock<[DesignVariable<T>; 2]>,
}

impl<T: Real> IsoRectangleBeamConstitutive<T> {
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    pub fn new(properties: MaterialProperties<T>, width: DesignVariable<T>, thickness: DesignVariable<T>) -> Self {
        Self {
            properties,
            shear_correction: 5.0 / 6.0,
            ks_weight: 100.0,
            design_vars: RwLock::new([width, thickness]),
        }
    }

    pub fn with_ks_weight(self, ks_weight: T) -> Self {
        Self { ks_weight, ..self }
    }

    pub fn with_shear_correction(self, shear_correction: T) -> Self {
        Self {
            shear_correction,
            ..self
        }
    }

    pub fn properties(&self) -> &MaterialProperties<T> {
        &self.properties
    }

    pub fn ks_weight(&self) -> T {
        self.ks_weight
    }

    fn section(&self) -> eyre::Result<RectangleSection<T>> {
        let [width, thickness] = *self.design_vars.read();
        RectangleSection::new(width.value, thickness.value)
    }

    /// Diagonal of the section stiffness.
    fn stiffness(&self, section: &RectangleSection<T>) -> [T; 6] {
        let e = self.properties.young;
        let g = self.properties.shear_modulus();
        let kga = self.shear_correction * g * section.area;
        [
            e * section.area,
            g * section.j,
            e * section.iy,
            e * section.iz,
            kga,
            kga,
        ]
    }

    /// Derivatives of the stiffness diagonal with respect to `[width, thickness]`.
    fn stiffness_sens(&self, section: &RectangleSection<T>) -> [[T; 6]; 2] {
        let e = self.properties.young;
        let g = self.properties.shear_modulus();
        let k = self.shear_correction;
        let (da, dj, diy, diz) = (
            section.area_sens(),
            section.j_sens(),
            section.iy_sens(),
            section.iz_sens(),
        );
        let sens = |i: usize| {
            [
                e * da[i],
                g * dj[i],
                e * diy[i],
                e * diz[i],
                k * g * da[i],
                k * g * da[i],
            ]
        };
        [sens(WIDTH), sens(THICKNESS)]
    }

    /// Signed corner coordinates `(y, z)` of the section.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn corners(section: &RectangleSection<T>) -> [(T, T); 4] {
        let y = 0.5 * section.thickness;
        let z = 0.5 * section.width;
        [(-y, -z), (y, -z), (y, z), (-y, z)]
    }

    /// Axial stress, transverse shear stresses and von Mises index at a point of the section.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn point_stress(&self, strain: &[T], y: T, z: T) -> (T, T, T, T) {
        let e = self.properties.young;
        let g = self.properties.shear_modulus();
        let sigma = e * (strain[0] + z * strain[2] - y * strain[3]);
        let tau_y = g * strain[4];
        let tau_z = g * strain[5];
        let vm = (sigma * sigma + 3.0 * (tau_y * tau_y + tau_z * tau_z)).sqrt() / self.properties.yield_stress;
        (sigma, tau_y, tau_z, vm)
    }

    fn corner_failures(&self, section: &RectangleSection<T>, strain: &[T]) -> [T; 4] {
        Self::corners(section).map(|(y, z)| self.point_stress(strain, y, z).3)
    }

    /// Derivative of the von Mises index with respect to `(sigma, tau_y, tau_z)`.
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn von_mises_sens(&self, sigma: T, tau_y: T, tau_z: T, vm: T) -> (T, T, T) {
        if vm == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let ys2 = self.properties.yield_stress * self.properties.yield_stress;
        let denominator = vm * ys2;
        (sigma / denominator, 3.0 * tau_y / denominator, 3.0 * tau_z / denominator)
    }
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
impl<T: Real> ConstitutiveModel<T> for IsoRectangleBeamConstitutive<T> {
    fn object_name(&self) -> &'static str {
        "IsoRectangleBeamConstitutive"
    }

    fn num_stresses(&self) -> usize {
        6
    }

    fn num_mass_moments(&self) -> usize {
        6
    }

    fn eval_density(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>) -> eyre::Result<T> {
        Ok(self.properties.density * self.section()?.area)
    }

    fn add_density_dv_sens(
        &self,
        _elem_index: usize,
        scale: T,
        _pt: &[T],
        _x: &Point3<T>,
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        let section = self.section()?;
        let da = section.area_sens();
        let vars = self.design_vars.read();
        for (var, d) in vars.iter().zip(da) {
            var.accumulate(dfdx, scale * self.properties.density * d);
        }
        Ok(())
    }

    fn eval_specific_heat(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>) -> eyre::Result<T> {
        Ok(self.properties.specific_heat)
    }

    fn eval_mass_moments(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, moments: &mut [T]) -> eyre::Result<()> {
        assert_eq!(moments.len(), 6);
        let section = self.section()?;
        let rho = self.properties.density;
        moments.copy_from_slice(&[rho * section.area, 0.0, 0.0, rho * section.iy, rho * section.iz, 0.0]);
        Ok(())
    }

    fn add_mass_moments_dv_sens(
        &self,
        _elem_index: usize,
        _pt: &[T],
        _x: &Point3<T>,
        scale: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        assert_eq!(scale.len(), 6);
        let section = self.section()?;
        let rho = self.properties.density;
        let (da, diy, diz) = (section.area_sens(), section.iy_sens(), section.iz_sens());
        let vars = self.design_vars.read();
        for (i, var) in vars.iter().enumerate() {
            var.accumulate(dfdx, rho * (scale[0] * da[i] + scale[3] * diy[i] + scale[4] * diz[i]));
        }
        Ok(())
    }

    fn eval_stress(
        &self,
        _elem_index: usize,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        stress: &mut [T],
    ) -> eyre::Result<()> {
        assert_eq!(strain.len(), 6);
        assert_eq!(stress.len(), 6);
        let c = self.stiffness(&self.section()?);
        for i in 0..6 {
            stress[i] = c[i] * strain[i];
        }
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
        let dc = self.stiffness_sens(&self.section()?);
        let vars = self.design_vars.read();
        for (var, dc_i) in vars.iter().zip(dc) {
            let product = (0..6).fold(0.0, |sum, k| sum + psi[k] * dc_i[k] * strain[k]);
            var.accumulate(dfdx, scale * product);
        }
        Ok(())
    }

    fn eval_tangent_stiffness(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, c: &mut DMatrix<T>) -> eyre::Result<()> {
        let diagonal = self.stiffness(&self.section()?);
        *c = DMatrix::from_diagonal(&DVector::from_column_slice(&diagonal));
        Ok(())
    }

    fn eval_failure(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, strain: &[T]) -> eyre::Result<T> {
        let failures = self.corner_failures(&self.section()?, strain);
        Ok(ks_aggregate(&failures, self.ks_weight).0)
    }

    fn eval_failure_strain_sens(
        &self,
        _elem_index: usize,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        sens: &mut [T],
    ) -> eyre::Result<T> {
        assert_eq!(sens.len(), 6);
        let section = self.section()?;
        let e = self.properties.young;
        let g = self.properties.shear_modulus();
        let (ks, weights) = ks_aggregate(&self.corner_failures(&section, strain), self.ks_weight);

        sens.fill(0.0);
        for ((y, z), weight) in Self::corners(&section).into_iter().zip(weights) {
            let (sigma, tau_y, tau_z, vm) = self.point_stress(strain, y, z);
            let (d_sigma, d_tau_y, d_tau_z) = self.von_mises_sens(sigma, tau_y, tau_z, vm);
            sens[0] += weight * d_sigma * e;
            sens[2] += weight * d_sigma * e * z;
            sens[3] -= weight * d_sigma * e * y;
            sens[4] += weight * d_tau_y * g;
            sens[5] += weight * d_tau_z * g;
        }
        Ok(ks)
    }

    fn add_failure_dv_sens(
        &self,
        _elem_index: usize,
        scale: T,
        _pt: &[T],
        _x: &Point3<T>,
        strain: &[T],
        dfdx: &mut [T],
    ) -> eyre::Result<()> {
        let section = self.section()?;
        let e = self.properties.young;
        let (_, weights) = ks_aggregate(&self.corner_failures(&section, strain), self.ks_weight);

        // Stresses depend on the section only through the corner coordinates
        // y = ±thickness / 2 and z = ±width / 2
        let mut d_width = 0.0;
        let mut d_thickness = 0.0;
        for ((y, z), weight) in Self::corners(&section).into_iter().zip(weights) {
            let (sigma, tau_y, tau_z, vm) = self.point_stress(strain, y, z);
            let (d_sigma, _, _) = self.von_mises_sens(sigma, tau_y, tau_z, vm);
            let dz_dwidth = z / section.width;
            let dy_dthickness = y / section.thickness;
            d_width += weight * d_sigma * e * strain[2] * dz_dwidth;
            d_thickness -= weight * d_sigma * e * strain[3] * dy_dthickness;
        }

        let vars = self.design_vars.read();
        vars[WIDTH].accumulate(dfdx, scale * d_width);
        vars[THICKNESS].accumulate(dfdx, scale * d_thickness);
        Ok(())
    }

    fn design_var_nums(&self, _elem_index: usize) -> Vec<usize> {
        design_var_nums(&*self.design_vars.read())
    }

    fn set_design_vars(&self, _elem_index: usize, values: &[T]) {
        set_design_vars(&mut *self.design_vars.write(), values);
    }

    fn get_design_vars(&self, _elem_index: usize, values: &mut [T]) {
        get_design_vars(&*self.design_vars.read(), values);
    }

    fn get_design_var_range(&self, _elem_index: usize, lower: &mut [T], upper: &mut [T]) {
        get_design_var_range(&*self.design_vars.read(), lower, upper);
    }

    fn eval_design_field_value(&self, _elem_index: usize, _pt: &[T], _x: &Point3<T>, index: usize) -> Option<T> {
        let vars = self.design_vars.read();
        match index {
            WIDTH | THICKNESS => Some(vars[index].value),
            _ => None,
        }
    }
}
