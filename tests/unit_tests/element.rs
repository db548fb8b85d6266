use fenris_design::constitutive::{
    ConstitutiveModel, DesignVariable, IsoRectangleBeamConstitutive, MaterialProperties, PlaneStressConstitutive,
};
use fenris_design::element::{
    Element, ElementQuantity, ElementState, EulerBernoulliBeam2d, JacobianCoefficients, Quad4PlaneStress,
};
use fenris_design_calculus::approximate_gradient_fd;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector, DVectorView};
use std::sync::Arc;

const WIDTH: f64 = 0.02;
const THICKNESS: f64 = 0.01;

fn beam_constitutive() -> Arc<dyn ConstitutiveModel<f64>> {
    Arc::new(IsoRectangleBeamConstitutive::new(
        MaterialProperties::default(),
        DesignVariable::new(WIDTH, 0, 1e-3, 0.1),
        DesignVariable::new(THICKNESS, 1, 1e-3, 0.1),
    ))
}

fn quad_constitutive() -> Arc<dyn ConstitutiveModel<f64>> {
    Arc::new(PlaneStressConstitutive::new(
        MaterialProperties::default(),
        DesignVariable::new(0.004, 0, 1e-3, 0.1),
    ))
}

fn state<'a>(xpts: &'a [f64], vars: &'a [f64], zeros: &'a [f64]) -> ElementState<'a, f64> {
    ElementState {
        time: 0.0,
        xpts,
        vars,
        dvars: zeros,
        ddvars: zeros,
    }
}

fn jacobian(element: &dyn Element<f64>, state: &ElementState<f64>, coefficients: JacobianCoefficients<f64>) -> DMatrix<f64> {
    let n = element.num_variables();
    let mut res = vec![0.0; n];
    let mut mat = DMatrix::zeros(n, n);
    element
        .add_jacobian(0, state, &coefficients, &mut res, &mut mat)
        .unwrap();
    mat
}

fn stiffness_coefficients() -> JacobianCoefficients<f64> {
    JacobianCoefficients {
        alpha: 1.0,
        beta: 0.0,
        gamma: 0.0,
    }
}

fn mass_coefficients() -> JacobianCoefficients<f64> {
    JacobianCoefficients {
        alpha: 0.0,
        beta: 0.0,
        gamma: 1.0,
    }
}

/// A distorted quadrilateral in the xy plane.
const QUAD_XPTS: [f64; 12] = [0.0, 0.0, 0.0, 1.1, 0.1, 0.0, 1.0, 0.9, 0.0, -0.1, 1.0, 0.0];

#[test]
fn beam_stiffness_matches_euler_bernoulli_matrix() {
    let element = EulerBernoulliBeam2d::new(beam_constitutive());
    let l = 0.5;
    let xpts = [0.0, 0.0, 0.0, l, 0.0, 0.0];
    let zeros = [0.0; 6];
    let k = jacobian(&element, &state(&xpts, &zeros, &zeros), stiffness_coefficients());

    let props = MaterialProperties::<f64>::default();
    let ea = props.young * WIDTH * THICKNESS;
    let ei = props.young * WIDTH * THICKNESS.powi(3) / 12.0;
    let (a, b, c, d) = (12.0 * ei / l.powi(3), 6.0 * ei / l.powi(2), 4.0 * ei / l, 2.0 * ei / l);
    let s = ea / l;

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(6, 6, &[
         s,  0.0, 0.0, -s,  0.0, 0.0,
        0.0,  a,   b,  0.0, -a,   b,
        0.0,  b,   c,  0.0, -b,   d,
        -s,  0.0, 0.0,  s,  0.0, 0.0,
        0.0, -a,  -b,  0.0,  a,  -b,
        0.0,  b,   d,  0.0, -b,   c,
    ]);
    assert_matrix_eq!(k, expected, comp = abs, tol = 1e-8 * s);
}

#[test]
fn rotated_beam_stiffness_is_rotated_reference_stiffness() {
    let element = EulerBernoulliBeam2d::new(beam_constitutive());
    let zeros = [0.0; 6];
    let l = 0.7;
    let reference = jacobian(
        &element,
        &state(&[0.0, 0.0, 0.0, l, 0.0, 0.0], &zeros, &zeros),
        stiffness_coefficients(),
    );

    let angle: f64 = 0.6;
    let (c, s) = (angle.cos(), angle.sin());
    let xpts = [1.0, 2.0, 0.0, 1.0 + l * c, 2.0 + l * s, 0.0];
    let rotated = jacobian(&element, &state(&xpts, &zeros, &zeros), stiffness_coefficients());

    // Maps global to local element variables
    let mut rotation = DMatrix::zeros(6, 6);
    for node in 0..2 {
        let o = 3 * node;
        rotation[(o, o)] = c;
        rotation[(o, o + 1)] = s;
        rotation[(o + 1, o)] = -s;
        rotation[(o + 1, o + 1)] = c;
        rotation[(o + 2, o + 2)] = 1.0;
    }
    let expected = rotation.transpose() * reference * rotation;
    assert_matrix_eq!(rotated, expected, comp = abs, tol = 1e-8 * expected.amax());
}

#[test]
fn beam_with_zero_length_is_rejected() {
    let element = EulerBernoulliBeam2d::new(beam_constitutive());
    let xpts = [1.0, 1.0, 0.0, 1.0, 1.0, 0.0];
    let zeros = [0.0; 6];
    let mut res = [0.0; 6];
    let error = element
        .add_residual(0, &state(&xpts, &zeros, &zeros), &mut res)
        .unwrap_err();
    assert!(format!("{}", error).contains("length"));
}

#[test]
fn residual_of_linear_elements_is_jacobian_times_state() {
    let beam = EulerBernoulliBeam2d::new(beam_constitutive());
    let quad = Quad4PlaneStress::new(quad_constitutive());
    let beam_xpts = [0.0, 0.0, 0.0, 0.3, 0.4, 0.0];
    let beam_vars = [1e-3, -2e-3, 0.01, 3e-3, 1e-3, -0.02];
    let quad_vars = [1e-3, 0.0, 2e-3, -1e-3, 0.0, 1e-3, -2e-3, 5e-4];
    let cases: [(&dyn Element<f64>, &[f64], &[f64]); 2] =
        [(&beam, &beam_xpts, &beam_vars), (&quad, &QUAD_XPTS, &quad_vars)];

    for (element, xpts, vars) in cases {
        let n = element.num_variables();
        let zeros = vec![0.0; n];
        let state = state(xpts, vars, &zeros);
        let mut res = vec![0.0; n];
        element.add_residual(0, &state, &mut res).unwrap();
        let k = jacobian(element, &state, stiffness_coefficients());
        let expected = &k * DVector::from_column_slice(vars);
        assert_matrix_eq!(DVector::from_vec(res), expected, comp = abs, tol = 1e-10 * expected.amax());
        assert_matrix_eq!(k, k.transpose(), comp = abs, tol = 1e-10 * k.amax());
    }
}

#[test]
fn mass_matrices_reproduce_total_mass_for_rigid_translation() {
    let props = MaterialProperties::<f64>::default();

    let beam = EulerBernoulliBeam2d::new(beam_constitutive());
    let l = 0.8;
    let xpts = [0.0, 0.0, 0.0, 0.0, l, 0.0];
    let zeros = [0.0; 6];
    let m = jacobian(&beam, &state(&xpts, &zeros, &zeros), mass_coefficients());
    let beam_mass = props.density * WIDTH * THICKNESS * l;
    for translation in [[1.0, 0.0, 0.0, 1.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0, 1.0, 0.0]] {
        let u = DVector::from_column_slice(&translation);
        assert!((u.dot(&(&m * &u)) - beam_mass).abs() < 1e-10 * beam_mass);
    }

    let quad = Quad4PlaneStress::new(quad_constitutive());
    let zeros = [0.0; 8];
    let m = jacobian(&quad, &state(&QUAD_XPTS, &zeros, &zeros), mass_coefficients());
    // Area of the quadrilateral by the shoelace formula
    let p: Vec<(f64, f64)> = (0..4).map(|i| (QUAD_XPTS[3 * i], QUAD_XPTS[3 * i + 1])).collect();
    let area = 0.5
        * (0..4)
            .map(|i| p[i].0 * p[(i + 1) % 4].1 - p[(i + 1) % 4].0 * p[i].1)
            .sum::<f64>();
    let quad_mass = props.density * 0.004 * area;
    let u = DVector::from_column_slice(&[1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
    assert!((u.dot(&(&m * &u)) - quad_mass).abs() < 1e-10 * quad_mass);
}

#[test]
fn quad_rigid_body_motions_are_stress_free() {
    let quad = Quad4PlaneStress::new(quad_constitutive());
    let zeros = [0.0; 8];
    // Translation plus an infinitesimal rotation about the z axis
    let vars: Vec<f64> = (0..4)
        .flat_map(|i| {
            let (x, y) = (QUAD_XPTS[3 * i], QUAD_XPTS[3 * i + 1]);
            [0.1 - 0.01 * y, -0.2 + 0.01 * x]
        })
        .collect();
    let mut res = [0.0; 8];
    quad.add_residual(0, &state(&QUAD_XPTS, &vars, &zeros), &mut res)
        .unwrap();
    let k = jacobian(&quad, &state(&QUAD_XPTS, &vars, &zeros), stiffness_coefficients());
    assert!(DVector::from_column_slice(&res).amax() < 1e-10 * k.amax());
}

#[test]
fn inverted_quad_is_rejected() {
    let quad = Quad4PlaneStress::new(quad_constitutive());
    // Clockwise node order
    let xpts = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0];
    let zeros = [0.0; 8];
    let mut res = [0.0; 8];
    assert!(quad
        .add_residual(0, &state(&xpts, &zeros, &zeros), &mut res)
        .is_err());
}

#[test]
fn point_quantity_state_sensitivities_match_finite_differences() {
    let quad = Quad4PlaneStress::new(quad_constitutive());
    let vars0 = [1e-3, 2e-4, 2e-3, -1e-3, -5e-4, 1e-3, -2e-3, 5e-4];
    let zeros = [0.0; 8];

    for quantity in [ElementQuantity::StrainEnergyDensity, ElementQuantity::Failure] {
        for n in 0..quad.num_quadrature_points() {
            let mut dfdu = vec![0.0; 8];
            quad.add_point_quantity_sv_sens(0, quantity, n, &state(&QUAD_XPTS, &vars0, &zeros), 1.0, &mut dfdu)
                .unwrap();

            let mut u = DVector::from_column_slice(&vars0);
            let fd = approximate_gradient_fd(
                |u: DVectorView<f64>| {
                    let vars: Vec<f64> = u.iter().copied().collect();
                    quad.eval_point_quantity(0, quantity, n, &state(&QUAD_XPTS, &vars, &zeros))
                        .unwrap()
                        .value
                },
                &mut u,
                1e-9,
            );
            assert_matrix_eq!(DVector::from_vec(dfdu), fd, comp = abs, tol = 1e-5 * fd.amax());
        }
    }
}

#[test]
fn adjoint_residual_product_matches_finite_differences() {
    let model = beam_constitutive();
    let beam = EulerBernoulliBeam2d::new(model.clone());
    let xpts = [0.0, 0.0, 0.0, 0.3, 0.4, 0.0];
    let vars = [1e-3, -2e-3, 0.01, 3e-3, 1e-3, -0.02];
    let ddvars = [0.5, -1.0, 2.0, 0.3, 0.1, -0.4];
    let psi = [0.3, -0.2, 0.5, 1.0, 0.7, -0.1];
    let state = ElementState {
        time: 0.0,
        xpts: &xpts,
        vars: &vars,
        dvars: &[0.0; 6],
        ddvars: &ddvars,
    };

    let mut dfdx = [0.0; 2];
    beam.add_adjoint_res_product(0, &state, 1.0, &psi, &mut dfdx)
        .unwrap();

    let x0 = [WIDTH, THICKNESS];
    let mut x = DVector::from_column_slice(&x0);
    let fd = approximate_gradient_fd(
        |x: DVectorView<f64>| {
            let values: Vec<f64> = x.iter().copied().collect();
            model.set_design_vars(0, &values);
            let mut res = [0.0; 6];
            beam.add_residual(0, &state, &mut res).unwrap();
            res.iter().zip(&psi).map(|(r, p)| r * p).sum()
        },
        &mut x,
        1e-9,
    );
    model.set_design_vars(0, &x0);
    assert_matrix_eq!(DVector::from_column_slice(&dfdx), fd, comp = abs, tol = 1e-6 * fd.amax());
}

#[test]
fn point_quantity_design_sensitivities_match_finite_differences() {
    let model = beam_constitutive();
    let beam = EulerBernoulliBeam2d::new(model.clone());
    let xpts = [0.0, 0.0, 0.0, 0.5, 0.0, 0.0];
    let vars = [0.0, 0.0, 0.0, 1e-4, 2e-3, 1e-2];
    let zeros = [0.0; 6];
    let state = state(&xpts, &vars, &zeros);
    let x0 = [WIDTH, THICKNESS];

    for quantity in [
        ElementQuantity::Density,
        ElementQuantity::StrainEnergyDensity,
        ElementQuantity::Failure,
    ] {
        let mut dfdx = [0.0; 2];
        beam.add_point_quantity_dv_sens(0, quantity, 1, &state, 1.0, &mut dfdx)
            .unwrap();
        let mut x = DVector::from_column_slice(&x0);
        let fd = approximate_gradient_fd(
            |x: DVectorView<f64>| {
                let values: Vec<f64> = x.iter().copied().collect();
                model.set_design_vars(0, &values);
                beam.eval_point_quantity(0, quantity, 1, &state).unwrap().value
            },
            &mut x,
            1e-9,
        );
        model.set_design_vars(0, &x0);
        assert_matrix_eq!(DVector::from_column_slice(&dfdx), fd, comp = abs, tol = 1e-5 * fd.amax());
    }
}

#[test]
fn design_field_values_are_element_averages() {
    let quad = Quad4PlaneStress::new(quad_constitutive());
    let thickness = quad.eval_design_field_value(0, &QUAD_XPTS, 0).unwrap().unwrap();
    assert!((thickness - 0.004).abs() < 1e-15);
    assert_eq!(quad.eval_design_field_value(0, &QUAD_XPTS, 1).unwrap(), None);
}
