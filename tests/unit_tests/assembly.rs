use super::clamped_beam_chain;
use fenris_design::assembly::{Assembler, AssemblerState, MatrixType};
use fenris_design::comm::Communicator;
use fenris_design::connectivity::{DependentNodes, NodeRef};
use fenris_design::constitutive::{ConstitutiveModel, DesignVariable, IsoRectangleBeamConstitutive, MaterialProperties};
use fenris_design::element::{Element, ElementQuantity, ElementState, EulerBernoulliBeam2d, JacobianCoefficients};
use fenris_design::error::AssemblyError;
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use std::sync::Arc;

fn beam_element() -> Arc<dyn Element<f64>> {
    let model: Arc<dyn ConstitutiveModel<f64>> = Arc::new(IsoRectangleBeamConstitutive::new(
        MaterialProperties::default(),
        DesignVariable::new(0.02, 0, 1e-3, 0.1),
        DesignVariable::new(0.01, 1, 1e-3, 0.1),
    ));
    Arc::new(EulerBernoulliBeam2d::new(model))
}

fn assert_illegal_state<T: std::fmt::Debug>(result: Result<T, AssemblyError>, expected_state: AssemblerState) {
    match result {
        Err(AssemblyError::IllegalStateTransition { state, .. }) => assert_eq!(state, expected_state),
        other => panic!("Expected illegal state transition, got {:?}", other),
    }
}

#[test]
fn assembler_enforces_its_lifecycle() {
    let mut assembler = Assembler::<f64>::new(Communicator::serial(), 3, 2);
    assert_eq!(assembler.state(), AssemblerState::Uninitialized);
    assert_illegal_state(assembler.create_vec(), AssemblerState::Uninitialized);
    assert_illegal_state(assembler.initialize(), AssemblerState::Uninitialized);

    assembler
        .set_element_connectivity(vec![0, 2], vec![NodeRef::Global(0), NodeRef::Global(1)])
        .unwrap();
    assert_eq!(assembler.state(), AssemblerState::Uninitialized);
    assembler.set_elements(vec![beam_element()]).unwrap();
    assert_eq!(assembler.state(), AssemblerState::Configured);

    assembler.initialize().unwrap();
    assert_eq!(assembler.state(), AssemblerState::Initialized);
    assert!(matches!(
        assembler.initialize(),
        Err(AssemblyError::InvalidConnectivity { .. })
    ));
    assert_illegal_state(assembler.set_elements(vec![beam_element()]), AssemblerState::Initialized);
    assert_illegal_state(
        assembler.set_element_connectivity(vec![0], vec![]),
        AssemblerState::Initialized,
    );

    // Numerical operations need node locations
    let mut residual = assembler.create_vec().unwrap();
    assert_illegal_state(assembler.assemble_residual(&mut residual), AssemblerState::Initialized);

    let mut xpts = assembler.create_node_vec().unwrap();
    xpts.set_from_natural(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    assembler.set_nodes(&xpts).unwrap();
    assert_eq!(assembler.state(), AssemblerState::Ready);
    assembler.assemble_residual(&mut residual).unwrap();
}

#[test]
fn elements_must_match_vars_per_node() {
    let mut assembler = Assembler::<f64>::new(Communicator::serial(), 2, 2);
    assembler
        .set_element_connectivity(vec![0, 2], vec![NodeRef::Global(0), NodeRef::Global(1)])
        .unwrap();
    assembler.set_elements(vec![beam_element()]).unwrap();
    assert!(matches!(
        assembler.initialize(),
        Err(AssemblyError::InvalidConnectivity { .. })
    ));
}

#[test]
fn element_components_must_match_elements() {
    let mut assembler = Assembler::<f64>::new(Communicator::serial(), 3, 2);
    assembler
        .set_element_connectivity(vec![0, 2], vec![NodeRef::Global(0), NodeRef::Global(1)])
        .unwrap();
    assembler.set_elements(vec![beam_element()]).unwrap();
    assembler.set_element_components(vec![0, 1]).unwrap();
    match assembler.initialize() {
        Err(AssemblyError::InvalidConnectivity { message }) => assert!(message.contains("component ids")),
        other => panic!("Expected invalid connectivity, got {:?}", other),
    }
}

#[test]
fn element_failure_is_reported_with_global_element_index() {
    let mut assembler = Assembler::<f64>::new(Communicator::serial(), 3, 3);
    assembler
        .set_element_connectivity(
            vec![0, 2, 4],
            vec![NodeRef::Global(0), NodeRef::Global(1), NodeRef::Global(1), NodeRef::Global(2)],
        )
        .unwrap();
    assembler
        .set_elements(vec![beam_element(), beam_element()])
        .unwrap();
    assembler.initialize().unwrap();
    let mut xpts = assembler.create_node_vec().unwrap();
    // Nodes 1 and 2 coincide
    xpts.set_from_natural(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    assembler.set_nodes(&xpts).unwrap();

    let mut residual = assembler.create_vec().unwrap();
    match assembler.assemble_residual(&mut residual) {
        Err(AssemblyError::ElementEvaluation { rank, element, message }) => {
            assert_eq!((rank, element), (0, 1));
            assert!(message.contains("EulerBernoulliBeam2d"), "{}", message);
        }
        other => panic!("Expected element evaluation failure, got {:?}", other),
    }
}

#[test]
fn dependent_nodes_assemble_weighted_element_contributions() {
    // Element 1 starts at a dependent node between nodes 0 and 1
    let mut assembler = Assembler::<f64>::new(Communicator::serial(), 3, 3);
    assembler
        .set_element_connectivity(
            vec![0, 2, 4],
            vec![NodeRef::Global(0), NodeRef::Global(1), NodeRef::Dependent(0), NodeRef::Global(2)],
        )
        .unwrap();
    assembler
        .set_dependent_nodes(DependentNodes {
            ptr: vec![0, 2],
            conn: vec![0, 1],
            weights: vec![0.25, 0.75],
        })
        .unwrap();
    let elements = vec![beam_element(), beam_element()];
    assembler.set_elements(elements.clone()).unwrap();
    assembler.initialize().unwrap();
    let coords = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.75, 0.5, 0.0];
    let mut xpts = assembler.create_node_vec().unwrap();
    xpts.set_from_natural(&coords);
    assembler.set_nodes(&xpts).unwrap();

    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();

    let element_stiffness = |xpts: &[f64]| {
        let zeros = [0.0; 6];
        let state = ElementState {
            time: 0.0,
            xpts,
            vars: &zeros,
            dvars: &zeros,
            ddvars: &zeros,
        };
        let coefficients = JacobianCoefficients {
            alpha: 1.0,
            beta: 0.0,
            gamma: 0.0,
        };
        let mut res = [0.0; 6];
        let mut mat = DMatrix::zeros(6, 6);
        elements[0]
            .add_jacobian(0, &state, &coefficients, &mut res, &mut mat)
            .unwrap();
        mat
    };

    // Element dofs in terms of the nine global dofs
    let mut w0 = DMatrix::zeros(6, 9);
    let mut w1 = DMatrix::zeros(6, 9);
    for i in 0..3 {
        w0[(i, i)] = 1.0;
        w0[(3 + i, 3 + i)] = 1.0;
        w1[(i, i)] = 0.25;
        w1[(i, 3 + i)] = 0.75;
        w1[(3 + i, 6 + i)] = 1.0;
    }
    let k0 = element_stiffness(&coords[0..6]);
    let k1 = element_stiffness(&[0.75, 0.0, 0.0, 1.75, 0.5, 0.0]);
    let expected = w0.transpose() * k0 * &w0 + w1.transpose() * k1 * &w1;

    let dense = matrix.gather_dense();
    assert_matrix_eq!(dense, expected, comp = abs, tol = 1e-10 * expected.amax());
}

#[test]
fn constrained_rows_and_columns_have_unit_diagonal() {
    let assembler = clamped_beam_chain(3);
    let mut matrix = assembler.create_mat().unwrap();
    let mut residual = assembler.create_vec().unwrap();
    for _ in 0..2 {
        assembler
            .assemble_jacobian(1.0, 0.0, 0.0, Some(&mut residual), &mut matrix)
            .unwrap();
    }
    let dense = matrix.gather_dense();
    assert_matrix_eq!(dense, dense.transpose(), comp = abs, tol = 1e-12 * dense.amax());
    for i in 0..3 {
        for j in 0..12 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_eq!(dense[(i, j)], expected);
            assert_eq!(dense[(j, i)], expected);
        }
    }

    // Applying boundary conditions again changes nothing
    let mut twice = residual.clone();
    assembler.apply_bcs(&mut twice).unwrap();
    assert_eq!(twice.as_slice(), residual.as_slice());
}

#[test]
fn residual_is_reproducible_and_zero_at_constrained_dofs() {
    let mut assembler = clamped_beam_chain(4);
    // Nonzero values on the clamped dofs as well
    let natural: Vec<f64> = (0..15).map(|i| 1e-3 * (1.0 + 0.3 * i as f64).cos()).collect();
    let u = assembler.vec_from_natural(&natural).unwrap();
    assembler.set_variables(&u, None, Some(&u)).unwrap();

    let mut first = assembler.create_vec().unwrap();
    let mut second = assembler.create_vec().unwrap();
    second.fill(-7.0);
    assembler.assemble_residual(&mut first).unwrap();
    assembler.assemble_residual(&mut second).unwrap();

    assert_eq!(first.as_slice(), second.as_slice());
    assert_eq!(&first.as_slice()[..3], &[0.0; 3]);
    assert!(first.as_slice()[3..].iter().any(|&r| r != 0.0));
}

#[test]
fn zero_coefficients_leave_only_constrained_diagonal() {
    let assembler = clamped_beam_chain(3);
    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(0.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();
    let mut expected = DMatrix::zeros(12, 12);
    for i in 0..3 {
        expected[(i, i)] = 1.0;
    }
    assert_eq!(matrix.gather_dense(), expected);
}

#[test]
fn velocity_coefficient_does_not_contribute() {
    let mut assembler = clamped_beam_chain(3);
    let natural: Vec<f64> = (0..12).map(|i| 0.1 * i as f64).collect();
    let v = assembler.vec_from_natural(&natural).unwrap();
    let u = assembler.create_vec().unwrap();
    assembler.set_variables(&u, Some(&v), None).unwrap();

    let mut damped = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 5.0, 2.0, None, &mut damped)
        .unwrap();
    let mut undamped = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 2.0, None, &mut undamped)
        .unwrap();
    assert_eq!(damped.gather_dense(), undamped.gather_dense());

    let mut residual = assembler.create_vec().unwrap();
    assembler.assemble_residual(&mut residual).unwrap();
    assert_eq!(residual.norm(), 0.0);
}

#[test]
fn residual_of_linear_problem_is_stiffness_times_state() {
    let mut assembler = clamped_beam_chain(4);
    let natural: Vec<f64> = (0..15)
        .map(|i| if i < 3 { 0.0 } else { 1e-3 * ((i * 7 % 5) as f64 - 2.0) })
        .collect();
    let u = assembler.vec_from_natural(&natural).unwrap();
    assembler.set_variables(&u, None, None).unwrap();

    let mut matrix = assembler.create_mat().unwrap();
    let mut residual = assembler.create_vec().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, Some(&mut residual), &mut matrix)
        .unwrap();
    let mut separate = assembler.create_vec().unwrap();
    assembler.assemble_residual(&mut separate).unwrap();

    let mut ku = assembler.create_vec().unwrap();
    matrix.apply(&u, &mut ku);
    let expected = ku.gather_global();
    assert_matrix_eq!(residual.gather_global(), expected, comp = abs, tol = 1e-9 * expected.amax());
    assert_eq!(separate.as_slice(), residual.as_slice());

    let mut roundtrip = assembler.create_vec().unwrap();
    assembler.get_variables(&mut roundtrip, None, None).unwrap();
    assert_eq!(roundtrip.as_slice(), u.as_slice());
}

#[test]
fn matrix_types_match_jacobian_coefficients() {
    let assembler = clamped_beam_chain(3);
    let mut by_type = assembler.create_mat().unwrap();
    let mut by_coefficients = assembler.create_mat().unwrap();

    assembler
        .assemble_mat_type(MatrixType::Stiffness, &mut by_type)
        .unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut by_coefficients)
        .unwrap();
    assert_eq!(by_type.gather_dense(), by_coefficients.gather_dense());

    assembler
        .assemble_mat_type(MatrixType::Mass, &mut by_type)
        .unwrap();
    assembler
        .assemble_jacobian(0.0, 0.0, 1.0, None, &mut by_coefficients)
        .unwrap();
    assert_eq!(by_type.gather_dense(), by_coefficients.gather_dense());
}

#[test]
fn design_variables_round_trip_through_the_assembler() {
    let assembler = clamped_beam_chain(3);
    assert_eq!(assembler.num_design_vars().unwrap(), 2);
    let x = assembler.get_design_vars().unwrap();
    assert_eq!(x, vec![0.02, 0.01]);
    let (lower, upper) = assembler.get_design_var_range().unwrap();
    assert_eq!(lower, vec![1e-3, 1e-3]);
    assert_eq!(upper, vec![0.1, 0.1]);

    let mut before = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 1.0, None, &mut before)
        .unwrap();
    assembler.set_design_vars(&x).unwrap();
    let mut after = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 1.0, None, &mut after)
        .unwrap();
    assert_eq!(before.gather_dense(), after.gather_dense());

    assert!(matches!(
        assembler.set_design_vars(&[0.02]),
        Err(AssemblyError::DesignVarIndexMismatch { required: 2, provided: 1 })
    ));

    assembler.set_design_vars(&[0.03, 0.01]).unwrap();
    let widths = assembler.eval_design_field_values(0).unwrap();
    assert_eq!(widths.len(), 3);
    for width in widths {
        assert!((width.unwrap() - 0.03).abs() < 1e-15);
    }
    assert!(assembler
        .eval_design_field_values(7)
        .unwrap()
        .iter()
        .all(Option::is_none));
}

#[test]
fn integrated_density_is_structural_mass() {
    let assembler = clamped_beam_chain(5);
    let quantities = assembler
        .eval_point_quantities(ElementQuantity::Density)
        .unwrap();
    assert_eq!(quantities.len(), 5);
    let mass: f64 = quantities
        .iter()
        .flatten()
        .map(|q| q.weight * q.value)
        .sum();
    let expected = MaterialProperties::<f64>::default().density * 0.02 * 0.01;
    assert!((mass - expected).abs() < 1e-12 * expected);

    // The sensitivity of the mass with respect to the width is rho * t * L
    let scales: Vec<Vec<f64>> = quantities
        .iter()
        .map(|points| points.iter().map(|q| q.weight).collect())
        .collect();
    let mut dfdx = vec![0.0; 2];
    assembler
        .add_point_quantity_dv_sens(ElementQuantity::Density, &scales, &mut dfdx)
        .unwrap();
    let density = MaterialProperties::<f64>::default().density;
    assert!((dfdx[0] - density * 0.01).abs() < 1e-10 * density);
    assert!((dfdx[1] - density * 0.02).abs() < 1e-10 * density);

    let mut dfdu = assembler.create_vec().unwrap();
    assembler
        .add_point_quantity_sv_sens(ElementQuantity::Density, &scales, &mut dfdu)
        .unwrap();
    assert_eq!(dfdu.norm(), 0.0);
}
