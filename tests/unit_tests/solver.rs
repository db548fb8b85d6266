use super::clamped_beam_chain;
use fenris_design::solver::{
    ConjugateGradient, IdentityPreconditioner, LinearSolver, Preconditioner, PreconditionerKind, SolveStatus,
};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;

#[test]
fn conjugate_gradient_matches_dense_solution() {
    let assembler = clamped_beam_chain(4);
    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();

    let num_dofs = 15;
    let mut natural = vec![0.0; num_dofs];
    // Transverse tip load and a moment at the midpoint
    natural[13] = -10.0;
    natural[8] = 2.0;
    let b = assembler.vec_from_natural(&natural).unwrap();

    let expected = matrix
        .gather_dense()
        .lu()
        .solve(&DVector::from_vec(natural))
        .unwrap();

    for kind in [PreconditionerKind::Jacobi, PreconditionerKind::Identity] {
        let mut preconditioner = kind.build::<f64>();
        preconditioner.factor(&matrix);
        let mut solver = ConjugateGradient::new().with_rtol(1e-12).with_max_iter(2000);
        let mut x = assembler.create_vec().unwrap();
        let outcome = solver.solve(&matrix, &*preconditioner, &b, &mut x);

        assert_eq!(outcome.status, SolveStatus::Converged, "{:?}", kind);
        assert!(outcome.converged());
        assert!(outcome.residual_norm <= 1e-12 * b.norm());
        assert_matrix_eq!(x.gather_global(), expected, comp = abs, tol = 1e-6 * expected.amax());
    }
}

#[test]
fn conjugate_gradient_with_zero_rhs_returns_zero() {
    let assembler = clamped_beam_chain(2);
    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();
    let b = assembler.create_vec().unwrap();
    let mut x = assembler.vec_from_natural(&[1.0; 9]).unwrap();

    let outcome = ConjugateGradient::new().solve(&matrix, &IdentityPreconditioner, &b, &mut x);
    assert_eq!(outcome.status, SolveStatus::Converged);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(x.norm(), 0.0);
}

#[test]
fn conjugate_gradient_reports_stalled_iteration() {
    let assembler = clamped_beam_chain(4);
    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();
    let mut natural = vec![0.0; 15];
    natural[13] = -10.0;
    let b = assembler.vec_from_natural(&natural).unwrap();

    for max_iter in [0, 1] {
        let mut x = assembler.create_vec().unwrap();
        let outcome = ConjugateGradient::new()
            .with_max_iter(max_iter)
            .solve(&matrix, &IdentityPreconditioner, &b, &mut x);
        assert_eq!(outcome.status, SolveStatus::Stalled);
        assert!(!outcome.converged());
        assert_eq!(outcome.iterations, max_iter);
    }
}

#[test]
fn jacobi_preconditioner_scales_by_inverse_diagonal() {
    let assembler = clamped_beam_chain(2);
    let mut matrix = assembler.create_mat().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)
        .unwrap();
    let diagonal = matrix.diagonal();

    let mut preconditioner = PreconditionerKind::Jacobi.build::<f64>();
    preconditioner.factor(&matrix);
    let r = assembler.vec_from_natural(&[1.0; 9]).unwrap();
    let mut z = assembler.create_vec().unwrap();
    preconditioner.apply(&r, &mut z);

    for (z_i, d_i) in z.as_slice().iter().zip(diagonal.as_slice()) {
        assert!((z_i * d_i - 1.0).abs() < 1e-12);
    }
}
