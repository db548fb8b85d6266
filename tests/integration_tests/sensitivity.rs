use super::meshes::{BeamChain, DenseLuSolver};
use fenris_design::comm::{run_workers, Communicator};
use fenris_design::error::AssemblyError;
use fenris_design::functions::{Compliance, Function, KsFailure, StructuralMass};
use fenris_design::problem::{StaticProblem, StaticProblemOptions};
use fenris_design::sensitivity::{directional_derivative, total_derivative};
use fenris_design::solver::SolveStatus;
use fenris_design_calculus::{approximate_directional_derivative_fd, convergence_rates, relative_error};
use nalgebra::DVector;
use std::collections::BTreeMap;

const FUNCTIONS: [&str; 3] = ["compliance", "ks_failure", "mass"];

fn chain() -> BeamChain {
    BeamChain {
        num_elements: 6,
        per_element_design_vars: true,
        ..BeamChain::default()
    }
}

fn problem(chain: &BeamChain, comm: Communicator) -> StaticProblem<f64> {
    let mut problem = StaticProblem::new("beam", chain.assembler(comm), StaticProblemOptions::default())
        .unwrap()
        .with_solver(Box::new(DenseLuSolver));
    problem.add_function("compliance", Box::new(Compliance::new()));
    problem.add_function("ks_failure", Box::new(KsFailure::<f64>::default()));
    problem.add_function("mass", Box::new(StructuralMass::new()));
    // Transverse tip load and an axial load halfway along the beam
    problem.add_load_to_nodes(&[chain.num_elements], &[0.0, -500.0, 0.0]);
    problem.add_load_to_nodes(&[chain.num_elements / 2], &[2.0e4, 0.0, 0.0]);
    problem
}

fn evaluate(problem: &mut StaticProblem<f64>, x: &[f64], function: &str) -> f64 {
    problem.set_design_vars(x).unwrap();
    problem.solve(None).unwrap();
    let mut funcs = BTreeMap::new();
    problem.eval_functions(&mut funcs, Some(&[function][..])).unwrap();
    funcs[&format!("beam_{}", function)]
}

fn gradients(problem: &mut StaticProblem<f64>, x: &[f64]) -> BTreeMap<String, Vec<f64>> {
    problem.set_design_vars(x).unwrap();
    problem.solve(None).unwrap();
    let mut funcs_sens = BTreeMap::new();
    problem.eval_functions_sens(&mut funcs_sens, None).unwrap();
    funcs_sens
}

/// A fixed direction that perturbs every design variable relative to its magnitude.
fn direction(x: &[f64]) -> Vec<f64> {
    x.iter()
        .enumerate()
        .map(|(i, x_i)| x_i * (0.5 + 0.3 * (1.3 * i as f64).sin()))
        .collect()
}

#[test]
fn adjoint_gradients_match_finite_differences() {
    let chain = chain();
    for num_workers in [1, 2] {
        let results = run_workers(num_workers, |comm| {
            let mut problem = problem(&chain, comm);
            let x0 = chain.design_vars();
            let p = direction(&x0);
            let funcs_sens = gradients(&mut problem, &x0);

            let x0 = DVector::from_vec(x0);
            let p_vec = DVector::from_column_slice(&p);
            FUNCTIONS
                .iter()
                .map(|&function| {
                    let gradient = &funcs_sens[&format!("beam_{}", function)];
                    let analytic = directional_derivative(gradient, &p);
                    let fd = approximate_directional_derivative_fd(
                        |x: &DVector<f64>| evaluate(&mut problem, x.as_slice(), function),
                        &x0,
                        &p_vec,
                        1e-5,
                    );
                    (function, analytic, fd)
                })
                .collect::<Vec<_>>()
        });

        for (function, analytic, fd) in results.into_iter().flatten() {
            let error = relative_error(analytic, fd, 1e-12);
            assert!(
                error < 1e-4,
                "{} with {} workers: adjoint {} vs finite difference {}",
                function,
                num_workers,
                analytic,
                fd
            );
        }
    }
}

#[test]
fn gradients_are_independent_of_the_number_of_workers() {
    let chain = chain();
    let x0 = chain.design_vars();
    let serial = run_workers(1, |comm| gradients(&mut problem(&chain, comm), &x0))
        .pop()
        .unwrap();
    for parallel in run_workers(3, |comm| gradients(&mut problem(&chain, comm), &x0)) {
        assert_eq!(parallel.keys().collect::<Vec<_>>(), serial.keys().collect::<Vec<_>>());
        for (key, expected) in &serial {
            let scale = expected.iter().fold(0.0f64, |max, g| max.max(g.abs()));
            for (a, b) in parallel[key].iter().zip(expected) {
                assert!((a - b).abs() <= 1e-9 * scale, "{}: {} vs {}", key, a, b);
            }
        }
    }
}

#[test]
fn compliance_adjoint_is_twice_the_displacement() {
    let chain = chain();
    let results = run_workers(2, |comm| {
        let mut problem = problem(&chain, comm);
        let x0 = chain.design_vars();
        let expected = gradients(&mut problem, &x0)["beam_compliance"].clone();

        let assembler = problem.assembler();
        let mut dfdu = assembler.create_vec().unwrap();
        Compliance::new().add_sv_sens(assembler, &mut dfdu).unwrap();
        let mut partial = vec![0.0; x0.len()];
        Compliance::new().add_dv_sens(assembler, &mut partial).unwrap();

        let mut psi = assembler.create_vec().unwrap();
        problem.solve_adjoint(&dfdu, &mut psi).unwrap();
        let u = problem.get_variables().gather_global();
        let psi_global = psi.gather_global();

        let mut adjoint_product = vec![0.0; x0.len()];
        problem
            .assembler()
            .add_adjoint_res_product(1.0, &psi, &mut adjoint_product)
            .unwrap();
        (u, psi_global, total_derivative(&partial, &adjoint_product), expected)
    });

    for (u, psi, total, expected) in results {
        let two_u = &u * 2.0;
        assert!((psi - &two_u).amax() <= 1e-8 * two_u.amax());
        for (a, b) in total.iter().zip(&expected) {
            assert!(relative_error(*a, *b, 1e-12) < 1e-12);
        }
    }
}

#[test]
fn finite_differences_of_adjoint_gradients_converge_with_second_order() {
    let chain = chain();
    let steps = [1e-2, 5e-3, 2.5e-3, 1.25e-3];
    let results = run_workers(2, |comm| {
        let mut problem = problem(&chain, comm);
        let x0 = chain.design_vars();
        let p = direction(&x0);
        let funcs_sens = gradients(&mut problem, &x0);

        let x0 = DVector::from_vec(x0);
        let p_vec = DVector::from_column_slice(&p);
        ["compliance", "ks_failure"]
            .iter()
            .map(|&function| {
                let analytic = directional_derivative(&funcs_sens[&format!("beam_{}", function)], &p);
                let errors: Vec<(f64, f64)> = steps
                    .iter()
                    .map(|&h| {
                        let fd = approximate_directional_derivative_fd(
                            |x: &DVector<f64>| evaluate(&mut problem, x.as_slice(), function),
                            &x0,
                            &p_vec,
                            h,
                        );
                        (h, (fd - analytic).abs())
                    })
                    .collect();
                (function, errors)
            })
            .collect::<Vec<_>>()
    });

    for (function, errors) in results.into_iter().flatten() {
        for rate in convergence_rates(&errors) {
            assert!(
                (rate - 2.0).abs() < 0.25,
                "{}: observed rate {} from errors {:?}",
                function,
                rate,
                errors
            );
        }
    }
}

#[test]
fn unconverged_adjoint_solve_is_an_error() {
    let chain = chain();
    let options = StaticProblemOptions {
        max_iterations: 1,
        ..StaticProblemOptions::default()
    };
    let results = run_workers(2, |comm| {
        let mut problem = StaticProblem::new("beam", chain.assembler(comm), options.clone()).unwrap();
        problem.add_function("compliance", Box::new(Compliance::new()));
        problem.add_load_to_nodes(&[chain.num_elements], &[0.0, -500.0, 0.0]);
        let outcome = problem.solve(None).unwrap();

        let mut funcs_sens = BTreeMap::new();
        let result = problem.eval_functions_sens(&mut funcs_sens, None);
        (outcome.status, result, funcs_sens.is_empty())
    });

    for (solve_status, result, no_gradients) in results {
        assert_eq!(solve_status, SolveStatus::Stalled);
        match result {
            Err(AssemblyError::AdjointSolve {
                function,
                status,
                iterations,
            }) => {
                assert_eq!(function, "compliance");
                assert_eq!(status, SolveStatus::Stalled);
                assert_eq!(iterations, 1);
            }
            other => panic!("Expected adjoint solve failure, got {:?}", other),
        }
        assert!(no_gradients);
    }
}
