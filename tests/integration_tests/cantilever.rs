use super::meshes::{BeamChain, DenseLuSolver};
use fenris_design::comm::run_workers;
use fenris_design::constitutive::MaterialProperties;
use fenris_design::functions::{Compliance, StructuralMass};
use fenris_design::problem::{StaticProblem, StaticProblemOptions};
use fenris_design::reorder::Ordering;
use fenris_design_calculus::relative_error;
use std::collections::BTreeMap;

const TIP_LOAD: f64 = 100.0;

fn euler_bernoulli_tip_deflection(chain: &BeamChain) -> f64 {
    let young = MaterialProperties::<f64>::default().young;
    let second_moment = chain.width * chain.thickness.powi(3) / 12.0;
    TIP_LOAD * chain.length.powi(3) / (3.0 * young * second_moment)
}

/// Solves the tip-loaded cantilever and returns the tip displacement and the compliance.
fn solve_cantilever(chain: &BeamChain, num_workers: usize, options: StaticProblemOptions, dense: bool) -> Vec<(f64, f64)> {
    run_workers(num_workers, |comm| {
        let assembler = chain.assembler(comm);
        let mut problem = StaticProblem::new("tip", assembler, options.clone()).unwrap();
        if dense {
            problem = problem.with_solver(Box::new(DenseLuSolver));
        }
        problem.add_function("compliance", Box::new(Compliance::new()));
        let tip = chain.num_elements;
        problem.add_load_to_nodes(&[tip], &[0.0, -TIP_LOAD, 0.0]);

        let outcome = problem.solve(None).unwrap();
        assert!(outcome.converged());

        let mut funcs = BTreeMap::new();
        problem.eval_functions(&mut funcs, None).unwrap();
        let u = problem.get_variables().gather_global();
        (-u[3 * tip + 1], funcs["tip_compliance"])
    })
}

#[test]
fn tip_deflection_matches_euler_bernoulli_theory() {
    let chain = BeamChain::default();
    let expected = euler_bernoulli_tip_deflection(&chain);
    for num_workers in [1, 2] {
        for (deflection, compliance) in solve_cantilever(&chain, num_workers, StaticProblemOptions::default(), true) {
            assert!(relative_error(deflection, expected, 1e-12) < 1e-7, "{} vs {}", deflection, expected);
            // For a linear problem the compliance equals the work of the applied load
            assert!(relative_error(compliance, TIP_LOAD * expected, 1e-12) < 1e-7);
        }
    }
}

#[test]
fn preconditioned_conjugate_gradient_solves_cantilever() {
    let chain = BeamChain {
        ordering: Ordering::ReverseCuthillMcKee,
        ..BeamChain::default()
    };
    let expected = euler_bernoulli_tip_deflection(&chain);
    let options = StaticProblemOptions {
        l2_convergence: 0.0,
        l2_convergence_rel: 1e-12,
        ..StaticProblemOptions::default()
    };
    for num_workers in [1, 3] {
        for (deflection, _) in solve_cantilever(&chain, num_workers, options.clone(), false) {
            assert!(relative_error(deflection, expected, 1e-12) < 1e-6, "{} vs {}", deflection, expected);
        }
    }
}

#[test]
fn structural_mass_and_residual_after_solve() {
    let chain = BeamChain::default();
    let results = run_workers(2, |comm| {
        let assembler = chain.assembler(comm);
        let mut problem = StaticProblem::new("case", assembler, StaticProblemOptions::default())
            .unwrap()
            .with_solver(Box::new(DenseLuSolver));
        problem.add_function("mass", Box::new(StructuralMass::new()));
        problem.add_load_to_nodes(&[2, 5], &[0.0, -10.0, 0.0, 5.0, 0.0, 1.0]);
        problem.solve(None).unwrap();

        let mut res = problem.assembler().create_vec().unwrap();
        problem.get_residual(&mut res, None).unwrap();

        let mut funcs = BTreeMap::new();
        problem.eval_functions(&mut funcs, Some(&["mass"][..])).unwrap();
        let unknown = problem.eval_functions(&mut funcs, Some(&["stress"][..]));
        (res.norm(), problem.final_norm().unwrap(), funcs["case_mass"], unknown)
    });

    let density = MaterialProperties::<f64>::default().density;
    let expected_mass = density * chain.width * chain.thickness * chain.length;
    for (residual_norm, final_norm, mass, unknown) in results {
        assert!(residual_norm < 1e-8);
        assert!(final_norm < 1e-8);
        assert!(relative_error(mass, expected_mass, 1e-12) < 1e-12);
        assert!(matches!(
            unknown,
            Err(fenris_design::error::AssemblyError::UnknownFunction { name }) if name == "stress"
        ));
    }
}
