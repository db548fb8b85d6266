//! Linear static analysis with functional evaluation and adjoint sensitivities.
use crate::assembly::{Assembler, ElementDomain};
use crate::error::AssemblyError;
use crate::functions::Function;
use crate::matrix::DistMatrix;
use crate::reorder::Ordering;
use crate::solver::{ConjugateGradient, LinearSolver, Preconditioner, PreconditionerKind, SolveOutcome};
use crate::vector::DistVector;
use crate::Real;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Options of a [`StaticProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticProblemOptions {
    /// Absolute residual tolerance of the linear solver.
    pub l2_convergence: f64,
    /// Residual tolerance of the linear solver relative to the norm of the right-hand side.
    pub l2_convergence_rel: f64,
    /// Residual norm above which the linear solve is considered diverged.
    pub res_norm_ub: f64,
    pub max_iterations: usize,
    /// Ordering of the owned nodes, applied by [`StaticProblemOptions::configure`].
    pub ordering: Ordering,
    pub preconditioner: PreconditionerKind,
    /// Logs a breakdown of solve and sensitivity timings.
    pub print_timing: bool,
}

impl Default for StaticProblemOptions {
    fn default() -> Self {
        Self {
            l2_convergence: 1e-12,
            l2_convergence_rel: 1e-12,
            res_norm_ub: 1e20,
            max_iterations: 1000,
            ordering: Ordering::default(),
            preconditioner: PreconditionerKind::default(),
            print_timing: false,
        }
    }
}

impl StaticProblemOptions {
    /// Applies the structural options to an assembler that is not yet initialized.
    pub fn configure<T: Real>(&self, assembler: &mut Assembler<T>) -> Result<(), AssemblyError> {
        assembler.set_ordering(self.ordering)
    }

    fn linear_solver<T: Real>(&self) -> ConjugateGradient<T> {
        let convert = |value: f64| T::from_f64(value).expect("tolerance must fit in T");
        ConjugateGradient::new()
            .with_atol(convert(self.l2_convergence))
            .with_rtol(convert(self.l2_convergence_rel))
            .with_max_iter(self.max_iterations)
            .with_divergence_bound(convert(self.res_norm_ub))
    }
}

/// A linear static load case on a ready [`Assembler`].
///
/// The problem holds its own design variables, loads and state, and pushes them to the assembler
/// before every evaluation. All operations are collective.
pub struct StaticProblem<T: Real> {
    name: String,
    options: StaticProblemOptions,
    assembler: Assembler<T>,
    functions: BTreeMap<String, Box<dyn Function<T>>>,
    x: Vec<T>,
    u: DistVector<T>,
    forces: DistVector<T>,
    res: DistVector<T>,
    rhs: DistVector<T>,
    update: DistVector<T>,
    matrix: DistMatrix<T>,
    preconditioner: Box<dyn Preconditioner<T>>,
    solver: Box<dyn LinearSolver<T>>,
    factor_on_next: bool,
    final_norm: Option<T>,
}

impl<T: Real> std::fmt::Debug for StaticProblem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProblem")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: Real> StaticProblem<T> {
    /// Creates a load case. The assembler must have its nodes set. Collective.
    pub fn new(
        name: impl Into<String>,
        assembler: Assembler<T>,
        options: StaticProblemOptions,
    ) -> Result<Self, AssemblyError> {
        let x = assembler.get_design_vars()?;
        let mut u = assembler.create_vec()?;
        assembler.set_bc_values(&mut u)?;
        let forces = assembler.create_vec()?;
        let matrix = assembler.create_mat()?;
        let preconditioner = options.preconditioner.build::<T>();
        let solver: Box<dyn LinearSolver<T>> = Box::new(options.linear_solver::<T>());
        Ok(Self {
            name: name.into(),
            res: forces.clone(),
            rhs: forces.clone(),
            update: forces.clone(),
            options,
            assembler,
            functions: BTreeMap::new(),
            x,
            u,
            forces,
            matrix,
            preconditioner,
            solver,
            factor_on_next: true,
            final_norm: None,
        })
    }

    /// Replaces the linear solver configured from the options.
    pub fn with_solver(self, solver: Box<dyn LinearSolver<T>>) -> Self {
        Self { solver, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StaticProblemOptions {
        &self.options
    }

    pub fn assembler(&self) -> &Assembler<T> {
        &self.assembler
    }

    /// Returns the assembler, discarding the load case.
    pub fn into_assembler(self) -> Assembler<T> {
        self.assembler
    }

    /// Residual norm after the most recent solve.
    pub fn final_norm(&self) -> Option<T> {
        self.final_norm
    }

    /// The stiffness matrix of the most recent solve.
    pub fn matrix(&self) -> &DistMatrix<T> {
        &self.matrix
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: Box<dyn Function<T>>) {
        self.functions.insert(name.into(), function);
    }

    /// Adds a function that is evaluated only over the elements of the given components.
    pub fn add_function_to_components(
        &mut self,
        name: impl Into<String>,
        mut function: Box<dyn Function<T>>,
        components: &[usize],
    ) {
        function.set_domain(ElementDomain::components(components.iter().copied()));
        self.add_function(name, function);
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn set_design_vars(&mut self, x: &[T]) -> Result<(), AssemblyError> {
        let required = self.assembler.num_design_vars()?;
        if x.len() < required {
            return Err(AssemblyError::DesignVarIndexMismatch {
                required,
                provided: x.len(),
            });
        }
        self.x = x[..required].to_vec();
        self.factor_on_next = true;
        Ok(())
    }

    pub fn get_design_vars(&self) -> &[T] {
        &self.x
    }

    /// Sets new node locations on the assembler. Collective.
    pub fn set_nodes(&mut self, xpts: &DistVector<T>) -> Result<(), AssemblyError> {
        self.assembler.set_nodes(xpts)?;
        self.factor_on_next = true;
        Ok(())
    }

    /// Adds point loads to nodes given by global id.
    ///
    /// `loads` holds either one load vector of `vars_per_node` entries applied to every node, or one
    /// load vector per node. Nodes owned by other workers are skipped, so every worker may pass the
    /// same global list.
    pub fn add_load_to_nodes(&mut self, node_ids: &[usize], loads: &[T]) {
        let vpn = self.assembler.vars_per_node();
        let uniform = loads.len() == vpn;
        assert!(
            uniform || loads.len() == vpn * node_ids.len(),
            "Expected {} or {} load entries, got {}",
            vpn,
            vpn * node_ids.len(),
            loads.len()
        );
        for (i, &node) in node_ids.iter().enumerate() {
            let load = if uniform { loads } else { &loads[i * vpn..(i + 1) * vpn] };
            self.forces.add_node_values(node, load);
        }
    }

    /// Adds the load vector `load` of `vars_per_node` entries to every node of the elements in the
    /// given components. Collective.
    ///
    /// Each node receives the load once, even if it is shared by several elements or workers. With
    /// `average` set, `load` is the total load, split evenly among the nodes.
    pub fn add_load_to_components(&mut self, components: &[usize], load: &[T], average: bool) -> Result<(), AssemblyError> {
        let vpn = self.assembler.vars_per_node();
        assert_eq!(load.len(), vpn, "Expected {} load entries, got {}", vpn, load.len());
        let domain = ElementDomain::components(components.iter().copied());
        let node_ids = self.assembler.domain_node_ids(&domain)?;
        if node_ids.is_empty() {
            return Ok(());
        }
        let load: Vec<T> = if average {
            let count = T::from_usize(node_ids.len()).expect("node count must fit in T");
            load.iter().map(|&l| l / count).collect()
        } else {
            load.to_vec()
        };
        self.add_load_to_nodes(&node_ids, &load);
        Ok(())
    }

    /// The applied loads.
    pub fn forces(&self) -> &DistVector<T> {
        &self.forces
    }

    fn update_assembler_vars(&mut self) -> Result<(), AssemblyError> {
        self.assembler.set_design_vars(&self.x)?;
        self.assembler.set_variables(&self.u, None, None)?;
        self.assembler.zero_dot_variables()?;
        self.assembler.zero_ddot_variables()
    }

    fn initialize_solve(&mut self) -> Result<(), AssemblyError> {
        if self.factor_on_next {
            self.assembler
                .assemble_jacobian(T::one(), T::zero(), T::zero(), Some(&mut self.res), &mut self.matrix)?;
            self.preconditioner.factor(&self.matrix);
            self.factor_on_next = false;
        }
        Ok(())
    }

    /// Computes `res = R(u) - F - fext` with constrained entries of the loads removed.
    fn compute_residual(&mut self, fext: Option<&DistVector<T>>) -> Result<(), AssemblyError> {
        self.assembler.assemble_residual(&mut self.res)?;
        self.rhs.copy_from(&self.forces);
        if let Some(fext) = fext {
            self.rhs.axpy(T::one(), fext);
        }
        self.assembler.apply_bcs(&mut self.rhs)?;
        self.res.axpy(-T::one(), &self.rhs);
        Ok(())
    }

    /// Solves the load case with the current loads and optional external loads `fext`.
    pub fn solve(&mut self, fext: Option<&DistVector<T>>) -> Result<SolveOutcome<T>, AssemblyError> {
        let start = Instant::now();
        self.update_assembler_vars()?;
        self.initialize_solve()?;
        let init_time = start.elapsed();

        self.compute_residual(fext)?;
        let start_norm = self.res.norm();

        self.update.zero();
        let outcome = self
            .solver
            .solve(&self.matrix, &*self.preconditioner, &self.res, &mut self.update);
        self.update.scale(-T::one());
        let solve_time = start.elapsed();

        self.u.axpy(T::one(), &self.update);
        self.assembler.set_variables(&self.u, None, None)?;

        self.compute_residual(fext)?;
        let final_norm = self.res.norm();
        self.final_norm = Some(final_norm);

        if self.assembler.comm().is_root() {
            info!(
                "{}: solve {} in {} iterations, residual norm {:?} -> {:?}",
                self.name, outcome.status, outcome.iterations, start_norm, final_norm
            );
            if self.options.print_timing {
                info!(
                    "{}: setup {:.3} s, linear solve {:.3} s, total {:.3} s",
                    self.name,
                    init_time.as_secs_f64(),
                    (solve_time - init_time).as_secs_f64(),
                    start.elapsed().as_secs_f64()
                );
            }
        }
        Ok(outcome)
    }

    fn selected_functions(&self, eval_funcs: Option<&[&str]>) -> Result<Vec<String>, AssemblyError> {
        match eval_funcs {
            None => Ok(self.functions.keys().cloned().collect()),
            Some(names) => {
                let mut names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
                names.sort();
                names.dedup();
                match names.iter().find(|name| !self.functions.contains_key(*name)) {
                    Some(name) => Err(AssemblyError::UnknownFunction { name: name.clone() }),
                    None => Ok(names),
                }
            }
        }
    }

    fn function_key(&self, function: &str) -> String {
        format!("{}_{}", self.name, function)
    }

    /// Evaluates functions into `funcs`, keyed by `"{problem}_{function}"`.
    ///
    /// All added functions are evaluated if `eval_funcs` is `None`.
    pub fn eval_functions(
        &mut self,
        funcs: &mut BTreeMap<String, T>,
        eval_funcs: Option<&[&str]>,
    ) -> Result<(), AssemblyError> {
        let start = Instant::now();
        let names = self.selected_functions(eval_funcs)?;
        self.update_assembler_vars()?;
        for name in names {
            let value = self.functions[&name].evaluate(&self.assembler)?;
            funcs.insert(self.function_key(&name), value);
        }
        if self.options.print_timing && self.assembler.comm().is_root() {
            info!("{}: function evaluation {:.3} s", self.name, start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Evaluates total design derivatives of functions into `funcs_sens`, keyed like
    /// [`eval_functions`](Self::eval_functions).
    ///
    /// Fails with [`AssemblyError::AdjointSolve`] if an adjoint system is not solved to the
    /// tolerances of the options. Gradients of functions evaluated before the failure are kept.
    pub fn eval_functions_sens(
        &mut self,
        funcs_sens: &mut BTreeMap<String, Vec<T>>,
        eval_funcs: Option<&[&str]>,
    ) -> Result<(), AssemblyError> {
        let start = Instant::now();
        let names = self.selected_functions(eval_funcs)?;
        self.update_assembler_vars()?;
        let num_design_vars = self.assembler.num_design_vars()?;

        for name in names {
            let mut dfdu = self.assembler.create_vec()?;
            self.functions[&name].add_sv_sens(&self.assembler, &mut dfdu)?;
            let mut psi = self.assembler.create_vec()?;
            let outcome = self.solve_adjoint(&dfdu, &mut psi)?;
            if !outcome.converged() {
                if self.assembler.comm().is_root() {
                    warn!(
                        "{}: adjoint solve of {} {} after {} iterations with residual norm {:?}",
                        self.name, name, outcome.status, outcome.iterations, outcome.residual_norm
                    );
                }
                return Err(AssemblyError::AdjointSolve {
                    function: name,
                    status: outcome.status,
                    iterations: outcome.iterations,
                });
            }

            let mut dfdx = vec![T::zero(); num_design_vars];
            self.functions[&name].add_dv_sens(&self.assembler, &mut dfdx)?;
            self.assembler.add_adjoint_res_product(-T::one(), &psi, &mut dfdx)?;
            funcs_sens.insert(self.function_key(&name), dfdx);
        }
        if self.options.print_timing && self.assembler.comm().is_root() {
            info!("{}: sensitivity evaluation {:.3} s", self.name, start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Solves `K^T phi = rhs`, using `phi` as the initial guess.
    ///
    /// Constrained entries of `rhs` are ignored.
    pub fn solve_adjoint(&mut self, rhs: &DistVector<T>, phi: &mut DistVector<T>) -> Result<SolveOutcome<T>, AssemblyError> {
        self.update_assembler_vars()?;
        self.initialize_solve()?;

        let mut adjoint_rhs = rhs.clone();
        self.assembler.apply_bcs(&mut adjoint_rhs)?;
        self.assembler.apply_bcs(phi)?;

        // The assembled operator is symmetric, so K^T phi = K phi
        self.matrix.apply(phi, &mut self.res);
        self.res.axpy(-T::one(), &adjoint_rhs);

        self.update.zero();
        let outcome = self
            .solver
            .solve(&self.matrix, &*self.preconditioner, &self.res, &mut self.update);
        phi.axpy(-T::one(), &self.update);
        Ok(outcome)
    }

    /// Adds `scale * K^T phi` to `prod`, with the constrained entries of `phi` ignored.
    ///
    /// `K` is the Jacobian at the current state and design, including its boundary conditions.
    pub fn add_transpose_jac_vec_product(
        &mut self,
        phi: &DistVector<T>,
        prod: &mut DistVector<T>,
        scale: T,
    ) -> Result<(), AssemblyError> {
        self.update_assembler_vars()?;
        self.initialize_solve()?;

        let mut phi = phi.clone();
        self.assembler.apply_bcs(&mut phi)?;
        // The assembled operator is symmetric, so K^T phi = K phi
        self.matrix.apply(&phi, &mut self.update);
        prod.axpy(scale, &self.update);
        Ok(())
    }

    /// Evaluates `R(u) - F - fext` at the current state.
    pub fn get_residual(&mut self, res: &mut DistVector<T>, fext: Option<&DistVector<T>>) -> Result<(), AssemblyError> {
        self.update_assembler_vars()?;
        self.compute_residual(fext)?;
        res.copy_from(&self.res);
        Ok(())
    }

    pub fn get_variables(&self) -> &DistVector<T> {
        &self.u
    }

    /// Sets the state. Prescribed values overwrite the constrained entries. Collective.
    pub fn set_variables(&mut self, states: &DistVector<T>) -> Result<(), AssemblyError> {
        self.u.copy_from(states);
        self.assembler.set_bc_values(&mut self.u)?;
        self.assembler.set_variables(&self.u, None, None)
    }

    /// Resets the state to zero, apart from prescribed values. Collective.
    pub fn zero_variables(&mut self) -> Result<(), AssemblyError> {
        self.res.zero();
        self.update.zero();
        self.u.zero();
        self.assembler.set_bc_values(&mut self.u)?;
        self.assembler.set_variables(&self.u, None, None)
    }
}
