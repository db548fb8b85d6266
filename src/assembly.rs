//! Distributed assembly of residuals, Jacobians and design-variable dependent quantities.
//!
//! An [`Assembler`] is created per worker. It collects the structural description of the part of
//! the mesh held by the worker, freezes it in [`initialize`](Assembler::initialize) and afterwards
//! assembles global vectors and matrices from element contributions. All numerical operations are
//! collective: every worker of the group must call them in the same order.
use crate::comm::Communicator;
use crate::connectivity::{BoundaryCondition, DependentNodes, DistributedConnectivity, MeshPartition, NodeRef};
use crate::element::{Element, ElementQuantity, ElementState, JacobianCoefficients, PointQuantity};
use crate::error::AssemblyError;
use crate::matrix::{DistMatrix, MatrixStructure};
use crate::reorder::Ordering;
use crate::vector::{DistVector, VectorLayout};
use crate::Real;
use itertools::Itertools;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of an [`Assembler`]. Transitions are one-directional.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssemblerState {
    /// Connectivity or elements are still missing.
    Uninitialized,
    /// Connectivity and elements are set, structural changes are still permitted.
    Configured,
    /// The numbering is frozen.
    Initialized,
    /// Node locations are set, numerical operations are permitted.
    Ready,
}

/// Matrices assembled by [`Assembler::assemble_mat_type`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MatrixType {
    Stiffness,
    Mass,
}

impl MatrixType {
    fn coefficients<T: Real>(&self) -> JacobianCoefficients<T> {
        let (alpha, gamma) = match self {
            MatrixType::Stiffness => (T::one(), T::zero()),
            MatrixType::Mass => (T::zero(), T::one()),
        };
        JacobianCoefficients {
            alpha,
            beta: T::zero(),
            gamma,
        }
    }
}

/// A selection of elements by component id.
///
/// Components group elements, typically by property region. Elements belong to component zero
/// unless [`Assembler::set_element_components`] assigns otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementDomain {
    #[default]
    All,
    Components(Vec<usize>),
}

impl ElementDomain {
    pub fn components(components: impl IntoIterator<Item = usize>) -> Self {
        let mut components: Vec<usize> = components.into_iter().collect();
        components.sort_unstable();
        components.dedup();
        Self::Components(components)
    }

    pub fn contains(&self, component: usize) -> bool {
        match self {
            Self::All => true,
            Self::Components(components) => components.binary_search(&component).is_ok(),
        }
    }
}

/// A model handle together with the element index it was queried with.
struct DesignVarOwner<T: Real> {
    model: Arc<dyn crate::constitutive::ConstitutiveModel<T>>,
    elem_index: usize,
}

/// Registry of the constitutive models holding the design variables of local elements.
///
/// Models shared by several elements are registered once per distinct design variable set.
pub(crate) struct DesignVarRegistry<T: Real> {
    owners: Vec<DesignVarOwner<T>>,
    num_design_vars: usize,
}

impl<T: Real> DesignVarRegistry<T> {
    fn new(comm: &Communicator, elements: &[Arc<dyn Element<T>>], connectivity: &DistributedConnectivity<T>) -> Self {
        let mut seen = FxHashSet::default();
        let mut owners = Vec::new();
        let mut local_count = 0;
        for (e, element) in elements.iter().enumerate() {
            let elem_index = connectivity.global_element_index(e);
            let model = element.constitutive();
            let mut nums = model.design_var_nums(elem_index);
            if let Some(max) = nums.iter().max() {
                local_count = local_count.max(max + 1);
            }
            nums.sort_unstable();
            let key = (Arc::as_ptr(model) as *const () as usize, nums);
            if seen.insert(key) {
                owners.push(DesignVarOwner {
                    model: model.clone(),
                    elem_index,
                });
            }
        }
        let num_design_vars = comm.all_reduce_max(local_count);
        Self {
            owners,
            num_design_vars,
        }
    }
}

/// Numbering, containers and state of an initialized assembler.
pub(crate) struct AssemblerData<T: Real> {
    pub(crate) connectivity: Arc<DistributedConnectivity<T>>,
    pub(crate) layout: Arc<VectorLayout>,
    pub(crate) matrix_structure: Arc<MatrixStructure>,
    pub(crate) design_vars: DesignVarRegistry<T>,
    // Local nodes, three coordinates each
    pub(crate) xpts: Vec<T>,
    // Local nodes, vars_per_node entries each
    pub(crate) vars: Vec<T>,
    pub(crate) dvars: Vec<T>,
    pub(crate) ddvars: Vec<T>,
}

/// Element-local copies of the nodal state.
pub(crate) struct ElementBuffers<T> {
    xpts: Vec<T>,
    vars: Vec<T>,
    dvars: Vec<T>,
    ddvars: Vec<T>,
}

impl<T: Real> ElementBuffers<T> {
    pub(crate) fn state(&self, time: T) -> ElementState<T> {
        ElementState {
            time,
            xpts: &self.xpts,
            vars: &self.vars,
            dvars: &self.dvars,
            ddvars: &self.ddvars,
        }
    }
}

/// Local result of an element loop: the first failing element (global index) and its message.
type LocalFailure = Option<(usize, String)>;

/// Makes every worker fail if an element failed on any worker. Collective.
pub(crate) fn agree_on_failure(comm: &Communicator, failure: LocalFailure) -> Result<(), AssemblyError> {
    let failures = comm.all_gather(failure);
    match failures
        .into_iter()
        .enumerate()
        .find_map(|(rank, failure)| failure.map(|(element, message)| (rank, element, message)))
    {
        Some((rank, element, message)) => Err(AssemblyError::ElementEvaluation { rank, element, message }),
        None => Ok(()),
    }
}

fn element_failure_message<T: Real>(element: &dyn Element<T>, report: &eyre::Report) -> String {
    format!("{}: {:#}", element.object_name(), report)
}

/// Assembles global systems from the elements of one worker.
pub struct Assembler<T: Real> {
    comm: Communicator,
    state: AssemblerState,
    partition: MeshPartition<T>,
    has_connectivity: bool,
    elements: Vec<Arc<dyn Element<T>>>,
    has_elements: bool,
    components: Option<Vec<usize>>,
    time: T,
    data: Option<AssemblerData<T>>,
}

impl<T: Real> std::fmt::Debug for Assembler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("rank", &self.comm.rank())
            .field("state", &self.state)
            .field("vars_per_node", &self.partition.vars_per_node())
            .field("num_elements", &self.elements.len())
            .finish()
    }
}

impl<T: Real> Assembler<T> {
    pub fn new(comm: Communicator, vars_per_node: usize, num_owned_nodes: usize) -> Self {
        Self {
            comm,
            state: AssemblerState::Uninitialized,
            partition: MeshPartition::new(vars_per_node, num_owned_nodes),
            has_connectivity: false,
            elements: Vec::new(),
            has_elements: false,
            components: None,
            time: T::zero(),
            data: None,
        }
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn vars_per_node(&self) -> usize {
        self.partition.vars_per_node()
    }

    /// Number of elements held by this worker.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[Arc<dyn Element<T>>] {
        &self.elements
    }

    pub fn simulation_time(&self) -> T {
        self.time
    }

    fn check_structural(&self, operation: &'static str) -> Result<(), AssemblyError> {
        match self.state {
            AssemblerState::Uninitialized | AssemblerState::Configured => Ok(()),
            state => Err(AssemblyError::IllegalStateTransition { operation, state }),
        }
    }

    fn update_configured(&mut self) {
        if self.has_connectivity && self.has_elements {
            self.state = AssemblerState::Configured;
        }
    }

    /// Sets the element connectivity in CSR form: element `e` references the nodes
    /// `conn[ptr[e] .. ptr[e + 1]]`.
    pub fn set_element_connectivity(&mut self, ptr: Vec<usize>, conn: Vec<NodeRef>) -> Result<(), AssemblyError> {
        self.check_structural("set_element_connectivity")?;
        self.partition.set_element_connectivity(ptr, conn);
        self.has_connectivity = true;
        self.update_configured();
        Ok(())
    }

    pub fn set_elements(&mut self, elements: Vec<Arc<dyn Element<T>>>) -> Result<(), AssemblyError> {
        self.check_structural("set_elements")?;
        self.elements = elements;
        self.has_elements = true;
        self.update_configured();
        Ok(())
    }

    /// Assigns a component id to every local element, in the order of [`set_elements`](Self::set_elements).
    pub fn set_element_components(&mut self, components: Vec<usize>) -> Result<(), AssemblyError> {
        self.check_structural("set_element_components")?;
        self.components = Some(components);
        Ok(())
    }

    /// Component id of a local element.
    pub fn element_component(&self, element: usize) -> usize {
        assert!(element < self.elements.len(), "Element index out of bounds");
        self.components
            .as_ref()
            .map_or(0, |components| components[element])
    }

    /// Whether each local element lies in `domain`.
    pub fn domain_mask(&self, domain: &ElementDomain) -> Vec<bool> {
        (0..self.elements.len())
            .map(|e| domain.contains(self.element_component(e)))
            .collect()
    }

    pub fn set_dependent_nodes(&mut self, dependent_nodes: DependentNodes<T>) -> Result<(), AssemblyError> {
        self.check_structural("set_dependent_nodes")?;
        self.partition.set_dependent_nodes(dependent_nodes);
        Ok(())
    }

    /// Records boundary conditions. Conditions on nodes owned by other workers are ignored.
    pub fn add_bcs(&mut self, bcs: impl IntoIterator<Item = BoundaryCondition<T>>) -> Result<(), AssemblyError> {
        self.check_structural("add_bcs")?;
        self.partition.add_bcs(bcs);
        Ok(())
    }

    pub fn set_ordering(&mut self, ordering: Ordering) -> Result<(), AssemblyError> {
        self.check_structural("set_ordering")?;
        self.partition.set_ordering(ordering);
        Ok(())
    }

    /// Freezes the numbering. Collective.
    pub fn initialize(&mut self) -> Result<(), AssemblyError> {
        match self.state {
            AssemblerState::Configured => {}
            AssemblerState::Uninitialized => {
                return Err(AssemblyError::IllegalStateTransition {
                    operation: "initialize",
                    state: self.state,
                })
            }
            AssemblerState::Initialized | AssemblerState::Ready => {
                return Err(AssemblyError::invalid_connectivity("initialize was invoked more than once"))
            }
        }

        let vpn = self.vars_per_node();
        let component_mismatch = self
            .components
            .as_ref()
            .filter(|components| components.len() != self.elements.len())
            .map(|components| {
                format!(
                    "{} component ids were given for {} elements",
                    components.len(),
                    self.elements.len()
                )
            });
        let mismatch = self
            .elements
            .iter()
            .enumerate()
            .find(|(_, element)| element.vars_per_node() != vpn)
            .map(|(e, element)| {
                format!(
                    "element {} ({}) has {} variables per node, the assembler has {}",
                    e,
                    element.object_name(),
                    element.vars_per_node(),
                    vpn
                )
            })
            .or(component_mismatch);
        if let Some((rank, message)) = self
            .comm
            .all_gather(mismatch)
            .into_iter()
            .enumerate()
            .find_map(|(rank, m)| m.map(|m| (rank, m)))
        {
            return Err(AssemblyError::invalid_connectivity(format!("worker {}: {}", rank, message)));
        }

        let element_num_nodes: Vec<usize> = self.elements.iter().map(|e| e.num_nodes()).collect();
        let connectivity = Arc::new(self.partition.initialize(&self.comm, &element_num_nodes)?);
        let layout = Arc::new(VectorLayout::new(
            self.comm.clone(),
            connectivity.ownership().clone(),
            connectivity.permutation().clone(),
        ));
        let matrix_structure = Arc::new(MatrixStructure::new(&connectivity, layout.clone()));
        let design_vars = DesignVarRegistry::new(&self.comm, &self.elements, &connectivity);

        let num_local = connectivity.num_local_nodes();
        info!(
            "Worker {}: assembler initialized with {} local dofs, {} matrix nonzeros and {} design variables",
            self.comm.rank(),
            num_local * vpn,
            matrix_structure.pattern().nnz(),
            design_vars.num_design_vars
        );

        self.data = Some(AssemblerData {
            connectivity,
            layout,
            matrix_structure,
            design_vars,
            xpts: vec![T::zero(); num_local * 3],
            vars: vec![T::zero(); num_local * vpn],
            dvars: vec![T::zero(); num_local * vpn],
            ddvars: vec![T::zero(); num_local * vpn],
        });
        self.state = AssemblerState::Initialized;
        Ok(())
    }

    /// Returns the initialized data, provided the assembler has reached `required`.
    pub(crate) fn data(&self, operation: &'static str, required: AssemblerState) -> Result<&AssemblerData<T>, AssemblyError> {
        match &self.data {
            Some(data) if self.state >= required => Ok(data),
            _ => Err(AssemblyError::IllegalStateTransition {
                operation,
                state: self.state,
            }),
        }
    }

    fn data_mut(&mut self, operation: &'static str) -> Result<&mut AssemblerData<T>, AssemblyError> {
        let state = self.state;
        self.data
            .as_mut()
            .ok_or(AssemblyError::IllegalStateTransition { operation, state })
    }

    pub fn connectivity(&self) -> Result<&Arc<DistributedConnectivity<T>>, AssemblyError> {
        Ok(&self.data("connectivity", AssemblerState::Initialized)?.connectivity)
    }

    /// Global ids of the local nodes: owned nodes in local order followed by ghost nodes.
    pub fn local_node_ids(&self) -> Result<&[usize], AssemblyError> {
        Ok(self.connectivity()?.local_to_global())
    }

    pub fn create_vec(&self) -> Result<DistVector<T>, AssemblyError> {
        let data = self.data("create_vec", AssemblerState::Initialized)?;
        Ok(DistVector::zeros(data.layout.clone(), self.vars_per_node()))
    }

    /// Creates a vector for node coordinates, with three entries per node.
    pub fn create_node_vec(&self) -> Result<DistVector<T>, AssemblyError> {
        let data = self.data("create_node_vec", AssemblerState::Initialized)?;
        Ok(DistVector::zeros(data.layout.clone(), 3))
    }

    pub fn create_mat(&self) -> Result<DistMatrix<T>, AssemblyError> {
        let data = self.data("create_mat", AssemblerState::Initialized)?;
        Ok(DistMatrix::zeros(data.matrix_structure.clone()))
    }

    /// Creates a vector from a full vector in natural global order.
    pub fn vec_from_natural(&self, natural: &[T]) -> Result<DistVector<T>, AssemblyError> {
        let mut vec = self.create_vec()?;
        vec.set_from_natural(natural);
        Ok(vec)
    }

    /// Sets the node coordinates and makes the assembler ready for numerical operations. Collective.
    pub fn set_nodes(&mut self, xpts: &DistVector<T>) -> Result<(), AssemblyError> {
        assert_eq!(xpts.block_size(), 3, "Node vectors have three entries per node");
        let comm = self.comm.clone();
        let data = self.data_mut("set_nodes")?;
        set_local_values(&comm, &data.connectivity, xpts, &mut data.xpts);
        self.state = AssemblerState::Ready;
        Ok(())
    }

    pub fn get_nodes(&self, xpts: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let data = self.data("get_nodes", AssemblerState::Ready)?;
        let n = xpts.len();
        xpts.as_mut_slice().copy_from_slice(&data.xpts[..n]);
        Ok(())
    }

    /// Sets the state variables and optionally their first and second time derivatives. Collective.
    pub fn set_variables(
        &mut self,
        vars: &DistVector<T>,
        dvars: Option<&DistVector<T>>,
        ddvars: Option<&DistVector<T>>,
    ) -> Result<(), AssemblyError> {
        let comm = self.comm.clone();
        let data = self.data_mut("set_variables")?;
        set_local_values(&comm, &data.connectivity, vars, &mut data.vars);
        if let Some(dvars) = dvars {
            set_local_values(&comm, &data.connectivity, dvars, &mut data.dvars);
        }
        if let Some(ddvars) = ddvars {
            set_local_values(&comm, &data.connectivity, ddvars, &mut data.ddvars);
        }
        Ok(())
    }

    pub fn get_variables(
        &self,
        vars: &mut DistVector<T>,
        dvars: Option<&mut DistVector<T>>,
        ddvars: Option<&mut DistVector<T>>,
    ) -> Result<(), AssemblyError> {
        let data = self.data("get_variables", AssemblerState::Initialized)?;
        let n = vars.len();
        vars.as_mut_slice().copy_from_slice(&data.vars[..n]);
        if let Some(dvars) = dvars {
            dvars.as_mut_slice().copy_from_slice(&data.dvars[..n]);
        }
        if let Some(ddvars) = ddvars {
            ddvars.as_mut_slice().copy_from_slice(&data.ddvars[..n]);
        }
        Ok(())
    }

    pub fn zero_variables(&mut self) -> Result<(), AssemblyError> {
        self.data_mut("zero_variables")?.vars.fill(T::zero());
        Ok(())
    }

    pub fn zero_dot_variables(&mut self) -> Result<(), AssemblyError> {
        self.data_mut("zero_dot_variables")?.dvars.fill(T::zero());
        Ok(())
    }

    pub fn zero_ddot_variables(&mut self) -> Result<(), AssemblyError> {
        self.data_mut("zero_ddot_variables")?.ddvars.fill(T::zero());
        Ok(())
    }

    pub fn set_simulation_time(&mut self, time: T) {
        self.time = time;
    }

    /// Zeros the entries of constrained dofs.
    pub fn apply_bcs(&self, vec: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let data = self.data("apply_bcs", AssemblerState::Initialized)?;
        assert_eq!(vec.block_size(), self.vars_per_node());
        for (v, &constrained) in vec.as_mut_slice().iter_mut().zip(data.connectivity.bc_mask()) {
            if constrained {
                *v = T::zero();
            }
        }
        Ok(())
    }

    /// Writes the prescribed values into the entries of constrained dofs.
    pub fn set_bc_values(&self, vec: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let data = self.data("set_bc_values", AssemblerState::Initialized)?;
        assert_eq!(vec.block_size(), self.vars_per_node());
        let connectivity = &data.connectivity;
        for ((v, &constrained), &value) in vec
            .as_mut_slice()
            .iter_mut()
            .zip(connectivity.bc_mask())
            .zip(connectivity.bc_values())
        {
            if constrained {
                *v = value;
            }
        }
        Ok(())
    }

    pub(crate) fn element_buffers(&self, data: &AssemblerData<T>, element: usize) -> ElementBuffers<T> {
        let connectivity = &data.connectivity;
        let num_slots = connectivity.element_slots(element).len();
        let vpn = self.vars_per_node();
        let mut buffers = ElementBuffers {
            xpts: vec![T::zero(); 3 * num_slots],
            vars: vec![T::zero(); vpn * num_slots],
            dvars: vec![T::zero(); vpn * num_slots],
            ddvars: vec![T::zero(); vpn * num_slots],
        };
        connectivity.gather_element_values(element, &data.xpts, 3, &mut buffers.xpts);
        connectivity.gather_element_values(element, &data.vars, vpn, &mut buffers.vars);
        connectivity.gather_element_values(element, &data.dvars, vpn, &mut buffers.dvars);
        connectivity.gather_element_values(element, &data.ddvars, vpn, &mut buffers.ddvars);
        buffers
    }

    /// Evaluates `kernel` for every local element in parallel and agrees on failures. Collective.
    ///
    /// The kernel receives the local element index, its global index and its state.
    pub(crate) fn evaluate_elements<R, F>(&self, data: &AssemblerData<T>, kernel: F) -> Result<Vec<R>, AssemblyError>
    where
        R: Send,
        F: Fn(usize, usize, &ElementState<T>) -> eyre::Result<R> + Sync,
    {
        let connectivity = &data.connectivity;
        let results: Vec<Result<R, String>> = (0..self.elements.len())
            .into_par_iter()
            .map(|e| {
                let buffers = self.element_buffers(data, e);
                let elem_index = connectivity.global_element_index(e);
                kernel(e, elem_index, &buffers.state(self.time))
                    .map_err(|report| element_failure_message(&*self.elements[e], &report))
            })
            .collect();

        let failure = results
            .iter()
            .enumerate()
            .find_map(|(e, result)| result.as_ref().err().map(|m| (connectivity.global_element_index(e), m.clone())));
        agree_on_failure(&self.comm, failure)?;
        Ok(results.into_iter().filter_map(Result::ok).collect())
    }

    /// Accumulates design-variable sensitivities of all elements into `dfdx`, summed over all
    /// workers. Collective.
    pub(crate) fn accumulate_dv_sens<F>(&self, data: &AssemblerData<T>, dfdx: &mut [T], kernel: F) -> Result<(), AssemblyError>
    where
        F: Fn(usize, usize, &ElementState<T>, &mut [T]) -> eyre::Result<()> + Sync,
    {
        let num_design_vars = data.design_vars.num_design_vars;
        if dfdx.len() < num_design_vars {
            return Err(AssemblyError::DesignVarIndexMismatch {
                required: num_design_vars,
                provided: dfdx.len(),
            });
        }
        let connectivity = &data.connectivity;
        let zero = || (vec![T::zero(); num_design_vars], None::<(usize, String)>);
        let (mut local, failure) = (0..self.elements.len())
            .into_par_iter()
            .fold(zero, |(mut buffer, failure), e| {
                if failure.is_some() {
                    return (buffer, failure);
                }
                let buffers = self.element_buffers(data, e);
                let elem_index = connectivity.global_element_index(e);
                let failure = kernel(e, elem_index, &buffers.state(self.time), &mut buffer)
                    .err()
                    .map(|report| (elem_index, element_failure_message(&*self.elements[e], &report)));
                (buffer, failure)
            })
            .reduce(zero, |(mut a, failure_a), (b, failure_b)| {
                for (a, b) in a.iter_mut().zip(b) {
                    *a += b;
                }
                let failure = match (failure_a, failure_b) {
                    (Some(fa), Some(fb)) => Some(if fa.0 <= fb.0 { fa } else { fb }),
                    (fa, fb) => fa.or(fb),
                };
                (a, failure)
            });

        agree_on_failure(&self.comm, failure)?;
        self.comm.all_reduce_sum(&mut local);
        for (d, l) in dfdx.iter_mut().zip(local) {
            *d += l;
        }
        Ok(())
    }

    /// Adds element vectors to a distributed vector, reducing ghost contributions to their owners.
    /// Collective.
    pub(crate) fn add_element_vectors(&self, data: &AssemblerData<T>, element_vectors: &[Vec<T>], vec: &mut DistVector<T>) {
        let connectivity = &data.connectivity;
        let vpn = self.vars_per_node();
        let mut local = vec![T::zero(); connectivity.num_local_nodes() * vpn];
        for (e, element_vector) in element_vectors.iter().enumerate() {
            connectivity.scatter_element_vector(e, element_vector, &mut local);
        }
        connectivity.ghost_exchange().reverse_add(&self.comm, &mut local, vpn);
        for (v, l) in vec.as_mut_slice().iter_mut().zip(local) {
            *v += l;
        }
    }

    /// Assembles the residual into `residual`. Constrained entries are zero. Collective.
    pub fn assemble_residual(&self, residual: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let start = Instant::now();
        let data = self.data("assemble_residual", AssemblerState::Ready)?;
        let element_vectors = self.evaluate_elements(data, |e, elem_index, state| {
            let mut res = vec![T::zero(); state.vars.len()];
            self.elements[e].add_residual(elem_index, state, &mut res)?;
            Ok(res)
        })?;
        residual.zero();
        self.add_element_vectors(data, &element_vectors, residual);
        self.apply_bcs(residual)?;
        debug!(
            "Worker {}: assembled residual in {:.3} ms",
            self.comm.rank(),
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    /// Assembles `alpha * dR/du + beta * dR/du' + gamma * dR/du''` into `matrix` and optionally the
    /// residual into `residual`. Collective.
    ///
    /// Rows and columns of constrained dofs are zeroed with unit diagonal entries.
    pub fn assemble_jacobian(
        &self,
        alpha: T,
        beta: T,
        gamma: T,
        residual: Option<&mut DistVector<T>>,
        matrix: &mut DistMatrix<T>,
    ) -> Result<(), AssemblyError> {
        let coefficients = JacobianCoefficients { alpha, beta, gamma };
        self.assemble_with_coefficients("assemble_jacobian", &coefficients, residual, matrix)
    }

    pub fn assemble_mat_type(&self, matrix_type: MatrixType, matrix: &mut DistMatrix<T>) -> Result<(), AssemblyError> {
        self.assemble_with_coefficients("assemble_mat_type", &matrix_type.coefficients(), None, matrix)
    }

    fn assemble_with_coefficients(
        &self,
        operation: &'static str,
        coefficients: &JacobianCoefficients<T>,
        residual: Option<&mut DistVector<T>>,
        matrix: &mut DistMatrix<T>,
    ) -> Result<(), AssemblyError> {
        let start = Instant::now();
        let data = self.data(operation, AssemblerState::Ready)?;
        assert!(
            Arc::ptr_eq(matrix.structure(), &data.matrix_structure),
            "Matrix was not created by this assembler"
        );
        let contributions = self.evaluate_elements(data, |e, elem_index, state| {
            let n = state.vars.len();
            let mut res = vec![T::zero(); n];
            let mut mat = DMatrix::zeros(n, n);
            self.elements[e].add_jacobian(elem_index, state, coefficients, &mut res, &mut mat)?;
            Ok((res, mat))
        })?;

        matrix.zero_entries();
        for (e, (_, element_matrix)) in contributions.iter().enumerate() {
            matrix.add_element_matrix(&data.connectivity, e, element_matrix);
        }
        matrix.reduce_to_owners();
        matrix.apply_bcs();

        if let Some(residual) = residual {
            let element_vectors: Vec<Vec<T>> = contributions.into_iter().map(|(res, _)| res).collect();
            residual.zero();
            self.add_element_vectors(data, &element_vectors, residual);
            self.apply_bcs(residual)?;
        }
        debug!(
            "Worker {}: assembled matrix in {:.3} ms",
            self.comm.rank(),
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    pub fn num_design_vars(&self) -> Result<usize, AssemblyError> {
        Ok(self
            .data("num_design_vars", AssemblerState::Initialized)?
            .design_vars
            .num_design_vars)
    }

    /// Distributes design variable values to all constitutive models of local elements.
    ///
    /// `x` holds the values of all design variables, indexed by global design variable index.
    pub fn set_design_vars(&self, x: &[T]) -> Result<(), AssemblyError> {
        let registry = &self.data("set_design_vars", AssemblerState::Initialized)?.design_vars;
        if x.len() < registry.num_design_vars {
            return Err(AssemblyError::DesignVarIndexMismatch {
                required: registry.num_design_vars,
                provided: x.len(),
            });
        }
        for owner in &registry.owners {
            owner.model.set_design_vars(owner.elem_index, x);
        }
        Ok(())
    }

    /// Gathers the values of all design variables from all workers. Collective.
    pub fn get_design_vars(&self) -> Result<Vec<T>, AssemblyError> {
        let registry = &self.data("get_design_vars", AssemblerState::Initialized)?.design_vars;
        let n = registry.num_design_vars;
        let mut local = vec![T::zero(); n];
        let mut present = vec![false; n];
        for owner in &registry.owners {
            owner.model.get_design_vars(owner.elem_index, &mut local);
            for num in owner.model.design_var_nums(owner.elem_index) {
                present[num] = true;
            }
        }
        let pairs: Vec<(usize, T)> = (0..n).filter(|&i| present[i]).map(|i| (i, local[i])).collect();
        let mut x = vec![T::zero(); n];
        for (i, value) in self.comm.all_gather(pairs).into_iter().flatten() {
            x[i] = value;
        }
        Ok(x)
    }

    /// Gathers the lower and upper bounds of all design variables from all workers. Collective.
    pub fn get_design_var_range(&self) -> Result<(Vec<T>, Vec<T>), AssemblyError> {
        let registry = &self.data("get_design_var_range", AssemblerState::Initialized)?.design_vars;
        let n = registry.num_design_vars;
        let mut lower = vec![T::zero(); n];
        let mut upper = vec![T::zero(); n];
        let mut present = vec![false; n];
        for owner in &registry.owners {
            owner.model.get_design_var_range(owner.elem_index, &mut lower, &mut upper);
            for num in owner.model.design_var_nums(owner.elem_index) {
                present[num] = true;
            }
        }
        let triplets: Vec<(usize, T, T)> = (0..n)
            .filter(|&i| present[i])
            .map(|i| (i, lower[i], upper[i]))
            .collect();
        let (mut lb, mut ub) = (vec![T::zero(); n], vec![T::zero(); n]);
        for (i, l, u) in self.comm.all_gather(triplets).into_iter().flatten() {
            lb[i] = l;
            ub[i] = u;
        }
        Ok((lb, ub))
    }

    /// Element averages of a design field for every local element. Collective.
    pub fn eval_design_field_values(&self, field_index: usize) -> Result<Vec<Option<T>>, AssemblyError> {
        let data = self.data("eval_design_field_values", AssemblerState::Ready)?;
        self.evaluate_elements(data, |e, elem_index, state| {
            self.elements[e].eval_design_field_value(elem_index, state.xpts, field_index)
        })
    }

    /// Evaluates a quantity at every quadrature point of every local element. Collective.
    pub fn eval_point_quantities(&self, quantity: ElementQuantity) -> Result<Vec<Vec<PointQuantity<T>>>, AssemblyError> {
        self.eval_point_quantities_in(quantity, &ElementDomain::All)
    }

    /// Evaluates a quantity at the quadrature points of the local elements in `domain`.
    ///
    /// Elements outside the domain get no points. Collective.
    pub fn eval_point_quantities_in(
        &self,
        quantity: ElementQuantity,
        domain: &ElementDomain,
    ) -> Result<Vec<Vec<PointQuantity<T>>>, AssemblyError> {
        let data = self.data("eval_point_quantities", AssemblerState::Ready)?;
        let mask = self.domain_mask(domain);
        self.evaluate_elements(data, |e, elem_index, state| {
            if !mask[e] {
                return Ok(Vec::new());
            }
            let element = &self.elements[e];
            (0..element.num_quadrature_points())
                .map(|n| element.eval_point_quantity(elem_index, quantity, n, state))
                .collect()
        })
    }

    /// Global ids of all nodes referenced by elements in `domain` on any worker, sorted.
    ///
    /// Dependent nodes contribute the independent nodes they are expressed in. Collective.
    pub fn domain_node_ids(&self, domain: &ElementDomain) -> Result<Vec<usize>, AssemblyError> {
        let connectivity = self.connectivity()?;
        let local_to_global = connectivity.local_to_global();
        let local: Vec<usize> = self
            .domain_mask(domain)
            .iter()
            .enumerate()
            .filter(|(_, inside)| **inside)
            .flat_map(|(e, _)| connectivity.element_nodes(e))
            .map(|node| local_to_global[node])
            .sorted_unstable()
            .dedup()
            .collect();
        Ok(self
            .comm
            .all_gather(local)
            .into_iter()
            .flatten()
            .sorted_unstable()
            .dedup()
            .collect())
    }

    /// Adds `sum_points scales[e][n] * d(value)/du` to `dfdu`. Collective.
    pub fn add_point_quantity_sv_sens(
        &self,
        quantity: ElementQuantity,
        scales: &[Vec<T>],
        dfdu: &mut DistVector<T>,
    ) -> Result<(), AssemblyError> {
        let data = self.data("add_point_quantity_sv_sens", AssemblerState::Ready)?;
        assert_eq!(scales.len(), self.elements.len(), "Need one scale vector per element");
        let element_vectors = self.evaluate_elements(data, |e, elem_index, state| {
            let element = &self.elements[e];
            let mut dfdu = vec![T::zero(); state.vars.len()];
            for (n, &scale) in scales[e].iter().enumerate() {
                element.add_point_quantity_sv_sens(elem_index, quantity, n, state, scale, &mut dfdu)?;
            }
            Ok(dfdu)
        })?;
        self.add_element_vectors(data, &element_vectors, dfdu);
        Ok(())
    }

    /// Adds `sum_points scales[e][n] * d(value)/dx`, summed over all workers, to `dfdx`. Collective.
    pub fn add_point_quantity_dv_sens(
        &self,
        quantity: ElementQuantity,
        scales: &[Vec<T>],
        dfdx: &mut [T],
    ) -> Result<(), AssemblyError> {
        let data = self.data("add_point_quantity_dv_sens", AssemblerState::Ready)?;
        assert_eq!(scales.len(), self.elements.len(), "Need one scale vector per element");
        self.accumulate_dv_sens(data, dfdx, |e, elem_index, state, dfdx| {
            let element = &self.elements[e];
            for (n, &scale) in scales[e].iter().enumerate() {
                element.add_point_quantity_dv_sens(elem_index, quantity, n, state, scale, dfdx)?;
            }
            Ok(())
        })
    }
}

/// Copies owned values into the local buffer and fetches ghost values from their owners.
fn set_local_values<T: Real>(
    comm: &Communicator,
    connectivity: &DistributedConnectivity<T>,
    vec: &DistVector<T>,
    local: &mut [T],
) {
    let block_size = vec.block_size();
    assert_eq!(local.len(), connectivity.num_local_nodes() * block_size);
    local[..vec.len()].copy_from_slice(vec.as_slice());
    connectivity.ghost_exchange().forward(comm, local, block_size);
}
