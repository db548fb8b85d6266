//! Distributed node numbering, element connectivity and boundary condition records.
use crate::comm::Communicator;
use crate::error::AssemblyError;
use crate::exchange::GhostExchange;
use crate::matrix::pattern_from_pairs;
use crate::reorder::{compute_ordering, Ordering, Permutation};
use crate::Real;
use itertools::Itertools;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::ops::Range;

/// Reference from an element slot to a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// An independent node, identified by its global id.
    Global(usize),
    /// A dependent node, identified by its index in the dependent nodes of this worker.
    Dependent(usize),
}

/// Contiguous ranges of global node ids owned by each worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRange {
    // offsets[rank] .. offsets[rank + 1] is the range owned by rank
    offsets: Vec<usize>,
}

impl OwnershipRange {
    /// Builds the ownership ranges collectively from the number of nodes owned by each worker.
    pub fn from_owned_count(comm: &Communicator, num_owned_nodes: usize) -> Self {
        let counts = comm.all_gather(num_owned_nodes);
        Self::from_counts(&counts)
    }

    pub fn from_counts(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        for count in counts {
            offsets.push(offsets.last().copied().unwrap_or(0) + count);
        }
        Self { offsets }
    }

    pub fn num_workers(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn num_global_nodes(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn range(&self, rank: usize) -> Range<usize> {
        self.offsets[rank]..self.offsets[rank + 1]
    }

    /// Rank of the worker owning the given global node.
    ///
    /// # Panics
    ///
    /// Panics if the node id is not smaller than the global node count.
    pub fn owner(&self, global_node: usize) -> usize {
        assert!(
            global_node < self.num_global_nodes(),
            "Node {} is out of bounds for {} global nodes",
            global_node,
            self.num_global_nodes()
        );
        // Workers owning no nodes yield repeated offsets, the last one is the owner
        self.offsets.partition_point(|&offset| offset <= global_node) - 1
    }
}

/// Dependent nodes in CSR form.
///
/// Dependent node `k` is the weighted combination of the global nodes
/// `conn[ptr[k] .. ptr[k + 1]]` with the corresponding `weights`.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentNodes<T> {
    pub ptr: Vec<usize>,
    pub conn: Vec<usize>,
    pub weights: Vec<T>,
}

impl<T> DependentNodes<T> {
    pub fn num_nodes(&self) -> usize {
        self.ptr.len().saturating_sub(1)
    }

    pub fn node(&self, index: usize) -> (&[usize], &[T]) {
        let range = self.ptr[index]..self.ptr[index + 1];
        (&self.conn[range.clone()], &self.weights[range])
    }
}

/// A constraint on degrees of freedom of a single global node.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCondition<T> {
    pub node: usize,
    /// Constrained local dof indices. `None` constrains all dofs of the node.
    pub dofs: Option<Vec<usize>>,
    /// Prescribed values, one per constrained dof. `None` prescribes zero.
    pub values: Option<Vec<T>>,
}

impl<T> BoundaryCondition<T> {
    /// Homogeneous constraint of every dof of `node`.
    pub fn clamped(node: usize) -> Self {
        Self {
            node,
            dofs: None,
            values: None,
        }
    }

    pub fn with_dofs(node: usize, dofs: Vec<usize>) -> Self {
        Self {
            node,
            dofs: Some(dofs),
            values: None,
        }
    }

    pub fn with_values(node: usize, dofs: Vec<usize>, values: Vec<T>) -> Self {
        Self {
            node,
            dofs: Some(dofs),
            values: Some(values),
        }
    }
}

/// The structural description of the part of a mesh held by one worker.
///
/// This is collected before [`initialize`](Self::initialize), which validates it and freezes it
/// into a [`DistributedConnectivity`].
#[derive(Debug, Clone)]
pub struct MeshPartition<T> {
    vars_per_node: usize,
    num_owned_nodes: usize,
    element_ptr: Vec<usize>,
    element_conn: Vec<NodeRef>,
    dependent_nodes: Option<DependentNodes<T>>,
    bcs: Vec<BoundaryCondition<T>>,
    ordering: Ordering,
    initialized: bool,
}

impl<T: Real> MeshPartition<T> {
    pub fn new(vars_per_node: usize, num_owned_nodes: usize) -> Self {
        Self {
            vars_per_node,
            num_owned_nodes,
            element_ptr: vec![0],
            element_conn: Vec::new(),
            dependent_nodes: None,
            bcs: Vec::new(),
            ordering: Ordering::default(),
            initialized: false,
        }
    }

    pub fn vars_per_node(&self) -> usize {
        self.vars_per_node
    }

    pub fn num_owned_nodes(&self) -> usize {
        self.num_owned_nodes
    }

    pub fn num_elements(&self) -> usize {
        self.element_ptr.len().saturating_sub(1)
    }

    pub fn set_element_connectivity(&mut self, ptr: Vec<usize>, conn: Vec<NodeRef>) {
        self.element_ptr = ptr;
        self.element_conn = conn;
    }

    pub fn set_dependent_nodes(&mut self, dependent_nodes: DependentNodes<T>) {
        self.dependent_nodes = Some(dependent_nodes);
    }

    pub fn add_bcs(&mut self, bcs: impl IntoIterator<Item = BoundaryCondition<T>>) {
        self.bcs.extend(bcs);
    }

    pub fn set_ordering(&mut self, ordering: Ordering) {
        self.ordering = ordering;
    }

    /// Validates the partition and builds the distributed numbering collectively.
    ///
    /// `element_num_nodes` holds the number of nodes expected by each element of this worker.
    /// Validation failures on any worker make every worker return `InvalidConnectivity`. A
    /// partition can be initialized successfully only once.
    pub fn initialize(
        &mut self,
        comm: &Communicator,
        element_num_nodes: &[usize],
    ) -> Result<DistributedConnectivity<T>, AssemblyError> {
        if self.initialized {
            return Err(AssemblyError::invalid_connectivity("initialize was invoked more than once"));
        }
        let connectivity = self.build(comm, element_num_nodes)?;
        self.initialized = true;
        Ok(connectivity)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn build(
        &self,
        comm: &Communicator,
        element_num_nodes: &[usize],
    ) -> Result<DistributedConnectivity<T>, AssemblyError> {
        let ownership = OwnershipRange::from_owned_count(comm, self.num_owned_nodes);
        let local_error = self.validate(ownership.num_global_nodes(), element_num_nodes).err();
        let errors = comm.all_gather(local_error);
        if let Some((rank, message)) = errors
            .into_iter()
            .enumerate()
            .find_map(|(rank, error)| error.map(|message| (rank, message)))
        {
            return Err(AssemblyError::invalid_connectivity(format!("worker {}: {}", rank, message)));
        }

        let owned_range = ownership.range(comm.rank());
        let num_owned = owned_range.len();

        // Global nodes referenced by each element slot, dependent nodes expanded
        let no_dependents = DependentNodes {
            ptr: vec![0],
            conn: Vec::new(),
            weights: Vec::new(),
        };
        let dependent_nodes = self.dependent_nodes.as_ref().unwrap_or(&no_dependents);
        let expand_slot = |node_ref: &NodeRef| -> Vec<(usize, T)> {
            match *node_ref {
                NodeRef::Global(global) => vec![(global, T::one())],
                NodeRef::Dependent(k) => {
                    let (nodes, weights) = dependent_nodes.node(k);
                    nodes.iter().copied().zip(weights.iter().copied()).collect()
                }
            }
        };
        let global_slots: Vec<Vec<(usize, T)>> = self.element_conn.iter().map(expand_slot).collect();

        let ghost_globals: Vec<usize> = global_slots
            .iter()
            .flatten()
            .map(|(global, _)| *global)
            .filter(|global| !owned_range.contains(global))
            .sorted_unstable()
            .dedup()
            .collect();

        // Adjacency of owned nodes in natural order, used for reordering
        let mut owned_pairs = Vec::new();
        for element in 0..self.num_elements() {
            let element_nodes: Vec<usize> = global_slots[self.element_ptr[element]..self.element_ptr[element + 1]]
                .iter()
                .flatten()
                .map(|(global, _)| *global)
                .filter(|global| owned_range.contains(global))
                .map(|global| global - owned_range.start)
                .collect();
            for (&a, &b) in element_nodes.iter().cartesian_product(element_nodes.iter()) {
                owned_pairs.push((a, b));
            }
        }
        owned_pairs.extend((0..num_owned).map(|i| (i, i)));
        let owned_adjacency = pattern_from_pairs(num_owned, num_owned, owned_pairs);
        let permutation = compute_ordering(self.ordering, &owned_adjacency);
        let inverse_permutation = permutation.inverse();

        let local_to_global: Vec<usize> = permutation
            .perm()
            .iter()
            .map(|natural| owned_range.start + natural)
            .chain(ghost_globals.iter().copied())
            .collect();
        let global_to_local: FxHashMap<usize, usize> = local_to_global
            .iter()
            .enumerate()
            .map(|(local, &global)| (global, local))
            .collect();

        let mut slot_node_ptr = Vec::with_capacity(global_slots.len() + 1);
        slot_node_ptr.push(0);
        let mut slot_nodes = Vec::new();
        for slot in &global_slots {
            slot_nodes.extend(slot.iter().map(|(global, weight)| (global_to_local[global], *weight)));
            slot_node_ptr.push(slot_nodes.len());
        }

        let vpn = self.vars_per_node;
        let mut bc_mask = vec![false; num_owned * vpn];
        let mut bc_values = vec![T::zero(); num_owned * vpn];
        for bc in self.bcs.iter().filter(|bc| owned_range.contains(&bc.node)) {
            let local = inverse_permutation.source_index(bc.node - owned_range.start);
            let dofs = bc.dofs.clone().unwrap_or_else(|| (0..vpn).collect());
            for (i, &dof) in dofs.iter().enumerate() {
                let value = bc
                    .values
                    .as_ref()
                    .map(|values| values[i])
                    .unwrap_or_else(T::zero);
                bc_mask[local * vpn + dof] = true;
                bc_values[local * vpn + dof] = value;
            }
        }

        let ghost_exchange = GhostExchange::new(comm, &ownership, &ghost_globals, num_owned, |global| {
            inverse_permutation.source_index(global - owned_range.start)
        });

        let (element_offset, num_global_elements) = comm.exclusive_scan(self.num_elements());

        info!(
            "Worker {}: {} owned nodes, {} ghost nodes, {} elements ({} global), ordering {:?}",
            comm.rank(),
            num_owned,
            ghost_globals.len(),
            self.num_elements(),
            num_global_elements,
            self.ordering
        );
        debug!(
            "Worker {}: owned node adjacency has bandwidth {}",
            comm.rank(),
            crate::reorder::bandwidth(&permuted_pattern(&owned_adjacency, &permutation))
        );

        Ok(DistributedConnectivity {
            rank: comm.rank(),
            vars_per_node: vpn,
            ownership,
            num_owned,
            permutation,
            local_to_global,
            global_to_local,
            element_ptr: self.element_ptr.clone(),
            slot_node_ptr,
            slot_nodes,
            dependent_nodes: self.dependent_nodes.clone(),
            bc_mask,
            bc_values,
            ghost_exchange,
            element_offset,
            num_global_elements,
        })
    }

    fn validate(&self, num_global_nodes: usize, element_num_nodes: &[usize]) -> Result<(), String> {
        let ptr = &self.element_ptr;
        if ptr.first() != Some(&0) {
            return Err("element pointer array must start with 0".to_string());
        }
        if let Some((i, _)) = ptr.iter().tuple_windows().find_position(|(a, b)| a > b) {
            return Err(format!("element pointer array decreases at element {}", i));
        }
        if ptr.last() != Some(&self.element_conn.len()) {
            return Err(format!(
                "element pointer array ends at {} but connectivity has {} entries",
                ptr.last().copied().unwrap_or(0),
                self.element_conn.len()
            ));
        }
        if self.num_elements() != element_num_nodes.len() {
            return Err(format!(
                "connectivity describes {} elements but {} elements were supplied",
                self.num_elements(),
                element_num_nodes.len()
            ));
        }
        if self.vars_per_node == 0 {
            return Err("vars_per_node must be positive".to_string());
        }
        for (element, (&expected, (begin, end))) in element_num_nodes
            .iter()
            .zip(ptr.iter().tuple_windows())
            .enumerate()
        {
            if end - begin != expected {
                return Err(format!(
                    "element {} has {} nodes but its element type requires {}",
                    element,
                    end - begin,
                    expected
                ));
            }
        }

        let num_dependent = self
            .dependent_nodes
            .as_ref()
            .map(DependentNodes::num_nodes)
            .unwrap_or(0);
        if let Some(dep) = &self.dependent_nodes {
            if dep.ptr.first() != Some(&0)
                || dep.ptr.iter().tuple_windows().any(|(a, b)| a > b)
                || dep.ptr.last() != Some(&dep.conn.len())
            {
                return Err("dependent node pointer array is malformed".to_string());
            }
            if dep.weights.len() != dep.conn.len() {
                return Err(format!(
                    "dependent nodes have {} weights for {} node references",
                    dep.weights.len(),
                    dep.conn.len()
                ));
            }
            if let Some(&node) = dep.conn.iter().find(|&&node| node >= num_global_nodes) {
                return Err(format!(
                    "dependent node references node {} but there are only {} global nodes",
                    node, num_global_nodes
                ));
            }
        }

        for (position, node_ref) in self.element_conn.iter().enumerate() {
            let element = ptr.partition_point(|&p| p <= position) - 1;
            match *node_ref {
                NodeRef::Global(node) if node >= num_global_nodes => {
                    return Err(format!(
                        "element {} references node {} but there are only {} global nodes",
                        element, node, num_global_nodes
                    ))
                }
                NodeRef::Dependent(k) if k >= num_dependent => {
                    return Err(format!(
                        "element {} references dependent node {} but only {} dependent nodes exist",
                        element, k, num_dependent
                    ))
                }
                _ => {}
            }
        }

        for bc in &self.bcs {
            if bc.node >= num_global_nodes {
                return Err(format!(
                    "boundary condition references node {} but there are only {} global nodes",
                    bc.node, num_global_nodes
                ));
            }
            if let Some(dofs) = &bc.dofs {
                if let Some(&dof) = dofs.iter().find(|&&dof| dof >= self.vars_per_node) {
                    return Err(format!(
                        "boundary condition on node {} constrains dof {} but nodes have {} dofs",
                        bc.node, dof, self.vars_per_node
                    ));
                }
                if let Some(values) = &bc.values {
                    if values.len() != dofs.len() {
                        return Err(format!(
                            "boundary condition on node {} has {} values for {} dofs",
                            bc.node,
                            values.len(),
                            dofs.len()
                        ));
                    }
                }
            } else if bc.values.is_some() {
                return Err(format!(
                    "boundary condition on node {} prescribes values without naming dofs",
                    bc.node
                ));
            }
        }
        Ok(())
    }
}

fn permuted_pattern(
    pattern: &nalgebra_sparse::pattern::SparsityPattern,
    permutation: &Permutation,
) -> nalgebra_sparse::pattern::SparsityPattern {
    let inverse = permutation.inverse();
    let n = pattern.major_dim();
    let pairs = (0..n)
        .flat_map(|i| pattern.lane(i).iter().map(move |&j| (i, j)))
        .map(|(i, j)| (inverse.source_index(i), inverse.source_index(j)))
        .collect();
    pattern_from_pairs(n, n, pairs)
}

/// The frozen numbering of one worker.
///
/// Local nodes are the owned nodes in local (possibly reordered) order, followed by the ghost
/// nodes referenced by local elements sorted by global id.
#[derive(Debug, Clone)]
pub struct DistributedConnectivity<T> {
    rank: usize,
    vars_per_node: usize,
    ownership: OwnershipRange,
    num_owned: usize,
    // Local owned index -> offset of the node in the owned range
    permutation: Permutation,
    local_to_global: Vec<usize>,
    global_to_local: FxHashMap<usize, usize>,
    element_ptr: Vec<usize>,
    // Slot -> range in slot_nodes
    slot_node_ptr: Vec<usize>,
    // (local node, weight) pairs
    slot_nodes: Vec<(usize, T)>,
    dependent_nodes: Option<DependentNodes<T>>,
    bc_mask: Vec<bool>,
    bc_values: Vec<T>,
    ghost_exchange: GhostExchange,
    element_offset: usize,
    num_global_elements: usize,
}

impl<T: Real> DistributedConnectivity<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn vars_per_node(&self) -> usize {
        self.vars_per_node
    }

    pub fn ownership(&self) -> &OwnershipRange {
        &self.ownership
    }

    pub fn owned_range(&self) -> Range<usize> {
        self.ownership.range(self.rank)
    }

    pub fn num_owned_nodes(&self) -> usize {
        self.num_owned
    }

    pub fn num_ghost_nodes(&self) -> usize {
        self.local_to_global.len() - self.num_owned
    }

    pub fn num_local_nodes(&self) -> usize {
        self.local_to_global.len()
    }

    pub fn num_global_nodes(&self) -> usize {
        self.ownership.num_global_nodes()
    }

    /// Global ids of all local nodes in local order.
    pub fn local_to_global(&self) -> &[usize] {
        &self.local_to_global
    }

    pub fn global_to_local(&self, global: usize) -> Option<usize> {
        self.global_to_local.get(&global).copied()
    }

    /// Permutation from the local owned numbering to the natural order of the owned range.
    pub fn permutation(&self) -> &Permutation {
        &self.permutation
    }

    pub fn num_elements(&self) -> usize {
        self.element_ptr.len() - 1
    }

    pub fn element_offset(&self) -> usize {
        self.element_offset
    }

    pub fn num_global_elements(&self) -> usize {
        self.num_global_elements
    }

    pub fn global_element_index(&self, local_element: usize) -> usize {
        self.element_offset + local_element
    }

    pub fn element_slots(&self, element: usize) -> Range<usize> {
        self.element_ptr[element]..self.element_ptr[element + 1]
    }

    /// Weighted local independent nodes of an element slot.
    pub fn slot_nodes(&self, slot: usize) -> &[(usize, T)] {
        &self.slot_nodes[self.slot_node_ptr[slot]..self.slot_node_ptr[slot + 1]]
    }

    /// Sorted local independent nodes an element contributes to.
    pub fn element_nodes(&self, element: usize) -> Vec<usize> {
        self.element_slots(element)
            .flat_map(|slot| self.slot_nodes(slot).iter().map(|(node, _)| *node))
            .sorted_unstable()
            .dedup()
            .collect()
    }

    pub fn dependent_nodes(&self) -> Option<&DependentNodes<T>> {
        self.dependent_nodes.as_ref()
    }

    /// Per-dof constraint mask of the owned nodes in local order.
    pub fn bc_mask(&self) -> &[bool] {
        &self.bc_mask
    }

    /// Prescribed values of the owned dofs in local order. Unconstrained dofs hold zero.
    pub fn bc_values(&self) -> &[T] {
        &self.bc_values
    }

    pub fn ghost_exchange(&self) -> &GhostExchange {
        &self.ghost_exchange
    }

    /// Gathers the values of an element from local nodal values with block size `block_size`,
    /// evaluating dependent slots as weighted combinations.
    pub fn gather_element_values(&self, element: usize, local_values: &[T], block_size: usize, out: &mut [T]) {
        let slots = self.element_slots(element);
        assert_eq!(out.len(), slots.len() * block_size);
        out.fill(T::zero());
        for (slot_index, slot) in slots.enumerate() {
            let out_block = &mut out[slot_index * block_size..(slot_index + 1) * block_size];
            for &(node, weight) in self.slot_nodes(slot) {
                let values = &local_values[node * block_size..(node + 1) * block_size];
                for (o, v) in out_block.iter_mut().zip(values) {
                    *o += weight * *v;
                }
            }
        }
    }

    /// Adds an element vector to local nodal values, distributing dependent slots to their
    /// independent nodes.
    pub fn scatter_element_vector(&self, element: usize, element_values: &[T], local_values: &mut [T]) {
        let vpn = self.vars_per_node;
        let slots = self.element_slots(element);
        assert_eq!(element_values.len(), slots.len() * vpn);
        for (slot_index, slot) in slots.enumerate() {
            let block = &element_values[slot_index * vpn..(slot_index + 1) * vpn];
            for &(node, weight) in self.slot_nodes(slot) {
                for (v, e) in local_values[node * vpn..(node + 1) * vpn].iter_mut().zip(block) {
                    *v += weight * *e;
                }
            }
        }
    }
}
