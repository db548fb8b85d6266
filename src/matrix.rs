//! Distributed sparse matrices holding the owned block rows of one worker.
use crate::connectivity::DistributedConnectivity;
use crate::exchange::GhostExchange;
use crate::vector::{DistVector, VectorLayout};
use crate::Real;
use itertools::Itertools;
use log::debug;
use nalgebra::DMatrix;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use rayon::slice::ParallelSliceMut;
use std::sync::Arc;

/// Builds a sparsity pattern from (possibly duplicate) `(row, column)` pairs.
pub(crate) fn pattern_from_pairs(num_rows: usize, num_cols: usize, mut pairs: Vec<(usize, usize)>) -> SparsityPattern {
    pairs.par_sort_unstable();
    pairs.dedup();

    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(pairs.len());
    offsets.push(0);
    for (i, j) in pairs {
        while i + 1 > offsets.len() {
            // Run in a loop to correctly handle consecutive empty rows
            offsets.push(column_indices.len());
        }
        column_indices.push(j);
    }
    // Fill out the remaining offsets if the last rows are empty
    while offsets.len() < num_rows + 1 {
        offsets.push(column_indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(num_rows, num_cols, offsets, column_indices)
        .expect("Internal error: Sorted and deduplicated pairs always form a valid pattern")
}

/// Expands a node-level pattern into a dof-level pattern with `block_size` dofs per node.
fn expand_pattern(node_pattern: &SparsityPattern, block_size: usize) -> SparsityPattern {
    let num_rows = node_pattern.major_dim() * block_size;
    let num_cols = node_pattern.minor_dim() * block_size;
    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(node_pattern.nnz() * block_size * block_size);
    offsets.push(0);
    for node_row in 0..node_pattern.major_dim() {
        for _ in 0..block_size {
            for &node_col in node_pattern.lane(node_row) {
                column_indices.extend((0..block_size).map(|b| block_size * node_col + b));
            }
            offsets.push(column_indices.len());
        }
    }
    SparsityPattern::try_from_offsets_and_indices(num_rows, num_cols, offsets, column_indices)
        .expect("Internal error: Expansion of a valid pattern is valid")
}

fn lane_position(pattern: &SparsityPattern, row: usize, col: usize) -> usize {
    pattern
        .lane(row)
        .binary_search(&col)
        .expect("Internal error: Entry is not part of the sparsity pattern")
}

/// Sparsity and communication structure shared by all matrices created by one assembler.
///
/// Rows are the owned dofs in local order. Columns are numbered per node: owned nodes first,
/// then the off-worker column nodes sorted by global id.
#[derive(Debug)]
pub struct MatrixStructure {
    layout: Arc<VectorLayout>,
    vars_per_node: usize,
    num_owned: usize,
    column_ghosts: Vec<usize>,
    column_exchange: GhostExchange,
    // Element-local node -> column node, usize::MAX if the node is not a column of this worker
    local_to_column: Vec<usize>,
    node_pattern: SparsityPattern,
    dof_pattern: SparsityPattern,
    // Rows are the element ghosts of this worker, columns are element-local nodes
    ghost_row_pattern: SparsityPattern,
    ghost_owners: Vec<(usize, Vec<usize>)>,
    // Indexed by referrer rank: value indices of the received ghost row entries
    recv_targets: Vec<Vec<usize>>,
    row_bc_mask: Vec<bool>,
    column_bc_mask: Vec<bool>,
}

impl MatrixStructure {
    /// Builds the structure collectively from the frozen connectivity.
    pub fn new<T: Real>(connectivity: &DistributedConnectivity<T>, layout: Arc<VectorLayout>) -> Self {
        let comm = layout.comm().clone();
        let vpn = connectivity.vars_per_node();
        let num_owned = connectivity.num_owned_nodes();
        let num_local = connectivity.num_local_nodes();
        let local_to_global = connectivity.local_to_global();

        // Owned rows: (local row, global column). Ghost rows: (ghost index, local column)
        let mut owned_pairs: Vec<(usize, usize)> = (0..num_owned).map(|i| (i, local_to_global[i])).collect();
        let mut ghost_pairs = Vec::new();
        for element in 0..connectivity.num_elements() {
            let nodes = connectivity.element_nodes(element);
            for (&i, &j) in nodes.iter().cartesian_product(nodes.iter()) {
                if i < num_owned {
                    owned_pairs.push((i, local_to_global[j]));
                } else {
                    ghost_pairs.push((i - num_owned, j));
                }
            }
        }
        let ghost_row_pattern = pattern_from_pairs(num_local - num_owned, num_local, ghost_pairs);

        let ghost_exchange = connectivity.ghost_exchange();
        let ghost_owners: Vec<(usize, Vec<usize>)> = (0..comm.size())
            .map(|rank| (rank, ghost_exchange.ghosts_owned_by(rank).to_vec()))
            .filter(|(_, ghosts)| !ghosts.is_empty())
            .collect();

        let mut outgoing = vec![Vec::new(); comm.size()];
        for (rank, ghosts) in &ghost_owners {
            for &ghost in ghosts {
                for &col in ghost_row_pattern.lane(ghost - num_owned) {
                    outgoing[*rank].push((local_to_global[ghost], local_to_global[col]));
                }
            }
        }
        let incoming: Vec<Vec<(usize, usize)>> = comm.exchange(outgoing);
        let incoming: Vec<Vec<(usize, usize)>> = incoming
            .into_iter()
            .map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(row, col)| {
                        let local_row = layout
                            .owned_local_index(row)
                            .expect("Internal error: Received a row owned by another worker");
                        (local_row, col)
                    })
                    .collect()
            })
            .collect();
        owned_pairs.extend(incoming.iter().flatten().copied());

        let column_ghosts: Vec<usize> = owned_pairs
            .iter()
            .map(|(_, col)| *col)
            .filter(|&col| layout.owned_local_index(col).is_none())
            .sorted_unstable()
            .dedup()
            .collect();
        let column_index = |global: usize| -> usize {
            match layout.owned_local_index(global) {
                Some(local) => local,
                None => {
                    num_owned
                        + column_ghosts
                            .binary_search(&global)
                            .expect("Internal error: Column ghost is missing")
                }
            }
        };

        let column_pairs = owned_pairs
            .iter()
            .map(|&(row, col)| (row, column_index(col)))
            .collect();
        let node_pattern = pattern_from_pairs(num_owned, num_owned + column_ghosts.len(), column_pairs);
        let dof_pattern = expand_pattern(&node_pattern, vpn);

        let recv_targets = incoming
            .iter()
            .map(|pairs| {
                let mut targets = Vec::with_capacity(pairs.len() * vpn * vpn);
                for &(row, col) in pairs {
                    let position = lane_position(&node_pattern, row, column_index(col));
                    for a in 0..vpn {
                        let row_offset = dof_pattern.major_offsets()[row * vpn + a];
                        targets.extend((0..vpn).map(|b| row_offset + position * vpn + b));
                    }
                }
                targets
            })
            .collect();

        let local_to_column = local_to_global
            .iter()
            .enumerate()
            .map(|(local, global)| {
                if local < num_owned {
                    local
                } else {
                    column_ghosts
                        .binary_search(global)
                        .map(|position| num_owned + position)
                        .unwrap_or(usize::MAX)
                }
            })
            .collect();

        let column_exchange = GhostExchange::new(&comm, layout.ownership(), &column_ghosts, num_owned, |global| {
            layout
                .owned_local_index(global)
                .expect("Internal error: Column ghost request for a node owned by another worker")
        });

        let row_bc_mask = connectivity.bc_mask().to_vec();
        let mut column_bc_mask = row_bc_mask.clone();
        column_bc_mask.resize((num_owned + column_ghosts.len()) * vpn, false);
        column_exchange.forward(&comm, &mut column_bc_mask, vpn);

        debug!(
            "Worker {}: matrix structure with {} rows, {} column ghosts and {} nonzeros",
            comm.rank(),
            dof_pattern.major_dim(),
            column_ghosts.len(),
            dof_pattern.nnz()
        );

        Self {
            layout,
            vars_per_node: vpn,
            num_owned,
            column_ghosts,
            column_exchange,
            local_to_column,
            node_pattern,
            dof_pattern,
            ghost_row_pattern,
            ghost_owners,
            recv_targets,
            row_bc_mask,
            column_bc_mask,
        }
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        &self.layout
    }

    pub fn vars_per_node(&self) -> usize {
        self.vars_per_node
    }

    /// Global ids of the off-worker column nodes.
    pub fn column_ghosts(&self) -> &[usize] {
        &self.column_ghosts
    }

    pub fn pattern(&self) -> &SparsityPattern {
        &self.dof_pattern
    }

    /// Node-level pattern of the owned block rows.
    pub fn node_pattern(&self) -> &SparsityPattern {
        &self.node_pattern
    }

    fn column_global(&self, column_node: usize) -> usize {
        if column_node < self.num_owned {
            self.layout.owned_global_index(column_node)
        } else {
            self.column_ghosts[column_node - self.num_owned]
        }
    }
}

/// A distributed sparse matrix with `vars_per_node × vars_per_node` blocks.
#[derive(Debug, Clone)]
pub struct DistMatrix<T: Real> {
    structure: Arc<MatrixStructure>,
    csr: CsrMatrix<T>,
    // Contributions to rows owned by other workers, laid out per ghost-row pattern entry
    ghost_values: Vec<T>,
}

impl<T: Real> DistMatrix<T> {
    pub fn zeros(structure: Arc<MatrixStructure>) -> Self {
        let pattern = structure.dof_pattern.clone();
        let values = vec![T::zero(); pattern.nnz()];
        let csr = CsrMatrix::try_from_pattern_and_values(pattern, values)
            .expect("Internal error: Pattern and values have equal size");
        let vpn = structure.vars_per_node;
        let ghost_values = vec![T::zero(); structure.ghost_row_pattern.nnz() * vpn * vpn];
        Self {
            structure,
            csr,
            ghost_values,
        }
    }

    pub fn structure(&self) -> &Arc<MatrixStructure> {
        &self.structure
    }

    /// The owned rows with worker-local column numbering.
    pub fn local_csr(&self) -> &CsrMatrix<T> {
        &self.csr
    }

    pub fn nnz(&self) -> usize {
        self.csr.nnz()
    }

    pub fn zero_entries(&mut self) {
        self.csr.values_mut().fill(T::zero());
        self.ghost_values.fill(T::zero());
    }

    /// Adds an element matrix, distributing dependent slots with their weights.
    pub(crate) fn add_element_matrix(
        &mut self,
        connectivity: &DistributedConnectivity<T>,
        element: usize,
        element_matrix: &DMatrix<T>,
    ) {
        let structure = &*self.structure;
        let vpn = structure.vars_per_node;
        let num_owned = structure.num_owned;
        let slots = connectivity.element_slots(element);
        assert_eq!(element_matrix.nrows(), slots.len() * vpn);
        assert_eq!(element_matrix.ncols(), slots.len() * vpn);

        let row_offsets = structure.dof_pattern.major_offsets();
        let ghost_offsets = structure.ghost_row_pattern.major_offsets();
        let values = self.csr.values_mut();

        for (p, slot_p) in slots.clone().enumerate() {
            for &(n, wn) in connectivity.slot_nodes(slot_p) {
                for (q, slot_q) in slots.clone().enumerate() {
                    for &(m, wm) in connectivity.slot_nodes(slot_q) {
                        let weight = wn * wm;
                        let block = element_matrix.view((p * vpn, q * vpn), (vpn, vpn));
                        if n < num_owned {
                            let column = structure.local_to_column[m];
                            let position = lane_position(&structure.node_pattern, n, column);
                            for a in 0..vpn {
                                let start = row_offsets[n * vpn + a] + position * vpn;
                                for b in 0..vpn {
                                    values[start + b] += weight * block[(a, b)];
                                }
                            }
                        } else {
                            let ghost_row = n - num_owned;
                            let entry = ghost_offsets[ghost_row]
                                + lane_position(&structure.ghost_row_pattern, ghost_row, m);
                            let start = entry * vpn * vpn;
                            for a in 0..vpn {
                                for b in 0..vpn {
                                    self.ghost_values[start + a * vpn + b] += weight * block[(a, b)];
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sends contributions to rows owned by other workers to their owners. Collective.
    pub(crate) fn reduce_to_owners(&mut self) {
        let structure = &*self.structure;
        let comm = structure.layout.comm();
        let vpn = structure.vars_per_node;
        let num_owned = structure.num_owned;
        let block = vpn * vpn;
        let ghost_offsets = structure.ghost_row_pattern.major_offsets();

        let mut outgoing = vec![Vec::new(); comm.size()];
        for (rank, ghosts) in &structure.ghost_owners {
            let buffer: &mut Vec<T> = &mut outgoing[*rank];
            for &ghost in ghosts {
                let row = ghost - num_owned;
                let range = ghost_offsets[row] * block..ghost_offsets[row + 1] * block;
                buffer.extend_from_slice(&self.ghost_values[range]);
            }
        }
        let incoming = comm.exchange(outgoing);
        let values = self.csr.values_mut();
        for (targets, received) in structure.recv_targets.iter().zip(incoming) {
            assert_eq!(targets.len(), received.len());
            for (&target, value) in targets.iter().zip(received) {
                values[target] += value;
            }
        }
        self.ghost_values.fill(T::zero());
    }

    /// Zeros the rows and columns of constrained dofs and places ones on their diagonal.
    pub fn apply_bcs(&mut self) {
        let structure = &*self.structure;
        let (offsets, columns, values) = self.csr.csr_data_mut();
        for row in 0..structure.row_bc_mask.len() {
            let row_is_constrained = structure.row_bc_mask[row];
            for k in offsets[row]..offsets[row + 1] {
                let col = columns[k];
                if row_is_constrained {
                    values[k] = if col == row { T::one() } else { T::zero() };
                } else if structure.column_bc_mask[col] {
                    values[k] = T::zero();
                }
            }
        }
    }

    /// Computes `y = A x`. Collective.
    pub fn apply(&self, x: &DistVector<T>, y: &mut DistVector<T>) {
        let structure = &*self.structure;
        let vpn = structure.vars_per_node;
        assert_eq!(x.block_size(), vpn);
        assert_eq!(y.block_size(), vpn);

        let num_columns = self.csr.ncols();
        let mut x_columns = Vec::with_capacity(num_columns);
        x_columns.extend_from_slice(x.as_slice());
        x_columns.resize(num_columns, T::zero());
        structure
            .column_exchange
            .forward(structure.layout.comm(), &mut x_columns, vpn);

        for (y_i, row) in y.as_mut_slice().iter_mut().zip(self.csr.row_iter()) {
            *y_i = row
                .col_indices()
                .iter()
                .zip(row.values())
                .fold(T::zero(), |sum, (&j, &a_ij)| sum + a_ij * x_columns[j]);
        }
    }

    /// The diagonal of the owned rows.
    pub fn diagonal(&self) -> DistVector<T> {
        let mut diagonal = DistVector::zeros(self.structure.layout.clone(), self.structure.vars_per_node);
        let d = diagonal.as_mut_slice();
        for (i, row) in self.csr.row_iter().enumerate() {
            if let Ok(k) = row.col_indices().binary_search(&i) {
                d[i] = row.values()[k];
            }
        }
        diagonal
    }

    /// Gathers the full matrix in natural global dof order on every worker. Collective.
    ///
    /// Intended for testing and debugging of small problems.
    pub fn gather_dense(&self) -> DMatrix<T> {
        let structure = &*self.structure;
        let vpn = structure.vars_per_node;
        let layout = &structure.layout;
        let triplets: Vec<(usize, usize, T)> = self
            .csr
            .triplet_iter()
            .map(|(i, j, &v)| {
                let row = layout.owned_global_index(i / vpn) * vpn + i % vpn;
                let col = structure.column_global(j / vpn) * vpn + j % vpn;
                (row, col, v)
            })
            .collect();
        let n = layout.ownership().num_global_nodes() * vpn;
        let mut dense = DMatrix::zeros(n, n);
        for (i, j, v) in layout.comm().all_gather(triplets).into_iter().flatten() {
            dense[(i, j)] += v;
        }
        dense
    }
}
