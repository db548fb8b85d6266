//! Distributed vectors holding the owned entries of one worker.
use crate::comm::Communicator;
use crate::connectivity::OwnershipRange;
use crate::reorder::Permutation;
use crate::Real;
use nalgebra::DVector;
use std::sync::Arc;

/// Distribution of node-blocked vectors across the workers of a group.
#[derive(Debug)]
pub struct VectorLayout {
    comm: Communicator,
    ownership: OwnershipRange,
    // Local owned index -> offset in the owned range
    permutation: Permutation,
    inverse_permutation: Permutation,
}

impl VectorLayout {
    pub fn new(comm: Communicator, ownership: OwnershipRange, permutation: Permutation) -> Self {
        assert_eq!(
            permutation.len(),
            ownership.range(comm.rank()).len(),
            "Permutation must cover the owned range"
        );
        let inverse_permutation = permutation.inverse();
        Self {
            comm,
            ownership,
            permutation,
            inverse_permutation,
        }
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn ownership(&self) -> &OwnershipRange {
        &self.ownership
    }

    pub fn num_owned_nodes(&self) -> usize {
        self.permutation.len()
    }

    /// Local index of an owned global node, or `None` if the node is owned by another worker.
    pub fn owned_local_index(&self, global: usize) -> Option<usize> {
        let range = self.ownership.range(self.comm.rank());
        range
            .contains(&global)
            .then(|| self.inverse_permutation.source_index(global - range.start))
    }

    /// Global id of the owned node with the given local index.
    pub fn owned_global_index(&self, local: usize) -> usize {
        self.ownership.range(self.comm.rank()).start + self.permutation.source_index(local)
    }
}

/// A distributed vector with `block_size` entries per node.
#[derive(Debug, Clone)]
pub struct DistVector<T: Real> {
    layout: Arc<VectorLayout>,
    block_size: usize,
    values: DVector<T>,
}

impl<T: Real> DistVector<T> {
    pub fn zeros(layout: Arc<VectorLayout>, block_size: usize) -> Self {
        let n = layout.num_owned_nodes() * block_size;
        Self {
            layout,
            block_size,
            values: DVector::zeros(n),
        }
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        &self.layout
    }

    pub fn comm(&self) -> &Communicator {
        self.layout.comm()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of locally owned entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn global_len(&self) -> usize {
        self.layout.ownership().num_global_nodes() * self.block_size
    }

    /// Owned entries in local order.
    pub fn values(&self) -> &DVector<T> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DVector<T> {
        &mut self.values
    }

    pub fn as_slice(&self) -> &[T] {
        self.values.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.values.as_mut_slice()
    }

    pub fn zero(&mut self) {
        self.values.fill(T::zero());
    }

    pub fn fill(&mut self, value: T) {
        self.values.fill(value);
    }

    pub fn copy_from(&mut self, other: &DistVector<T>) {
        self.assert_compatible(other);
        self.values.copy_from(&other.values);
    }

    /// `self <- self + alpha * x`
    pub fn axpy(&mut self, alpha: T, x: &DistVector<T>) {
        self.assert_compatible(x);
        self.values.axpy(alpha, &x.values, T::one());
    }

    /// `self <- alpha * x + beta * self`
    pub fn axpby(&mut self, alpha: T, x: &DistVector<T>, beta: T) {
        self.assert_compatible(x);
        self.values.axpy(alpha, &x.values, beta);
    }

    pub fn scale(&mut self, alpha: T) {
        self.values *= alpha;
    }

    /// Global inner product. Collective.
    pub fn dot(&self, other: &DistVector<T>) -> T {
        self.assert_compatible(other);
        self.comm().all_reduce_scalar_sum(self.values.dot(&other.values))
    }

    /// Global Euclidean norm. Collective.
    pub fn norm(&self) -> T {
        self.dot(self).sqrt()
    }

    /// Values of an owned node, or `None` if the node is owned by another worker.
    pub fn node_values(&self, global: usize) -> Option<&[T]> {
        let bs = self.block_size;
        self.layout
            .owned_local_index(global)
            .map(|local| &self.values.as_slice()[local * bs..(local + 1) * bs])
    }

    /// Adds `values` to the entries of an owned node.
    ///
    /// Returns `false` without modification if the node is owned by another worker.
    pub fn add_node_values(&mut self, global: usize, values: &[T]) -> bool {
        assert_eq!(values.len(), self.block_size);
        let bs = self.block_size;
        match self.layout.owned_local_index(global) {
            Some(local) => {
                for (v, a) in self.values.as_mut_slice()[local * bs..(local + 1) * bs]
                    .iter_mut()
                    .zip(values)
                {
                    *v += *a;
                }
                true
            }
            None => false,
        }
    }

    /// Gathers the full vector in natural global order on every worker. Collective.
    pub fn gather_global(&self) -> DVector<T> {
        let bs = self.block_size;
        let mut natural = vec![T::zero(); self.len()];
        for local in 0..self.layout.num_owned_nodes() {
            let offset = self.layout.permutation.source_index(local);
            natural[offset * bs..(offset + 1) * bs]
                .copy_from_slice(&self.values.as_slice()[local * bs..(local + 1) * bs]);
        }
        let parts = self.comm().all_gather(natural);
        DVector::from_iterator(self.global_len(), parts.into_iter().flatten())
    }

    /// Sets the owned entries from a full vector in natural global order.
    pub fn set_from_natural(&mut self, natural: &[T]) {
        assert_eq!(natural.len(), self.global_len(), "Natural vector has wrong length");
        let bs = self.block_size;
        for local in 0..self.layout.num_owned_nodes() {
            let global = self.layout.owned_global_index(local);
            self.values.as_mut_slice()[local * bs..(local + 1) * bs]
                .copy_from_slice(&natural[global * bs..(global + 1) * bs]);
        }
    }

    fn assert_compatible(&self, other: &DistVector<T>) {
        assert!(
            Arc::ptr_eq(&self.layout, &other.layout) && self.block_size == other.block_size,
            "Vectors must share layout and block size"
        );
    }
}
