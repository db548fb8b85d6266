//! Communication plans for ghost nodes.
use crate::comm::Communicator;
use crate::connectivity::OwnershipRange;
use crate::Real;
use std::any::Any;

/// Communication plan between the owners of a set of nodes and the workers that reference them.
///
/// Values are stored per local node in blocks of `block_size` entries. Owned nodes occupy the
/// first local indices, ghost nodes follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostExchange {
    // Indexed by peer rank: local indices of owned nodes referenced by the peer
    send_nodes: Vec<Vec<usize>>,
    // Indexed by peer rank: local indices of ghost nodes owned by the peer
    recv_nodes: Vec<Vec<usize>>,
}

impl GhostExchange {
    /// Builds the plan collectively.
    ///
    /// `ghost_globals` must be sorted by global id and holds the global ids of the ghost nodes,
    /// which are stored at local indices `ghost_offset ..`. `owned_local` maps the global id of an
    /// owned node to its local index.
    pub fn new(
        comm: &Communicator,
        ownership: &OwnershipRange,
        ghost_globals: &[usize],
        ghost_offset: usize,
        owned_local: impl Fn(usize) -> usize,
    ) -> Self {
        let mut requests = vec![Vec::new(); comm.size()];
        let mut recv_nodes = vec![Vec::new(); comm.size()];
        for (i, &global) in ghost_globals.iter().enumerate() {
            let owner = ownership.owner(global);
            assert_ne!(owner, comm.rank(), "Ghost node {} is owned by this worker", global);
            requests[owner].push(global);
            recv_nodes[owner].push(ghost_offset + i);
        }

        let send_nodes = comm
            .exchange(requests)
            .into_iter()
            .map(|requested| requested.into_iter().map(&owned_local).collect())
            .collect();

        Self {
            send_nodes,
            recv_nodes,
        }
    }

    /// Total number of ghost nodes received by this worker.
    pub fn num_ghosts(&self) -> usize {
        self.recv_nodes.iter().map(Vec::len).sum()
    }

    /// Local indices of the ghost nodes owned by worker `rank`, in the order values are exchanged.
    pub fn ghosts_owned_by(&self, rank: usize) -> &[usize] {
        &self.recv_nodes[rank]
    }

    /// Local indices of the owned nodes referenced by worker `rank`, in the order values are exchanged.
    pub fn owned_referenced_by(&self, rank: usize) -> &[usize] {
        &self.send_nodes[rank]
    }

    /// Overwrites ghost entries of `values` with the values held by their owners.
    pub fn forward<M: Copy + Any + Send>(&self, comm: &Communicator, values: &mut [M], block_size: usize) {
        let outgoing = self
            .send_nodes
            .iter()
            .map(|nodes| gather_blocks(values, nodes, block_size))
            .collect();
        let incoming = comm.exchange(outgoing);
        for (nodes, received) in self.recv_nodes.iter().zip(incoming) {
            assert_eq!(received.len(), nodes.len() * block_size);
            for (&node, block) in nodes.iter().zip(received.chunks_exact(block_size.max(1))) {
                values[node * block_size..(node + 1) * block_size].copy_from_slice(block);
            }
        }
    }

    /// Adds the ghost entries of `values` to the entries of their owners.
    ///
    /// Ghost entries are left untouched.
    pub fn reverse_add<T: Real>(&self, comm: &Communicator, values: &mut [T], block_size: usize) {
        let outgoing = self
            .recv_nodes
            .iter()
            .map(|nodes| gather_blocks(values, nodes, block_size))
            .collect();
        let incoming = comm.exchange(outgoing);
        for (nodes, received) in self.send_nodes.iter().zip(incoming) {
            assert_eq!(received.len(), nodes.len() * block_size);
            for (&node, block) in nodes.iter().zip(received.chunks_exact(block_size.max(1))) {
                for (v, r) in values[node * block_size..(node + 1) * block_size]
                    .iter_mut()
                    .zip(block)
                {
                    *v += *r;
                }
            }
        }
    }
}

fn gather_blocks<M: Copy>(values: &[M], nodes: &[usize], block_size: usize) -> Vec<M> {
    let mut buffer = Vec::with_capacity(nodes.len() * block_size);
    for &node in nodes {
        buffer.extend_from_slice(&values[node * block_size..(node + 1) * block_size]);
    }
    buffer
}
