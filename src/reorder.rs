//! Fill-reducing reordering of the locally owned node numbering.
use nalgebra_sparse::pattern::SparsityPattern;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;

/// Ordering applied to the locally owned nodes of a worker when the connectivity is initialized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Ordering {
    /// Owned nodes are numbered in increasing global order.
    #[default]
    Natural,
    /// Reverse Cuthill-McKee ordering of the owned-node adjacency graph.
    ReverseCuthillMcKee,
}

/// A bijection on `0 .. n`, stored as the source index of every target index:
///
/// ```ignore
/// target[i] = source[perm[i]]
/// ```
///
/// For the owned nodes of a worker, targets are local indices and sources are offsets into the
/// worker's range of global node ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    perm: Vec<usize>,
}

/// Reason why an index array is not a permutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InvalidPermutation {
    OutOfBounds { position: usize, index: usize, len: usize },
    Duplicate { position: usize, index: usize },
}

impl fmt::Display for InvalidPermutation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfBounds { position, index, len } => write!(
                f,
                "Invalid permutation: entry {} is {}, which is out of bounds for length {}",
                position, index, len
            ),
            Self::Duplicate { position, index } => {
                write!(f, "Invalid permutation: index {} appears again at entry {}", index, position)
            }
        }
    }
}

impl Error for InvalidPermutation {}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self { perm: (0..n).collect() }
    }

    /// Checks that `perm` is a bijection on `0 .. perm.len()`.
    pub fn from_vec(perm: Vec<usize>) -> Result<Self, InvalidPermutation> {
        let len = perm.len();
        let mut seen = vec![false; len];
        for (position, &index) in perm.iter().enumerate() {
            match seen.get_mut(index) {
                None => return Err(InvalidPermutation::OutOfBounds { position, index, len }),
                Some(true) => return Err(InvalidPermutation::Duplicate { position, index }),
                Some(seen) => *seen = true,
            }
        }
        Ok(Self { perm })
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn is_identity(&self) -> bool {
        self.perm.iter().enumerate().all(|(i, &j)| i == j)
    }

    /// Reverses the order of the targets.
    pub fn reverse(&mut self) {
        self.perm.reverse()
    }

    pub fn source_index(&self, target_index: usize) -> usize {
        self.perm[target_index]
    }

    pub fn inverse(&self) -> Permutation {
        let mut inverse = vec![0; self.len()];
        for (target, &source) in self.perm.iter().enumerate() {
            inverse[source] = target;
        }
        Self { perm: inverse }
    }

    /// Returns the permuted copy `target[i] = slice[perm[i]]`.
    pub fn apply_to_slice<T: Clone>(&self, slice: &[T]) -> Vec<T> {
        assert_eq!(slice.len(), self.len(), "Slice and permutation must have the same size.");
        self.perm
            .iter()
            .map(|&source| slice[source].clone())
            .collect()
    }
}

/// Cuthill-McKee ordering of the vertices of the graph given by a symmetric sparsity pattern.
///
/// Every connected component is traversed breadth-first from its vertex of least degree, visiting
/// neighbors in order of increasing degree. Components are started in order of their least degree
/// vertex, with ties broken by vertex index.
pub fn cuthill_mckee(pattern: &SparsityPattern) -> Permutation {
    assert_eq!(pattern.major_dim(), pattern.minor_dim(), "Adjacency pattern must be square.");
    let n = pattern.major_dim();
    let degree: Vec<usize> = (0..n).map(|v| pattern.lane(v).len()).collect();

    // Candidate start vertices, stable by index among equal degrees
    let mut candidates: Vec<usize> = (0..n).collect();
    candidates.sort_by_key(|&v| degree[v]);

    let mut order = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    let mut queue = VecDeque::new();
    let mut neighbors = Vec::new();

    for start in candidates {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);
        while let Some(vertex) = queue.pop_front() {
            order.push(vertex);
            neighbors.clear();
            neighbors.extend(
                pattern
                    .lane(vertex)
                    .iter()
                    .copied()
                    .filter(|&w| !visited[w]),
            );
            neighbors.sort_by_key(|&w| degree[w]);
            for &w in &neighbors {
                visited[w] = true;
                queue.push_back(w);
            }
        }
    }

    debug_assert_eq!(order.len(), n);
    Permutation::from_vec(order).expect("Breadth-first traversal visits every vertex exactly once")
}

/// Reverse Cuthill-McKee ordering, which typically has a smaller profile than Cuthill-McKee.
pub fn reverse_cuthill_mckee(pattern: &SparsityPattern) -> Permutation {
    let mut perm = cuthill_mckee(pattern);
    perm.reverse();
    perm
}

/// Computes the permutation of the locally owned nodes for the requested ordering.
///
/// `adjacency` holds the (symmetric) node-to-node adjacency of the owned nodes in natural order.
pub fn compute_ordering(ordering: Ordering, adjacency: &SparsityPattern) -> Permutation {
    match ordering {
        Ordering::Natural => Permutation::identity(adjacency.major_dim()),
        Ordering::ReverseCuthillMcKee => reverse_cuthill_mckee(adjacency),
    }
}

/// Largest distance `|i - j|` over the entries of a pattern.
pub fn bandwidth(pattern: &SparsityPattern) -> usize {
    (0..pattern.major_dim())
        .flat_map(|i| pattern.lane(i).iter().map(move |&j| i.abs_diff(j)))
        .max()
        .unwrap_or(0)
}
