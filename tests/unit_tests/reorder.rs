use fenris_design::reorder::{
    bandwidth, compute_ordering, cuthill_mckee, reverse_cuthill_mckee, InvalidPermutation, Ordering, Permutation,
};
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use proptest::prelude::*;

#[test]
fn cuthill_mckee_basic_examples() {
    // Basic example
    {
        let matrix = DMatrix::from_row_slice(4, 4, &[1, 0, 1, 1, 0, 1, 0, 1, 1, 0, 1, 0, 1, 1, 0, 1]);
        let csr = CsrMatrix::from(&matrix);
        let perm = cuthill_mckee(csr.pattern());

        assert_eq!(perm.perm(), &[1, 3, 0, 2]);

        let mut rcm_expected_perm = perm.clone();
        rcm_expected_perm.reverse();
        assert_eq!(&reverse_cuthill_mckee(csr.pattern()), &rcm_expected_perm);
    }

    // Diagonal pattern
    {
        let matrix = DMatrix::from_row_slice(4, 4, &[1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1]);
        let csr = CsrMatrix::from(&matrix);
        let perm = cuthill_mckee(csr.pattern());
        assert_eq!(perm.perm(), &[0, 1, 2, 3]);
    }
}

#[test]
fn natural_ordering_is_identity() {
    let matrix = DMatrix::from_row_slice(3, 3, &[1, 1, 0, 1, 1, 1, 0, 1, 1]);
    let csr = CsrMatrix::from(&matrix);
    assert_eq!(compute_ordering(Ordering::Natural, csr.pattern()), Permutation::identity(3));
}

#[test]
fn permutation_rejects_non_bijections() {
    assert!(Permutation::from_vec(vec![2, 0, 1]).is_ok());
    assert_eq!(
        Permutation::from_vec(vec![0, 0, 1]),
        Err(InvalidPermutation::Duplicate { position: 1, index: 0 })
    );
    assert_eq!(
        Permutation::from_vec(vec![0, 3, 1]),
        Err(InvalidPermutation::OutOfBounds { position: 1, index: 3, len: 3 })
    );

    let perm = Permutation::from_vec(vec![2, 0, 1]).unwrap();
    assert_eq!(perm.apply_to_slice(&['a', 'b', 'c']), vec!['c', 'a', 'b']);
    assert_eq!(perm.inverse().perm(), &[1, 2, 0]);
    assert!(!perm.is_identity());
    assert!(Permutation::identity(4).is_identity());
}

/// Symmetric pattern of a path graph whose vertices are visited in the given order.
fn shuffled_path(order: &[usize]) -> CsrMatrix<i32> {
    let n = order.len();
    let mut matrix = DMatrix::zeros(n, n);
    for i in 0..n {
        matrix[(order[i], order[i])] = 1;
        if i + 1 < n {
            matrix[(order[i], order[i + 1])] = 1;
            matrix[(order[i + 1], order[i])] = 1;
        }
    }
    CsrMatrix::from(&matrix)
}

proptest! {
    #[test]
    fn reverse_cuthill_mckee_recovers_unit_bandwidth_of_paths(
        order in Just((0..12).collect::<Vec<usize>>()).prop_shuffle()
    ) {
        let csr = shuffled_path(&order);
        let perm = compute_ordering(Ordering::ReverseCuthillMcKee, csr.pattern());
        prop_assert!(Permutation::from_vec(perm.perm().to_vec()).is_ok());

        // Renumber the pattern so that new vertex i is old vertex perm[i]
        let n = order.len();
        let dense = DMatrix::from_fn(n, n, |i, j| csr.get_entry(perm.source_index(i), perm.source_index(j))
            .map(|entry| entry.into_value())
            .unwrap_or(0));
        let reordered = CsrMatrix::from(&dense);
        prop_assert_eq!(bandwidth(reordered.pattern()), 1);
        prop_assert!(bandwidth(csr.pattern()) >= 1);
    }
}
