use trellis_sparse::{PartitionMap, PatternError};

#[test]
fn block_cyclic_ownership() {
    let partition = PartitionMap::block_cyclic(10, 2, 2, 3);
    let owners: Vec<_> = (0..10).map(|node| partition.node_owner(node)).collect();
    assert_eq!(owners, vec![0, 0, 1, 1, 2, 2, 0, 0, 1, 1]);
    assert_eq!(partition.owned_nodes(0), &[0, 1, 6, 7]);
    assert_eq!(partition.owned_nodes(1), &[2, 3, 8, 9]);
    assert_eq!(partition.owned_nodes(2), &[4, 5]);
    assert_eq!(partition.local_index(6), 2);
    assert_eq!(partition.num_dofs(), 20);
    assert_eq!(partition.num_owned_dofs(0), 8);
    // Degree of freedom 13 is component 1 of node 6
    assert_eq!(partition.dof_location(13), (0, 5));
}

#[test]
fn every_node_has_exactly_one_owner() {
    for num_ranks in 1..5 {
        for block_size in 1..4 {
            let partition = PartitionMap::block_cyclic(13, 1, block_size, num_ranks);
            let mut all: Vec<_> = (0..num_ranks)
                .flat_map(|rank| partition.owned_nodes(rank).to_vec())
                .collect();
            all.sort_unstable();
            assert_eq!(all, (0..13).collect::<Vec<_>>());
        }
    }
}

#[test]
fn explicit_owners_are_validated() {
    let partition = PartitionMap::from_node_owners(vec![1, 0, 1], 1, 2).unwrap();
    assert_eq!(partition.owned_nodes(1), &[0, 2]);
    assert_eq!(partition.local_index(2), 1);

    let err = PartitionMap::from_node_owners(vec![0, 2, 1], 1, 2).unwrap_err();
    assert_eq!(
        err,
        PatternError::InvalidOwner {
            node: 1,
            owner: 2,
            num_ranks: 2
        }
    );
}

#[test]
fn elements_are_owned_by_owner_of_lowest_node() {
    let connectivity = vec![vec![5, 2], vec![0, 1], vec![4, 5]];
    let partition = PartitionMap::block_cyclic(6, 1, 2, 3)
        .with_elements(&connectivity)
        .unwrap();
    assert_eq!(partition.num_elements(), 3);
    assert_eq!(partition.element_owner(0), 1);
    assert_eq!(partition.element_owner(1), 0);
    assert_eq!(partition.element_owner(2), 2);
    assert_eq!(partition.owned_elements(1), vec![0]);
}

#[test]
fn invalid_connectivity_is_rejected() {
    let partition = PartitionMap::block_cyclic(4, 1, 1, 2);

    let err = partition
        .clone()
        .with_elements(&[vec![0, 1], vec![2, 7]])
        .unwrap_err();
    assert_eq!(
        err,
        PatternError::UnmappedNode {
            element: 1,
            node: 7,
            num_nodes: 4
        }
    );

    let err = partition
        .with_elements(&[vec![0, 1], vec![]])
        .unwrap_err();
    assert_eq!(err, PatternError::EmptyElement { element: 1 });
}

#[test]
fn pattern_errors_are_displayed() {
    let err = PatternError::MissingBlock { row_node: 3, col_node: 7 };
    assert_eq!(err.to_string(), "Block (3, 7) is not part of the sparsity pattern.");
}
