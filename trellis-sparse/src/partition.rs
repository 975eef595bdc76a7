//! Ownership of nodes, degrees of freedom and elements across ranks.
use std::error::Error;
use std::fmt;

/// Structural mismatch between element connectivity and the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// An element references a node that is not covered by the partition.
    UnmappedNode { element: usize, node: usize, num_nodes: usize },
    /// An element has no nodes, so it can not be assigned an owner.
    EmptyElement { element: usize },
    /// A contribution targets a block that is not part of the sparsity pattern.
    MissingBlock { row_node: usize, col_node: usize },
    /// A node owner refers to a rank outside of the group.
    InvalidOwner { node: usize, owner: usize, num_ranks: usize },
    /// The number of elements does not match the partition.
    ElementCountMismatch { expected: usize, actual: usize },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappedNode {
                element,
                node,
                num_nodes,
            } => write!(
                f,
                "Element {} references node {}, but the partition only maps {} nodes.",
                element, node, num_nodes
            ),
            Self::EmptyElement { element } => write!(f, "Element {} has no nodes.", element),
            Self::MissingBlock { row_node, col_node } => write!(
                f,
                "Block ({}, {}) is not part of the sparsity pattern.",
                row_node, col_node
            ),
            Self::InvalidOwner { node, owner, num_ranks } => write!(
                f,
                "Node {} is assigned to rank {}, but there are only {} ranks.",
                node, owner, num_ranks
            ),
            Self::ElementCountMismatch { expected, actual } => {
                write!(f, "Expected {} elements, got {}.", expected, actual)
            }
        }
    }
}

impl Error for PatternError {}

/// Assigns nodes (and with them their degrees of freedom) and elements to ranks.
///
/// Degree of freedom `c` of node `n` has global index `n * vars_per_node + c`. Each rank stores
/// its owned nodes in ascending global order, and the local index of a node is its position in
/// that list. The map is replicated on every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    num_ranks: usize,
    vars_per_node: usize,
    node_owners: Vec<usize>,
    local_indices: Vec<usize>,
    owned_nodes: Vec<Vec<usize>>,
    element_owners: Vec<usize>,
}

impl PartitionMap {
    /// Contiguous-block-cyclic distribution of nodes.
    ///
    /// Nodes are grouped into chunks of `block_size` consecutive ids, and chunk `c` is owned by
    /// rank `c mod num_ranks`.
    pub fn block_cyclic(num_nodes: usize, vars_per_node: usize, block_size: usize, num_ranks: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        assert!(num_ranks > 0, "need at least one rank");
        let owners = (0..num_nodes)
            .map(|node| (node / block_size) % num_ranks)
            .collect();
        Self::from_owners_unchecked(owners, vars_per_node, num_ranks)
    }

    /// Partition with explicitly given node owners.
    pub fn from_node_owners(
        node_owners: Vec<usize>,
        vars_per_node: usize,
        num_ranks: usize,
    ) -> Result<Self, PatternError> {
        if let Some((node, &owner)) = node_owners
            .iter()
            .enumerate()
            .find(|(_, &owner)| owner >= num_ranks)
        {
            return Err(PatternError::InvalidOwner { node, owner, num_ranks });
        }
        Ok(Self::from_owners_unchecked(node_owners, vars_per_node, num_ranks))
    }

    fn from_owners_unchecked(node_owners: Vec<usize>, vars_per_node: usize, num_ranks: usize) -> Self {
        assert!(vars_per_node > 0, "need at least one variable per node");
        let mut owned_nodes = vec![Vec::new(); num_ranks];
        let mut local_indices = Vec::with_capacity(node_owners.len());
        for (node, &owner) in node_owners.iter().enumerate() {
            local_indices.push(owned_nodes[owner].len());
            owned_nodes[owner].push(node);
        }
        Self {
            num_ranks,
            vars_per_node,
            node_owners,
            local_indices,
            owned_nodes,
            element_owners: Vec::new(),
        }
    }

    /// Assigns every element to the owner of its lowest-numbered node.
    ///
    /// Fails if an element is empty or references a node that is not part of the partition.
    pub fn with_elements<C: AsRef<[usize]>>(mut self, connectivity: &[C]) -> Result<Self, PatternError> {
        self.validate_connectivity(connectivity)?;
        self.element_owners = connectivity
            .iter()
            .map(|nodes| {
                let min_node = nodes.as_ref().iter().copied().min().unwrap_or(0);
                self.node_owners[min_node]
            })
            .collect();
        Ok(self)
    }

    /// Checks that every element is non-empty and only references mapped nodes.
    pub fn validate_connectivity<C: AsRef<[usize]>>(&self, connectivity: &[C]) -> Result<(), PatternError> {
        for (element, nodes) in connectivity.iter().enumerate() {
            let nodes = nodes.as_ref();
            if nodes.is_empty() {
                return Err(PatternError::EmptyElement { element });
            }
            if let Some(&node) = nodes.iter().find(|&&node| node >= self.num_nodes()) {
                return Err(PatternError::UnmappedNode {
                    element,
                    node,
                    num_nodes: self.num_nodes(),
                });
            }
        }
        if !self.element_owners.is_empty() && self.element_owners.len() != connectivity.len() {
            return Err(PatternError::ElementCountMismatch {
                expected: self.element_owners.len(),
                actual: connectivity.len(),
            });
        }
        Ok(())
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn vars_per_node(&self) -> usize {
        self.vars_per_node
    }

    pub fn num_nodes(&self) -> usize {
        self.node_owners.len()
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes() * self.vars_per_node
    }

    pub fn num_elements(&self) -> usize {
        self.element_owners.len()
    }

    pub fn node_owner(&self, node: usize) -> usize {
        self.node_owners[node]
    }

    /// Index of the node among the nodes owned by its owner.
    pub fn local_index(&self, node: usize) -> usize {
        self.local_indices[node]
    }

    /// Owner and local index of a global degree of freedom.
    pub fn dof_location(&self, dof: usize) -> (usize, usize) {
        let node = dof / self.vars_per_node;
        let component = dof % self.vars_per_node;
        (
            self.node_owner(node),
            self.local_index(node) * self.vars_per_node + component,
        )
    }

    /// Global ids of the nodes owned by `rank`, ascending.
    pub fn owned_nodes(&self, rank: usize) -> &[usize] {
        &self.owned_nodes[rank]
    }

    pub fn num_owned_dofs(&self, rank: usize) -> usize {
        self.owned_nodes[rank].len() * self.vars_per_node
    }

    pub fn element_owner(&self, element: usize) -> usize {
        self.element_owners[element]
    }

    /// Elements owned by `rank`, in ascending global order.
    pub fn owned_elements(&self, rank: usize) -> Vec<usize> {
        self.element_owners
            .iter()
            .enumerate()
            .filter(|(_, &owner)| owner == rank)
            .map(|(element, _)| element)
            .collect()
    }
}
