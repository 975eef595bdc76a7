//! Local numbering of owned and halo nodes, and the communication plans between them.
use crate::comm::Communicator;
use crate::partition::PartitionMap;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use trellis_traits::Real;

#[derive(Debug, Clone, PartialEq, Eq)]
struct NeighborPlan {
    rank: usize,
    /// Local (extended) node indices, in the order they travel on the wire.
    nodes: Vec<usize>,
}

/// Local layout of a distributed vector on one rank.
///
/// Owned nodes come first, in ascending global order, followed by the halo nodes in ascending
/// global order. The local index of a node in this numbering is called its *extended* index.
#[derive(Debug)]
pub struct VectorLayout {
    comm: Communicator,
    partition: Arc<PartitionMap>,
    halo_nodes: Vec<usize>,
    extended_index: FxHashMap<usize, usize>,
    sends: Vec<NeighborPlan>,
    receives: Vec<NeighborPlan>,
}

impl VectorLayout {
    /// Builds the layout for the calling rank.
    ///
    /// `required_nodes` lists the global nodes this rank needs to read. Nodes owned by the rank
    /// itself are ignored. This is a collective operation.
    pub fn new(
        comm: Communicator,
        partition: Arc<PartitionMap>,
        required_nodes: impl IntoIterator<Item = usize>,
    ) -> Self {
        assert_eq!(
            comm.size(),
            partition.num_ranks(),
            "partition and communicator disagree on the number of ranks"
        );
        let rank = comm.rank();
        let owned = partition.owned_nodes(rank);

        let halo_nodes: Vec<usize> = required_nodes
            .into_iter()
            .filter(|&node| partition.node_owner(node) != rank)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut extended_index = FxHashMap::default();
        extended_index.reserve(owned.len() + halo_nodes.len());
        for (i, &node) in owned.iter().chain(halo_nodes.iter()).enumerate() {
            extended_index.insert(node, i);
        }

        let mut requests = vec![Vec::new(); comm.size()];
        let mut receives: Vec<NeighborPlan> = Vec::new();
        for (h, &node) in halo_nodes.iter().enumerate() {
            let owner = partition.node_owner(node);
            requests[owner].push(node);
            match receives.iter_mut().find(|plan| plan.rank == owner) {
                Some(plan) => plan.nodes.push(owned.len() + h),
                None => receives.push(NeighborPlan {
                    rank: owner,
                    nodes: vec![owned.len() + h],
                }),
            }
        }
        receives.sort_by_key(|plan| plan.rank);

        let incoming = comm.all_to_all(requests);
        let sends = incoming
            .into_iter()
            .enumerate()
            .filter(|(_, requested)| !requested.is_empty())
            .map(|(source, requested)| NeighborPlan {
                rank: source,
                nodes: requested
                    .into_iter()
                    .map(|node| partition.local_index(node))
                    .collect(),
            })
            .collect();

        Self {
            comm,
            partition,
            halo_nodes,
            extended_index,
            sends,
            receives,
        }
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn partition(&self) -> &Arc<PartitionMap> {
        &self.partition
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn vars_per_node(&self) -> usize {
        self.partition.vars_per_node()
    }

    pub fn owned_nodes(&self) -> &[usize] {
        self.partition.owned_nodes(self.rank())
    }

    pub fn halo_nodes(&self) -> &[usize] {
        &self.halo_nodes
    }

    pub fn num_owned_nodes(&self) -> usize {
        self.owned_nodes().len()
    }

    pub fn num_extended_nodes(&self) -> usize {
        self.num_owned_nodes() + self.halo_nodes.len()
    }

    pub fn num_owned_dofs(&self) -> usize {
        self.num_owned_nodes() * self.vars_per_node()
    }

    pub fn num_extended_dofs(&self) -> usize {
        self.num_extended_nodes() * self.vars_per_node()
    }

    /// Global id of the node with the given extended index.
    pub fn global_node(&self, extended: usize) -> usize {
        let n_owned = self.num_owned_nodes();
        if extended < n_owned {
            self.owned_nodes()[extended]
        } else {
            self.halo_nodes[extended - n_owned]
        }
    }

    /// Extended index of a global node, if the node is owned or part of the halo.
    pub fn extended_node(&self, global_node: usize) -> Option<usize> {
        self.extended_index.get(&global_node).copied()
    }

    /// Extended index of a global degree of freedom.
    pub fn extended_dof(&self, global_dof: usize) -> Option<usize> {
        let vpn = self.vars_per_node();
        self.extended_node(global_dof / vpn)
            .map(|node| node * vpn + global_dof % vpn)
    }

    /// Local index of a global degree of freedom if it is owned by this rank.
    pub fn owned_dof(&self, global_dof: usize) -> Option<usize> {
        self.extended_dof(global_dof)
            .filter(|&local| local < self.num_owned_dofs())
    }

    /// Global index of the degree of freedom with the given extended index.
    pub fn global_dof(&self, extended_dof: usize) -> usize {
        let vpn = self.vars_per_node();
        self.global_node(extended_dof / vpn) * vpn + extended_dof % vpn
    }

    /// Whether two layouts describe the same distribution.
    pub fn is_compatible_with(&self, other: &VectorLayout) -> bool {
        std::ptr::eq(self, other)
            || (self.partition == other.partition
                && self.halo_nodes == other.halo_nodes
                && self.rank() == other.rank())
    }

    /// Copies owned values into the halo slots of the ranks that require them.
    ///
    /// `values` holds `chunk` entries per extended node. This is a collective operation.
    pub fn update_halo<M: Clone + Send + 'static>(&self, values: &mut [M], chunk: usize) {
        assert_eq!(values.len(), self.num_extended_nodes() * chunk);
        let outgoing = self
            .sends
            .iter()
            .map(|plan| {
                let message: Vec<M> = plan
                    .nodes
                    .iter()
                    .flat_map(|&node| values[node * chunk..(node + 1) * chunk].iter().cloned())
                    .collect();
                (plan.rank, message)
            })
            .collect();
        let sources: Vec<usize> = self.receives.iter().map(|plan| plan.rank).collect();
        let incoming = self.comm.exchange(outgoing, &sources);
        for (plan, message) in self.receives.iter().zip(incoming) {
            debug_assert_eq!(message.len(), plan.nodes.len() * chunk);
            for (&node, data) in plan.nodes.iter().zip(message.chunks(chunk)) {
                values[node * chunk..(node + 1) * chunk].clone_from_slice(data);
            }
        }
    }

    /// Adds the halo slots into the owned slots of their owners and clears the halo.
    ///
    /// Remote contributions are added in ascending source rank order. This is a collective
    /// operation.
    pub fn accumulate_halo<T: Real>(&self, values: &mut [T], chunk: usize) {
        assert_eq!(values.len(), self.num_extended_nodes() * chunk);
        let outgoing = self
            .receives
            .iter()
            .map(|plan| {
                let message: Vec<T> = plan
                    .nodes
                    .iter()
                    .flat_map(|&node| values[node * chunk..(node + 1) * chunk].iter().copied())
                    .collect();
                (plan.rank, message)
            })
            .collect();
        let sources: Vec<usize> = self.sends.iter().map(|plan| plan.rank).collect();
        let incoming = self.comm.exchange(outgoing, &sources);
        for (plan, message) in self.sends.iter().zip(incoming) {
            for (&node, data) in plan.nodes.iter().zip(message.chunks(chunk)) {
                for (target, &value) in values[node * chunk..(node + 1) * chunk]
                    .iter_mut()
                    .zip(data)
                {
                    *target += value;
                }
            }
        }
        let halo_start = self.num_owned_nodes() * chunk;
        values[halo_start..].fill(T::zero());
    }
}
