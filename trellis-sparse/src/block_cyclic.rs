//! Distributed sparse matrix with node-level blocks.
use crate::comm::Communicator;
use crate::layout::VectorLayout;
use crate::partition::{PartitionMap, PatternError};
use crate::vector::{DistVector, Synced};
use nalgebra::{DMatrix, DMatrixView, DVector};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use std::collections::BTreeSet;
use std::sync::Arc;
use trellis_traits::Real;

/// Blocks destined for rows owned by another rank, waiting for the next flush.
#[derive(Debug, Clone)]
struct OutgoingBlocks<T> {
    /// Global (row node, column node) pairs.
    blocks: Vec<(usize, usize)>,
    /// Row-major block values, `vars_per_node^2` per block.
    values: Vec<T>,
}

impl<T> Default for OutgoingBlocks<T> {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// A sparse matrix whose block rows are distributed according to a [`PartitionMap`].
///
/// Each rank stores the rows of its owned degrees of freedom as a CSR matrix whose columns are
/// the extended (owned + halo) degrees of freedom of the associated [`VectorLayout`]. A block
/// `(a, b)` of size `vars_per_node x vars_per_node` exists if and only if some element couples
/// nodes `a` and `b`, or `a == b`.
#[derive(Debug, Clone)]
pub struct BlockCyclicMatrix<T: Real> {
    layout: Arc<VectorLayout>,
    node_offsets: Vec<usize>,
    node_columns: Vec<usize>,
    local: CsrMatrix<T>,
    outgoing: Vec<OutgoingBlocks<T>>,
}

impl<T: Real> BlockCyclicMatrix<T> {
    /// Computes the block pattern induced by the element connectivity.
    ///
    /// Every rank visits the elements it owns. Couplings of rows owned by other ranks are sent to
    /// their owners, so each rank ends up with the complete pattern of its rows. This is a
    /// collective operation.
    pub fn initialize<C: AsRef<[usize]>>(
        comm: Communicator,
        partition: Arc<PartitionMap>,
        connectivity: &[C],
    ) -> Result<Self, PatternError> {
        partition.validate_connectivity(connectivity)?;
        if partition.num_elements() != connectivity.len() {
            return Err(PatternError::ElementCountMismatch {
                expected: partition.num_elements(),
                actual: connectivity.len(),
            });
        }

        let rank = comm.rank();
        let mut local_pairs = BTreeSet::new();
        let mut remote_pairs = vec![Vec::new(); comm.size()];
        let mut required_nodes = BTreeSet::new();

        for &node in partition.owned_nodes(rank) {
            local_pairs.insert((node, node));
        }

        for element in partition.owned_elements(rank) {
            let nodes = connectivity[element].as_ref();
            for &a in nodes {
                required_nodes.insert(a);
                let owner = partition.node_owner(a);
                for &b in nodes {
                    if owner == rank {
                        local_pairs.insert((a, b));
                    } else {
                        remote_pairs[owner].push((a, b));
                    }
                }
            }
        }

        for pairs in &mut remote_pairs {
            pairs.sort_unstable();
            pairs.dedup();
        }

        for pairs in comm.all_to_all(remote_pairs) {
            local_pairs.extend(pairs);
        }
        required_nodes.extend(local_pairs.iter().map(|&(_, b)| b));

        let layout = Arc::new(VectorLayout::new(comm, partition.clone(), required_nodes));
        let mut rows = vec![Vec::new(); layout.num_owned_nodes()];
        for (a, b) in local_pairs {
            let col = layout
                .extended_node(b)
                .expect("every column node is part of the layout");
            rows[partition.local_index(a)].push(col);
        }

        Ok(Self::from_node_pattern(layout, rows))
    }

    /// Creates a zero matrix from a node-level pattern.
    ///
    /// `rows[i]` lists the extended column node indices of owned node `i`.
    pub fn from_node_pattern(layout: Arc<VectorLayout>, mut rows: Vec<Vec<usize>>) -> Self {
        assert_eq!(rows.len(), layout.num_owned_nodes());
        let vpn = layout.vars_per_node();

        let mut node_offsets = Vec::with_capacity(rows.len() + 1);
        let mut node_columns = Vec::new();
        node_offsets.push(0);
        for row in &mut rows {
            row.sort_unstable();
            row.dedup();
            node_columns.extend_from_slice(row);
            node_offsets.push(node_columns.len());
        }

        let mut offsets = Vec::with_capacity(layout.num_owned_dofs() + 1);
        let mut column_indices = Vec::with_capacity(node_columns.len() * vpn * vpn);
        offsets.push(0);
        for row in &rows {
            for _ in 0..vpn {
                for &j in row {
                    column_indices.extend((0..vpn).map(|c| j * vpn + c));
                }
                offsets.push(column_indices.len());
            }
        }

        let nnz = column_indices.len();
        let pattern = SparsityPattern::try_from_offsets_and_indices(
            layout.num_owned_dofs(),
            layout.num_extended_dofs(),
            offsets,
            column_indices,
        )
        .expect("block pattern is sorted and within bounds");
        let local = CsrMatrix::try_from_pattern_and_values(pattern, vec![T::zero(); nnz])
            .expect("values match the pattern");

        let outgoing = (0..layout.comm().size())
            .map(|_| OutgoingBlocks::default())
            .collect();

        Self {
            layout,
            node_offsets,
            node_columns,
            local,
            outgoing,
        }
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        &self.layout
    }

    pub fn vars_per_node(&self) -> usize {
        self.layout.vars_per_node()
    }

    /// The rows owned by this rank, with columns in extended local numbering.
    pub fn local(&self) -> &CsrMatrix<T> {
        &self.local
    }

    pub fn local_values_mut(&mut self) -> &mut [T] {
        self.local.values_mut()
    }

    /// Extended column node indices of the blocks in owned block row `row_node`.
    pub fn block_columns(&self, row_node: usize) -> &[usize] {
        &self.node_columns[self.node_offsets[row_node]..self.node_offsets[row_node + 1]]
    }

    /// Index into the local value array of entry `(r, c)` of block `(row_node, col_node)`.
    ///
    /// Both nodes are given by extended local index, and `row_node` must be owned.
    pub fn value_index(&self, row_node: usize, col_node: usize, r: usize, c: usize) -> Option<usize> {
        let vpn = self.vars_per_node();
        let position = self.block_columns(row_node).binary_search(&col_node).ok()?;
        Some(self.local.row_offsets()[row_node * vpn + r] + position * vpn + c)
    }

    /// Number of block rows in the global matrix.
    pub fn num_block_rows(&self) -> usize {
        self.layout.partition().num_nodes()
    }

    pub fn zero(&mut self) {
        self.local.values_mut().fill(T::zero());
        for outgoing in &mut self.outgoing {
            outgoing.blocks.clear();
            outgoing.values.clear();
        }
    }

    /// Adds an element matrix for the given global nodes.
    ///
    /// Blocks in rows owned by this rank are added immediately. Blocks in rows owned by other
    /// ranks are buffered until the next [`finalize_assembly`](Self::finalize_assembly).
    /// Nothing is added if any local block is missing from the pattern.
    pub fn add_element_contribution(&mut self, nodes: &[usize], element_matrix: DMatrixView<T>) -> Result<(), PatternError> {
        let vpn = self.vars_per_node();
        assert_eq!(element_matrix.nrows(), nodes.len() * vpn);
        assert_eq!(element_matrix.ncols(), nodes.len() * vpn);

        let partition = self.layout.partition().clone();
        let rank = self.layout.rank();
        for &node in nodes {
            if node >= partition.num_nodes() {
                return Err(PatternError::MissingBlock {
                    row_node: node,
                    col_node: node,
                });
            }
        }

        // Validate before touching any value
        let mut positions = Vec::with_capacity(nodes.len() * nodes.len());
        for &a in nodes.iter().filter(|&&a| partition.node_owner(a) == rank) {
            let i = partition.local_index(a);
            for &b in nodes {
                let position = self
                    .layout
                    .extended_node(b)
                    .and_then(|j| self.value_index(i, j, 0, 0))
                    .ok_or(PatternError::MissingBlock {
                        row_node: a,
                        col_node: b,
                    })?;
                positions.push(position);
            }
        }

        let mut positions = positions.into_iter();
        for (ia, &a) in nodes.iter().enumerate() {
            let owner = partition.node_owner(a);
            if owner == rank {
                let i = partition.local_index(a);
                for ib in 0..nodes.len() {
                    let base = positions.next().expect("one position per local block");
                    for r in 0..vpn {
                        let row_start = base + self.local.row_offsets()[i * vpn + r] - self.local.row_offsets()[i * vpn];
                        let values = self.local.values_mut();
                        for c in 0..vpn {
                            values[row_start + c] += element_matrix[(ia * vpn + r, ib * vpn + c)];
                        }
                    }
                }
            } else {
                let outgoing = &mut self.outgoing[owner];
                for (ib, &b) in nodes.iter().enumerate() {
                    outgoing.blocks.push((a, b));
                    for r in 0..vpn {
                        for c in 0..vpn {
                            outgoing
                                .values
                                .push(element_matrix[(ia * vpn + r, ib * vpn + c)]);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes buffered blocks to the ranks that own their rows.
    ///
    /// Received blocks are added in ascending source rank order, and in insertion order for each
    /// source, which makes the result reproducible for a fixed partition. If any rank receives a
    /// block outside of its pattern, every rank returns the same error and no received block
    /// is applied. This is a collective operation.
    pub fn finalize_assembly(&mut self) -> Result<(), PatternError> {
        let size = self.layout.comm().size();
        let outgoing = std::mem::replace(
            &mut self.outgoing,
            (0..size).map(|_| OutgoingBlocks::default()).collect(),
        );
        let incoming = self.layout.comm().all_to_all(outgoing);

        let partition = self.layout.partition().clone();
        let rank = self.layout.rank();
        let mut error = None;
        let mut bases = Vec::new();
        'validate: for message in &incoming {
            for &(a, b) in &message.blocks {
                let base = if partition.node_owner(a) == rank {
                    self.layout
                        .extended_node(b)
                        .and_then(|j| self.value_index(partition.local_index(a), j, 0, 0))
                } else {
                    None
                };
                match base {
                    Some(base) => bases.push((partition.local_index(a), base)),
                    None => {
                        error = Some(PatternError::MissingBlock {
                            row_node: a,
                            col_node: b,
                        });
                        break 'validate;
                    }
                }
            }
        }

        let errors = self.layout.comm().all_gather(error);
        if let Some(error) = errors.into_iter().flatten().next() {
            return Err(error);
        }

        let vpn = self.vars_per_node();
        let block_size = vpn * vpn;
        let mut bases = bases.into_iter();
        for message in &incoming {
            for block_values in message.values.chunks(block_size) {
                let (i, base) = bases.next().expect("one base per received block");
                for r in 0..vpn {
                    let row_start = base + self.local.row_offsets()[i * vpn + r] - self.local.row_offsets()[i * vpn];
                    let values = self.local.values_mut();
                    for c in 0..vpn {
                        values[row_start + c] += block_values[r * vpn + c];
                    }
                }
            }
        }
        Ok(())
    }

    /// Computes `y = beta * y + alpha * A x` on the owned part of `y`.
    ///
    /// The halo of `y` is left untouched and must be considered stale.
    pub fn spmv(&self, beta: T, y: &mut DistVector<T>, alpha: T, x: &Synced<T>) {
        debug_assert!(self.layout.is_compatible_with(x.layout()));
        debug_assert!(self.layout.is_compatible_with(y.layout()));
        let x_extended = x.extended();
        let mut y_owned = y.owned_mut();
        spmm_csr_dense(beta, &mut y_owned, alpha, Op::NoOp(&self.local), Op::NoOp(&x_extended));
    }

    /// Computes `y = A x`.
    pub fn multiply(&self, x: &Synced<T>, y: &mut DistVector<T>) {
        self.spmv(T::zero(), y, T::one(), x);
    }

    /// Computes `y = A^T x`. This is a collective operation.
    pub fn transpose_multiply(&self, x: &DistVector<T>, y: &mut DistVector<T>) {
        let mut z = DVector::zeros(self.layout.num_extended_dofs());
        let x_owned = x.owned();
        spmm_csr_dense(T::zero(), &mut z, T::one(), Op::Transpose(&self.local), Op::NoOp(&x_owned));
        self.layout
            .accumulate_halo(z.as_mut_slice(), self.vars_per_node());
        let n = self.layout.num_owned_dofs();
        y.owned_mut().copy_from(&z.rows(0, n));
    }

    /// Diagonal entries of the owned rows.
    pub fn extract_diagonal(&self) -> DVector<T> {
        DVector::from_fn(self.layout.num_owned_dofs(), |k, _| {
            let row = self.local.row(k);
            // Owned degrees of freedom come first in the extended numbering
            match row.col_indices().binary_search(&k) {
                Ok(position) => row.values()[position],
                Err(_) => T::zero(),
            }
        })
    }

    /// Sum of absolute values in each owned row.
    pub fn abs_row_sums(&self) -> DVector<T> {
        DVector::from_fn(self.layout.num_owned_dofs(), |k, _| {
            self.local
                .row(k)
                .values()
                .iter()
                .fold(T::zero(), |sum, v| sum + v.abs())
        })
    }

    /// Sum of absolute values in each owned column. This is a collective operation.
    pub fn abs_column_sums(&self) -> DVector<T> {
        let mut sums = vec![T::zero(); self.layout.num_extended_dofs()];
        for (_, col, value) in self.local.triplet_iter() {
            sums[col] += value.abs();
        }
        self.layout
            .accumulate_halo(&mut sums, self.vars_per_node());
        DVector::from_iterator(
            self.layout.num_owned_dofs(),
            sums.into_iter().take(self.layout.num_owned_dofs()),
        )
    }

    /// Zeroes rows and columns of the given global degrees of freedom and puts `diagonal` on
    /// their diagonal.
    ///
    /// Every rank must pass the same set. Symmetry of the matrix is preserved.
    pub fn apply_boundary_conditions(&mut self, dofs: &[usize], diagonal: T) {
        let mut constrained = vec![false; self.layout.num_extended_dofs()];
        for &dof in dofs {
            if let Some(local) = self.layout.extended_dof(dof) {
                constrained[local] = true;
            }
        }

        for k in 0..self.layout.num_owned_dofs() {
            let mut row = self.local.row_mut(k);
            let (cols, values) = row.cols_and_values_mut();
            if constrained[k] {
                for (&col, value) in cols.iter().zip(values.iter_mut()) {
                    *value = if col == k { diagonal } else { T::zero() };
                }
            } else {
                for (&col, value) in cols.iter().zip(values.iter_mut()) {
                    if constrained[col] {
                        *value = T::zero();
                    }
                }
            }
        }
    }

    /// Entry at global position `(row, col)` if the row is owned by this rank.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        let local_row = self.layout.owned_dof(row)?;
        let local_col = self.layout.extended_dof(col)?;
        let row = self.local.row(local_row);
        row.col_indices()
            .binary_search(&local_col)
            .ok()
            .map(|position| row.values()[position])
    }

    /// Gathers the full matrix as a dense matrix on every rank.
    ///
    /// Intended for diagnostics, tests and small coarse problems. This is a collective
    /// operation.
    pub fn to_dense(&self) -> DMatrix<T> {
        let triplets: Vec<(usize, usize, T)> = self
            .local
            .triplet_iter()
            .map(|(i, j, &v)| (self.layout.global_dof(i), self.layout.global_dof(j), v))
            .collect();
        let n = self.layout.partition().num_dofs();
        let mut dense = DMatrix::zeros(n, n);
        for rank_triplets in self.layout.comm().all_gather(triplets) {
            for (i, j, v) in rank_triplets {
                dense[(i, j)] += v;
            }
        }
        dense
    }
}
