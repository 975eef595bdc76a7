//! Aggregation multigrid hierarchy used as a preconditioner for the Krylov solvers.
//!
//! Aggregates never cross rank boundaries, which keeps restriction and prolongation local to
//! each rank. Coarse operators are formed by the Galerkin product `P^T A P` with a
//! piecewise-constant prolongation `P`, and the coarsest level is solved directly after
//! gathering it on every rank.
use crate::block_cyclic::BlockCyclicMatrix;
use crate::krylov::{apply_operator, LinearOperator};
use crate::layout::VectorLayout;
use crate::partition::{PartitionMap, PatternError};
use crate::vector::{DistVector, Synced};
use log::debug;
use nalgebra::linalg::LU;
use nalgebra::{DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use trellis_traits::{from_f64, Real};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleType {
    V,
    F,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultigridSettings {
    pub cycle: CycleType,
    pub pre_smooth: usize,
    pub post_smooth: usize,
    /// Relaxation weight of the l1-Jacobi smoother.
    pub smoother_weight: f64,
    /// Maximum number of levels, including the finest.
    pub max_levels: usize,
    /// Coarsening stops once a level has at most this many block rows.
    pub coarse_size: usize,
}

impl Default for MultigridSettings {
    fn default() -> Self {
        Self {
            cycle: CycleType::V,
            pre_smooth: 2,
            post_smooth: 2,
            smoother_weight: 1.0,
            max_levels: 10,
            coarse_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MultigridError {
    Pattern(PatternError),
    SingularCoarseMatrix { size: usize },
}

impl fmt::Display for MultigridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(err) => write!(f, "Failed to build coarse level: {}", err),
            Self::SingularCoarseMatrix { size } => {
                write!(f, "Coarsest matrix ({} x {}) is singular.", size, size)
            }
        }
    }
}

impl Error for MultigridError {}

impl From<PatternError> for MultigridError {
    fn from(err: PatternError) -> Self {
        Self::Pattern(err)
    }
}

/// Rank-local grouping of fine nodes into coarse nodes.
#[derive(Debug, Clone)]
struct Aggregation {
    /// Local coarse node of each owned fine node.
    aggregate_of: Vec<usize>,
    num_aggregates: usize,
}

impl Aggregation {
    /// Greedy aggregation over the owned part of the block graph.
    ///
    /// A node whose owned neighbors are all free starts a new aggregate with them. Remaining
    /// nodes join the aggregate of their first aggregated neighbor.
    fn from_matrix<T: Real>(matrix: &BlockCyclicMatrix<T>) -> Self {
        let n = matrix.layout().num_owned_nodes();
        let unassigned = usize::MAX;
        let mut aggregate_of = vec![unassigned; n];
        let mut num_aggregates = 0;

        let owned_neighbors = move |i: usize| {
            matrix
                .block_columns(i)
                .iter()
                .copied()
                .filter(move |&j| j < n)
        };

        for i in 0..n {
            if aggregate_of[i] == unassigned && owned_neighbors(i).all(|j| aggregate_of[j] == unassigned) {
                aggregate_of[i] = num_aggregates;
                for j in owned_neighbors(i) {
                    aggregate_of[j] = num_aggregates;
                }
                num_aggregates += 1;
            }
        }

        let seeded = aggregate_of.clone();
        for i in 0..n {
            if aggregate_of[i] == unassigned {
                aggregate_of[i] = match owned_neighbors(i).find(|&j| seeded[j] != unassigned) {
                    Some(j) => seeded[j],
                    None => {
                        num_aggregates += 1;
                        num_aggregates - 1
                    }
                };
            }
        }

        Self {
            aggregate_of,
            num_aggregates,
        }
    }

    /// `coarse += P^T fine` on owned values.
    fn restrict<T: Real>(&self, fine: &DistVector<T>, coarse: &mut DistVector<T>) {
        let vpn = fine.layout().vars_per_node();
        let fine = fine.owned();
        let mut coarse = coarse.owned_mut();
        for (i, &aggregate) in self.aggregate_of.iter().enumerate() {
            for c in 0..vpn {
                coarse[aggregate * vpn + c] += fine[i * vpn + c];
            }
        }
    }

    /// `fine += P coarse` on owned values.
    fn prolongate_add<T: Real>(&self, coarse: &DistVector<T>, fine: &mut DistVector<T>) {
        let vpn = fine.layout().vars_per_node();
        let coarse = coarse.owned();
        let mut fine = fine.owned_mut();
        for (i, &aggregate) in self.aggregate_of.iter().enumerate() {
            for c in 0..vpn {
                fine[i * vpn + c] += coarse[aggregate * vpn + c];
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Smoother<T: Real> {
    inverse_row_sums: DVector<T>,
    inverse_column_sums: DVector<T>,
}

impl<T: Real> Smoother<T> {
    /// l1-Jacobi scaling from absolute row and column sums. Collective.
    fn new(matrix: &BlockCyclicMatrix<T>) -> Self {
        let invert = |s: T| if s == T::zero() { T::zero() } else { T::one() / s };
        Self {
            inverse_row_sums: matrix.abs_row_sums().map(invert),
            inverse_column_sums: matrix.abs_column_sums().map(invert),
        }
    }
}

#[derive(Debug, Clone)]
struct CoarseLevel<T: Real> {
    aggregation: Aggregation,
    /// Coarse value index of every local value of the finer matrix.
    value_map: Vec<usize>,
    matrix: BlockCyclicMatrix<T>,
    smoother: Smoother<T>,
}

impl<T: Real> CoarseLevel<T> {
    /// Builds the Galerkin coarse operator of `fine` for the given aggregation. Collective.
    fn new(fine: &BlockCyclicMatrix<T>, aggregation: Aggregation) -> Result<Self, MultigridError> {
        let fine_layout = fine.layout();
        let comm = fine_layout.comm().clone();
        let vpn = fine_layout.vars_per_node();

        let counts = comm.all_gather(aggregation.num_aggregates);
        let offset: usize = counts[..comm.rank()].iter().sum();
        let owners = counts
            .iter()
            .enumerate()
            .flat_map(|(rank, &count)| std::iter::repeat(rank).take(count))
            .collect();
        let partition = Arc::new(PartitionMap::from_node_owners(owners, vpn, comm.size())?);

        // Global coarse node of every extended fine node
        let mut global_aggregates = vec![0; fine_layout.num_extended_nodes()];
        for (i, &aggregate) in aggregation.aggregate_of.iter().enumerate() {
            global_aggregates[i] = offset + aggregate;
        }
        fine_layout.update_halo(&mut global_aggregates, 1);

        let n_owned = fine_layout.num_owned_nodes();
        let aggregates = &global_aggregates;
        let required: Vec<usize> = (0..n_owned)
            .flat_map(|i| fine.block_columns(i).iter().map(move |&j| aggregates[j]))
            .collect();
        let layout = Arc::new(VectorLayout::new(comm, partition, required));

        let mut rows = vec![Vec::new(); aggregation.num_aggregates];
        for i in 0..n_owned {
            let coarse_row = aggregation.aggregate_of[i];
            for &j in fine.block_columns(i) {
                let coarse_col = layout
                    .extended_node(global_aggregates[j])
                    .expect("coarse column is part of the coarse layout");
                rows[coarse_row].push(coarse_col);
            }
        }
        let matrix = BlockCyclicMatrix::from_node_pattern(layout.clone(), rows);

        let mut value_map = vec![0; fine.local().nnz()];
        for i in 0..n_owned {
            let coarse_row = aggregation.aggregate_of[i];
            for &j in fine.block_columns(i) {
                let coarse_col = layout
                    .extended_node(global_aggregates[j])
                    .expect("coarse column is part of the coarse layout");
                for r in 0..vpn {
                    for c in 0..vpn {
                        let fine_index = fine
                            .value_index(i, j, r, c)
                            .expect("block is part of the fine pattern");
                        value_map[fine_index] = matrix
                            .value_index(coarse_row, coarse_col, r, c)
                            .expect("block is part of the coarse pattern");
                    }
                }
            }
        }

        let smoother = Smoother {
            inverse_row_sums: DVector::zeros(layout.num_owned_dofs()),
            inverse_column_sums: DVector::zeros(layout.num_owned_dofs()),
        };
        let mut level = Self {
            aggregation,
            value_map,
            matrix,
            smoother,
        };
        level.update(fine);
        Ok(level)
    }

    /// Recomputes coarse values from the finer matrix. Collective.
    fn update(&mut self, fine: &BlockCyclicMatrix<T>) {
        let values = self.matrix.local_values_mut();
        values.fill(T::zero());
        for (&target, &value) in self.value_map.iter().zip(fine.local().values()) {
            values[target] += value;
        }
        self.smoother = Smoother::new(&self.matrix);
    }
}

/// Replicated dense factorization of the coarsest level.
#[derive(Debug, Clone)]
struct DirectSolver<T: Real> {
    lu: LU<T, Dyn, Dyn>,
    lu_transpose: LU<T, Dyn, Dyn>,
}

impl<T: Real> DirectSolver<T> {
    fn new(matrix: &BlockCyclicMatrix<T>) -> Result<Self, MultigridError> {
        let dense = matrix.to_dense();
        let size = dense.nrows();
        let lu_transpose = LU::new(dense.transpose());
        let lu = LU::new(dense);
        if !lu.is_invertible() {
            return Err(MultigridError::SingularCoarseMatrix { size });
        }
        Ok(Self { lu, lu_transpose })
    }

    fn solve(&self, b: &DistVector<T>, x: &mut DistVector<T>, transposed: bool) -> Result<(), Box<dyn Error>> {
        let rhs = b.gather();
        let size = rhs.len();
        let factorization = if transposed { &self.lu_transpose } else { &self.lu };
        let solution = factorization
            .solve(&rhs)
            .ok_or(MultigridError::SingularCoarseMatrix { size })?;
        let layout = x.layout().clone();
        let mut owned = x.owned_mut();
        for k in 0..layout.num_owned_dofs() {
            owned[k] = solution[layout.global_dof(k)];
        }
        Ok(())
    }
}

/// Levels, transfer operators and smoothers derived from an assembled fine matrix.
///
/// The structure is built once for a given pattern. After the fine matrix has been
/// re-assembled, [`update`](Self::update) refreshes all coarse values.
#[derive(Debug, Clone)]
pub struct MultigridHierarchy<T: Real> {
    settings: MultigridSettings,
    fine_smoother: Smoother<T>,
    levels: Vec<CoarseLevel<T>>,
    coarse_solver: DirectSolver<T>,
}

impl<T: Real> MultigridHierarchy<T> {
    /// Builds the hierarchy for `fine`. This is a collective operation.
    pub fn build(fine: &BlockCyclicMatrix<T>, settings: MultigridSettings) -> Result<Self, MultigridError> {
        let comm = fine.layout().comm().clone();
        let mut levels: Vec<CoarseLevel<T>> = Vec::new();
        loop {
            let current = levels.last().map(|level| &level.matrix).unwrap_or(fine);
            let rows = current.num_block_rows();
            if levels.len() + 1 >= settings.max_levels || rows <= settings.coarse_size {
                break;
            }
            let aggregation = Aggregation::from_matrix(current);
            let coarse_rows = comm.all_reduce_sum_usize(aggregation.num_aggregates);
            if coarse_rows >= rows {
                break;
            }
            debug!("Multigrid level {}: {} -> {} block rows", levels.len() + 1, rows, coarse_rows);
            let level = CoarseLevel::new(current, aggregation)?;
            levels.push(level);
        }

        let coarsest = levels.last().map(|level| &level.matrix).unwrap_or(fine);
        let coarse_solver = DirectSolver::new(coarsest)?;
        Ok(Self {
            settings,
            fine_smoother: Smoother::new(fine),
            levels,
            coarse_solver,
        })
    }

    /// Refreshes all levels after the values of `fine` changed. This is a collective
    /// operation.
    pub fn update(&mut self, fine: &BlockCyclicMatrix<T>) -> Result<(), MultigridError> {
        self.fine_smoother = Smoother::new(fine);
        for k in 0..self.levels.len() {
            let (finer, coarser) = self.levels.split_at_mut(k);
            let parent = finer.last().map(|level| &level.matrix).unwrap_or(fine);
            coarser[0].update(parent);
        }
        let coarsest = self.levels.last().map(|level| &level.matrix).unwrap_or(fine);
        self.coarse_solver = DirectSolver::new(coarsest)?;
        Ok(())
    }

    /// Number of levels, including the finest.
    pub fn num_levels(&self) -> usize {
        self.levels.len() + 1
    }

    pub fn settings(&self) -> &MultigridSettings {
        &self.settings
    }

    /// A preconditioner approximating the inverse of `fine_operator`.
    ///
    /// `fine_operator` is used for residuals on the finest level and may be matrix-free; it
    /// must represent the matrix this hierarchy was built from.
    pub fn preconditioner<'a>(&'a self, fine_operator: &'a dyn LinearOperator<T>) -> MultigridPreconditioner<'a, T> {
        MultigridPreconditioner {
            hierarchy: self,
            fine_operator,
            transposed: false,
        }
    }

    /// A preconditioner approximating the inverse of the transpose.
    ///
    /// `fine_operator` must apply the transpose of the fine matrix.
    pub fn transposed_preconditioner<'a>(
        &'a self,
        fine_operator: &'a dyn LinearOperator<T>,
    ) -> MultigridPreconditioner<'a, T> {
        MultigridPreconditioner {
            hierarchy: self,
            fine_operator,
            transposed: true,
        }
    }
}

/// One multigrid cycle per application.
pub struct MultigridPreconditioner<'a, T: Real> {
    hierarchy: &'a MultigridHierarchy<T>,
    fine_operator: &'a dyn LinearOperator<T>,
    transposed: bool,
}

impl<'a, T: Real> MultigridPreconditioner<'a, T> {
    fn apply_level(&self, level: usize, y: &mut DistVector<T>, x: &mut DistVector<T>) -> Result<(), Box<dyn Error>> {
        if level == 0 {
            apply_operator(y, self.fine_operator, x)
        } else {
            let matrix = &self.hierarchy.levels[level - 1].matrix;
            if self.transposed {
                matrix.transpose_multiply(x, y);
            } else {
                matrix.multiply(&x.synchronize(), y);
            }
            Ok(())
        }
    }

    fn smoother(&self, level: usize) -> &DVector<T> {
        let smoother = if level == 0 {
            &self.hierarchy.fine_smoother
        } else {
            &self.hierarchy.levels[level - 1].smoother
        };
        if self.transposed {
            &smoother.inverse_column_sums
        } else {
            &smoother.inverse_row_sums
        }
    }

    fn smooth(
        &self,
        level: usize,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
        r: &mut DistVector<T>,
        sweeps: usize,
    ) -> Result<(), Box<dyn Error>> {
        let weight = from_f64::<T>(self.hierarchy.settings.smoother_weight);
        let inverse_sums = self.smoother(level);
        for _ in 0..sweeps {
            // r = b - A x
            self.apply_level(level, r, x)?;
            r.axpy(T::one(), b, -T::one());
            x.owned_mut()
                .zip_zip_apply(&r.owned(), inverse_sums, |x_i, r_i, d_i| *x_i += weight * d_i * r_i);
        }
        Ok(())
    }

    fn residual(&self, level: usize, b: &DistVector<T>, x: &mut DistVector<T>, r: &mut DistVector<T>) -> Result<(), Box<dyn Error>> {
        self.apply_level(level, r, x)?;
        r.axpy(T::one(), b, -T::one());
        Ok(())
    }

    fn cycle(&self, level: usize, cycle: CycleType, b: &DistVector<T>, x: &mut DistVector<T>) -> Result<(), Box<dyn Error>> {
        let levels = &self.hierarchy.levels;
        if level == levels.len() {
            return self.hierarchy.coarse_solver.solve(b, x, self.transposed);
        }

        let settings = &self.hierarchy.settings;
        let mut r = DistVector::zeros(b.layout().clone());
        x.fill(T::zero());
        self.smooth(level, b, x, &mut r, settings.pre_smooth)?;
        self.residual(level, b, x, &mut r)?;

        let coarse = &levels[level];
        let coarse_layout = coarse.matrix.layout().clone();
        let mut b_coarse = DistVector::zeros(coarse_layout.clone());
        let mut x_coarse = DistVector::zeros(coarse_layout.clone());
        coarse.aggregation.restrict(&r, &mut b_coarse);
        self.cycle(level + 1, cycle, &b_coarse, &mut x_coarse)?;

        if cycle == CycleType::F && level + 1 < levels.len() {
            let mut r_coarse = DistVector::zeros(coarse_layout.clone());
            let mut dx_coarse = DistVector::zeros(coarse_layout);
            self.residual(level + 1, &b_coarse, &mut x_coarse, &mut r_coarse)?;
            self.cycle(level + 1, CycleType::V, &r_coarse, &mut dx_coarse)?;
            x_coarse.axpy(T::one(), &dx_coarse, T::one());
        }

        coarse.aggregation.prolongate_add(&x_coarse, x);
        self.smooth(level, b, x, &mut r, settings.post_smooth)
    }
}

impl<'a, T: Real> LinearOperator<T> for MultigridPreconditioner<'a, T> {
    fn apply(&self, y: &mut DistVector<T>, x: Synced<T>) -> Result<(), Box<dyn Error>> {
        self.cycle(0, self.hierarchy.settings.cycle, x.vector(), y)
    }
}
