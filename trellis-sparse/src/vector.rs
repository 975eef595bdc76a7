use crate::layout::VectorLayout;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use std::sync::Arc;
use trellis_traits::Real;

/// A vector distributed over the ranks of a [`VectorLayout`].
///
/// Stores the owned degrees of freedom followed by read-only copies of halo degrees of freedom.
/// Halo values can only be refreshed through [`DistVector::synchronize`], which returns a
/// [`Synced`] token. Operations that read halo data take such a token, so that a vector can not
/// be modified while a consistent view of its halo is in use.
#[derive(Debug, Clone)]
pub struct DistVector<T: Real> {
    layout: Arc<VectorLayout>,
    values: DVector<T>,
}

/// Proof that the halo of a [`DistVector`] is consistent with the owners' values.
#[derive(Debug, Clone, Copy)]
pub struct Synced<'a, T: Real> {
    vector: &'a DistVector<T>,
}

impl<'a, T: Real> Synced<'a, T> {
    pub fn vector(&self) -> &'a DistVector<T> {
        self.vector
    }

    /// Owned and halo values.
    pub fn extended(&self) -> DVectorView<'a, T> {
        DVectorView::from(&self.vector.values)
    }

    pub fn layout(&self) -> &'a Arc<VectorLayout> {
        &self.vector.layout
    }

    /// Value of a global degree of freedom, if it is owned or part of the halo.
    pub fn get_global(&self, global_dof: usize) -> Option<T> {
        self.vector
            .layout
            .extended_dof(global_dof)
            .map(|i| self.vector.values[i])
    }
}

impl<T: Real> DistVector<T> {
    pub fn zeros(layout: Arc<VectorLayout>) -> Self {
        let values = DVector::zeros(layout.num_extended_dofs());
        Self { layout, values }
    }

    /// Distributes a replicated global vector, including consistent halo values.
    pub fn from_global(layout: Arc<VectorLayout>, global: &DVector<T>) -> Self {
        assert_eq!(global.len(), layout.partition().num_dofs());
        let values = DVector::from_fn(layout.num_extended_dofs(), |i, _| global[layout.global_dof(i)]);
        Self { layout, values }
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        &self.layout
    }

    pub fn num_owned(&self) -> usize {
        self.layout.num_owned_dofs()
    }

    pub fn owned(&self) -> DVectorView<T> {
        self.values.rows(0, self.num_owned())
    }

    pub fn owned_mut(&mut self) -> DVectorViewMut<T> {
        let n = self.num_owned();
        self.values.rows_mut(0, n)
    }

    /// Refreshes the halo from the owners. This is a collective operation.
    pub fn synchronize(&mut self) -> Synced<'_, T> {
        let vpn = self.layout.vars_per_node();
        self.layout.update_halo(self.values.as_mut_slice(), vpn);
        Synced { vector: self }
    }

    /// Adds halo contributions into the owners' values and clears the halo.
    ///
    /// This is a collective operation.
    pub fn accumulate_halo(&mut self) {
        let vpn = self.layout.vars_per_node();
        self.layout.accumulate_halo(self.values.as_mut_slice(), vpn);
    }

    /// Mutable access to owned and halo values, for local accumulation before
    /// [`accumulate_halo`](Self::accumulate_halo).
    pub fn extended_mut(&mut self) -> DVectorViewMut<T> {
        DVectorViewMut::from(&mut self.values)
    }

    pub fn fill(&mut self, value: T) {
        self.values.fill(value);
    }

    pub fn copy_from(&mut self, other: &DistVector<T>) {
        debug_assert!(self.layout.is_compatible_with(&other.layout));
        self.values.copy_from(&other.values);
    }

    /// Owned part of `self = a * x + b * self`.
    pub fn axpy(&mut self, a: T, x: &DistVector<T>, b: T) {
        let n = self.num_owned();
        self.values
            .rows_mut(0, n)
            .axpy(a, &x.values.rows(0, n), b);
    }

    pub fn scale_mut(&mut self, factor: T) {
        let n = self.num_owned();
        self.values.rows_mut(0, n).scale_mut(factor);
    }

    /// Global dot product of the owned parts. This is a collective operation.
    pub fn dot(&self, other: &DistVector<T>) -> T {
        let local = self.owned().dot(&other.owned());
        self.layout.comm().all_reduce_sum(local)
    }

    /// Global Euclidean norm. This is a collective operation.
    pub fn norm(&self) -> T {
        self.dot(self).sqrt()
    }

    /// Global maximum absolute value. This is a collective operation.
    pub fn amax(&self) -> T {
        let local = self
            .owned()
            .iter()
            .fold(T::zero(), |max, x| max.max(x.abs()));
        self.layout.comm().all_reduce_max(local)
    }

    /// Gathers the full vector on every rank. This is a collective operation.
    pub fn gather(&self) -> DVector<T> {
        let partition = self.layout.partition();
        let vpn = partition.vars_per_node();
        let segments = self
            .layout
            .comm()
            .all_gather(self.owned().iter().copied().collect::<Vec<_>>());
        let mut global = DVector::zeros(partition.num_dofs());
        for (rank, segment) in segments.iter().enumerate() {
            for (k, &node) in partition.owned_nodes(rank).iter().enumerate() {
                for c in 0..vpn {
                    global[node * vpn + c] = segment[k * vpn + c];
                }
            }
        }
        global
    }

    /// Owned value of a global degree of freedom.
    pub fn get_owned(&self, global_dof: usize) -> Option<T> {
        self.layout.owned_dof(global_dof).map(|i| self.values[i])
    }

    /// Sets a global degree of freedom if this rank owns it.
    pub fn set_owned(&mut self, global_dof: usize, value: T) -> bool {
        match self.layout.owned_dof(global_dof) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }
}
