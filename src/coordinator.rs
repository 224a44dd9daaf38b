//! Edge coordinator: the transactional surface of the kernel.
//!
//! Every change to the direct relation goes through here, inside one store
//! transaction that also applies the matching closure delta. Either both
//! relations change together or neither does.
//!
//! ## Adding `parent -> child`
//!
//! 1. Reject if `child` already reaches `parent` (or they are equal)
//! 2. Succeed with no effect if `parent` already reaches `child`
//! 3. Merge the implied closure rows (closure unlocked for the merge only)
//! 4. Insert the direct edge
//! 5. Insert the direct closure pair
//!
//! ## Removing `parent -> child`
//!
//! 1. Delete the direct edge; stop with zero if it was absent
//! 2. Prune closure rows no longer justified (closure unlocked for the prune only)

use std::collections::BTreeSet;
use std::marker::PhantomData;

use crate::closure::ClosureSet;
use crate::config::PruneStrategy;
use crate::direct::DirectEdgeSet;
use crate::error::{EdgeError, EdgeResult};
use crate::guard::CycleGuard;
use crate::snapshot::{ClosureDrift, ClosureSnapshot};
use crate::store::{ClosureStore, StoreTransaction};
use crate::types::{ClosureEdge, NodeKey};

/// Result of a successful add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The edge was stored along with `implied` transitive closure rows.
    Added {
        /// Closure rows written besides the direct pair.
        implied: u64,
    },
    /// `parent` already reached `child`; nothing was written.
    AlreadyImplied,
}

impl AddOutcome {
    /// Whether anything was written.
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

/// Keeps the direct and closure relations consistent.
///
/// Holds a store handle; every operation opens its own transaction unless
/// it is one of the `_in` variants, which run inside a caller-owned one.
pub struct EdgeCoordinator<N, S> {
    store: S,
    strategy: PruneStrategy,
    _node: PhantomData<fn() -> N>,
}

impl<N, S> EdgeCoordinator<N, S>
where
    N: NodeKey,
    S: ClosureStore<N>,
{
    /// Create a coordinator over `store` using the local prune strategy.
    pub fn new(store: S) -> Self {
        Self {
            store,
            strategy: PruneStrategy::default(),
            _node: PhantomData,
        }
    }

    /// Create a coordinator over `store` with the prune strategy named by
    /// `CLOSURE_PRUNE_STRATEGY`.
    pub fn from_env(store: S) -> Self {
        let strategy = PruneStrategy::from_env();
        tracing::info!(strategy = %strategy, "Edge coordinator configured");
        Self::new(store).with_prune_strategy(strategy)
    }

    /// Use `strategy` when pruning after edge removal.
    pub fn with_prune_strategy(mut self, strategy: PruneStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Prune strategy in effect.
    pub fn prune_strategy(&self) -> PruneStrategy {
        self.strategy
    }

    /// A fresh, locked closure handle for one operation.
    fn closure_set(&self) -> ClosureSet {
        ClosureSet::with_strategy(self.strategy)
    }

    // ── writes ──────────────────────────────────────────────────────────

    /// Add `parent -> child` in its own transaction.
    ///
    /// Fails with [`EdgeError::Cycle`] if `child` already reaches `parent`
    /// or the two are equal; nothing is written in that case.
    pub async fn add_parent_child(&self, parent: &N, child: &N) -> EdgeResult<AddOutcome, N, S::Error> {
        let mut tx = self.store.begin().await?;
        match self.add_parent_child_in(&mut tx, parent, child).await {
            Ok(outcome) => {
                tx.commit().await?;
                tracing::info!(parent = ?parent, child = ?child, ?outcome, "Edge added");
                Ok(outcome)
            }
            Err(err) => Err(abort(tx, err).await),
        }
    }

    /// Add `parent -> child` inside a caller-owned transaction.
    ///
    /// On error the transaction may hold partial writes; the caller must roll
    /// it back (or back to a savepoint taken before the call).
    pub async fn add_parent_child_in<T>(&self, tx: &mut T, parent: &N, child: &N) -> EdgeResult<AddOutcome, N, T::Error>
    where
        T: StoreTransaction<N>,
    {
        if CycleGuard::would_cycle(tx, parent, child).await? {
            tracing::warn!(parent = ?parent, child = ?child, "Rejected edge: would create a cycle");
            return Err(EdgeError::Cycle {
                parent: parent.clone(),
                child: child.clone(),
            });
        }

        if CycleGuard::already_implied(tx, parent, child).await? {
            tracing::debug!(parent = ?parent, child = ?child, "Edge already implied");
            return Ok(AddOutcome::AlreadyImplied);
        }

        let mut closure = self.closure_set();
        let implied = closure.unlocked().merge_closure(tx, parent, child).await?;

        DirectEdgeSet::attach(tx, parent, child).await?;

        closure
            .unlocked()
            .attach(tx, &ClosureEdge::new(parent.clone(), child.clone()))
            .await?;

        Ok(AddOutcome::Added { implied })
    }

    /// Add `parent -> child` for each child, in order, in one transaction.
    ///
    /// Each pair is applied all-or-nothing under its own savepoint. A
    /// rejected pair does not stop the rest: every accepted pair is
    /// committed, then the first rejection is returned as the error.
    pub async fn add_children<I>(&self, parent: &N, children: I) -> EdgeResult<Vec<AddOutcome>, N, S::Error>
    where
        I: IntoIterator<Item = N>,
    {
        let pairs = children
            .into_iter()
            .map(|child| (parent.clone(), child))
            .collect();
        self.add_batch(pairs).await
    }

    /// Add `parent -> child` for each parent, in order, in one transaction.
    ///
    /// Same per-pair semantics as [`add_children`](Self::add_children).
    pub async fn add_parents<I>(&self, child: &N, parents: I) -> EdgeResult<Vec<AddOutcome>, N, S::Error>
    where
        I: IntoIterator<Item = N>,
    {
        let pairs = parents
            .into_iter()
            .map(|parent| (parent, child.clone()))
            .collect();
        self.add_batch(pairs).await
    }

    async fn add_batch(&self, pairs: Vec<(N, N)>) -> EdgeResult<Vec<AddOutcome>, N, S::Error> {
        let mut tx = self.store.begin().await?;
        let mut outcomes = Vec::with_capacity(pairs.len());
        let mut first_rejection = None;

        for (parent, child) in &pairs {
            if let Err(err) = tx.savepoint().await {
                return Err(abort(tx, err.into()).await);
            }
            let step = match self.add_parent_child_in(&mut tx, parent, child).await {
                Ok(outcome) => {
                    outcomes.push(outcome);
                    tx.release_savepoint().await
                }
                Err(err @ EdgeError::Cycle { .. }) => {
                    if first_rejection.is_none() {
                        first_rejection = Some(err);
                    }
                    tx.rollback_to_savepoint().await
                }
                Err(err) => return Err(abort(tx, err).await),
            };
            if let Err(err) = step {
                return Err(abort(tx, err.into()).await);
            }
        }

        tx.commit().await?;
        tracing::info!(
            pairs = pairs.len(),
            added = outcomes.iter().filter(|o| o.is_added()).count(),
            rejected = pairs.len() - outcomes.len(),
            "Edge batch committed"
        );

        match first_rejection {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Remove `parent -> child` in its own transaction.
    ///
    /// Returns the number of rows removed across both relations; zero if the
    /// direct edge did not exist.
    pub async fn remove_parent_child(&self, parent: &N, child: &N) -> EdgeResult<u64, N, S::Error> {
        let mut tx = self.store.begin().await?;
        match self.remove_parent_child_in(&mut tx, parent, child).await {
            Ok(removed) => {
                tx.commit().await?;
                if removed > 0 {
                    tracing::info!(parent = ?parent, child = ?child, removed, "Edge removed");
                }
                Ok(removed)
            }
            Err(err) => Err(abort(tx, err).await),
        }
    }

    /// Remove `parent -> child` inside a caller-owned transaction.
    pub async fn remove_parent_child_in<T>(&self, tx: &mut T, parent: &N, child: &N) -> EdgeResult<u64, N, T::Error>
    where
        T: StoreTransaction<N>,
    {
        if !DirectEdgeSet::detach(tx, parent, child).await? {
            tracing::debug!(parent = ?parent, child = ?child, "No direct edge to remove");
            return Ok(0);
        }

        let mut closure = self.closure_set();
        let pruned = closure.unlocked().prune(tx, parent, child).await?;
        Ok(1 + pruned)
    }

    /// Remove `parent -> child` for each child in one transaction.
    ///
    /// Returns the total number of rows removed.
    pub async fn remove_children<I>(&self, parent: &N, children: I) -> EdgeResult<u64, N, S::Error>
    where
        I: IntoIterator<Item = N>,
    {
        let mut tx = self.store.begin().await?;
        let mut removed = 0;
        for child in children {
            match self.remove_parent_child_in(&mut tx, parent, &child).await {
                Ok(n) => removed += n,
                Err(err) => return Err(abort(tx, err).await),
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Recompute the closure from the direct edges and store the result.
    ///
    /// Returns the drift that was repaired (empty when already consistent).
    pub async fn rebuild_closure(&self) -> EdgeResult<ClosureDrift<N>, N, S::Error> {
        let mut tx = self.store.begin().await?;
        let snapshot = read_snapshot(&mut tx).await?;
        let drift = snapshot.verify();
        if drift.is_empty() {
            tx.commit().await?;
            return Ok(drift);
        }

        tracing::warn!(
            missing = drift.missing.len(),
            extraneous = drift.extraneous.len(),
            "Closure drift detected, rebuilding"
        );
        let mut closure = self.closure_set();
        let repaired = closure.unlocked().repair(&mut tx, &drift).await;
        match repaired {
            Ok((inserted, deleted)) => {
                tx.commit().await?;
                tracing::info!(inserted, deleted, "Closure rebuilt");
                Ok(drift)
            }
            Err(err) => Err(abort(tx, err).await),
        }
    }

    // ── reads ───────────────────────────────────────────────────────────

    /// Every ancestor of `node`.
    pub async fn ancestors_of(&self, node: &N) -> Result<BTreeSet<N>, S::Error> {
        let mut tx = self.store.begin().await?;
        let ancestors = tx.ancestors(node).await?;
        tx.commit().await?;
        Ok(ancestors)
    }

    /// Every descendant of `node`.
    pub async fn descendants_of(&self, node: &N) -> Result<BTreeSet<N>, S::Error> {
        let mut tx = self.store.begin().await?;
        let descendants = tx.descendants(node).await?;
        tx.commit().await?;
        Ok(descendants)
    }

    /// Direct parents of `node`.
    pub async fn parents_of(&self, node: &N) -> Result<BTreeSet<N>, S::Error> {
        let mut tx = self.store.begin().await?;
        let parents = DirectEdgeSet::parents_of(&mut tx, node).await?;
        tx.commit().await?;
        Ok(parents)
    }

    /// Direct children of `node`.
    pub async fn children_of(&self, node: &N) -> Result<BTreeSet<N>, S::Error> {
        let mut tx = self.store.begin().await?;
        let children = DirectEdgeSet::children_of(&mut tx, node).await?;
        tx.commit().await?;
        Ok(children)
    }

    /// Whether `ancestor` reaches `descendant` through one or more edges.
    pub async fn is_ancestor(&self, ancestor: &N, descendant: &N) -> Result<bool, S::Error> {
        let mut tx = self.store.begin().await?;
        let row = ClosureEdge::new(ancestor.clone(), descendant.clone());
        let found = tx.has_closure(&row).await?;
        tx.commit().await?;
        Ok(found)
    }

    /// Whether the direct edge `parent -> child` is stored.
    pub async fn has_edge(&self, parent: &N, child: &N) -> Result<bool, S::Error> {
        let mut tx = self.store.begin().await?;
        let found = DirectEdgeSet::contains(&mut tx, parent, child).await?;
        tx.commit().await?;
        Ok(found)
    }

    /// Both relations, read in one transaction.
    pub async fn snapshot(&self) -> Result<ClosureSnapshot<N>, S::Error> {
        let mut tx = self.store.begin().await?;
        let snapshot = read_snapshot(&mut tx).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    /// Compare the stored closure against the direct edges without changing anything.
    pub async fn verify(&self) -> Result<ClosureDrift<N>, S::Error> {
        let drift = self.snapshot().await?.verify();
        if !drift.is_empty() {
            tracing::warn!(
                missing = drift.missing.len(),
                extraneous = drift.extraneous.len(),
                "Closure drift detected"
            );
        }
        Ok(drift)
    }
}

async fn read_snapshot<N, T>(tx: &mut T) -> Result<ClosureSnapshot<N>, T::Error>
where
    N: NodeKey,
    T: StoreTransaction<N>,
{
    let direct = tx.all_direct().await?;
    let closure = tx.all_closure().await?;
    Ok(ClosureSnapshot::new(direct, closure))
}

/// Roll back `tx` and hand back the error that caused it.
async fn abort<N, T>(tx: T, err: EdgeError<N, T::Error>) -> EdgeError<N, T::Error>
where
    N: NodeKey,
    T: StoreTransaction<N>,
{
    if let Err(rollback_err) = tx.rollback().await {
        tracing::error!(error = %rollback_err, "Rollback failed");
    }
    err
}
