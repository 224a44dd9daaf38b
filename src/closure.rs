//! Closure set: guarded access to the closure relation.
//!
//! The closure relation is derived data. Every mutation here is refused
//! with [`EdgeError::LockedRelationship`] unless the handle has been
//! explicitly unlocked, which only the edge coordinator does.
//!
//! ## Merge
//!
//! Adding `p -> c` implies three families of new rows:
//!
//! ```text
//!   ancestors(p) × descendants(c)     cross product
//!   {p}          × descendants(c)     parent extends descendants
//!   ancestors(p) × {c}                child extends ancestors
//! ```
//!
//! Each family is anti-joined against the rows already present and the
//! union is written in one bulk insert. The direct pair `(p, c)` itself is
//! written by the caller.
//!
//! ## Prune
//!
//! Removing `p -> c` puts every row in `({p} ∪ ancestors(p)) × ({c} ∪ descendants(c))`
//! up for deletion. A row survives when an alternate path is visible
//! locally: its descendant is reachable from one of `p`'s remaining
//! children, or its ancestor reaches one of `c`'s remaining parents.
//! With [`PruneStrategy::Rederive`] the rows that fail the local check are
//! re-verified against the remaining direct edges before deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use crate::config::PruneStrategy;
use crate::error::{EdgeError, EdgeResult};
use crate::snapshot::ClosureDrift;
use crate::store::StoreTransaction;
use crate::types::{ClosureEdge, NodeKey};

/// Handle over the closure relation with a lock flag.
///
/// Created locked. `lock` and `unlock` are idempotent and chainable.
#[derive(Debug, Clone)]
pub struct ClosureSet {
    locked: bool,
    strategy: PruneStrategy,
}

impl Default for ClosureSet {
    fn default() -> Self {
        Self {
            locked: true,
            strategy: PruneStrategy::default(),
        }
    }
}

impl ClosureSet {
    /// Create a locked handle using the local prune strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a locked handle with the given prune strategy.
    pub fn with_strategy(strategy: PruneStrategy) -> Self {
        Self {
            locked: true,
            strategy,
        }
    }

    /// Refuse further mutations.
    pub fn lock(&mut self) -> &mut Self {
        self.locked = true;
        self
    }

    /// Allow mutations until the next [`lock`](Self::lock).
    pub fn unlock(&mut self) -> &mut Self {
        self.locked = false;
        self
    }

    /// Current lock state.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Prune strategy in effect.
    pub fn strategy(&self) -> PruneStrategy {
        self.strategy
    }

    /// Unlock for the lifetime of the returned guard.
    ///
    /// The handle is locked again when the guard drops, on every exit path.
    pub fn unlocked(&mut self) -> Unlocked<'_> {
        self.unlock();
        Unlocked { set: self }
    }

    /// Insert a single closure row.
    ///
    /// Returns false if the row was already present.
    pub async fn attach<N, T>(&self, tx: &mut T, edge: &ClosureEdge<N>) -> EdgeResult<bool, N, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if self.locked {
            return Err(EdgeError::LockedRelationship);
        }
        let rows = BTreeSet::from([edge.clone()]);
        Ok(tx.insert_closure(&rows).await? > 0)
    }

    /// Delete a single closure row.
    ///
    /// Returns false if the row was absent.
    pub async fn detach<N, T>(&self, tx: &mut T, edge: &ClosureEdge<N>) -> EdgeResult<bool, N, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if self.locked {
            return Err(EdgeError::LockedRelationship);
        }
        let rows = BTreeSet::from([edge.clone()]);
        Ok(tx.delete_closure(&rows).await? > 0)
    }

    /// Insert every row newly implied by `parent -> child`, excluding the
    /// direct pair itself.
    ///
    /// Callers must have rejected cycles and already-implied edges first.
    /// Returns the number of rows written.
    pub async fn merge_closure<N, T>(&self, tx: &mut T, parent: &N, child: &N) -> EdgeResult<u64, N, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if self.locked {
            return Err(EdgeError::LockedRelationship);
        }

        let ancestors = tx.ancestors(parent).await?;
        let descendants = tx.descendants(child).await?;

        let mut sources = ancestors.clone();
        sources.insert(parent.clone());
        let mut targets = descendants.clone();
        targets.insert(child.clone());
        let existing = tx.closure_between(&sources, &targets).await?;

        let delta = closure_delta(parent, child, &ancestors, &descendants, &existing);
        if delta.is_empty() {
            tracing::debug!(parent = ?parent, child = ?child, "Merge produced no implied rows");
            return Ok(0);
        }

        let written = tx.insert_closure(&delta).await?;
        tracing::debug!(
            parent = ?parent,
            child = ?child,
            ancestors = ancestors.len(),
            descendants = descendants.len(),
            written,
            "Merged closure"
        );
        Ok(written)
    }

    /// Delete the closure rows no longer justified once `parent -> child`
    /// is gone.
    ///
    /// The direct edge must already have been removed. Returns the number of
    /// rows deleted.
    pub async fn prune<N, T>(&self, tx: &mut T, parent: &N, child: &N) -> EdgeResult<u64, N, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if self.locked {
            return Err(EdgeError::LockedRelationship);
        }

        let mut sources = tx.ancestors(parent).await?;
        sources.insert(parent.clone());
        let mut targets = tx.descendants(child).await?;
        targets.insert(child.clone());
        let candidates = tx.closure_between(&sources, &targets).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut other_children = tx.children(parent).await?;
        other_children.remove(child);
        let mut via_children = tx.descendants_of_all(&other_children).await?;
        via_children.extend(other_children);

        let mut other_parents = tx.parents(child).await?;
        other_parents.remove(parent);
        let mut via_parents = tx.ancestors_of_all(&other_parents).await?;
        via_parents.extend(other_parents);

        let mut doomed = local_prune_set(&candidates, &via_children, &via_parents);
        if self.strategy == PruneStrategy::Rederive && !doomed.is_empty() {
            let still_reachable = reachable_rows(tx, &doomed).await?;
            if !still_reachable.is_empty() {
                tracing::debug!(
                    parent = ?parent,
                    child = ?child,
                    kept = still_reachable.len(),
                    "Rederive kept rows the local check would delete"
                );
            }
            doomed.retain(|row| !still_reachable.contains(row));
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed = tx.delete_closure(&doomed).await?;
        tracing::debug!(
            parent = ?parent,
            child = ?child,
            candidates = candidates.len(),
            removed,
            "Pruned closure"
        );
        Ok(removed)
    }

    /// Bring the stored closure in line with `drift`: insert its missing
    /// rows and delete its extraneous ones. Returns (inserted, deleted).
    pub async fn repair<N, T>(&self, tx: &mut T, drift: &ClosureDrift<N>) -> EdgeResult<(u64, u64), N, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if self.locked {
            return Err(EdgeError::LockedRelationship);
        }
        let inserted = if drift.missing.is_empty() {
            0
        } else {
            tx.insert_closure(&drift.missing).await?
        };
        let deleted = if drift.extraneous.is_empty() {
            0
        } else {
            tx.delete_closure(&drift.extraneous).await?
        };
        Ok((inserted, deleted))
    }
}

/// Scoped unlock of a [`ClosureSet`]; relocks on drop.
#[derive(Debug)]
pub struct Unlocked<'a> {
    set: &'a mut ClosureSet,
}

impl Deref for Unlocked<'_> {
    type Target = ClosureSet;

    fn deref(&self) -> &Self::Target {
        self.set
    }
}

impl DerefMut for Unlocked<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.set
    }
}

impl Drop for Unlocked<'_> {
    fn drop(&mut self) {
        self.set.lock();
    }
}

/// Rows implied by adding `parent -> child` that are not yet stored.
///
/// `ancestors` and `descendants` are the stored ancestors of `parent` and
/// descendants of `child`; `existing` holds every stored row between
/// `{parent} ∪ ancestors` and `{child} ∪ descendants`.
pub fn closure_delta<N: NodeKey>(
    parent: &N,
    child: &N,
    ancestors: &BTreeSet<N>,
    descendants: &BTreeSet<N>,
    existing: &BTreeSet<ClosureEdge<N>>,
) -> BTreeSet<ClosureEdge<N>> {
    let cross = ancestors.iter().flat_map(|a| {
        descendants
            .iter()
            .map(move |d| ClosureEdge::new(a.clone(), d.clone()))
    });
    let parent_down = descendants
        .iter()
        .map(|d| ClosureEdge::new(parent.clone(), d.clone()));
    let child_up = ancestors
        .iter()
        .map(|a| ClosureEdge::new(a.clone(), child.clone()));

    cross
        .chain(parent_down)
        .chain(child_up)
        .filter(|row| !row.is_reflexive() && !existing.contains(row))
        .collect()
}

/// Candidates with no locally visible alternate path.
///
/// `via_children` holds every node reachable through the cut parent's other
/// children; `via_parents` every node that reaches one of the cut child's
/// other parents.
pub fn local_prune_set<N: NodeKey>(
    candidates: &BTreeSet<ClosureEdge<N>>,
    via_children: &BTreeSet<N>,
    via_parents: &BTreeSet<N>,
) -> BTreeSet<ClosureEdge<N>> {
    candidates
        .iter()
        .filter(|row| !via_children.contains(&row.descendant) && !via_parents.contains(&row.ancestor))
        .cloned()
        .collect()
}

/// Subset of `rows` still reachable over the stored direct edges.
///
/// Breadth-first from each distinct ancestor, one `children_of_all` query
/// per layer, stopping once every wanted descendant has been seen.
async fn reachable_rows<N, T>(
    tx: &mut T,
    rows: &BTreeSet<ClosureEdge<N>>,
) -> Result<BTreeSet<ClosureEdge<N>>, T::Error>
where
    N: NodeKey,
    T: StoreTransaction<N>,
{
    let mut wanted: BTreeMap<&N, BTreeSet<&N>> = BTreeMap::new();
    for row in rows {
        wanted.entry(&row.ancestor).or_default().insert(&row.descendant);
    }

    let mut reachable = BTreeSet::new();
    for (ancestor, mut pending) in wanted {
        let mut visited: BTreeSet<N> = BTreeSet::new();
        let mut frontier = BTreeSet::from([ancestor.clone()]);
        while !frontier.is_empty() && !pending.is_empty() {
            let next: BTreeSet<N> = tx
                .children_of_all(&frontier)
                .await?
                .into_iter()
                .filter(|n| !visited.contains(n))
                .collect();
            for node in &next {
                if pending.remove(node) {
                    reachable.insert(ClosureEdge::new(ancestor.clone(), node.clone()));
                }
            }
            visited.extend(next.iter().cloned());
            frontier = next;
        }
    }
    Ok(reachable)
}
