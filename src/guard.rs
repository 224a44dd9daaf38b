//! Cycle guard: read-only predicates consulted before any mutation.
//!
//! Both predicates answer from the closure relation, never by walking the
//! direct graph. Each relationship is checked from both ends (`d` among the
//! descendants of `a`, and `a` among the ancestors of `d`). On a consistent
//! closure the two answers agree; a disagreement is logged as drift.

use crate::store::StoreTransaction;
use crate::types::{ClosureEdge, NodeKey};

/// Stateless predicate layer over a [`StoreTransaction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleGuard;

impl CycleGuard {
    /// Whether adding `parent -> child` would close a cycle.
    ///
    /// True iff `child` is already an ancestor of `parent`, or the two are the
    /// same node.
    pub async fn would_cycle<N, T>(tx: &mut T, parent: &N, child: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        if parent == child {
            tracing::trace!(node = ?parent, "Self-loop rejected");
            return Ok(true);
        }
        let cycle = Self::reaches(tx, child, parent).await?;
        tracing::trace!(parent = ?parent, child = ?child, cycle, "Cycle check");
        Ok(cycle)
    }

    /// Whether `parent` already reaches `child`, making the edge redundant.
    pub async fn already_implied<N, T>(tx: &mut T, parent: &N, child: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        let implied = Self::reaches(tx, parent, child).await?;
        tracing::trace!(parent = ?parent, child = ?child, implied, "Implication check");
        Ok(implied)
    }

    /// `ancestor ~> descendant` according to either side of the closure.
    async fn reaches<N, T>(tx: &mut T, ancestor: &N, descendant: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        let row = ClosureEdge::new(ancestor.clone(), descendant.clone());
        if tx.has_closure(&row).await? {
            return Ok(true);
        }
        if tx.has_ancestor(descendant, ancestor).await? {
            tracing::warn!(
                ancestor = ?ancestor,
                descendant = ?descendant,
                "Closure drift: ancestor index disagrees with closure row lookup"
            );
            return Ok(true);
        }
        Ok(false)
    }
}
