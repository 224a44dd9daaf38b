//! Direct edge set: immediate parent → child pairs.
//!
//! Plain set storage with composite-key uniqueness. Knows nothing about the
//! closure; keeping the two relations in step is the coordinator's job.

use std::collections::BTreeSet;

use crate::store::StoreTransaction;
use crate::types::{DirectEdge, NodeKey};

/// Stateless accessor for the direct relation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectEdgeSet;

impl DirectEdgeSet {
    /// Insert `parent -> child`. Returns false if it was already present.
    pub async fn attach<N, T>(tx: &mut T, parent: &N, child: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        tx.insert_direct(&DirectEdge::new(parent.clone(), child.clone())).await
    }

    /// Remove `parent -> child`. Returns false if it was absent.
    pub async fn detach<N, T>(tx: &mut T, parent: &N, child: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        tx.delete_direct(&DirectEdge::new(parent.clone(), child.clone())).await
    }

    /// Whether `parent -> child` is stored.
    pub async fn contains<N, T>(tx: &mut T, parent: &N, child: &N) -> Result<bool, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        tx.has_direct(&DirectEdge::new(parent.clone(), child.clone())).await
    }

    /// Direct parents of `node`.
    pub async fn parents_of<N, T>(tx: &mut T, node: &N) -> Result<BTreeSet<N>, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        tx.parents(node).await
    }

    /// Direct children of `node`.
    pub async fn children_of<N, T>(tx: &mut T, node: &N) -> Result<BTreeSet<N>, T::Error>
    where
        N: NodeKey,
        T: StoreTransaction<N>,
    {
        tx.children(node).await
    }
}
