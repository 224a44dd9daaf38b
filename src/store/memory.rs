//! In-memory closure store for testing and embedded use.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::{ClosureEdge, DirectEdge, NodeKey};
use super::{ClosureStore, StoreTransaction};

/// Error type for in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryError {
    /// Release or rollback requested with no savepoint open.
    #[error("No savepoint is open")]
    NoSavepoint,
}

/// Ordered pair relation indexed in both directions.
///
/// Uses BTreeMap/BTreeSet for deterministic iteration order.
#[derive(Debug)]
struct PairIndex<N> {
    /// first -> seconds
    forward: BTreeMap<N, BTreeSet<N>>,
    /// second -> firsts
    backward: BTreeMap<N, BTreeSet<N>>,
    len: usize,
}

impl<N> Default for PairIndex<N> {
    fn default() -> Self {
        Self {
            forward: BTreeMap::new(),
            backward: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<N: NodeKey> PairIndex<N> {
    fn contains(&self, first: &N, second: &N) -> bool {
        self.forward
            .get(first)
            .map_or(false, |set| set.contains(second))
    }

    fn insert(&mut self, first: &N, second: &N) -> bool {
        let inserted = self.forward
            .entry(first.clone())
            .or_default()
            .insert(second.clone());
        if inserted {
            self.backward
                .entry(second.clone())
                .or_default()
                .insert(first.clone());
            self.len += 1;
        }
        inserted
    }

    fn remove(&mut self, first: &N, second: &N) -> bool {
        let removed = match self.forward.get_mut(first) {
            Some(set) => {
                let removed = set.remove(second);
                if set.is_empty() {
                    self.forward.remove(first);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(set) = self.backward.get_mut(second) {
                set.remove(first);
                if set.is_empty() {
                    self.backward.remove(second);
                }
            }
            self.len -= 1;
        }
        removed
    }

    fn contains_backward(&self, second: &N, first: &N) -> bool {
        self.backward
            .get(second)
            .map_or(false, |set| set.contains(first))
    }

    fn forward_of(&self, first: &N) -> BTreeSet<N> {
        self.forward.get(first).cloned().unwrap_or_default()
    }

    fn backward_of(&self, second: &N) -> BTreeSet<N> {
        self.backward.get(second).cloned().unwrap_or_default()
    }

    fn forward_of_all(&self, firsts: &BTreeSet<N>) -> BTreeSet<N> {
        firsts
            .iter()
            .filter_map(|n| self.forward.get(n))
            .flatten()
            .cloned()
            .collect()
    }

    fn backward_of_all(&self, seconds: &BTreeSet<N>) -> BTreeSet<N> {
        seconds
            .iter()
            .filter_map(|n| self.backward.get(n))
            .flatten()
            .cloned()
            .collect()
    }

    fn pairs(&self) -> impl Iterator<Item = (&N, &N)> {
        self.forward
            .iter()
            .flat_map(|(first, seconds)| seconds.iter().map(move |second| (first, second)))
    }
}

/// Committed contents of an in-memory store.
#[derive(Debug)]
struct MemoryState<N> {
    direct: PairIndex<N>,
    closure: PairIndex<N>,
}

impl<N> Default for MemoryState<N> {
    fn default() -> Self {
        Self {
            direct: PairIndex::default(),
            closure: PairIndex::default(),
        }
    }
}

/// In-memory closure store.
///
/// Cloning the store clones the handle, not the data. Transactions hold the
/// store's lock from `begin` until they are committed, rolled back or
/// dropped, so writers are fully serialized.
#[derive(Debug)]
pub struct InMemoryClosureStore<N> {
    state: Arc<Mutex<MemoryState<N>>>,
}

impl<N> Clone for InMemoryClosureStore<N> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<N> Default for InMemoryClosureStore<N> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }
}

impl<N: NodeKey> InMemoryClosureStore<N> {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed direct edges.
    pub async fn num_direct(&self) -> usize {
        self.state.lock().await.direct.len
    }

    /// Number of committed closure rows.
    pub async fn num_closure(&self) -> usize {
        self.state.lock().await.closure.len
    }
}

#[async_trait]
impl<N: NodeKey> ClosureStore<N> for InMemoryClosureStore<N> {
    type Error = InMemoryError;
    type Tx = InMemoryTransaction<N>;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        let state = Arc::clone(&self.state).lock_owned().await;
        Ok(InMemoryTransaction {
            state,
            journal: Vec::new(),
            savepoints: Vec::new(),
        })
    }
}

/// Which relation a journaled change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Direct,
    Closure,
}

/// One effective write, recorded so it can be undone.
#[derive(Debug)]
struct Change<N> {
    relation: Relation,
    inserted: bool,
    first: N,
    second: N,
}

/// Transaction over an [`InMemoryClosureStore`].
///
/// Writes go straight to the locked state and are journaled. Rollback,
/// rollback to a savepoint, and drop without commit undo the journal in
/// reverse; a savepoint is a journal length.
#[derive(Debug)]
pub struct InMemoryTransaction<N: NodeKey> {
    state: OwnedMutexGuard<MemoryState<N>>,
    journal: Vec<Change<N>>,
    savepoints: Vec<usize>,
}

impl<N: NodeKey> InMemoryTransaction<N> {
    /// Number of open savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    fn index_mut(&mut self, relation: Relation) -> &mut PairIndex<N> {
        match relation {
            Relation::Direct => &mut self.state.direct,
            Relation::Closure => &mut self.state.closure,
        }
    }

    fn write(&mut self, relation: Relation, inserted: bool, first: &N, second: &N) -> bool {
        let index = self.index_mut(relation);
        let changed = if inserted {
            index.insert(first, second)
        } else {
            index.remove(first, second)
        };
        if changed {
            self.journal.push(Change {
                relation,
                inserted,
                first: first.clone(),
                second: second.clone(),
            });
        }
        changed
    }

    /// Undo journaled changes until only `len` remain.
    fn undo_to(&mut self, len: usize) {
        while self.journal.len() > len {
            let Some(change) = self.journal.pop() else { break };
            let index = self.index_mut(change.relation);
            if change.inserted {
                index.remove(&change.first, &change.second);
            } else {
                index.insert(&change.first, &change.second);
            }
        }
    }
}

impl<N: NodeKey> Drop for InMemoryTransaction<N> {
    fn drop(&mut self) {
        // Committed transactions leave an empty journal.
        self.undo_to(0);
    }
}

#[async_trait]
impl<N: NodeKey> StoreTransaction<N> for InMemoryTransaction<N> {
    type Error = InMemoryError;

    async fn has_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(self.state.direct.contains(&edge.parent, &edge.child))
    }

    async fn insert_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(self.write(Relation::Direct, true, &edge.parent, &edge.child))
    }

    async fn delete_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(self.write(Relation::Direct, false, &edge.parent, &edge.child))
    }

    async fn parents(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.direct.backward_of(node))
    }

    async fn children(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.direct.forward_of(node))
    }

    async fn children_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.direct.forward_of_all(nodes))
    }

    async fn all_direct(&mut self) -> Result<BTreeSet<DirectEdge<N>>, Self::Error> {
        Ok(self.state.direct
            .pairs()
            .map(|(p, c)| DirectEdge::new(p.clone(), c.clone()))
            .collect())
    }

    async fn has_closure(&mut self, edge: &ClosureEdge<N>) -> Result<bool, Self::Error> {
        Ok(self.state.closure.contains(&edge.ancestor, &edge.descendant))
    }

    async fn has_ancestor(&mut self, node: &N, ancestor: &N) -> Result<bool, Self::Error> {
        Ok(self.state.closure.contains_backward(node, ancestor))
    }

    async fn ancestors(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.closure.backward_of(node))
    }

    async fn descendants(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.closure.forward_of(node))
    }

    async fn ancestors_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.closure.backward_of_all(nodes))
    }

    async fn descendants_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(self.state.closure.forward_of_all(nodes))
    }

    async fn closure_between(
        &mut self,
        sources: &BTreeSet<N>,
        targets: &BTreeSet<N>,
    ) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error> {
        let closure = &self.state.closure;
        Ok(sources
            .iter()
            .filter_map(|a| closure.forward.get(a).map(|ds| (a, ds)))
            .flat_map(|(a, ds)| {
                ds.intersection(targets)
                    .map(move |d| ClosureEdge::new(a.clone(), d.clone()))
            })
            .collect())
    }

    async fn insert_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error> {
        let mut written = 0;
        for row in rows {
            if self.write(Relation::Closure, true, &row.ancestor, &row.descendant) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn delete_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error> {
        let mut removed = 0;
        for row in rows {
            if self.write(Relation::Closure, false, &row.ancestor, &row.descendant) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn all_closure(&mut self) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error> {
        Ok(self.state.closure
            .pairs()
            .map(|(a, d)| ClosureEdge::new(a.clone(), d.clone()))
            .collect())
    }

    async fn savepoint(&mut self) -> Result<(), Self::Error> {
        self.savepoints.push(self.journal.len());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), Self::Error> {
        self.savepoints.pop().map(|_| ()).ok_or(InMemoryError::NoSavepoint)
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), Self::Error> {
        let mark = self.savepoints.pop().ok_or(InMemoryError::NoSavepoint)?;
        self.undo_to(mark);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), Self::Error> {
        self.journal.clear();
        self.savepoints.clear();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), Self::Error> {
        self.undo_to(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nodes: &[i64]) -> BTreeSet<i64> {
        nodes.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_direct_set_semantics() {
        let store = InMemoryClosureStore::<i64>::new();
        let mut tx = store.begin().await.unwrap();

        assert!(tx.insert_direct(&DirectEdge::new(1, 2)).await.unwrap());
        assert!(!tx.insert_direct(&DirectEdge::new(1, 2)).await.unwrap());
        assert!(tx.has_direct(&DirectEdge::new(1, 2)).await.unwrap());
        assert!(!tx.has_direct(&DirectEdge::new(2, 1)).await.unwrap());

        assert!(tx.delete_direct(&DirectEdge::new(1, 2)).await.unwrap());
        assert!(!tx.delete_direct(&DirectEdge::new(1, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_parents_and_children() {
        let store = InMemoryClosureStore::<i64>::new();
        let mut tx = store.begin().await.unwrap();

        tx.insert_direct(&DirectEdge::new(1, 3)).await.unwrap();
        tx.insert_direct(&DirectEdge::new(2, 3)).await.unwrap();
        tx.insert_direct(&DirectEdge::new(3, 4)).await.unwrap();

        assert_eq!(tx.parents(&3).await.unwrap(), set(&[1, 2]));
        assert_eq!(tx.children(&3).await.unwrap(), set(&[4]));
        assert_eq!(tx.children_of_all(&set(&[1, 2, 3])).await.unwrap(), set(&[3, 4]));
        assert_eq!(tx.all_direct().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_closure_between() {
        let store = InMemoryClosureStore::<i64>::new();
        let mut tx = store.begin().await.unwrap();

        let rows: BTreeSet<_> = [(1, 2), (1, 3), (2, 3), (4, 3)]
            .into_iter()
            .map(ClosureEdge::from)
            .collect();
        assert_eq!(tx.insert_closure(&rows).await.unwrap(), 4);
        assert_eq!(tx.insert_closure(&rows).await.unwrap(), 0);

        let between = tx.closure_between(&set(&[1, 2]), &set(&[3])).await.unwrap();
        let expected: BTreeSet<_> = [(1, 3), (2, 3)].into_iter().map(ClosureEdge::from).collect();
        assert_eq!(between, expected);

        assert_eq!(tx.ancestors(&3).await.unwrap(), set(&[1, 2, 4]));
        assert_eq!(tx.descendants_of_all(&set(&[1, 4])).await.unwrap(), set(&[2, 3]));
        assert_eq!(tx.ancestors_of_all(&set(&[2, 3])).await.unwrap(), set(&[1, 2, 4]));
    }

    #[tokio::test]
    async fn test_commit_publishes_and_drop_discards() {
        let store = InMemoryClosureStore::<i64>::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_direct(&DirectEdge::new(1, 2)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.num_direct().await, 1);

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_direct(&DirectEdge::new(2, 3)).await.unwrap();
            // dropped without commit
        }
        assert_eq!(store.num_direct().await, 1);

        let mut tx = store.begin().await.unwrap();
        tx.delete_direct(&DirectEdge::new(1, 2)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.num_direct().await, 1);
    }

    #[tokio::test]
    async fn test_savepoints() {
        let store = InMemoryClosureStore::<i64>::new();
        let mut tx = store.begin().await.unwrap();

        tx.insert_direct(&DirectEdge::new(1, 2)).await.unwrap();
        tx.savepoint().await.unwrap();
        tx.insert_direct(&DirectEdge::new(2, 3)).await.unwrap();
        assert_eq!(tx.savepoint_depth(), 1);
        tx.rollback_to_savepoint().await.unwrap();

        tx.savepoint().await.unwrap();
        tx.insert_direct(&DirectEdge::new(1, 4)).await.unwrap();
        tx.release_savepoint().await.unwrap();

        assert_eq!(tx.rollback_to_savepoint().await, Err(InMemoryError::NoSavepoint));

        let edges = tx.all_direct().await.unwrap();
        assert!(edges.contains(&DirectEdge::new(1, 2)));
        assert!(edges.contains(&DirectEdge::new(1, 4)));
        assert!(!edges.contains(&DirectEdge::new(2, 3)));
    }

    #[tokio::test]
    async fn test_undo_restores_deleted_rows() {
        let store = InMemoryClosureStore::<i64>::new();
        let rows: BTreeSet<_> = [(1, 2), (1, 3), (2, 3)]
            .into_iter()
            .map(ClosureEdge::from)
            .collect();

        let mut tx = store.begin().await.unwrap();
        tx.insert_direct(&DirectEdge::new(1, 2)).await.unwrap();
        tx.insert_closure(&rows).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.savepoint().await.unwrap();
        assert_eq!(tx.delete_closure(&rows).await.unwrap(), 3);
        tx.savepoint().await.unwrap();
        tx.delete_direct(&DirectEdge::new(1, 2)).await.unwrap();
        tx.insert_direct(&DirectEdge::new(7, 8)).await.unwrap();

        tx.rollback_to_savepoint().await.unwrap();
        assert!(tx.has_direct(&DirectEdge::new(1, 2)).await.unwrap());
        assert!(!tx.has_direct(&DirectEdge::new(7, 8)).await.unwrap());
        assert!(tx.all_closure().await.unwrap().is_empty());

        tx.rollback_to_savepoint().await.unwrap();
        assert_eq!(tx.all_closure().await.unwrap(), rows);
        assert!(tx.has_ancestor(&3, &1).await.unwrap());

        // Changes after the last savepoint are undone when dropped.
        tx.delete_closure(&rows).await.unwrap();
        drop(tx);
        assert_eq!(store.num_closure().await, 3);
        assert_eq!(store.num_direct().await, 1);
    }

    #[tokio::test]
    async fn test_has_ancestor_uses_descendant_side() {
        let store = InMemoryClosureStore::<i64>::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_closure(&BTreeSet::from([ClosureEdge::new(1, 2)])).await.unwrap();

        assert!(tx.has_ancestor(&2, &1).await.unwrap());
        assert!(!tx.has_ancestor(&1, &2).await.unwrap());
        assert!(!tx.has_ancestor(&9, &1).await.unwrap());
    }

    #[tokio::test]
    async fn test_transactions_are_serialized() {
        let store = InMemoryClosureStore::<i64>::new();
        let tx = store.begin().await.unwrap();

        let other = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = other.begin().await.unwrap();
            tx.insert_direct(&DirectEdge::new(5, 6)).await.unwrap();
            tx.commit().await.unwrap();
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.commit().await.unwrap();
        waiter.await.unwrap();
        assert_eq!(store.num_direct().await, 1);
    }
}
