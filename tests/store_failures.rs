//! Backend failure tests.
//!
//! A wrapper store fails one primitive on demand. Every coordinator write
//! must surface the failure as a store error and leave both relations as
//! they were before the call.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use closure_kernel::store::InMemoryTransaction;
use closure_kernel::{
    ClosureEdge, ClosureStore, CycleGuard, DirectEdge, EdgeCoordinator, InMemoryClosureStore,
    InMemoryError, StoreTransaction,
};

// ─────────────────────────────────────────────────────────────────────────────
// Faulty Store
// ─────────────────────────────────────────────────────────────────────────────

/// Which primitive misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Fault {
    None = 0,
    InsertDirect = 1,
    DeleteClosure = 2,
    InsertClosure = 3,
    /// `ancestors` fails outright.
    Ancestors = 4,
    /// `has_closure` answers false, as if the ancestor-side index lost rows.
    HideClosureRows = 5,
}

#[derive(Debug, thiserror::Error)]
enum FaultyError {
    #[error("injected failure in {0}")]
    Injected(&'static str),
    #[error(transparent)]
    Memory(#[from] InMemoryError),
}

#[derive(Clone, Default)]
struct FaultyStore {
    inner: InMemoryClosureStore<i64>,
    fault: Arc<AtomicU8>,
}

impl FaultyStore {
    fn arm(&self, fault: Fault) {
        self.fault.store(fault as u8, Ordering::SeqCst);
    }
}

struct FaultyTransaction {
    inner: InMemoryTransaction<i64>,
    fault: Arc<AtomicU8>,
}

impl FaultyTransaction {
    fn armed(&self, fault: Fault) -> bool {
        self.fault.load(Ordering::SeqCst) == fault as u8
    }

    fn check(&self, fault: Fault, name: &'static str) -> Result<(), FaultyError> {
        if self.armed(fault) {
            Err(FaultyError::Injected(name))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ClosureStore<i64> for FaultyStore {
    type Error = FaultyError;
    type Tx = FaultyTransaction;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        Ok(FaultyTransaction {
            inner: self.inner.begin().await?,
            fault: Arc::clone(&self.fault),
        })
    }
}

#[async_trait]
impl StoreTransaction<i64> for FaultyTransaction {
    type Error = FaultyError;

    async fn has_direct(&mut self, edge: &DirectEdge<i64>) -> Result<bool, Self::Error> {
        Ok(self.inner.has_direct(edge).await?)
    }

    async fn insert_direct(&mut self, edge: &DirectEdge<i64>) -> Result<bool, Self::Error> {
        self.check(Fault::InsertDirect, "insert_direct")?;
        Ok(self.inner.insert_direct(edge).await?)
    }

    async fn delete_direct(&mut self, edge: &DirectEdge<i64>) -> Result<bool, Self::Error> {
        Ok(self.inner.delete_direct(edge).await?)
    }

    async fn parents(&mut self, node: &i64) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.parents(node).await?)
    }

    async fn children(&mut self, node: &i64) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.children(node).await?)
    }

    async fn children_of_all(&mut self, nodes: &BTreeSet<i64>) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.children_of_all(nodes).await?)
    }

    async fn all_direct(&mut self) -> Result<BTreeSet<DirectEdge<i64>>, Self::Error> {
        Ok(self.inner.all_direct().await?)
    }

    async fn has_closure(&mut self, edge: &ClosureEdge<i64>) -> Result<bool, Self::Error> {
        if self.armed(Fault::HideClosureRows) {
            return Ok(false);
        }
        Ok(self.inner.has_closure(edge).await?)
    }

    async fn has_ancestor(&mut self, node: &i64, ancestor: &i64) -> Result<bool, Self::Error> {
        Ok(self.inner.has_ancestor(node, ancestor).await?)
    }

    async fn ancestors(&mut self, node: &i64) -> Result<BTreeSet<i64>, Self::Error> {
        self.check(Fault::Ancestors, "ancestors")?;
        Ok(self.inner.ancestors(node).await?)
    }

    async fn descendants(&mut self, node: &i64) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.descendants(node).await?)
    }

    async fn ancestors_of_all(&mut self, nodes: &BTreeSet<i64>) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.ancestors_of_all(nodes).await?)
    }

    async fn descendants_of_all(&mut self, nodes: &BTreeSet<i64>) -> Result<BTreeSet<i64>, Self::Error> {
        Ok(self.inner.descendants_of_all(nodes).await?)
    }

    async fn closure_between(
        &mut self,
        sources: &BTreeSet<i64>,
        targets: &BTreeSet<i64>,
    ) -> Result<BTreeSet<ClosureEdge<i64>>, Self::Error> {
        Ok(self.inner.closure_between(sources, targets).await?)
    }

    async fn insert_closure(&mut self, rows: &BTreeSet<ClosureEdge<i64>>) -> Result<u64, Self::Error> {
        self.check(Fault::InsertClosure, "insert_closure")?;
        Ok(self.inner.insert_closure(rows).await?)
    }

    async fn delete_closure(&mut self, rows: &BTreeSet<ClosureEdge<i64>>) -> Result<u64, Self::Error> {
        self.check(Fault::DeleteClosure, "delete_closure")?;
        Ok(self.inner.delete_closure(rows).await?)
    }

    async fn all_closure(&mut self) -> Result<BTreeSet<ClosureEdge<i64>>, Self::Error> {
        Ok(self.inner.all_closure().await?)
    }

    async fn savepoint(&mut self) -> Result<(), Self::Error> {
        Ok(self.inner.savepoint().await?)
    }

    async fn release_savepoint(&mut self) -> Result<(), Self::Error> {
        Ok(self.inner.release_savepoint().await?)
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), Self::Error> {
        Ok(self.inner.rollback_to_savepoint().await?)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        Ok(self.inner.commit().await?)
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        Ok(self.inner.rollback().await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn build(pairs: &[(i64, i64)]) -> EdgeCoordinator<i64, FaultyStore> {
    let coordinator = EdgeCoordinator::new(FaultyStore::default());
    for (parent, child) in pairs {
        coordinator.add_parent_child(parent, child).await.unwrap();
    }
    coordinator
}

// ─────────────────────────────────────────────────────────────────────────────
// ROLLBACK TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_add_rolls_back_merged_rows_when_direct_insert_fails() {
    // 1 → 2 and 3 → 4; joining 2 → 3 merges (1,3), (1,4), (2,4) first.
    let coordinator = build(&[(1, 2), (3, 4)]).await;
    let before = coordinator.snapshot().await.unwrap();

    coordinator.store().arm(Fault::InsertDirect);
    let err = coordinator.add_parent_child(&2, &3).await.unwrap_err();
    coordinator.store().arm(Fault::None);

    assert!(err.is_store());
    assert_eq!(err.to_string(), "injected failure in insert_direct");
    assert_eq!(coordinator.snapshot().await.unwrap(), before);
    assert!(!coordinator.is_ancestor(&1, &4).await.unwrap());
}

#[tokio::test]
async fn test_remove_rolls_back_direct_delete_when_prune_fails() {
    let coordinator = build(&[(1, 2), (2, 3)]).await;
    let before = coordinator.snapshot().await.unwrap();

    coordinator.store().arm(Fault::DeleteClosure);
    let err = coordinator.remove_parent_child(&1, &2).await.unwrap_err();
    coordinator.store().arm(Fault::None);

    assert!(err.is_store());
    assert_eq!(coordinator.snapshot().await.unwrap(), before);
    assert!(coordinator.has_edge(&1, &2).await.unwrap());
}

#[tokio::test]
async fn test_batch_store_failure_discards_whole_batch() {
    let coordinator = build(&[(1, 2)]).await;
    let before = coordinator.snapshot().await.unwrap();

    coordinator.store().arm(Fault::InsertClosure);
    let err = coordinator.add_children(&2, [3, 4]).await.unwrap_err();
    coordinator.store().arm(Fault::None);

    assert!(err.is_store());
    assert_eq!(coordinator.snapshot().await.unwrap(), before);
}

#[tokio::test]
async fn test_remove_children_failure_discards_whole_batch() {
    let coordinator = build(&[(1, 2), (1, 3), (3, 4)]).await;
    let before = coordinator.snapshot().await.unwrap();

    coordinator.store().arm(Fault::DeleteClosure);
    let err = coordinator.remove_children(&1, [2, 3]).await.unwrap_err();
    coordinator.store().arm(Fault::None);

    assert!(err.is_store());
    assert_eq!(coordinator.snapshot().await.unwrap(), before);
}

// ─────────────────────────────────────────────────────────────────────────────
// GUARD LOOKUP TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_guard_uses_row_lookups_only() {
    let coordinator = build(&[(1, 2), (2, 3)]).await;
    let mut tx = coordinator.store().begin().await.unwrap();

    coordinator.store().arm(Fault::Ancestors);
    assert!(CycleGuard::would_cycle(&mut tx, &3, &1).await.unwrap());
    assert!(CycleGuard::already_implied(&mut tx, &1, &3).await.unwrap());
    assert!(!CycleGuard::would_cycle(&mut tx, &1, &3).await.unwrap());
    coordinator.store().arm(Fault::None);
}

#[tokio::test]
async fn test_guard_falls_back_to_descendant_side() {
    let coordinator = build(&[(1, 2), (2, 3)]).await;

    coordinator.store().arm(Fault::HideClosureRows);
    let err = coordinator.add_parent_child(&3, &1).await.unwrap_err();
    coordinator.store().arm(Fault::None);

    assert!(err.is_cycle());
    assert_eq!(coordinator.store().inner.num_direct().await, 2);
}
