//! Closure storage backends.
//!
//! A backend stores two relations: the direct-edge relation (immediate
//! parent → child pairs) and the closure relation (every ancestor →
//! descendant pair). The kernel never touches either relation outside a
//! [`StoreTransaction`], so the backend's isolation guarantees are the only
//! concurrency control in the system.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;
use crate::types::{ClosureEdge, DirectEdge, NodeKey};

/// Handle to a transactional closure store.
///
/// Handles are cheap to share; every unit of work goes through [`begin`](Self::begin).
#[async_trait]
pub trait ClosureStore<N: NodeKey>: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transaction type produced by this store.
    type Tx: StoreTransaction<N, Error = Self::Error>;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Tx, Self::Error>;
}

/// An open transaction against both relations.
///
/// Implementations must guarantee deterministic ordering of results, which
/// the `BTreeSet` return types enforce. Every method is expected to be a
/// single round-trip; set-valued arguments exist so that callers never need
/// one query per row.
///
/// Dropping a transaction without calling [`commit`](Self::commit) rolls it back.
#[async_trait]
pub trait StoreTransaction<N: NodeKey>: Send {
    /// Error type for transaction operations.
    type Error: std::error::Error + Send + Sync + 'static;

    // ── direct relation ─────────────────────────────────────────────────

    /// Whether the direct edge exists.
    async fn has_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error>;

    /// Insert a direct edge. Returns false if it was already present.
    async fn insert_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error>;

    /// Delete a direct edge. Returns false if it was absent.
    async fn delete_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error>;

    /// Direct parents of a node.
    async fn parents(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error>;

    /// Direct children of a node.
    async fn children(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error>;

    /// Union of the direct children of every node in `nodes`.
    async fn children_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error>;

    /// Every direct edge, in canonical order.
    async fn all_direct(&mut self) -> Result<BTreeSet<DirectEdge<N>>, Self::Error>;

    // ── closure relation ────────────────────────────────────────────────

    /// Whether the closure row exists.
    async fn has_closure(&mut self, edge: &ClosureEdge<N>) -> Result<bool, Self::Error>;

    /// Whether `ancestor` is stored among the ancestors of `node`, looked up
    /// through the descendant-side index.
    async fn has_ancestor(&mut self, node: &N, ancestor: &N) -> Result<bool, Self::Error>;

    /// Every stored ancestor of a node.
    async fn ancestors(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error>;

    /// Every stored descendant of a node.
    async fn descendants(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error>;

    /// Union of the stored ancestors of every node in `nodes`.
    async fn ancestors_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error>;

    /// Union of the stored descendants of every node in `nodes`.
    async fn descendants_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error>;

    /// Closure rows whose ancestor is in `sources` and descendant is in `targets`.
    async fn closure_between(
        &mut self,
        sources: &BTreeSet<N>,
        targets: &BTreeSet<N>,
    ) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error>;

    /// Bulk-insert closure rows with set semantics. Returns rows actually written.
    async fn insert_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error>;

    /// Bulk-delete closure rows. Returns rows actually removed.
    async fn delete_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error>;

    /// Every closure row, in canonical order.
    async fn all_closure(&mut self) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error>;

    // ── transaction control ─────────────────────────────────────────────

    /// Push a savepoint.
    async fn savepoint(&mut self) -> Result<(), Self::Error>;

    /// Pop the innermost savepoint, keeping its changes.
    async fn release_savepoint(&mut self) -> Result<(), Self::Error>;

    /// Pop the innermost savepoint, discarding its changes.
    async fn rollback_to_savepoint(&mut self) -> Result<(), Self::Error>;

    /// Commit and consume the transaction.
    async fn commit(self) -> Result<(), Self::Error>;

    /// Roll back and consume the transaction.
    async fn rollback(self) -> Result<(), Self::Error>;
}

pub use memory::{InMemoryClosureStore, InMemoryError, InMemoryTransaction};

#[cfg(feature = "postgres")]
pub use postgres::{PgNodeKey, PoolStats, PostgresClosureStore, PostgresConfig, PostgresError, PostgresTransaction};
