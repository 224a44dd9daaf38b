//! # closure-kernel
//!
//! Incremental closure-table maintenance for directed acyclic graphs.
//!
//! The kernel keeps two relations in step:
//!
//! - **direct edges**: immediate `parent → child` pairs
//! - **closure rows**: every `ancestor → descendant` pair implied by a path
//!
//! so that ancestry questions are answered by a single lookup instead of a
//! graph walk.
//!
//! ## Architecture
//!
//! ```text
//! caller → EdgeCoordinator ─┬→ CycleGuard      (reject cycles, skip implied edges)
//!                           ├→ ClosureSet      (merge / prune, lock-guarded)
//!                           └→ DirectEdgeSet   (parent → child rows)
//!                                   ↓
//!                    ClosureStore (Postgres or Memory)
//! ```
//!
//! ## Invariants
//!
//! - After every commit, `(a, d)` is a closure row iff `a ≠ d` and a
//!   non-empty path `a → … → d` exists over the direct edges
//! - Adding an edge that would close a cycle fails and writes nothing
//! - Adding an edge that is already implied succeeds and writes nothing
//! - The closure relation is only mutated while a [`ClosureSet`] is unlocked,
//!   and every unlock is scoped

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod config;
pub mod error;
pub mod store;
pub mod guard;
pub mod direct;
pub mod closure;
pub mod coordinator;
pub mod snapshot;
pub mod canonical;

// Re-exports
pub use types::{NodeKey, DirectEdge, ClosureEdge};
pub use config::{ClosureSchema, PruneStrategy, SchemaError, UnknownStrategy};
pub use error::{EdgeError, EdgeResult};
pub use store::{ClosureStore, StoreTransaction, InMemoryClosureStore, InMemoryError};
#[cfg(feature = "postgres")]
pub use store::{PgNodeKey, PostgresClosureStore, PostgresConfig, PostgresError};
pub use guard::CycleGuard;
pub use direct::DirectEdgeSet;
pub use closure::{ClosureSet, Unlocked, closure_delta, local_prune_set};
pub use coordinator::{AddOutcome, EdgeCoordinator};
pub use snapshot::{ClosureSnapshot, ClosureDrift, transitive_closure};
pub use canonical::{to_canonical_bytes, canonical_hash, canonical_hash_hex};
