//! Error taxonomy for edge operations.

/// Error type for guarded closure and coordinator operations.
///
/// Generic over the node key `N` (carried by [`EdgeError::Cycle`]) and the
/// backend error `E`, which is propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError<N, E> {
    /// The requested edge would make `child` an ancestor of itself.
    #[error("Attempting to create a cycle: {child:?} is already an ancestor of {parent:?}")]
    Cycle {
        /// Requested parent.
        parent: N,
        /// Requested child.
        child: N,
    },
    /// A mutating closure operation was attempted while the closure set was locked.
    #[error("Closure relationship is locked; ancestry can only change through direct parent/child edges")]
    LockedRelationship,
    /// Backend failure.
    #[error(transparent)]
    Store(#[from] E),
}

impl<N, E> EdgeError<N, E> {
    /// Whether this error is a rejected cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }

    /// Whether this error comes from the lock guard.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::LockedRelationship)
    }

    /// Whether this error came from the backend.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result alias for edge operations.
pub type EdgeResult<T, N, E> = Result<T, EdgeError<N, E>>;
