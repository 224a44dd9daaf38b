//! Node key bound for the closure kernel.

use std::fmt::Debug;
use std::hash::Hash;

/// Opaque identifier of a graph vertex.
///
/// Node identity is owned by the host application. The kernel only needs
/// keys to be totally ordered (for deterministic result sets) and cheap
/// enough to clone into row sets.
///
/// Implemented for every type meeting the bounds, so `i64`, `u64`,
/// `String` and `uuid::Uuid` work out of the box.
pub trait NodeKey: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

impl<T> NodeKey for T where T: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn assert_key<N: NodeKey>() {}

    #[test]
    fn test_common_key_types() {
        assert_key::<i64>();
        assert_key::<u64>();
        assert_key::<String>();
        assert_key::<Uuid>();
    }
}
