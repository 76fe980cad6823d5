//! Sync tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, strictly increasing sync token.
///
/// Every mutation that should be visible to incremental sync gets a fresh
/// stoken attached to the entity it changed. Clients remember the largest
/// stoken they have seen and poll with "everything greater than this"; the
/// allocation order matching commit order guarantees they neither miss nor
/// re-fetch a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stoken(u64);

impl fmt::Display for Stoken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out stokens in strictly increasing order.
///
/// The allocator lives inside the store state and is only reachable while
/// holding the state write lock, so allocation order equals commit order.
#[derive(Debug, Default)]
pub struct Allocator {
    next: u64,
}

impl Allocator {
    /// Allocate a token strictly greater than every previously allocated one.
    pub fn allocate(&mut self) -> Stoken {
        let token = Stoken(self.next);
        self.next += 1;
        token
    }
}
