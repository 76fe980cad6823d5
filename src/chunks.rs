//! Content-addressed storage for encrypted chunks.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::uid::Uid;

/// A content-addressed store for immutable encrypted chunks.
///
/// Chunk uids are derived from the plaintext on the client; the server treats
/// them as opaque keys. Deduplication is global: the same uid uploaded by any
/// number of items or collections stores exactly one chunk. No deletion is
/// exposed; unreferenced chunks are inert.
pub trait ChunkStore: Send + Sync + 'static {
    /// Store `data` under `uid` unless a chunk with that uid already exists.
    ///
    /// Writing the same `(uid, content)` pair twice is a no-op, so concurrent
    /// uploads of the same chunk never conflict. A uid that already exists
    /// with *different* content fails with [`Error::Integrity`]: a
    /// content-derived uid implies identical content.
    fn put_if_absent(&self, uid: Uid, data: Bytes) -> Result<()>;

    /// Fetch the chunk stored under `uid`.
    fn get(&self, uid: &Uid) -> Result<Bytes>;

    /// Whether a chunk with this uid exists.
    fn contains(&self, uid: &Uid) -> bool;
}

impl<S: ChunkStore> ChunkStore for Arc<S> {
    fn put_if_absent(&self, uid: Uid, data: Bytes) -> Result<()> {
        (**self).put_if_absent(uid, data)
    }

    fn get(&self, uid: &Uid) -> Result<Bytes> {
        (**self).get(uid)
    }

    fn contains(&self, uid: &Uid) -> bool {
        (**self).contains(uid)
    }
}

/// In-memory chunk store.
///
/// Cheap to clone; clones share the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryChunkStore {
    chunks: Arc<RwLock<HashMap<Uid, Bytes>>>,
}

impl MemoryChunkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put_if_absent(&self, uid: Uid, data: Bytes) -> Result<()> {
        let mut chunks = self.chunks.write();
        match chunks.get(&uid) {
            Some(existing) if *existing == data => Ok(()),
            Some(_) => Err(Error::Integrity {
                reason: "chunk uid exists with different content",
            }),
            None => {
                chunks.insert(uid, data);
                Ok(())
            }
        }
    }

    fn get(&self, uid: &Uid) -> Result<Bytes> {
        self.chunks
            .read()
            .get(uid)
            .cloned()
            .ok_or(Error::NotFound { kind: "chunk" })
    }

    fn contains(&self, uid: &Uid) -> bool {
        self.chunks.read().contains_key(uid)
    }
}
