//! Core data model for encrypted collections.
//!
//! A collection is a set of encrypted items shared between members. Each item
//! carries a chronological chain of revisions; each revision references an
//! ordered list of content-addressed chunks holding the actual ciphertext.
//! The server never interprets any of the encrypted fields.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::stoken::Stoken;
use crate::uid::Uid;

/// A user known to the surrounding account layer.
///
/// The core does not manage accounts; it only keys memberships and
/// invitations by this identifier.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[display("{_0}")]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// What a member may do inside a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    /// May pull but not push.
    ReadOnly,
    /// May pull and push items.
    ReadWrite,
    /// May additionally manage members and invitations.
    Admin,
}

/// One link in an item's chronological revision chain.
///
/// Immutable once committed. Whether a revision is the item's current one is
/// positional: the last revision of an [`Item`] is current, every earlier one
/// has been superseded exactly once and never comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    uid: Uid,
    stoken: Stoken,
    meta: Bytes,
    deleted: bool,
    chunks: Vec<Uid>,
}

impl Revision {
    pub(crate) fn new(
        uid: Uid,
        stoken: Stoken,
        meta: Bytes,
        deleted: bool,
        chunks: Vec<Uid>,
    ) -> Self {
        Self {
            uid,
            stoken,
            meta,
            deleted,
            chunks,
        }
    }

    /// The revision uid. Doubles as the item's etag while this revision is
    /// current.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The sync token allocated when this revision was committed.
    pub fn stoken(&self) -> Stoken {
        self.stoken
    }

    /// Encrypted revision metadata.
    pub fn meta(&self) -> &Bytes {
        &self.meta
    }

    /// Whether this revision tombstones the item.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Chunk uids in content order. Order matters for reconstruction.
    pub fn chunks(&self) -> &[Uid] {
        &self.chunks
    }
}

/// An item's encrypted state and history.
///
/// Revisions are append-only and ordered by stoken. The last revision is the
/// current one, which makes "exactly one current revision" hold by
/// construction rather than by a mutable flag. An item exposed by the store
/// always has at least one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    version: u8,
    encryption_key: Option<Bytes>,
    revisions: Vec<Revision>,
}

impl Item {
    pub(crate) fn new(version: u8, encryption_key: Option<Bytes>) -> Self {
        Self {
            version,
            encryption_key,
            revisions: Vec::new(),
        }
    }

    pub(crate) fn push_revision(&mut self, revision: Revision) {
        self.revisions.push(revision);
    }

    /// Schema version of the item's encrypted content.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The per-item wrapped encryption key, if the item has its own.
    pub fn encryption_key(&self) -> Option<&Bytes> {
        self.encryption_key.as_ref()
    }

    /// The revision representing the item's present state.
    pub fn current_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// The item's etag: the uid of its current revision.
    ///
    /// `None` is the "no prior state" sentinel used for creation.
    pub fn etag(&self) -> Option<Uid> {
        self.current_revision().map(|r| r.uid())
    }

    /// Whether the current revision is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.current_revision().map(|r| r.is_deleted()).unwrap_or(false)
    }

    /// Full revision history in commit (= stoken) order, current last.
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }
}

/// A standalone item paired with its uid.
///
/// A collection's main item has no uid of its own; the distinction between
/// standalone items and the main item is carried by where the item lives
/// ([`Collection`] holds its main item directly) instead of a nullable uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEntry {
    /// The item uid, unique within its collection.
    pub uid: Uid,
    /// The item state and history.
    pub item: Item,
}

/// A collection of encrypted items shared between members.
///
/// The collection's own encrypted metadata lives in its main item; the
/// collection etag is always derived from that item and never stored
/// separately, so the two cannot drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    uid: Uid,
    version: u8,
    owner: UserId,
    main_item: Item,
}

impl Collection {
    pub(crate) fn new(uid: Uid, version: u8, owner: UserId, main_item: Item) -> Self {
        Self {
            uid,
            version,
            owner,
            main_item,
        }
    }

    pub(crate) fn main_item_mut(&mut self) -> &mut Item {
        &mut self.main_item
    }

    /// The collection uid.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Schema version of the collection's encrypted content.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The user who created the collection.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// The distinguished item holding the collection's own encrypted
    /// metadata and content.
    pub fn main_item(&self) -> &Item {
        &self.main_item
    }

    /// The collection etag: the uid of the main item's current revision.
    pub fn etag(&self) -> Option<Uid> {
        self.main_item.etag()
    }
}

/// A user's membership in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMember {
    user: UserId,
    access_level: AccessLevel,
    encryption_key: Bytes,
    stoken: Stoken,
}

impl CollectionMember {
    pub(crate) fn new(
        user: UserId,
        access_level: AccessLevel,
        encryption_key: Bytes,
        stoken: Stoken,
    ) -> Self {
        Self {
            user,
            access_level,
            encryption_key,
            stoken,
        }
    }

    pub(crate) fn set_access_level(&mut self, access_level: AccessLevel, stoken: Stoken) {
        self.access_level = access_level;
        self.stoken = stoken;
    }

    /// The member.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// What the member may do.
    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    /// The collection key wrapped for this user.
    pub fn encryption_key(&self) -> &Bytes {
        &self.encryption_key
    }

    /// Advances whenever the access level changes, so member lists can be
    /// synced incrementally like items.
    pub fn stoken(&self) -> Stoken {
        self.stoken
    }
}

/// A pending invitation into a collection.
///
/// Ephemeral: accepting it mints a [`CollectionMember`] and deletes the
/// invitation. Invitations carry no stoken; they are not part of the sync
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInvitation {
    uid: Uid,
    collection: Uid,
    from_user: UserId,
    user: UserId,
    access_level: AccessLevel,
    signed_encryption_key: Bytes,
    version: u8,
}

impl CollectionInvitation {
    /// Build an invitation. `signed_encryption_key` is the collection key
    /// wrapped and signed for the invitee; the server stores it opaquely.
    pub fn new(
        uid: Uid,
        collection: Uid,
        from_user: UserId,
        user: UserId,
        access_level: AccessLevel,
        signed_encryption_key: Bytes,
        version: u8,
    ) -> Self {
        Self {
            uid,
            collection,
            from_user,
            user,
            access_level,
            signed_encryption_key,
            version,
        }
    }

    pub(crate) fn update(&mut self, access_level: AccessLevel, signed_encryption_key: Bytes) {
        self.access_level = access_level;
        self.signed_encryption_key = signed_encryption_key;
    }

    /// The invitation uid.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The collection the invitee is being invited into.
    pub fn collection(&self) -> Uid {
        self.collection
    }

    /// The inviting member.
    pub fn from_user(&self) -> &UserId {
        &self.from_user
    }

    /// The invitee.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The access level the membership will get on accept.
    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    /// The signed wrapped collection key for the invitee.
    pub fn signed_encryption_key(&self) -> &Bytes {
        &self.signed_encryption_key
    }

    /// Invitation format version.
    pub fn version(&self) -> u8 {
        self.version
    }
}

/// Reference to a chunk in a revision payload.
///
/// Inline content is stored on first write (dedup keyed by uid); a bare uid
/// must already exist in the chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content-derived chunk uid.
    pub uid: Uid,
    /// Inline encrypted content, if the client uploaded it with this
    /// revision.
    pub content: Option<Bytes>,
}

impl ChunkRef {
    /// Reference an already-stored chunk by uid.
    pub fn bare(uid: Uid) -> Self {
        Self { uid, content: None }
    }

    /// Reference a chunk and upload its content along.
    pub fn inline(uid: Uid, content: impl Into<Bytes>) -> Self {
        Self {
            uid,
            content: Some(content.into()),
        }
    }
}

/// Everything needed to commit one new revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPayload {
    /// Uid of the new revision, derived on the client.
    pub uid: Uid,
    /// Encrypted revision metadata.
    pub meta: Bytes,
    /// Whether this revision tombstones the item.
    pub deleted: bool,
    /// Chunk references in content order.
    pub chunks: Vec<ChunkRef>,
}

/// Validated item fields, applied when the upsert creates the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFields {
    /// Schema version of the item's encrypted content.
    pub version: u8,
    /// Per-item wrapped encryption key, if any.
    pub encryption_key: Option<Bytes>,
}

/// Optimistic-concurrency precondition for an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtagCheck {
    /// Apply without checking. Used by transports that explicitly ask for an
    /// unconditional write.
    Ignore,
    /// The item's current etag must equal the given value; `None` means
    /// "no prior state", i.e. the item must not exist yet.
    Expect(Option<Uid>),
}

/// A batch of changes since a sync cursor.
#[derive(Debug, Clone)]
pub struct Changes<T> {
    /// Changed entries in ascending stoken order.
    pub entries: Vec<T>,
    /// New high-water cursor. Equals the request cursor when nothing
    /// changed; `None` only if the request cursor was `None` and nothing has
    /// ever changed.
    pub stoken: Option<Stoken>,
}
