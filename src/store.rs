//! The transactional store and its engines.
//!
//! All mutating operations run under a single write guard on the shared
//! state; that guard is the transaction boundary. An operation either commits
//! all of its writes or none, and concurrent writers to the same item
//! serialize on the guard instead of racing past the etag check, so the loser
//! observes the winner's commit and fails with
//! [`EtagConflict`](Error::EtagConflict).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::chunks::{ChunkStore, MemoryChunkStore};
use crate::error::{Error, Result};
use crate::stoken::{Allocator, Stoken};
use crate::sync::{
    AccessLevel, Changes, ChunkRef, Collection, CollectionInvitation, CollectionMember, EtagCheck,
    Item, ItemEntry, ItemFields, Revision, RevisionPayload, UserId,
};
use crate::uid::Uid;

/// The server-side store for encrypted collections.
///
/// Cheap to clone; clones share state. Generic over the chunk backend so the
/// blob store can live on a filesystem or object store behind the
/// [`ChunkStore`] seam.
#[derive(Debug, Clone, Default)]
pub struct Store<C = MemoryChunkStore> {
    chunks: C,
    state: Arc<RwLock<State>>,
}

#[derive(Debug, Default)]
struct State {
    stokens: Allocator,
    collections: HashMap<Uid, CollectionState>,
    invitations: HashMap<Uid, CollectionInvitation>,
}

#[derive(Debug)]
struct CollectionState {
    collection: Collection,
    items: BTreeMap<Uid, Item>,
    members: BTreeMap<UserId, CollectionMember>,
}

/// One entry in a batch upsert.
#[derive(Debug, Clone)]
pub struct ItemBatchEntry {
    /// The item uid.
    pub uid: Uid,
    /// Optimistic-concurrency precondition for this entry.
    pub etag: EtagCheck,
    /// Fields applied if the entry creates the item.
    pub fields: ItemFields,
    /// The revision to commit.
    pub payload: RevisionPayload,
}

impl Store<MemoryChunkStore> {
    /// Create a store backed by an in-memory chunk store.
    pub fn memory() -> Self {
        Self::default()
    }
}

impl<C: ChunkStore> Store<C> {
    /// Create a store on top of an existing chunk backend.
    pub fn with_chunks(chunks: C) -> Self {
        Self {
            chunks,
            state: Default::default(),
        }
    }

    /// The chunk backend.
    pub fn chunks(&self) -> &C {
        &self.chunks
    }

    // Collection engine

    /// Create a collection: the collection row, its main item with the
    /// initial revision, and an [`AccessLevel::Admin`] membership for
    /// `owner`, all in one transaction.
    ///
    /// A create must start from "no prior state": a non-null `etag` fails
    /// with [`Error::Validation`] before anything is written.
    pub fn create_collection(
        &self,
        uid: Uid,
        owner: UserId,
        encryption_key: Bytes,
        version: u8,
        etag: Option<Uid>,
        payload: RevisionPayload,
    ) -> Result<Collection> {
        if etag.is_some() {
            return Err(Error::Validation {
                reason: "etag must be null when creating a collection",
            });
        }
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            ..
        } = &mut *guard;
        if collections.contains_key(&uid) {
            return Err(Error::Integrity {
                reason: "collection uid already exists",
            });
        }
        let mut main_item = Item::new(version, None);
        commit_revision(&self.chunks, stokens, &mut main_item, payload)?;
        let collection = Collection::new(uid, version, owner.clone(), main_item);
        let member = CollectionMember::new(
            owner.clone(),
            AccessLevel::Admin,
            encryption_key,
            stokens.allocate(),
        );
        let mut members = BTreeMap::new();
        members.insert(owner, member);
        collections.insert(
            uid,
            CollectionState {
                collection: collection.clone(),
                items: BTreeMap::new(),
                members,
            },
        );
        debug!(collection = %uid, "created collection");
        Ok(collection)
    }

    /// Commit a new revision of the collection's main item.
    ///
    /// `etag` must match the collection's current etag, which is always the
    /// main item's current revision uid.
    pub fn update_collection(
        &self,
        uid: &Uid,
        etag: Option<Uid>,
        payload: RevisionPayload,
    ) -> Result<Collection> {
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            ..
        } = &mut *guard;
        let col = collections.get_mut(uid).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let expected = col.collection.etag();
        if etag != expected {
            return Err(Error::EtagConflict {
                expected,
                got: etag,
            });
        }
        commit_revision(&self.chunks, stokens, col.collection.main_item_mut(), payload)?;
        debug!(collection = %uid, "updated collection");
        Ok(col.collection.clone())
    }

    /// Look up a collection.
    pub fn get_collection(&self, uid: &Uid) -> Result<Collection> {
        let state = self.state.read();
        state
            .collections
            .get(uid)
            .map(|col| col.collection.clone())
            .ok_or(Error::NotFound {
                kind: "collection",
            })
    }

    /// Collections the given user is a member of, in uid order.
    pub fn collections_for_user(&self, user: &UserId) -> Vec<Collection> {
        let state = self.state.read();
        let mut out: Vec<_> = state
            .collections
            .values()
            .filter(|col| col.members.contains_key(user))
            .map(|col| col.collection.clone())
            .collect();
        out.sort_by_key(|c| c.uid());
        out
    }

    /// The collection's high-water stoken: the largest token attached to any
    /// of its revisions or memberships. `None` is impossible for an existing
    /// collection (creation allocates tokens), but kept in the type to match
    /// the cursor shape.
    pub fn collection_stoken(&self, uid: &Uid) -> Result<Option<Stoken>> {
        let state = self.state.read();
        let col = state.collections.get(uid).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let main = col
            .collection
            .main_item()
            .current_revision()
            .map(|r| r.stoken());
        let items = col
            .items
            .values()
            .filter_map(|item| item.current_revision().map(|r| r.stoken()))
            .max();
        let members = col.members.values().map(|m| m.stoken()).max();
        Ok([main, items, members].into_iter().flatten().max())
    }

    // Item engine

    /// Create or update an item, gated by optimistic concurrency.
    ///
    /// With [`EtagCheck::Expect`], the supplied etag must equal the item's
    /// current etag (`None` when the item does not exist yet); a mismatch
    /// fails with [`Error::EtagConflict`] and leaves the item unchanged.
    /// `fields` only apply when the upsert creates the item.
    pub fn upsert_item(
        &self,
        collection: &Uid,
        uid: Uid,
        etag: EtagCheck,
        fields: ItemFields,
        payload: RevisionPayload,
    ) -> Result<ItemEntry> {
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            ..
        } = &mut *guard;
        let col = collections.get_mut(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        match col.items.get_mut(&uid) {
            Some(item) => {
                let expected = item.etag();
                if let EtagCheck::Expect(got) = etag {
                    if got != expected {
                        return Err(Error::EtagConflict { expected, got });
                    }
                }
                let stoken = commit_revision(&self.chunks, stokens, item, payload)?;
                trace!(collection = %collection, item = %uid, %stoken, "updated item");
                Ok(ItemEntry {
                    uid,
                    item: item.clone(),
                })
            }
            None => {
                if let EtagCheck::Expect(got @ Some(_)) = etag {
                    return Err(Error::EtagConflict {
                        expected: None,
                        got,
                    });
                }
                let mut item = Item::new(fields.version, fields.encryption_key);
                let stoken = commit_revision(&self.chunks, stokens, &mut item, payload)?;
                trace!(collection = %collection, item = %uid, %stoken, "created item");
                let entry = ItemEntry {
                    uid,
                    item: item.clone(),
                };
                col.items.insert(uid, item);
                Ok(entry)
            }
        }
    }

    /// Apply a batch of upserts, all-or-nothing.
    ///
    /// `deps` are `(uid, etag)` preconditions on items *not* in the batch:
    /// "this change depends on item X being unchanged". Every precondition,
    /// etag gate and chunk reference is validated before any revision is
    /// committed, so a failing entry aborts the whole batch.
    pub fn upsert_items(
        &self,
        collection: &Uid,
        entries: Vec<ItemBatchEntry>,
        deps: &[(Uid, Uid)],
    ) -> Result<Vec<ItemEntry>> {
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            ..
        } = &mut *guard;
        let col = collections.get_mut(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        for (uid, etag) in deps {
            let item = col.items.get(uid).ok_or(Error::NotFound { kind: "item" })?;
            let expected = item.etag();
            if expected != Some(*etag) {
                return Err(Error::EtagConflict {
                    expected,
                    got: Some(*etag),
                });
            }
        }
        // validate everything up front; the apply phase below cannot fail
        let mut seen = BTreeSet::new();
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.uid) {
                return Err(Error::Validation {
                    reason: "duplicate item uid in batch",
                });
            }
            let existing = col.items.get(&entry.uid);
            let expected = existing.and_then(|item| item.etag());
            if let EtagCheck::Expect(got) = entry.etag {
                if got != expected {
                    return Err(Error::EtagConflict { expected, got });
                }
            }
            if let Some(item) = existing {
                check_revision_uid(item, entry.payload.uid)?;
            }
            let chunks = resolve_chunks(&self.chunks, entry.payload.chunks)?;
            pending.push(Pending {
                uid: entry.uid,
                fields: entry.fields,
                revision_uid: entry.payload.uid,
                meta: entry.payload.meta,
                deleted: entry.payload.deleted,
                chunks,
            });
        }
        let mut out = Vec::with_capacity(pending.len());
        for p in pending {
            let stoken = stokens.allocate();
            let item = col
                .items
                .entry(p.uid)
                .or_insert_with(|| Item::new(p.fields.version, p.fields.encryption_key));
            item.push_revision(Revision::new(
                p.revision_uid,
                stoken,
                p.meta,
                p.deleted,
                p.chunks,
            ));
            out.push(ItemEntry {
                uid: p.uid,
                item: item.clone(),
            });
        }
        debug!(collection = %collection, count = out.len(), "batch upsert");
        Ok(out)
    }

    /// Look up an item.
    pub fn get_item(&self, collection: &Uid, uid: &Uid) -> Result<ItemEntry> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        col.items
            .get(uid)
            .map(|item| ItemEntry {
                uid: *uid,
                item: item.clone(),
            })
            .ok_or(Error::NotFound { kind: "item" })
    }

    /// An item's revision history in commit order, current revision last.
    pub fn item_revisions(&self, collection: &Uid, uid: &Uid) -> Result<Vec<Revision>> {
        Ok(self.get_item(collection, uid)?.item.revisions().to_vec())
    }

    /// Validate a "depends on item X being unchanged" precondition.
    pub fn check_item_dep(&self, collection: &Uid, uid: &Uid, etag: Uid) -> Result<()> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let item = col.items.get(uid).ok_or(Error::NotFound { kind: "item" })?;
        let expected = item.etag();
        if expected != Some(etag) {
            return Err(Error::EtagConflict {
                expected,
                got: Some(etag),
            });
        }
        Ok(())
    }

    // Membership & invitation engine

    /// Look up a member of a collection.
    pub fn get_member(&self, collection: &Uid, user: &UserId) -> Result<CollectionMember> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        col.members
            .get(user)
            .cloned()
            .ok_or(Error::NotFound { kind: "member" })
    }

    /// All members of a collection, in user order.
    pub fn list_members(&self, collection: &Uid) -> Result<Vec<CollectionMember>> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        Ok(col.members.values().cloned().collect())
    }

    /// Change a member's access level.
    ///
    /// A no-op when the level is unchanged; otherwise the member gets a fresh
    /// stoken so member-list sync picks the change up.
    pub fn change_access_level(
        &self,
        collection: &Uid,
        user: &UserId,
        access_level: AccessLevel,
    ) -> Result<CollectionMember> {
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            ..
        } = &mut *guard;
        let col = collections.get_mut(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let member = col
            .members
            .get_mut(user)
            .ok_or(Error::NotFound { kind: "member" })?;
        if member.access_level() != access_level {
            member.set_access_level(access_level, stokens.allocate());
            debug!(collection = %collection, user = %user, "changed access level");
        }
        Ok(member.clone())
    }

    /// Create an invitation.
    ///
    /// Fails with [`Error::Validation`] on self-invites and
    /// [`Error::NotFound`] when the inviter is not a member. At most one
    /// invitation per (collection, invitee) is kept pending; a newer one
    /// replaces it. No stoken is allocated.
    pub fn invite(&self, invitation: CollectionInvitation) -> Result<CollectionInvitation> {
        if invitation.user() == invitation.from_user() {
            return Err(Error::Validation {
                reason: "inviting yourself is not allowed",
            });
        }
        let mut guard = self.state.write();
        let State {
            collections,
            invitations,
            ..
        } = &mut *guard;
        let col = collections
            .get(&invitation.collection())
            .ok_or(Error::NotFound {
                kind: "collection",
            })?;
        if !col.members.contains_key(invitation.from_user()) {
            return Err(Error::NotFound { kind: "member" });
        }
        invitations.retain(|_, inv| {
            inv.collection() != invitation.collection() || inv.user() != invitation.user()
        });
        invitations.insert(invitation.uid(), invitation.clone());
        debug!(collection = %invitation.collection(), user = %invitation.user(), "invited");
        Ok(invitation)
    }

    /// Accept an invitation: mint the membership with a fresh stoken and
    /// delete the invitation, atomically.
    ///
    /// `encryption_key` is the collection key re-wrapped by the invitee; the
    /// server stores it opaquely and performs no verification. Fails with
    /// [`Error::Integrity`] when a membership for the (collection, user) pair
    /// already exists.
    pub fn accept_invitation(
        &self,
        uid: &Uid,
        encryption_key: Bytes,
    ) -> Result<CollectionMember> {
        let mut guard = self.state.write();
        let State {
            stokens,
            collections,
            invitations,
        } = &mut *guard;
        let invitation = invitations.get(uid).ok_or(Error::NotFound {
            kind: "invitation",
        })?;
        let col = collections
            .get_mut(&invitation.collection())
            .ok_or(Error::NotFound {
                kind: "collection",
            })?;
        if col.members.contains_key(invitation.user()) {
            return Err(Error::Integrity {
                reason: "membership already exists",
            });
        }
        let member = CollectionMember::new(
            invitation.user().clone(),
            invitation.access_level(),
            encryption_key,
            stokens.allocate(),
        );
        col.members.insert(member.user().clone(), member.clone());
        debug!(collection = %invitation.collection(), user = %member.user(), "accepted invitation");
        invitations.remove(uid);
        Ok(member)
    }

    /// Update a pending invitation's access level and signed key in place.
    pub fn update_invitation(
        &self,
        uid: &Uid,
        access_level: AccessLevel,
        signed_encryption_key: Bytes,
    ) -> Result<CollectionInvitation> {
        let mut guard = self.state.write();
        let invitation = guard.invitations.get_mut(uid).ok_or(Error::NotFound {
            kind: "invitation",
        })?;
        invitation.update(access_level, signed_encryption_key);
        Ok(invitation.clone())
    }

    /// Look up a pending invitation.
    pub fn get_invitation(&self, uid: &Uid) -> Result<CollectionInvitation> {
        self.state
            .read()
            .invitations
            .get(uid)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "invitation",
            })
    }

    /// Pending invitations addressed to `user`, in uid order.
    pub fn pending_invitations(&self, user: &UserId) -> Vec<CollectionInvitation> {
        let state = self.state.read();
        let mut out: Vec<_> = state
            .invitations
            .values()
            .filter(|inv| inv.user() == user)
            .cloned()
            .collect();
        out.sort_by_key(|inv| inv.uid());
        out
    }

    // Sync pull

    /// Standalone items changed since the cursor, ascending stoken order.
    ///
    /// `since = None` is a full sync. Tombstoned items are included so
    /// clients learn about deletions. The main item is not listed here; its
    /// changes surface through the collection itself.
    pub fn items_since(
        &self,
        collection: &Uid,
        since: Option<Stoken>,
    ) -> Result<Changes<ItemEntry>> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let mut changed: Vec<(Stoken, ItemEntry)> = col
            .items
            .iter()
            .filter_map(|(uid, item)| {
                let stoken = item.current_revision().map(|r| r.stoken())?;
                (Some(stoken) > since).then(|| {
                    (
                        stoken,
                        ItemEntry {
                            uid: *uid,
                            item: item.clone(),
                        },
                    )
                })
            })
            .collect();
        changed.sort_by_key(|(stoken, _)| *stoken);
        let stoken = changed.last().map(|(stoken, _)| *stoken).or(since);
        Ok(Changes {
            entries: changed.into_iter().map(|(_, entry)| entry).collect(),
            stoken,
        })
    }

    /// Memberships changed since the cursor, ascending stoken order.
    pub fn members_since(
        &self,
        collection: &Uid,
        since: Option<Stoken>,
    ) -> Result<Changes<CollectionMember>> {
        let state = self.state.read();
        let col = state.collections.get(collection).ok_or(Error::NotFound {
            kind: "collection",
        })?;
        let mut changed: Vec<_> = col
            .members
            .values()
            .filter(|member| Some(member.stoken()) > since)
            .cloned()
            .collect();
        changed.sort_by_key(|member| member.stoken());
        let stoken = changed.last().map(|member| member.stoken()).or(since);
        Ok(Changes {
            entries: changed,
            stoken,
        })
    }
}

struct Pending {
    uid: Uid,
    fields: ItemFields,
    revision_uid: Uid,
    meta: Bytes,
    deleted: bool,
    chunks: Vec<Uid>,
}

/// Resolve payload chunk references against the chunk store.
///
/// Inline content is stored with first-write semantics; bare references must
/// already exist. Chunk writes are the only side effect allowed to survive an
/// aborted operation (they are idempotent and content-keyed).
fn resolve_chunks<C: ChunkStore>(chunks: &C, refs: Vec<ChunkRef>) -> Result<Vec<Uid>> {
    let mut uids = Vec::with_capacity(refs.len());
    for chunk in refs {
        match chunk.content {
            Some(content) => chunks.put_if_absent(chunk.uid, content)?,
            None if !chunks.contains(&chunk.uid) => {
                return Err(Error::UnknownChunk { uid: chunk.uid })
            }
            None => {}
        }
        uids.push(chunk.uid);
    }
    Ok(uids)
}

fn check_revision_uid(item: &Item, uid: Uid) -> Result<()> {
    if item.revisions().iter().any(|r| r.uid() == uid) {
        return Err(Error::Integrity {
            reason: "revision uid already used for this item",
        });
    }
    Ok(())
}

/// Resolve chunks, allocate a stoken and append the new revision.
///
/// Everything that can fail happens before the push, so a failed commit
/// leaves the item untouched. The append supersedes the previous current
/// revision by position; together with the caller holding the state write
/// lock this keeps "exactly one current revision" true at every commit point.
fn commit_revision<C: ChunkStore>(
    chunks: &C,
    stokens: &mut Allocator,
    item: &mut Item,
    payload: RevisionPayload,
) -> Result<Stoken> {
    check_revision_uid(item, payload.uid)?;
    let chunk_uids = resolve_chunks(chunks, payload.chunks)?;
    let stoken = stokens.allocate();
    item.push_revision(Revision::new(
        payload.uid,
        stoken,
        payload.meta,
        payload.deleted,
        chunk_uids,
    ));
    Ok(stoken)
}
