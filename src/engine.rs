//! # Engine Core
//!
//! The operation surface the collection handles are built on: open/create,
//! key read/write/delete/exists, ordered key traversal, and the
//! begin/commit/rollback protocol. One `Engine` is one instance over one
//! file; several instances (same process or not) coordinate purely through
//! the file's advisory lock and header state.
//!
//! ## Operation Anatomy
//!
//! Every operation takes the file lock (shared for reads, exclusive for
//! mutations), resolves the target collection's reference sector (a
//! stale handle resolves to "absent" instead of touching freed bytes),
//! then works the cascade/KeyLocator/value machinery under that lock.
//!
//! ## Write Ordering
//!
//! Mutations are ordered so the root-visible reference is the last thing
//! written: value chains are placed first, the KeyLocator is stored next,
//! and only then is the BucketList entry published. A crash in between
//! leaks unreachable sectors but never publishes a dangling reference.
//!
//! ## Transactions
//!
//! `begin` allocates an id from the header table; reads fall through to
//! HEAD until the transaction touches a key; writes land in the
//! transaction's own slot. The instance keeps the set of KeyLocators it
//! touched and walks exactly that set at commit (fold into HEAD) or
//! rollback (discard). Isolation is paid by writers: every HEAD mutation
//! first snapshots the pre-mutation HEAD into a slot for each other open
//! transaction that lacks one.

use eyre::{bail, ensure, Result};
use hashbrown::HashSet;
use smallvec::SmallVec;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::audit::AuditLog;
use crate::config::{Filters, OpenOptions};
use crate::digest::DigestFn;
use crate::error::ErrorKind;
use crate::mvcc::{KeyLocator, LiveTxns, Slot, TxnTable};
use crate::sector::data::{self, RefSector};
use crate::sector::{
    Params, SectorClass, PAYLOAD_ARRAY, PAYLOAD_HASH, PAYLOAD_NULL, PAYLOAD_SCALAR,
};
use crate::storage::{header_size, Freelist, HeaderPrefix, LockMode, StorageFile, TXN_SLOT_COUNT};
use crate::trie::Cascade;

/// Collection kind: map (byte-string keys) or sequence (integer indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollKind {
    Map,
    Seq,
}

impl CollKind {
    pub fn payload(self) -> u8 {
        match self {
            CollKind::Map => PAYLOAD_HASH,
            CollKind::Seq => PAYLOAD_ARRAY,
        }
    }

    pub fn from_payload(payload: u8) -> Result<Self> {
        match payload {
            PAYLOAD_HASH => Ok(CollKind::Map),
            PAYLOAD_ARRAY => Ok(CollKind::Seq),
            other => bail!(ErrorKind::corrupt(format!(
                "payload {other:#04x} is not a collection kind"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CollKind::Map => "map",
            CollKind::Seq => "sequence",
        }
    }
}

/// A resolved collection: the offset of its reference sector plus the
/// staleness counter observed at resolution. Handles carry this; every
/// operation re-validates it so freed or reused sectors read as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollRef {
    pub off: u64,
    pub staleness: u32,
    pub kind: CollKind,
}

/// A value as stored under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Null,
    Bytes(Vec<u8>),
    Collection(CollRef),
}

/// A fetched entry: the value plus its class tag, when one was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: StoredValue,
    pub class: Option<Vec<u8>>,
}

/// A value being stored. Collections are passed by their already-built
/// reference sector; the entity layer materializes literals child-first.
#[derive(Debug, Clone, Copy)]
pub enum NewValue<'a> {
    Null,
    Bytes(&'a [u8]),
    Collection(CollRef),
}

/// How a key reaches the engine. `Bytes` runs through the store-key
/// filter; `Index` is a sequence index in its decimal stored form;
/// `Raw` is the already-stored form (internal pseudo-keys, compaction).
#[derive(Debug, Clone, Copy)]
pub enum KeyArg<'a> {
    Bytes(&'a [u8]),
    Index(u64),
    Raw(&'a [u8]),
}

pub struct Engine {
    storage: StorageFile,
    freelist: Freelist,
    txns: TxnTable,
    params: Params,
    digest: DigestFn,
    filters: Filters,
    audit: Option<AuditLog>,
    autobless: bool,
    header_offset: u64,
    base_off: u64,
    root_kind: CollKind,
    tid: u8,
    modified: HashSet<u64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.storage.path())
            .field("params", &self.params)
            .field("tid", &self.tid)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn open(opts: OpenOptions) -> Result<Self> {
        let mut storage =
            StorageFile::open(&opts.path, opts.readonly, opts.locking, opts.autoflush)?;
        storage.lock(if opts.readonly {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        })?;
        let setup = Self::open_inner(&mut storage, &opts);
        let unlock = storage.unlock();
        let (params, base_off) = setup?;
        unlock?;

        Ok(Self {
            storage,
            freelist: Freelist::new(opts.file_offset, params),
            txns: TxnTable::new(opts.file_offset),
            params,
            digest: opts.digest,
            filters: opts.filters,
            audit: opts.audit,
            autobless: opts.autobless,
            header_offset: opts.file_offset,
            base_off,
            root_kind: opts.root_kind,
            tid: 0,
            modified: HashSet::new(),
        })
    }

    fn open_inner(storage: &mut StorageFile, opts: &OpenOptions) -> Result<(Params, u64)> {
        let len = storage.len()?;
        if len <= opts.file_offset {
            ensure!(!opts.readonly, ErrorKind::NotADb);
            Self::create_file(storage, opts)
        } else {
            Self::load_file(storage, opts)
        }
    }

    fn create_file(storage: &mut StorageFile, opts: &OpenOptions) -> Result<(Params, u64)> {
        let params = Params::new(
            opts.byte_size,
            opts.digest.size,
            opts.max_buckets,
            crate::storage::DEFAULT_FANOUT,
        )?;
        let header_end = opts.file_offset + header_size(&params);
        let len = storage.len()?;
        storage.allocate(header_end - len)?;

        let prefix = HeaderPrefix::new(&params);
        storage.write_at(opts.file_offset, prefix.as_bytes())?;

        let freelist = Freelist::new(opts.file_offset, params);
        let base = KeyLocator::create(storage, &freelist, &params, b"")?;
        ensure!(
            base.offset() == header_end,
            ErrorKind::corrupt("base locator landed off its fixed position".to_string())
        );

        let root_index = {
            let mut cascade = Cascade {
                storage,
                freelist: &freelist,
                params: &params,
            };
            cascade.create_root()?
        };
        let (ref_off, _) = data::write_ref(
            storage,
            &freelist,
            &params,
            opts.root_kind.payload(),
            root_index,
        )?;

        let mut base = base;
        base.put_slot(
            Slot {
                value_off: ref_off,
                tid: 0,
                deleted: false,
            },
            |_| false,
        )?;
        base.store(storage)?;
        debug!(path = %opts.path.display(), "created database file");
        Ok((params, base.offset()))
    }

    fn load_file(storage: &mut StorageFile, opts: &OpenOptions) -> Result<(Params, u64)> {
        let len = storage.len()?;
        ensure!(
            len >= opts.file_offset + crate::storage::HEADER_PREFIX_SIZE as u64,
            ErrorKind::NotADb
        );
        let mut buf = [0u8; crate::storage::HEADER_PREFIX_SIZE];
        storage.read_at(opts.file_offset, &mut buf)?;
        let prefix = HeaderPrefix::from_bytes(&buf)?;
        let params = prefix.params()?;
        ensure!(
            params.digest_size == opts.digest.size,
            ErrorKind::corrupt(format!(
                "file uses {}-byte digests, configured digest produces {}",
                params.digest_size, opts.digest.size
            ))
        );

        let base_off = opts.file_offset + header_size(&params);
        let base = KeyLocator::load(storage, &params, base_off)?;
        let head = base.head().ok_or_else(|| {
            eyre::eyre!(ErrorKind::corrupt("missing root reference".to_string()))
        })?;
        let reference = data::read_ref(storage, &params, head.value_off)?;
        let found = CollKind::from_payload(reference.kind)?;
        ensure!(
            found == opts.root_kind,
            ErrorKind::TypeMismatch {
                found: found.name(),
                requested: opts.root_kind.name(),
            }
        );
        Ok((params, base_off))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn path(&self) -> &std::path::Path {
        self.storage.path()
    }

    pub fn autobless(&self) -> bool {
        self.autobless
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn audit_log(&mut self) -> Option<&mut AuditLog> {
        self.audit.as_mut()
    }

    pub fn in_transaction(&self) -> bool {
        self.tid != 0
    }

    pub(crate) fn digest_fn(&self) -> DigestFn {
        self.digest
    }

    pub(crate) fn header_offset(&self) -> u64 {
        self.header_offset
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.storage.sync()
    }

    pub(crate) fn any_live_txns(&mut self) -> Result<bool> {
        Ok(self.txns.live(&mut self.storage)?.any())
    }

    pub fn root_kind(&self) -> CollKind {
        self.root_kind
    }

    /// Explicit user-level locking; nests with per-operation locks.
    pub fn lock_shared(&mut self) -> Result<()> {
        self.storage.lock(LockMode::Shared)
    }

    pub fn lock_exclusive(&mut self) -> Result<()> {
        self.storage.lock(LockMode::Exclusive)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.storage.unlock()
    }

    fn locked<T>(
        &mut self,
        mode: LockMode,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.storage.lock(mode)?;
        let result = f(self);
        let unlock = self.storage.unlock();
        match (result, unlock) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    /// The root collection of the file.
    pub fn root(&mut self) -> Result<CollRef> {
        let params = self.params;
        let base_off = self.base_off;
        self.locked(LockMode::Shared, |eng| {
            let base = KeyLocator::load(&mut eng.storage, &params, base_off)?;
            let head = base.head().ok_or_else(|| {
                eyre::eyre!(ErrorKind::corrupt("missing root reference".to_string()))
            })?;
            let reference = data::read_ref(&mut eng.storage, &params, head.value_off)?;
            Ok(CollRef {
                off: head.value_off,
                staleness: reference.staleness,
                kind: CollKind::from_payload(reference.kind)?,
            })
        })
    }

    /// Builds an empty child collection (root Index plus reference
    /// sector) and returns its handle. Must run under the caller's
    /// exclusive lock window when part of a larger mutation.
    pub fn create_collection(&mut self, kind: CollKind) -> Result<CollRef> {
        let params = self.params;
        let freelist = self.freelist;
        self.locked(LockMode::Exclusive, |eng| {
            let root_index = {
                let mut cascade = Cascade {
                    storage: &mut eng.storage,
                    freelist: &freelist,
                    params: &params,
                };
                cascade.create_root()?
            };
            let (off, staleness) =
                data::write_ref(&mut eng.storage, &freelist, &params, kind.payload(), root_index)?;
            Ok(CollRef {
                off,
                staleness,
                kind,
            })
        })
    }

    fn stored_key(&self, key: KeyArg) -> Vec<u8> {
        match key {
            KeyArg::Bytes(bytes) => self.filters.apply_store_key(bytes),
            KeyArg::Index(index) => index.to_string().into_bytes(),
            KeyArg::Raw(bytes) => bytes.to_vec(),
        }
    }

    /// Digest of a key's stored form; the traversal cursor.
    pub fn key_digest(&self, key: KeyArg) -> Result<Vec<u8>> {
        self.digest.digest(&self.stored_key(key))
    }

    /// Re-resolves a collection handle. `None` means the handle is stale:
    /// the sector was freed, retyped, or reused since resolution.
    fn resolve(&mut self, coll: CollRef) -> Result<Option<u64>> {
        let params = self.params;
        match data::try_read_ref(&mut self.storage, &params, coll.off)? {
            Some(RefSector {
                kind,
                root_index,
                staleness,
            }) if kind == coll.kind.payload() && staleness == coll.staleness => {
                Ok(Some(root_index))
            }
            _ => Ok(None),
        }
    }

    fn resolve_for_write(&mut self, coll: CollRef) -> Result<u64> {
        match self.resolve(coll)? {
            Some(root) => Ok(root),
            None => bail!("dpdb: collection handle is stale"),
        }
    }

    fn visible_slot(&self, keyloc: &KeyLocator, live: &LiveTxns) -> Option<Slot> {
        if self.tid != 0 {
            if let Some(idx) = keyloc.find_tid(self.tid, live.as_fn()) {
                return Some(keyloc.slot(idx));
            }
        }
        keyloc.head()
    }

    // ----- read path ------------------------------------------------------

    pub fn read_key(&mut self, coll: CollRef, key: KeyArg) -> Result<Option<StoredEntry>> {
        let stored = self.stored_key(key);
        self.read_key_impl(coll, &stored, false)
    }

    pub(crate) fn read_key_raw(&mut self, coll: CollRef, stored: &[u8]) -> Result<Option<StoredEntry>> {
        self.read_key_impl(coll, stored, true)
    }

    fn read_key_impl(
        &mut self,
        coll: CollRef,
        stored_key: &[u8],
        raw: bool,
    ) -> Result<Option<StoredEntry>> {
        let digest = self.digest.digest(stored_key)?;
        self.locked(LockMode::Shared, |eng| {
            let Some(root) = eng.resolve(coll)? else {
                return Ok(None);
            };
            let Some(kl_off) = eng.cascade_lookup(root, &digest)? else {
                return Ok(None);
            };
            let params = eng.params;
            let keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
            let live = eng.txns.live(&mut eng.storage)?;
            let Some(slot) = eng.visible_slot(&keyloc, &live) else {
                return Ok(None);
            };
            if slot.deleted || slot.value_off <= 1 {
                return Ok(None);
            }
            eng.load_entry(&keyloc, slot.value_off, raw).map(Some)
        })
    }

    fn load_entry(
        &mut self,
        keyloc: &KeyLocator,
        value_off: u64,
        raw: bool,
    ) -> Result<StoredEntry> {
        let params = self.params;
        let (payload, bytes) = data::read_scalar(&mut self.storage, &params, value_off)?;
        let value = match payload {
            PAYLOAD_NULL => StoredValue::Null,
            PAYLOAD_SCALAR => {
                let bytes = if raw {
                    bytes
                } else {
                    self.filters.apply_fetch_value(&bytes)
                };
                StoredValue::Bytes(bytes)
            }
            PAYLOAD_HASH | PAYLOAD_ARRAY => {
                let reference = data::read_ref(&mut self.storage, &params, value_off)?;
                StoredValue::Collection(CollRef {
                    off: value_off,
                    staleness: reference.staleness,
                    kind: CollKind::from_payload(reference.kind)?,
                })
            }
            other => bail!(ErrorKind::corrupt(format!(
                "unknown value payload {other:#04x}"
            ))),
        };
        Ok(StoredEntry {
            value,
            class: keyloc.class_tag().map(<[u8]>::to_vec),
        })
    }

    pub fn exists(&mut self, coll: CollRef, key: KeyArg) -> Result<bool> {
        let stored = self.stored_key(key);
        let digest = self.digest.digest(&stored)?;
        self.locked(LockMode::Shared, |eng| {
            let Some(root) = eng.resolve(coll)? else {
                return Ok(false);
            };
            let Some(kl_off) = eng.cascade_lookup(root, &digest)? else {
                return Ok(false);
            };
            let params = eng.params;
            let keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
            let live = eng.txns.live(&mut eng.storage)?;
            Ok(matches!(
                eng.visible_slot(&keyloc, &live),
                Some(slot) if !slot.deleted && slot.value_off > 1
            ))
        })
    }

    /// Class tag stored for a key, if any.
    pub fn class_of(&mut self, coll: CollRef, key: KeyArg) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read_key(coll, key)?
            .and_then(|entry| entry.class))
    }

    fn cascade_lookup(&mut self, root: u64, digest: &[u8]) -> Result<Option<u64>> {
        let freelist = self.freelist;
        let params = self.params;
        let mut cascade = Cascade {
            storage: &mut self.storage,
            freelist: &freelist,
            params: &params,
        };
        cascade.lookup(root, digest)
    }

    // ----- write path -----------------------------------------------------

    pub fn write_key(
        &mut self,
        coll: CollRef,
        key: KeyArg,
        value: NewValue,
        class: Option<&[u8]>,
    ) -> Result<()> {
        let stored = self.stored_key(key);
        self.write_key_impl(coll, stored, value, class, false)
    }

    pub(crate) fn write_key_raw(
        &mut self,
        coll: CollRef,
        stored_key: Vec<u8>,
        value: NewValue,
        class: Option<&[u8]>,
    ) -> Result<()> {
        self.write_key_impl(coll, stored_key, value, class, true)
    }

    fn write_key_impl(
        &mut self,
        coll: CollRef,
        stored_key: Vec<u8>,
        value: NewValue,
        class: Option<&[u8]>,
        raw: bool,
    ) -> Result<()> {
        ensure!(!self.storage.readonly(), ErrorKind::Readonly);
        let digest = self.digest.digest(&stored_key)?;
        self.locked(LockMode::Exclusive, |eng| {
            let root = eng.resolve_for_write(coll)?;
            let params = eng.params;
            let freelist = eng.freelist;

            let new_off = match value {
                NewValue::Null => {
                    data::write_scalar(&mut eng.storage, &freelist, &params, PAYLOAD_NULL, &[])?
                }
                NewValue::Bytes(bytes) => {
                    let stored_bytes = if raw {
                        bytes.to_vec()
                    } else {
                        eng.filters.apply_store_value(bytes)
                    };
                    data::write_scalar(
                        &mut eng.storage,
                        &freelist,
                        &params,
                        PAYLOAD_SCALAR,
                        &stored_bytes,
                    )?
                }
                NewValue::Collection(child) => child.off,
            };

            let slot_ref = {
                let mut cascade = Cascade {
                    storage: &mut eng.storage,
                    freelist: &freelist,
                    params: &params,
                };
                cascade.ensure_slot(root, &digest)?
            };
            let (mut keyloc, is_new) = match slot_ref.keyloc {
                Some(off) => (KeyLocator::load(&mut eng.storage, &params, off)?, false),
                None => (
                    KeyLocator::create(&mut eng.storage, &freelist, &params, &stored_key)?,
                    true,
                ),
            };
            let live = eng.txns.live(&mut eng.storage)?;

            let old = if eng.tid == 0 {
                protect_observers(&mut keyloc, &live, eng.tid)?;
                let old = keyloc.head();
                keyloc.put_slot(
                    Slot {
                        value_off: new_off,
                        tid: 0,
                        deleted: false,
                    },
                    live.as_fn(),
                )?;
                old
            } else {
                if is_new {
                    // A key born inside a transaction is deleted at HEAD
                    // until commit folds it in.
                    keyloc.put_slot(Slot::absent(0), live.as_fn())?;
                }
                let old = keyloc
                    .find_tid(eng.tid, live.as_fn())
                    .map(|idx| keyloc.slot(idx));
                keyloc.put_slot(
                    Slot {
                        value_off: new_off,
                        tid: eng.tid,
                        deleted: false,
                    },
                    live.as_fn(),
                )?;
                old
            };

            if eng.autobless {
                keyloc.set_class_tag(class)?;
            }
            keyloc.store(&mut eng.storage)?;
            if is_new {
                let mut cascade = Cascade {
                    storage: &mut eng.storage,
                    freelist: &freelist,
                    params: &params,
                };
                cascade.write_entry(slot_ref.blist, slot_ref.entry, &digest, keyloc.offset())?;
            }
            if eng.tid != 0 {
                eng.modified.insert(keyloc.offset());
            }

            if let Some(old) = old {
                if !old.deleted
                    && old.value_off > 1
                    && old.value_off != new_off
                    && !keyloc.value_referenced_elsewhere(old.value_off, usize::MAX)
                {
                    eng.release_value(old.value_off)?;
                }
            }
            Ok(())
        })
    }

    pub fn delete_key(&mut self, coll: CollRef, key: KeyArg) -> Result<Option<StoredEntry>> {
        ensure!(!self.storage.readonly(), ErrorKind::Readonly);
        let stored = self.stored_key(key);
        let digest = self.digest.digest(&stored)?;
        self.locked(LockMode::Exclusive, |eng| {
            let root = eng.resolve_for_write(coll)?;
            let params = eng.params;
            let freelist = eng.freelist;
            let Some(kl_off) = eng.cascade_lookup(root, &digest)? else {
                return Ok(None);
            };
            let mut keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
            let live = eng.txns.live(&mut eng.storage)?;

            let prior = match eng.visible_slot(&keyloc, &live) {
                Some(slot) if !slot.deleted && slot.value_off > 1 => {
                    Some(eng.load_entry(&keyloc, slot.value_off, false)?)
                }
                _ => None,
            };

            if eng.tid == 0 {
                let Some(head) = keyloc.head() else {
                    return Ok(None);
                };
                if head.deleted {
                    return Ok(None);
                }
                if live.any() {
                    // Open transactions elsewhere: keep the KeyLocator as
                    // a deleted marker and snapshot HEAD for observers.
                    protect_observers(&mut keyloc, &live, eng.tid)?;
                    keyloc.put_slot(
                        Slot {
                            value_off: 1,
                            tid: 0,
                            deleted: true,
                        },
                        live.as_fn(),
                    )?;
                    keyloc.store(&mut eng.storage)?;
                    if head.value_off > 1
                        && !keyloc.value_referenced_elsewhere(head.value_off, usize::MAX)
                    {
                        eng.release_value(head.value_off)?;
                    }
                } else {
                    // No observers: unpublish, then reclaim everything.
                    let mut cascade = Cascade {
                        storage: &mut eng.storage,
                        freelist: &freelist,
                        params: &params,
                    };
                    cascade.remove(root, &digest)?;
                    if head.value_off > 1 {
                        eng.release_value(head.value_off)?;
                    }
                    freelist.release_space(
                        &mut eng.storage,
                        SectorClass::KeyLocator,
                        kl_off,
                    )?;
                }
            } else {
                match keyloc.find_tid(eng.tid, live.as_fn()) {
                    Some(idx) => {
                        let own = keyloc.slot(idx);
                        if own.deleted {
                            return Ok(None);
                        }
                        keyloc.set_slot(
                            idx,
                            Slot {
                                value_off: if own.value_off > 1 { 1 } else { 0 },
                                tid: eng.tid,
                                deleted: true,
                            },
                        );
                        keyloc.store(&mut eng.storage)?;
                        if own.value_off > 1
                            && !keyloc.value_referenced_elsewhere(own.value_off, usize::MAX)
                        {
                            eng.release_value(own.value_off)?;
                        }
                    }
                    None => {
                        match keyloc.head() {
                            Some(head) if !head.deleted => {
                                keyloc.put_slot(Slot::absent(eng.tid), live.as_fn())?;
                                keyloc.store(&mut eng.storage)?;
                            }
                            _ => return Ok(None),
                        }
                    }
                }
                eng.modified.insert(kl_off);
            }
            Ok(prior)
        })
    }

    /// Removes a key's reference without releasing the value it pointed
    /// at. Used when a value is being re-linked under another key (the
    /// sequence move operations); everything else mirrors `delete_key`.
    pub(crate) fn detach_key(&mut self, coll: CollRef, key: KeyArg) -> Result<()> {
        ensure!(!self.storage.readonly(), ErrorKind::Readonly);
        let stored = self.stored_key(key);
        let digest = self.digest.digest(&stored)?;
        self.locked(LockMode::Exclusive, |eng| {
            let root = eng.resolve_for_write(coll)?;
            let params = eng.params;
            let freelist = eng.freelist;
            let Some(kl_off) = eng.cascade_lookup(root, &digest)? else {
                return Ok(());
            };
            let mut keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
            let live = eng.txns.live(&mut eng.storage)?;
            if eng.tid == 0 {
                let Some(head) = keyloc.head() else {
                    return Ok(());
                };
                if head.deleted {
                    return Ok(());
                }
                if live.any() {
                    protect_observers(&mut keyloc, &live, eng.tid)?;
                    keyloc.put_slot(
                        Slot {
                            value_off: 1,
                            tid: 0,
                            deleted: true,
                        },
                        live.as_fn(),
                    )?;
                    keyloc.store(&mut eng.storage)?;
                } else {
                    let mut cascade = Cascade {
                        storage: &mut eng.storage,
                        freelist: &freelist,
                        params: &params,
                    };
                    cascade.remove(root, &digest)?;
                    freelist.release_space(&mut eng.storage, SectorClass::KeyLocator, kl_off)?;
                }
            } else {
                match keyloc.find_tid(eng.tid, live.as_fn()) {
                    Some(idx) => {
                        keyloc.set_slot(
                            idx,
                            Slot {
                                value_off: 1,
                                tid: eng.tid,
                                deleted: true,
                            },
                        );
                        keyloc.store(&mut eng.storage)?;
                    }
                    None => match keyloc.head() {
                        Some(head) if !head.deleted => {
                            keyloc.put_slot(Slot::absent(eng.tid), live.as_fn())?;
                            keyloc.store(&mut eng.storage)?;
                        }
                        _ => return Ok(()),
                    },
                }
                eng.modified.insert(kl_off);
            }
            Ok(())
        })
    }

    /// Frees a value chain or a whole collection subtree.
    fn release_value(&mut self, off: u64) -> Result<()> {
        if off <= 1 {
            return Ok(());
        }
        let params = self.params;
        let freelist = self.freelist;
        match data::payload_type(&mut self.storage, &params, off)? {
            PAYLOAD_NULL | PAYLOAD_SCALAR => {
                data::free_chain(&mut self.storage, &freelist, &params, off)
            }
            PAYLOAD_HASH | PAYLOAD_ARRAY => self.free_tree(off),
            other => bail!(ErrorKind::corrupt(format!(
                "unknown value payload {other:#04x} at {off}"
            ))),
        }
    }

    fn free_tree(&mut self, ref_off: u64) -> Result<()> {
        let params = self.params;
        let freelist = self.freelist;
        let reference = data::read_ref(&mut self.storage, &params, ref_off)?;
        let sectors = {
            let mut cascade = Cascade {
                storage: &mut self.storage,
                freelist: &freelist,
                params: &params,
            };
            cascade.collect_sectors(reference.root_index)?
        };
        for kl_off in &sectors.keylocs {
            let keyloc = KeyLocator::load(&mut self.storage, &params, *kl_off)?;
            let mut seen = HashSet::new();
            for idx in 0..keyloc.slot_count() {
                let slot = keyloc.slot(idx);
                if !slot.is_empty() && slot.value_off > 1 && seen.insert(slot.value_off) {
                    self.release_value(slot.value_off)?;
                }
            }
            freelist.release_space(&mut self.storage, SectorClass::KeyLocator, *kl_off)?;
        }
        for blist in &sectors.blists {
            freelist.release_space(&mut self.storage, SectorClass::BucketList, *blist)?;
        }
        for index in &sectors.indexes {
            freelist.release_space(&mut self.storage, SectorClass::Index, *index)?;
        }
        freelist.release_space(&mut self.storage, SectorClass::Data, ref_off)
    }

    // ----- traversal ------------------------------------------------------

    /// First visible key of a collection: `(digest, stored key)`.
    pub fn first_key(&mut self, coll: CollRef) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.next_visible(coll, None)
    }

    /// Next visible key after `prev_digest`.
    pub fn next_key(
        &mut self,
        coll: CollRef,
        prev_digest: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.next_visible(coll, Some(prev_digest.to_vec()))
    }

    fn next_visible(
        &mut self,
        coll: CollRef,
        mut prev: Option<Vec<u8>>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.locked(LockMode::Shared, |eng| {
            let Some(root) = eng.resolve(coll)? else {
                return Ok(None);
            };
            let params = eng.params;
            let freelist = eng.freelist;
            loop {
                let hit = {
                    let mut cascade = Cascade {
                        storage: &mut eng.storage,
                        freelist: &freelist,
                        params: &params,
                    };
                    cascade.next_after(root, prev.as_deref())?
                };
                let Some((digest, kl_off)) = hit else {
                    return Ok(None);
                };
                let keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
                let live = eng.txns.live(&mut eng.storage)?;
                match eng.visible_slot(&keyloc, &live) {
                    Some(slot) if !slot.deleted && slot.value_off > 1 => {
                        return Ok(Some((digest, keyloc.key().to_vec())));
                    }
                    _ => prev = Some(digest),
                }
            }
        })
    }

    // ----- transactions ---------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        ensure!(!self.storage.readonly(), ErrorKind::Readonly);
        ensure!(self.tid == 0, ErrorKind::AlreadyInTransaction);
        self.locked(LockMode::Exclusive, |eng| {
            let tid = eng.txns.begin(&mut eng.storage)?;
            eng.tid = tid;
            eng.modified.clear();
            Ok(())
        })?;
        if let Some(log) = self.audit.as_mut() {
            log.begin()?;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        ensure!(self.tid != 0, ErrorKind::NotInTransaction);
        self.locked(LockMode::Exclusive, |eng| {
            let tid = eng.tid;
            let params = eng.params;
            let live = eng.txns.live(&mut eng.storage)?;
            let mut touched: SmallVec<[u64; 16]> = eng.modified.iter().copied().collect();
            touched.sort_unstable();
            for kl_off in touched {
                let mut keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
                let Some(idx) = keyloc.find_tid(tid, live.as_fn()) else {
                    continue;
                };
                let txn_slot = keyloc.slot(idx);
                let pre = keyloc.head();
                protect_observers(&mut keyloc, &live, tid)?;
                keyloc.put_slot(
                    Slot {
                        value_off: txn_slot.value_off,
                        tid: 0,
                        deleted: txn_slot.deleted,
                    },
                    live.as_fn(),
                )?;
                keyloc.clear_slot(idx);
                keyloc.store(&mut eng.storage)?;
                if let Some(pre) = pre {
                    if !pre.deleted
                        && pre.value_off > 1
                        && pre.value_off != txn_slot.value_off
                        && !keyloc.value_referenced_elsewhere(pre.value_off, usize::MAX)
                    {
                        eng.release_value(pre.value_off)?;
                    }
                }
            }
            eng.txns.end(&mut eng.storage, tid)?;
            eng.tid = 0;
            eng.modified.clear();
            debug!(tid, "transaction committed");
            Ok(())
        })?;
        if let Some(log) = self.audit.as_mut() {
            log.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        ensure!(self.tid != 0, ErrorKind::NotInTransaction);
        self.locked(LockMode::Exclusive, |eng| {
            let tid = eng.tid;
            let params = eng.params;
            let live = eng.txns.live(&mut eng.storage)?;
            let mut touched: SmallVec<[u64; 16]> = eng.modified.iter().copied().collect();
            touched.sort_unstable();
            for kl_off in touched {
                let mut keyloc = KeyLocator::load(&mut eng.storage, &params, kl_off)?;
                let Some(idx) = keyloc.find_tid(tid, live.as_fn()) else {
                    continue;
                };
                let own = keyloc.slot(idx);
                keyloc.clear_slot(idx);
                keyloc.store(&mut eng.storage)?;
                if own.value_off > 1
                    && !keyloc.value_referenced_elsewhere(own.value_off, usize::MAX)
                {
                    eng.release_value(own.value_off)?;
                }
            }
            eng.txns.end(&mut eng.storage, tid)?;
            eng.tid = 0;
            eng.modified.clear();
            debug!(tid, "transaction rolled back");
            Ok(())
        })?;
        if let Some(log) = self.audit.as_mut() {
            log.rollback()?;
        }
        Ok(())
    }
}

/// Snapshots the pre-mutation HEAD into a slot for every other open
/// transaction that has none for this key. This is the isolation bargain:
/// the mutator pays, observers keep their view.
fn protect_observers(keyloc: &mut KeyLocator, live: &LiveTxns, self_tid: u8) -> Result<()> {
    let snapshot = keyloc.head().unwrap_or_else(|| Slot::absent(0));
    for tid in 1..TXN_SLOT_COUNT as u8 {
        if tid == self_tid || !live.contains(tid) {
            continue;
        }
        if keyloc.find_tid(tid, live.as_fn()).is_none() {
            keyloc.put_slot(
                Slot {
                    value_off: snapshot.value_off,
                    tid,
                    deleted: snapshot.deleted,
                },
                live.as_fn(),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenOptions;
    use std::path::Path;

    fn options(path: &Path) -> OpenOptions {
        OpenOptions {
            path: path.to_path_buf(),
            file_offset: 0,
            byte_size: 4,
            max_buckets: 16,
            readonly: false,
            locking: false,
            autoflush: false,
            autobless: true,
            root_kind: CollKind::Map,
            digest: DigestFn::default(),
            filters: Filters::default(),
            audit: None,
        }
    }

    fn fresh() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(options(&dir.path().join("db.dpdb"))).unwrap();
        (dir, engine)
    }

    #[test]
    fn create_then_reopen_preserves_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        {
            let mut engine = Engine::open(options(&path)).unwrap();
            let root = engine.root().unwrap();
            assert_eq!(root.kind, CollKind::Map);
        }
        let mut engine = Engine::open(options(&path)).unwrap();
        assert_eq!(engine.root().unwrap().kind, CollKind::Map);
    }

    #[test]
    fn opening_garbage_is_not_a_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"this is not a database, not even close").unwrap();
        let err = Engine::open(options(&path)).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&ErrorKind::NotADb));
    }

    #[test]
    fn root_kind_mismatch_is_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        drop(Engine::open(options(&path)).unwrap());
        let mut opts = options(&path);
        opts.root_kind = CollKind::Seq;
        let err = Engine::open(opts).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ErrorKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"k1"), NewValue::Bytes(b"value"), None)
            .unwrap();
        let entry = engine.read_key(root, KeyArg::Bytes(b"k1")).unwrap().unwrap();
        assert_eq!(entry.value, StoredValue::Bytes(b"value".to_vec()));
        assert!(engine.exists(root, KeyArg::Bytes(b"k1")).unwrap());
        assert!(!engine.exists(root, KeyArg::Bytes(b"k2")).unwrap());
    }

    #[test]
    fn null_values_roundtrip() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"n"), NewValue::Null, None)
            .unwrap();
        let entry = engine.read_key(root, KeyArg::Bytes(b"n")).unwrap().unwrap();
        assert_eq!(entry.value, StoredValue::Null);
        assert!(engine.exists(root, KeyArg::Bytes(b"n")).unwrap());
    }

    #[test]
    fn overwrite_reuses_the_key() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"k"), NewValue::Bytes(b"one"), None)
            .unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"k"), NewValue::Bytes(b"two"), None)
            .unwrap();
        let entry = engine.read_key(root, KeyArg::Bytes(b"k")).unwrap().unwrap();
        assert_eq!(entry.value, StoredValue::Bytes(b"two".to_vec()));
    }

    #[test]
    fn delete_reclaims_when_no_transactions_are_open() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"k"), NewValue::Bytes(b"v"), None)
            .unwrap();
        let prior = engine.delete_key(root, KeyArg::Bytes(b"k")).unwrap().unwrap();
        assert_eq!(prior.value, StoredValue::Bytes(b"v".to_vec()));
        assert!(!engine.exists(root, KeyArg::Bytes(b"k")).unwrap());
        assert!(engine.read_key(root, KeyArg::Bytes(b"k")).unwrap().is_none());
    }

    #[test]
    fn traversal_returns_plaintext_keys() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        for key in [b"alpha".as_slice(), b"beta", b"gamma"] {
            engine
                .write_key(root, KeyArg::Bytes(key), NewValue::Bytes(b"x"), None)
                .unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = engine.first_key(root).unwrap();
        while let Some((digest, key)) = cursor {
            seen.push(key);
            cursor = engine.next_key(root, &digest).unwrap();
        }
        seen.sort();
        assert_eq!(seen, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn traversal_skips_deleted_keys() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        for key in [b"a".as_slice(), b"b", b"c"] {
            engine
                .write_key(root, KeyArg::Bytes(key), NewValue::Bytes(b"x"), None)
                .unwrap();
        }
        engine.delete_key(root, KeyArg::Bytes(b"b")).unwrap();
        let mut seen = Vec::new();
        let mut cursor = engine.first_key(root).unwrap();
        while let Some((digest, key)) = cursor {
            seen.push(key);
            cursor = engine.next_key(root, &digest).unwrap();
        }
        seen.sort();
        assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn nested_collection_roundtrip() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        let child = engine.create_collection(CollKind::Seq).unwrap();
        engine
            .write_key(child, KeyArg::Index(0), NewValue::Bytes(b"first"), None)
            .unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"list"), NewValue::Collection(child), None)
            .unwrap();

        let entry = engine.read_key(root, KeyArg::Bytes(b"list")).unwrap().unwrap();
        let StoredValue::Collection(found) = entry.value else {
            panic!("expected a collection");
        };
        assert_eq!(found.kind, CollKind::Seq);
        let item = engine.read_key(found, KeyArg::Index(0)).unwrap().unwrap();
        assert_eq!(item.value, StoredValue::Bytes(b"first".to_vec()));
    }

    #[test]
    fn deleting_a_collection_makes_handles_stale() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        let child = engine.create_collection(CollKind::Map).unwrap();
        engine
            .write_key(child, KeyArg::Bytes(b"inner"), NewValue::Bytes(b"v"), None)
            .unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"m"), NewValue::Collection(child), None)
            .unwrap();
        engine.delete_key(root, KeyArg::Bytes(b"m")).unwrap();

        assert!(engine.read_key(child, KeyArg::Bytes(b"inner")).unwrap().is_none());
        assert!(!engine.exists(child, KeyArg::Bytes(b"inner")).unwrap());
        assert!(engine.first_key(child).unwrap().is_none());
    }

    #[test]
    fn transaction_isolation_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        let mut writer = Engine::open(options(&path)).unwrap();
        let mut reader = Engine::open(options(&path)).unwrap();
        let wroot = writer.root().unwrap();
        let rroot = reader.root().unwrap();

        writer
            .write_key(wroot, KeyArg::Bytes(b"x"), NewValue::Bytes(b"1"), None)
            .unwrap();
        writer.begin().unwrap();
        writer
            .write_key(wroot, KeyArg::Bytes(b"x"), NewValue::Bytes(b"2"), None)
            .unwrap();

        // The writer sees its own write; the reader still sees HEAD.
        let own = writer.read_key(wroot, KeyArg::Bytes(b"x")).unwrap().unwrap();
        assert_eq!(own.value, StoredValue::Bytes(b"2".to_vec()));
        let head = reader.read_key(rroot, KeyArg::Bytes(b"x")).unwrap().unwrap();
        assert_eq!(head.value, StoredValue::Bytes(b"1".to_vec()));

        writer.commit().unwrap();
        let head = reader.read_key(rroot, KeyArg::Bytes(b"x")).unwrap().unwrap();
        assert_eq!(head.value, StoredValue::Bytes(b"2".to_vec()));
    }

    #[test]
    fn observers_keep_their_snapshot_across_head_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        let mut observer = Engine::open(options(&path)).unwrap();
        let mut mutator = Engine::open(options(&path)).unwrap();
        let oroot = observer.root().unwrap();
        let mroot = mutator.root().unwrap();

        mutator
            .write_key(mroot, KeyArg::Bytes(b"k"), NewValue::Bytes(b"old"), None)
            .unwrap();
        observer.begin().unwrap();
        // HEAD moves while the observer transaction is open.
        mutator
            .write_key(mroot, KeyArg::Bytes(b"k"), NewValue::Bytes(b"new"), None)
            .unwrap();

        let seen = observer.read_key(oroot, KeyArg::Bytes(b"k")).unwrap().unwrap();
        assert_eq!(seen.value, StoredValue::Bytes(b"old".to_vec()));
        observer.rollback().unwrap();

        let head = observer.read_key(oroot, KeyArg::Bytes(b"k")).unwrap().unwrap();
        assert_eq!(head.value, StoredValue::Bytes(b"new".to_vec()));
    }

    #[test]
    fn rollback_restores_head() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"x"), NewValue::Bytes(b"1"), None)
            .unwrap();
        engine.begin().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"x"), NewValue::Bytes(b"2"), None)
            .unwrap();
        engine.rollback().unwrap();
        let entry = engine.read_key(root, KeyArg::Bytes(b"x")).unwrap().unwrap();
        assert_eq!(entry.value, StoredValue::Bytes(b"1".to_vec()));
    }

    #[test]
    fn keys_created_inside_a_rolled_back_transaction_vanish() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine.begin().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"ghost"), NewValue::Bytes(b"boo"), None)
            .unwrap();
        assert!(engine.exists(root, KeyArg::Bytes(b"ghost")).unwrap());
        engine.rollback().unwrap();
        assert!(!engine.exists(root, KeyArg::Bytes(b"ghost")).unwrap());
    }

    #[test]
    fn transactional_delete_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        let mut a = Engine::open(options(&path)).unwrap();
        let mut b = Engine::open(options(&path)).unwrap();
        let aroot = a.root().unwrap();
        let broot = b.root().unwrap();

        a.write_key(aroot, KeyArg::Bytes(b"k"), NewValue::Bytes(b"v"), None)
            .unwrap();
        a.begin().unwrap();
        a.delete_key(aroot, KeyArg::Bytes(b"k")).unwrap();
        assert!(!a.exists(aroot, KeyArg::Bytes(b"k")).unwrap());
        assert!(b.exists(broot, KeyArg::Bytes(b"k")).unwrap());
        a.commit().unwrap();
        assert!(!b.exists(broot, KeyArg::Bytes(b"k")).unwrap());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let (_dir, mut engine) = fresh();
        engine.begin().unwrap();
        let err = engine.begin().unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(&ErrorKind::AlreadyInTransaction)
        );
    }

    #[test]
    fn commit_outside_transaction_is_rejected() {
        let (_dir, mut engine) = fresh();
        let err = engine.commit().unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(&ErrorKind::NotInTransaction)
        );
    }

    #[test]
    fn class_tags_survive_when_autobless_is_on() {
        let (_dir, mut engine) = fresh();
        let root = engine.root().unwrap();
        engine
            .write_key(
                root,
                KeyArg::Bytes(b"obj"),
                NewValue::Bytes(b"payload"),
                Some(b"My::Class"),
            )
            .unwrap();
        assert_eq!(
            engine.class_of(root, KeyArg::Bytes(b"obj")).unwrap(),
            Some(b"My::Class".to_vec())
        );
    }

    #[test]
    fn readonly_instance_rejects_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        drop(Engine::open(options(&path)).unwrap());
        let mut opts = options(&path);
        opts.readonly = true;
        let mut engine = Engine::open(opts).unwrap();
        let root = engine.root().unwrap();
        let err = engine
            .write_key(root, KeyArg::Bytes(b"k"), NewValue::Bytes(b"v"), None)
            .unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&ErrorKind::Readonly));
        let err = engine.begin().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&ErrorKind::Readonly));
    }

    #[test]
    fn filters_transform_scalars_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dpdb");
        let mut opts = options(&path);
        opts.filters.store_value = Some(Box::new(|b: &[u8]| {
            b.iter().map(|x| x.wrapping_add(1)).collect()
        }));
        opts.filters.fetch_value = Some(Box::new(|b: &[u8]| {
            b.iter().map(|x| x.wrapping_sub(1)).collect()
        }));
        let mut engine = Engine::open(opts).unwrap();
        let root = engine.root().unwrap();
        engine
            .write_key(root, KeyArg::Bytes(b"k"), NewValue::Bytes(b"abc"), None)
            .unwrap();
        let entry = engine.read_key(root, KeyArg::Bytes(b"k")).unwrap().unwrap();
        assert_eq!(entry.value, StoredValue::Bytes(b"abc".to_vec()));
        // Raw read shows the stored (filtered) form.
        let raw = engine.read_key_raw(root, b"k").unwrap().unwrap();
        assert_eq!(raw.value, StoredValue::Bytes(b"bcd".to_vec()));
    }
}
