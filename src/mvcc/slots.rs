//! # KeyLocator Slot Tables
//!
//! Every live key owns one KeyLocator sector: a fixed array of MVCC slots
//! followed by the plaintext key (so iteration can return original keys)
//! and an optional class tag.
//!
//! ## Content Layout
//!
//! ```text
//! Offset            Size  Description
//! ----------------  ----  -------------------------------
//! 0                 N*(B+2)  N slots: value_off (B) | tid (1) | deleted (1)
//! N*(B+2)           1     plain key length
//! +1                255   plain key bytes
//! +255              1     has_class flag
//! +1                B     class tag length
//! +B                64    class tag bytes
//! ```
//!
//! ## Slot Semantics
//!
//! - An all-zero slot is empty.
//! - The slot with transaction id 0 is HEAD: the mainline value.
//! - `value_off = 0` in a deleted slot means the key never had a value at
//!   that version; `value_off = 1` means a prior value was deleted. Both
//!   sentinels fall inside the file header and can never be sector starts.
//! - A non-HEAD slot whose id is not marked live in the header's
//!   transaction bitfield is dead weight from an earlier use of that id:
//!   readers skip it and writers may reclaim it as empty.

use eyre::{bail, Result};

use crate::error::ErrorKind;
use crate::sector::{self, Params, SectorClass, MAX_CLASS_LEN, MAX_KEY_LEN};
use crate::storage::{Freelist, StorageFile};

/// One MVCC slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub value_off: u64,
    pub tid: u8,
    pub deleted: bool,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.value_off == 0 && self.tid == 0 && !self.deleted
    }

    /// A deleted-marker slot for a key with no prior value.
    pub fn absent(tid: u8) -> Self {
        Slot {
            value_off: 0,
            tid,
            deleted: true,
        }
    }
}

/// An in-memory copy of one KeyLocator sector's content. Mutations are
/// buffered and written back in one piece by [`KeyLocator::store`].
#[derive(Debug, Clone)]
pub struct KeyLocator {
    off: u64,
    content: Vec<u8>,
    params: Params,
}

impl KeyLocator {
    /// Allocates a fresh KeyLocator holding `key` and no slots.
    pub fn create(
        storage: &mut StorageFile,
        freelist: &Freelist,
        params: &Params,
        key: &[u8],
    ) -> Result<Self> {
        if key.len() > MAX_KEY_LEN {
            bail!(ErrorKind::UnsupportedType(format!(
                "key of {} bytes exceeds the {MAX_KEY_LEN}-byte limit",
                key.len()
            )));
        }
        let off = freelist.request_space(storage, SectorClass::KeyLocator)?;
        let mut keyloc = Self {
            off,
            content: vec![0u8; params.content_size(SectorClass::KeyLocator)],
            params: *params,
        };
        keyloc.set_key(key);
        Ok(keyloc)
    }

    pub fn load(storage: &mut StorageFile, params: &Params, off: u64) -> Result<Self> {
        sector::expect_sector(storage, off, params, SectorClass::KeyLocator)?;
        let mut content = vec![0u8; params.content_size(SectorClass::KeyLocator)];
        storage.read_at(off + params.body_offset(), &mut content)?;
        Ok(Self {
            off,
            content,
            params: *params,
        })
    }

    pub fn store(&self, storage: &mut StorageFile) -> Result<()> {
        storage.write_at(self.off + self.params.body_offset(), &self.content)
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn slot_count(&self) -> usize {
        self.params.max_buckets as usize
    }

    fn slot_pos(&self, idx: usize) -> usize {
        idx * (self.params.width() + 2)
    }

    pub fn slot(&self, idx: usize) -> Slot {
        let w = self.params.width();
        let pos = self.slot_pos(idx);
        let value_off = sector::read_long(&self.content[pos..], w).expect("slot in bounds");
        Slot {
            value_off,
            tid: self.content[pos + w],
            deleted: self.content[pos + w + 1] != 0,
        }
    }

    pub fn set_slot(&mut self, idx: usize, slot: Slot) {
        let w = self.params.width();
        let pos = self.slot_pos(idx);
        sector::write_long(&mut self.content[pos..], w, slot.value_off).expect("slot in bounds");
        self.content[pos + w] = slot.tid;
        self.content[pos + w + 1] = slot.deleted as u8;
    }

    pub fn clear_slot(&mut self, idx: usize) {
        self.set_slot(idx, Slot::default());
    }

    /// Index of the live slot for `tid`, skipping dead slots from earlier
    /// uses of the id. HEAD (`tid == 0`) is matched when occupied.
    pub fn find_tid(&self, tid: u8, live: impl Fn(u8) -> bool) -> Option<usize> {
        (0..self.slot_count()).find(|idx| {
            let slot = self.slot(*idx);
            if slot.is_empty() || slot.tid != tid {
                return false;
            }
            slot.tid == 0 || live(slot.tid)
        })
    }

    pub fn head(&self) -> Option<Slot> {
        self.find_tid(0, |_| false).map(|idx| self.slot(idx))
    }

    /// First reclaimable slot: empty, or carrying a dead transaction id.
    pub fn first_free(&self, live: impl Fn(u8) -> bool) -> Option<usize> {
        (0..self.slot_count()).find(|idx| {
            let slot = self.slot(*idx);
            slot.is_empty() || (slot.tid != 0 && !live(slot.tid))
        })
    }

    /// Writes `slot` into its tid's existing position or a reclaimable
    /// one. A full table is an explicit error, not silent eviction.
    pub fn put_slot(&mut self, slot: Slot, live: impl Fn(u8) -> bool) -> Result<usize> {
        let idx = self
            .find_tid(slot.tid, &live)
            .or_else(|| self.first_free(&live));
        match idx {
            Some(idx) => {
                self.set_slot(idx, slot);
                Ok(idx)
            }
            None => bail!(ErrorKind::corrupt(format!(
                "slot table full for key {:?}",
                String::from_utf8_lossy(self.key())
            ))),
        }
    }

    /// Slots carrying any live non-HEAD transaction id.
    pub fn transaction_slots(&self, live: impl Fn(u8) -> bool) -> Vec<Slot> {
        (0..self.slot_count())
            .map(|idx| self.slot(idx))
            .filter(|slot| !slot.is_empty() && slot.tid != 0 && live(slot.tid))
            .collect()
    }

    /// True when any slot other than `except_idx` references `value_off`.
    pub fn value_referenced_elsewhere(&self, value_off: u64, except_idx: usize) -> bool {
        (0..self.slot_count()).any(|idx| {
            idx != except_idx && {
                let slot = self.slot(idx);
                !slot.is_empty() && slot.value_off == value_off
            }
        })
    }

    fn key_area(&self) -> usize {
        self.slot_count() * (self.params.width() + 2)
    }

    pub fn key(&self) -> &[u8] {
        let base = self.key_area();
        let len = self.content[base] as usize;
        &self.content[base + 1..base + 1 + len]
    }

    fn set_key(&mut self, key: &[u8]) {
        let base = self.key_area();
        self.content[base] = key.len() as u8;
        self.content[base + 1..base + 1 + key.len()].copy_from_slice(key);
    }

    fn class_area(&self) -> usize {
        self.key_area() + 1 + MAX_KEY_LEN
    }

    pub fn class_tag(&self) -> Option<&[u8]> {
        let base = self.class_area();
        if self.content[base] == 0 {
            return None;
        }
        let w = self.params.width();
        let len = sector::read_long(&self.content[base + 1..], w).expect("class len in bounds");
        Some(&self.content[base + 1 + w..base + 1 + w + len as usize])
    }

    pub fn set_class_tag(&mut self, tag: Option<&[u8]>) -> Result<()> {
        let base = self.class_area();
        let w = self.params.width();
        match tag {
            None => {
                self.content[base] = 0;
            }
            Some(tag) => {
                if tag.len() > MAX_CLASS_LEN {
                    bail!(ErrorKind::UnsupportedType(format!(
                        "class tag of {} bytes exceeds the {MAX_CLASS_LEN}-byte limit",
                        tag.len()
                    )));
                }
                self.content[base] = 1;
                sector::write_long(&mut self.content[base + 1..], w, tag.len() as u64)?;
                self.content[base + 1 + w..base + 1 + w + tag.len()].copy_from_slice(tag);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::header;

    fn scratch() -> (tempfile::TempDir, StorageFile, Freelist, Params) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let mut storage = StorageFile::open(&path, false, false, false).unwrap();
        let params = Params::new(4, 16, 4, 256).unwrap();
        storage.allocate(header::header_size(&params)).unwrap();
        (dir, storage, Freelist::new(0, params), params)
    }

    fn no_txns(_: u8) -> bool {
        false
    }

    #[test]
    fn fresh_keyloc_has_key_and_no_slots() {
        let (_dir, mut storage, freelist, params) = scratch();
        let keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k1").unwrap();
        assert_eq!(keyloc.key(), b"k1");
        assert!(keyloc.head().is_none());
        assert!(keyloc.class_tag().is_none());
    }

    #[test]
    fn load_roundtrips_through_storage() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k1").unwrap();
        keyloc
            .put_slot(
                Slot {
                    value_off: 4096,
                    tid: 0,
                    deleted: false,
                },
                no_txns,
            )
            .unwrap();
        keyloc.set_class_tag(Some(b"Config")).unwrap();
        keyloc.store(&mut storage).unwrap();

        let back = KeyLocator::load(&mut storage, &params, keyloc.offset()).unwrap();
        assert_eq!(back.key(), b"k1");
        assert_eq!(back.head().unwrap().value_off, 4096);
        assert_eq!(back.class_tag(), Some(&b"Config"[..]));
    }

    #[test]
    fn oversized_key_is_unsupported() {
        let (_dir, mut storage, freelist, params) = scratch();
        let long_key = vec![b'x'; 256];
        let err = KeyLocator::create(&mut storage, &freelist, &params, &long_key).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ErrorKind::UnsupportedType(_))
        ));
    }

    #[test]
    fn put_slot_replaces_same_tid_in_place() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        let live = |tid: u8| tid == 2;
        let first = keyloc
            .put_slot(
                Slot {
                    value_off: 100,
                    tid: 2,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        let second = keyloc
            .put_slot(
                Slot {
                    value_off: 200,
                    tid: 2,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(keyloc.slot(first).value_off, 200);
    }

    #[test]
    fn full_table_is_an_error() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        let live = |_: u8| true;
        for tid in 0..4u8 {
            keyloc
                .put_slot(
                    Slot {
                        value_off: 100 + tid as u64,
                        tid,
                        deleted: false,
                    },
                    live,
                )
                .unwrap();
        }
        assert!(keyloc
            .put_slot(
                Slot {
                    value_off: 999,
                    tid: 5,
                    deleted: false
                },
                live
            )
            .is_err());
    }

    #[test]
    fn dead_tid_slots_are_reclaimed() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        // Fill with ids that are no longer live.
        for tid in 1..5u8 {
            keyloc
                .put_slot(
                    Slot {
                        value_off: 100 + tid as u64,
                        tid,
                        deleted: false,
                    },
                    |_| true,
                )
                .unwrap();
        }
        // All dead now: a new writer claims slot 0.
        let idx = keyloc
            .put_slot(
                Slot {
                    value_off: 777,
                    tid: 7,
                    deleted: false,
                },
                |tid| tid == 7,
            )
            .unwrap();
        assert_eq!(idx, 0);
        // And the dead slots are invisible to readers.
        assert_eq!(keyloc.find_tid(1, |tid| tid == 7), None);
    }

    #[test]
    fn head_ignores_transaction_slots() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        let live = |tid: u8| tid == 3;
        keyloc
            .put_slot(
                Slot {
                    value_off: 300,
                    tid: 3,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        assert!(keyloc.head().is_none());
        keyloc
            .put_slot(
                Slot {
                    value_off: 100,
                    tid: 0,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        assert_eq!(keyloc.head().unwrap().value_off, 100);
    }

    #[test]
    fn deleted_head_is_still_occupied() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        keyloc
            .put_slot(
                Slot {
                    value_off: 1,
                    tid: 0,
                    deleted: true,
                },
                no_txns,
            )
            .unwrap();
        let head = keyloc.head().unwrap();
        assert!(head.deleted);
    }

    #[test]
    fn value_reference_scan_sees_other_slots() {
        let (_dir, mut storage, freelist, params) = scratch();
        let mut keyloc = KeyLocator::create(&mut storage, &freelist, &params, b"k").unwrap();
        let live = |tid: u8| tid == 2;
        let head_idx = keyloc
            .put_slot(
                Slot {
                    value_off: 500,
                    tid: 0,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        keyloc
            .put_slot(
                Slot {
                    value_off: 500,
                    tid: 2,
                    deleted: false,
                },
                live,
            )
            .unwrap();
        assert!(keyloc.value_referenced_elsewhere(500, head_idx));
        assert!(!keyloc.value_referenced_elsewhere(999, head_idx));
    }
}
