//! # Hashed Index Cascade
//!
//! Each collection owns a radix trie over the fixed-width digests of its
//! keys. Interior nodes are Index sectors (one child offset per possible
//! byte value); leaves are BucketLists holding up to `max_buckets`
//! `(digest, KeyLocator offset)` pairs.
//!
//! ## Lookup
//!
//! Descent starts at the collection's root Index and consumes one digest
//! byte per level. A zero child offset means the key is absent; an Index
//! child continues the descent; a BucketList child is scanned linearly for
//! an exact digest match.
//!
//! ## Split
//!
//! Inserting into a full BucketList replaces it with one fresh Index
//! sector: every live entry (and, on retry, the new one) is redistributed
//! into per-byte child BucketLists by the next digest byte. A single split
//! touches only the parent slot and the new Index; if the target child is
//! full again the next insertion attempt splits one level deeper, bounded
//! by the digest width. Entries that agree on every digest byte cannot be
//! separated and are reported as corruption; an injective digest never
//! produces them.
//!
//! ## Ordering
//!
//! Descent visits children in byte order and bucket entries are resumed by
//! strict digest successor, so traversal yields digests in lexicographic
//! order. `next_after` is therefore a pure successor query: it needs no
//! cursor state in the file, and keys inserted mid-traversal simply appear
//! or not depending on which side of the resumption point they land.
//!
//! Deletion tombstones a bucket slot (zero offset) for reuse by later
//! inserts; empty BucketLists and Index sectors are left in place.

use eyre::{bail, ensure, Result};
use tracing::debug;

use crate::error::ErrorKind;
use crate::sector::{
    self, Params, SectorClass, SECTOR_BLIST, SECTOR_INDEX,
};
use crate::storage::{Freelist, StorageFile};

/// Borrowed view over the pieces the cascade needs; operations are free of
/// any other engine state.
pub struct Cascade<'a> {
    pub storage: &'a mut StorageFile,
    pub freelist: &'a Freelist,
    pub params: &'a Params,
}

/// Where a digest's bucket entry lives (or would live) after descent.
#[derive(Debug, Clone, Copy)]
pub struct BucketSlot {
    pub blist: u64,
    pub entry: usize,
    /// KeyLocator offset when the digest is already present.
    pub keyloc: Option<u64>,
}

/// One fully-descended position: the BucketList plus the Index slot that
/// references it.
struct Descent {
    parent_index: u64,
    parent_byte: usize,
    blist: u64,
    /// Level of the parent Index (root = 0); entries in this BucketList
    /// agree on digest bytes `0..=level`.
    level: usize,
}

impl<'a> Cascade<'a> {
    /// Allocates an empty root Index sector for a new collection.
    pub fn create_root(&mut self) -> Result<u64> {
        self.freelist
            .request_space(self.storage, SectorClass::Index)
    }

    fn index_slot_pos(&self, index_off: u64, byte: usize) -> u64 {
        index_off + self.params.body_offset() + (byte * self.params.width()) as u64
    }

    fn read_index_slot(&mut self, index_off: u64, byte: usize) -> Result<u64> {
        let w = self.params.width();
        let mut buf = [0u8; 8];
        let pos = self.index_slot_pos(index_off, byte);
        self.storage.read_at(pos, &mut buf[..w])?;
        sector::read_long(&buf, w)
    }

    fn write_index_slot(&mut self, index_off: u64, byte: usize, value: u64) -> Result<()> {
        let w = self.params.width();
        let mut buf = [0u8; 8];
        sector::write_long(&mut buf, w, value)?;
        let pos = self.index_slot_pos(index_off, byte);
        self.storage.write_at(pos, &buf[..w])
    }

    fn entry_size(&self) -> usize {
        self.params.digest_size as usize + self.params.width()
    }

    fn entry_pos(&self, blist_off: u64, entry: usize) -> u64 {
        blist_off + self.params.body_offset() + (entry * self.entry_size()) as u64
    }

    fn read_entry(&mut self, blist_off: u64, entry: usize) -> Result<(Vec<u8>, u64)> {
        let ds = self.params.digest_size as usize;
        let w = self.params.width();
        let mut buf = vec![0u8; ds + w];
        let pos = self.entry_pos(blist_off, entry);
        self.storage.read_at(pos, &mut buf)?;
        let keyloc = sector::read_long(&buf[ds..], w)?;
        buf.truncate(ds);
        Ok((buf, keyloc))
    }

    /// Writes a bucket entry. Publishing order matters: callers only call
    /// this after the referenced KeyLocator is fully written.
    pub fn write_entry(
        &mut self,
        blist_off: u64,
        entry: usize,
        digest: &[u8],
        keyloc: u64,
    ) -> Result<()> {
        let ds = self.params.digest_size as usize;
        let w = self.params.width();
        let mut buf = vec![0u8; ds + w];
        buf[..ds].copy_from_slice(digest);
        sector::write_long(&mut buf[ds..], w, keyloc)?;
        let pos = self.entry_pos(blist_off, entry);
        self.storage.write_at(pos, &buf)
    }

    /// Finds the KeyLocator for `digest`, if present.
    pub fn lookup(&mut self, root: u64, digest: &[u8]) -> Result<Option<u64>> {
        let Some(descent) = self.descend(root, digest, false)? else {
            return Ok(None);
        };
        for entry in 0..self.params.max_buckets as usize {
            let (stored, keyloc) = self.read_entry(descent.blist, entry)?;
            if keyloc != 0 && stored == digest {
                return Ok(Some(keyloc));
            }
        }
        Ok(None)
    }

    /// Descends for an insert, creating and splitting as needed, and
    /// returns the bucket slot for `digest`: either its existing entry or
    /// a claimed-free one the caller will fill via [`Self::write_entry`].
    pub fn ensure_slot(&mut self, root: u64, digest: &[u8]) -> Result<BucketSlot> {
        loop {
            let descent = self
                .descend(root, digest, true)?
                .expect("creating descent always lands in a BucketList");
            let mut free = None;
            let mut full = true;
            for entry in 0..self.params.max_buckets as usize {
                let (stored, keyloc) = self.read_entry(descent.blist, entry)?;
                if keyloc == 0 {
                    if free.is_none() {
                        free = Some(entry);
                    }
                    full = false;
                } else if stored == digest {
                    return Ok(BucketSlot {
                        blist: descent.blist,
                        entry,
                        keyloc: Some(keyloc),
                    });
                }
            }
            if let Some(entry) = free {
                return Ok(BucketSlot {
                    blist: descent.blist,
                    entry,
                    keyloc: None,
                });
            }
            debug_assert!(full);
            self.split(&descent)?;
        }
    }

    /// Tombstones the entry for `digest` and returns its KeyLocator
    /// offset. The BucketList itself is never collapsed.
    pub fn remove(&mut self, root: u64, digest: &[u8]) -> Result<Option<u64>> {
        let Some(descent) = self.descend(root, digest, false)? else {
            return Ok(None);
        };
        for entry in 0..self.params.max_buckets as usize {
            let (stored, keyloc) = self.read_entry(descent.blist, entry)?;
            if keyloc != 0 && stored == digest {
                let zeroes = vec![0u8; self.entry_size()];
                let pos = self.entry_pos(descent.blist, entry);
                self.storage.write_at(pos, &zeroes)?;
                return Ok(Some(keyloc));
            }
        }
        Ok(None)
    }

    fn descend(&mut self, root: u64, digest: &[u8], create: bool) -> Result<Option<Descent>> {
        ensure!(
            digest.len() == self.params.digest_size as usize,
            ErrorKind::corrupt(format!("digest width {} does not match file", digest.len()))
        );
        sector::expect_sector(self.storage, root, self.params, SectorClass::Index)?;
        let mut index = root;
        let mut level = 0usize;
        loop {
            let byte = digest[level] as usize;
            let child = self.read_index_slot(index, byte)?;
            if child == 0 {
                if !create {
                    return Ok(None);
                }
                let blist = self
                    .freelist
                    .request_space(self.storage, SectorClass::BucketList)?;
                self.write_index_slot(index, byte, blist)?;
                return Ok(Some(Descent {
                    parent_index: index,
                    parent_byte: byte,
                    blist,
                    level,
                }));
            }
            let (type_byte, _) = sector::read_head(self.storage, child, self.params)?;
            match type_byte {
                SECTOR_INDEX => {
                    index = child;
                    level += 1;
                    ensure!(
                        level < digest.len(),
                        ErrorKind::corrupt("index cascade deeper than the digest".to_string())
                    );
                }
                SECTOR_BLIST => {
                    return Ok(Some(Descent {
                        parent_index: index,
                        parent_byte: byte,
                        blist: child,
                        level,
                    }));
                }
                other => bail!(ErrorKind::corrupt(format!(
                    "cascade slot points at sector type {other:#04x} at {child}"
                ))),
            }
        }
    }

    /// Replaces a full BucketList with a new Index whose children receive
    /// the redistributed entries. The parent slot is repointed only after
    /// the replacement subtree is complete, and the old BucketList is
    /// freed last.
    fn split(&mut self, descent: &Descent) -> Result<()> {
        let split_byte_level = descent.level + 1;
        ensure!(
            split_byte_level < self.params.digest_size as usize,
            ErrorKind::corrupt(
                "bucket overflow with all digest bytes exhausted; digest is not injective"
                    .to_string()
            )
        );
        debug!(
            blist = descent.blist,
            level = split_byte_level,
            "splitting bucket list"
        );

        let new_index = self
            .freelist
            .request_space(self.storage, SectorClass::Index)?;

        let mut moved: Vec<(Vec<u8>, u64)> = Vec::with_capacity(self.params.max_buckets as usize);
        for entry in 0..self.params.max_buckets as usize {
            let (digest, keyloc) = self.read_entry(descent.blist, entry)?;
            if keyloc != 0 {
                moved.push((digest, keyloc));
            }
        }

        for (digest, keyloc) in &moved {
            let byte = digest[split_byte_level] as usize;
            let child = match self.read_index_slot(new_index, byte)? {
                0 => {
                    let blist = self
                        .freelist
                        .request_space(self.storage, SectorClass::BucketList)?;
                    self.write_index_slot(new_index, byte, blist)?;
                    blist
                }
                existing => existing,
            };
            let mut placed = false;
            for entry in 0..self.params.max_buckets as usize {
                let (_, occupant) = self.read_entry(child, entry)?;
                if occupant == 0 {
                    self.write_entry(child, entry, digest, *keyloc)?;
                    placed = true;
                    break;
                }
            }
            // Each child receives at most as many entries as the source
            // BucketList held.
            ensure!(
                placed,
                ErrorKind::corrupt("split child overflowed".to_string())
            );
        }

        self.write_index_slot(descent.parent_index, descent.parent_byte, new_index)?;
        self.freelist
            .release_space(self.storage, SectorClass::BucketList, descent.blist)?;
        Ok(())
    }

    /// Smallest live digest strictly greater than `prev` (or the smallest
    /// overall when `prev` is `None`), with its KeyLocator offset.
    pub fn next_after(
        &mut self,
        root: u64,
        prev: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        if let Some(prev) = prev {
            ensure!(
                prev.len() == self.params.digest_size as usize,
                ErrorKind::corrupt(format!(
                    "resume digest width {} does not match file",
                    prev.len()
                ))
            );
        }
        sector::expect_sector(self.storage, root, self.params, SectorClass::Index)?;
        self.next_from_index(root, 0, prev)
    }

    fn next_from_index(
        &mut self,
        index_off: u64,
        level: usize,
        prev: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let start = prev.map(|p| p[level] as usize).unwrap_or(0);
        for byte in start..self.params.fanout as usize {
            let child = self.read_index_slot(index_off, byte)?;
            if child == 0 {
                continue;
            }
            let on_prev_path = matches!(prev, Some(p) if p[level] as usize == byte);
            let sub_prev = if on_prev_path { prev } else { None };
            let (type_byte, _) = sector::read_head(self.storage, child, self.params)?;
            let hit = match type_byte {
                SECTOR_INDEX => self.next_from_index(child, level + 1, sub_prev)?,
                SECTOR_BLIST => self.next_from_blist(child, sub_prev)?,
                other => bail!(ErrorKind::corrupt(format!(
                    "cascade slot points at sector type {other:#04x} at {child}"
                ))),
            };
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    fn next_from_blist(
        &mut self,
        blist_off: u64,
        prev: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let mut best: Option<(Vec<u8>, u64)> = None;
        for entry in 0..self.params.max_buckets as usize {
            let (digest, keyloc) = self.read_entry(blist_off, entry)?;
            if keyloc == 0 {
                continue;
            }
            if let Some(prev) = prev {
                if digest.as_slice() <= prev {
                    continue;
                }
            }
            match &best {
                Some((seen, _)) if *seen <= digest => {}
                _ => best = Some((digest, keyloc)),
            }
        }
        Ok(best)
    }

    /// Every sector reachable from `root`, grouped for teardown. KeyLocator
    /// offsets are returned so the caller can release their value chains
    /// first.
    pub fn collect_sectors(&mut self, root: u64) -> Result<CascadeSectors> {
        let mut out = CascadeSectors::default();
        sector::expect_sector(self.storage, root, self.params, SectorClass::Index)?;
        self.collect_from_index(root, &mut out)?;
        Ok(out)
    }

    fn collect_from_index(&mut self, index_off: u64, out: &mut CascadeSectors) -> Result<()> {
        out.indexes.push(index_off);
        for byte in 0..self.params.fanout as usize {
            let child = self.read_index_slot(index_off, byte)?;
            if child == 0 {
                continue;
            }
            let (type_byte, _) = sector::read_head(self.storage, child, self.params)?;
            match type_byte {
                SECTOR_INDEX => self.collect_from_index(child, out)?,
                SECTOR_BLIST => {
                    out.blists.push(child);
                    for entry in 0..self.params.max_buckets as usize {
                        let (_, keyloc) = self.read_entry(child, entry)?;
                        if keyloc != 0 {
                            out.keylocs.push(keyloc);
                        }
                    }
                }
                other => bail!(ErrorKind::corrupt(format!(
                    "cascade slot points at sector type {other:#04x} at {child}"
                ))),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CascadeSectors {
    pub indexes: Vec<u64>,
    pub blists: Vec<u64>,
    pub keylocs: Vec<u64>,
}
