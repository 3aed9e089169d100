//! # Freelist Allocator
//!
//! Sector allocation and reclamation. The engine only ever creates sectors
//! of the four class sizes, so freed space is tracked as one linked list
//! per class, headed from the file header. Allocation pops the matching
//! head when possible and extends the file otherwise.
//!
//! ## Freed Sector Layout
//!
//! A freed sector keeps its size long (it stays length-addressable) but its
//! type byte becomes `F` and the head of its content is relinked:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -----------------------------
//! 0       1     class index (0..4)
//! 1       B     next free sector (0 = none)
//! 1+B     B     prev free sector (0 = head)
//! ```
//!
//! ## Reuse Hygiene
//!
//! Index, BucketList, and KeyLocator sectors are handed out with zeroed
//! content: a stale child offset or slot in a reused sector would be
//! indistinguishable from live data. Data sectors only get their payload
//! header cleared; the chunk tail is always written before it is read, and
//! preserving it is what lets collection staleness counters survive a
//! free/reuse cycle (see `sector::data`).

use eyre::{ensure, Result};
use tracing::trace;

use super::file::StorageFile;
use super::header::freelist_head_offset;
use crate::error::ErrorKind;
use crate::sector::{self, Params, SectorClass, SECTOR_FREE};

#[derive(Debug, Clone, Copy)]
pub struct Freelist {
    header_offset: u64,
    params: Params,
}

impl Freelist {
    pub fn new(header_offset: u64, params: Params) -> Self {
        Self {
            header_offset,
            params,
        }
    }

    fn head_pos(&self, class: SectorClass) -> u64 {
        self.header_offset + freelist_head_offset(&self.params, class.index())
    }

    fn read_head(&self, storage: &mut StorageFile, class: SectorClass) -> Result<u64> {
        let mut buf = [0u8; 8];
        let w = self.params.width();
        storage.read_at(self.head_pos(class), &mut buf[..w])?;
        sector::read_long(&buf, w)
    }

    fn write_head(&self, storage: &mut StorageFile, class: SectorClass, off: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        let w = self.params.width();
        sector::write_long(&mut buf, w, off)?;
        storage.write_at(self.head_pos(class), &buf[..w])
    }

    fn link_positions(&self, off: u64) -> (u64, u64, u64) {
        let body = off + self.params.body_offset();
        let w = self.params.width() as u64;
        (body, body + 1, body + 1 + w)
    }

    /// Returns space for a sector of `class`: a reused freelist entry when
    /// one exists, a fresh end-of-file region otherwise. The sector head is
    /// written; the content is clean per the reuse-hygiene rules above.
    pub fn request_space(&self, storage: &mut StorageFile, class: SectorClass) -> Result<u64> {
        let off = match self.pop(storage, class)? {
            Some(off) => off,
            None => storage.allocate(self.params.sector_size(class) as u64)?,
        };
        sector::init_head(storage, off, &self.params, class)?;
        let body = off + self.params.body_offset();
        match class {
            SectorClass::Data => {
                // payload type, chain offset, chunk length
                let header = vec![0u8; 1 + self.params.width() + 1];
                storage.write_at(body, &header)?;
            }
            _ => {
                let zeroes = vec![0u8; self.params.content_size(class)];
                storage.write_at(body, &zeroes)?;
            }
        }
        trace!(off, ?class, "sector allocated");
        Ok(off)
    }

    /// Marks the sector at `off` free and links it at the head of its
    /// class list. The region must never be read as live data again until
    /// reallocated.
    pub fn release_space(
        &self,
        storage: &mut StorageFile,
        class: SectorClass,
        off: u64,
    ) -> Result<()> {
        let old_head = self.read_head(storage, class)?;
        storage.write_at(off, &[SECTOR_FREE])?;

        let w = self.params.width();
        let (class_pos, next_pos, prev_pos) = self.link_positions(off);
        storage.write_at(class_pos, &[class.index() as u8])?;
        let mut long = [0u8; 8];
        sector::write_long(&mut long, w, old_head)?;
        storage.write_at(next_pos, &long[..w])?;
        sector::write_long(&mut long, w, 0)?;
        storage.write_at(prev_pos, &long[..w])?;

        if old_head != 0 {
            let (_, _, old_prev_pos) = self.link_positions(old_head);
            sector::write_long(&mut long, w, off)?;
            storage.write_at(old_prev_pos, &long[..w])?;
        }
        self.write_head(storage, class, off)?;
        trace!(off, ?class, "sector freed");
        Ok(())
    }

    fn pop(&self, storage: &mut StorageFile, class: SectorClass) -> Result<Option<u64>> {
        let head = self.read_head(storage, class)?;
        if head == 0 {
            return Ok(None);
        }

        let (type_byte, size) = sector::read_head(storage, head, &self.params)?;
        ensure!(
            type_byte == SECTOR_FREE && size == self.params.content_size(class) as u64,
            ErrorKind::corrupt(format!(
                "freelist head at {head} is not a freed {:?} sector",
                class
            ))
        );

        let w = self.params.width();
        let (class_pos, next_pos, _) = self.link_positions(head);
        let mut byte = [0u8; 1];
        storage.read_at(class_pos, &mut byte)?;
        ensure!(
            SectorClass::from_index(byte[0])? == class,
            ErrorKind::corrupt(format!(
                "freelist head at {head} carries class {} on the {:?} list",
                byte[0], class
            ))
        );

        let mut long = [0u8; 8];
        storage.read_at(next_pos, &mut long[..w])?;
        let next = sector::read_long(&long, w)?;
        self.write_head(storage, class, next)?;
        if next != 0 {
            let (_, _, next_prev_pos) = self.link_positions(next);
            sector::write_long(&mut long, w, 0)?;
            storage.write_at(next_prev_pos, &long[..w])?;
        }
        Ok(Some(head))
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
        let params = Params::new(4, 16, 16, 256).unwrap();
        storage.allocate(header::header_size(&params)).unwrap();
        let freelist = Freelist::new(0, params);
        (dir, storage, freelist, params)
    }

    #[test]
    fn empty_freelist_extends_the_file() {
        let (_dir, mut storage, freelist, params) = scratch();
        let before = storage.len().unwrap();
        let off = freelist
            .request_space(&mut storage, SectorClass::Data)
            .unwrap();
        assert_eq!(off, before);
        assert_eq!(
            storage.len().unwrap(),
            before + params.sector_size(SectorClass::Data) as u64
        );
    }

    #[test]
    fn released_sector_is_reused_before_extending() {
        let (_dir, mut storage, freelist, _params) = scratch();
        let off = freelist
            .request_space(&mut storage, SectorClass::Index)
            .unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Index, off)
            .unwrap();
        let len_after_free = storage.len().unwrap();
        let reused = freelist
            .request_space(&mut storage, SectorClass::Index)
            .unwrap();
        assert_eq!(reused, off);
        assert_eq!(storage.len().unwrap(), len_after_free);
    }

    #[test]
    fn classes_do_not_share_freelists() {
        let (_dir, mut storage, freelist, _params) = scratch();
        let data = freelist
            .request_space(&mut storage, SectorClass::Data)
            .unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Data, data)
            .unwrap();
        let index = freelist
            .request_space(&mut storage, SectorClass::Index)
            .unwrap();
        assert_ne!(index, data);
    }

    #[test]
    fn release_links_head_first() {
        let (_dir, mut storage, freelist, _params) = scratch();
        let a = freelist
            .request_space(&mut storage, SectorClass::Data)
            .unwrap();
        let b = freelist
            .request_space(&mut storage, SectorClass::Data)
            .unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Data, a)
            .unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Data, b)
            .unwrap();
        // LIFO: b freed last, reused first.
        assert_eq!(
            freelist
                .request_space(&mut storage, SectorClass::Data)
                .unwrap(),
            b
        );
        assert_eq!(
            freelist
                .request_space(&mut storage, SectorClass::Data)
                .unwrap(),
            a
        );
    }

    #[test]
    fn freed_sector_type_byte_is_overwritten() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = freelist
            .request_space(&mut storage, SectorClass::KeyLocator)
            .unwrap();
        freelist
            .release_space(&mut storage, SectorClass::KeyLocator, off)
            .unwrap();
        let (type_byte, _) = sector::read_head(&mut storage, off, &params).unwrap();
        assert_eq!(type_byte, SECTOR_FREE);
    }

    #[test]
    fn reused_index_sector_comes_back_zeroed() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = freelist
            .request_space(&mut storage, SectorClass::Index)
            .unwrap();
        let body = off + params.body_offset();
        storage.write_at(body, &[0xAB; 64]).unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Index, off)
            .unwrap();
        let reused = freelist
            .request_space(&mut storage, SectorClass::Index)
            .unwrap();
        assert_eq!(reused, off);
        let mut buf = vec![0u8; params.content_size(SectorClass::Index)];
        storage.read_at(body, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }
}
