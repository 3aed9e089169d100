//! # Sector Layer
//!
//! Everything stored past the file header is a **sector**: a typed,
//! length-prefixed record carved out of the storage file. Sectors come in
//! four size classes, fixed at file-creation time from the header
//! parameters, so any sector is fully length-addressable from its first
//! byte.
//!
//! ## On-Disk Layout
//!
//! ```text
//! Offset  Size       Description
//! ------  ---------  --------------------------------
//! 0       1          type byte ('I', 'B', 'K', 'D', 'F')
//! 1       byte_size  content size (a "long")
//! 1+B     size       type-specific content
//! ```
//!
//! ## Longs
//!
//! Offsets and lengths wider than one byte are "longs": little-endian
//! unsigned integers whose width is the header's `byte_size` (2, 4, or 8).
//! [`read_long`] / [`write_long`] are the only codec for them; nothing in
//! the crate reads a multi-byte field any other way.
//!
//! ## Size Classes
//!
//! | Class | Type byte | Content |
//! |-------|-----------|---------|
//! | Index | `I` | `fanout` child offsets |
//! | BucketList | `B` | `max_buckets` x (digest, KeyLocator offset) |
//! | KeyLocator | `K` | MVCC slot table + plaintext key + class tag |
//! | Data | `D` | payload type, chain offset, chunk |
//!
//! A freed sector keeps its size field but its type byte becomes `F` and
//! the head of its content is relinked as `class (1) | next | prev`.

pub mod data;

use eyre::{bail, ensure, Result};

use crate::error::ErrorKind;

pub const SECTOR_INDEX: u8 = b'I';
pub const SECTOR_BLIST: u8 = b'B';
pub const SECTOR_KEYLOC: u8 = b'K';
pub const SECTOR_DATA: u8 = b'D';
pub const SECTOR_FREE: u8 = b'F';

pub const PAYLOAD_NULL: u8 = b'N';
pub const PAYLOAD_SCALAR: u8 = b'S';
pub const PAYLOAD_HASH: u8 = b'H';
pub const PAYLOAD_ARRAY: u8 = b'A';

/// Longest chunk a single Data sector carries; longer scalars chain.
pub const DATA_CHUNK_CAP: usize = 128;

/// Longest plaintext key a KeyLocator holds inline (its length field is one
/// byte, and sectors are fixed-size).
pub const MAX_KEY_LEN: usize = 255;

/// Longest class tag a KeyLocator holds inline.
pub const MAX_CLASS_LEN: usize = 64;

/// The four allocatable sector size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorClass {
    Index,
    BucketList,
    KeyLocator,
    Data,
}

impl SectorClass {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            SectorClass::Index => 0,
            SectorClass::BucketList => 1,
            SectorClass::KeyLocator => 2,
            SectorClass::Data => 3,
        }
    }

    pub fn from_index(idx: u8) -> Result<Self> {
        Ok(match idx {
            0 => SectorClass::Index,
            1 => SectorClass::BucketList,
            2 => SectorClass::KeyLocator,
            3 => SectorClass::Data,
            other => bail!(ErrorKind::corrupt(format!(
                "unknown freelist sector class {other}"
            ))),
        })
    }

    pub fn type_byte(self) -> u8 {
        match self {
            SectorClass::Index => SECTOR_INDEX,
            SectorClass::BucketList => SECTOR_BLIST,
            SectorClass::KeyLocator => SECTOR_KEYLOC,
            SectorClass::Data => SECTOR_DATA,
        }
    }
}

/// File-wide sizing parameters, read once from the header at open.
///
/// All sector geometry derives from these five values; two instances that
/// agree on them agree on every byte position in the file.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub byte_size: u8,
    pub digest_size: u8,
    pub max_buckets: u8,
    pub fanout: u16,
}

impl Params {
    pub fn new(byte_size: u8, digest_size: u8, max_buckets: u8, fanout: u16) -> Result<Self> {
        ensure!(
            matches!(byte_size, 2 | 4 | 8),
            ErrorKind::corrupt(format!("invalid byte size {byte_size}"))
        );
        ensure!(
            digest_size >= 4,
            ErrorKind::corrupt(format!("implausible digest size {digest_size}"))
        );
        ensure!(
            max_buckets >= 2,
            ErrorKind::corrupt(format!("implausible bucket count {max_buckets}"))
        );
        ensure!(
            fanout == 256,
            ErrorKind::corrupt(format!("unsupported index fanout {fanout}"))
        );
        Ok(Self {
            byte_size,
            digest_size,
            max_buckets,
            fanout,
        })
    }

    pub fn width(&self) -> usize {
        self.byte_size as usize
    }

    /// Content size of a sector of the given class.
    pub fn content_size(&self, class: SectorClass) -> usize {
        let w = self.width();
        match class {
            SectorClass::Index => self.fanout as usize * w,
            SectorClass::BucketList => {
                self.max_buckets as usize * (self.digest_size as usize + w)
            }
            // slot table, then key length + key area, then class tag area
            SectorClass::KeyLocator => {
                self.max_buckets as usize * (w + 2) + 1 + MAX_KEY_LEN + 1 + w + MAX_CLASS_LEN
            }
            SectorClass::Data => 1 + w + 1 + DATA_CHUNK_CAP,
        }
    }

    /// Full on-disk footprint: type byte, size long, content.
    pub fn sector_size(&self, class: SectorClass) -> usize {
        1 + self.width() + self.content_size(class)
    }

    /// Byte offset of a sector's content, relative to its start.
    pub fn body_offset(&self) -> u64 {
        1 + self.byte_size as u64
    }

    /// Maps a content size back to its class, for validating sector heads.
    pub fn class_for_size(&self, size: u64) -> Option<SectorClass> {
        for class in [
            SectorClass::Index,
            SectorClass::BucketList,
            SectorClass::KeyLocator,
            SectorClass::Data,
        ] {
            if self.content_size(class) as u64 == size {
                return Some(class);
            }
        }
        None
    }
}

/// Reads and validates a sector head, returning its type byte and content
/// size. Unknown types and sizes that match no class are corruption.
pub fn read_head(
    storage: &mut crate::storage::StorageFile,
    offset: u64,
    params: &Params,
) -> Result<(u8, u64)> {
    let mut buf = [0u8; 9];
    let head_len = 1 + params.width();
    storage.read_at(offset, &mut buf[..head_len])?;
    let type_byte = buf[0];
    let size = read_long(&buf[1..], params.width())?;
    ensure!(
        matches!(
            type_byte,
            SECTOR_INDEX | SECTOR_BLIST | SECTOR_KEYLOC | SECTOR_DATA | SECTOR_FREE
        ),
        ErrorKind::corrupt(format!("unknown sector type {type_byte:#04x} at {offset}"))
    );
    ensure!(
        params.class_for_size(size).is_some(),
        ErrorKind::corrupt(format!("implausible sector size {size} at {offset}"))
    );
    Ok((type_byte, size))
}

/// Reads a sector head and checks it against an expected live class.
pub fn expect_sector(
    storage: &mut crate::storage::StorageFile,
    offset: u64,
    params: &Params,
    class: SectorClass,
) -> Result<()> {
    let (type_byte, size) = read_head(storage, offset, params)?;
    ensure!(
        type_byte == class.type_byte() && size == params.content_size(class) as u64,
        ErrorKind::corrupt(format!(
            "expected {:?} sector at {offset}, found type {type_byte:#04x} size {size}",
            class
        ))
    );
    Ok(())
}

/// Writes a fresh sector head (type byte and size long) for `class`.
pub fn init_head(
    storage: &mut crate::storage::StorageFile,
    offset: u64,
    params: &Params,
    class: SectorClass,
) -> Result<()> {
    let mut buf = [0u8; 9];
    let head_len = 1 + params.width();
    buf[0] = class.type_byte();
    write_long(&mut buf[1..], params.width(), params.content_size(class) as u64)?;
    storage.write_at(offset, &buf[..head_len])
}

/// Decodes a little-endian unsigned integer of the given width.
pub fn read_long(buf: &[u8], width: usize) -> Result<u64> {
    ensure!(
        buf.len() >= width,
        ErrorKind::corrupt(format!(
            "truncated long: {} bytes where {width} expected",
            buf.len()
        ))
    );
    let mut value = 0u64;
    for (i, byte) in buf[..width].iter().enumerate() {
        value |= (*byte as u64) << (8 * i);
    }
    Ok(value)
}

/// Encodes a little-endian unsigned integer of the given width.
///
/// Fails when the value does not fit, which surfaces as the file outgrowing
/// its configured `byte_size`.
pub fn write_long(buf: &mut [u8], width: usize, value: u64) -> Result<()> {
    ensure!(
        buf.len() >= width,
        ErrorKind::corrupt(format!(
            "truncated long target: {} bytes where {width} expected",
            buf.len()
        ))
    );
    if width < 8 {
        ensure!(
            value < 1u64 << (8 * width),
            "dpdb: offset {value} exceeds the addressable range of a {width}-byte file"
        );
    }
    for (i, slot) in buf[..width].iter_mut().enumerate() {
        *slot = (value >> (8 * i)) as u8;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_roundtrips_at_every_width() {
        for width in [2usize, 4, 8] {
            let mut buf = [0u8; 8];
            write_long(&mut buf, width, 0x1234).unwrap();
            assert_eq!(read_long(&buf, width).unwrap(), 0x1234);
        }
    }

    #[test]
    fn long_is_little_endian() {
        let mut buf = [0u8; 4];
        write_long(&mut buf, 4, 0x0403_0201).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn long_rejects_overflow() {
        let mut buf = [0u8; 2];
        assert!(write_long(&mut buf, 2, 0x1_0000).is_err());
    }

    #[test]
    fn long_rejects_truncated_buffer() {
        let buf = [0u8; 3];
        assert!(read_long(&buf, 4).is_err());
    }

    #[test]
    fn default_params_have_distinct_class_sizes() {
        let params = Params::new(4, 16, 16, 256).unwrap();
        let sizes: Vec<usize> = [
            SectorClass::Index,
            SectorClass::BucketList,
            SectorClass::KeyLocator,
            SectorClass::Data,
        ]
        .iter()
        .map(|c| params.content_size(*c))
        .collect();
        for (i, a) in sizes.iter().enumerate() {
            for b in &sizes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn class_for_size_inverts_content_size() {
        let params = Params::new(4, 16, 16, 256).unwrap();
        for class in [
            SectorClass::Index,
            SectorClass::BucketList,
            SectorClass::KeyLocator,
            SectorClass::Data,
        ] {
            let size = params.content_size(class) as u64;
            assert_eq!(params.class_for_size(size), Some(class));
        }
        assert_eq!(params.class_for_size(3), None);
    }

    #[test]
    fn params_reject_bad_byte_size() {
        assert!(Params::new(3, 16, 16, 256).is_err());
    }

    #[test]
    fn freelist_link_fits_every_class() {
        for byte_size in [2u8, 4, 8] {
            let params = Params::new(byte_size, 16, 16, 256).unwrap();
            let link = 1 + 2 * params.width();
            for class in [
                SectorClass::Index,
                SectorClass::BucketList,
                SectorClass::KeyLocator,
                SectorClass::Data,
            ] {
                assert!(params.content_size(class) >= link);
            }
        }
    }
}
