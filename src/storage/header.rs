//! # File Header
//!
//! The first bytes of every dpdb file (at the configured `file_offset`)
//! identify the file and fix the sizing parameters every other structure
//! derives from. The header also hosts the transaction table and the
//! freelist heads, because both must be visible to every process sharing
//! the file.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       4     magic "DPDB"
//! 4       1     format version (1)
//! 5       1     byte_size: 2 | 4 | 8
//! 6       1     digest size (default 16)
//! 7       1     max buckets per BucketList (default 16)
//! 8       1     index fanout, 0 encoding 256 (default)
//! 9       1     transaction slot count (64)
//! 10      8     transaction-in-use bitfield (bit N = id N)
//! 18      256   per-id staleness counters (64 x u32 LE)
//! 274     4*B   freelist heads per sector class (0 = empty)
//! ```
//!
//! The fixed prefix is a single zerocopy struct; the freelist heads are
//! `byte_size` wide and therefore read and written through the long codec.
//!
//! Offsets 0 and 1 fall inside this header, which is what lets MVCC slots
//! reserve them as the "absent" and "deleted" sentinels: no sector can
//! start there.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ErrorKind;
use crate::sector::Params;

pub const MAGIC: &[u8; 4] = b"DPDB";
pub const FORMAT_VERSION: u8 = 1;

/// Number of transaction ids tracked in the header. Id 0 is HEAD and never
/// allocated, so usable ids are `1..TXN_SLOT_COUNT`.
pub const TXN_SLOT_COUNT: usize = 64;

/// Size of the fixed header prefix, before the freelist heads.
pub const HEADER_PREFIX_SIZE: usize = 274;

pub const DEFAULT_BYTE_SIZE: u8 = 4;
pub const DEFAULT_DIGEST_SIZE: u8 = 16;
pub const DEFAULT_MAX_BUCKETS: u8 = 16;
pub const DEFAULT_FANOUT: u16 = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderPrefix {
    magic: [u8; 4],
    version: u8,
    byte_size: u8,
    digest_size: u8,
    max_buckets: u8,
    fanout_code: u8,
    txn_slots: u8,
    txn_bitfield: [u8; 8],
    txn_staleness: [U32; TXN_SLOT_COUNT],
}

const _: () = assert!(std::mem::size_of::<HeaderPrefix>() == HEADER_PREFIX_SIZE);

impl HeaderPrefix {
    pub fn new(params: &Params) -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            byte_size: params.byte_size,
            digest_size: params.digest_size,
            max_buckets: params.max_buckets,
            fanout_code: if params.fanout == 256 {
                0
            } else {
                params.fanout as u8
            },
            txn_slots: TXN_SLOT_COUNT as u8,
            txn_bitfield: [0u8; 8],
            txn_staleness: [U32::ZERO; TXN_SLOT_COUNT],
        }
    }

    /// Parses and validates a header prefix. A wrong magic is `NotADb`;
    /// anything else implausible is `Corrupt`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_PREFIX_SIZE,
            ErrorKind::corrupt(format!(
                "file too short for a header: {} bytes",
                bytes.len()
            ))
        );
        let header = Self::read_from_bytes(&bytes[..HEADER_PREFIX_SIZE])
            .map_err(|e| eyre::eyre!(ErrorKind::corrupt(format!("unreadable header: {e:?}"))))?;
        ensure!(&header.magic == MAGIC, ErrorKind::NotADb);
        ensure!(
            header.version == FORMAT_VERSION,
            ErrorKind::corrupt(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                header.version
            ))
        );
        ensure!(
            header.txn_slots as usize == TXN_SLOT_COUNT,
            ErrorKind::corrupt(format!(
                "unsupported transaction slot count {}",
                header.txn_slots
            ))
        );
        Ok(header)
    }

    pub fn params(&self) -> Result<Params> {
        let fanout = if self.fanout_code == 0 {
            256
        } else {
            self.fanout_code as u16
        };
        Params::new(self.byte_size, self.digest_size, self.max_buckets, fanout)
    }

    pub fn txn_in_use(&self, id: u8) -> bool {
        let id = id as usize;
        id < TXN_SLOT_COUNT && self.txn_bitfield[id / 8] & (1 << (id % 8)) != 0
    }

    pub fn set_txn_in_use(&mut self, id: u8, in_use: bool) {
        let id = id as usize;
        debug_assert!(id > 0 && id < TXN_SLOT_COUNT);
        if in_use {
            self.txn_bitfield[id / 8] |= 1 << (id % 8);
        } else {
            self.txn_bitfield[id / 8] &= !(1 << (id % 8));
        }
    }

    /// Lowest free transaction id, skipping 0 (HEAD).
    pub fn lowest_free_txn(&self) -> Option<u8> {
        (1..TXN_SLOT_COUNT as u8).find(|id| !self.txn_in_use(*id))
    }

    /// Ids currently marked open, excluding `except`.
    pub fn live_txns_except(&self, except: u8) -> Vec<u8> {
        (1..TXN_SLOT_COUNT as u8)
            .filter(|id| *id != except && self.txn_in_use(*id))
            .collect()
    }

    pub fn txn_staleness(&self, id: u8) -> u32 {
        self.txn_staleness[id as usize].get()
    }

    pub fn bump_txn_staleness(&mut self, id: u8) {
        let slot = &mut self.txn_staleness[id as usize];
        *slot = U32::new(slot.get().wrapping_add(1));
    }
}

/// Byte offset of the freelist head for `class_index`, relative to the
/// header start.
pub fn freelist_head_offset(params: &Params, class_index: usize) -> u64 {
    HEADER_PREFIX_SIZE as u64 + (class_index * params.width()) as u64
}

/// Total header footprint: fixed prefix plus the freelist heads.
pub fn header_size(params: &Params) -> u64 {
    HEADER_PREFIX_SIZE as u64 + (crate::sector::SectorClass::COUNT * params.width()) as u64
}
