//! # Data Sectors
//!
//! A Data sector carries one of four payloads:
//!
//! - `N` Null: no bytes.
//! - `S` Scalar: a byte string. Strings longer than one chunk chain
//!   across sectors through the chain offset; reads reassemble the chain
//!   in order.
//! - `H` Hash / `A` Array, a **reference sector**: the root of a child
//!   collection. Its chunk holds the offset of the collection's root Index
//!   sector followed by the collection's staleness counter.
//!
//! ## Content Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ---------------------------------
//! 0       1     payload type ('N', 'S', 'H', 'A')
//! 1       B     chain offset (0 = end of chain)
//! 1+B     1     chunk length
//! 2+B     cap   chunk bytes, tail undefined
//! ```
//!
//! ## Staleness Counters
//!
//! Reference sectors are what in-memory collection handles point at. Each
//! handle remembers the staleness value it saw at resolution; a handle
//! whose sector was freed (type byte now `F`) or reused with a bumped
//! counter answers "absent" instead of reading foreign bytes. The counter
//! bytes sit past the freelist link area for every byte size, so they
//! survive a free/reuse cycle and the bump on reuse is genuinely
//! monotonic.

use eyre::{bail, ensure, Result};

use super::{
    expect_sector, read_head, read_long, write_long, Params, SectorClass, DATA_CHUNK_CAP,
    PAYLOAD_ARRAY, PAYLOAD_HASH, PAYLOAD_NULL, PAYLOAD_SCALAR, SECTOR_DATA,
};
use crate::error::ErrorKind;
use crate::storage::{Freelist, StorageFile};

/// Payload bytes for one loaded Data sector head.
struct DataHead {
    payload: u8,
    chain: u64,
    chunk_len: usize,
}

fn load_head(storage: &mut StorageFile, params: &Params, off: u64) -> Result<DataHead> {
    expect_sector(storage, off, params, SectorClass::Data)?;
    let body = off + params.body_offset();
    let w = params.width();
    let mut buf = [0u8; 10];
    storage.read_at(body, &mut buf[..1 + w + 1])?;
    let payload = buf[0];
    let chain = read_long(&buf[1..], w)?;
    let chunk_len = buf[1 + w] as usize;
    ensure!(
        chunk_len <= DATA_CHUNK_CAP,
        ErrorKind::corrupt(format!("chunk length {chunk_len} exceeds capacity at {off}"))
    );
    Ok(DataHead {
        payload,
        chain,
        chunk_len,
    })
}

fn chunk_pos(params: &Params, off: u64) -> u64 {
    off + params.body_offset() + 1 + params.width() as u64 + 1
}

/// Writes a Null or Scalar value, chaining across sectors as needed, and
/// returns the offset of the chain head.
pub fn write_scalar(
    storage: &mut StorageFile,
    freelist: &Freelist,
    params: &Params,
    payload: u8,
    bytes: &[u8],
) -> Result<u64> {
    debug_assert!(payload == PAYLOAD_NULL || payload == PAYLOAD_SCALAR);
    let w = params.width();

    let chunk_count = if bytes.is_empty() {
        1
    } else {
        bytes.len().div_ceil(DATA_CHUNK_CAP)
    };
    let mut sectors = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        sectors.push(freelist.request_space(storage, SectorClass::Data)?);
    }

    for (i, off) in sectors.iter().enumerate() {
        let chunk = if bytes.is_empty() {
            &bytes[0..0]
        } else {
            let start = i * DATA_CHUNK_CAP;
            &bytes[start..(start + DATA_CHUNK_CAP).min(bytes.len())]
        };
        let chain = sectors.get(i + 1).copied().unwrap_or(0);
        let mut head = [0u8; 10];
        head[0] = payload;
        write_long(&mut head[1..], w, chain)?;
        head[1 + w] = chunk.len() as u8;
        let body = *off + params.body_offset();
        storage.write_at(body, &head[..1 + w + 1])?;
        if !chunk.is_empty() {
            storage.write_at(chunk_pos(params, *off), chunk)?;
        }
    }
    Ok(sectors[0])
}

/// Reads a value chain head and returns the payload type plus, for
/// scalars, the reassembled bytes.
pub fn read_scalar(
    storage: &mut StorageFile,
    params: &Params,
    off: u64,
) -> Result<(u8, Vec<u8>)> {
    let head = load_head(storage, params, off)?;
    match head.payload {
        PAYLOAD_NULL => Ok((PAYLOAD_NULL, Vec::new())),
        PAYLOAD_SCALAR => {
            let mut bytes = Vec::new();
            let mut cursor = off;
            // Chain length is bounded by the file size; anything longer is
            // a cycle and therefore corruption.
            let limit = storage.len()? / params.sector_size(SectorClass::Data) as u64 + 1;
            let mut hops = 0u64;
            loop {
                let head = load_head(storage, params, cursor)?;
                ensure!(
                    head.payload == PAYLOAD_SCALAR,
                    ErrorKind::corrupt(format!("scalar chain hit payload {:#04x}", head.payload))
                );
                let mut chunk = vec![0u8; head.chunk_len];
                if head.chunk_len > 0 {
                    storage.read_at(chunk_pos(params, cursor), &mut chunk)?;
                }
                bytes.extend_from_slice(&chunk);
                if head.chain == 0 {
                    break;
                }
                cursor = head.chain;
                hops += 1;
                ensure!(
                    hops <= limit,
                    ErrorKind::corrupt("scalar chain does not terminate".to_string())
                );
            }
            Ok((PAYLOAD_SCALAR, bytes))
        }
        PAYLOAD_HASH | PAYLOAD_ARRAY => Ok((head.payload, Vec::new())),
        other => bail!(ErrorKind::corrupt(format!(
            "unknown data payload {other:#04x} at {off}"
        ))),
    }
}

/// Payload type of the Data sector at `off` without reading its chunk.
pub fn payload_type(storage: &mut StorageFile, params: &Params, off: u64) -> Result<u8> {
    Ok(load_head(storage, params, off)?.payload)
}

/// Frees a Null/Scalar chain. Reference sectors are freed by the engine's
/// subtree teardown, which releases the collection first.
pub fn free_chain(
    storage: &mut StorageFile,
    freelist: &Freelist,
    params: &Params,
    off: u64,
) -> Result<()> {
    let mut cursor = off;
    while cursor != 0 {
        let head = load_head(storage, params, cursor)?;
        freelist.release_space(storage, SectorClass::Data, cursor)?;
        cursor = head.chain;
    }
    Ok(())
}

/// A resolved reference sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSector {
    pub kind: u8,
    pub root_index: u64,
    pub staleness: u32,
}

/// Creates a reference sector for a new child collection. The staleness
/// counter continues from whatever the underlying bytes held in a previous
/// life, so reused offsets never repeat a counter value.
pub fn write_ref(
    storage: &mut StorageFile,
    freelist: &Freelist,
    params: &Params,
    kind: u8,
    root_index: u64,
) -> Result<(u64, u32)> {
    debug_assert!(kind == PAYLOAD_HASH || kind == PAYLOAD_ARRAY);
    let w = params.width();
    let off = freelist.request_space(storage, SectorClass::Data)?;

    let stale_pos = chunk_pos(params, off) + w as u64;
    let mut stale_buf = [0u8; 4];
    storage.read_at(stale_pos, &mut stale_buf)?;
    let staleness = u32::from_le_bytes(stale_buf).wrapping_add(1);

    let mut head = [0u8; 10];
    head[0] = kind;
    write_long(&mut head[1..], w, 0)?;
    head[1 + w] = (w + 4) as u8;
    storage.write_at(off + params.body_offset(), &head[..1 + w + 1])?;

    let mut chunk = [0u8; 12];
    write_long(&mut chunk, w, root_index)?;
    chunk[w..w + 4].copy_from_slice(&staleness.to_le_bytes());
    storage.write_at(chunk_pos(params, off), &chunk[..w + 4])?;
    Ok((off, staleness))
}

/// Reads a reference sector, failing with `Corrupt` when the offset does
/// not hold one. Use [`try_read_ref`] when staleness is an expected answer.
pub fn read_ref(storage: &mut StorageFile, params: &Params, off: u64) -> Result<RefSector> {
    match try_read_ref(storage, params, off)? {
        Some(reference) => Ok(reference),
        None => bail!(ErrorKind::corrupt(format!(
            "expected a collection reference sector at {off}"
        ))),
    }
}

/// Reads a reference sector leniently: a freed, retyped, or non-reference
/// sector yields `None` instead of an error, which is how stale handles
/// resolve to "absent".
pub fn try_read_ref(
    storage: &mut StorageFile,
    params: &Params,
    off: u64,
) -> Result<Option<RefSector>> {
    if off == 0 || off >= storage.len()? {
        return Ok(None);
    }
    let (type_byte, size) = read_head(storage, off, params)?;
    if type_byte != SECTOR_DATA || size != params.content_size(SectorClass::Data) as u64 {
        return Ok(None);
    }
    let head = load_head(storage, params, off)?;
    if head.payload != PAYLOAD_HASH && head.payload != PAYLOAD_ARRAY {
        return Ok(None);
    }
    let w = params.width();
    ensure!(
        head.chunk_len == w + 4,
        ErrorKind::corrupt(format!("reference sector at {off} has truncated chunk"))
    );
    let mut chunk = [0u8; 12];
    storage.read_at(chunk_pos(params, off), &mut chunk[..w + 4])?;
    let root_index = read_long(&chunk, w)?;
    let staleness = u32::from_le_bytes(chunk[w..w + 4].try_into().unwrap());
    Ok(Some(RefSector {
        kind: head.payload,
        root_index,
        staleness,
    }))
}

/// Repoints a reference sector at a new root Index (used by cascade
/// root installation during collection setup).
pub fn set_ref_root(
    storage: &mut StorageFile,
    params: &Params,
    off: u64,
    root_index: u64,
) -> Result<()> {
    let w = params.width();
    let mut buf = [0u8; 8];
    write_long(&mut buf, w, root_index)?;
    storage.write_at(chunk_pos(params, off), &buf[..w])
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
        (dir, storage, Freelist::new(0, params), params)
    }

    #[test]
    fn short_scalar_fits_one_sector() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, b"value").unwrap();
        let (payload, bytes) = read_scalar(&mut storage, &params, off).unwrap();
        assert_eq!(payload, PAYLOAD_SCALAR);
        assert_eq!(bytes, b"value");
    }

    #[test]
    fn long_scalar_chains_and_reassembles_exactly() {
        let (_dir, mut storage, freelist, params) = scratch();
        let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, &big).unwrap();
        let (_, bytes) = read_scalar(&mut storage, &params, off).unwrap();
        assert_eq!(bytes, big);
    }

    #[test]
    fn chunk_boundary_scalar_roundtrips() {
        let (_dir, mut storage, freelist, params) = scratch();
        for len in [DATA_CHUNK_CAP - 1, DATA_CHUNK_CAP, DATA_CHUNK_CAP + 1] {
            let bytes = vec![0x5A; len];
            let off =
                write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, &bytes).unwrap();
            let (_, back) = read_scalar(&mut storage, &params, off).unwrap();
            assert_eq!(back, bytes, "length {len}");
        }
    }

    #[test]
    fn null_payload_has_no_bytes() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_NULL, b"").unwrap();
        let (payload, bytes) = read_scalar(&mut storage, &params, off).unwrap();
        assert_eq!(payload, PAYLOAD_NULL);
        assert!(bytes.is_empty());
    }

    #[test]
    fn empty_scalar_is_distinct_from_null() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, b"").unwrap();
        let (payload, bytes) = read_scalar(&mut storage, &params, off).unwrap();
        assert_eq!(payload, PAYLOAD_SCALAR);
        assert!(bytes.is_empty());
    }

    #[test]
    fn free_chain_returns_every_link() {
        let (_dir, mut storage, freelist, params) = scratch();
        let big = vec![1u8; DATA_CHUNK_CAP * 3];
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, &big).unwrap();
        let len_before = storage.len().unwrap();
        free_chain(&mut storage, &freelist, &params, off).unwrap();
        // All three sectors come back before the file grows again.
        for _ in 0..3 {
            freelist
                .request_space(&mut storage, SectorClass::Data)
                .unwrap();
        }
        assert_eq!(storage.len().unwrap(), len_before);
    }

    #[test]
    fn ref_sector_roundtrips() {
        let (_dir, mut storage, freelist, params) = scratch();
        let (off, staleness) =
            write_ref(&mut storage, &freelist, &params, PAYLOAD_HASH, 4096).unwrap();
        let reference = read_ref(&mut storage, &params, off).unwrap();
        assert_eq!(reference.kind, PAYLOAD_HASH);
        assert_eq!(reference.root_index, 4096);
        assert_eq!(reference.staleness, staleness);
    }

    #[test]
    fn staleness_bumps_across_reuse() {
        let (_dir, mut storage, freelist, params) = scratch();
        let (off, first) =
            write_ref(&mut storage, &freelist, &params, PAYLOAD_HASH, 4096).unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Data, off)
            .unwrap();
        let (reused, second) =
            write_ref(&mut storage, &freelist, &params, PAYLOAD_ARRAY, 8192).unwrap();
        assert_eq!(reused, off);
        assert!(second > first);
    }

    #[test]
    fn try_read_ref_is_lenient_about_freed_sectors() {
        let (_dir, mut storage, freelist, params) = scratch();
        let (off, _) = write_ref(&mut storage, &freelist, &params, PAYLOAD_HASH, 4096).unwrap();
        freelist
            .release_space(&mut storage, SectorClass::Data, off)
            .unwrap();
        assert_eq!(try_read_ref(&mut storage, &params, off).unwrap(), None);
    }

    #[test]
    fn try_read_ref_rejects_scalar_sectors() {
        let (_dir, mut storage, freelist, params) = scratch();
        let off = write_scalar(&mut storage, &freelist, &params, PAYLOAD_SCALAR, b"x").unwrap();
        assert_eq!(try_read_ref(&mut storage, &params, off).unwrap(), None);
    }
}
