//! # Transaction Table
//!
//! Transaction ids are file-global state: the header records which ids are
//! open (a bitfield) and a monotonically increasing staleness counter per
//! id. Processes that share the file see the same table, which is the
//! whole coordination mechanism; there is no daemon and no shared memory.
//!
//! This module owns reading and writing that table. The commit/rollback
//! walks live in the engine, which also holds the slot, value, and
//! freelist machinery they need.

use eyre::{bail, ensure, Result};
use tracing::debug;
use zerocopy::IntoBytes;

use crate::error::ErrorKind;
use crate::storage::{HeaderPrefix, StorageFile, HEADER_PREFIX_SIZE};

/// Snapshot of the in-use bitfield, handed to slot-table operations as the
/// liveness oracle.
#[derive(Debug, Clone, Copy)]
pub struct LiveTxns {
    bits: [bool; crate::storage::TXN_SLOT_COUNT],
}

impl LiveTxns {
    pub fn contains(&self, tid: u8) -> bool {
        self.bits.get(tid as usize).copied().unwrap_or(false)
    }

    /// True when any transaction is open anywhere on the file.
    pub fn any(&self) -> bool {
        self.bits.iter().any(|bit| *bit)
    }

    pub fn as_fn(&self) -> impl Fn(u8) -> bool + '_ {
        move |tid| self.contains(tid)
    }
}

/// Header-table plumbing for the engine. Carries only the header position;
/// storage is borrowed per call like the freelist does it.
#[derive(Debug, Clone, Copy)]
pub struct TxnTable {
    header_offset: u64,
}

impl TxnTable {
    pub fn new(header_offset: u64) -> Self {
        Self { header_offset }
    }

    pub fn load(&self, storage: &mut StorageFile) -> Result<HeaderPrefix> {
        let mut buf = [0u8; HEADER_PREFIX_SIZE];
        storage.read_at(self.header_offset, &mut buf)?;
        HeaderPrefix::from_bytes(&buf)
    }

    pub fn store(&self, storage: &mut StorageFile, header: &HeaderPrefix) -> Result<()> {
        storage.write_at(self.header_offset, header.as_bytes())
    }

    /// Current liveness snapshot for slot-table operations.
    pub fn live(&self, storage: &mut StorageFile) -> Result<LiveTxns> {
        let header = self.load(storage)?;
        let mut bits = [false; crate::storage::TXN_SLOT_COUNT];
        for (tid, bit) in bits.iter_mut().enumerate().skip(1) {
            *bit = header.txn_in_use(tid as u8);
        }
        Ok(LiveTxns { bits })
    }

    /// Allocates the lowest free id, bumps its staleness counter, and
    /// marks it open. The caller must hold the exclusive lock.
    pub fn begin(&self, storage: &mut StorageFile) -> Result<u8> {
        let mut header = self.load(storage)?;
        let Some(tid) = header.lowest_free_txn() else {
            bail!(ErrorKind::TooManyTransactions);
        };
        header.bump_txn_staleness(tid);
        header.set_txn_in_use(tid, true);
        self.store(storage, &header)?;
        debug!(tid, "transaction begun");
        Ok(tid)
    }

    /// Releases an id at commit/rollback, bumping its staleness counter so
    /// slots left behind by this use are dead to the next user.
    pub fn end(&self, storage: &mut StorageFile, tid: u8) -> Result<()> {
        let mut header = self.load(storage)?;
        ensure!(
            header.txn_in_use(tid),
            ErrorKind::corrupt(format!("transaction {tid} ended but was not open"))
        );
        header.bump_txn_staleness(tid);
        header.set_txn_in_use(tid, false);
        self.store(storage, &header)?;
        debug!(tid, "transaction ended");
        Ok(())
    }
}
