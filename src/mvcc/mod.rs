//! # Multi-Version Concurrency Control
//!
//! dpdb transactions are ACI (no D): atomic, consistent, isolated, with
//! durability left to the caller. The machinery is deliberately inverted
//! from a coordinator design: processes share nothing but the file, so
//! **the writer pays for isolation**: before any HEAD mutation, the
//! mutating instance materializes the pre-mutation HEAD into a slot for
//! every other open transaction that has not touched that key yet.
//!
//! ## Pieces
//!
//! - [`slots`]: the per-key slot table inside each KeyLocator sector:
//!   one `(value offset, transaction id, deleted)` triple per version,
//!   with id 0 as HEAD.
//! - [`manager`]: the file-global transaction table in the header: the
//!   in-use bitfield that assigns ids and the per-id staleness counters
//!   that make id reuse safe.
//!
//! ## Visibility
//!
//! A transaction reads its own slot when it has one and falls through to
//! HEAD otherwise. Because the mutator snapshots HEAD into observer slots
//! before changing it, an open transaction keeps seeing the HEAD it
//! started from no matter how many times the mainline moves underneath.
//!
//! Commit folds each of the transaction's slots into HEAD; rollback
//! clears them and releases the value chains they referenced. Both walks
//! run under the exclusive file lock and visit exactly the KeyLocators
//! the transaction touched.

pub mod manager;
pub mod slots;

pub use manager::{LiveTxns, TxnTable};
pub use slots::{KeyLocator, Slot};
