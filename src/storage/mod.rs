//! # Storage Module
//!
//! The foundation of the engine: one regular file shared between any
//! number of instances (in-process or across processes), coordinated
//! through a whole-file advisory lock.
//!
//! ## Architecture Overview
//!
//! Unlike a page cache design, nothing here is buffered: every access is a
//! positioned read or write against the file, and cross-instance
//! visibility is purely a function of the locking discipline. An instance
//! that acquires the lock sees everything the previous holder wrote before
//! releasing it.
//!
//! ## Module Organization
//!
//! - `file`: positioned I/O, append allocation, reentrant lock nesting,
//!   rename detection
//! - `lock`: the OS advisory lock (flock / LockFileEx)
//! - `header`: the `DPDB` header, transaction table, freelist heads
//! - `freelist`: per-class sector allocation and reclamation
//!
//! ## Failure Semantics
//!
//! I/O errors abort the current operation and propagate unchanged. A
//! sector that fails validation (unknown type, size matching no class) is
//! corruption; the engine never guesses.

mod file;
mod freelist;
pub mod header;
mod lock;

pub use file::StorageFile;
pub use freelist::Freelist;
pub use header::{
    header_size, HeaderPrefix, DEFAULT_BYTE_SIZE, DEFAULT_DIGEST_SIZE, DEFAULT_FANOUT,
    DEFAULT_MAX_BUCKETS, FORMAT_VERSION, HEADER_PREFIX_SIZE, MAGIC, TXN_SLOT_COUNT,
};
pub use lock::LockMode;
