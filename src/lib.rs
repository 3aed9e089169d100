//! # dpdb: Embedded Nested Key/Value Store
//!
//! dpdb persists arbitrarily nested associative structures (maps and
//! sequences of scalars, maps, and sequences) in a single,
//! self-describing, position-independent file. It is meant to be embedded
//! directly in a process; several processes (or several instances in one
//! process) share a file and coordinate through whole-file advisory
//! locking. Transactions are ACI: atomic, consistent, isolated, with
//! durability left to the host.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dpdb::{Db, Value};
//!
//! # fn main() -> eyre::Result<()> {
//! let db = Db::open("app.dpdb")?;
//! let root = db.root_map()?;
//!
//! root.put(b"greeting", "hello")?;
//! root.put(
//!     b"config",
//!     Value::Map(vec![(b"retries".to_vec(), Value::from("3"))]),
//! )?;
//!
//! let config = root.get(b"config")?.unwrap();
//! let retries = config.as_map().unwrap().get(b"retries")?;
//!
//! db.begin()?;
//! root.put(b"greeting", "hullo")?;
//! db.rollback()?; // back to "hello"
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Db / Map / Seq)       │
//! ├─────────────────────────────────────┤
//! │   Engine (ops, transactions)        │
//! ├───────────────────┬─────────────────┤
//! │  Index cascade    │  MVCC slots     │
//! ├───────────────────┴─────────────────┤
//! │   Sector layer (typed records)      │
//! ├─────────────────────────────────────┤
//! │   Storage (file, locks, freelist)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the shared file, advisory locking, header, freelist
//! - [`sector`]: typed length-prefixed records and the data/value chains
//! - [`trie`]: the hashed index cascade routing key digests
//! - [`mvcc`]: per-key version slots and the transaction table
//! - [`engine`]: the core operation surface
//! - [`entity`]: `Map`/`Seq` handles and the `Value` model
//! - [`config`]: the open-time builder and filter hooks
//! - [`audit`]: the optional replayable statement log
//! - [`compact`]: full-file compaction
//!
//! ## What dpdb is not
//!
//! There is no write-ahead log: a crash can lose recent writes, though
//! ordering guarantees the file never points at unwritten sectors. There
//! is no server and no background thread; everything happens on the
//! caller's stack under a file lock.

pub mod audit;
pub mod compact;
pub mod config;
pub mod db;
pub mod digest;
pub mod engine;
pub mod entity;
pub mod error;
pub mod mvcc;
pub mod sector;
pub mod storage;
pub mod trie;

pub use config::{ByteSize, DbBuilder};
pub use db::Db;
pub use engine::CollKind;
pub use entity::{Map, Seq, Value};
pub use error::{kind_of, ErrorKind};

/// Crate-wide result type.
pub type Result<T> = eyre::Result<T>;
