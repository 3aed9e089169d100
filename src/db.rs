//! # Database Handle
//!
//! [`Db`] is the entry point: it owns the engine behind a mutex so the
//! collection handles it hands out can share one instance. Clones of a
//! `Db` (and the handles derived from it) all speak to the same engine;
//! for transactional isolation between actors, open separate `Db`s over
//! the same file.

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::config::{DbBuilder, OpenOptions};
use crate::engine::{CollKind, Engine};
use crate::entity::{Map, Seq, SharedEngine, Value};
use crate::error::ErrorKind;

/// An open dpdb database.
#[derive(Clone)]
pub struct Db {
    engine: SharedEngine,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Starts configuring a database.
    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    /// Opens (or creates) a map-rooted database at `path` with default
    /// settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    pub(crate) fn open_with(options: OpenOptions) -> Result<Self> {
        let engine = Engine::open(options)?;
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
        })
    }

    pub(crate) fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// The root collection as a map. `TypeMismatch` when the file root is
    /// a sequence.
    pub fn root_map(&self) -> Result<Map> {
        let root = self.engine.lock().root()?;
        ensure!(
            root.kind == CollKind::Map,
            ErrorKind::TypeMismatch {
                found: root.kind.name(),
                requested: CollKind::Map.name(),
            }
        );
        Ok(Map::from_parts(self.engine.clone(), root, Vec::new()))
    }

    /// The root collection as a sequence. `TypeMismatch` when the file
    /// root is a map.
    pub fn root_seq(&self) -> Result<Seq> {
        let root = self.engine.lock().root()?;
        ensure!(
            root.kind == CollKind::Seq,
            ErrorKind::TypeMismatch {
                found: root.kind.name(),
                requested: CollKind::Seq.name(),
            }
        );
        Ok(Seq::from_parts(self.engine.clone(), root, Vec::new()))
    }

    /// Opens a transaction on this instance. One at a time per instance;
    /// nested `begin` fails with `AlreadyInTransaction`.
    pub fn begin(&self) -> Result<()> {
        self.engine.lock().begin()
    }

    /// Folds the open transaction's writes into the mainline.
    pub fn commit(&self) -> Result<()> {
        self.engine.lock().commit()
    }

    /// Discards the open transaction's writes.
    pub fn rollback(&self) -> Result<()> {
        self.engine.lock().rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.engine.lock().in_transaction()
    }

    /// Explicit shared lock around a sequence of reads. Nests with the
    /// per-operation locks; release with [`Db::unlock`].
    pub fn lock_shared(&self) -> Result<()> {
        self.engine.lock().lock_shared()
    }

    /// Explicit exclusive lock for read-modify-write atomicity across
    /// several operations.
    pub fn lock_exclusive(&self) -> Result<()> {
        self.engine.lock().lock_exclusive()
    }

    pub fn unlock(&self) -> Result<()> {
        self.engine.lock().unlock()
    }

    /// Deep copy of the whole database as literal values.
    pub fn export(&self) -> Result<Value> {
        let kind = self.engine.lock().root_kind();
        match kind {
            CollKind::Map => self.root_map()?.export(),
            CollKind::Seq => self.root_seq()?.export(),
        }
    }

    /// Loads a literal value tree into the root collection.
    pub fn import(&self, value: &Value) -> Result<()> {
        let kind = self.engine.lock().root_kind();
        match (kind, value) {
            (CollKind::Map, Value::Map(pairs)) => {
                let root = self.root_map()?;
                for (key, child) in pairs {
                    root.put(key, child.clone())?;
                }
                Ok(())
            }
            (CollKind::Seq, Value::Seq(items)) => {
                let root = self.root_seq()?;
                for (index, child) in items.iter().enumerate() {
                    root.put(index as i64, child.clone())?;
                }
                Ok(())
            }
            (kind, _) => Err(eyre::eyre!(ErrorKind::TypeMismatch {
                found: kind.name(),
                requested: "matching literal",
            })),
        }
    }
}
