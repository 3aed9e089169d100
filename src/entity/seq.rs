//! Sequence collection handles.
//!
//! Sequences reuse the map machinery with integer indices stored as
//! decimal strings, plus a reserved length pseudo-key maintained in the
//! same lock window (and transaction) as each mutation. `shift`,
//! `unshift`, and `splice` rewrite every affected index slot and are
//! O(n), which is acceptable for the embedded target.
//!
//! Elements removed by `pop`/`shift`/`splice` are returned as literal
//! deep copies: their storage is reclaimed by the removal, so a live
//! handle would be born stale.

use eyre::{bail, ensure, Result};

use super::{detach_foreign, materialize, map::audit_value, wrap_stored, SharedEngine, Value, LENGTH_KEY};
use crate::engine::{CollRef, Engine, KeyArg, NewValue, StoredValue};
use crate::error::ErrorKind;

/// A handle to a sequence collection. Cheap to clone; clones share the
/// engine. Stale handles answer "absent" (gets return `None`, `len` is 0).
#[derive(Clone)]
pub struct Seq {
    engine: SharedEngine,
    coll: CollRef,
    path: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seq").field("coll", &self.coll).finish()
    }
}

/// Persists the length pseudo-key. Raw write: the reserved key and its
/// decimal payload bypass the user filters.
pub(crate) fn store_len(engine: &mut Engine, coll: CollRef, len: u64) -> Result<()> {
    let text = len.to_string();
    engine.write_key_raw(coll, LENGTH_KEY.to_vec(), NewValue::Bytes(text.as_bytes()), None)
}

fn read_len(engine: &mut Engine, coll: CollRef) -> Result<u64> {
    match engine.read_key_raw(coll, LENGTH_KEY)? {
        None => Ok(0),
        Some(entry) => match entry.value {
            StoredValue::Bytes(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or_else(|| {
                    eyre::eyre!(ErrorKind::corrupt("unreadable sequence length".to_string()))
                }),
            _ => bail!(ErrorKind::corrupt(
                "sequence length is not a scalar".to_string()
            )),
        },
    }
}

/// Resolves a possibly-negative index against the current length.
fn resolve_index(index: i64, len: u64) -> Result<u64> {
    if index >= 0 {
        return Ok(index as u64);
    }
    let adjusted = len as i64 + index;
    ensure!(
        adjusted >= 0,
        ErrorKind::OutOfBounds { index, length: len }
    );
    Ok(adjusted as u64)
}

impl Seq {
    pub(crate) fn from_parts(engine: SharedEngine, coll: CollRef, path: Vec<Vec<u8>>) -> Self {
        Self { engine, coll, path }
    }

    pub(crate) fn coll(&self) -> CollRef {
        self.coll
    }

    pub(crate) fn same_engine(&self, other: &SharedEngine) -> bool {
        std::sync::Arc::ptr_eq(&self.engine, other)
    }

    /// True when both handles name the same collection in the same file.
    pub fn same_collection(&self, other: &Seq) -> bool {
        std::sync::Arc::ptr_eq(&self.engine, &other.engine) && self.coll.off == other.coll.off
    }

    fn child_path(&self, index: u64) -> Vec<Vec<u8>> {
        let mut path = self.path.clone();
        path.push(index.to_string().into_bytes());
        path
    }

    /// Runs `f` with the whole sequence operation under one exclusive
    /// file-lock window, so multi-slot rewrites are atomic to other
    /// instances.
    fn with_exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.engine.lock().lock_exclusive()?;
        let result = f();
        let unlock = self.engine.lock().unlock();
        match (result, unlock) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    pub fn len(&self) -> Result<u64> {
        read_len(&mut self.engine.lock(), self.coll)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fetches the element at `index`; negative indices count from the
    /// end. Beyond-length positive indices are absent, below `-length`
    /// is `OutOfBounds`.
    pub fn get(&self, index: i64) -> Result<Option<Value>> {
        let mut engine = self.engine.lock();
        let len = read_len(&mut engine, self.coll)?;
        let index = resolve_index(index, len)?;
        let entry = engine.read_key(self.coll, KeyArg::Index(index))?;
        Ok(entry.map(|entry| wrap_stored(&self.engine, entry.value, self.child_path(index))))
    }

    pub fn exists(&self, index: i64) -> Result<bool> {
        let mut engine = self.engine.lock();
        let len = read_len(&mut engine, self.coll)?;
        let index = resolve_index(index, len)?;
        engine.exists(self.coll, KeyArg::Index(index))
    }

    /// Stores `value` at `index`, extending the length when writing past
    /// the end.
    pub fn put(&self, index: i64, value: impl Into<Value>) -> Result<()> {
        let value = detach_foreign(&value.into(), &self.engine)?;
        self.with_exclusive(|| {
            let mut engine = self.engine.lock();
            let len = read_len(&mut engine, self.coll)?;
            let index = resolve_index(index, len)?;
            let built = materialize(&mut engine, &value)?;
            engine.write_key(self.coll, KeyArg::Index(index), built.as_new_value(), None)?;
            if index >= len {
                store_len(&mut engine, self.coll, index + 1)?;
            }
            audit_value(&mut engine, &self.child_path(index), &value)
        })
    }

    /// Deletes the element at `index`, leaving a hole; the length is
    /// unchanged.
    pub fn delete(&self, index: i64) -> Result<Option<Value>> {
        let mut engine = self.engine.lock();
        let len = read_len(&mut engine, self.coll)?;
        let index = resolve_index(index, len)?;
        let prior = engine.delete_key(self.coll, KeyArg::Index(index))?;
        if let Some(log) = engine.audit_log() {
            log.delete(&crate::audit::join_path(&self.child_path(index)))?;
        }
        Ok(prior.map(|entry| wrap_stored(&self.engine, entry.value, self.child_path(index))))
    }

    /// Appends `value` and returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<u64> {
        let value = detach_foreign(&value.into(), &self.engine)?;
        self.with_exclusive(|| {
            let mut engine = self.engine.lock();
            let len = read_len(&mut engine, self.coll)?;
            let built = materialize(&mut engine, &value)?;
            engine.write_key(self.coll, KeyArg::Index(len), built.as_new_value(), None)?;
            store_len(&mut engine, self.coll, len + 1)?;
            audit_value(&mut engine, &self.child_path(len), &value)?;
            Ok(len + 1)
        })
    }

    /// Removes and returns the last element as a literal deep copy.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.with_exclusive(|| {
            let len = self.len()?;
            if len == 0 {
                return Ok(None);
            }
            let taken = self.literal_at(len - 1)?;
            let mut engine = self.engine.lock();
            engine.delete_key(self.coll, KeyArg::Index(len - 1))?;
            store_len(&mut engine, self.coll, len - 1)?;
            if let Some(log) = engine.audit_log() {
                log.delete(&crate::audit::join_path(&self.child_path(len - 1)))?;
            }
            Ok(taken)
        })
    }

    /// Removes and returns the first element as a literal deep copy,
    /// shifting everything down one slot.
    pub fn shift(&self) -> Result<Option<Value>> {
        self.with_exclusive(|| {
            let len = self.len()?;
            if len == 0 {
                return Ok(None);
            }
            let taken = self.literal_at(0)?;
            let mut engine = self.engine.lock();
            for from in 1..len {
                move_entry(&mut engine, self.coll, from, from - 1)?;
            }
            store_len(&mut engine, self.coll, len - 1)?;
            if let Some(log) = engine.audit_log() {
                log.splice(&crate::audit::join_path(&self.path), 0, 1, 0)?;
            }
            Ok(taken)
        })
    }

    /// Prepends `values`, shifting existing elements up, and returns the
    /// new length.
    pub fn unshift(&self, values: Vec<Value>) -> Result<u64> {
        let values = values
            .iter()
            .map(|value| detach_foreign(value, &self.engine))
            .collect::<Result<Vec<_>>>()?;
        self.with_exclusive(|| {
            let count = values.len() as u64;
            let mut engine = self.engine.lock();
            let len = read_len(&mut engine, self.coll)?;
            for from in (0..len).rev() {
                move_entry(&mut engine, self.coll, from, from + count)?;
            }
            for (offset, value) in values.iter().enumerate() {
                let built = materialize(&mut engine, value)?;
                engine.write_key(
                    self.coll,
                    KeyArg::Index(offset as u64),
                    built.as_new_value(),
                    None,
                )?;
            }
            store_len(&mut engine, self.coll, len + count)?;
            if let Some(log) = engine.audit_log() {
                log.splice(&crate::audit::join_path(&self.path), 0, 0, count)?;
            }
            drop(engine);
            for (offset, value) in values.iter().enumerate() {
                let mut engine = self.engine.lock();
                audit_value(&mut engine, &self.child_path(offset as u64), value)?;
            }
            Ok(len + count)
        })
    }

    /// Replaces `remove` elements starting at `start` with `insert`,
    /// returning the removed elements as literal deep copies.
    pub fn splice(&self, start: i64, remove: u64, insert: Vec<Value>) -> Result<Vec<Value>> {
        let insert = insert
            .iter()
            .map(|value| detach_foreign(value, &self.engine))
            .collect::<Result<Vec<_>>>()?;
        self.with_exclusive(|| {
            let len = self.len()?;
            let start = resolve_index(start, len)?.min(len);
            let remove = remove.min(len - start);
            let insert_count = insert.len() as u64;

            let mut removed = Vec::with_capacity(remove as usize);
            for index in start..start + remove {
                removed.push(self.literal_at(index)?.unwrap_or(Value::Null));
            }

            let mut engine = self.engine.lock();
            for index in start..start + remove {
                engine.delete_key(self.coll, KeyArg::Index(index))?;
            }
            if insert_count < remove {
                let delta = remove - insert_count;
                for from in start + remove..len {
                    move_entry(&mut engine, self.coll, from, from - delta)?;
                }
            } else if insert_count > remove {
                let delta = insert_count - remove;
                for from in (start + remove..len).rev() {
                    move_entry(&mut engine, self.coll, from, from + delta)?;
                }
            }
            for (offset, value) in insert.iter().enumerate() {
                let built = materialize(&mut engine, value)?;
                engine.write_key(
                    self.coll,
                    KeyArg::Index(start + offset as u64),
                    built.as_new_value(),
                    None,
                )?;
            }
            let new_len = len - remove + insert_count;
            store_len(&mut engine, self.coll, new_len)?;
            if let Some(log) = engine.audit_log() {
                log.splice(
                    &crate::audit::join_path(&self.path),
                    start,
                    remove,
                    insert_count,
                )?;
            }
            drop(engine);
            for (offset, value) in insert.iter().enumerate() {
                let mut engine = self.engine.lock();
                audit_value(&mut engine, &self.child_path(start + offset as u64), value)?;
            }
            Ok(removed)
        })
    }

    /// Removes every element and resets the length to zero.
    pub fn clear(&self) -> Result<()> {
        self.with_exclusive(|| {
            let mut engine = self.engine.lock();
            let len = read_len(&mut engine, self.coll)?;
            for index in 0..len {
                engine.delete_key(self.coll, KeyArg::Index(index))?;
            }
            store_len(&mut engine, self.coll, 0)?;
            if let Some(log) = engine.audit_log() {
                log.clear(&crate::audit::join_path(&self.path))?;
            }
            Ok(())
        })
    }

    /// Deep copy of the sequence as literal values; holes come back as
    /// `Null`. Not cycle-safe.
    pub fn export(&self) -> Result<Value> {
        Ok(Value::Seq(self.export_items()?))
    }

    pub(crate) fn export_items(&self) -> Result<Vec<Value>> {
        let len = self.len()?;
        let mut out = Vec::with_capacity(len as usize);
        for index in 0..len {
            out.push(self.literal_at(index)?.unwrap_or(Value::Null));
        }
        Ok(out)
    }

    /// The element at `index` as a literal: handles are exported so the
    /// caller owns a copy that survives the element's removal.
    fn literal_at(&self, index: u64) -> Result<Option<Value>> {
        let entry = {
            let mut engine = self.engine.lock();
            engine.read_key(self.coll, KeyArg::Index(index))?
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        let value = wrap_stored(&self.engine, entry.value, self.child_path(index));
        Ok(Some(match value {
            Value::MapRef(map) => Value::Map(map.export_pairs()?),
            Value::SeqRef(seq) => Value::Seq(seq.export_items()?),
            other => other,
        }))
    }
}

/// Moves the entry at `from` to `to`. Scalar bytes are copied and their
/// old chain released; a collection reference is detached without
/// releasing the child, so it keeps its identity across the move.
fn move_entry(engine: &mut Engine, coll: CollRef, from: u64, to: u64) -> Result<()> {
    let from_key = from.to_string().into_bytes();
    match engine.read_key_raw(coll, &from_key)? {
        Some(entry) => {
            match &entry.value {
                StoredValue::Collection(child) => {
                    engine.detach_key(coll, KeyArg::Index(from))?;
                    engine.write_key_raw(
                        coll,
                        to.to_string().into_bytes(),
                        NewValue::Collection(*child),
                        entry.class.as_deref(),
                    )?;
                }
                StoredValue::Bytes(bytes) => {
                    engine.delete_key(coll, KeyArg::Index(from))?;
                    engine.write_key_raw(
                        coll,
                        to.to_string().into_bytes(),
                        NewValue::Bytes(bytes),
                        entry.class.as_deref(),
                    )?;
                }
                StoredValue::Null => {
                    engine.delete_key(coll, KeyArg::Index(from))?;
                    engine.write_key_raw(
                        coll,
                        to.to_string().into_bytes(),
                        NewValue::Null,
                        entry.class.as_deref(),
                    )?;
                }
            }
        }
        None => {
            // A hole moves too.
            engine.delete_key(coll, KeyArg::Index(to))?;
        }
    }
    Ok(())
}
