//! Map collection handles.

use eyre::Result;

use super::{
    detach_foreign, materialize, wrap_stored, SharedEngine, Value,
};
use crate::engine::{CollRef, Engine, KeyArg};

/// A handle to a map collection. Cheap to clone; all clones share the
/// same engine instance. A handle whose underlying collection has been
/// deleted keeps working but answers "absent" everywhere.
#[derive(Clone)]
pub struct Map {
    engine: SharedEngine,
    coll: CollRef,
    path: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").field("coll", &self.coll).finish()
    }
}

impl Map {
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
    pub fn same_collection(&self, other: &Map) -> bool {
        std::sync::Arc::ptr_eq(&self.engine, &other.engine) && self.coll.off == other.coll.off
    }

    fn child_path(&self, key: &[u8]) -> Vec<Vec<u8>> {
        let mut path = self.path.clone();
        path.push(key.to_vec());
        path
    }

    /// Fetches the value under `key`, or `None` when absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let entry = self.engine.lock().read_key(self.coll, KeyArg::Bytes(key))?;
        Ok(entry.map(|entry| wrap_stored(&self.engine, entry.value, self.child_path(key))))
    }

    /// Stores `value` under `key`, materializing literal collections
    /// recursively.
    pub fn put(&self, key: &[u8], value: impl Into<Value>) -> Result<()> {
        self.put_tagged(key, value, None)
    }

    /// Like [`Map::put`], with a class tag (persisted when the database
    /// was opened with autobless).
    pub fn put_tagged(
        &self,
        key: &[u8],
        value: impl Into<Value>,
        class: Option<&[u8]>,
    ) -> Result<()> {
        let value = detach_foreign(&value.into(), &self.engine)?;
        let mut engine = self.engine.lock();
        engine.lock_exclusive()?;
        let result = (|| {
            let built = materialize(&mut engine, &value)?;
            engine.write_key(self.coll, KeyArg::Bytes(key), built.as_new_value(), class)?;
            audit_value(&mut engine, &self.child_path(key), &value)
        })();
        let unlock = engine.unlock();
        result.and(unlock)
    }

    /// Deletes `key`, returning the prior value when one was visible.
    pub fn delete(&self, key: &[u8]) -> Result<Option<Value>> {
        let mut engine = self.engine.lock();
        let prior = engine.delete_key(self.coll, KeyArg::Bytes(key))?;
        if let Some(log) = engine.audit_log() {
            log.delete(&crate::audit::join_path(&self.child_path(key)))?;
        }
        Ok(prior.map(|entry| wrap_stored(&self.engine, entry.value, self.child_path(key))))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.engine.lock().exists(self.coll, KeyArg::Bytes(key))
    }

    /// Class tag stored for `key`, when autobless persisted one.
    pub fn tag(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine.lock().class_of(self.coll, KeyArg::Bytes(key))
    }

    /// First key in traversal (digest) order.
    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        let mut engine = self.engine.lock();
        match engine.first_key(self.coll)? {
            Some((_, stored)) => Ok(Some(engine.filters().apply_fetch_key(&stored))),
            None => Ok(None),
        }
    }

    /// Key following `prev` in traversal order, or `None` at the end.
    pub fn next_key(&self, prev: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut engine = self.engine.lock();
        let digest = engine.key_digest(KeyArg::Bytes(prev))?;
        match engine.next_key(self.coll, &digest)? {
            Some((_, stored)) => Ok(Some(engine.filters().apply_fetch_key(&stored))),
            None => Ok(None),
        }
    }

    /// All keys, in traversal order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut engine = self.engine.lock();
        let mut out = Vec::new();
        let mut cursor = engine.first_key(self.coll)?;
        while let Some((digest, stored)) = cursor {
            out.push(engine.filters().apply_fetch_key(&stored));
            cursor = engine.next_key(self.coll, &digest)?;
        }
        Ok(out)
    }

    /// Number of live keys, counted by traversal.
    pub fn len(&self) -> Result<u64> {
        Ok(self.keys()?.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.engine.lock().first_key(self.coll)?.is_none())
    }

    /// Deletes every key in the collection.
    pub fn clear(&self) -> Result<()> {
        let mut engine = self.engine.lock();
        engine.lock_exclusive()?;
        let result = (|| {
            while let Some((_, stored)) = engine.first_key(self.coll)? {
                engine.delete_key(self.coll, KeyArg::Raw(&stored))?;
            }
            if let Some(log) = engine.audit_log() {
                log.clear(&crate::audit::join_path(&self.path))?;
            }
            Ok(())
        })();
        let unlock = engine.unlock();
        result.and(unlock)
    }

    /// Deep copy of the collection as literal values. Not cycle-safe:
    /// exporting a self-referencing tree recurses until it overflows.
    pub fn export(&self) -> Result<Value> {
        Ok(Value::Map(self.export_pairs()?))
    }

    pub(crate) fn export_pairs(&self) -> Result<Vec<(Vec<u8>, Value)>> {
        let mut out = Vec::new();
        let mut cursor = self.engine.lock().first_key(self.coll)?;
        while let Some((digest, stored)) = cursor {
            let (user_key, entry) = {
                let mut engine = self.engine.lock();
                let user_key = engine.filters().apply_fetch_key(&stored);
                let entry = engine.read_key(self.coll, KeyArg::Raw(&stored))?;
                (user_key, entry)
            };
            if let Some(entry) = entry {
                let value = wrap_stored(&self.engine, entry.value, self.child_path(&user_key));
                let exported = match value {
                    Value::MapRef(map) => Value::Map(map.export_pairs()?),
                    Value::SeqRef(seq) => Value::Seq(seq.export_items()?),
                    other => other,
                };
                out.push((user_key, exported));
            }
            cursor = self.engine.lock().next_key(self.coll, &digest)?;
        }
        Ok(out)
    }
}

/// Emits replay statements for a stored value, recursing into literals.
pub(crate) fn audit_value(engine: &mut Engine, path: &[Vec<u8>], value: &Value) -> Result<()> {
    if engine.audit_log().is_none() {
        return Ok(());
    }
    let joined = crate::audit::join_path(path);
    match value {
        Value::Null => engine.audit_log().unwrap().put(&joined, None)?,
        Value::Bytes(bytes) => engine.audit_log().unwrap().put(&joined, Some(bytes))?,
        Value::Map(pairs) => {
            engine.audit_log().unwrap().new_collection(&joined, "map")?;
            for (key, child) in pairs {
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                audit_value(engine, &child_path, child)?;
            }
        }
        Value::Seq(items) => {
            engine.audit_log().unwrap().new_collection(&joined, "seq")?;
            for (index, child) in items.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(index.to_string().into_bytes());
                audit_value(engine, &child_path, child)?;
            }
        }
        Value::MapRef(_) => engine.audit_log().unwrap().new_collection(&joined, "map")?,
        Value::SeqRef(_) => engine.audit_log().unwrap().new_collection(&joined, "seq")?,
    }
    Ok(())
}
