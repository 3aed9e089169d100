//! # Entity Layer
//!
//! The public face of the store: a rooted tree of collections. [`Map`] and
//! [`Seq`] are cheap cloneable handles over a shared engine; [`Value`] is
//! what flows in and out of them.
//!
//! ## Values
//!
//! `put` accepts literals (`Null`, `Bytes`, `Map`, `Seq`) and live handles
//! (`MapRef`, `SeqRef`). Literals materialize child collections
//! recursively, child-first, so nothing becomes reachable before it is
//! complete. A live handle from the same file is stored by reference,
//! identity-preserving, which is also how cyclic structures are
//! represented. A handle from a different file is detached into a literal
//! first and copied element-wise.
//!
//! `get` returns `Null`, `Bytes`, or a live handle; [`Map::export`] /
//! [`Seq::export`] turn a subtree into literals (not cycle-safe, by
//! design).
//!
//! ## Equality
//!
//! Literal maps compare order-insensitively (they are associative, and
//! iteration order is digest order, which no caller should depend on);
//! literal sequences compare in order; handles compare by identity
//! (engine and reference sector).

mod map;
mod seq;

pub use map::Map;
pub use seq::Seq;

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::engine::{CollKind, CollRef, Engine, KeyArg, NewValue};

/// Reserved stored key holding a sequence's element count. Decimal index
/// keys can never start with a NUL byte, so it cannot collide.
pub(crate) const LENGTH_KEY: &[u8] = b"\0length";

/// A value stored in, or fetched from, the database.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    /// Literal map: materialized into a child collection on `put`.
    Map(Vec<(Vec<u8>, Value)>),
    /// Literal sequence: materialized into a child collection on `put`.
    Seq(Vec<Value>),
    /// Handle to a live map in some file.
    MapRef(Map),
    /// Handle to a live sequence in some file.
    SeqRef(Seq),
}

impl Value {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::MapRef(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&Seq> {
        match self {
            Value::SeqRef(seq) => Some(seq),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .find(|(other_key, _)| other_key == key)
                            .is_some_and(|(_, other_value)| other_value == value)
                    })
            }
            (Value::MapRef(a), Value::MapRef(b)) => a.same_collection(b),
            (Value::SeqRef(a), Value::SeqRef(b)) => a.same_collection(b),
            _ => false,
        }
    }
}

pub(crate) type SharedEngine = Arc<Mutex<Engine>>;

/// A materialized write input: what `put` hands the engine after literal
/// children are built.
pub(crate) enum Materialized {
    Null,
    Bytes(Vec<u8>),
    Coll(CollRef),
}

impl Materialized {
    pub(crate) fn as_new_value(&self) -> NewValue<'_> {
        match self {
            Materialized::Null => NewValue::Null,
            Materialized::Bytes(bytes) => NewValue::Bytes(bytes),
            Materialized::Coll(coll) => NewValue::Collection(*coll),
        }
    }
}

/// Replaces handles that belong to a *different* engine by their literal
/// export, so materialization below only ever sees same-file handles.
/// Runs before the destination engine is locked.
pub(crate) fn detach_foreign(value: &Value, home: &SharedEngine) -> Result<Value> {
    Ok(match value {
        Value::MapRef(map) if !map.same_engine(home) => Value::Map(map.export_pairs()?),
        Value::SeqRef(seq) if !seq.same_engine(home) => Value::Seq(seq.export_items()?),
        Value::Map(pairs) => Value::Map(
            pairs
                .iter()
                .map(|(key, child)| Ok((key.clone(), detach_foreign(child, home)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Seq(items) => Value::Seq(
            items
                .iter()
                .map(|child| detach_foreign(child, home))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other.clone(),
    })
}

/// Builds the stored form of `value` inside `engine`, creating child
/// collections child-first. Foreign handles must already be detached.
pub(crate) fn materialize(engine: &mut Engine, value: &Value) -> Result<Materialized> {
    Ok(match value {
        Value::Null => Materialized::Null,
        Value::Bytes(bytes) => Materialized::Bytes(bytes.clone()),
        Value::Map(pairs) => {
            let coll = engine.create_collection(CollKind::Map)?;
            for (key, child) in pairs {
                let built = materialize(engine, child)?;
                engine.write_key(coll, KeyArg::Bytes(key), built.as_new_value(), None)?;
            }
            Materialized::Coll(coll)
        }
        Value::Seq(items) => {
            let coll = engine.create_collection(CollKind::Seq)?;
            for (index, child) in items.iter().enumerate() {
                let built = materialize(engine, child)?;
                engine.write_key(
                    coll,
                    KeyArg::Index(index as u64),
                    built.as_new_value(),
                    None,
                )?;
            }
            seq::store_len(engine, coll, items.len() as u64)?;
            Materialized::Coll(coll)
        }
        Value::MapRef(map) => Materialized::Coll(map.coll()),
        Value::SeqRef(seq) => Materialized::Coll(seq.coll()),
    })
}

/// Wraps a fetched engine entry into a user value, handing out handles
/// for nested collections.
pub(crate) fn wrap_stored(
    engine: &SharedEngine,
    stored: crate::engine::StoredValue,
    path: Vec<Vec<u8>>,
) -> Value {
    match stored {
        crate::engine::StoredValue::Null => Value::Null,
        crate::engine::StoredValue::Bytes(bytes) => Value::Bytes(bytes),
        crate::engine::StoredValue::Collection(coll) => match coll.kind {
            CollKind::Map => Value::MapRef(Map::from_parts(engine.clone(), coll, path)),
            CollKind::Seq => Value::SeqRef(Seq::from_parts(engine.clone(), coll, path)),
        },
    }
}
