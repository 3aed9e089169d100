//! # Compaction
//!
//! A database that has seen churn carries freed sectors, tombstoned
//! bucket slots, and deleted-marker KeyLocators. Compaction copies the
//! live tree into a fresh sibling file with the same header parameters
//! and atomically renames it over the original.
//!
//! Other instances notice the inode change on their next outermost lock
//! acquisition and transparently reopen (see `storage::file`). Handles to
//! *child* collections become stale (sector offsets change) and read
//! as absent afterwards; the root resolves freshly on every operation and
//! keeps working.
//!
//! Like recursive export, compaction is not cycle-safe. It refuses to run
//! while any transaction is open anywhere on the file, since transaction
//! slots are deliberately not carried over.

use eyre::{bail, ensure, Result, WrapErr};
use tracing::info;

use crate::config::{Filters, OpenOptions};
use crate::db::Db;
use crate::engine::{CollRef, Engine, NewValue, StoredValue};
use crate::error::ErrorKind;

impl Db {
    /// Rewrites the database file, dropping all dead space.
    pub fn compact(&self) -> Result<()> {
        let mut engine = self.engine().lock();
        engine.lock_exclusive()?;
        let result = compact_locked(&mut engine);
        let unlock = engine.unlock();
        match (result, unlock) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err),
        }
    }
}

fn compact_locked(engine: &mut Engine) -> Result<()> {
    ensure!(!engine.in_transaction(), ErrorKind::AlreadyInTransaction);
    ensure!(!engine.any_live_txns()?, ErrorKind::TransactionsOpen);

    let path = engine.path().to_path_buf();
    let mut scratch_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    scratch_name.push(".compact");
    let scratch = path.with_file_name(scratch_name);
    if scratch.exists() {
        std::fs::remove_file(&scratch)
            .wrap_err_with(|| ErrorKind::Io("cannot clear stale compaction file".into()))?;
    }

    let params = *engine.params();
    let mut target = Engine::open(OpenOptions {
        path: scratch.clone(),
        file_offset: engine.header_offset(),
        byte_size: params.byte_size,
        max_buckets: params.max_buckets,
        readonly: false,
        locking: false,
        autoflush: false,
        autobless: true,
        root_kind: engine.root_kind(),
        digest: engine.digest_fn(),
        filters: Filters::default(),
        audit: None,
    })?;

    let source_root = engine.root()?;
    let target_root = target.root()?;
    copy_collection(engine, source_root, &mut target, target_root)?;
    target.sync()?;
    drop(target);

    std::fs::rename(&scratch, &path)
        .wrap_err_with(|| ErrorKind::Io("compaction rename failed".into()))?;
    info!(path = %path.display(), "compacted database");
    Ok(())
}

/// Copies every live HEAD entry of `source` into `target`, raw: stored
/// key forms, stored scalar bytes, and class tags move unchanged, so
/// filter configuration cannot skew the copy.
fn copy_collection(
    source: &mut Engine,
    source_coll: CollRef,
    target: &mut Engine,
    target_coll: CollRef,
) -> Result<()> {
    let mut cursor = source.first_key(source_coll)?;
    while let Some((digest, stored_key)) = cursor {
        if let Some(entry) = source.read_key_raw(source_coll, &stored_key)? {
            let class = entry.class.as_deref();
            match entry.value {
                StoredValue::Null => {
                    target.write_key_raw(target_coll, stored_key.clone(), NewValue::Null, class)?
                }
                StoredValue::Bytes(bytes) => target.write_key_raw(
                    target_coll,
                    stored_key.clone(),
                    NewValue::Bytes(&bytes),
                    class,
                )?,
                StoredValue::Collection(child) => {
                    let fresh = target.create_collection(child.kind)?;
                    copy_collection(source, child, target, fresh)?;
                    target.write_key_raw(
                        target_coll,
                        stored_key.clone(),
                        NewValue::Collection(fresh),
                        class,
                    )?;
                }
            }
        } else {
            bail!(ErrorKind::corrupt(
                "live key vanished during compaction".to_string()
            ));
        }
        cursor = source.next_key(source_coll, &digest)?;
    }
    Ok(())
}
