//! # Error Kinds
//!
//! All fallible operations in dpdb return `eyre::Result`. Conditions that
//! callers are expected to branch on carry an [`ErrorKind`] as the root cause
//! of the report, so they can be recovered with
//! `report.downcast_ref::<ErrorKind>()`.
//!
//! Every user-visible message is prefixed with the fixed `dpdb:` identifier.
//!
//! ## Kinds
//!
//! | Kind | Signaled when |
//! |------|---------------|
//! | `Io` | an underlying file operation failed |
//! | `NotADb` | the magic bytes are missing or wrong at open |
//! | `TypeMismatch` | the file root kind differs from the requested view |
//! | `Corrupt` | a sector type is unknown, a size is implausible, or an invariant broke mid-operation |
//! | `Readonly` | a mutation was attempted through a read-only handle |
//! | `UnsupportedType` | a value outside Null/Scalar/Map/Sequence, or an oversized key/class tag |
//! | `TooManyTransactions` | the transaction id space is exhausted |
//! | `AlreadyInTransaction` | nested `begin` |
//! | `NotInTransaction` | `commit`/`rollback` without `begin` |
//! | `TransactionsOpen` | compaction attempted while any transaction is open on the file |
//! | `OutOfBounds` | a negative sequence index below `-length` |

use thiserror::Error;

/// Classified failure conditions, attached as the root cause of `eyre`
/// reports so callers can branch on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("dpdb: io failure: {0}")]
    Io(String),
    #[error("dpdb: file signature not found, not a dpdb file")]
    NotADb,
    #[error("dpdb: file root is {found}, requested {requested}")]
    TypeMismatch {
        found: &'static str,
        requested: &'static str,
    },
    #[error("dpdb: corrupted file: {0}")]
    Corrupt(String),
    #[error("dpdb: cannot write through a read-only handle")]
    Readonly,
    #[error("dpdb: unsupported value: {0}")]
    UnsupportedType(String),
    #[error("dpdb: transaction id space exhausted")]
    TooManyTransactions,
    #[error("dpdb: already inside a transaction")]
    AlreadyInTransaction,
    #[error("dpdb: not inside a transaction")]
    NotInTransaction,
    #[error("dpdb: transactions are open on the file")]
    TransactionsOpen,
    #[error("dpdb: sequence index out of bounds: {index} with length {length}")]
    OutOfBounds { index: i64, length: u64 },
}

impl ErrorKind {
    /// Convenience constructor for corruption reports.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        ErrorKind::Corrupt(msg.into())
    }
}

/// Returns the [`ErrorKind`] carried by a report, if any.
pub fn kind_of(report: &eyre::Report) -> Option<&ErrorKind> {
    report.downcast_ref::<ErrorKind>()
}
