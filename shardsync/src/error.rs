use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our Error.
pub type SyncResult<T> = result::Result<T, SyncError>;

/// Internal error representation with kind and optional source error.
///
/// Uses boxing to keep the public Error type size consistent and enable
/// rich error context without performance penalties for the success path.
struct ErrorInner {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for shard-DDL coordination.
///
/// The variants carry enough structured context (member, column, old/new
/// shape) for callers to diagnose which upstream caused a failed
/// reconciliation and how.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No downstream metadata is registered for the task.
    DownstreamMetaNotFound { task: String },

    /// Two sources added the same column with different definitions.
    ColumnConflict {
        lock_id: String,
        source: String,
        column: String,
        detail: String,
    },
    /// Concurrent changes left the same column with incompatible types.
    ColumnTypeConflict {
        lock_id: String,
        source: String,
        column: String,
        detail: String,
    },
    /// Concurrent changes disagree on an index definition.
    IndexConflict {
        lock_id: String,
        source: String,
        index: String,
    },

    /// A proposed DDL is not expressible in the atomic-operation alphabet.
    UnsupportedDdl { source: String, ddl: String },
    /// A proposal failed structural validation before any reconciliation.
    InfoMalformed { reason: String },

    /// KV-store read operation failure.
    KvReadFailed { key: String },
    /// KV-store write operation failure.
    KvWriteFailed { key: String },
    /// KV-store transactional commit failure.
    KvTxnFailed,
    /// JSON serialization failure.
    JsonSerializationFailed,
    /// JSON deserialization failure.
    JsonDeserializationFailed,

    /// The operation was cancelled through the shutdown handle.
    Cancelled { operation: String },

    /// No lock exists under the given id.
    LockNotFound { lock_id: String },

    /// An internal invariant was violated; state can no longer be trusted.
    InvariantViolation { description: String },
}

/// A stable error type for the coordination library.
///
/// This error type provides a stable public API while allowing internal error
/// details to evolve. It supports error chaining, structured error data, and
/// classification for recovery strategies.
pub struct SyncError(Box<ErrorInner>);

impl SyncError {
    /// Creates a new error with the specified kind.
    pub fn new(kind: ErrorKind) -> Self {
        SyncError(Box::new(ErrorInner { kind, source: None }))
    }

    /// Creates a new error with the specified kind and source error.
    pub fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        SyncError(Box::new(ErrorInner {
            kind,
            source: Some(source.into()),
        }))
    }

    /// Creates a downstream-metadata-not-found error.
    pub fn downstream_meta_not_found(task: impl Into<String>) -> Self {
        Self::new(ErrorKind::DownstreamMetaNotFound { task: task.into() })
    }

    /// Creates a malformed-proposal error.
    pub fn info_malformed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InfoMalformed {
            reason: reason.into(),
        })
    }

    /// Creates a cancelled-operation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled {
            operation: operation.into(),
        })
    }

    /// Creates an invariant-violation error.
    pub fn invariant(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation {
            description: description.into(),
        })
    }

    /// Returns the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Returns true if this error reports a schema conflict between sources.
    ///
    /// Conflicts are not failures of the coordinator: the lock stays alive and
    /// a later proposal from a peer (or a retry with `ignore_conflict`) can
    /// resolve them.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.0.kind,
            ErrorKind::ColumnConflict { .. }
                | ErrorKind::ColumnTypeConflict { .. }
                | ErrorKind::IndexConflict { .. }
        )
    }

    /// Returns true if this error is likely transient and retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.0.kind,
            ErrorKind::KvReadFailed { .. }
                | ErrorKind::KvWriteFailed { .. }
                | ErrorKind::KvTxnFailed
        )
    }
}

impl fmt::Debug for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncError")
            .field("kind", &self.0.kind)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;

        match &self.0.kind {
            DownstreamMetaNotFound { task } => {
                write!(f, "downstream metadata not found for task '{task}'")
            }

            ColumnConflict {
                lock_id,
                source,
                column,
                detail,
            } => {
                write!(
                    f,
                    "conflicting column addition of `{column}` from source '{source}' in lock '{lock_id}': {detail}"
                )
            }
            ColumnTypeConflict {
                lock_id,
                source,
                column,
                detail,
            } => {
                write!(
                    f,
                    "incompatible type change of `{column}` from source '{source}' in lock '{lock_id}': {detail}"
                )
            }
            IndexConflict {
                lock_id,
                source,
                index,
            } => {
                write!(
                    f,
                    "conflicting index definition `{index}` from source '{source}' in lock '{lock_id}'"
                )
            }

            UnsupportedDdl { source, ddl } => {
                write!(f, "unsupported DDL from source '{source}': {ddl}")
            }
            InfoMalformed { reason } => write!(f, "malformed proposal: {reason}"),

            KvReadFailed { key } => write!(f, "failed to read from kv store (key: {key})"),
            KvWriteFailed { key } => write!(f, "failed to write to kv store (key: {key})"),
            KvTxnFailed => write!(f, "kv store transaction failed"),
            JsonSerializationFailed => write!(f, "json serialization failed"),
            JsonDeserializationFailed => write!(f, "json deserialization failed"),

            Cancelled { operation } => write!(f, "operation '{operation}' cancelled"),

            LockNotFound { lock_id } => write!(f, "no lock found under id '{lock_id}'"),

            InvariantViolation { description } => {
                write!(f, "invariant violation: {description}")
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}
