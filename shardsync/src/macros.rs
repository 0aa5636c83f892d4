//! Utility macros for error handling.

/// Creates a [`crate::error::SyncError`] from an error kind, with an optional
/// source error.
///
/// # Examples
/// ```rust,no_run
/// use shardsync::error::ErrorKind;
/// use shardsync::sync_error;
///
/// let error = sync_error!(ErrorKind::KvTxnFailed);
/// ```
#[macro_export]
macro_rules! sync_error {
    ($kind:expr) => {
        $crate::error::SyncError::new($kind)
    };
    ($kind:expr, $source:expr) => {
        $crate::error::SyncError::with_source($kind, $source)
    };
}

/// Creates and returns a [`crate::error::SyncError`] from the current function.
///
/// This macro combines error creation with early return, reducing boilerplate
/// when handling error conditions that should immediately terminate execution.
#[macro_export]
macro_rules! bail {
    ($kind:expr) => {
        return Err($crate::sync_error!($kind))
    };
    ($kind:expr, $source:expr) => {
        return Err($crate::sync_error!($kind, $source))
    };
}
