//! Watch-based shutdown signaling.
//!
//! KV-store round-trips and the injected downstream-metadata resolver may
//! block indefinitely; every suspension point in the coordinator is raced
//! against a shutdown handle so a master that is stepping down never hangs on
//! a dead store.

use std::future::Future;
use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};

/// Transmitter side of the shutdown channel.
///
/// Dropping the transmitter also signals shutdown, which matches the common
/// pattern of tying worker lifetimes to their owner.
pub type ShutdownTx = watch::Sender<()>;

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<()>;

/// Creates a new shutdown channel.
///
/// The returned receiver can be cloned freely; all clones observe the same
/// signal.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    watch::channel(())
}

/// Runs `fut` until it completes or the shutdown signal fires.
///
/// On shutdown the future is dropped, which aborts the in-flight KV
/// round-trip; callers rely on the coordinator mutating in-memory state only
/// after persistence succeeded, so a cancelled call is a no-op.
pub async fn until_shutdown<T, F>(
    shutdown: &mut ShutdownRx,
    operation: &str,
    fut: F,
) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        result = fut => result,
        _ = shutdown.changed() => Err(SyncError::cancelled(operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn completed_future_wins_over_idle_shutdown() {
        let (_tx, mut rx) = create_shutdown();
        let result = until_shutdown(&mut rx, "noop", async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_blocked_future() {
        let (tx, mut rx) = create_shutdown();
        tx.send(()).unwrap();

        let result: SyncResult<()> = until_shutdown(&mut rx, "blocked", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cancelled { .. }));
    }
}
