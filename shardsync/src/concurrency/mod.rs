//! Concurrency primitives for coordinating workers and cancelling blocking
//! round-trips.

pub mod shutdown;

pub use shutdown::{ShutdownRx, ShutdownTx, create_shutdown, until_shutdown};
