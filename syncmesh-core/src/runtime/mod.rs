//! Runtime support shared by the background loops
//!
//! Shutdown signalling and bounded retry.

pub mod retry;
pub mod shutdown;

pub use retry::{Backoff, RetryPolicy};
pub use shutdown::ShutdownSignal;
