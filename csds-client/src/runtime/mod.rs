//! Provides abstraction for async runtimes.

use std::future::Future;
use std::time::Duration;

pub mod tokio;

/// Timer operations the session needs from the async runtime.
///
/// Tests drive the session with paused tokio time through the same trait.
pub trait Runtime: Send + Sync + Clone + 'static {
    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}
