//! `tokio` based runtime implementation.

use crate::runtime::Runtime;
use std::time::Duration;

/// Tokio-based runtime implementation.
#[derive(Clone, Debug, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
