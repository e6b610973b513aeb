//! Common test utilities for integration tests.

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

use std::time::Duration;

/// Let spawned tasks (handle callers, RPC tasks) run before the next tick.
pub async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Test timing utilities
pub mod timing {
    use std::time::Duration;

    /// Runs a future with a timeout
    pub async fn with_timeout<Fut, T>(
        fut: Fut,
        timeout: Duration,
    ) -> std::result::Result<T, tokio::time::error::Elapsed>
    where
        Fut: std::future::Future<Output = T>,
    {
        tokio::time::timeout(timeout, fut).await
    }
}
