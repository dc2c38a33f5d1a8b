//! The root-agent callback invoked once per attempt.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`RootRunner::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Runs the root agent once.
///
/// `attempt` is zero-based. An error marks the attempt as failed; the
/// supervisor logs it and decides whether to try again. Implementations own
/// cancellation inside the attempt: the supervisor only checks `cancel`
/// between attempts.
pub trait RootRunner: Send + Sync {
    fn run(&self, cancel: CancellationToken, attempt: u32) -> RunFuture<'_>;
}

impl<F, Fut> RootRunner for F
where
    F: Fn(CancellationToken, u32) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(&self, cancel: CancellationToken, attempt: u32) -> RunFuture<'_> {
        Box::pin(self(cancel, attempt))
    }
}
