//! The user-supplied I/O executor with bounded parallelism that drives all
//! background work: multipart part dispatch and paginated-listing fan-out.
//!
//! Grounded on the `ConcurrencyLimiter`/semaphore-permit pattern in the
//! neon `remote_storage` S3 backend (`fn permit`/`fn owned_permit`):
//! callers acquire a permit, then `tokio::spawn` their own task holding it,
//! rather than handing a future to the executor to run on their behalf.
//! This keeps the trait object-safe (a generic `spawn<F>` method, as a
//! first draft of this module had, cannot be called through `Arc<dyn
//! Executor>`) while still bounding concurrency exactly as the neon code
//! does.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// An acquired slot against an [`Executor`]'s capacity. Dropping it frees
/// the slot for the next waiter.
pub struct ExecutorPermit(#[allow(dead_code)] Box<dyn Any + Send>);

/// Bounded-parallelism task scheduler used for multipart part dispatch and
/// listing page fan-out.
///
/// Implementors must guarantee no more than `capacity()` permits are
/// outstanding at once.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Acquire a permit, waiting if the executor is at capacity.
    async fn acquire(&self) -> ExecutorPermit;

    /// Maximum number of permits this executor grants at once.
    fn capacity(&self) -> usize;

    /// A token that, when cancelled, should cause in-flight pagination and
    /// part dispatch to abort promptly.
    fn stop_token(&self) -> &CancellationToken;
}

/// Default [`Executor`] backed by a Tokio semaphore.
///
/// A task acquires a permit before running and holds it until its future
/// completes; the permit, not a worker pool, is what bounds concurrency, so
/// this composes with whatever Tokio runtime the caller is already using.
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    stop_token: CancellationToken,
}

impl BoundedExecutor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BoundedExecutor {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            stop_token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Executor for BoundedExecutor {
    async fn acquire(&self) -> ExecutorPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore is never closed");
        ExecutorPermit(Box::new(permit))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }
}
