//! Client holder & finalizer: lifetime-safe access to the S3 client with a
//! finalization barrier.
//!
//! This subsystem has no analogue in the teacher (each `S3Transport` just
//! owns its own `Runtime` + `Client` and is dropped normally); it is built
//! directly from the spec's algorithm description and design notes:
//! a single strong owner on the filesystem side, a weak back-reference
//! from holder to finalizer, and a shared/exclusive barrier so no client
//! call is in flight (or about to start) once finalization completes.
//!
//! `T` is generic (rather than hard-wired to `aws_sdk_s3::Client`) so the
//! finalization algorithm itself — the part the spec calls out as the
//! non-trivial engineering — can be unit-tested without any network
//! dependency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedRwLockReadGuard;

use crate::error::{Error, Result};

trait FinalizeHolder: Send + Sync {
    fn finalize(&self);
}

/// Process-wide (or per-filesystem, in tests) finalization barrier.
///
/// `barrier` is a reader/writer lock used purely for its correctness
/// property, not its performance one, per the design notes: acquiring a
/// [`LockHandle`] takes it in shared mode; [`Finalizer::finalize`] takes it
/// in exclusive mode, which only succeeds once every outstanding shared
/// holder of the lock has released it.
pub struct Finalizer {
    barrier: Arc<tokio::sync::RwLock<()>>,
    finalized: AtomicBool,
    holders: Mutex<Vec<Weak<dyn FinalizeHolder>>>,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Finalizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Finalizer {
            barrier: Arc::new(tokio::sync::RwLock::new(())),
            finalized: AtomicBool::new(false),
            holders: Mutex::new(Vec::new()),
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn register(&self, holder: Weak<dyn FinalizeHolder>) {
        let mut holders = self.holders.lock().unwrap();
        holders.retain(|w| w.strong_count() > 0);
        holders.push(holder);
    }

    /// Take the exclusive phase of finalization: set `finalized`, release
    /// the barrier, then null-clear every live holder's client.
    ///
    /// Idempotent: a second call observes `finalized` already set and
    /// returns immediately without re-invoking any holder.
    pub async fn finalize(self: &Arc<Self>) {
        if self.finalized.load(Ordering::SeqCst) {
            return;
        }
        {
            // Exclusive acquisition blocks until every outstanding shared
            // `LockHandle` has been released, satisfying P5: finalization
            // only returns once no client call can still be in flight.
            let _write_guard = self.barrier.clone().write_owned().await;
            if self.finalized.swap(true, Ordering::SeqCst) {
                return; // raced with another finalize() call
            }
        }
        let holders = {
            let mut holders = self.holders.lock().unwrap();
            std::mem::take(&mut *holders)
        };
        for weak in holders {
            if let Some(holder) = weak.upgrade() {
                holder.finalize();
            }
        }
    }
}

/// Lifetime-safe access to a held client of type `T`.
///
/// `T` is expected to be a cheap-to-clone handle (as `aws_sdk_s3::Client`
/// is: an `Arc`-backed wrapper around shared connection state).
pub struct ClientHolder<T> {
    finalizer: Weak<Finalizer>,
    client: Mutex<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> ClientHolder<T> {
    /// Create a holder registered with `finalizer`, owning `client`.
    pub fn new(finalizer: &Arc<Finalizer>, client: T) -> Arc<Self> {
        let holder = Arc::new(ClientHolder {
            finalizer: Arc::downgrade(finalizer),
            client: Mutex::new(Some(client)),
        });
        let weak: Weak<dyn FinalizeHolder> = Arc::downgrade(&holder) as Weak<dyn FinalizeHolder>;
        finalizer.register(weak);
        holder
    }

    /// Acquire a [`LockHandle`]: guarantees the client is non-null and that
    /// the finalizer will not complete until the handle is released.
    ///
    /// Callers must not hold the returned handle across a call that might
    /// itself acquire another `LockHandle` on the same finalizer — doing so
    /// risks reader-starvation deadlock against a pending exclusive
    /// `finalize()` call. See [`LockHandle::move_out`].
    pub async fn lock(&self) -> Result<LockHandle<T>> {
        let finalizer = self.finalizer.upgrade().ok_or(Error::Finalized)?;
        let guard = finalizer.barrier.clone().read_owned().await;
        if finalizer.is_finalized() {
            drop(guard);
            return Err(Error::Finalized);
        }
        let client = self
            .client
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Finalized)?;
        Ok(LockHandle {
            _guard: guard,
            client,
        })
    }
}

impl<T: Send + Sync + 'static> FinalizeHolder for ClientHolder<T> {
    fn finalize(&self) {
        *self.client.lock().unwrap() = None;
    }
}

/// A held, guaranteed-live client, plus a guard that keeps the finalizer
/// from completing until this handle is dropped.
pub struct LockHandle<T> {
    _guard: OwnedRwLockReadGuard<()>,
    client: T,
}

impl<T> LockHandle<T> {
    pub fn client(&self) -> &T {
        &self.client
    }

    /// Move the client out of the handle, dropping the finalizer guard
    /// immediately. Use this at call sites that issue multiple S3 requests,
    /// so the lock's release is syntactically visible rather than implicit
    /// in end-of-scope drop order:
    ///
    /// ```ignore
    /// let client = holder.lock().await?.move_out();
    /// client.head_object()...send().await?;
    /// client.get_object()...send().await?; // second request, lock already released
    /// ```
    pub fn move_out(self) -> T {
        self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_before_finalize_succeeds() {
        let finalizer = Finalizer::new();
        let holder = ClientHolder::new(&finalizer, 42i32);
        let handle = holder.lock().await.unwrap();
        assert_eq!(*handle.client(), 42);
    }

    #[tokio::test]
    async fn lock_after_finalize_returns_finalized() {
        let finalizer = Finalizer::new();
        let holder = ClientHolder::new(&finalizer, 42i32);
        finalizer.finalize().await;
        assert!(matches!(holder.lock().await, Err(Error::Finalized)));
    }

    #[tokio::test]
    async fn finalize_clears_client_in_existing_holders() {
        let finalizer = Finalizer::new();
        let holder = ClientHolder::new(&finalizer, "client".to_string());
        finalizer.finalize().await;
        assert!(holder.client.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let finalizer = Finalizer::new();
        let holder = ClientHolder::new(&finalizer, 1i32);
        finalizer.finalize().await;
        finalizer.finalize().await;
        assert!(matches!(holder.lock().await, Err(Error::Finalized)));
    }

    /// P5: finalize() does not return until every outstanding lock is
    /// released, even under a concurrent holder of a `LockHandle`.
    #[tokio::test]
    async fn finalize_waits_for_outstanding_lock() {
        let finalizer = Finalizer::new();
        let holder = ClientHolder::new(&finalizer, 7i32);

        let handle = holder.lock().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let finalizer2 = finalizer.clone();
        let order2 = order.clone();
        let finalize_task = tokio::spawn(async move {
            finalizer2.finalize().await;
            order2.lock().unwrap().push("finalized");
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!finalize_task.is_finished(), "finalize must block on outstanding lock");
        order.lock().unwrap().push("still-holding");

        drop(handle);
        finalize_task.await.unwrap();

        let order = order.lock().unwrap();
        assert_eq!(order.as_slice(), ["still-holding", "finalized"]);
    }

    #[tokio::test]
    async fn new_holders_after_finalize_are_already_finalized() {
        let finalizer = Finalizer::new();
        finalizer.finalize().await;
        let holder = ClientHolder::new(&finalizer, AtomicUsize::new(0));
        assert!(matches!(holder.lock().await, Err(Error::Finalized)));
    }
}
