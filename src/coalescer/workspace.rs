//! Per-key synchronization unit for one in-flight execution.
//!
//! A workspace owns a counting gate with a single initial permit and a
//! write-once result slot. The first caller through the gate becomes the
//! producer; everyone else parks on the gate until the producer stores the
//! result and opens the gate wide. The slot is a tagged optional on purpose:
//! presence must be distinguishable from the value itself, since a legitimate
//! result may equal the type's default.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::CoalesceError;

/// Wait policy for one caller's trip through the coalescer.
///
/// `EntryTimeout` bounds gate acquisition only and never the factory; the
/// cancellation-shaped policies (`Cancel`, `Deadline`) also bound the caller's
/// own factory execution.
pub(crate) enum Wait {
    Unbounded,
    EntryTimeout(Duration),
    Cancel(CancellationToken),
    Deadline(tokio::time::Instant),
}

impl Wait {
    /// Whether the caller's cancellation was already triggered before any
    /// shared state was touched.
    pub(crate) fn already_fired(&self) -> bool {
        match self {
            Wait::Cancel(token) => token.is_cancelled(),
            Wait::Deadline(at) => tokio::time::Instant::now() >= *at,
            Wait::Unbounded | Wait::EntryTimeout(_) => false,
        }
    }

    /// Drives the producer's factory, racing it against this caller's own
    /// cancellation. A plain or entry-timeout wait never aborts the factory.
    pub(crate) async fn bound_factory<V, Fut>(&self, factory: Fut) -> Result<V, CoalesceError>
    where
        Fut: Future<Output = anyhow::Result<V>>,
    {
        match self {
            Wait::Cancel(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(CoalesceError::Cancelled),
                produced = factory => produced.map_err(CoalesceError::Factory),
            },
            Wait::Deadline(at) => match tokio::time::timeout_at(*at, factory).await {
                Ok(produced) => produced.map_err(CoalesceError::Factory),
                Err(_) => Err(CoalesceError::Cancelled),
            },
            Wait::Unbounded | Wait::EntryTimeout(_) => {
                factory.await.map_err(CoalesceError::Factory)
            }
        }
    }
}

/// Opening the gate must admit every waiter already parked plus any number of
/// late arrivals, so the release is effectively unbounded. One permit is
/// reserved headroom for the initial permit the producer forgot.
const RELEASE_ALL_PERMITS: usize = Semaphore::MAX_PERMITS - 1;

/// Transient record of one in-flight operation for one key.
pub(crate) struct Workspace<V> {
    gate: Semaphore,
    slot: OnceCell<V>,
    released: AtomicBool,
}

impl<V> Workspace<V> {
    pub(crate) fn new() -> Self {
        Self {
            gate: Semaphore::new(1),
            slot: OnceCell::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Parks the caller until a permit is available or the wait policy fires.
    ///
    /// The gate is closed only on coalescer disposal, so a closed-gate failure
    /// maps to `Disposed`.
    pub(crate) async fn acquire_entry(
        &self,
        wait: &Wait,
    ) -> Result<SemaphorePermit<'_>, CoalesceError> {
        let acquired = match wait {
            Wait::Unbounded => self.gate.acquire().await,
            Wait::EntryTimeout(limit) => {
                match tokio::time::timeout(*limit, self.gate.acquire()).await {
                    Ok(acquired) => acquired,
                    Err(_) => return Err(CoalesceError::Timeout),
                }
            }
            Wait::Deadline(at) => match tokio::time::timeout_at(*at, self.gate.acquire()).await {
                Ok(acquired) => acquired,
                Err(_) => return Err(CoalesceError::Cancelled),
            },
            Wait::Cancel(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CoalesceError::Cancelled),
                acquired = self.gate.acquire() => acquired,
            },
        };
        acquired.map_err(|_| CoalesceError::Disposed)
    }

    pub(crate) fn result(&self) -> Option<&V> {
        self.slot.get()
    }

    pub(crate) fn has_result(&self) -> bool {
        self.slot.get().is_some()
    }

    /// First write wins. Only a caller that observed an empty slot immediately
    /// after acquiring entry stores here; after a producer failure several
    /// released waiters may re-produce concurrently, so later writes are
    /// ignored rather than asserted against.
    pub(crate) fn store_result(&self, value: V) {
        let _ = self.slot.set(value);
    }

    /// Opens the gate to every current and future waiter. Idempotent: failure
    /// cleanup and a re-producing waiter's cleanup may both land here.
    pub(crate) fn release_all(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.gate.add_permits(RELEASE_ALL_PERMITS);
        }
    }

    /// Invalidates the gate; every parked and future `acquire_entry` fails.
    /// Used only when the owning coalescer is torn down.
    pub(crate) fn close(&self) {
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_caller_enters_immediately() {
        let ws: Workspace<u32> = Workspace::new();
        let permit = ws.acquire_entry(&Wait::Unbounded).await.unwrap();
        assert!(!ws.has_result());
        permit.forget();
    }

    #[tokio::test]
    async fn second_caller_parks_until_release() {
        let ws: Arc<Workspace<u32>> = Arc::new(Workspace::new());
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();

        let waiter = {
            let ws = Arc::clone(&ws);
            tokio::spawn(async move {
                ws.acquire_entry(&Wait::Unbounded).await.unwrap();
                ws.result().copied()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        ws.store_result(7);
        ws.release_all();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn release_all_admits_late_arrivals() {
        let ws: Workspace<u32> = Workspace::new();
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();
        ws.store_result(1);
        ws.release_all();
        ws.release_all();

        for _ in 0..64 {
            let permit = ws.acquire_entry(&Wait::Unbounded).await.unwrap();
            drop(permit);
        }
        assert_eq!(ws.result(), Some(&1));
    }

    #[tokio::test]
    async fn entry_timeout_fires_while_parked() {
        let ws: Workspace<u32> = Workspace::new();
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();

        let outcome = ws
            .acquire_entry(&Wait::EntryTimeout(Duration::from_millis(20)))
            .await;
        assert!(matches!(outcome, Err(CoalesceError::Timeout)));
    }

    #[tokio::test]
    async fn deadline_surfaces_as_cancelled() {
        let ws: Workspace<u32> = Workspace::new();
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();

        let at = tokio::time::Instant::now() + Duration::from_millis(20);
        let outcome = ws.acquire_entry(&Wait::Deadline(at)).await;
        assert!(matches!(outcome, Err(CoalesceError::Cancelled)));
    }

    #[tokio::test]
    async fn token_cancels_a_parked_waiter() {
        let ws: Arc<Workspace<u32>> = Arc::new(Workspace::new());
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();

        let token = CancellationToken::new();
        let waiter = {
            let ws = Arc::clone(&ws);
            let token = token.clone();
            tokio::spawn(async move { ws.acquire_entry(&Wait::Cancel(token)).await.map(|p| p.forget()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(CoalesceError::Cancelled)));
    }

    #[tokio::test]
    async fn close_fails_parked_and_future_callers() {
        let ws: Arc<Workspace<u32>> = Arc::new(Workspace::new());
        ws.acquire_entry(&Wait::Unbounded).await.unwrap().forget();

        let waiter = {
            let ws = Arc::clone(&ws);
            tokio::spawn(async move { ws.acquire_entry(&Wait::Unbounded).await.map(|p| p.forget()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ws.close();
        assert!(matches!(waiter.await.unwrap(), Err(CoalesceError::Disposed)));
        assert!(matches!(
            ws.acquire_entry(&Wait::Unbounded).await,
            Err(CoalesceError::Disposed)
        ));
    }
}
