//! Per-key request deduplication.
//!
//! [`KeyedCoalescer`] maps an arbitrary key to its active [`Workspace`],
//! creating one lazily per unique key and evicting it as soon as the producing
//! caller has finished. Contention is strictly per-key: calls for different
//! keys never block each other, and the key-to-workspace map is the only piece
//! of shared mutable state.
//!
//! All entry points converge on one protocol:
//!
//! 1. fail fast on disposal or an already-fired cancellation,
//! 2. get-or-create the key's workspace (one instance survives a creation race),
//! 3. acquire entry on its gate, honoring the caller's wait policy,
//! 4. empty slot: run the factory, evict the key, store, open the gate wide,
//! 5. populated slot: clone the shared value.
//!
//! Only successful results are shared. A factory failure propagates to the
//! caller that ran the factory; waiters woken with an empty slot simply
//! re-produce on their own behalf.

mod workspace;

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::CoalesceError;
use crate::runtime;
use workspace::{Wait, Workspace};

/// Coalesces concurrent identical operations by key.
///
/// For N concurrent calls with equal keys the supplied factory executes once
/// and all N callers receive clones of the one result. The result is dropped
/// once the last attached caller has taken it; nothing is cached, so a later
/// call with the same key executes its factory again.
///
/// Key equivalence is the map's equivalence: implement `Eq`/`Hash` on the key
/// type (composite keys are ordinary tuples or structs), and supply a custom
/// [`BuildHasher`] through [`with_hasher`](Self::with_hasher) when the default
/// hashing does not fit.
pub struct KeyedCoalescer<K, V, S = RandomState> {
    workspaces: DashMap<K, Arc<Workspace<V>>, S>,
    disposed: AtomicBool,
}

impl<K, V> KeyedCoalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, V> Default for KeyedCoalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> KeyedCoalescer<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    /// Creates a coalescer whose key map uses the supplied hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            workspaces: DashMap::with_hasher(hasher),
            disposed: AtomicBool::new(false),
        }
    }

    /// Runs `factory` for `key`, blocking the calling thread without limit.
    ///
    /// Concurrent callers with an equal key share the producer's result. The
    /// factory's own failure is returned only to the caller whose factory ran.
    ///
    /// Must not be called from inside an async context; use
    /// [`run_async`](Self::run_async) there.
    pub fn run<F>(&self, key: K, factory: F) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> anyhow::Result<V>,
    {
        runtime::block_on(self.run_inner(key, |k| std::future::ready(factory(k)), Wait::Unbounded))
    }

    /// Like [`run`](Self::run), but waits at most `timeout` for entry.
    ///
    /// The timeout bounds entry acquisition only. A caller that wins the race
    /// to produce is already past the gate, so the timeout never aborts a
    /// factory in progress: an uncontended call with a 50ms timeout and a
    /// 500ms factory still runs the factory to completion.
    pub fn run_with_timeout<F>(
        &self,
        key: K,
        factory: F,
        timeout: Duration,
    ) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> anyhow::Result<V>,
    {
        runtime::block_on(self.run_inner(
            key,
            |k| std::future::ready(factory(k)),
            Wait::EntryTimeout(timeout),
        ))
    }

    /// Runs `factory` for `key`, suspending the calling task without limit.
    pub async fn run_async<F, Fut>(&self, key: K, factory: F) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.run_inner(key, factory, Wait::Unbounded).await
    }

    /// Like [`run_async`](Self::run_async), but honors `token`.
    ///
    /// The token is checked before any shared state is touched, raced against
    /// the wait at the gate, and raced against this caller's own factory
    /// execution. Cancelling one caller never disturbs the producer or other
    /// waiters on the same key, unless this caller *is* the producer, in which
    /// case its factory is aborted and the key is cleaned up for re-use.
    pub async fn run_async_cancellable<F, Fut>(
        &self,
        key: K,
        factory: F,
        token: CancellationToken,
    ) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.run_inner(key, factory, Wait::Cancel(token)).await
    }

    /// Like [`run_async`](Self::run_async), but bounded by a wall-clock
    /// timeout.
    ///
    /// The timeout is a derived cancellation deadline: like a token it also
    /// bounds this caller's own factory execution, and expiry surfaces as
    /// [`CoalesceError::Cancelled`], not [`CoalesceError::Timeout`].
    pub async fn run_async_with_timeout<F, Fut>(
        &self,
        key: K,
        factory: F,
        timeout: Duration,
    ) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let at = tokio::time::Instant::now() + timeout;
        self.run_inner(key, factory, Wait::Deadline(at)).await
    }

    /// Terminal teardown: wakes every blocked caller with
    /// [`CoalesceError::Disposed`] and fails all subsequent calls the same
    /// way. There is no re-enable path.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(
            "coalescer disposed; waking {} in-flight key(s)",
            self.workspaces.len()
        );
        for entry in self.workspaces.iter() {
            entry.value().close();
        }
        self.workspaces.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn run_inner<F, Fut>(&self, key: K, factory: F, wait: Wait) -> Result<V, CoalesceError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if self.is_disposed() {
            return Err(CoalesceError::Disposed);
        }
        if wait.already_fired() {
            return Err(CoalesceError::Cancelled);
        }

        let workspace = self.attach(&key);

        // dispose() may have swept the map between the flag check and the
        // insert; a workspace attached now would never be woken.
        if self.is_disposed() {
            self.workspaces
                .remove_if(&key, |_, ws| Arc::ptr_eq(ws, &workspace));
            workspace.close();
            return Err(CoalesceError::Disposed);
        }

        let permit = workspace.acquire_entry(&wait).await?;

        if let Some(value) = workspace.result() {
            return Ok(value.clone());
        }

        // Empty slot: this caller produces. The initial permit is consumed
        // for good; the gate reopens only through release_all.
        permit.forget();
        log::trace!("entered as producer");

        let cleanup = ProducerCleanup {
            coalescer: self,
            key: &key,
            workspace: &workspace,
        };
        let value = wait.bound_factory(factory(key.clone())).await?;
        workspace.store_result(value.clone());
        drop(cleanup);
        Ok(value)
    }

    /// Race-safe get-or-create: concurrent creators for the same key converge
    /// on the one workspace that won the insert.
    fn attach(&self, key: &K) -> Arc<Workspace<V>> {
        self.workspaces
            .entry(key.clone())
            .or_insert_with(|| {
                log::trace!("creating workspace");
                Arc::new(Workspace::new())
            })
            .value()
            .clone()
    }
}

/// Guaranteed producer cleanup, run on success, factory failure, cancellation
/// mid-factory, and unwind alike.
///
/// Eviction precedes release so a late arrival can never attach to this
/// workspace once waiters start flowing; the identity guard keeps a stale
/// producer (one that outlived a failure and re-produced) from evicting a
/// replacement workspace that now owns the key.
struct ProducerCleanup<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    coalescer: &'a KeyedCoalescer<K, V, S>,
    key: &'a K,
    workspace: &'a Arc<Workspace<V>>,
}

impl<K, V, S> Drop for ProducerCleanup<'_, K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn drop(&mut self) {
        self.coalescer
            .workspaces
            .remove_if(self.key, |_, ws| Arc::ptr_eq(ws, self.workspace));
        self.workspace.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_caller_round_trip() {
        let coalescer = KeyedCoalescer::<u32, String>::new();
        let value = coalescer
            .run_async(7, |key| async move { Ok(format!("value-{key}")) })
            .await
            .unwrap();
        assert_eq!(value, "value-7");
    }

    #[tokio::test]
    async fn key_absent_after_completion() {
        let coalescer = KeyedCoalescer::<u32, u32>::new();
        coalescer.run_async(1, |_| async { Ok(10) }).await.unwrap();
        assert!(coalescer.workspaces.is_empty());
    }

    #[tokio::test]
    async fn key_absent_after_factory_failure() {
        let coalescer = KeyedCoalescer::<u32, u32>::new();
        let outcome = coalescer
            .run_async(1, |_| async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(matches!(outcome, Err(CoalesceError::Factory(_))));
        assert!(coalescer.workspaces.is_empty());
    }

    #[tokio::test]
    async fn zero_value_results_are_shared_normally() {
        // Presence is tracked separately from the value, so a result equal to
        // the type's default is still a result.
        let coalescer = KeyedCoalescer::<u32, u32>::new();
        assert_eq!(coalescer.run_async(1, |_| async { Ok(0) }).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dispose_is_terminal_and_idempotent() {
        let coalescer = KeyedCoalescer::<u32, u32>::new();
        coalescer.dispose();
        coalescer.dispose();
        assert!(coalescer.is_disposed());
        let outcome = coalescer.run_async(1, |_| async { Ok(1) }).await;
        assert!(matches!(outcome, Err(CoalesceError::Disposed)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_touches_nothing() {
        let coalescer = KeyedCoalescer::<u32, u32>::new();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = coalescer
            .run_async_cancellable(1, |_| async { Ok(1) }, token)
            .await;
        assert!(matches!(outcome, Err(CoalesceError::Cancelled)));
        assert!(coalescer.workspaces.is_empty());
    }

    #[tokio::test]
    async fn producer_cancellation_aborts_factory_and_heals_key() {
        let coalescer = KeyedCoalescer::<u32, u32>::new();

        // The token fires during the factory race, after entry was granted.
        let fresh = CancellationToken::new();
        let aborting = coalescer.run_async_cancellable(
            1,
            |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            },
            fresh.clone(),
        );
        tokio::pin!(aborting);
        tokio::select! {
            biased;
            _ = &mut aborting => panic!("factory should still be sleeping"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => fresh.cancel(),
        }
        assert!(matches!(aborting.await, Err(CoalesceError::Cancelled)));

        // Cleanup ran: the key is free and a fresh call succeeds.
        assert_eq!(coalescer.run_async(1, |_| async { Ok(2) }).await.unwrap(), 2);
    }
}
