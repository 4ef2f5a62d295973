//! Shared coalescer instances keyed by (key-type, value-type).
//!
//! A [`CoalescerRegistry`] hands out one lazily constructed
//! [`KeyedCoalescer`] per distinct `(K, V)` pair and retains it for the
//! registry's lifetime; it never disposes what it creates. The registry is an
//! explicit object rather than crate-level ambient state: hold it wherever
//! your application keeps process-lifetime services, or pin it yourself:
//!
//! ```
//! use keyflight::CoalescerRegistry;
//! use once_cell::sync::Lazy;
//!
//! static COALESCERS: Lazy<CoalescerRegistry> = Lazy::new(CoalescerRegistry::new);
//!
//! let value = COALESCERS
//!     .run(9_u64, |key| Ok(key.to_string()))
//!     .unwrap();
//! assert_eq!(value, "9");
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::coalescer::KeyedCoalescer;
use crate::error::CoalesceError;

/// One shared [`KeyedCoalescer`] per (key-type, value-type) pair.
///
/// A thin façade: every method delegates to the per-pair instance, so all
/// coalescing semantics are exactly those of [`KeyedCoalescer`].
pub struct CoalescerRegistry {
    shared: Mutex<HashMap<(TypeId, TypeId), Arc<dyn Any + Send + Sync>>>,
}

impl CoalescerRegistry {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared coalescer for the `(K, V)` pair, constructing it on
    /// first use. Repeated calls with the same pair return the same instance.
    pub fn get<K, V>(&self) -> Arc<KeyedCoalescer<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let slot = shared
            .entry((TypeId::of::<K>(), TypeId::of::<V>()))
            .or_insert_with(|| {
                log::debug!("registry constructing coalescer for new type pair");
                Arc::new(KeyedCoalescer::<K, V>::new())
            });
        Arc::clone(slot)
            .downcast::<KeyedCoalescer<K, V>>()
            .unwrap_or_else(|_| unreachable!("registry entry keyed by the TypeId pair it stores"))
    }

    /// [`KeyedCoalescer::run`] against the shared per-pair instance.
    pub fn run<K, V, F>(&self, key: K, factory: F) -> Result<V, CoalesceError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(K) -> anyhow::Result<V>,
    {
        self.get::<K, V>().run(key, factory)
    }

    /// [`KeyedCoalescer::run_with_timeout`] against the shared per-pair
    /// instance.
    pub fn run_with_timeout<K, V, F>(
        &self,
        key: K,
        factory: F,
        timeout: Duration,
    ) -> Result<V, CoalesceError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(K) -> anyhow::Result<V>,
    {
        self.get::<K, V>().run_with_timeout(key, factory, timeout)
    }

    /// [`KeyedCoalescer::run_async`] against the shared per-pair instance.
    pub async fn run_async<K, V, F, Fut>(&self, key: K, factory: F) -> Result<V, CoalesceError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.get::<K, V>().run_async(key, factory).await
    }

    /// [`KeyedCoalescer::run_async_cancellable`] against the shared per-pair
    /// instance.
    pub async fn run_async_cancellable<K, V, F, Fut>(
        &self,
        key: K,
        factory: F,
        token: CancellationToken,
    ) -> Result<V, CoalesceError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.get::<K, V>()
            .run_async_cancellable(key, factory, token)
            .await
    }

    /// [`KeyedCoalescer::run_async_with_timeout`] against the shared per-pair
    /// instance.
    pub async fn run_async_with_timeout<K, V, F, Fut>(
        &self,
        key: K,
        factory: F,
        timeout: Duration,
    ) -> Result<V, CoalesceError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.get::<K, V>()
            .run_async_with_timeout(key, factory, timeout)
            .await
    }
}

impl Default for CoalescerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_pair_shares_one_instance() {
        let registry = CoalescerRegistry::new();
        let a = registry.get::<u32, String>();
        let b = registry.get::<u32, String>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_pairs_get_distinct_instances() {
        let registry = CoalescerRegistry::new();
        let strings = registry.get::<u32, String>();
        let numbers = registry.get::<u32, u64>();
        // Different concrete types; compare identity through erased pointers.
        assert_ne!(
            Arc::as_ptr(&strings) as *const (),
            Arc::as_ptr(&numbers) as *const ()
        );
    }

    #[tokio::test]
    async fn mirrors_delegate_to_the_shared_instance() {
        let registry = CoalescerRegistry::new();
        let value = registry
            .run_async(5_u32, |key| async move { Ok(key * 2) })
            .await
            .unwrap();
        assert_eq!(value, 10);
    }
}
