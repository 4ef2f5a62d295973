//! Shared runtime backing the blocking entry points.
//!
//! The synchronous API drives the same async core as everything else. Futures
//! are polled on the calling thread via `Runtime::block_on`; the runtime keeps
//! one background worker alive so timers fire even while every caller thread
//! is parked inside a factory.

use std::future::Future;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

static BLOCKING: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("keyflight-blocking")
        .enable_time()
        .build()
        .expect("failed to build keyflight blocking runtime")
});

/// Blocks the calling thread on `future`. Panics if called from inside an
/// async context (tokio forbids nested blocking); callers in async contexts
/// use the async entry points instead.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    BLOCKING.block_on(future)
}
