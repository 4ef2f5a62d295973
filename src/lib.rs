//! Keyflight - keyed request coalescing
//!
//! When several concurrent callers need the result of one identical,
//! expensive, side-effecting operation (identified by a key), exactly one
//! execution happens; every concurrent caller receives the same result; once
//! the last waiter has taken it, the result is discarded. This is explicitly
//! not a cache: no entry outlives its last in-flight waiter, and a later call
//! with the same key runs the operation again.
//!
//! # Features
//!
//! - **Per-key contention only**: distinct keys never block each other
//! - **Sync and async entry points**: blocking calls with optional timeout,
//!   async calls with optional cancellation or deadline
//! - **Failure isolation**: only successful results are shared; a factory
//!   failure reaches just the caller whose factory ran
//! - **Self-healing keys**: cleanup is guaranteed under error, cancellation,
//!   and panic, so a failed run never poisons a key
//! - **Terminal disposal**: tearing a coalescer down wakes every blocked
//!   caller with a failure
//! - **Per-type shared instances**: [`CoalescerRegistry`] hands out one
//!   coalescer per (key-type, value-type) pair for zero-ceremony call sites
//!
//! # Example
//!
//! ```
//! use keyflight::KeyedCoalescer;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let coalescer = KeyedCoalescer::<u64, String>::new();
//! let value = coalescer
//!     .run_async(42, |key| async move { Ok(format!("row-{key}")) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, "row-42");
//! # }
//! ```

pub mod coalescer;
pub mod error;
pub mod prelude;
pub mod registry;
mod runtime;

pub use coalescer::KeyedCoalescer;
pub use error::CoalesceError;
pub use registry::CoalescerRegistry;

// Re-exported so callers do not need a direct tokio-util dependency to cancel.
pub use tokio_util::sync::CancellationToken;
