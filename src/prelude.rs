//! Convenience re-exports for the common path.

pub use crate::coalescer::KeyedCoalescer;
pub use crate::error::CoalesceError;
pub use crate::registry::CoalescerRegistry;
pub use tokio_util::sync::CancellationToken;
