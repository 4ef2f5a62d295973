//! Error taxonomy for coalesced runs.

/// Failure modes of a coalesced run.
///
/// Factory failures are delivered only to the caller whose factory ran; they are
/// never shared with other waiters on the same key.
#[derive(Debug)]
pub enum CoalesceError {
    /// The caller's cancellation signal fired before or during the wait, or
    /// aborted the caller's own factory execution. Async timeouts also surface
    /// here, since they are implemented as a derived cancellation deadline.
    Cancelled,
    /// A synchronous wait exceeded its bound. The timeout gates entry
    /// acquisition only; it never aborts a factory already executing.
    Timeout,
    /// The coalescer was torn down, either before this call or while it was
    /// blocked waiting for a result.
    Disposed,
    /// The factory executed by this caller failed. Propagated verbatim,
    /// unwrapped and unretried.
    Factory(anyhow::Error),
}

impl std::fmt::Display for CoalesceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoalesceError::Cancelled => write!(f, "Wait cancelled"),
            CoalesceError::Timeout => write!(f, "Wait timed out"),
            CoalesceError::Disposed => write!(f, "Coalescer disposed"),
            CoalesceError::Factory(err) => write!(f, "Factory failed: {}", err),
        }
    }
}

impl std::error::Error for CoalesceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoalesceError::Factory(err) => Some(&**err),
            _ => None,
        }
    }
}

impl CoalesceError {
    /// True for the failures raised by the coalescer's own wait machinery, as
    /// opposed to a failure of the caller-supplied factory.
    pub fn is_wait_failure(&self) -> bool {
        !matches!(self, CoalesceError::Factory(_))
    }
}
