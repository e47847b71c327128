use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Returned by [`CancellationToken::raise_if_cancelled`] so long-running loops
/// can bail out with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A shared cooperative-cancellation flag.
///
/// Clones observe the same flag. Once set it stays set.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Calling it again has no further effect.
    pub fn request_cancellation(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint for loops: `token.raise_if_cancelled()?;`
    pub fn raise_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancellation_requested() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Forwards a cancellation request from `self` to `other`.
    /// Returns true if `self` was cancelled.
    pub fn propagate_to(&self, other: &CancellationToken) -> bool {
        if self.is_cancellation_requested() {
            other.request_cancellation();
            true
        } else {
            false
        }
    }

    /// Identity comparison: true if both handles share the same flag.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn clones_share_the_flag() {
        let a = CancellationToken::new();
        let b = a.clone();
        assert!(!b.is_cancellation_requested());
        a.request_cancellation();
        a.request_cancellation();
        assert!(b.is_cancellation_requested());
        assert_eq!(b.raise_if_cancelled(), Err(Cancelled));
        assert!(a.same_as(&b));
        assert!(!a.same_as(&CancellationToken::new()));
    }

    #[test]
    fn concurrent_requests_are_safe() {
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let t = token.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        t.request_cancellation();
                    }
                    t.is_cancellation_requested()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(token.is_cancellation_requested());
    }

    #[test]
    fn propagation_only_flows_one_way() {
        let parent = CancellationToken::new();
        let child = CancellationToken::new();
        assert!(!parent.propagate_to(&child));
        child.request_cancellation();
        assert!(!parent.is_cancellation_requested());

        let child = CancellationToken::new();
        parent.request_cancellation();
        assert!(parent.propagate_to(&child));
        assert!(child.is_cancellation_requested());
    }
}
