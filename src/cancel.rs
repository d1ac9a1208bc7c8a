//! Cooperative cancellation.
//!
//! A [`CancelToken`] is cloned into every long-running operation —
//! indexing passes, handler work, embedder calls. Operations poll
//! [`CancelToken::check`] at loop boundaries and between I/O steps, so
//! cancellation takes effect within bounded time without forcibly
//! killing tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Canceled)` once [`cancel`](CancelToken::cancel) has been
    /// called.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::canceled("operation canceled"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_canceled());
        assert_eq!(
            clone.check().unwrap_err().kind(),
            crate::error::ErrorKind::Canceled
        );
    }
}
