//! CancelScope - worker プール・consumer・handler で共有するキャンセル
//!
//! [`CancellationToken`] の薄いラッパー。任意の deadline と
//! キャンセル理由（最初の理由が優先）も保持します。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

#[derive(Debug)]
struct Shared {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<String>,
    parent: Option<Arc<Shared>>,
}

impl Shared {
    fn cause(&self) -> Option<String> {
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        if let Some(parent) = &self.parent
            && parent.token.is_cancelled()
        {
            return parent.cause();
        }
        None
    }
}

/// Cloneable handle; clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<Shared>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Child scope: cancelled whenever `self` is, but cancelling it leaves
    /// `self` untouched. Inherits the deadline unless `deadline` is earlier.
    pub fn child(&self) -> Self {
        self.child_with_deadline(self.inner.deadline)
    }

    /// Child scope that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        self.child_with_deadline(Some(deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn child_with_deadline(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Shared {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancel with `cause`. Only the first cause is kept.
    pub fn cancel(&self, cause: impl Into<String>) {
        let _ = self.inner.cause.set(cause.into());
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled() || self.deadline_passed()
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the scope ended; `None` while it is still live.
    pub fn cause(&self) -> Option<String> {
        if let Some(cause) = self.inner.cause() {
            return Some(cause);
        }
        if self.deadline_passed() {
            return Some(DEADLINE_EXCEEDED.to_string());
        }
        None
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}
