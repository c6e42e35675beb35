//! Operator cancellation.
//!
//! Blocking work (remote commands, prompts) cannot be preempted, so the token
//! is polled at step and retry boundaries. Async waiters can also `await`
//! [`CancelToken::cancelled`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

use crate::error::DeployError;

/// Escalation level of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None = 0,
    /// Stop scheduling new steps, let in-flight steps finish, then roll back.
    Graceful = 1,
    /// Tear down immediately without waiting for in-flight steps.
    Forced = 2,
}

impl CancelLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Graceful,
            _ => Self::Forced,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    level: AtomicU8,
    notify: Notify,
}

/// Shared, cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Escalate one level (first call graceful, second forced) and return the new level.
    pub fn escalate(&self) -> CancelLevel {
        let prev = self
            .inner
            .level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v + 1).min(2)))
            .unwrap_or(2);
        self.inner.notify.notify_waiters();
        CancelLevel::from_u8((prev + 1).min(2))
    }

    /// Raise the level to at least `level`. Never lowers it.
    pub fn request(&self, level: CancelLevel) {
        self.inner.level.fetch_max(level as u8, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn level(&self) -> CancelLevel {
        CancelLevel::from_u8(self.inner.level.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.level() != CancelLevel::None
    }

    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.level() == CancelLevel::Forced
    }

    /// Boundary check: `Err(Interrupted)` once cancellation was requested.
    pub fn check(&self) -> Result<(), DeployError> {
        if self.is_cancelled() {
            Err(DeployError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolve once the level reaches at least `level`.
    pub async fn reached(&self, level: CancelLevel) {
        loop {
            let notified = self.inner.notify.notified();
            if self.level() >= level {
                return;
            }
            notified.await;
        }
    }

    pub async fn cancelled(&self) {
        self.reached(CancelLevel::Graceful).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn escalation_saturates_at_forced() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        assert_eq!(token.escalate(), CancelLevel::Graceful);
        assert!(matches!(token.check(), Err(DeployError::Interrupted)));
        assert_eq!(token.escalate(), CancelLevel::Forced);
        assert_eq!(token.escalate(), CancelLevel::Forced);
        assert!(token.is_forced());
    }

    #[test]
    fn request_never_lowers() {
        let token = CancelToken::new();
        token.request(CancelLevel::Forced);
        token.request(CancelLevel::Graceful);
        assert_eq!(token.level(), CancelLevel::Forced);
    }

    #[tokio::test]
    async fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.escalate();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
