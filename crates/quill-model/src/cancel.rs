// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-turn cancellation token.
//!
//! One token is created per user turn and threaded into every suspension
//! point: the in-flight HTTP request, each tool invocation, and the agent
//! loop's decision to start the next iteration.  Cancellation is advisory —
//! observers poll [`CancelToken::is_cancelled`] or await
//! [`CancelToken::cancelled`] at their own await points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cheap clonable cancellation handle.
///
/// The first [`cancel`](CancelToken::cancel) wins; later calls are no-ops.
/// Every clone observes the same flag, and all pending
/// [`cancelled`](CancelToken::cancelled) waiters are woken exactly once.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token.  Idempotent — only the first call transitions the
    /// flag and wakes waiters.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve when the token fires.  Returns immediately if it already has.
    ///
    /// Safe against the notify-before-wait race: the flag is re-checked
    /// after registering the waiter.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// `true` when `other` is a clone of this token (same underlying flag).
    ///
    /// The coordinator uses this to ensure a stale turn's teardown never
    /// stomps on the state of a newer turn.
    pub fn same_token(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_is_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn cancel_sets_flag_for_all_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn double_cancel_is_a_noop() {
        let t = CancelToken::new();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn same_token_distinguishes_clones_from_new_tokens() {
        let a = CancelToken::new();
        let b = a.clone();
        let c = CancelToken::new();
        assert!(a.same_token(&b));
        assert!(!a.same_token(&c));
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_fired() {
        let t = CancelToken::new();
        t.cancel();
        t.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_pending_waiter() {
        let t = CancelToken::new();
        let waiter = t.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        // Give the waiter a chance to register before firing.
        tokio::task::yield_now().await;
        t.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn multiple_waiters_all_wake() {
        let t = CancelToken::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let w = t.clone();
            handles.push(tokio::spawn(async move { w.cancelled().await }));
        }
        tokio::task::yield_now().await;
        t.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
