//! A small graceful-shutdown token shared by the syncer, the HTTP API and
//! the PG broker's accept loop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

/// Handle used to request shutdown. Cloning shares the same underlying
/// signal; the first `trigger()` wins, subsequent calls are no-ops.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new, untriggered shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the shutdown signal. Safe to call more than once.
    pub fn trigger(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested");
        }
        self.inner.notify.notify_waiters();
    }

    /// True once `trigger()` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolve once `trigger()` has been called, including if it already
    /// happened before this call.
    pub async fn wait(&self) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn a task that calls `trigger()` on SIGINT or SIGTERM.
    pub fn on_signal(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("failed to install SIGINT handler");
            tokio::select! {
                _ = term.recv() => tracing::info!("SIGTERM received"),
                _ = int.recv() => tracing::info!("SIGINT received"),
            }
            shutdown.trigger();
        });
    }
}

/// Wait for `fut` to complete, or a `grace` deadline to elapse, whichever
/// is first. Used to bound in-flight work (syncer ticks, broker sessions)
/// during shutdown without an unbounded drain.
pub async fn with_grace_period<F>(fut: F, grace: std::time::Duration) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::time::timeout(grace, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_already_fired() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_millis(50), shutdown.wait())
            .await
            .expect("wait() should not block once already fired");
    }
}
