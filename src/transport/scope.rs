//! Per-connection task scope.
//!
//! Every task spawned for a physical connection runs inside its scope:
//! cancelling the scope ends all of them, and short-lived handler tasks are
//! bounded by a semaphore.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Cancellation and concurrency bound shared by one connection's tasks.
#[derive(Debug, Clone)]
pub struct TaskScope {
    token: CancellationToken,
    permits: Arc<Semaphore>,
    max_tasks: usize,
}

impl TaskScope {
    /// Create a scope allowing `max_tasks` concurrent handler tasks.
    pub fn new(max_tasks: usize) -> Self {
        let max_tasks = max_tasks.max(1);
        Self {
            token: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
        }
    }

    /// A nested scope cancelled together with this one, with its own bound.
    pub fn child(&self, max_tasks: usize) -> Self {
        let max_tasks = max_tasks.max(1);
        Self {
            token: self.token.child_token(),
            permits: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
        }
    }

    /// The scope's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel every task in the scope.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Spawn a long-running task, such as an accept loop.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
        })
    }

    /// Spawn a short-lived handler task once a permit is free.
    ///
    /// Returns `None` if the scope is cancelled while waiting.
    pub async fn spawn_bounded<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
        };
        let token = self.token.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
        }))
    }

    /// A pollable view of the scope's cancellation, for I/O objects.
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal::new(&self.token)
    }

    /// Handler tasks currently running.
    pub fn running(&self) -> usize {
        self.max_tasks - self.permits.available_permits()
    }
}

/// Cancellation observable from `poll_*` methods.
pub struct CloseSignal {
    token: CancellationToken,
    fut: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseSignal")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl CloseSignal {
    /// Watch `token`.
    pub fn new(token: &CancellationToken) -> Self {
        Self {
            token: token.clone(),
            fut: Box::pin(token.clone().cancelled_owned()),
        }
    }

    /// Whether the token is cancelled. Registers `cx` for wakeup otherwise.
    pub fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.fut.as_mut().poll(cx).is_ready()
    }

    /// Whether the token is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_stops_tasks() {
        let scope = TaskScope::new(4);
        let handle = scope.spawn(std::future::pending());
        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bounded_tasks_wait_for_permit() {
        let scope = TaskScope::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = scope
            .spawn_bounded(async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        assert_eq!(scope.running(), 1);

        let second = scope.spawn_bounded(async {});
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut second)
                .await
                .is_err()
        );

        tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap().await.unwrap();
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = TaskScope::new(4);
        let child = parent.child(2);
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child(2);
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_bounded_after_cancel() {
        let scope = TaskScope::new(1);
        scope.cancel();
        assert!(scope.spawn_bounded(async {}).await.is_none());
    }
}
