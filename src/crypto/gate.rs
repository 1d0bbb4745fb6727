//! One-shot authentication gate.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::core::{RelayError, Result};

/// Authentication state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing decided yet.
    Pending,
    /// Authenticated as this client id.
    Accepted(Uuid),
    /// Bad token or unknown client id.
    Failed,
    /// No authentication arrived in time.
    TimedOut,
    /// Connection closed before authentication finished.
    Closed,
}

/// Resolved at most once; any number of tasks may wait on it.
#[derive(Debug, Clone)]
pub struct AuthGate {
    state: Arc<watch::Sender<AuthState>>,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthGate {
    /// Create a pending gate.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthState::Pending);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Resolve the gate. Returns `false` if it was already resolved.
    pub fn resolve(&self, outcome: AuthState) -> bool {
        if outcome == AuthState::Pending {
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == AuthState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Whether the gate has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.state() != AuthState::Pending
    }

    /// Wait until resolved. Yields the client id on success.
    pub async fn wait(&self) -> Result<Uuid> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != AuthState::Pending)
            .await
            .map_err(|_| RelayError::ClientClosed)?;
        match state {
            AuthState::Accepted(id) => Ok(id),
            AuthState::Failed => Err(RelayError::AuthenticationFailed),
            AuthState::TimedOut => Err(RelayError::AuthenticationTimeout),
            AuthState::Pending | AuthState::Closed => Err(RelayError::ClientClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_many_waiters_released() {
        let gate = AuthGate::new();
        let id = Uuid::new_v4();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        assert!(gate.resolve(AuthState::Accepted(id)));

        for w in waiters {
            assert_eq!(w.await.unwrap().unwrap(), id);
        }
    }

    #[test]
    fn test_resolves_once() {
        let gate = AuthGate::new();
        assert!(!gate.is_resolved());
        assert!(gate.resolve(AuthState::Failed));
        assert!(!gate.resolve(AuthState::Accepted(Uuid::nil())));
        assert!(!gate.resolve(AuthState::TimedOut));
        assert_eq!(gate.state(), AuthState::Failed);
    }

    #[test]
    fn test_pending_is_not_a_resolution() {
        let gate = AuthGate::new();
        assert!(!gate.resolve(AuthState::Pending));
        assert!(!gate.is_resolved());
    }

    #[tokio::test]
    async fn test_wait_after_failure() {
        let gate = AuthGate::new();
        gate.resolve(AuthState::TimedOut);
        assert!(matches!(
            gate.wait().await,
            Err(RelayError::AuthenticationTimeout)
        ));

        let gate = AuthGate::new();
        gate.resolve(AuthState::Closed);
        assert!(matches!(gate.wait().await, Err(RelayError::ClientClosed)));
    }
}
