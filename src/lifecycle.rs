//! Per-session cancellation scope.
//!
//! One controller is created per intercepted session, optionally derived
//! from a caller-supplied token and/or a deadline. Closing either leg of
//! the session cancels the scope; every blocking operation in the relay
//! selects against it so cancellation always wins within a bounded time.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A single cancellation scope shared by both facades and the relay.
///
/// `cancel` is idempotent and safe to call concurrently from multiple
/// error paths; `cancelled` can be awaited any number of times.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    token: CancellationToken,
}

impl LifecycleController {
    /// Create a root scope.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Create a scope that is cancelled whenever `parent` is.
    pub fn derived_from(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// Cancel this scope after `deadline`, unless cancelled earlier.
    pub fn with_deadline(self, deadline: Duration) -> Self {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => token.cancel(),
            }
        });
        self
    }

    /// Signal teardown to everything sharing this scope.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A child scope for one channel pair: cancelled with the session,
    /// but cancelling it does not take the session down.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The raw token, for components that select directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scope = LifecycleController::new();
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
        timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .expect("cancelled() must resolve after cancel()");
    }

    #[tokio::test]
    async fn child_observes_parent_cancellation() {
        let scope = LifecycleController::new();
        let child = scope.child();
        scope.cancel();
        timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child token must see parent cancellation");
    }

    #[tokio::test]
    async fn child_cancellation_does_not_cancel_parent() {
        let scope = LifecycleController::new();
        let child = scope.child();
        child.cancel();
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_fires_cancellation() {
        let scope = LifecycleController::new().with_deadline(Duration::from_millis(20));
        timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .expect("deadline must cancel the scope");
    }

    #[tokio::test]
    async fn derived_scope_follows_caller_token() {
        let parent = CancellationToken::new();
        let scope = LifecycleController::derived_from(&parent);
        parent.cancel();
        timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .expect("derived scope must follow the parent token");
    }
}
