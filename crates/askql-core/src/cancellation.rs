use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct InFlight {
    run_id: String,
    token: CancellationToken,
}

/// Abort handles of the runs currently in flight, keyed by session id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    runs: Arc<RwLock<HashMap<String, InFlight>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: &str, run_id: &str, token: CancellationToken) {
        self.runs.write().await.insert(
            session_id.to_string(),
            InFlight {
                run_id: run_id.to_string(),
                token,
            },
        );
    }

    pub async fn create(&self, session_id: &str, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.register(session_id, run_id, token.clone()).await;
        token
    }

    /// Returns whether a run was there to cancel.
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.runs.read().await.get(session_id) {
            Some(run) => {
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the entry only while `run_id` still owns the session.
    pub async fn remove(&self, session_id: &str, run_id: &str) {
        let mut runs = self.runs.write().await;
        if runs.get(session_id).is_some_and(|run| run.run_id == run_id) {
            runs.remove(session_id);
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.runs.read().await.contains_key(session_id)
    }

    pub async fn run_id(&self, session_id: &str) -> Option<String> {
        self.runs
            .read()
            .await
            .get(session_id)
            .map(|run| run.run_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_the_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("s1", "r1").await;
        assert_eq!(registry.run_id("s1").await.as_deref(), Some("r1"));
        assert!(registry.cancel("s1").await);
        assert!(token.is_cancelled());
        registry.remove("s1", "r1").await;
        assert!(!registry.is_active("s1").await);
        assert!(!registry.cancel("s1").await);
    }

    #[tokio::test]
    async fn a_finished_run_leaves_its_successor_registered() {
        let registry = CancellationRegistry::new();
        registry.create("s1", "r1").await;
        registry.create("s1", "r2").await;
        registry.remove("s1", "r1").await;
        assert_eq!(registry.run_id("s1").await.as_deref(), Some("r2"));
    }
}
