use super::{LockError, LockHandle, LockNode, LockService};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Fixed clock drift allowance added on top of the proportional one
const DRIFT_BASE: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub struct RedlockSettings {
    /// Attempts after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Share of the TTL reserved for clock drift between nodes
    pub drift_factor: f64,
}

impl Default for RedlockSettings {
    fn default() -> Self {
        Self {
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            drift_factor: 0.01,
        }
    }
}

/// Quorum lock over independent nodes
///
/// A lock only counts when a majority of nodes accepted it and time is left
/// in the validity window (`ttl - elapsed - drift`). Failed attempts are
/// rolled back on every node before retrying.
pub struct Redlock {
    nodes: Vec<Arc<dyn LockNode>>,
    settings: RedlockSettings,
}

impl Redlock {
    pub fn new(nodes: Vec<Arc<dyn LockNode>>, settings: RedlockSettings) -> Self {
        Self { nodes, settings }
    }

    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    fn drift(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.settings.drift_factor) + DRIFT_BASE
    }

    async fn lock_all(&self, resource: &str, token: &str, ttl: Duration) -> usize {
        let mut locked = 0;
        for node in &self.nodes {
            match node.try_lock(resource, token, ttl).await {
                Ok(true) => locked += 1,
                Ok(false) => {}
                Err(e) => debug!("Lock node failed on {}: {}", resource, e),
            }
        }
        locked
    }

    async fn unlock_all(&self, resource: &str, token: &str) -> usize {
        let mut unlocked = 0;
        for node in &self.nodes {
            match node.unlock(resource, token).await {
                Ok(true) => unlocked += 1,
                Ok(false) => {}
                Err(e) => debug!("Unlock failed on {}: {}", resource, e),
            }
        }
        unlocked
    }
}

#[async_trait]
impl LockService for Redlock {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        if self.nodes.is_empty() {
            return Err(LockError::Node("no lock nodes configured".to_string()));
        }

        let token = Uuid::new_v4().to_string();
        let quorum = self.quorum();

        for attempt in 0..=self.settings.retry_count {
            let start = Instant::now();
            let locked = self.lock_all(resource, &token, ttl).await;
            let spent = start.elapsed() + self.drift(ttl);

            if locked >= quorum {
                if let Some(validity) = ttl.checked_sub(spent).filter(|v| !v.is_zero()) {
                    trace!("Acquired {} on {}/{} nodes", resource, locked, self.nodes.len());
                    return Ok(LockHandle::new(resource, token, start + validity));
                }
            }

            self.unlock_all(resource, &token).await;
            if attempt < self.settings.retry_count {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        Err(LockError::Contended(resource.to_string()))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let unlocked = self.unlock_all(handle.resource(), handle.token()).await;
        if unlocked >= self.quorum() {
            Ok(())
        } else {
            warn!(
                "Released {} on only {}/{} nodes",
                handle.resource(),
                unlocked,
                self.nodes.len()
            );
            Err(LockError::AlreadyExpired(handle.resource().to_string()))
        }
    }

    async fn quit(&self) {
        for node in &self.nodes {
            node.quit().await;
        }
    }
}
