use super::{LockError, LockNode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// In-process lock node, cloned handles share the same table
#[derive(Clone, Default)]
pub struct MemoryLockNode {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLockNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, to simulate a lost node
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current live holder token of `resource`
    pub async fn holder(&self, resource: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(resource)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(token, _)| token.clone())
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Node("memory lock node unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockNode for MemoryLockNode {
    async fn try_lock(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(resource) {
            Some((_, expiry)) if *expiry > now => Ok(false),
            _ => {
                entries.insert(resource.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(resource) {
            Some((holder, expiry)) if holder == token && *expiry > now => {
                entries.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn quit(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlocked() {
        let node = MemoryLockNode::new();
        let ttl = Duration::from_secs(5);
        assert!(node.try_lock("k", "a", ttl).await.unwrap());
        assert!(!node.try_lock("k", "b", ttl).await.unwrap());

        assert!(!node.unlock("k", "b").await.unwrap());
        assert_eq!(node.holder("k").await.as_deref(), Some("a"));
        assert!(node.unlock("k", "a").await.unwrap());
        assert!(node.try_lock("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_taken_over() {
        let node = MemoryLockNode::new();
        assert!(node.try_lock("k", "a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(node.holder("k").await.is_none());
        assert!(node.try_lock("k", "b", Duration::from_secs(1)).await.unwrap());
        assert!(!node.unlock("k", "a").await.unwrap());
    }
}
