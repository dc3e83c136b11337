use crate::config::{Config, LockConfig};
use crate::lock::{LockNode, LockService, MemoryLockNode, RedisLockNode, Redlock};
use crate::pubsub::{MemoryBroker, PubSub, RedisPubSub, TransportError};
use std::sync::Arc;
use tracing::{info, warn};

/// Pub/sub transport and lock service of one instance
pub struct Transports {
    pub pubsub: Arc<dyn PubSub>,
    pub locks: Arc<dyn LockService>,
}

impl Transports {
    /// Connect to the configured endpoints
    ///
    /// Without pub/sub endpoints the instance runs alone on a private
    /// in-process broker. Lock endpoints default to the pub/sub endpoints.
    pub async fn connect(config: &Config) -> Result<Self, TransportError> {
        let pubsub: Arc<dyn PubSub> = match config.pubsub.endpoints.as_slice() {
            [] => {
                info!("No pub/sub endpoints configured, running standalone");
                Arc::new(MemoryBroker::new().client().await)
            }
            [endpoint, rest @ ..] => {
                if !rest.is_empty() {
                    warn!("Only the first pub/sub endpoint is used ({})", endpoint);
                }
                info!("Connecting pub/sub to {}", endpoint);
                Arc::new(RedisPubSub::connect(endpoint.as_str()).await?)
            }
        };

        let lock_endpoints = if config.lock.endpoints.is_empty() {
            &config.pubsub.endpoints
        } else {
            &config.lock.endpoints
        };
        let mut nodes: Vec<Arc<dyn LockNode>> = Vec::with_capacity(lock_endpoints.len());
        for endpoint in lock_endpoints {
            info!("Connecting lock node {}", endpoint);
            nodes.push(Arc::new(RedisLockNode::connect(endpoint.as_str()).await?));
        }
        if nodes.is_empty() {
            nodes.push(Arc::new(MemoryLockNode::new()));
        }

        Ok(Self {
            pubsub,
            locks: Arc::new(Redlock::new(nodes, config.lock.redlock_settings())),
        })
    }

    /// Attach to a broker and lock node shared with other instances in
    /// this process
    pub async fn in_process(broker: &MemoryBroker, node: &MemoryLockNode, lock: &LockConfig) -> Self {
        Self {
            pubsub: Arc::new(broker.client().await),
            locks: Arc::new(Redlock::new(
                vec![Arc::new(node.clone())],
                lock.redlock_settings(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_standalone_without_endpoints() {
        let transports = Transports::connect(&Config::default()).await.unwrap();
        transports.pubsub.psubscribe("a:*").await.unwrap();
        let handle = transports
            .locks
            .acquire("a:lock", Duration::from_millis(100))
            .await
            .unwrap();
        transports.locks.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let mut config = Config::default();
        config.pubsub.endpoints = vec!["127.0.0.1:1".to_string()];
        assert!(Transports::connect(&config).await.is_err());
    }
}
