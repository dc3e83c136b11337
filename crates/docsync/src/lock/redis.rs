use super::{LockError, LockNode};
use crate::resp::{RespClient, RespError, RespValue};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::ToSocketAddrs;

/// Deletes the key only while it still holds our token
const UNLOCK_SCRIPT: &str =
    "if redis.call('get',KEYS[1]) == ARGV[1] then return redis.call('del',KEYS[1]) else return 0 end";

/// Lock node backed by one Redis server
pub struct RedisLockNode {
    client: RespClient,
}

impl RedisLockNode {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, RespError> {
        Ok(Self {
            client: RespClient::connect(addr).await?,
        })
    }
}

fn node_error(e: RespError) -> LockError {
    LockError::Node(e.to_string())
}

#[async_trait]
impl LockNode for RedisLockNode {
    async fn try_lock(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let reply = self
            .client
            .command([
                "SET".to_string(),
                resource.to_string(),
                token.to_string(),
                "NX".to_string(),
                "PX".to_string(),
                ttl.as_millis().max(1).to_string(),
            ])
            .await
            .map_err(node_error)?;
        // NX miss answers with a null bulk string
        Ok(reply != RespValue::Null)
    }

    async fn unlock(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let reply = self
            .client
            .command([
                "EVAL".to_string(),
                UNLOCK_SCRIPT.to_string(),
                "1".to_string(),
                resource.to_string(),
                token.to_string(),
            ])
            .await
            .map_err(node_error)?;
        Ok(reply == RespValue::Integer(1))
    }

    async fn quit(&self) {
        self.client.quit().await;
    }
}
