//! Distributed, time-bounded locks
//!
//! A [`LockService`] hands out exclusive claims on named resources. The
//! provided implementation is [`Redlock`], a quorum client over one or more
//! [`LockNode`]s.

mod memory;
mod redis;
mod redlock;

pub use memory::MemoryLockNode;
pub use redis::RedisLockNode;
pub use redlock::{Redlock, RedlockSettings};

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the resource; not a failure of the service
    #[error("Lock on {0} is held elsewhere")]
    Contended(String),
    #[error("Lock on {0} had already expired")]
    AlreadyExpired(String),
    #[error("Lock node error: {0}")]
    Node(String),
}

/// An acquired claim on a resource, valid until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    resource: String,
    token: String,
    expires_at: Instant,
}

impl LockHandle {
    pub fn new(resource: impl Into<String>, token: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            resource: resource.into(),
            token: token.into(),
            expires_at,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to acquire `resource` for `ttl`, giving up after a bounded number
    /// of attempts
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError>;

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;

    async fn quit(&self);
}

/// A single lock server
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Set `resource` to `token` unless it is already held; true on success
    async fn try_lock(&self, resource: &str, token: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Delete `resource` only if it still holds `token`
    async fn unlock(&self, resource: &str, token: &str) -> Result<bool, LockError>;

    async fn quit(&self);
}
