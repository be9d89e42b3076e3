//! Per-user shortlist sets. Set membership is the only state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::kv::{Kv, WriteOp};

/// Store for shortlist operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShortlistStore: Send + Sync {
    async fn add(&self, user_id: &str, target_id: &str) -> Result<()>;

    async fn remove(&self, user_id: &str, target_id: &str) -> Result<()>;

    async fn is_shortlisted(&self, user_id: &str, target_id: &str) -> Result<bool>;

    /// Target ids shortlisted by a user.
    async fn list(&self, user_id: &str) -> Result<Vec<String>>;

    async fn count(&self, user_id: &str) -> Result<u64>;
}

/// Kv implementation of ShortlistStore.
#[derive(Clone)]
pub struct KvShortlistStore {
    kv: Arc<dyn Kv>,
}

impl KvShortlistStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }
}

/// Normalized (user, target) pair.
fn edge(user_id: &str, target_id: &str) -> Result<(String, String)> {
    Ok((
        keys::normalize_id(EntityKind::User, user_id)?,
        keys::normalize_id(EntityKind::User, target_id)?,
    ))
}

#[async_trait]
impl ShortlistStore for KvShortlistStore {
    async fn add(&self, user_id: &str, target_id: &str) -> Result<()> {
        let (user, target) = edge(user_id, target_id)?;
        if user == target {
            return Err(StoreError::validation("cannot shortlist yourself"));
        }
        self.kv
            .batch(vec![WriteOp::SAdd {
                key: keys::shortlist_key(&user),
                member: target,
            }])
            .await?;
        Ok(())
    }

    async fn remove(&self, user_id: &str, target_id: &str) -> Result<()> {
        let (user, target) = edge(user_id, target_id)?;
        self.kv
            .batch(vec![WriteOp::SRem {
                key: keys::shortlist_key(&user),
                member: target,
            }])
            .await?;
        Ok(())
    }

    async fn is_shortlisted(&self, user_id: &str, target_id: &str) -> Result<bool> {
        let (user, target) = edge(user_id, target_id)?;
        Ok(self
            .kv
            .sismember(&keys::shortlist_key(&user), &target)
            .await?)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<String>> {
        let user = keys::normalize_id(EntityKind::User, user_id)?;
        Ok(self.kv.smembers(&keys::shortlist_key(&user)).await?)
    }

    async fn count(&self, user_id: &str) -> Result<u64> {
        let user = keys::normalize_id(EntityKind::User, user_id)?;
        Ok(self.kv.scard(&keys::shortlist_key(&user)).await?)
    }
}
