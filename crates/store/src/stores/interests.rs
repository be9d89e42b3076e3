//! Interest records with sent/received fan-out sets.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};

use crate::encoding::{Fields, HashRecord, Patch};
use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::kv::{Kv, WriteOp};
use crate::models::{Interest, InterestStatus};

/// Store for interest operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InterestStore: Send + Sync {
    /// Record that `from_user_id` is interested in `to_user_id` (status pending).
    async fn create(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        message: Option<String>,
    ) -> Result<Interest>;

    async fn get(&self, id: &str) -> Result<Option<Interest>>;

    /// Change status; returns the updated interest.
    async fn update_status(&self, id: &str, status: InterestStatus) -> Result<Interest>;

    /// Interests sent by a user, newest first.
    async fn list_sent(&self, user_id: &str) -> Result<Vec<Interest>>;

    /// Interests received by a user, newest first.
    async fn list_received(&self, user_id: &str) -> Result<Vec<Interest>>;

    /// Most recent interest from one user to another, if any.
    async fn find_between(
        &self,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<Option<Interest>>;

    /// Delete an interest and all three index entries (returns true if it existed).
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Kv implementation of InterestStore.
#[derive(Clone)]
pub struct KvInterestStore {
    kv: Arc<dyn Kv>,
}

impl KvInterestStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    async fn resolve(&self, index_key: &str) -> Result<Vec<Interest>> {
        let mut interests = Vec::new();
        for id in self.kv.smembers(index_key).await? {
            match self.get(&id).await {
                Ok(Some(interest)) => interests.push(interest),
                Ok(None) => {
                    tracing::warn!(index = index_key, interest_id = %id, "index entry without interest record");
                }
                Err(StoreError::Backend(err)) => return Err(StoreError::Backend(err)),
                Err(err) => {
                    tracing::warn!(interest_id = %id, error = %err, "skipping undecodable interest");
                }
            }
        }
        interests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(interests)
    }
}

#[async_trait]
impl InterestStore for KvInterestStore {
    async fn create(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        message: Option<String>,
    ) -> Result<Interest> {
        let from = keys::normalize_id(EntityKind::User, from_user_id)?;
        let to = keys::normalize_id(EntityKind::User, to_user_id)?;
        if from == to {
            return Err(StoreError::validation("cannot express interest in yourself"));
        }

        if let Some(existing) = self.find_between(&from, &to).await?
            && existing.status != InterestStatus::Declined
        {
            return Err(StoreError::Conflict(format!(
                "interest {} already {}",
                existing.id, existing.status
            )));
        }

        let now = Utc::now().trunc_subsecs(3);
        let interest = Interest {
            id: keys::generate_id(now),
            from_user_id: from.clone(),
            to_user_id: to.clone(),
            status: InterestStatus::Pending,
            message: message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
            created_at: now,
            updated_at: now,
        };

        self.kv
            .batch(vec![
                WriteOp::HSet {
                    key: keys::record_key(EntityKind::Interest, &interest.id)?,
                    fields: interest.encode().into_iter().collect(),
                },
                WriteOp::SAdd {
                    key: EntityKind::Interest.membership_key().to_string(),
                    member: interest.id.clone(),
                },
                WriteOp::SAdd {
                    key: keys::sent_interests_key(&from),
                    member: interest.id.clone(),
                },
                WriteOp::SAdd {
                    key: keys::received_interests_key(&to),
                    member: interest.id.clone(),
                },
            ])
            .await?;

        tracing::info!(interest_id = %interest.id, from = %from, to = %to, "interest created");
        Ok(interest)
    }

    async fn get(&self, id: &str) -> Result<Option<Interest>> {
        let id = keys::normalize_id(EntityKind::Interest, id)?;
        let key = keys::record_key(EntityKind::Interest, &id)?;
        let raw = self.kv.hgetall(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Interest::decode(&id, &Fields::new(&key, &raw)).map(Some)
    }

    async fn update_status(&self, id: &str, status: InterestStatus) -> Result<Interest> {
        let mut interest = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("interest:{}", id)))?;

        let now = Utc::now().trunc_subsecs(3);
        let key = keys::record_key(EntityKind::Interest, &interest.id)?;
        let patch = Patch::new()
            .set("status", status.as_str())
            .set("updatedAt", &now);
        self.kv.batch(patch.into_ops(&key)).await?;

        tracing::info!(interest_id = %interest.id, status = %status, "interest status updated");
        interest.status = status;
        interest.updated_at = now;
        Ok(interest)
    }

    async fn list_sent(&self, user_id: &str) -> Result<Vec<Interest>> {
        let user_id = keys::normalize_id(EntityKind::User, user_id)?;
        self.resolve(&keys::sent_interests_key(&user_id)).await
    }

    async fn list_received(&self, user_id: &str) -> Result<Vec<Interest>> {
        let user_id = keys::normalize_id(EntityKind::User, user_id)?;
        self.resolve(&keys::received_interests_key(&user_id)).await
    }

    async fn find_between(
        &self,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<Option<Interest>> {
        let to = keys::normalize_id(EntityKind::User, to_user_id)?;
        Ok(self
            .list_sent(from_user_id)
            .await?
            .into_iter()
            .find(|interest| interest.to_user_id == to))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(interest) = self.get(id).await? else {
            return Ok(false);
        };

        self.kv
            .batch(vec![
                WriteOp::Del {
                    key: keys::record_key(EntityKind::Interest, &interest.id)?,
                },
                WriteOp::SRem {
                    key: EntityKind::Interest.membership_key().to_string(),
                    member: interest.id.clone(),
                },
                WriteOp::SRem {
                    key: keys::sent_interests_key(&interest.from_user_id),
                    member: interest.id.clone(),
                },
                WriteOp::SRem {
                    key: keys::received_interests_key(&interest.to_user_id),
                    member: interest.id.clone(),
                },
            ])
            .await?;

        tracing::info!(interest_id = %interest.id, "interest deleted");
        Ok(true)
    }
}
