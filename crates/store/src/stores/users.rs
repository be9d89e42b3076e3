//! User records, the `users` membership set and the email lookup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};

use crate::encoding::{Fields, HashRecord, Patch};
use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::kv::{Kv, WriteOp};
use crate::models::User;

/// Store for user operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create a user. Generates an id when `user.id` is empty.
    async fn create(&self, user: User) -> Result<User>;

    /// Get a user by id (prefixed or bare).
    async fn get(&self, id: &str) -> Result<Option<User>>;

    /// Merge-write the given fields onto an existing user.
    async fn update(&self, id: &str, patch: Patch) -> Result<()>;

    /// Delete a user record and its index entries (returns true if it existed).
    /// Interests and notifications referencing the user are left in place.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Find a user by email, case-insensitively.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// All ids in the membership set.
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Every decodable user in the membership set.
    async fn list_all(&self) -> Result<Vec<User>>;

    /// Replace the photo gallery (both mirrored fields).
    async fn set_photos(&self, id: &str, photos: Vec<String>) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

/// Kv implementation of UserStore.
#[derive(Clone)]
pub struct KvUserStore {
    kv: Arc<dyn Kv>,
    email_scan: bool,
}

impl KvUserStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self {
            kv,
            email_scan: true,
        }
    }

    /// Trust the `user:email:` lookup alone; skip the membership scan on a miss.
    /// Only safe once every record has a lookup entry (see `Reconciler`).
    pub fn without_email_scan(mut self) -> Self {
        self.email_scan = false;
        self
    }

    async fn load(&self, id: &str) -> Result<Option<User>> {
        let key = keys::record_key(EntityKind::User, id)?;
        let raw = self.kv.hgetall(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let id = keys::normalize_id(EntityKind::User, id)?;
        User::decode(&id, &Fields::new(&key, &raw)).map(Some)
    }

    async fn scan_for_email(&self, email: &str) -> Result<Option<User>> {
        for id in self.kv.smembers(EntityKind::User.membership_key()).await? {
            let user = match self.load(&id).await {
                Ok(Some(user)) => user,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(user_id = %id, error = %err, "skipping unreadable user during email scan");
                    continue;
                }
            };
            if user.email.as_deref().map(keys::normalize_email).as_deref() == Some(email) {
                tracing::info!(user_id = %user.id, "back-filling email lookup from scan");
                self.kv
                    .batch(vec![WriteOp::Set {
                        key: keys::email_lookup_key(email),
                        value: user.id.clone(),
                    }])
                    .await?;
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    /// Reject `email` if another user already owns it.
    async fn ensure_email_free(&self, email: &str, owner: &str) -> Result<()> {
        if let Some(existing) = self.find_by_email(email).await?
            && existing.id != owner
        {
            return Err(StoreError::Conflict(format!(
                "email {} is already registered",
                keys::normalize_email(email)
            )));
        }
        Ok(())
    }
}

fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(StoreError::validation(format!("malformed email `{}`", email)));
    }
    Ok(())
}

#[async_trait]
impl UserStore for KvUserStore {
    async fn create(&self, mut user: User) -> Result<User> {
        let now = Utc::now().trunc_subsecs(3);
        user.id = if user.id.trim().is_empty() {
            keys::generate_id(now)
        } else {
            keys::normalize_id(EntityKind::User, &user.id)?
        };
        if let Some(email) = &user.email {
            validate_email(email)?;
            user.email = Some(email.trim().to_string());
        }

        let key = keys::record_key(EntityKind::User, &user.id)?;
        if self.kv.exists(&key).await? {
            return Err(StoreError::Conflict(format!("user {} already exists", user.id)));
        }
        if let Some(email) = &user.email {
            self.ensure_email_free(email, &user.id).await?;
        }

        user.created_at = user.created_at.or(Some(now));
        user.updated_at = user.updated_at.or(Some(now));

        let mut ops = vec![
            WriteOp::HSet {
                key,
                fields: user.encode().into_iter().collect(),
            },
            WriteOp::SAdd {
                key: EntityKind::User.membership_key().to_string(),
                member: user.id.clone(),
            },
        ];
        if let Some(email) = &user.email {
            ops.push(WriteOp::Set {
                key: keys::email_lookup_key(email),
                value: user.id.clone(),
            });
        }
        self.kv.batch(ops).await?;

        tracing::info!(user_id = %user.id, "user created");
        Ok(user)
    }

    async fn get(&self, id: &str) -> Result<Option<User>> {
        self.load(id).await
    }

    async fn update(&self, id: &str, patch: Patch) -> Result<()> {
        if patch.is_empty() {
            return Err(StoreError::validation("update requires at least one field"));
        }
        if patch.get("id").is_some() || patch.removes("id") {
            return Err(StoreError::validation("user id cannot be changed"));
        }

        let id = keys::normalize_id(EntityKind::User, id)?;
        let key = keys::record_key(EntityKind::User, &id)?;
        if !self.kv.exists(&key).await? {
            return Err(StoreError::NotFound(key));
        }

        let mut ops = Vec::new();
        let email_changes = patch.get("email").is_some() || patch.removes("email");
        if email_changes {
            let previous = self.kv.hget(&key, "email").await?;
            let next = patch.get("email").map(str::to_string);
            if let Some(next) = &next {
                validate_email(next)?;
                self.ensure_email_free(next, &id).await?;
            }
            if let Some(previous) = previous
                && next.as_deref().map(keys::normalize_email) != Some(keys::normalize_email(&previous))
            {
                ops.push(WriteOp::Del {
                    key: keys::email_lookup_key(&previous),
                });
            }
            if let Some(next) = next {
                ops.push(WriteOp::Set {
                    key: keys::email_lookup_key(&next),
                    value: id.clone(),
                });
            }
        }

        let mut writes = patch.into_ops(&key);
        writes.append(&mut ops);
        self.kv.batch(writes).await?;

        tracing::debug!(user_id = %id, "user updated");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = keys::normalize_id(EntityKind::User, id)?;
        let key = keys::record_key(EntityKind::User, &id)?;

        let mut ops = vec![
            WriteOp::Del { key: key.clone() },
            WriteOp::SRem {
                key: EntityKind::User.membership_key().to_string(),
                member: id.clone(),
            },
        ];
        if let Some(email) = self.kv.hget(&key, "email").await? {
            let lookup = keys::email_lookup_key(&email);
            if self.kv.get(&lookup).await?.as_deref() == Some(id.as_str()) {
                ops.push(WriteOp::Del { key: lookup });
            }
        }

        let existed = self.kv.exists(&key).await?;
        self.kv.batch(ops).await?;

        if existed {
            tracing::info!(user_id = %id, "user deleted");
        }
        Ok(existed)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = keys::normalize_email(email);
        if email.is_empty() {
            return Err(StoreError::validation("email is required"));
        }

        if let Some(id) = self.kv.get(&keys::email_lookup_key(&email)).await? {
            match self.load(&id).await? {
                Some(user)
                    if user.email.as_deref().map(keys::normalize_email).as_deref()
                        == Some(email.as_str()) =>
                {
                    return Ok(Some(user));
                }
                _ => tracing::warn!(user_id = %id, "stale email lookup entry"),
            }
        }

        if self.email_scan {
            self.scan_for_email(&email).await
        } else {
            Ok(None)
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.kv.smembers(EntityKind::User.membership_key()).await?)
    }

    async fn list_all(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for id in self.list_ids().await? {
            match self.load(&id).await {
                Ok(Some(user)) => users.push(user),
                Ok(None) => {
                    tracing::warn!(user_id = %id, "membership entry without user record");
                }
                Err(StoreError::Backend(err)) => return Err(StoreError::Backend(err)),
                Err(err) => {
                    tracing::warn!(user_id = %id, error = %err, "skipping undecodable user");
                }
            }
        }
        Ok(users)
    }

    async fn set_photos(&self, id: &str, photos: Vec<String>) -> Result<()> {
        self.update(id, Patch::new().set("photos", &photos)).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.kv.scard(EntityKind::User.membership_key()).await?)
    }
}
