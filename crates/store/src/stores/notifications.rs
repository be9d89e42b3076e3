//! Notification records and per-user newest-first lists.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};

use crate::encoding::{Fields, HashRecord, Patch};
use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::kv::{Kv, WriteOp};
use crate::models::{Notification, NotificationKind};

/// Input for [`NotificationStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewNotification {
    pub fn new(user_id: impl Into<String>, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Store for notification operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: NewNotification) -> Result<Notification>;

    async fn get(&self, id: &str) -> Result<Option<Notification>>;

    /// A user's notifications, newest first, optionally truncated.
    async fn list_for_user(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<Notification>>;

    async fn mark_read(&self, id: &str) -> Result<()>;

    /// Mark every unread notification read; returns how many changed.
    async fn mark_all_read(&self, user_id: &str) -> Result<usize>;

    async fn unread_count(&self, user_id: &str) -> Result<usize>;

    /// Delete a notification and its list entries (returns true if it existed).
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Kv implementation of NotificationStore.
#[derive(Clone)]
pub struct KvNotificationStore {
    kv: Arc<dyn Kv>,
}

impl KvNotificationStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    async fn all_for_user(&self, user_id: &str) -> Result<Vec<Notification>> {
        let user_id = keys::normalize_id(EntityKind::User, user_id)?;
        let list_key = keys::user_notifications_key(&user_id);

        let mut notifications = Vec::new();
        for id in self.kv.lrange_all(&list_key).await? {
            match self.get(&id).await {
                Ok(Some(notification)) => notifications.push(notification),
                Ok(None) => {
                    tracing::debug!(notification_id = %id, "list entry without notification record");
                }
                Err(StoreError::Backend(err)) => return Err(StoreError::Backend(err)),
                Err(err) => {
                    tracing::warn!(notification_id = %id, error = %err, "skipping undecodable notification");
                }
            }
        }
        // List order is newest-first by insertion; sort anyway so callers never depend on it.
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }
}

#[async_trait]
impl NotificationStore for KvNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let user_id = keys::normalize_id(EntityKind::User, &new.user_id)?;
        if new.message.trim().is_empty() {
            return Err(StoreError::validation("notification message is required"));
        }

        let now = Utc::now().trunc_subsecs(3);
        let notification = Notification {
            id: keys::generate_id(now),
            user_id: user_id.clone(),
            kind: new.kind,
            message: new.message,
            read: false,
            metadata: new.metadata,
            created_at: now,
        };

        self.kv
            .batch(vec![
                WriteOp::HSet {
                    key: keys::record_key(EntityKind::Notification, &notification.id)?,
                    fields: notification.encode().into_iter().collect(),
                },
                WriteOp::SAdd {
                    key: EntityKind::Notification.membership_key().to_string(),
                    member: notification.id.clone(),
                },
                WriteOp::LPush {
                    key: keys::user_notifications_key(&user_id),
                    value: notification.id.clone(),
                },
            ])
            .await?;

        tracing::debug!(
            notification_id = %notification.id,
            user_id = %user_id,
            kind = notification.kind.as_str(),
            "notification created"
        );
        Ok(notification)
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let id = keys::normalize_id(EntityKind::Notification, id)?;
        let key = keys::record_key(EntityKind::Notification, &id)?;
        let raw = self.kv.hgetall(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Notification::decode(&id, &Fields::new(&key, &raw)).map(Some)
    }

    async fn list_for_user(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<Notification>> {
        let mut notifications = self.all_for_user(user_id).await?;
        if let Some(limit) = limit {
            notifications.truncate(limit);
        }
        Ok(notifications)
    }

    async fn mark_read(&self, id: &str) -> Result<()> {
        let key = keys::record_key(EntityKind::Notification, id)?;
        if !self.kv.exists(&key).await? {
            return Err(StoreError::NotFound(key));
        }
        self.kv
            .batch(Patch::new().set("read", &true).into_ops(&key))
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize> {
        let mut ops = Vec::new();
        let mut changed = 0;
        for notification in self.all_for_user(user_id).await? {
            if !notification.read {
                let key = keys::record_key(EntityKind::Notification, &notification.id)?;
                ops.extend(Patch::new().set("read", &true).into_ops(&key));
                changed += 1;
            }
        }
        if !ops.is_empty() {
            self.kv.batch(ops).await?;
        }
        Ok(changed)
    }

    async fn unread_count(&self, user_id: &str) -> Result<usize> {
        Ok(self
            .all_for_user(user_id)
            .await?
            .iter()
            .filter(|n| !n.read)
            .count())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(notification) = self.get(id).await? else {
            return Ok(false);
        };

        self.kv
            .batch(vec![
                WriteOp::Del {
                    key: keys::record_key(EntityKind::Notification, &notification.id)?,
                },
                WriteOp::SRem {
                    key: EntityKind::Notification.membership_key().to_string(),
                    member: notification.id.clone(),
                },
                WriteOp::LRem {
                    key: keys::user_notifications_key(&notification.user_id),
                    value: notification.id.clone(),
                },
            ])
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::Duration;

    fn store() -> (Arc<MemoryKv>, KvNotificationStore) {
        let kv = Arc::new(MemoryKv::new());
        (kv.clone(), KvNotificationStore::new(kv))
    }

    #[tokio::test]
    async fn create_pushes_to_head_of_user_list() {
        let (kv, store) = store();
        let first = store
            .create(NewNotification::new("u1", NotificationKind::System, "first"))
            .await
            .unwrap();
        let second = store
            .create(NewNotification::new("u1", NotificationKind::System, "second"))
            .await
            .unwrap();

        assert_eq!(
            kv.lrange_all("notifications:u1").await.unwrap(),
            vec![second.id.clone(), first.id.clone()]
        );
    }

    #[tokio::test]
    async fn list_sorts_by_created_at_regardless_of_list_order() {
        let (kv, store) = store();
        let older = Notification {
            id: "old".into(),
            user_id: "u1".into(),
            kind: NotificationKind::System,
            message: "older".into(),
            read: false,
            metadata: serde_json::Value::Null,
            created_at: Utc::now() - Duration::days(1),
        };
        let newer = Notification {
            id: "new".into(),
            message: "newer".into(),
            created_at: Utc::now(),
            ..older.clone()
        };
        // Push the older one last so it sits at the head of the list.
        for n in [&newer, &older] {
            kv.batch(vec![
                WriteOp::HSet {
                    key: format!("notification:{}", n.id),
                    fields: n.encode().into_iter().collect(),
                },
                WriteOp::LPush {
                    key: "notifications:u1".into(),
                    value: n.id.clone(),
                },
            ])
            .await
            .unwrap();
        }

        let listed = store.list_for_user("u1", None).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let limited = store.list_for_user("u1", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "new");
    }

    #[tokio::test]
    async fn mark_read_flips_flag() {
        let (_, store) = store();
        let n = store
            .create(
                NewNotification::new("u1", NotificationKind::InterestReceived, "hi")
                    .with_metadata(serde_json::json!({ "interestId": "i1" })),
            )
            .await
            .unwrap();
        assert_eq!(store.unread_count("u1").await.unwrap(), 1);

        store.mark_read(&n.id).await.unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert!(fetched.read);
        assert_eq!(fetched.metadata["interestId"], "i1");
        assert_eq!(store.unread_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_missing_is_not_found() {
        let (_, store) = store();
        let err = store.mark_read("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn mark_all_read_counts_changes() {
        let (_, store) = store();
        for msg in ["a", "b", "c"] {
            store
                .create(NewNotification::new("u1", NotificationKind::System, msg))
                .await
                .unwrap();
        }
        let first = store.list_for_user("u1", Some(1)).await.unwrap();
        store.mark_read(&first[0].id).await.unwrap();

        assert_eq!(store.mark_all_read("u1").await.unwrap(), 2);
        assert_eq!(store.mark_all_read("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_rejects_blank_message() {
        let (_, store) = store();
        let err = store
            .create(NewNotification::new("u1", NotificationKind::System, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_list_entry() {
        let (kv, store) = store();
        let n = store
            .create(NewNotification::new("u1", NotificationKind::System, "x"))
            .await
            .unwrap();

        assert!(store.delete(&n.id).await.unwrap());
        assert!(kv.lrange_all("notifications:u1").await.unwrap().is_empty());
        assert!(store.list_for_user("u1", None).await.unwrap().is_empty());
    }
}
