//! Premium expiry batch job.
//!
//! Meant to run on a timer, off the request path. A run is idempotent:
//! expired users are no longer premium on the next pass, and warnings are
//! de-duplicated with short-lived marker keys. Concurrent runs are not
//! locked against each other; the worst case is one duplicate warning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::encoding::{Patch, encode_timestamp};
use crate::error::Result;
use crate::keys;
use crate::kv::Kv;
use crate::models::{NotificationKind, User};
use crate::services::sender::{MessageSender, OutboundMessage};
use crate::stores::{NewNotification, NotificationStore, UserStore};

/// Days-before-expiry at which a warning is sent.
pub const WARNING_THRESHOLDS: [i64; 3] = [7, 3, 1];

/// Lifetime of a warning marker.
pub const WARNING_MARKER_TTL_SECS: u64 = 2 * 24 * 60 * 60;

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// Counts from one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub scanned: usize,
    pub expired: usize,
    pub warned: usize,
    /// Not premium, or premium without an expiry.
    pub skipped: usize,
    pub failed: usize,
}

pub struct PremiumExpiryEngine {
    users: Arc<dyn UserStore>,
    notifications: Arc<dyn NotificationStore>,
    markers: Arc<dyn Kv>,
    sender: Arc<dyn MessageSender>,
}

impl PremiumExpiryEngine {
    pub fn new(
        users: Arc<dyn UserStore>,
        notifications: Arc<dyn NotificationStore>,
        markers: Arc<dyn Kv>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            users,
            notifications,
            markers,
            sender,
        }
    }

    /// Expire lapsed memberships, then warn users nearing expiry.
    ///
    /// Per-user failures are logged and counted; only a failure to list
    /// users aborts the run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let users = self.users.list_all().await?;
        let mut report = ExpiryReport {
            scanned: users.len(),
            ..Default::default()
        };

        let mut active = Vec::new();
        for user in users {
            let Some(expiry) = user.premium_expiry.filter(|_| user.premium) else {
                report.skipped += 1;
                continue;
            };
            if expiry > now {
                active.push((user, expiry));
                continue;
            }
            match self.expire(&user, now).await {
                Ok(()) => report.expired += 1,
                Err(err) => {
                    tracing::error!(user_id = %user.id, error = %err, "failed to expire premium");
                    report.failed += 1;
                }
            }
        }

        for (user, expiry) in active {
            let days = days_remaining(expiry, now);
            if !WARNING_THRESHOLDS.contains(&days) {
                continue;
            }
            match self.warn(&user, days, expiry, now).await {
                Ok(true) => report.warned += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(user_id = %user.id, days, error = %err, "failed to send premium warning");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            expired = report.expired,
            warned = report.warned,
            skipped = report.skipped,
            failed = report.failed,
            "premium expiry run complete"
        );
        Ok(report)
    }

    async fn expire(&self, user: &User, now: DateTime<Utc>) -> Result<()> {
        let patch = Patch::new()
            .set("premium", &false)
            .remove("premiumPlan")
            .set("premiumExpiredAt", &now)
            .set("updatedAt", &now);
        self.users.update(&user.id, patch).await?;
        tracing::info!(user_id = %user.id, plan = ?user.premium_plan, "premium expired");

        let notification = NewNotification::new(
            &user.id,
            NotificationKind::PremiumExpired,
            "Your premium membership has expired",
        )
        .with_metadata(json!({
            "plan": user.premium_plan,
            "expiredAt": encode_timestamp(now),
        }));
        if let Err(err) = self.notifications.create(notification).await {
            tracing::warn!(user_id = %user.id, error = %err, "failed to record premium expiry notification");
        }

        self.deliver(
            user,
            "Your premium membership has expired",
            "Your premium membership has expired. Renew any time to keep your premium features.",
        )
        .await;
        Ok(())
    }

    /// Returns false when this threshold was already warned about.
    async fn warn(
        &self,
        user: &User,
        days: i64,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let marker = keys::premium_warning_key(&user.id, days);
        if !self
            .markers
            .set_nx_ex(&marker, &encode_timestamp(now), WARNING_MARKER_TTL_SECS)
            .await?
        {
            tracing::debug!(user_id = %user.id, days, "premium warning already sent");
            return Ok(false);
        }

        let message = format!(
            "Your premium membership expires in {} {}",
            days,
            if days == 1 { "day" } else { "days" }
        );
        let notification =
            NewNotification::new(&user.id, NotificationKind::PremiumExpiring, message.clone())
                .with_metadata(json!({
                    "daysRemaining": days,
                    "expiresAt": encode_timestamp(expiry),
                }));
        if let Err(err) = self.notifications.create(notification).await {
            // Release the marker so the next run retries this threshold.
            if let Err(del_err) = self.markers.del(&marker).await {
                tracing::warn!(user_id = %user.id, days, error = %del_err, "failed to clear premium warning marker");
            }
            return Err(err);
        }

        self.deliver(user, "Your premium membership is expiring", &message)
            .await;
        tracing::info!(user_id = %user.id, days, "premium expiry warning sent");
        Ok(true)
    }

    async fn deliver(&self, user: &User, subject: &str, body: &str) {
        let Some(email) = user.email.as_deref() else {
            return;
        };
        let message = OutboundMessage::new(email, body).with_subject(subject);
        if let Err(err) = self.sender.send(&message).await {
            tracing::warn!(user_id = %user.id, error = %err, "failed to deliver premium message");
        }
    }
}

/// Whole days until `expiry`, rounded up.
fn days_remaining(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (expiry - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(DAY_MILLIS) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::kv::MemoryKv;
    use crate::services::sender::{LogSender, MockMessageSender};
    use crate::stores::{KvNotificationStore, KvUserStore, MockNotificationStore, MockUserStore};
    use chrono::{Duration, SubsecRound};

    struct Fixture {
        users: Arc<KvUserStore>,
        notifications: Arc<KvNotificationStore>,
        engine: PremiumExpiryEngine,
    }

    fn fixture_with_sender(sender: Arc<dyn MessageSender>) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let users = Arc::new(KvUserStore::new(kv.clone()));
        let notifications = Arc::new(KvNotificationStore::new(kv.clone()));
        let engine =
            PremiumExpiryEngine::new(users.clone(), notifications.clone(), kv, sender);
        Fixture {
            users,
            notifications,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_sender(Arc::new(LogSender))
    }

    fn premium_user(email: &str, expiry: Option<DateTime<Utc>>) -> User {
        User {
            email: Some(email.to_string()),
            premium: true,
            premium_plan: Some("gold".into()),
            premium_expiry: expiry,
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    #[test]
    fn days_remaining_rounds_up() {
        let now = now();
        assert_eq!(days_remaining(now + Duration::hours(1), now), 1);
        assert_eq!(days_remaining(now + Duration::days(3), now), 3);
        assert_eq!(days_remaining(now + Duration::days(3) - Duration::hours(2), now), 3);
        assert_eq!(days_remaining(now + Duration::days(3) + Duration::hours(2), now), 4);
    }

    #[tokio::test]
    async fn expired_user_is_flipped_and_notified() {
        let f = fixture();
        let now = now();
        let user = f
            .users
            .create(premium_user("a@example.com", Some(now - Duration::days(1))))
            .await
            .unwrap();

        let report = f.engine.run(now).await.unwrap();
        assert_eq!(report.expired, 1);

        let stored = f.users.get(&user.id).await.unwrap().unwrap();
        assert!(!stored.premium);
        assert!(stored.premium_plan.is_none());
        assert_eq!(stored.premium_expired_at, Some(now));
        assert_eq!(stored.email.as_deref(), Some("a@example.com"));

        let notifications = f.notifications.list_for_user(&user.id, None).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::PremiumExpired);
        assert_eq!(notifications[0].metadata["plan"], "gold");
    }

    #[tokio::test]
    async fn far_future_expiry_is_untouched() {
        let f = fixture();
        let now = now();
        let user = f
            .users
            .create(premium_user("a@example.com", Some(now + Duration::days(365))))
            .await
            .unwrap();

        let report = f.engine.run(now).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.warned, 0);

        let stored = f.users.get(&user.id).await.unwrap().unwrap();
        assert_eq!(stored, user);
        assert!(f.notifications.list_for_user(&user.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_does_not_expire_twice() {
        let f = fixture();
        let now = now();
        let user = f
            .users
            .create(premium_user("a@example.com", Some(now - Duration::hours(1))))
            .await
            .unwrap();

        f.engine.run(now).await.unwrap();
        let report = f.engine.run(now + Duration::hours(1)).await.unwrap();

        assert_eq!(report.expired, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(f.notifications.unread_count(&user.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn warning_sent_once_per_threshold() {
        let f = fixture();
        let now = now();
        let user = f
            .users
            .create(premium_user(
                "a@example.com",
                Some(now + Duration::days(3) - Duration::hours(1)),
            ))
            .await
            .unwrap();

        let first = f.engine.run(now).await.unwrap();
        let second = f.engine.run(now + Duration::minutes(30)).await.unwrap();

        assert_eq!(first.warned, 1);
        assert_eq!(second.warned, 0);
        let notifications = f.notifications.list_for_user(&user.id, None).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::PremiumExpiring);
        assert_eq!(notifications[0].metadata["daysRemaining"], 3);
        assert!(f.users.get(&user.id).await.unwrap().unwrap().premium);
    }

    #[tokio::test]
    async fn failed_warning_is_retried_on_next_run() {
        let kv = Arc::new(MemoryKv::new());
        let users = Arc::new(KvUserStore::new(kv.clone()));
        let notifications = Arc::new(KvNotificationStore::new(kv.clone()));
        let now = now();
        let user = users
            .create(premium_user(
                "a@example.com",
                Some(now + Duration::days(3) - Duration::hours(1)),
            ))
            .await
            .unwrap();

        let mut failing = MockNotificationStore::new();
        failing
            .expect_create()
            .times(1)
            .returning(|_| Err(StoreError::Backend(anyhow::anyhow!("connection reset"))));
        let flaky = PremiumExpiryEngine::new(
            users.clone(),
            Arc::new(failing),
            kv.clone(),
            Arc::new(LogSender),
        );
        let first = flaky.run(now).await.unwrap();
        assert_eq!(first.warned, 0);
        assert_eq!(first.failed, 1);

        let engine =
            PremiumExpiryEngine::new(users, notifications.clone(), kv, Arc::new(LogSender));
        let second = engine.run(now + Duration::minutes(60)).await.unwrap();
        assert_eq!(second.warned, 1);
        assert_eq!(second.failed, 0);

        let stored = notifications.list_for_user(&user.id, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::PremiumExpiring);
    }

    #[tokio::test]
    async fn no_warning_between_thresholds() {
        let f = fixture();
        let now = now();
        f.users
            .create(premium_user("a@example.com", Some(now + Duration::days(5))))
            .await
            .unwrap();

        let report = f.engine.run(now).await.unwrap();
        assert_eq!(report.warned, 0);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn non_premium_and_lifetime_users_are_skipped() {
        let f = fixture();
        let now = now();
        f.users
            .create(User {
                email: Some("free@example.com".into()),
                premium_expiry: Some(now - Duration::days(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        f.users
            .create(premium_user("lifetime@example.com", None))
            .await
            .unwrap();

        let report = f.engine.run(now).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn expired_user_gets_message() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .withf(|m| m.destination == "a@example.com" && m.body.contains("expired"))
            .times(1)
            .returning(|_| Ok(()));
        let f = fixture_with_sender(Arc::new(sender));
        let now = now();
        f.users
            .create(premium_user("a@example.com", Some(now - Duration::days(1))))
            .await
            .unwrap();

        f.engine.run(now).await.unwrap();
    }

    #[tokio::test]
    async fn per_user_failure_is_counted_and_scan_continues() {
        let now = now();
        let lapsed = |id: &str| User {
            id: id.to_string(),
            ..premium_user(&format!("{}@example.com", id), Some(now - Duration::days(1)))
        };
        let listed = vec![lapsed("u1"), lapsed("u2")];

        let mut users = MockUserStore::new();
        users
            .expect_list_all()
            .returning(move || Ok(listed.clone()));
        users.expect_update().returning(|id, _| {
            if id == "u1" {
                Err(StoreError::Backend(anyhow::anyhow!("timeout")))
            } else {
                Ok(())
            }
        });

        let kv = Arc::new(MemoryKv::new());
        let engine = PremiumExpiryEngine::new(
            Arc::new(users),
            Arc::new(KvNotificationStore::new(kv.clone())),
            kv,
            Arc::new(LogSender),
        );

        let report = engine.run(now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.expired, 1);
    }
}
