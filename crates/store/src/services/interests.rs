//! Interest workflow: send, then accept or decline, with notifications to
//! the other party.

use std::sync::Arc;

use serde_json::json;

use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::models::{Interest, InterestStatus, NotificationKind};
use crate::stores::{InterestStore, NewNotification, NotificationStore, UserStore};

pub struct InterestService {
    users: Arc<dyn UserStore>,
    interests: Arc<dyn InterestStore>,
    notifications: Arc<dyn NotificationStore>,
}

impl InterestService {
    pub fn new(
        users: Arc<dyn UserStore>,
        interests: Arc<dyn InterestStore>,
        notifications: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            users,
            interests,
            notifications,
        }
    }

    /// Send an interest from one existing user to another.
    pub async fn send(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        message: Option<String>,
    ) -> Result<Interest> {
        let sender = self
            .users
            .get(from_user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user:{}", from_user_id)))?;
        self.users
            .get(to_user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user:{}", to_user_id)))?;

        let interest = self.interests.create(&sender.id, to_user_id, message).await?;

        let who = sender.name.as_deref().unwrap_or("Someone");
        self.notify(
            NewNotification::new(
                &interest.to_user_id,
                NotificationKind::InterestReceived,
                format!("{} is interested in your profile", who),
            )
            .with_metadata(json!({
                "interestId": interest.id,
                "fromUserId": interest.from_user_id,
            })),
        )
        .await;

        Ok(interest)
    }

    /// Accept or decline a pending interest. Only the recipient may respond.
    pub async fn respond(
        &self,
        interest_id: &str,
        responder_id: &str,
        status: InterestStatus,
    ) -> Result<Interest> {
        if status == InterestStatus::Pending {
            return Err(StoreError::validation("response must be accepted or declined"));
        }
        let responder = keys::normalize_id(EntityKind::User, responder_id)?;

        let interest = self
            .interests
            .get(interest_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("interest:{}", interest_id)))?;
        if interest.to_user_id != responder {
            return Err(StoreError::validation(
                "only the recipient can respond to an interest",
            ));
        }
        if interest.status != InterestStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "interest {} already {}",
                interest.id, interest.status
            )));
        }

        let updated = self.interests.update_status(&interest.id, status).await?;

        let (kind, verb) = match status {
            InterestStatus::Accepted => (NotificationKind::InterestAccepted, "accepted"),
            _ => (NotificationKind::InterestDeclined, "declined"),
        };
        self.notify(
            NewNotification::new(
                &updated.from_user_id,
                kind,
                format!("Your interest was {}", verb),
            )
            .with_metadata(json!({
                "interestId": updated.id,
                "toUserId": updated.to_user_id,
            })),
        )
        .await;

        Ok(updated)
    }

    async fn notify(&self, notification: NewNotification) {
        let user_id = notification.user_id.clone();
        if let Err(err) = self.notifications.create(notification).await {
            tracing::warn!(user_id = %user_id, error = %err, "failed to record interest notification");
        }
    }
}
