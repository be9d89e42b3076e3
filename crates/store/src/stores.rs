//! Entity stores and secondary indexes.
//!
//! Each store is a trait with a [`Kv`]-backed implementation. A logical write
//! (primary hash plus every index it touches) is submitted as one
//! [`Kv::batch`], so the record and its indexes commit together.
//!
//! ## Stores
//!
//! - **users** - User CRUD, `users` membership set, `user:email:` lookup
//! - **interests** - Interest CRUD, sent/received fan-out sets
//! - **shortlist** - Per-user shortlist sets
//! - **notifications** - Notification CRUD, per-user newest-first lists
//! - **verification** - One-time code records (TTL)
//! - **rate_limit** - Sliding-window request counters (TTL)
//!
//! See [`crate::keys`] for the full key layout.

mod interests;
mod notifications;
mod rate_limit;
mod shortlist;
mod users;
mod verification;

pub use interests::{InterestStore, KvInterestStore};
pub use notifications::{KvNotificationStore, NewNotification, NotificationStore};
pub use rate_limit::{KvRateLimiter, RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use shortlist::{KvShortlistStore, ShortlistStore};
pub use users::{KvUserStore, UserStore};
pub use verification::{KvVerificationStore, VerificationStore};

#[cfg(test)]
pub use interests::MockInterestStore;
#[cfg(test)]
pub use notifications::MockNotificationStore;
#[cfg(test)]
pub use rate_limit::MockRateLimiter;
#[cfg(test)]
pub use shortlist::MockShortlistStore;
#[cfg(test)]
pub use users::MockUserStore;
#[cfg(test)]
pub use verification::MockVerificationStore;

use std::sync::Arc;

use crate::kv::Kv;

/// Collection of all stores over one backing connection.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub interests: Arc<dyn InterestStore>,
    pub shortlist: Arc<dyn ShortlistStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub verification: Arc<dyn VerificationStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

impl Stores {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self {
            users: Arc::new(KvUserStore::new(kv.clone())),
            interests: Arc::new(KvInterestStore::new(kv.clone())),
            shortlist: Arc::new(KvShortlistStore::new(kv.clone())),
            notifications: Arc::new(KvNotificationStore::new(kv.clone())),
            verification: Arc::new(KvVerificationStore::new(kv.clone())),
            rate_limiter: Arc::new(KvRateLimiter::new(kv)),
        }
    }
}
