//! Key layout.
//!
//! All store keys are built here. Entity ids are normalized once, in
//! [`normalize_id`], so a prefix can never be applied twice.
//!
//! ```text
//! user:{id}                          → User hash
//! users                              → Set of bare user ids
//! user:email:{email}                 → Bare user id (lowercased email)
//! user:{id}:interests:sent           → Set of interest ids
//! user:{id}:interests:received       → Set of interest ids
//! user:{id}:shortlist                → Set of target user ids
//! interest:{id}                      → Interest hash
//! interests                          → Set of bare interest ids
//! notification:{id}                  → Notification hash
//! notifications:{userId}             → List of notification ids, newest at head
//! verification:{email}:{purpose}     → VerificationCode hash (TTL)
//! ratelimit:{scope}:{identifier}     → Sorted set of request timestamps (TTL)
//! premium:warning:{userId}:{days}    → Warning marker (TTL)
//! ```

use chrono::{DateTime, Utc};
use rand::{Rng, distr::Alphanumeric};

use crate::error::{Result, StoreError};

/// Entity types that own a `<prefix>:<id>` hash and a membership set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Interest,
    Notification,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Interest => "interest",
            EntityKind::Notification => "notification",
        }
    }

    /// Membership set enumerating all ids of this kind.
    pub fn membership_key(self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Interest => "interests",
            EntityKind::Notification => "notifications:all",
        }
    }
}

/// Strip any number of `<prefix>:` prefixes and validate the bare id.
pub fn normalize_id(kind: EntityKind, raw: &str) -> Result<String> {
    let prefix = format!("{}:", kind.prefix());
    let mut id = raw.trim();
    while let Some(rest) = id.strip_prefix(prefix.as_str()) {
        id = rest;
    }

    if id.is_empty() {
        return Err(StoreError::validation(format!(
            "{} id is required",
            kind.prefix()
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c == ':' || c == '*') {
        return Err(StoreError::validation(format!(
            "malformed {} id `{}`",
            kind.prefix(),
            raw
        )));
    }
    Ok(id.to_string())
}

/// Primary hash key for an entity, prefix applied exactly once.
pub fn record_key(kind: EntityKind, raw_id: &str) -> Result<String> {
    let id = normalize_id(kind, raw_id)?;
    Ok(format!("{}:{}", kind.prefix(), id))
}

/// `<unixMillis>-<random suffix>`; sortable by creation time.
pub fn generate_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", now.timestamp_millis(), suffix)
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn email_lookup_key(email: &str) -> String {
    format!("user:email:{}", normalize_email(email))
}

pub fn sent_interests_key(user_id: &str) -> String {
    format!("user:{}:interests:sent", user_id)
}

pub fn received_interests_key(user_id: &str) -> String {
    format!("user:{}:interests:received", user_id)
}

pub fn shortlist_key(user_id: &str) -> String {
    format!("user:{}:shortlist", user_id)
}

pub fn user_notifications_key(user_id: &str) -> String {
    format!("notifications:{}", user_id)
}

pub fn verification_key(email: &str, purpose: &str) -> String {
    format!("verification:{}:{}", normalize_email(email), purpose)
}

pub fn rate_limit_key(scope: &str, identifier: &str) -> String {
    format!("ratelimit:{}:{}", scope, identifier)
}

pub fn premium_warning_key(user_id: &str, days: i64) -> String {
    format!("premium:warning:{}:{}", user_id, days)
}

/// Bare id from a primary user hash key, or None for any other `user:*` key.
pub fn user_id_from_record_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix("user:")?;
    (!id.is_empty() && !id.contains(':')).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_single_prefix() {
        assert_eq!(normalize_id(EntityKind::User, "user:abc").unwrap(), "abc");
    }

    #[test]
    fn normalize_strips_repeated_prefix() {
        assert_eq!(
            normalize_id(EntityKind::User, "user:user:abc").unwrap(),
            "abc"
        );
        assert_eq!(
            record_key(EntityKind::User, "user:user:abc").unwrap(),
            "user:abc"
        );
    }

    #[test]
    fn normalize_keeps_bare_id() {
        assert_eq!(
            record_key(EntityKind::Interest, "1700000000000-k3j2h1g0f").unwrap(),
            "interest:1700000000000-k3j2h1g0f"
        );
    }

    #[test]
    fn normalize_does_not_strip_other_prefixes() {
        assert!(normalize_id(EntityKind::User, "interest:abc").is_err());
    }

    #[test]
    fn normalize_rejects_empty_and_malformed() {
        for raw in ["", "   ", "user:", "user:user:", "a b", "a*"] {
            let err = normalize_id(EntityKind::User, raw).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{raw:?}");
        }
    }

    #[test]
    fn generated_ids_have_millis_and_suffix() {
        let now = Utc::now();
        let id = generate_id(now);
        let (millis, suffix) = id.split_once('-').unwrap();

        assert_eq!(millis, now.timestamp_millis().to_string());
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(normalize_id(EntityKind::User, &id).is_ok());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let now = Utc::now();
        assert_ne!(generate_id(now), generate_id(now));
    }

    #[test]
    fn email_keys_are_case_insensitive() {
        assert_eq!(
            email_lookup_key(" Aisha@Example.com "),
            "user:email:aisha@example.com"
        );
        assert_eq!(
            verification_key("Aisha@Example.com", "login"),
            "verification:aisha@example.com:login"
        );
    }

    #[test]
    fn user_id_from_record_key_ignores_secondary_keys() {
        assert_eq!(user_id_from_record_key("user:42"), Some("42"));
        assert_eq!(user_id_from_record_key("user:42:shortlist"), None);
        assert_eq!(user_id_from_record_key("user:email:a@b.c"), None);
        assert_eq!(user_id_from_record_key("users"), None);
    }
}
