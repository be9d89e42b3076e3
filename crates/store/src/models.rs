use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::{FieldMap, Fields, HashRecord, ToField};
use crate::error::{Result, StoreError};

/// Registered profile.
///
/// Stored as `user:{id}`. Fields the layer does not model are kept in
/// `extra` so a read-then-write never drops data written by other tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub location: Option<String>,
    pub education: Option<String>,
    pub profession: Option<String>,
    pub sect: Option<String>,
    pub height: Option<String>,
    pub bio: Option<String>,
    pub verified: bool,
    pub premium: bool,
    pub premium_plan: Option<String>,
    /// None means premium never lapses.
    pub premium_expiry: Option<DateTime<Utc>>,
    pub premium_expired_at: Option<DateTime<Utc>>,
    pub profile_photo: Option<String>,
    /// Gallery; persisted to both `photos` and `profilePhotos`.
    pub photos: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

const USER_FIELDS: &[&str] = &[
    "id",
    "email",
    "phone",
    "passwordHash",
    "name",
    "age",
    "gender",
    "location",
    "education",
    "profession",
    "sect",
    "height",
    "bio",
    "verified",
    "premium",
    "premiumPlan",
    "premiumExpiry",
    "premiumExpiredAt",
    "profilePhoto",
    "photos",
    "profilePhotos",
    "createdAt",
    "updatedAt",
];

impl User {
    /// Premium and not yet past its expiry.
    pub fn is_premium_active(&self, now: DateTime<Utc>) -> bool {
        self.premium && self.premium_expiry.is_none_or(|expiry| expiry > now)
    }
}

fn put<V: ToField + ?Sized>(map: &mut FieldMap, name: &str, value: Option<&V>) {
    if let Some(value) = value {
        map.insert(name.to_string(), value.to_field());
    }
}

impl HashRecord for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn encode(&self) -> FieldMap {
        let mut map: FieldMap = self.extra.clone();
        map.insert("id".into(), self.id.clone());
        put(&mut map, "email", self.email.as_deref());
        put(&mut map, "phone", self.phone.as_deref());
        put(&mut map, "passwordHash", self.password_hash.as_deref());
        put(&mut map, "name", self.name.as_deref());
        put(&mut map, "age", self.age.as_ref());
        put(&mut map, "gender", self.gender.as_deref());
        put(&mut map, "location", self.location.as_deref());
        put(&mut map, "education", self.education.as_deref());
        put(&mut map, "profession", self.profession.as_deref());
        put(&mut map, "sect", self.sect.as_deref());
        put(&mut map, "height", self.height.as_deref());
        put(&mut map, "bio", self.bio.as_deref());
        map.insert("verified".into(), self.verified.to_field());
        map.insert("premium".into(), self.premium.to_field());
        put(&mut map, "premiumPlan", self.premium_plan.as_deref());
        put(&mut map, "premiumExpiry", self.premium_expiry.as_ref());
        put(&mut map, "premiumExpiredAt", self.premium_expired_at.as_ref());
        put(&mut map, "profilePhoto", self.profile_photo.as_deref());
        let photos = self.photos.to_field();
        map.insert("photos".into(), photos.clone());
        map.insert("profilePhotos".into(), photos);
        put(&mut map, "createdAt", self.created_at.as_ref());
        put(&mut map, "updatedAt", self.updated_at.as_ref());
        map
    }

    fn decode(id: &str, fields: &Fields<'_>) -> Result<Self> {
        let photos = fields.list("photos");
        let mirrored = fields.list("profilePhotos");
        let photos = if photos.is_empty() {
            mirrored
        } else {
            if !mirrored.is_empty() && mirrored != photos {
                tracing::warn!(key = fields.key(), "photos and profilePhotos diverge, using photos");
            }
            photos
        };

        Ok(User {
            id: id.to_string(),
            email: fields.text("email"),
            phone: fields.text("phone"),
            password_hash: fields.text("passwordHash"),
            name: fields.text("name"),
            age: fields.number("age"),
            gender: fields.text("gender"),
            location: fields.text("location"),
            education: fields.text("education"),
            profession: fields.text("profession"),
            sect: fields.text("sect"),
            height: fields.text("height"),
            bio: fields.text("bio"),
            verified: fields.flag("verified"),
            premium: fields.flag("premium"),
            premium_plan: fields.text("premiumPlan"),
            premium_expiry: fields.timestamp("premiumExpiry"),
            premium_expired_at: fields.timestamp("premiumExpiredAt"),
            profile_photo: fields.text("profilePhoto"),
            photos,
            created_at: fields.timestamp("createdAt"),
            updated_at: fields.timestamp("updatedAt"),
            extra: fields.rest(USER_FIELDS),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterestStatus {
    Pending,
    Accepted,
    Declined,
}

impl InterestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InterestStatus::Pending => "pending",
            InterestStatus::Accepted => "accepted",
            InterestStatus::Declined => "declined",
        }
    }
}

impl fmt::Display for InterestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterestStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(InterestStatus::Pending),
            "accepted" => Ok(InterestStatus::Accepted),
            "declined" => Ok(InterestStatus::Declined),
            other => Err(StoreError::validation(format!(
                "unknown interest status `{}`",
                other
            ))),
        }
    }
}

/// One user's expressed interest in another. Sender and recipient are fixed
/// at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interest {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: InterestStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HashRecord for Interest {
    fn id(&self) -> &str {
        &self.id
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("id".into(), self.id.clone());
        map.insert("fromUserId".into(), self.from_user_id.clone());
        map.insert("toUserId".into(), self.to_user_id.clone());
        map.insert("status".into(), self.status.as_str().into());
        put(&mut map, "message", self.message.as_deref());
        map.insert("createdAt".into(), self.created_at.to_field());
        map.insert("updatedAt".into(), self.updated_at.to_field());
        map
    }

    fn decode(id: &str, fields: &Fields<'_>) -> Result<Self> {
        let status = fields
            .required("status")?
            .parse::<InterestStatus>()
            .map_err(|_| StoreError::corrupt(fields.key(), "unknown status"))?;
        let created_at = fields.timestamp("createdAt").unwrap_or(epoch());

        Ok(Interest {
            id: id.to_string(),
            from_user_id: fields.required("fromUserId")?,
            to_user_id: fields.required("toUserId")?,
            status,
            message: fields.text("message"),
            created_at,
            updated_at: fields.timestamp("updatedAt").unwrap_or(created_at),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum NotificationKind {
    InterestReceived,
    InterestAccepted,
    InterestDeclined,
    PremiumExpired,
    PremiumExpiring,
    System,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::InterestReceived => "interest_received",
            NotificationKind::InterestAccepted => "interest_accepted",
            NotificationKind::InterestDeclined => "interest_declined",
            NotificationKind::PremiumExpired => "premium_expired",
            NotificationKind::PremiumExpiring => "premium_expiring",
            NotificationKind::System => "system",
            NotificationKind::Other(other) => other,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "interest_received" => NotificationKind::InterestReceived,
            "interest_accepted" => NotificationKind::InterestAccepted,
            "interest_declined" => NotificationKind::InterestDeclined,
            "premium_expired" => NotificationKind::PremiumExpired,
            "premium_expiring" => NotificationKind::PremiumExpiring,
            "system" => NotificationKind::System,
            _ => NotificationKind::Other(s),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl HashRecord for Notification {
    fn id(&self) -> &str {
        &self.id
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("id".into(), self.id.clone());
        map.insert("userId".into(), self.user_id.clone());
        map.insert("type".into(), self.kind.as_str().into());
        map.insert("message".into(), self.message.clone());
        map.insert("read".into(), self.read.to_field());
        if !self.metadata.is_null() {
            map.insert("metadata".into(), self.metadata.to_field());
        }
        map.insert("createdAt".into(), self.created_at.to_field());
        map
    }

    fn decode(id: &str, fields: &Fields<'_>) -> Result<Self> {
        Ok(Notification {
            id: id.to_string(),
            user_id: fields.required("userId")?,
            kind: NotificationKind::from(
                fields.text("type").unwrap_or_else(|| "system".to_string()),
            ),
            message: fields.text("message").unwrap_or_default(),
            read: fields.flag("read"),
            metadata: fields.json("metadata"),
            created_at: fields.timestamp("createdAt").unwrap_or(epoch()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    EmailVerification,
    PasswordReset,
    Login,
    PhoneVerification,
}

impl OtpPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpPurpose::EmailVerification => "email_verification",
            OtpPurpose::PasswordReset => "password_reset",
            OtpPurpose::Login => "login",
            OtpPurpose::PhoneVerification => "phone_verification",
        }
    }
}

impl fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpPurpose {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email_verification" => Ok(OtpPurpose::EmailVerification),
            "password_reset" => Ok(OtpPurpose::PasswordReset),
            "login" => Ok(OtpPurpose::Login),
            "phone_verification" => Ok(OtpPurpose::PhoneVerification),
            other => Err(StoreError::validation(format!(
                "unknown verification purpose `{}`",
                other
            ))),
        }
    }
}

/// Live one-time code for an (email, purpose) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCode {
    pub email: String,
    pub purpose: OtpPurpose,
    pub code: String,
    /// Stored as epoch millis.
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    pub fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("email".into(), self.email.clone());
        map.insert("purpose".into(), self.purpose.as_str().into());
        map.insert("code".into(), self.code.clone());
        map.insert(
            "expiresAt".into(),
            self.expires_at.timestamp_millis().to_field(),
        );
        map.insert("isUsed".into(), self.is_used.to_field());
        map.insert("createdAt".into(), self.created_at.to_field());
        map
    }

    pub fn decode(fields: &Fields<'_>) -> Result<Self> {
        let purpose = fields
            .required("purpose")?
            .parse::<OtpPurpose>()
            .map_err(|_| StoreError::corrupt(fields.key(), "unknown purpose"))?;
        let expires_at = fields
            .number::<i64>("expiresAt")
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| StoreError::corrupt(fields.key(), "missing or invalid expiresAt"))?;

        Ok(VerificationCode {
            email: fields.required("email")?,
            purpose,
            code: fields.required("code")?,
            expires_at,
            is_used: fields.flag("isUsed"),
            created_at: fields.timestamp("createdAt").unwrap_or(epoch()),
        })
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use std::collections::HashMap;

    fn to_hash(map: FieldMap) -> HashMap<String, String> {
        map.into_iter().collect()
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    fn full_user() -> User {
        User {
            id: "1700000000000-abcdefghi".into(),
            email: Some("aisha@example.com".into()),
            phone: Some("+441234567890".into()),
            password_hash: Some("$argon2id$v=19$hash".into()),
            name: Some("Aisha".into()),
            age: Some(27),
            gender: Some("female".into()),
            location: Some("Leeds".into()),
            education: Some("MSc".into()),
            profession: Some("Engineer".into()),
            sect: Some("Sunni".into()),
            height: Some("5'5\"".into()),
            bio: Some("Hello".into()),
            verified: true,
            premium: true,
            premium_plan: Some("gold".into()),
            premium_expiry: Some(now() + Duration::days(30)),
            premium_expired_at: None,
            profile_photo: Some("https://cdn/p.jpg".into()),
            photos: vec!["https://cdn/1.jpg".into(), "https://cdn/2.jpg".into()],
            created_at: Some(now()),
            updated_at: Some(now()),
            extra: BTreeMap::from([("maritalStatus".to_string(), "single".to_string())]),
        }
    }

    #[test]
    fn user_round_trips() {
        let user = full_user();
        let raw = to_hash(user.encode());
        let decoded = User::decode(&user.id, &Fields::new("user:x", &raw)).unwrap();

        assert_eq!(decoded, user);
    }

    #[test]
    fn user_encodes_flags_as_literals() {
        let encoded = full_user().encode();

        assert_eq!(encoded["verified"], "true");
        assert_eq!(encoded["premium"], "true");
        assert_eq!(encoded["age"], "27");
        assert_eq!(encoded["photos"], encoded["profilePhotos"]);
    }

    #[test]
    fn user_decode_falls_back_to_profile_photos() {
        let raw = HashMap::from([
            ("profilePhotos".to_string(), r#"["a.jpg"]"#.to_string()),
            ("premium".to_string(), "false".to_string()),
        ]);
        let user = User::decode("1", &Fields::new("user:1", &raw)).unwrap();

        assert_eq!(user.photos, vec!["a.jpg"]);
        assert!(!user.premium);
        assert!(user.email.is_none());
    }

    #[test]
    fn premium_active_respects_expiry() {
        let now = now();
        let mut user = User {
            premium: true,
            ..Default::default()
        };
        assert!(user.is_premium_active(now));

        user.premium_expiry = Some(now - Duration::days(1));
        assert!(!user.is_premium_active(now));

        user.premium_expiry = Some(now + Duration::days(1));
        assert!(user.is_premium_active(now));

        user.premium = false;
        assert!(!user.is_premium_active(now));
    }

    #[test]
    fn interest_round_trips() {
        let at = now();
        let interest = Interest {
            id: "i1".into(),
            from_user_id: "a".into(),
            to_user_id: "b".into(),
            status: InterestStatus::Accepted,
            message: Some("Salaam".into()),
            created_at: at,
            updated_at: at + Duration::minutes(5),
        };
        let raw = to_hash(interest.encode());

        assert_eq!(
            Interest::decode("i1", &Fields::new("interest:i1", &raw)).unwrap(),
            interest
        );
    }

    #[test]
    fn interest_without_sender_is_corrupt() {
        let raw = HashMap::from([
            ("toUserId".to_string(), "b".to_string()),
            ("status".to_string(), "pending".to_string()),
        ]);
        let err = Interest::decode("i1", &Fields::new("interest:i1", &raw)).unwrap_err();

        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn notification_round_trips_with_metadata() {
        let notification = Notification {
            id: "n1".into(),
            user_id: "u1".into(),
            kind: NotificationKind::PremiumExpired,
            message: "Your premium membership has expired".into(),
            read: false,
            metadata: serde_json::json!({ "plan": "gold" }),
            created_at: now(),
        };
        let raw = to_hash(notification.encode());

        assert_eq!(raw["read"], "false");
        assert_eq!(
            Notification::decode("n1", &Fields::new("notification:n1", &raw)).unwrap(),
            notification
        );
    }

    #[test]
    fn unknown_notification_kind_is_preserved() {
        let kind = NotificationKind::from("profile_viewed".to_string());
        assert_eq!(kind, NotificationKind::Other("profile_viewed".into()));
        assert_eq!(kind.as_str(), "profile_viewed");
    }

    #[test]
    fn verification_code_stores_expiry_as_millis() {
        let at = now();
        let code = VerificationCode {
            email: "a@b.com".into(),
            purpose: OtpPurpose::Login,
            code: "123456".into(),
            expires_at: at + Duration::minutes(10),
            is_used: false,
            created_at: at,
        };
        let raw = to_hash(code.encode());

        assert_eq!(
            raw["expiresAt"],
            (at + Duration::minutes(10)).timestamp_millis().to_string()
        );
        assert_eq!(raw["isUsed"], "false");
        assert_eq!(
            VerificationCode::decode(&Fields::new("verification:a@b.com:login", &raw)).unwrap(),
            code
        );
    }

    #[test]
    fn purpose_parses() {
        assert_eq!(
            "password_reset".parse::<OtpPurpose>().unwrap(),
            OtpPurpose::PasswordReset
        );
        assert!("sms".parse::<OtpPurpose>().is_err());
    }
}
