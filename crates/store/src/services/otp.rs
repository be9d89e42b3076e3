//! One-time verification codes.
//!
//! Per (email, purpose) a code moves through none → issued → consumed or
//! expired. Codes are stored as SHA-256 hex so a store dump does not leak
//! live codes; the plaintext only leaves through [`MessageSender`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use garde::Validate;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::models::{OtpPurpose, VerificationCode};
use crate::services::sender::{MessageSender, OutboundMessage};
use crate::stores::VerificationStore;

/// Lifetime of an issued code, also used as the record TTL.
pub const CODE_TTL_SECS: u64 = 10 * 60;

const CODE_DIGITS: usize = 6;

#[derive(Debug, Validate)]
struct CodeRequest {
    #[garde(email)]
    email: String,
}

/// Result of [`OtpService::issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub email: String,
    pub purpose: OtpPurpose,
    /// Plaintext code, for callers that deliver through their own channel.
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub stored: bool,
    pub delivered: bool,
}

/// Result of [`OtpService::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpOutcome {
    Verified,
    Invalid,
    Expired,
    AlreadyUsed,
    NotFound,
}

impl OtpOutcome {
    pub fn is_verified(self) -> bool {
        matches!(self, OtpOutcome::Verified)
    }
}

pub struct OtpService {
    codes: Arc<dyn VerificationStore>,
    sender: Arc<dyn MessageSender>,
}

impl OtpService {
    pub fn new(codes: Arc<dyn VerificationStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self { codes, sender }
    }

    /// Issue a fresh code, replacing any live one for the same purpose.
    ///
    /// Storing and delivering are both attempted. The call succeeds if either
    /// worked and fails only when both did not.
    pub async fn issue(
        &self,
        email: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode> {
        let request = CodeRequest {
            email: email.trim().to_string(),
        };
        request
            .validate()
            .map_err(|e| StoreError::validation(e.to_string()))?;
        let email = keys::normalize_email(&request.email);

        let code = generate_code();
        let expires_at = now + Duration::seconds(CODE_TTL_SECS as i64);
        let record = VerificationCode {
            email: email.clone(),
            purpose,
            code: hash_code(&code),
            expires_at,
            is_used: false,
            created_at: now,
        };

        let store_result = self.codes.put(&record, CODE_TTL_SECS).await;
        if let Err(err) = &store_result {
            tracing::warn!(email = %email, purpose = %purpose, error = %err, "failed to store verification code");
        }

        let message = OutboundMessage::new(
            &email,
            format!(
                "Your verification code is: {}\n\nThis code expires in 10 minutes.",
                code
            ),
        )
        .with_subject("Your verification code");
        let delivered = match self.sender.send(&message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(email = %email, purpose = %purpose, error = %err, "failed to deliver verification code");
                false
            }
        };

        let stored = match store_result {
            Ok(()) => true,
            Err(err) if !delivered => return Err(err),
            Err(_) => false,
        };

        tracing::info!(email = %email, purpose = %purpose, stored, delivered, "verification code issued");
        Ok(IssuedCode {
            email,
            purpose,
            code,
            expires_at,
            stored,
            delivered,
        })
    }

    /// Check a submitted code and consume it on success.
    pub async fn verify(
        &self,
        email: &str,
        code: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<OtpOutcome> {
        let Some(record) = self.codes.get(email, purpose).await? else {
            return Ok(OtpOutcome::NotFound);
        };

        let outcome = if record.code != hash_code(code.trim()) {
            OtpOutcome::Invalid
        } else if record.is_used {
            OtpOutcome::AlreadyUsed
        } else if now >= record.expires_at {
            OtpOutcome::Expired
        } else if self.codes.mark_used(email, purpose).await? {
            OtpOutcome::Verified
        } else {
            // Lost the race to a concurrent verify.
            OtpOutcome::AlreadyUsed
        };

        if outcome.is_verified() {
            tracing::info!(email = %record.email, purpose = %purpose, "verification code accepted");
        } else {
            tracing::warn!(email = %record.email, purpose = %purpose, outcome = ?outcome, "verification code rejected");
        }
        Ok(outcome)
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_DIGITS)
        .map(|_| rng.random_range(0..10).to_string())
        .collect()
}

fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}
