//! Verification code records, one live code per (email, purpose).

use std::sync::Arc;

use async_trait::async_trait;

use crate::encoding::{Fields, encode_bool};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::kv::{Kv, WriteOp};
use crate::models::{OtpPurpose, VerificationCode};

/// Store for verification code operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Replace any live code for the same (email, purpose), expiring after `ttl_secs`.
    async fn put(&self, code: &VerificationCode, ttl_secs: u64) -> Result<()>;

    async fn get(&self, email: &str, purpose: OtpPurpose) -> Result<Option<VerificationCode>>;

    /// Flip `isUsed` from false to true. Returns false if it was already used
    /// or the record is gone.
    async fn mark_used(&self, email: &str, purpose: OtpPurpose) -> Result<bool>;

    async fn delete(&self, email: &str, purpose: OtpPurpose) -> Result<()>;
}

/// Kv implementation of VerificationStore.
#[derive(Clone)]
pub struct KvVerificationStore {
    kv: Arc<dyn Kv>,
}

impl KvVerificationStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }
}

fn key_for(email: &str, purpose: OtpPurpose) -> Result<String> {
    if keys::normalize_email(email).is_empty() {
        return Err(StoreError::validation("email is required"));
    }
    Ok(keys::verification_key(email, purpose.as_str()))
}

#[async_trait]
impl VerificationStore for KvVerificationStore {
    async fn put(&self, code: &VerificationCode, ttl_secs: u64) -> Result<()> {
        let key = key_for(&code.email, code.purpose)?;

        // Delete first so no field from a previous code survives the overwrite.
        self.kv
            .batch(vec![
                WriteOp::Del { key: key.clone() },
                WriteOp::HSet {
                    key: key.clone(),
                    fields: code.encode().into_iter().collect(),
                },
                WriteOp::Expire {
                    key,
                    secs: ttl_secs as i64,
                },
            ])
            .await?;
        Ok(())
    }

    async fn get(&self, email: &str, purpose: OtpPurpose) -> Result<Option<VerificationCode>> {
        let key = key_for(email, purpose)?;
        let raw = self.kv.hgetall(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        VerificationCode::decode(&Fields::new(&key, &raw)).map(Some)
    }

    async fn mark_used(&self, email: &str, purpose: OtpPurpose) -> Result<bool> {
        let key = key_for(email, purpose)?;
        Ok(self
            .kv
            .hash_compare_and_set(&key, "isUsed", &encode_bool(false), &encode_bool(true))
            .await?)
    }

    async fn delete(&self, email: &str, purpose: OtpPurpose) -> Result<()> {
        let key = key_for(email, purpose)?;
        self.kv.del(&key).await?;
        Ok(())
    }
}
