//! Index repair.
//!
//! Walks every `user:{id}` hash and brings the secondary structures back in
//! line with it: the `users` membership set, the `user:email:` lookup keys,
//! and the mirrored gallery fields. Safe to re-run; a clean store produces
//! an all-zero report.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::encoding::{Fields, MIRRORED_PHOTO_FIELDS, Patch, encode_list};
use crate::error::{Result, StoreError};
use crate::keys::{self, EntityKind};
use crate::kv::{Kv, WriteOp};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub membership_added: usize,
    pub membership_removed: usize,
    pub email_lookups_fixed: usize,
    pub email_conflicts: usize,
    pub photos_remirrored: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.membership_added == 0
            && self.membership_removed == 0
            && self.email_lookups_fixed == 0
            && self.email_conflicts == 0
            && self.photos_remirrored == 0
    }
}

pub struct Reconciler {
    kv: Arc<dyn Kv>,
}

impl Reconciler {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let records: BTreeSet<String> = self
            .kv
            .scan_keys("user:*")
            .await?
            .iter()
            .filter_map(|key| keys::user_id_from_record_key(key))
            .map(str::to_string)
            .collect();
        let members: BTreeSet<String> = self
            .kv
            .smembers(EntityKind::User.membership_key())
            .await?
            .into_iter()
            .collect();
        report.scanned = records.len();

        let mut membership_ops = Vec::new();
        for id in records.difference(&members) {
            tracing::warn!(user_id = %id, "user record missing from membership set");
            membership_ops.push(WriteOp::SAdd {
                key: EntityKind::User.membership_key().to_string(),
                member: id.clone(),
            });
            report.membership_added += 1;
        }
        for id in members.difference(&records) {
            tracing::warn!(user_id = %id, "membership entry without user record");
            membership_ops.push(WriteOp::SRem {
                key: EntityKind::User.membership_key().to_string(),
                member: id.clone(),
            });
            report.membership_removed += 1;
        }
        if !membership_ops.is_empty() {
            self.kv.batch(membership_ops).await?;
        }

        for id in &records {
            if let Err(err) = self.repair_user(id, &mut report).await {
                match err {
                    StoreError::Backend(err) => return Err(StoreError::Backend(err)),
                    other => tracing::warn!(user_id = %id, error = %other, "skipping user"),
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            membership_added = report.membership_added,
            membership_removed = report.membership_removed,
            email_lookups_fixed = report.email_lookups_fixed,
            email_conflicts = report.email_conflicts,
            photos_remirrored = report.photos_remirrored,
            "reconcile complete"
        );
        Ok(report)
    }

    async fn repair_user(&self, id: &str, report: &mut ReconcileReport) -> Result<()> {
        let key = keys::record_key(EntityKind::User, id)?;
        let raw = self.kv.hgetall(&key).await?;
        let fields = Fields::new(&key, &raw);
        let mut ops = Vec::new();

        if let Some(email) = fields.text("email") {
            let lookup = keys::email_lookup_key(&email);
            let owner = self.kv.get(&lookup).await?;
            let claimed_by_other = match owner.as_deref() {
                Some(owner) if owner != id => self.owns_email(owner, &email).await?,
                _ => false,
            };
            if claimed_by_other {
                let conflict = StoreError::IndexInconsistency(format!(
                    "email {} claimed by users {} and {}",
                    keys::normalize_email(&email),
                    owner.as_deref().unwrap_or_default(),
                    id
                ));
                tracing::warn!(error = %conflict, "duplicate email, leaving lookup unchanged");
                report.email_conflicts += 1;
            } else if owner.as_deref() != Some(id) {
                ops.push(WriteOp::Set {
                    key: lookup,
                    value: id.to_string(),
                });
                report.email_lookups_fixed += 1;
            }
        }

        if let Some(photos) = diverged_photos(&raw) {
            ops.extend(Patch::new().set("photos", &photos).into_ops(&key));
            report.photos_remirrored += 1;
        }

        if !ops.is_empty() {
            tracing::info!(user_id = %id, writes = ops.len(), "repairing user indexes");
            self.kv.batch(ops).await?;
        }
        Ok(())
    }

    async fn owns_email(&self, id: &str, email: &str) -> Result<bool> {
        let key = keys::record_key(EntityKind::User, id)?;
        Ok(self
            .kv
            .hget(&key, "email")
            .await?
            .is_some_and(|stored| keys::normalize_email(&stored) == keys::normalize_email(email)))
    }
}

/// Canonical gallery when the two mirrored fields are not byte-identical.
fn diverged_photos(raw: &HashMap<String, String>) -> Option<Vec<String>> {
    let [primary, mirror] = MIRRORED_PHOTO_FIELDS.map(|name| raw.get(name));
    if primary.is_none() && mirror.is_none() {
        return None;
    }

    let fields = Fields::new("", raw);
    let photos = fields.list(MIRRORED_PHOTO_FIELDS[0]);
    let photos = if photos.is_empty() {
        fields.list(MIRRORED_PHOTO_FIELDS[1])
    } else {
        photos
    };

    let canonical = encode_list(&photos);
    let in_sync = primary == Some(&canonical) && mirror == Some(&canonical);
    (!in_sync).then_some(photos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::models::User;
    use crate::stores::{KvUserStore, UserStore};

    fn setup() -> (Arc<MemoryKv>, KvUserStore, Reconciler) {
        let kv = Arc::new(MemoryKv::new());
        (
            kv.clone(),
            KvUserStore::new(kv.clone()).without_email_scan(),
            Reconciler::new(kv),
        )
    }

    fn hset(key: &str, pairs: &[(&str, &str)]) -> WriteOp {
        WriteOp::HSet {
            key: key.to_string(),
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn clean_store_reports_nothing() {
        let (_, users, reconciler) = setup();
        users
            .create(User {
                email: Some("a@example.com".into()),
                photos: vec!["1.jpg".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert!(report.is_clean(), "{report:?}");
    }

    #[tokio::test]
    async fn restores_membership_and_email_lookup() {
        let (kv, users, reconciler) = setup();
        kv.batch(vec![hset("user:legacy", &[("email", "Legacy@Example.com")])])
            .await
            .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.membership_added, 1);
        assert_eq!(report.email_lookups_fixed, 1);

        assert!(kv.sismember("users", "legacy").await.unwrap());
        let found = users.find_by_email("legacy@example.com").await.unwrap();
        assert_eq!(found.map(|u| u.id).as_deref(), Some("legacy"));
    }

    #[tokio::test]
    async fn drops_dangling_membership() {
        let (kv, _, reconciler) = setup();
        kv.batch(vec![WriteOp::SAdd {
            key: "users".into(),
            member: "gone".into(),
        }])
        .await
        .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.membership_removed, 1);
        assert!(!kv.sismember("users", "gone").await.unwrap());
    }

    #[tokio::test]
    async fn remirrors_diverged_photos() {
        let (kv, _, reconciler) = setup();
        let double_encoded = serde_json::to_string(r#"["a.jpg"]"#).unwrap();
        kv.batch(vec![
            hset(
                "user:p1",
                &[("photos", double_encoded.as_str()), ("profilePhotos", "[]")],
            ),
            WriteOp::SAdd {
                key: "users".into(),
                member: "p1".into(),
            },
        ])
        .await
        .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.photos_remirrored, 1);

        let raw = kv.hgetall("user:p1").await.unwrap();
        assert_eq!(raw["photos"], r#"["a.jpg"]"#);
        assert_eq!(raw["profilePhotos"], r#"["a.jpg"]"#);
    }

    #[tokio::test]
    async fn second_run_is_clean() {
        let (kv, _, reconciler) = setup();
        kv.batch(vec![
            hset("user:x1", &[("email", "x@example.com"), ("profilePhotos", r#"["b.jpg"]"#)]),
            WriteOp::SAdd {
                key: "users".into(),
                member: "ghost".into(),
            },
        ])
        .await
        .unwrap();

        assert!(!reconciler.run().await.unwrap().is_clean());
        assert!(reconciler.run().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn duplicate_email_is_reported_not_overwritten() {
        let (kv, users, reconciler) = setup();
        let owner = users
            .create(User {
                email: Some("dup@example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        kv.batch(vec![
            hset("user:copy", &[("email", "dup@example.com")]),
            WriteOp::SAdd {
                key: "users".into(),
                member: "copy".into(),
            },
        ])
        .await
        .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.email_conflicts, 1);
        assert_eq!(
            kv.get("user:email:dup@example.com").await.unwrap(),
            Some(owner.id)
        );
    }
}
