//! Persistence and audit contract.
//!
//! Writes are grouped into a [`Changeset`] and applied all-or-nothing, so an
//! audit record is stored together with the row that triggered it or not at
//! all. Uniqueness rules live here and not in the engines:
//!
//! * artifact names are unique;
//! * at most one root certificate artifact exists;
//! * certificate serial numbers are unique.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ArtifactType, CaArtifact, Certificate, CertificateStatus, Seal, UserId};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("uniqueness constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("repository backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub actor_id: Option<UserId>,
    pub event_type: String,
    pub resource: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor_id: Option<UserId>,
        event_type: &str,
        resource: &str,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            actor_id,
            event_type: event_type.to_string(),
            resource: resource.to_string(),
            metadata,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Change {
    InsertArtifact(CaArtifact),
    InsertCertificate(Certificate),
    /// Replaces the row with the same id. When `expected_status` is set the
    /// stored status must still equal it.
    UpdateCertificate {
        certificate: Certificate,
        expected_status: Option<CertificateStatus>,
    },
    InsertSeal(Seal),
    Audit(AuditRecord),
}

/// Ordered list of writes committed atomically.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_artifact(mut self, artifact: CaArtifact) -> Self {
        self.changes.push(Change::InsertArtifact(artifact));
        self
    }

    pub fn insert_certificate(mut self, certificate: Certificate) -> Self {
        self.changes.push(Change::InsertCertificate(certificate));
        self
    }

    pub fn update_certificate(mut self, certificate: Certificate) -> Self {
        self.changes.push(Change::UpdateCertificate {
            certificate,
            expected_status: None,
        });
        self
    }

    /// Compare-and-set on the stored status.
    pub fn update_certificate_from(
        mut self,
        certificate: Certificate,
        expected_status: CertificateStatus,
    ) -> Self {
        self.changes.push(Change::UpdateCertificate {
            certificate,
            expected_status: Some(expected_status),
        });
        self
    }

    pub fn insert_seal(mut self, seal: Seal) -> Self {
        self.changes.push(Change::InsertSeal(seal));
        self
    }

    pub fn audit(mut self, record: AuditRecord) -> Self {
        self.changes.push(Change::Audit(record));
        self
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }
}

pub trait Repository: Send + Sync {
    /// Most recently created artifact of the given type.
    fn latest_artifact(&self, artifact_type: ArtifactType) -> Result<Option<CaArtifact>>;

    fn get_artifact(&self, id: Uuid) -> Result<Option<CaArtifact>>;

    /// Artifacts of the given type, newest first.
    fn list_artifacts(&self, artifact_type: ArtifactType) -> Result<Vec<CaArtifact>>;

    fn get_certificate(&self, id: Uuid) -> Result<Option<Certificate>>;

    fn certificate_by_serial(&self, serial_number: &str) -> Result<Option<Certificate>>;

    /// Certificates of one owner, or all of them, newest first.
    fn list_certificates(&self, owner: Option<UserId>) -> Result<Vec<Certificate>>;

    /// Certificates whose persisted status equals `status`.
    fn certificates_with_status(&self, status: CertificateStatus) -> Result<Vec<Certificate>>;

    fn get_seal(&self, id: Uuid) -> Result<Option<Seal>>;

    /// Applies every change or none of them.
    fn commit(&self, changeset: Changeset) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct Tables {
    artifacts: Vec<CaArtifact>,
    certificates: Vec<Certificate>,
    seals: Vec<Seal>,
    audit: Vec<AuditRecord>,
}

impl Tables {
    fn apply(&mut self, change: Change) -> Result<()> {
        match change {
            Change::InsertArtifact(artifact) => {
                if self.artifacts.iter().any(|a| a.name == artifact.name) {
                    return Err(RepositoryError::Conflict(format!(
                        "artifact name {} already exists",
                        artifact.name
                    )));
                }
                if artifact.artifact_type == ArtifactType::RootCertificate
                    && self
                        .artifacts
                        .iter()
                        .any(|a| a.artifact_type == ArtifactType::RootCertificate)
                {
                    return Err(RepositoryError::Conflict(
                        "a root certificate artifact already exists".to_string(),
                    ));
                }
                self.artifacts.push(artifact);
            }
            Change::InsertCertificate(certificate) => {
                if self
                    .certificates
                    .iter()
                    .any(|c| c.serial_number == certificate.serial_number)
                {
                    return Err(RepositoryError::Conflict(format!(
                        "serial number {} already exists",
                        certificate.serial_number
                    )));
                }
                self.certificates.push(certificate);
            }
            Change::UpdateCertificate {
                certificate,
                expected_status,
            } => {
                if self
                    .certificates
                    .iter()
                    .any(|c| c.serial_number == certificate.serial_number && c.id != certificate.id)
                {
                    return Err(RepositoryError::Conflict(format!(
                        "serial number {} already exists",
                        certificate.serial_number
                    )));
                }
                let slot = self
                    .certificates
                    .iter_mut()
                    .find(|c| c.id == certificate.id)
                    .ok_or_else(|| {
                        RepositoryError::NotFound(format!("certificate {}", certificate.id))
                    })?;
                if let Some(expected) = expected_status {
                    if slot.status != expected {
                        return Err(RepositoryError::Conflict(format!(
                            "certificate {} is {}, expected {}",
                            certificate.id, slot.status, expected
                        )));
                    }
                }
                *slot = certificate;
            }
            Change::InsertSeal(seal) => self.seals.push(seal),
            Change::Audit(record) => self.audit.push(record),
        }
        Ok(())
    }
}

/// Mutex-guarded in-process [`Repository`].
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.tables().audit.clone()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for MemoryRepository {
    fn latest_artifact(&self, artifact_type: ArtifactType) -> Result<Option<CaArtifact>> {
        Ok(self.list_artifacts(artifact_type)?.into_iter().next())
    }

    fn get_artifact(&self, id: Uuid) -> Result<Option<CaArtifact>> {
        Ok(self.tables().artifacts.iter().find(|a| a.id == id).cloned())
    }

    fn list_artifacts(&self, artifact_type: ArtifactType) -> Result<Vec<CaArtifact>> {
        let mut artifacts: Vec<CaArtifact> = self
            .tables()
            .artifacts
            .iter()
            .rev()
            .filter(|a| a.artifact_type == artifact_type)
            .cloned()
            .collect();
        // Stable sort keeps reverse insertion order among equal timestamps.
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(artifacts)
    }

    fn get_certificate(&self, id: Uuid) -> Result<Option<Certificate>> {
        Ok(self.tables().certificates.iter().find(|c| c.id == id).cloned())
    }

    fn certificate_by_serial(&self, serial_number: &str) -> Result<Option<Certificate>> {
        Ok(self
            .tables()
            .certificates
            .iter()
            .find(|c| c.serial_number == serial_number)
            .cloned())
    }

    fn list_certificates(&self, owner: Option<UserId>) -> Result<Vec<Certificate>> {
        let mut certificates: Vec<Certificate> = self
            .tables()
            .certificates
            .iter()
            .rev()
            .filter(|c| owner.is_none() || c.owner_id == owner)
            .cloned()
            .collect();
        certificates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(certificates)
    }

    fn certificates_with_status(&self, status: CertificateStatus) -> Result<Vec<Certificate>> {
        Ok(self
            .tables()
            .certificates
            .iter()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    fn get_seal(&self, id: Uuid) -> Result<Option<Seal>> {
        Ok(self.tables().seals.iter().find(|s| s.id == id).cloned())
    }

    fn commit(&self, changeset: Changeset) -> Result<()> {
        let mut tables = self.tables();
        let mut staged = tables.clone();
        for change in changeset.changes {
            staged.apply(change)?;
        }
        *tables = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn artifact(name: &str, artifact_type: ArtifactType) -> CaArtifact {
        let now = Utc::now();
        CaArtifact {
            id: Uuid::new_v4(),
            name: name.to_string(),
            artifact_type,
            description: None,
            file_id: None,
            secret_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let repo = MemoryRepository::new();
        repo.commit(
            Changeset::new()
                .insert_artifact(artifact("root-ca-01", ArtifactType::RootCertificate))
                .audit(AuditRecord::new(Some(1), "ca.root.created", "ca_artifact", json!({}))),
        )
        .unwrap();

        let err = repo
            .commit(
                Changeset::new()
                    .insert_artifact(artifact("root-ca-02", ArtifactType::RootCertificate))
                    .audit(AuditRecord::new(Some(1), "ca.root.created", "ca_artifact", json!({}))),
            )
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Neither the second artifact nor its audit record was written.
        assert_eq!(repo.list_artifacts(ArtifactType::RootCertificate).unwrap().len(), 1);
        assert_eq!(repo.audit_log().len(), 1);
    }

    #[test]
    fn artifact_names_are_unique() {
        let repo = MemoryRepository::new();
        repo.commit(Changeset::new().insert_artifact(artifact("crl-a", ArtifactType::Crl)))
            .unwrap();
        assert!(matches!(
            repo.commit(Changeset::new().insert_artifact(artifact("crl-a", ArtifactType::Crl))),
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[test]
    fn conditional_update_detects_stale_status() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let certificate = Certificate {
            id: Uuid::new_v4(),
            owner_id: Some(1),
            serial_number: "0A".to_string(),
            subject_common_name: "Alice".to_string(),
            subject_organization: None,
            issued_at: now,
            expires_at: now + chrono::Duration::days(1),
            status: CertificateStatus::Active,
            certificate_pem: String::new(),
            certificate_file_id: None,
            private_key_secret_id: None,
            created_at: now,
            updated_at: now,
        };
        repo.commit(Changeset::new().insert_certificate(certificate.clone()))
            .unwrap();

        let mut revoked = certificate.clone();
        revoked.status = CertificateStatus::Revoked;
        let revoke = || {
            Changeset::new().update_certificate_from(revoked.clone(), CertificateStatus::Active)
        };
        repo.commit(revoke()).unwrap();
        assert!(matches!(
            repo.commit(revoke()),
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(
            repo.certificate_by_serial("0A").unwrap().unwrap().status,
            CertificateStatus::Revoked
        );
    }

    #[test]
    fn artifacts_are_listed_newest_first() {
        let repo = MemoryRepository::new();
        let older = artifact("crl-old", ArtifactType::Crl);
        let mut newer = artifact("crl-new", ArtifactType::Crl);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        repo.commit(Changeset::new().insert_artifact(older).insert_artifact(newer))
            .unwrap();

        let names: Vec<_> = repo
            .list_artifacts(ArtifactType::Crl)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["crl-new", "crl-old"]);
        assert_eq!(
            repo.latest_artifact(ArtifactType::Crl).unwrap().unwrap().name,
            "crl-new"
        );
        assert!(repo
            .latest_artifact(ArtifactType::RootCertificate)
            .unwrap()
            .is_none());
    }
}
