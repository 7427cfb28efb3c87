//! Seal images that can be stamped into visible signatures.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Seal, UserId};
use crate::repository::{AuditRecord, Changeset, Repository, RepositoryError};
use crate::store::{KeyMaterialStore, StoreError};

#[derive(Error, Debug)]
pub enum SealError {
    #[error("invalid seal: {0}")]
    Validation(String),
    #[error("seal {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct SealRegistry {
    repository: Arc<dyn Repository>,
    store: Arc<dyn KeyMaterialStore>,
}

impl SealRegistry {
    pub fn new(repository: Arc<dyn Repository>, store: Arc<dyn KeyMaterialStore>) -> Self {
        Self { repository, store }
    }

    /// Validates and stores a seal image for `owner`.
    pub fn register_seal(
        &self,
        owner: UserId,
        name: &str,
        description: Option<&str>,
        content_type: &str,
        image: &[u8],
    ) -> Result<Seal, SealError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SealError::Validation("seal name must not be empty".to_string()));
        }
        let handle = self.store.store_seal_image(image, content_type, Some(owner))?;

        let now = Utc::now();
        let seal = Seal {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: name.to_string(),
            description: description.map(str::to_string),
            content_type: content_type.trim().to_ascii_lowercase(),
            image_file_id: Some(handle.file_id),
            image_secret_id: Some(handle.secret_id),
            created_at: now,
            updated_at: now,
        };

        let audit = AuditRecord::new(
            Some(owner),
            "seal.uploaded",
            "seal",
            json!({
                "seal_id": seal.id,
                "content_type": seal.content_type,
                "size_bytes": image.len(),
            }),
        );
        let committed = self
            .repository
            .commit(Changeset::new().insert_seal(seal.clone()).audit(audit));
        if let Err(e) = committed {
            if let Err(cleanup) = self.store.delete(handle) {
                warn!(seal = %seal.id, error = %cleanup, "failed to discard seal image");
            }
            return Err(e.into());
        }

        info!(seal = %seal.id, owner, "seal registered");
        Ok(seal)
    }

    pub fn get_seal(&self, id: Uuid) -> Result<Seal, SealError> {
        self.repository.get_seal(id)?.ok_or(SealError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use crate::testing;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn registry() -> (Arc<MemoryRepository>, SealRegistry) {
        let repository = Arc::new(MemoryRepository::new());
        let registry = SealRegistry::new(repository.clone(), Arc::new(testing::key_store()));
        (repository, registry)
    }

    #[test]
    fn registers_and_audits() {
        let (repository, registry) = registry();
        let seal = registry
            .register_seal(7, "Company seal", None, "Image/PNG", PNG)
            .unwrap();
        assert_eq!(seal.content_type, "image/png");
        assert_eq!(registry.get_seal(seal.id).unwrap(), seal);

        let log = repository.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event_type, "seal.uploaded");
        assert_eq!(log[0].actor_id, Some(7));
    }

    #[test]
    fn failed_commit_discards_the_image() {
        let repository = Arc::new(testing::ContendedRepository::default());
        let store = Arc::new(testing::key_store());
        let registry = SealRegistry::new(repository.clone(), store.clone());
        repository.reject_commits();

        assert!(matches!(
            registry.register_seal(7, "Seal", None, "image/png", PNG),
            Err(SealError::Repository(RepositoryError::Conflict(_)))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_bad_images() {
        let (repository, registry) = registry();
        assert!(matches!(
            registry.register_seal(7, "Seal", None, "image/gif", b"GIF89a"),
            Err(SealError::Store(StoreError::Validation(_)))
        ));
        assert!(matches!(
            registry.register_seal(7, "Seal", None, "image/png", b"not a png"),
            Err(SealError::Store(StoreError::Validation(_)))
        ));
        assert!(matches!(
            registry.register_seal(7, "  ", None, "image/png", PNG),
            Err(SealError::Validation(_))
        ));
        assert!(repository.audit_log().is_empty());
    }
}
