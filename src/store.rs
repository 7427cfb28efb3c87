//! Encrypted-at-rest blob storage for keys, certificates, bundles, CRLs and
//! seal images.
//!
//! Every stored payload gets a file record (public metadata) and an encrypted
//! secret holding the bytes. Callers keep both handles; which one they use to
//! read back depends on the material.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, Settings, StorageSettings};
use crate::model::{FileId, SecretId, UserId};

pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
pub const PKCS12_CONTENT_TYPE: &str = "application/x-pkcs12";
pub const CRL_CONTENT_TYPE: &str = "application/pkix-crl";

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("stored payload is corrupted: {0}")]
    Corruption(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Handles returned by [`KeyMaterialStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredHandle {
    pub file_id: FileId,
    pub secret_id: SecretId,
}

/// Size and type limits enforced on typed payloads.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub private_key_max_bytes: usize,
    pub seal_image_max_bytes: usize,
    pub seal_image_content_types: Vec<String>,
}

impl Default for StoreLimits {
    fn default() -> Self {
        StorageSettings::default().into()
    }
}

impl From<StorageSettings> for StoreLimits {
    fn from(settings: StorageSettings) -> Self {
        Self {
            private_key_max_bytes: settings.private_key_max_bytes,
            seal_image_max_bytes: settings.seal_image_max_bytes,
            seal_image_content_types: settings
                .seal_image_content_types
                .iter()
                .map(|ct| ct.trim().to_ascii_lowercase())
                .collect(),
        }
    }
}

/// Key-value blob store with an encrypt/decrypt contract.
pub trait KeyMaterialStore: Send + Sync {
    /// Stores an opaque payload.
    fn store(
        &self,
        data: &[u8],
        content_type: &str,
        owner: Option<UserId>,
    ) -> Result<StoredHandle, StoreError>;

    /// Decrypts a secret by its own handle.
    fn load_secret(&self, secret_id: SecretId) -> Result<Vec<u8>, StoreError>;

    /// Decrypts the payload behind a file handle.
    fn load_file_bytes(&self, file_id: FileId) -> Result<Vec<u8>, StoreError>;

    fn limits(&self) -> &StoreLimits;

    /// Removes both sides of a handle. Used to drop blobs whose owning row
    /// was never committed.
    fn delete(&self, handle: StoredHandle) -> Result<(), StoreError>;

    fn load_private_key(&self, secret_id: SecretId) -> Result<String, StoreError> {
        String::from_utf8(self.load_secret(secret_id)?)
            .map_err(|_| StoreError::Corruption("private key is not valid UTF-8".to_string()))
    }

    fn load_certificate_pem(&self, file_id: FileId) -> Result<String, StoreError> {
        String::from_utf8(self.load_file_bytes(file_id)?)
            .map_err(|_| StoreError::Corruption("certificate is not valid UTF-8".to_string()))
    }

    /// Validates and stores a PEM private key.
    fn store_private_key(
        &self,
        pem: &str,
        owner: Option<UserId>,
    ) -> Result<StoredHandle, StoreError> {
        validate_private_key(pem.as_bytes(), self.limits())?;
        self.store(pem.as_bytes(), PEM_CONTENT_TYPE, owner)
    }

    fn store_certificate_pem(
        &self,
        pem: &str,
        owner: Option<UserId>,
    ) -> Result<StoredHandle, StoreError> {
        self.store(pem.trim().as_bytes(), PEM_CONTENT_TYPE, owner)
    }

    /// Validates and stores a seal image. The content type is normalised to
    /// lowercase.
    fn store_seal_image(
        &self,
        data: &[u8],
        content_type: &str,
        owner: Option<UserId>,
    ) -> Result<StoredHandle, StoreError> {
        let content_type = content_type.trim().to_ascii_lowercase();
        validate_seal_image(data, &content_type, self.limits())?;
        self.store(data, &content_type, owner)
    }
}

fn validate_private_key(payload: &[u8], limits: &StoreLimits) -> Result<(), StoreError> {
    if payload.len() > limits.private_key_max_bytes {
        return Err(StoreError::Validation(
            "private key exceeds configured size limit".to_string(),
        ));
    }
    let text = std::str::from_utf8(payload)
        .map_err(|_| StoreError::Validation("private key must be valid UTF-8 text".to_string()))?;
    let text = text.trim();
    if !(text.starts_with("-----BEGIN") && text.ends_with("END PRIVATE KEY-----")) {
        return Err(StoreError::Validation(
            "private key must be PEM encoded".to_string(),
        ));
    }
    Ok(())
}

fn validate_seal_image(
    payload: &[u8],
    content_type: &str,
    limits: &StoreLimits,
) -> Result<(), StoreError> {
    if payload.len() > limits.seal_image_max_bytes {
        return Err(StoreError::Validation(
            "seal image exceeds configured size limit".to_string(),
        ));
    }
    if !limits
        .seal_image_content_types
        .iter()
        .any(|allowed| allowed == content_type)
    {
        return Err(StoreError::Validation(format!(
            "seal image content type '{content_type}' is not allowed (allowed: {})",
            limits.seal_image_content_types.join(", ")
        )));
    }
    match content_type {
        "image/png" if !payload.starts_with(PNG_MAGIC) => Err(StoreError::Validation(
            "PNG signature mismatch".to_string(),
        )),
        "image/svg+xml" => {
            let text = std::str::from_utf8(payload).map_err(|_| {
                StoreError::Validation("SVG content must be UTF-8 text".to_string())
            })?;
            if !text.to_ascii_lowercase().contains("<svg") {
                return Err(StoreError::Validation(
                    "SVG payload is missing <svg> root element".to_string(),
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Public metadata recorded for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub owner: Option<UserId>,
    pub content_type: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
struct FileRecord {
    info: FileInfo,
    secret_id: SecretId,
}

#[derive(Debug, Clone)]
struct EncryptedSecret {
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

#[derive(Default)]
struct Blobs {
    files: HashMap<FileId, FileRecord>,
    secrets: HashMap<SecretId, EncryptedSecret>,
}

/// In-process [`KeyMaterialStore`] encrypting every payload with AES-256-GCM
/// under a single master key.
pub struct MemoryKeyStore {
    master_key: [u8; 32],
    limits: StoreLimits,
    blobs: Mutex<Blobs>,
}

impl MemoryKeyStore {
    pub fn new(master_key: [u8; 32], limits: StoreLimits) -> Self {
        Self {
            master_key,
            limits,
            blobs: Mutex::new(Blobs::default()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.master_key_bytes()?,
            settings.storage.clone().into(),
        ))
    }

    /// A store with a random master key, for tools and tests that never
    /// need to reopen their data.
    pub fn ephemeral(limits: StoreLimits) -> Result<Self, StoreError> {
        let mut master_key = [0u8; 32];
        rand_bytes(&mut master_key).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self::new(master_key, limits))
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_info(&self, file_id: FileId) -> Option<FileInfo> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.files.get(&file_id).map(|f| f.info.clone())
    }

    fn encrypt(&self, data: &[u8]) -> Result<EncryptedSecret, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand_bytes(&mut nonce).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.master_key,
            Some(&nonce),
            &[],
            data,
            &mut tag,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(EncryptedSecret {
            nonce,
            tag,
            ciphertext,
        })
    }

    fn decrypt(&self, secret: &EncryptedSecret) -> Result<Vec<u8>, StoreError> {
        decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.master_key,
            Some(&secret.nonce),
            &[],
            &secret.ciphertext,
            &secret.tag,
        )
        .map_err(|_| StoreError::Corruption("unable to decrypt payload".to_string()))
    }
}

impl KeyMaterialStore for MemoryKeyStore {
    fn store(
        &self,
        data: &[u8],
        content_type: &str,
        owner: Option<UserId>,
    ) -> Result<StoredHandle, StoreError> {
        let secret = self.encrypt(data)?;
        let handle = StoredHandle {
            file_id: FileId(Uuid::new_v4()),
            secret_id: SecretId(Uuid::new_v4()),
        };

        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.secrets.insert(handle.secret_id, secret);
        blobs.files.insert(
            handle.file_id,
            FileRecord {
                info: FileInfo {
                    owner,
                    content_type: content_type.to_string(),
                    size_bytes: data.len(),
                },
                secret_id: handle.secret_id,
            },
        );
        tracing::debug!(file_id = %handle.file_id, content_type, size = data.len(), "stored blob");
        Ok(handle)
    }

    fn load_secret(&self, secret_id: SecretId) -> Result<Vec<u8>, StoreError> {
        let secret = {
            let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
            blobs
                .secrets
                .get(&secret_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("encrypted secret {secret_id}")))?
        };
        self.decrypt(&secret)
    }

    fn load_file_bytes(&self, file_id: FileId) -> Result<Vec<u8>, StoreError> {
        let secret_id = {
            let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
            blobs
                .files
                .get(&file_id)
                .map(|f| f.secret_id)
                .ok_or_else(|| StoreError::NotFound(format!("file {file_id}")))?
        };
        self.load_secret(secret_id).map_err(|e| match e {
            StoreError::NotFound(_) => {
                StoreError::Corruption("stored file is missing its encrypted payload".to_string())
            }
            e => e,
        })
    }

    fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    fn delete(&self, handle: StoredHandle) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let file = blobs.files.remove(&handle.file_id);
        let secret = blobs.secrets.remove(&handle.secret_id);
        if file.is_none() && secret.is_none() {
            return Err(StoreError::NotFound(format!("file {}", handle.file_id)));
        }
        tracing::debug!(file_id = %handle.file_id, "deleted blob");
        Ok(())
    }
}
