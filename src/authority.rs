//! Certificate authority engine.
//!
//! Owns the single private root CA: generation, issuance and import of
//! end-entity certificates, revocation and CRL generation. Root material is
//! re-read from the repository and key store on every call and never cached.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use der::Decode;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Crl, X509};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crl::{self, RevokedEntry};
use crate::model::{
    effective_status, ArtifactType, CaArtifact, Certificate, CertificateStatus, UserId,
};
use crate::openssl::{
    asn1_time, asn1_time_to_utc, bignum_to_hex, build_name, generate_ec_p256, generate_rsa,
    name_entry, random_serial, same_name, serial_to_hex, TimeError,
};
use crate::repository::{AuditRecord, Changeset, Repository, RepositoryError};
use crate::store::{
    KeyMaterialStore, StoreError, StoredHandle, CRL_CONTENT_TYPE, PKCS12_CONTENT_TYPE,
};

pub const DEFAULT_ROOT_VALIDITY_DAYS: u32 = 3650;
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;
pub const DEFAULT_CRL_NEXT_UPDATE_DAYS: u32 = 7;

/// Asks `PKCS12_create` to leave the key and certificate bags unencrypted.
const PKCS12_NO_ENCRYPTION: Nid = Nid::from_raw(-1);

#[derive(Error, Debug)]
pub enum CaError {
    #[error("root certificate authority already exists")]
    RootCaAlreadyExists,
    #[error("root certificate authority has not been generated")]
    RootCaNotFound,
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("validity must be a positive number of days")]
    InvalidValidity,
    #[error("failed to import PKCS#12 bundle: {0}")]
    Import(String),
    #[error("certificate issuer does not match the managed root CA")]
    ChainMismatch,
    #[error("certificate serial number {0} already exists")]
    DuplicateSerial(String),
    #[error("certificate is already revoked")]
    AlreadyRevoked,
    #[error("cannot revoke an expired certificate")]
    CannotRevokeExpired,
    #[error("failed to generate CRL: {0}")]
    CrlGeneration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("root CA material is unusable: {0}")]
    RootMaterial(String),
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ErrorStack> for CaError {
    fn from(e: ErrorStack) -> Self {
        CaError::Crypto(e.to_string())
    }
}

impl From<TimeError> for CaError {
    fn from(e: TimeError) -> Self {
        CaError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaError>;

/// Key algorithms accepted for the root CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootKeyAlgorithm {
    #[serde(rename = "rsa-4096")]
    Rsa4096,
    #[serde(rename = "ec-p256")]
    EcP256,
}

/// Key algorithms accepted for end-entity certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafKeyAlgorithm {
    #[serde(rename = "rsa-2048")]
    Rsa2048,
    #[serde(rename = "ec-p256")]
    EcP256,
}

impl RootKeyAlgorithm {
    fn generate(self) -> std::result::Result<PKey<Private>, ErrorStack> {
        match self {
            RootKeyAlgorithm::Rsa4096 => generate_rsa(4096),
            RootKeyAlgorithm::EcP256 => generate_ec_p256(),
        }
    }
}

impl LeafKeyAlgorithm {
    fn generate(self) -> std::result::Result<PKey<Private>, ErrorStack> {
        match self {
            LeafKeyAlgorithm::Rsa2048 => generate_rsa(2048),
            LeafKeyAlgorithm::EcP256 => generate_ec_p256(),
        }
    }
}

impl FromStr for RootKeyAlgorithm {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa-4096" => Ok(RootKeyAlgorithm::Rsa4096),
            "ec-p256" => Ok(RootKeyAlgorithm::EcP256),
            other => Err(CaError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl FromStr for LeafKeyAlgorithm {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa-2048" => Ok(LeafKeyAlgorithm::Rsa2048),
            "ec-p256" => Ok(LeafKeyAlgorithm::EcP256),
            other => Err(CaError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for RootKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RootKeyAlgorithm::Rsa4096 => "rsa-4096",
            RootKeyAlgorithm::EcP256 => "ec-p256",
        })
    }
}

impl fmt::Display for LeafKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeafKeyAlgorithm::Rsa2048 => "rsa-2048",
            LeafKeyAlgorithm::EcP256 => "ec-p256",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RootCaResult {
    pub artifact: CaArtifact,
    pub certificate_pem: String,
    pub serial_number: String,
}

/// Parameters of [`CertificateAuthority::issue_certificate`].
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub owner_id: Option<UserId>,
    pub common_name: String,
    pub organization: Option<String>,
    pub algorithm: LeafKeyAlgorithm,
    pub validity_days: u32,
    /// Encrypts the PKCS #12 bundle when present.
    pub p12_passphrase: Option<String>,
}

impl IssueRequest {
    pub fn new(owner_id: Option<UserId>, common_name: &str, algorithm: LeafKeyAlgorithm) -> Self {
        Self {
            owner_id,
            common_name: common_name.to_string(),
            organization: None,
            algorithm,
            validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
            p12_passphrase: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    pub certificate_pem: String,
    /// DER encoded PKCS #12 bundle with the leaf key, leaf certificate and
    /// the root certificate.
    pub pkcs12: Vec<u8>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportedCertificate {
    pub certificate: Certificate,
}

#[derive(Debug, Clone)]
pub struct CrlResult {
    pub artifact: CaArtifact,
    pub crl_pem: String,
    /// Serials included in this CRL. A snapshot, not a live view.
    pub revoked_serials: Vec<String>,
    pub next_update: DateTime<Utc>,
}

/// Parsed root certificate and key, rebuilt on demand.
struct RootMaterial {
    certificate: X509,
    private_key: PKey<Private>,
}

pub struct CertificateAuthority {
    repository: Arc<dyn Repository>,
    store: Arc<dyn KeyMaterialStore>,
}

impl CertificateAuthority {
    pub fn new(repository: Arc<dyn Repository>, store: Arc<dyn KeyMaterialStore>) -> Self {
        Self { repository, store }
    }

    /// Generates the root key pair and self-signed certificate.
    ///
    /// Fails with [`CaError::RootCaAlreadyExists`] if a root artifact is
    /// present, including when a concurrent call wins the race at commit.
    pub fn generate_root_ca(
        &self,
        algorithm: RootKeyAlgorithm,
        common_name: &str,
        organization: Option<&str>,
        actor_id: Option<UserId>,
        validity_days: u32,
    ) -> Result<RootCaResult> {
        if validity_days == 0 {
            return Err(CaError::InvalidValidity);
        }
        if self
            .repository
            .latest_artifact(ArtifactType::RootCertificate)?
            .is_some()
        {
            return Err(CaError::RootCaAlreadyExists);
        }

        let private_key = algorithm.generate()?;
        let name = build_name(common_name, organization)?;
        let serial = random_serial()?;
        let serial_hex = bignum_to_hex(&serial)?;
        let now = Utc::now();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial_number = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&private_key)?;
        let not_before = asn1_time(now - Duration::days(1))?;
        let not_after = asn1_time(now + Duration::days(i64::from(validity_days)))?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        let subject_key_id =
            SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(subject_key_id)?;
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(authority_key_id)?;
        builder.sign(&private_key, MessageDigest::sha256())?;
        let certificate = builder.build();

        let certificate_pem = pem_string(certificate.to_pem()?)?;
        let key_pem = pem_string(private_key.private_key_to_pem_pkcs8()?)?;

        let cert_handle = self.store.store_certificate_pem(&certificate_pem, None)?;
        let key_handle = match self.store.store_private_key(&key_pem, None) {
            Ok(handle) => handle,
            Err(e) => {
                self.discard(&[cert_handle]);
                return Err(e.into());
            }
        };

        let artifact = CaArtifact {
            id: Uuid::new_v4(),
            name: format!("root-ca-{serial_hex}"),
            artifact_type: ArtifactType::RootCertificate,
            description: Some(format!("Root CA {common_name}")),
            file_id: Some(cert_handle.file_id),
            secret_id: Some(key_handle.secret_id),
            created_at: now,
            updated_at: now,
        };

        let audit = AuditRecord::new(
            actor_id,
            "ca.root.created",
            "ca_artifact",
            json!({
                "artifact_id": artifact.id,
                "serial_number": serial_hex,
                "algorithm": algorithm.to_string(),
                "common_name": common_name,
            }),
        );
        self.commit_with_blobs(
            Changeset::new().insert_artifact(artifact.clone()).audit(audit),
            &[cert_handle, key_handle],
        )
        .map_err(|e| match e {
            RepositoryError::Conflict(_) => CaError::RootCaAlreadyExists,
            e => e.into(),
        })?;

        info!(serial = %serial_hex, %algorithm, common_name, "root CA created");

        Ok(RootCaResult {
            artifact,
            certificate_pem,
            serial_number: serial_hex,
        })
    }

    /// PEM of the current root certificate. Never exposes the key.
    pub fn export_root_certificate(&self) -> Result<String> {
        let artifact = self.root_artifact()?;
        let file_id = artifact
            .file_id
            .ok_or_else(|| CaError::RootMaterial("root artifact has no certificate".to_string()))?;
        self.store
            .load_certificate_pem(file_id)
            .map_err(|e| CaError::RootMaterial(e.to_string()))
    }

    /// Parsed root certificate, without its key.
    pub fn root_certificate(&self) -> Result<X509> {
        let pem = self.export_root_certificate()?;
        X509::from_pem(pem.as_bytes()).map_err(|e| CaError::RootMaterial(e.to_string()))
    }

    /// Issues an end-entity certificate signed by the root and packs it
    /// into a PKCS #12 bundle.
    pub fn issue_certificate(
        &self,
        request: IssueRequest,
        actor_id: Option<UserId>,
    ) -> Result<IssuedCertificate> {
        if request.validity_days == 0 {
            return Err(CaError::InvalidValidity);
        }
        let root = self.load_root_material()?;

        let private_key = request.algorithm.generate()?;
        let name = build_name(&request.common_name, request.organization.as_deref())?;
        let serial = random_serial()?;
        let serial_hex = bignum_to_hex(&serial)?;
        let now = Utc::now();
        let issued_at = now - Duration::minutes(1);
        let expires_at = now + Duration::days(i64::from(request.validity_days));

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial_number = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(root.certificate.subject_name())?;
        builder.set_pubkey(&private_key)?;
        let not_before = asn1_time(issued_at)?;
        let not_after = asn1_time(expires_at)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        let subject_key_id = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&root.certificate), None))?;
        builder.append_extension(subject_key_id)?;
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(Some(&root.certificate), None))?;
        builder.append_extension(authority_key_id)?;

        let mut key_usage = KeyUsage::new();
        key_usage.critical().digital_signature();
        match request.algorithm {
            LeafKeyAlgorithm::Rsa2048 => key_usage.key_encipherment(),
            LeafKeyAlgorithm::EcP256 => key_usage.key_agreement(),
        };
        builder.append_extension(key_usage.build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().server_auth().build()?)?;
        builder.sign(&root.private_key, MessageDigest::sha256())?;
        let certificate = builder.build();

        let mut chain = Stack::new()?;
        chain.push(root.certificate.clone())?;
        let mut bundle = Pkcs12::builder();
        bundle
            .name(&request.common_name)
            .pkey(&private_key)
            .cert(&certificate)
            .ca(chain);
        if request.p12_passphrase.is_none() {
            bundle
                .key_algorithm(PKCS12_NO_ENCRYPTION)
                .cert_algorithm(PKCS12_NO_ENCRYPTION);
        }
        let pkcs12 = bundle
            .build2(request.p12_passphrase.as_deref().unwrap_or(""))?
            .to_der()?;

        let certificate_pem = pem_string(certificate.to_pem()?)?;
        let key_pem = pem_string(private_key.private_key_to_pem_pkcs8()?)?;
        let issued_at = asn1_time_to_utc(certificate.not_before())?;
        let expires_at = asn1_time_to_utc(certificate.not_after())?;

        let (key_handle, bundle_handle) =
            self.store_key_and_bundle(&key_pem, &pkcs12, request.owner_id)?;

        let record = Certificate {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            serial_number: serial_hex.clone(),
            subject_common_name: request.common_name.clone(),
            subject_organization: request.organization.clone(),
            issued_at,
            expires_at,
            status: CertificateStatus::Active,
            certificate_pem: certificate_pem.clone(),
            certificate_file_id: Some(bundle_handle.file_id),
            private_key_secret_id: Some(key_handle.secret_id),
            created_at: now,
            updated_at: now,
        };

        let audit = AuditRecord::new(
            actor_id,
            "ca.certificate.issued",
            "certificate",
            json!({
                "certificate_id": record.id,
                "serial_number": serial_hex,
                "owner_id": request.owner_id,
                "algorithm": request.algorithm.to_string(),
                "common_name": request.common_name,
            }),
        );
        self.commit_new_certificate(&record, audit, &[key_handle, bundle_handle])?;

        info!(serial = %serial_hex, owner = ?request.owner_id, "certificate issued");

        Ok(IssuedCertificate {
            certificate: record,
            certificate_pem,
            pkcs12,
            passphrase: request.p12_passphrase,
        })
    }

    /// Imports an externally packed PKCS #12 bundle issued by the managed
    /// root.
    ///
    /// The issuer name must equal the root subject exactly and the
    /// certificate signature must verify under the root public key.
    pub fn import_certificate_from_p12(
        &self,
        owner_id: Option<UserId>,
        bundle: &[u8],
        passphrase: Option<&str>,
        actor_id: Option<UserId>,
    ) -> Result<ImportedCertificate> {
        // Wrong passphrase and malformed input can't be told apart.
        let parsed = Pkcs12::from_der(bundle)
            .and_then(|p12| p12.parse2(passphrase.unwrap_or("")))
            .map_err(|e| CaError::Import(format!("unable to parse bundle: {e}")))?;
        let private_key = parsed
            .pkey
            .ok_or_else(|| CaError::Import("bundle does not contain a private key".to_string()))?;
        let certificate = parsed
            .cert
            .ok_or_else(|| CaError::Import("bundle does not contain a certificate".to_string()))?;

        if !certificate.public_key()?.public_eq(&private_key) {
            return Err(CaError::Import(
                "private key does not match the certificate".to_string(),
            ));
        }

        let root = self.root_certificate()?;
        if !same_name(certificate.issuer_name(), root.subject_name())? {
            return Err(CaError::ChainMismatch);
        }
        let root_key = root.public_key()?;
        if !certificate.verify(&root_key).unwrap_or(false) {
            return Err(CaError::ChainMismatch);
        }

        let serial_hex = serial_to_hex(certificate.serial_number())?;
        if self
            .repository
            .certificate_by_serial(&serial_hex)?
            .is_some()
        {
            return Err(CaError::DuplicateSerial(serial_hex));
        }

        let subject = certificate.subject_name();
        let common_name = match name_entry(subject, Nid::COMMONNAME) {
            Some(cn) => cn,
            None => rfc4514_subject(&certificate)?,
        };
        let organization = name_entry(subject, Nid::ORGANIZATIONNAME);

        let certificate_pem = pem_string(certificate.to_pem()?)?;
        let key_pem = pem_string(private_key.private_key_to_pem_pkcs8()?)?;
        let issued_at = asn1_time_to_utc(certificate.not_before())?;
        let expires_at = asn1_time_to_utc(certificate.not_after())?;
        let (key_handle, bundle_handle) = self.store_key_and_bundle(&key_pem, bundle, owner_id)?;

        let now = Utc::now();
        let record = Certificate {
            id: Uuid::new_v4(),
            owner_id,
            serial_number: serial_hex.clone(),
            subject_common_name: common_name,
            subject_organization: organization,
            issued_at,
            expires_at,
            status: CertificateStatus::Active,
            certificate_pem,
            certificate_file_id: Some(bundle_handle.file_id),
            private_key_secret_id: Some(key_handle.secret_id),
            created_at: now,
            updated_at: now,
        };

        let audit = AuditRecord::new(
            actor_id,
            "ca.certificate.imported",
            "certificate",
            json!({
                "certificate_id": record.id,
                "serial_number": serial_hex,
                "owner_id": owner_id,
            }),
        );
        self.commit_new_certificate(&record, audit, &[key_handle, bundle_handle])?;

        info!(serial = %serial_hex, owner = ?owner_id, "certificate imported");

        Ok(ImportedCertificate {
            certificate: record,
        })
    }

    /// Marks a certificate as revoked. The transition is one-way.
    pub fn revoke_certificate(
        &self,
        certificate: &Certificate,
        actor_id: Option<UserId>,
    ) -> Result<Certificate> {
        let current = self
            .repository
            .get_certificate(certificate.id)?
            .ok_or_else(|| CaError::NotFound(format!("certificate {}", certificate.id)))?;

        let now = Utc::now();
        match effective_status(&current, now) {
            CertificateStatus::Revoked => return Err(CaError::AlreadyRevoked),
            CertificateStatus::Expired => return Err(CaError::CannotRevokeExpired),
            CertificateStatus::Active | CertificateStatus::Pending => {}
        }

        let mut revoked = current.clone();
        revoked.status = CertificateStatus::Revoked;
        revoked.updated_at = now;

        let audit = AuditRecord::new(
            actor_id,
            "ca.certificate.revoked",
            "certificate",
            json!({
                "certificate_id": revoked.id,
                "serial_number": revoked.serial_number,
            }),
        );
        self.repository
            .commit(
                Changeset::new()
                    .update_certificate_from(revoked.clone(), current.status)
                    .audit(audit),
            )
            .map_err(|e| match e {
                // Lost a race against another revocation.
                RepositoryError::Conflict(_) => CaError::AlreadyRevoked,
                e => e.into(),
            })?;

        info!(serial = %revoked.serial_number, "certificate revoked");
        Ok(revoked)
    }

    /// Generates and stores a CRL listing every revoked certificate.
    pub fn generate_crl(
        &self,
        actor_id: Option<UserId>,
        next_update_days: u32,
    ) -> Result<CrlResult> {
        if next_update_days == 0 {
            return Err(CaError::InvalidValidity);
        }
        let root = self.load_root_material()?;

        let revoked = self
            .repository
            .certificates_with_status(CertificateStatus::Revoked)?;
        let entries: Vec<RevokedEntry> = revoked
            .iter()
            .map(|c| RevokedEntry {
                serial_hex: c.serial_number.clone(),
                revoked_at: c.updated_at,
            })
            .collect();

        let now = Utc::now();
        let next_update = now + Duration::days(i64::from(next_update_days));
        let crl_der = crl::build_crl(
            &root.certificate,
            &root.private_key,
            &entries,
            now,
            next_update,
        )
        .map_err(|e| CaError::CrlGeneration(e.to_string()))?;
        let crl_pem = pem_string(
            X509Crl::from_der(&crl_der)
                .and_then(|crl| crl.to_pem())
                .map_err(|e| CaError::CrlGeneration(e.to_string()))?,
        )?;

        let handle = self.store.store(crl_pem.as_bytes(), CRL_CONTENT_TYPE, None)?;
        let revoked_serials: Vec<String> = entries.into_iter().map(|e| e.serial_hex).collect();

        let artifact = CaArtifact {
            id: Uuid::new_v4(),
            name: format!("crl-{}", Uuid::new_v4().simple()),
            artifact_type: ArtifactType::Crl,
            description: Some(format!(
                "CRL with {} revoked certificate(s)",
                revoked_serials.len()
            )),
            file_id: Some(handle.file_id),
            secret_id: None,
            created_at: now,
            updated_at: now,
        };

        let audit = AuditRecord::new(
            actor_id,
            "ca.crl.generated",
            "ca_artifact",
            json!({
                "artifact_id": artifact.id,
                "revoked_count": revoked_serials.len(),
                "next_update": next_update,
            }),
        );
        self.commit_with_blobs(
            Changeset::new().insert_artifact(artifact.clone()).audit(audit),
            &[handle],
        )?;

        info!(revoked = revoked_serials.len(), "CRL generated");

        Ok(CrlResult {
            artifact,
            crl_pem,
            revoked_serials,
            next_update,
        })
    }

    /// CRL artifacts, newest first.
    pub fn list_crls(&self) -> Result<Vec<CaArtifact>> {
        Ok(self.repository.list_artifacts(ArtifactType::Crl)?)
    }

    pub fn load_crl_pem(&self, artifact_id: Uuid) -> Result<String> {
        let artifact = self
            .repository
            .get_artifact(artifact_id)?
            .filter(|a| a.artifact_type == ArtifactType::Crl)
            .ok_or_else(|| CaError::NotFound(format!("CRL artifact {artifact_id}")))?;
        let file_id = artifact
            .file_id
            .ok_or_else(|| CaError::NotFound(format!("file of CRL artifact {artifact_id}")))?;
        self.store.load_certificate_pem(file_id).map_err(|e| match e {
            StoreError::NotFound(what) => CaError::NotFound(what),
            e => e.into(),
        })
    }

    /// DER of the most recent CRL, if any was generated.
    pub fn latest_crl_der(&self) -> Result<Option<Vec<u8>>> {
        let Some(artifact) = self.repository.latest_artifact(ArtifactType::Crl)? else {
            return Ok(None);
        };
        let pem = self.load_crl_pem(artifact.id)?;
        Ok(Some(X509Crl::from_pem(pem.as_bytes())?.to_der()?))
    }

    /// Certificates of `owner` (or every certificate), with expiry applied
    /// to the reported status.
    pub fn list_certificates(&self, owner: Option<UserId>) -> Result<Vec<Certificate>> {
        let now = Utc::now();
        Ok(self
            .repository
            .list_certificates(owner)?
            .into_iter()
            .map(|mut c| {
                c.status = effective_status(&c, now);
                c
            })
            .collect())
    }

    pub fn get_certificate(&self, id: Uuid) -> Result<Certificate> {
        self.repository
            .get_certificate(id)?
            .ok_or_else(|| CaError::NotFound(format!("certificate {id}")))
    }

    /// The stored PKCS #12 bundle of a certificate.
    pub fn load_certificate_bundle(&self, certificate: &Certificate) -> Result<Vec<u8>> {
        let file_id = certificate.certificate_file_id.ok_or_else(|| {
            CaError::NotFound(format!("bundle of certificate {}", certificate.id))
        })?;
        Ok(self.store.load_file_bytes(file_id)?)
    }

    fn root_artifact(&self) -> Result<CaArtifact> {
        self.repository
            .latest_artifact(ArtifactType::RootCertificate)?
            .ok_or(CaError::RootCaNotFound)
    }

    fn load_root_material(&self) -> Result<RootMaterial> {
        let artifact = self.root_artifact()?;
        let secret_id = artifact
            .secret_id
            .ok_or_else(|| CaError::RootMaterial("root artifact has no private key".to_string()))?;

        let certificate = self.root_certificate()?;
        let key_pem = self
            .store
            .load_private_key(secret_id)
            .map_err(|e| CaError::RootMaterial(e.to_string()))?;
        let private_key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| CaError::RootMaterial(e.to_string()))?;

        Ok(RootMaterial {
            certificate,
            private_key,
        })
    }

    fn commit_new_certificate(
        &self,
        record: &Certificate,
        audit: AuditRecord,
        handles: &[StoredHandle],
    ) -> Result<()> {
        self.commit_with_blobs(
            Changeset::new()
                .insert_certificate(record.clone())
                .audit(audit),
            handles,
        )
        .map_err(|e| match e {
            RepositoryError::Conflict(reason) => {
                warn!(serial = %record.serial_number, %reason, "certificate insert conflict");
                CaError::DuplicateSerial(record.serial_number.clone())
            }
            e => e.into(),
        })
    }

    /// Private key and PKCS #12 bundle of a new certificate row.
    fn store_key_and_bundle(
        &self,
        key_pem: &str,
        bundle: &[u8],
        owner_id: Option<UserId>,
    ) -> Result<(StoredHandle, StoredHandle)> {
        let key_handle = self.store.store_private_key(key_pem, owner_id)?;
        match self.store.store(bundle, PKCS12_CONTENT_TYPE, owner_id) {
            Ok(bundle_handle) => Ok((key_handle, bundle_handle)),
            Err(e) => {
                self.discard(&[key_handle]);
                Err(e.into())
            }
        }
    }

    /// Commits `changeset`. On failure the blobs written for it are deleted
    /// so the key store does not keep rows that were never recorded.
    fn commit_with_blobs(
        &self,
        changeset: Changeset,
        handles: &[StoredHandle],
    ) -> std::result::Result<(), RepositoryError> {
        self.repository
            .commit(changeset)
            .inspect_err(|_| self.discard(handles))
    }

    fn discard(&self, handles: &[StoredHandle]) {
        for handle in handles {
            if let Err(e) = self.store.delete(*handle) {
                warn!(file_id = %handle.file_id, error = %e, "failed to discard orphaned blob");
            }
        }
    }
}

fn pem_string(pem: Vec<u8>) -> Result<String> {
    String::from_utf8(pem).map_err(|e| CaError::Crypto(e.to_string()))
}

/// RFC 4514 rendering of the subject, used when it has no common name.
fn rfc4514_subject(certificate: &X509) -> Result<String> {
    let der = certificate.to_der()?;
    let parsed: x509_cert::Certificate =
        x509_cert::Certificate::from_der(&der).map_err(|e| CaError::Import(e.to_string()))?;
    Ok(parsed.tbs_certificate.subject.to_string())
}
