//! Persistent records managed by the certificate authority and the signing
//! engine, plus the results handed back to callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = i64;

/// Handle of a stored blob (public material such as PEM or PKCS #12 data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub Uuid);

/// Handle of an encrypted secret (private keys, seal images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretId(pub Uuid);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactType {
    #[serde(rename = "root-certificate")]
    RootCertificate,
    #[serde(rename = "intermediate-certificate")]
    IntermediateCertificate,
    #[serde(rename = "certificate-revocation-list")]
    Crl,
    /// Declared for compatibility with stored data, never produced.
    #[serde(rename = "ocsp-response")]
    OcspResponse,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::RootCertificate => "root-certificate",
            ArtifactType::IntermediateCertificate => "intermediate-certificate",
            ArtifactType::Crl => "certificate-revocation-list",
            ArtifactType::OcspResponse => "ocsp-response",
        }
    }
}

/// A CA-produced artifact other than an end-entity certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaArtifact {
    pub id: Uuid,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub description: Option<String>,
    pub file_id: Option<FileId>,
    /// Only root certificate artifacts reference a private key.
    pub secret_id: Option<SecretId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Active,
    Revoked,
    Expired,
    Pending,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An issued or imported end-entity certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub owner_id: Option<UserId>,
    /// Uppercase hexadecimal, without leading zeros.
    pub serial_number: String,
    pub subject_common_name: String,
    pub subject_organization: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Persisted status. Use [`effective_status`] to take expiry into account.
    pub status: CertificateStatus,
    pub certificate_pem: String,
    /// PKCS #12 bundle.
    pub certificate_file_id: Option<FileId>,
    pub private_key_secret_id: Option<SecretId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a certificate as observed at `now`.
///
/// The persisted status is never rewritten to `expired`; an active
/// certificate past its `expires_at` reads as expired instead.
pub fn effective_status(certificate: &Certificate, now: DateTime<Utc>) -> CertificateStatus {
    match certificate.status {
        CertificateStatus::Active if certificate.expires_at <= now => CertificateStatus::Expired,
        status => status,
    }
}

/// A seal image that can be stamped into visible signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seal {
    pub id: Uuid,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub content_type: String,
    pub image_file_id: Option<FileId>,
    pub image_secret_id: Option<SecretId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureVisibility {
    Visible,
    Invisible,
}

impl FromStr for SignatureVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visible" => Ok(SignatureVisibility::Visible),
            "invisible" => Ok(SignatureVisibility::Invisible),
            other => Err(format!("unknown signature visibility: {other}")),
        }
    }
}

/// Placement of a visible signature. `page` is 1-based; the box is in PDF
/// user space units with its origin at the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignatureCoordinates {
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Optional descriptive entries of the signature dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMetadata {
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
}

/// Outcome of signing one document. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SigningResult {
    pub document_id: String,
    #[serde(skip)]
    pub signed_pdf: Vec<u8>,
    pub signed_at: DateTime<Utc>,
    pub certificate_id: Uuid,
    pub seal_id: Option<Uuid>,
    pub visibility: SignatureVisibility,
    pub tsa_used: bool,
    pub ltv_embedded: bool,
    pub file_size: usize,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn certificate(status: CertificateStatus, expires_at: DateTime<Utc>) -> Certificate {
        let now = Utc::now();
        Certificate {
            id: Uuid::new_v4(),
            owner_id: Some(1),
            serial_number: "1F".to_string(),
            subject_common_name: "Alice".to_string(),
            subject_organization: None,
            issued_at: now - Duration::days(1),
            expires_at,
            status,
            certificate_pem: String::new(),
            certificate_file_id: None,
            private_key_secret_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn active_past_expiry_reads_as_expired() {
        let now = Utc::now();
        let cert = certificate(CertificateStatus::Active, now - Duration::seconds(1));
        assert_eq!(effective_status(&cert, now), CertificateStatus::Expired);

        let cert = certificate(CertificateStatus::Active, now);
        assert_eq!(effective_status(&cert, now), CertificateStatus::Expired);

        let cert = certificate(CertificateStatus::Active, now + Duration::days(1));
        assert_eq!(effective_status(&cert, now), CertificateStatus::Active);
    }

    #[test]
    fn revoked_stays_revoked_after_expiry() {
        let now = Utc::now();
        let cert = certificate(CertificateStatus::Revoked, now - Duration::days(3));
        assert_eq!(effective_status(&cert, now), CertificateStatus::Revoked);
    }

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&ArtifactType::Crl).unwrap(),
            "\"certificate-revocation-list\""
        );
        assert_eq!(
            serde_json::to_string(&CertificateStatus::Revoked).unwrap(),
            "\"revoked\""
        );
        assert_eq!(
            "visible".parse::<SignatureVisibility>().unwrap(),
            SignatureVisibility::Visible
        );
    }
}
