//! Verification of every signature embedded in a PDF against the managed
//! root certificate.
//!
//! Nothing is fetched from the network: trust is decided by the root alone
//! and time-stamps are checked against the same root.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lopdf::Document;
use openssl::nid::Nid;
use openssl::pkcs7::Pkcs7;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::authority::CertificateAuthority;
use crate::embedded::{signature_fields, Signature, SignatureKind};
use crate::increment_validation::{classify_unsigned_increment, verify_increment};
use crate::openssl::{join_ranges, name_entry, serial_to_hex, Pkcs7Verifier};
use crate::timestamp::{check_token, TimestampCheck};

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("root CA unavailable: {0}")]
    RootCa(String),
}

/// Where the trust anchor for verification comes from.
pub trait TrustRootSource: Send + Sync {
    fn root_certificate_pem(&self) -> Result<String, VerificationError>;
}

impl TrustRootSource for CertificateAuthority {
    fn root_certificate_pem(&self) -> Result<String, VerificationError> {
        self.export_root_certificate()
            .map_err(|e| VerificationError::RootCa(e.to_string()))
    }
}

/// A fixed root certificate, in PEM.
#[derive(Debug, Clone)]
pub struct PemTrustRoot(pub String);

impl TrustRootSource for PemTrustRoot {
    fn root_certificate_pem(&self) -> Result<String, VerificationError> {
        Ok(self.0.clone())
    }
}

/// How much a document changed after a signature, from least to most
/// intrusive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ModificationLevel {
    None,
    /// Document time-stamps and `/DSS` validation material.
    LtaUpdates,
    /// New signatures and changed form field values.
    FormFilling,
    Annotations,
    Other,
}

impl ModificationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ModificationLevel::None => "none",
            ModificationLevel::LtaUpdates => "lta_updates",
            ModificationLevel::FormFilling => "form_filling",
            ModificationLevel::Annotations => "annotations",
            ModificationLevel::Other => "other",
        }
    }
}

impl fmt::Display for ModificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether DocMDP permission `permission` allows changes up to `level`.
///
/// Values other than 1 and 3 are read as the default, 2.
pub fn docmdp_permits(permission: i64, level: ModificationLevel) -> bool {
    let allowed = match permission {
        1 => ModificationLevel::LtaUpdates,
        3 => ModificationLevel::Annotations,
        _ => ModificationLevel::FormFilling,
    };
    level <= allowed
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureReport {
    pub field_name: String,
    pub valid: bool,
    pub trusted: bool,
    pub docmdp_ok: Option<bool>,
    pub modification_level: Option<ModificationLevel>,
    pub signing_time: Option<DateTime<Utc>>,
    pub signer_common_name: Option<String>,
    pub signer_serial_number: Option<String>,
    pub summary: String,
    pub timestamp: Option<TimestampCheck>,
    pub error: Option<String>,
}

impl SignatureReport {
    fn failed(field_name: &str, error: String) -> Self {
        Self {
            field_name: field_name.to_string(),
            valid: false,
            trusted: false,
            docmdp_ok: None,
            modification_level: None,
            signing_time: None,
            signer_common_name: None,
            signer_serial_number: None,
            summary: "signature could not be verified".to_string(),
            timestamp: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub total_signatures: usize,
    pub valid_signatures: usize,
    pub trusted_signatures: usize,
    pub signatures: Vec<SignatureReport>,
}

impl VerificationReport {
    fn new(signatures: Vec<SignatureReport>) -> Self {
        Self {
            total_signatures: signatures.len(),
            valid_signatures: signatures.iter().filter(|s| s.valid).count(),
            trusted_signatures: signatures.iter().filter(|s| s.trusted).count(),
            signatures,
        }
    }

    pub fn all_valid(&self) -> bool {
        self.total_signatures > 0 && self.valid_signatures == self.total_signatures
    }

    pub fn all_trusted(&self) -> bool {
        self.total_signatures > 0 && self.trusted_signatures == self.total_signatures
    }
}

pub struct VerificationEngine {
    trust_root: Arc<dyn TrustRootSource>,
}

impl VerificationEngine {
    pub fn new(trust_root: Arc<dyn TrustRootSource>) -> Self {
        Self { trust_root }
    }

    /// Verifies every signature in `pdf_bytes`.
    ///
    /// Only unusable input and a missing root fail the call. Problems with
    /// an individual signature are reported in its entry, and the report
    /// always has one entry per signature field.
    pub fn verify_pdf(&self, pdf_bytes: &[u8]) -> Result<VerificationReport, VerificationError> {
        if pdf_bytes.is_empty() {
            return Err(VerificationError::Input("PDF is empty".to_string()));
        }
        if !pdf_bytes.starts_with(b"%PDF-") {
            return Err(VerificationError::Input(
                "not a PDF: missing %PDF- header".to_string(),
            ));
        }

        let doc = Document::load_mem(pdf_bytes)
            .map_err(|e| VerificationError::Input(format!("PDF can not be parsed: {e}")))?;
        let fields = signature_fields(pdf_bytes, &doc).map_err(|e| {
            VerificationError::Input(format!("signature fields can not be read: {e}"))
        })?;
        if !fields.iter().any(|f| f.kind == SignatureKind::Approval) {
            return Err(VerificationError::Input("PDF has no signatures".to_string()));
        }

        let root_pem = self.trust_root.root_certificate_pem()?;
        let verifier = X509::from_pem(root_pem.as_bytes())
            .and_then(|root| Pkcs7Verifier::new(&root))
            .map_err(|e| VerificationError::RootCa(e.to_string()))?;

        let mut signatures = Vec::new();
        let mut failed = Vec::new();
        for field in fields {
            match (field.signature, field.kind) {
                (Ok(signature), _) => signatures.push((field.name, signature)),
                (Err(e), SignatureKind::Approval) => {
                    warn!(field = %field.name, error = %e, "signature can not be extracted");
                    failed.push(SignatureReport::failed(&field.name, e.to_string()));
                }
                (Err(e), SignatureKind::DocTimeStamp) => {
                    warn!(
                        field = %field.name,
                        error = %e,
                        "ignoring unreadable document time-stamp"
                    );
                }
            }
        }

        // Revision order: every signature covers the ones before it.
        signatures.sort_by_key(|(_, s)| s.coverage_end);
        let levels = modification_levels(pdf_bytes, &doc, &signatures);

        let mut reports: Vec<SignatureReport> = Vec::new();
        for ((name, signature), level) in signatures.iter().zip(levels) {
            match signature.kind {
                SignatureKind::Approval => {
                    reports.push(check_approval(pdf_bytes, &verifier, name, signature, level));
                }
                SignatureKind::DocTimeStamp => {
                    let check = check_doc_timestamp(pdf_bytes, &verifier, signature);
                    match reports.last_mut() {
                        Some(previous) if previous.timestamp.is_none() => {
                            previous.timestamp = Some(check);
                        }
                        _ => debug!(
                            field = %name,
                            "document time-stamp not attached to a signature"
                        ),
                    }
                }
            }
        }
        reports.extend(failed);

        let report = VerificationReport::new(reports);
        info!(
            total = report.total_signatures,
            valid = report.valid_signatures,
            trusted = report.trusted_signatures,
            "PDF verified"
        );
        Ok(report)
    }
}

/// Level of the changes made after each signature, given in revision
/// order. A signature is affected by every later revision, so its level is
/// the highest among the increments that follow it.
fn modification_levels(
    pdf_bytes: &[u8],
    doc: &Document,
    signatures: &[(String, Signature)],
) -> Vec<ModificationLevel> {
    let mut levels: Vec<ModificationLevel> = signatures
        .iter()
        .enumerate()
        .map(|(i, (_, signature))| match signatures.get(i + 1) {
            Some((_, next)) => signed_increment_level(pdf_bytes, signature, next),
            None if signature.coverage_end == pdf_bytes.len() => ModificationLevel::None,
            None => unsigned_increment_level(pdf_bytes, doc, signature),
        })
        .collect();

    let mut highest = ModificationLevel::None;
    for level in levels.iter_mut().rev() {
        highest = highest.max(*level);
        *level = highest;
    }
    levels
}

/// Level of the increment from `signature`'s revision to `next`'s.
fn signed_increment_level(
    pdf_bytes: &[u8],
    signature: &Signature,
    next: &Signature,
) -> ModificationLevel {
    let check = || -> anyhow::Result<()> {
        let curr_doc = Document::load_mem(&pdf_bytes[..next.coverage_end])?;
        let prev_doc = Document::load_mem(&pdf_bytes[..signature.coverage_end])?;
        if let Some(widget) = verify_increment(next, &curr_doc, &prev_doc)? {
            debug!(
                signature = ?next.obj_id,
                page = widget.page_number,
                rect = ?widget.rect,
                "later signature adds a widget"
            );
        }
        Ok(())
    };
    match check() {
        Ok(()) => match next.kind {
            SignatureKind::Approval => ModificationLevel::FormFilling,
            SignatureKind::DocTimeStamp => ModificationLevel::LtaUpdates,
        },
        Err(e) => {
            debug!(error = %e, "increment does not only add a signature");
            ModificationLevel::Other
        }
    }
}

/// Level of the unsigned revisions after the last signature.
fn unsigned_increment_level(
    pdf_bytes: &[u8],
    doc: &Document,
    signature: &Signature,
) -> ModificationLevel {
    let level = Document::load_mem(&pdf_bytes[..signature.coverage_end])
        .map_err(anyhow::Error::from)
        .and_then(|prev_doc| classify_unsigned_increment(doc, &prev_doc));
    level.unwrap_or_else(|e| {
        debug!(error = %e, "unsigned increment changes the document");
        ModificationLevel::Other
    })
}

fn check_approval(
    pdf_bytes: &[u8],
    verifier: &Pkcs7Verifier,
    field_name: &str,
    signature: &Signature,
    level: ModificationLevel,
) -> SignatureReport {
    let pkcs7 = match Pkcs7::from_der(&signature.contents) {
        Ok(pkcs7) => pkcs7,
        Err(e) => {
            warn!(field = field_name, error = %e, "signature container can not be parsed");
            return SignatureReport::failed(
                field_name,
                format!("signature container can not be parsed: {e}"),
            );
        }
    };
    let signed_data = join_ranges(pdf_bytes, &signature.signed_byte_ranges());

    let valid = match verifier.check_integrity(&pkcs7, &signed_data) {
        Ok(()) => true,
        Err(e) => {
            debug!(field = field_name, error = %e, "signature does not match");
            false
        }
    };
    let trusted = valid
        && match verifier.check_trust(&pkcs7, &signed_data) {
            Ok(()) => true,
            Err(e) => {
                debug!(field = field_name, error = %e, "signer does not chain to the root");
                false
            }
        };

    let signer = verifier.signer(&pkcs7);
    let signer_common_name = signer
        .as_ref()
        .and_then(|cert| name_entry(cert.subject_name(), Nid::COMMONNAME));
    let signer_serial_number = signer
        .as_ref()
        .and_then(|cert| serial_to_hex(cert.serial_number()).ok());

    let summary = match (valid, trusted) {
        (true, true) => "signature is valid and trusted",
        (true, false) => "signature is valid but the signer is not trusted",
        _ => "signature does not match the signed data",
    };

    SignatureReport {
        field_name: field_name.to_string(),
        valid,
        trusted,
        docmdp_ok: signature
            .docmdp_permission
            .map(|permission| docmdp_permits(permission, level)),
        modification_level: Some(level),
        signing_time: signature.signing_time,
        signer_common_name,
        signer_serial_number,
        summary: summary.to_string(),
        timestamp: None,
        error: None,
    }
}

fn check_doc_timestamp(
    pdf_bytes: &[u8],
    verifier: &Pkcs7Verifier,
    signature: &Signature,
) -> TimestampCheck {
    let stamped = join_ranges(pdf_bytes, &signature.signed_byte_ranges());
    check_token(&signature.contents, &stamped, verifier.trusted_store()).unwrap_or_else(|e| {
        TimestampCheck {
            trusted: false,
            time: None,
            summary: e.to_string(),
        }
    })
}
