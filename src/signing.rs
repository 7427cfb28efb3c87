//! Signs PDFs with certificates issued or imported by the authority.
//!
//! Every signature is appended as a new incremental revision; the bytes
//! of the input are never rewritten.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use openssl::pkey::{PKey, Private};
use openssl::sha::sha256;
use openssl::x509::X509;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::{CaError, CertificateAuthority};
use crate::config::PdfSettings;
use crate::model::{
    effective_status, Certificate, CertificateStatus, SignatureCoordinates, SignatureMetadata,
    SignatureVisibility, SigningResult, UserId,
};
use crate::openssl::sign_detached;
use crate::repository::{Repository, RepositoryError};
use crate::signature_writer::{prepare, NewSignature, ValidationMaterial};
use crate::store::KeyMaterialStore;
use crate::timestamp::TimestampAuthority;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("certificate {0} not found")]
    CertificateNotFound(Uuid),
    #[error("certificate {0} belongs to another user")]
    CertificateNotOwned(Uuid),
    #[error("certificate can not be used for signing: {0}")]
    CertificateInvalid(String),
    #[error("seal not found: {0}")]
    SealNotFound(String),
    #[error("seal {0} belongs to another user")]
    SealNotOwned(Uuid),
    #[error("signing failed: {0}")]
    Signature(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

fn signature_error(e: impl Display) -> SigningError {
    SigningError::Signature(e.to_string())
}

/// What to sign with, and how.
#[derive(Debug, Clone)]
pub struct SignOptions {
    pub certificate_id: Uuid,
    pub user_id: UserId,
    pub seal_id: Option<Uuid>,
    pub visibility: SignatureVisibility,
    /// Required for visible signatures, ignored otherwise.
    pub coordinates: Option<SignatureCoordinates>,
    pub metadata: Option<SignatureMetadata>,
    pub use_tsa: bool,
    pub embed_ltv: bool,
}

impl SignOptions {
    pub fn invisible(certificate_id: Uuid, user_id: UserId) -> Self {
        Self {
            certificate_id,
            user_id,
            seal_id: None,
            visibility: SignatureVisibility::Invisible,
            coordinates: None,
            metadata: None,
            use_tsa: false,
            embed_ltv: false,
        }
    }
}

/// Certificate, key and seal resolved once per call.
struct Signer {
    certificate: Certificate,
    x509: X509,
    key: PKey<Private>,
    seal: Option<(Uuid, Vec<u8>)>,
    placement: Option<SignatureCoordinates>,
}

pub struct SigningEngine {
    authority: Arc<CertificateAuthority>,
    repository: Arc<dyn Repository>,
    store: Arc<dyn KeyMaterialStore>,
    tsa: Arc<dyn TimestampAuthority>,
    settings: PdfSettings,
}

impl SigningEngine {
    pub fn new(
        authority: Arc<CertificateAuthority>,
        repository: Arc<dyn Repository>,
        store: Arc<dyn KeyMaterialStore>,
        tsa: Arc<dyn TimestampAuthority>,
        settings: PdfSettings,
    ) -> Self {
        Self {
            authority,
            repository,
            store,
            tsa,
            settings,
        }
    }

    /// Signs one document on behalf of `options.user_id`.
    pub fn sign_pdf(
        &self,
        pdf_bytes: &[u8],
        options: &SignOptions,
    ) -> Result<SigningResult, SigningError> {
        self.validate_pdf(pdf_bytes)?;
        let signer = self.resolve_signer(options)?;
        self.apply(pdf_bytes, &signer, options)
    }

    /// Signs every document with the same options.
    ///
    /// The batch size, the certificate and the seal are checked once for
    /// the whole call. Each document then succeeds or fails on its own, at
    /// its position in the returned list.
    pub fn batch_sign_pdfs(
        &self,
        pdfs: &[Vec<u8>],
        options: &SignOptions,
    ) -> Result<Vec<Result<SigningResult, SigningError>>, SigningError> {
        if pdfs.len() > self.settings.batch_max_count {
            return Err(SigningError::Validation(format!(
                "batch of {} documents exceeds the limit of {}",
                pdfs.len(),
                self.settings.batch_max_count
            )));
        }
        let signer = self.resolve_signer(options)?;

        let results: Vec<_> = pdfs
            .iter()
            .enumerate()
            .map(|(index, pdf)| {
                let result = self
                    .validate_pdf(pdf)
                    .and_then(|()| self.apply(pdf, &signer, options));
                if let Err(e) = &result {
                    warn!(index, error = %e, "batch document not signed");
                }
                result
            })
            .collect();

        info!(
            documents = results.len(),
            signed = results.iter().filter(|r| r.is_ok()).count(),
            "batch signed"
        );
        Ok(results)
    }

    fn validate_pdf(&self, pdf_bytes: &[u8]) -> Result<(), SigningError> {
        if pdf_bytes.is_empty() {
            return Err(SigningError::Validation("PDF is empty".to_string()));
        }
        if pdf_bytes.len() > self.settings.max_bytes {
            return Err(SigningError::Validation(format!(
                "PDF of {} bytes exceeds the limit of {} bytes",
                pdf_bytes.len(),
                self.settings.max_bytes
            )));
        }
        if !pdf_bytes.starts_with(b"%PDF-") {
            return Err(SigningError::Validation(
                "not a PDF: missing %PDF- header".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_signer(&self, options: &SignOptions) -> Result<Signer, SigningError> {
        let certificate = self
            .repository
            .get_certificate(options.certificate_id)?
            .ok_or(SigningError::CertificateNotFound(options.certificate_id))?;
        if certificate.owner_id != Some(options.user_id) {
            return Err(SigningError::CertificateNotOwned(certificate.id));
        }
        match effective_status(&certificate, Utc::now()) {
            CertificateStatus::Active => {}
            status => {
                return Err(SigningError::CertificateInvalid(format!(
                    "certificate is {status}"
                )))
            }
        }

        let seal = match options.seal_id {
            Some(seal_id) => Some((seal_id, self.load_seal(seal_id, options.user_id)?)),
            None => None,
        };

        let placement = match options.visibility {
            SignatureVisibility::Visible => Some(validate_coordinates(options.coordinates)?),
            SignatureVisibility::Invisible => None,
        };

        let secret_id = certificate.private_key_secret_id.ok_or_else(|| {
            SigningError::CertificateInvalid("no private key is stored for it".to_string())
        })?;
        let key_pem = self.store.load_private_key(secret_id).map_err(|e| {
            SigningError::CertificateInvalid(format!("private key can not be loaded: {e}"))
        })?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes()).map_err(|e| {
            SigningError::CertificateInvalid(format!("private key can not be parsed: {e}"))
        })?;
        let x509 = X509::from_pem(certificate.certificate_pem.as_bytes()).map_err(|e| {
            SigningError::CertificateInvalid(format!("certificate can not be parsed: {e}"))
        })?;
        let matches = x509
            .public_key()
            .map(|public| public.public_eq(&key))
            .unwrap_or(false);
        if !matches {
            return Err(SigningError::CertificateInvalid(
                "private key does not match the certificate".to_string(),
            ));
        }

        Ok(Signer {
            certificate,
            x509,
            key,
            seal,
            placement,
        })
    }

    fn load_seal(&self, seal_id: Uuid, user_id: UserId) -> Result<Vec<u8>, SigningError> {
        let seal = self
            .repository
            .get_seal(seal_id)?
            .ok_or_else(|| SigningError::SealNotFound(seal_id.to_string()))?;
        if seal.owner_id != user_id {
            return Err(SigningError::SealNotOwned(seal_id));
        }
        let secret_id = seal
            .image_secret_id
            .ok_or_else(|| SigningError::SealNotFound(format!("image of seal {seal_id}")))?;
        self.store
            .load_secret(secret_id)
            .map_err(|e| SigningError::SealNotFound(format!("image of seal {seal_id}: {e}")))
    }

    fn apply(
        &self,
        pdf_bytes: &[u8],
        signer: &Signer,
        options: &SignOptions,
    ) -> Result<SigningResult, SigningError> {
        let signed_at = Utc::now();
        let material = if options.embed_ltv {
            self.validation_material(signer)
        } else {
            None
        };

        let new_signature = NewSignature {
            metadata: options.metadata.as_ref(),
            placement: signer.placement,
            seal_image: signer.seal.as_ref().map(|(_, image)| image.as_slice()),
            validation_material: material.as_ref(),
            ..NewSignature::approval(&signer.certificate.subject_common_name, signed_at)
        };
        let prepared = prepare(pdf_bytes, &new_signature).map_err(signature_error)?;
        let container = sign_detached(&signer.x509, &signer.key, &prepared.signed_data())
            .map_err(signature_error)?;
        let mut signed = prepared.finish(&container).map_err(signature_error)?;

        let tsa_used = options.use_tsa && self.tsa.is_configured();
        if tsa_used {
            signed = self.add_doc_timestamp(&signed)?;
        } else if options.use_tsa {
            warn!(
                certificate = %signer.certificate.id,
                "time-stamp requested but no authority is configured, signing without it"
            );
        }

        let result = SigningResult {
            document_id: Uuid::new_v4().simple().to_string(),
            file_size: signed.len(),
            signed_pdf: signed,
            signed_at,
            certificate_id: signer.certificate.id,
            seal_id: signer.seal.as_ref().map(|(id, _)| *id),
            visibility: options.visibility,
            tsa_used,
            ltv_embedded: material.is_some(),
        };
        info!(
            document = %result.document_id,
            certificate = %result.certificate_id,
            tsa = result.tsa_used,
            ltv = result.ltv_embedded,
            size = result.file_size,
            "PDF signed"
        );
        Ok(result)
    }

    /// Signer and root certificates plus the latest CRL. Only the signer
    /// certificate is mandatory.
    fn validation_material(&self, signer: &Signer) -> Option<ValidationMaterial> {
        let mut material = ValidationMaterial::default();
        match signer.x509.to_der() {
            Ok(der) => material.certificates.push(der),
            Err(e) => {
                warn!(error = %e, "signer certificate can not be encoded, skipping LTV material");
                return None;
            }
        }

        match self
            .authority
            .root_certificate()
            .and_then(|root| root.to_der().map_err(CaError::from))
        {
            Ok(der) => material.certificates.push(der),
            Err(e) => warn!(error = %e, "root certificate left out of LTV material"),
        }
        match self.authority.latest_crl_der() {
            Ok(Some(der)) => material.crls.push(der),
            Ok(None) => debug!("no CRL generated yet, LTV material has no revocation data"),
            Err(e) => warn!(error = %e, "CRL left out of LTV material"),
        }
        Some(material)
    }

    /// Appends a document time-stamp revision over `pdf_bytes`.
    fn add_doc_timestamp(&self, pdf_bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
        let prepared = prepare(pdf_bytes, &NewSignature::doc_timestamp(Utc::now()))
            .map_err(signature_error)?;
        let token = self
            .tsa
            .timestamp(&sha256(&prepared.signed_data()))
            .map_err(|e| SigningError::Signature(format!("time-stamp failed: {e}")))?;
        prepared.finish(&token).map_err(signature_error)
    }
}

fn validate_coordinates(
    coordinates: Option<SignatureCoordinates>,
) -> Result<SignatureCoordinates, SigningError> {
    let invalid = |reason: &str| Err(SigningError::Validation(reason.to_string()));

    let Some(c) = coordinates else {
        return invalid("visible signatures need coordinates");
    };
    if c.page < 1 {
        return invalid("page numbers start at 1");
    }
    if [c.x, c.y, c.width, c.height].iter().any(|v| !v.is_finite()) {
        return invalid("coordinates must be finite numbers");
    }
    if c.x < 0.0 || c.y < 0.0 {
        return invalid("coordinates must not be negative");
    }
    if c.width <= 0.0 || c.height <= 0.0 {
        return invalid("width and height must be positive");
    }
    Ok(c)
}
