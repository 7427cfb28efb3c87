//! OpenSSL glue shared by the CA, signing and verification engines.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1IntegerRef, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::{
    store::{X509Store, X509StoreBuilder},
    X509Name, X509NameRef, X509PurposeId, X509Ref, X509,
};
use thiserror::Error;

/// Random positive serial of 159 bits. Stays within the 20 octets allowed
/// by RFC 5280 once DER adds its sign byte.
pub fn random_serial() -> Result<BigNum, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

/// Renders a serial as uppercase hex without leading zeros.
pub fn serial_to_hex(serial: &Asn1IntegerRef) -> Result<String, ErrorStack> {
    bignum_to_hex(&serial.to_bn()?)
}

pub fn bignum_to_hex(serial: &BigNum) -> Result<String, ErrorStack> {
    let hex = serial.to_hex_str()?;
    let trimmed = hex.trim_start_matches('0');
    Ok(if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_ascii_uppercase()
    })
}

pub fn generate_rsa(bits: u32) -> Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(bits)?)
}

pub fn generate_ec_p256() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

/// Builds a `CN=<common_name>[, O=<organization>]` distinguished name.
pub fn build_name(common_name: &str, organization: Option<&str>) -> Result<X509Name, ErrorStack> {
    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    if let Some(organization) = organization {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
    }
    Ok(name.build())
}

/// First entry of the given type, as UTF-8.
pub fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

/// Byte-exact comparison of two distinguished names.
pub fn same_name(a: &X509NameRef, b: &X509NameRef) -> Result<bool, ErrorStack> {
    Ok(a.to_der()? == b.to_der()?)
}

pub fn asn1_time(at: DateTime<Utc>) -> Result<Asn1Time, ErrorStack> {
    Asn1Time::from_unix(at.timestamp() as _)
}

#[derive(Error, Debug)]
pub enum TimeError {
    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
    #[error("ASN.1 time is outside the representable range")]
    OutOfRange,
}

pub fn asn1_time_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, TimeError> {
    let diff = Asn1Time::from_unix(0)?.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or(TimeError::OutOfRange)
}

/// Trust store holding only the given root.
///
/// The purpose is relaxed to `any`: leaf certificates carry the TLS client
/// and server usages, which the S/MIME default would reject.
pub fn trust_store(root: &X509) -> Result<X509Store, ErrorStack> {
    let mut builder = X509StoreBuilder::new()?;
    builder.add_cert(root.clone())?;
    builder.set_purpose(X509PurposeId::ANY)?;
    Ok(builder.build())
}

/// Checks detached PKCS #7 signatures over the signed ranges of a PDF.
pub struct Pkcs7Verifier {
    trusted: X509Store,
    untrusted: X509Store,
    intermediaries: Stack<X509>,
}

impl Pkcs7Verifier {
    pub fn new(root: &X509) -> Result<Self, ErrorStack> {
        Ok(Self {
            trusted: trust_store(root)?,
            untrusted: X509StoreBuilder::new()?.build(),
            intermediaries: Stack::new()?,
        })
    }

    /// Signature and digest check, without looking at the certificate chain.
    pub fn check_integrity(&self, pkcs7: &Pkcs7, signed_data: &[u8]) -> Result<(), ErrorStack> {
        pkcs7.verify(
            &self.intermediaries,
            &self.untrusted,
            Some(signed_data),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
    }

    /// Full check, including the chain up to the managed root.
    pub fn check_trust(&self, pkcs7: &Pkcs7, signed_data: &[u8]) -> Result<(), ErrorStack> {
        pkcs7.verify(
            &self.intermediaries,
            &self.trusted,
            Some(signed_data),
            None,
            Pkcs7Flags::BINARY,
        )
    }

    pub fn trusted_store(&self) -> &X509Store {
        &self.trusted
    }

    /// Certificate of the first signer, if it can be located.
    pub fn signer(&self, pkcs7: &Pkcs7) -> Option<X509> {
        pkcs7
            .signers(&self.intermediaries, Pkcs7Flags::empty())
            .ok()
            .and_then(|signers| signers.into_iter().next())
    }
}

/// Detached PKCS #7 signature over `data`, carrying only the signer
/// certificate.
pub fn sign_detached(
    certificate: &X509Ref,
    key: &PKeyRef<Private>,
    data: &[u8],
) -> Result<Vec<u8>, ErrorStack> {
    let no_extra_certs = Stack::new()?;
    Pkcs7::sign(
        certificate,
        key,
        &no_extra_certs,
        data,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )?
    .to_der()
}

/// OpenSSL requires a contiguous buffer to verify, so the two signed ranges
/// are copied into one.
pub fn join_ranges(pdf_bytes: &[u8], ranges: &[std::ops::Range<usize>; 2]) -> Vec<u8> {
    let mut contiguous = Vec::with_capacity(ranges[0].len() + ranges[1].len());
    contiguous.extend_from_slice(&pdf_bytes[ranges[0].clone()]);
    contiguous.extend_from_slice(&pdf_bytes[ranges[1].clone()]);
    contiguous
}
