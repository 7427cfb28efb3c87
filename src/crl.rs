//! DER assembly of X.509 v2 certificate revocation lists.
//!
//! OpenSSL bindings only parse CRLs, so the `TBSCertList` is built with
//! `x509-cert` and signed with the root key through OpenSSL.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use der::{asn1::BitString, Decode, Encode};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::sign::Signer;
use openssl::x509::X509Ref;
use thiserror::Error;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;
use x509_cert::Version;

#[derive(Error, Debug)]
pub enum CrlError {
    #[error("serial number {0:?} is not valid hexadecimal")]
    InvalidSerial(String),
    #[error("DER encoding failed: {0}")]
    Encoding(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<der::Error> for CrlError {
    fn from(e: der::Error) -> Self {
        CrlError::Encoding(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for CrlError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        CrlError::Signing(e.to_string())
    }
}

/// A certificate to list as revoked.
#[derive(Debug, Clone)]
pub struct RevokedEntry {
    pub serial_hex: String,
    pub revoked_at: DateTime<Utc>,
}

/// Builds and signs a CRL issued by `issuer`. Returns the DER encoding.
pub fn build_crl(
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    entries: &[RevokedEntry],
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
) -> Result<Vec<u8>, CrlError> {
    let issuer_der = issuer.to_der()?;
    let issuer_cert: x509_cert::Certificate = x509_cert::Certificate::from_der(&issuer_der)?;

    let revoked = entries
        .iter()
        .map(|entry| {
            Ok(RevokedCert {
                serial_number: parse_serial(&entry.serial_hex)?,
                revocation_date: to_time(entry.revoked_at)?,
                crl_entry_extensions: None,
            })
        })
        .collect::<Result<Vec<RevokedCert>, CrlError>>()?;

    let tbs_cert_list = TbsCertList {
        version: Version::V2,
        signature: issuer_cert.signature_algorithm.clone(),
        issuer: issuer_cert.tbs_certificate.subject.clone(),
        this_update: to_time(this_update)?,
        next_update: Some(to_time(next_update)?),
        revoked_certificates: if revoked.is_empty() {
            None
        } else {
            Some(revoked)
        },
        crl_extensions: None,
    };

    let mut signer = Signer::new(MessageDigest::sha256(), issuer_key)?;
    signer.update(&tbs_cert_list.to_der()?)?;
    let signature = signer.sign_to_vec()?;

    let crl: CertificateList = CertificateList {
        tbs_cert_list,
        signature_algorithm: issuer_cert.signature_algorithm,
        signature: BitString::from_bytes(&signature)?,
    };
    Ok(crl.to_der()?)
}

/// Stored serials are hex strings; anything else means the row is corrupt.
fn parse_serial(serial_hex: &str) -> Result<SerialNumber, CrlError> {
    let invalid = || CrlError::InvalidSerial(serial_hex.to_string());

    if serial_hex.is_empty() || !serial_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let serial = BigNum::from_hex_str(serial_hex).map_err(|_| invalid())?;
    let mut bytes = serial.to_vec();
    if bytes.is_empty() {
        bytes.push(0);
    }
    SerialNumber::new(&bytes).map_err(|_| invalid())
}

fn to_time(at: DateTime<Utc>) -> Result<Time, CrlError> {
    Ok(Time::try_from(SystemTime::from(at))?)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use openssl::x509::X509Crl;

    use super::*;
    use crate::testing;

    #[test]
    fn lists_revoked_serials_and_verifies() {
        let (root, key) = testing::self_signed("CRL Root");
        let now = Utc::now();
        let entries = [
            RevokedEntry {
                serial_hex: "1A2B3C".to_string(),
                revoked_at: now - Duration::hours(1),
            },
            RevokedEntry {
                serial_hex: "7F".to_string(),
                revoked_at: now,
            },
        ];

        let der = build_crl(&root, &key, &entries, now, now + Duration::days(7)).unwrap();
        let crl = X509Crl::from_der(&der).unwrap();

        assert!(crl.verify(&root.public_key().unwrap()).unwrap());
        assert_eq!(
            crl.issuer_name().to_der().unwrap(),
            root.subject_name().to_der().unwrap()
        );
        let serials: Vec<String> = crl
            .get_revoked()
            .unwrap()
            .iter()
            .map(|r| {
                crate::openssl::serial_to_hex(r.serial_number()).unwrap()
            })
            .collect();
        assert_eq!(serials, ["1A2B3C", "7F"]);
    }

    #[test]
    fn empty_crl_has_no_revoked_list() {
        let (root, key) = testing::self_signed("CRL Root");
        let now = Utc::now();
        let der = build_crl(&root, &key, &[], now, now + Duration::days(1)).unwrap();
        let crl = X509Crl::from_der(&der).unwrap();
        assert!(crl.get_revoked().is_none());
    }

    #[test]
    fn rejects_non_hex_serials() {
        let (root, key) = testing::self_signed("CRL Root");
        let now = Utc::now();
        let entries = [RevokedEntry {
            serial_hex: "XYZ".to_string(),
            revoked_at: now,
        }];
        assert!(matches!(
            build_crl(&root, &key, &entries, now, now + Duration::days(1)),
            Err(CrlError::InvalidSerial(_))
        ));
    }
}
