//! RFC 3161 time-stamp tokens.
//!
//! The HTTP client of a real time-stamp authority lives outside this crate;
//! signing only needs something implementing [`TimestampAuthority`].
//! [`LocalTimestampAuthority`] issues tokens in-process from a certificate
//! and key, which is enough for closed deployments and for tests.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use der::asn1::{GeneralizedTime, Int, ObjectIdentifier, OctetString};
use der::{Decode, DecodeValue, Encode, FixedTag, Header, Reader, Sequence, Tag};
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::sha::sha256;
use openssl::x509::store::X509StoreRef;
use openssl::x509::X509;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use x509_cert::spki::AlgorithmIdentifierOwned;

pub const ID_SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// Policy written into tokens issued by [`LocalTimestampAuthority`].
pub const LOCAL_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.4146.2.3");

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("no time-stamp authority is configured")]
    NotConfigured,
    #[error("time-stamp authority failed: {0}")]
    Unavailable(String),
    #[error("invalid time-stamp token: {0}")]
    InvalidToken(String),
}

impl From<der::Error> for TimestampError {
    fn from(e: der::Error) -> Self {
        TimestampError::InvalidToken(e.to_string())
    }
}

pub trait TimestampAuthority: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Returns a DER `TimeStampToken` over the given SHA-256 digest.
    fn timestamp(&self, digest: &[u8; 32]) -> Result<Vec<u8>, TimestampError>;
}

/// Used when no time-stamp authority is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTimestampAuthority;

impl TimestampAuthority for NoTimestampAuthority {
    fn is_configured(&self) -> bool {
        false
    }

    fn timestamp(&self, _digest: &[u8; 32]) -> Result<Vec<u8>, TimestampError> {
        Err(TimestampError::NotConfigured)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub hashed_message: OctetString,
}

/// Mandatory part of `TSTInfo`, as issued locally.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct IssuedTstInfo {
    version: u8,
    policy: ObjectIdentifier,
    message_imprint: MessageImprint,
    serial_number: u64,
    gen_time: GeneralizedTime,
}

/// The fields of `TSTInfo` needed to check a token. Accuracy, ordering,
/// nonce, TSA name and extensions are skipped.
#[derive(Clone, Debug)]
pub struct TstInfo {
    pub version: u8,
    pub policy: ObjectIdentifier,
    pub message_imprint: MessageImprint,
    pub serial_number: Int,
    pub gen_time: GeneralizedTime,
}

impl FixedTag for TstInfo {
    const TAG: Tag = Tag::Sequence;
}

impl<'a> DecodeValue<'a> for TstInfo {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let version = reader.decode()?;
            let policy = reader.decode()?;
            let message_imprint = reader.decode()?;
            let serial_number = reader.decode()?;
            let gen_time = reader.decode()?;
            let rest = reader.remaining_len();
            reader.read_slice(rest)?;
            Ok(Self {
                version,
                policy,
                message_imprint,
                serial_number,
                gen_time,
            })
        })
    }
}

impl TstInfo {
    pub fn gen_time_utc(&self) -> Option<DateTime<Utc>> {
        let since_epoch = self.gen_time.to_unix_duration();
        DateTime::from_timestamp(i64::try_from(since_epoch.as_secs()).ok()?, 0)
    }

    /// Whether the token was issued for exactly `data`.
    pub fn covers(&self, data: &[u8]) -> bool {
        self.message_imprint.hash_algorithm.oid == ID_SHA_256
            && self.message_imprint.hashed_message.as_bytes() == sha256(data).as_slice()
    }
}

/// Result of checking a document time-stamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampCheck {
    pub trusted: bool,
    pub time: Option<DateTime<Utc>>,
    pub summary: String,
}

/// Checks `token` against `data` and the trust anchors in `store`.
///
/// Only an unparsable token is an error; a bad signature, an untrusted
/// signer or a digest mismatch are reported in the returned value.
pub fn check_token(
    token: &[u8],
    data: &[u8],
    store: &X509StoreRef,
) -> Result<TimestampCheck, TimestampError> {
    let mut cms = CmsContentInfo::from_der(token)
        .map_err(|e| TimestampError::InvalidToken(e.to_string()))?;

    let mut content = Vec::new();
    let chain_ok = match cms.verify(None, Some(store), None, Some(&mut content), CMSOptions::BINARY)
    {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "time-stamp signer is not trusted");
            content.clear();
            let unchecked = cms.verify(
                None,
                None,
                None,
                Some(&mut content),
                CMSOptions::BINARY | CMSOptions::NO_SIGNER_CERT_VERIFY,
            );
            if unchecked.is_err() {
                return Ok(TimestampCheck {
                    trusted: false,
                    time: None,
                    summary: "time-stamp token signature is invalid".to_string(),
                });
            }
            false
        }
    };

    let info = TstInfo::from_der(&content)?;
    let time = info.gen_time_utc();
    let (trusted, summary) = if !info.covers(data) {
        (false, "time-stamp does not cover the signed data")
    } else if !chain_ok {
        (false, "time-stamp authority is not trusted")
    } else {
        (true, "time-stamp is valid and trusted")
    };

    Ok(TimestampCheck {
        trusted,
        time,
        summary: summary.to_string(),
    })
}

/// Issues time-stamp tokens with a local certificate and key.
pub struct LocalTimestampAuthority {
    certificate: X509,
    key: PKey<Private>,
}

impl LocalTimestampAuthority {
    pub fn new(certificate: X509, key: PKey<Private>) -> Self {
        Self { certificate, key }
    }
}

impl TimestampAuthority for LocalTimestampAuthority {
    fn is_configured(&self) -> bool {
        true
    }

    fn timestamp(&self, digest: &[u8; 32]) -> Result<Vec<u8>, TimestampError> {
        let unavailable = |e: &dyn std::fmt::Display| TimestampError::Unavailable(e.to_string());

        let mut serial = [0u8; 8];
        rand_bytes(&mut serial).map_err(|e| unavailable(&e))?;

        let info = IssuedTstInfo {
            version: 1,
            policy: LOCAL_POLICY,
            message_imprint: MessageImprint {
                hash_algorithm: AlgorithmIdentifierOwned {
                    oid: ID_SHA_256,
                    parameters: None,
                },
                hashed_message: OctetString::new(digest.to_vec())?,
            },
            serial_number: u64::from_be_bytes(serial) >> 1,
            gen_time: GeneralizedTime::from_system_time(SystemTime::now())?,
        };
        let encoded = info.to_der()?;

        let token = CmsContentInfo::sign(
            Some(&self.certificate),
            Some(&self.key),
            None,
            Some(&encoded),
            CMSOptions::BINARY,
        )
        .and_then(|cms| cms.to_der())
        .map_err(|e| unavailable(&e))?;

        Ok(token)
    }
}
