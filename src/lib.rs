#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod authority;
pub mod config;
pub mod crl;
mod embedded;
mod increment_validation;
pub mod logging;
pub mod model;
pub mod openssl;
pub mod repository;
pub mod seal;
mod signature_writer;
pub mod signing;
pub mod store;
pub mod timestamp;
pub mod verification;

#[cfg(test)]
mod testing;

use regex::bytes::Regex;

pub use authority::{
    CaError, CertificateAuthority, IssueRequest, LeafKeyAlgorithm, RootKeyAlgorithm,
};
pub use config::Settings;
pub use model::{
    effective_status, Certificate, CertificateStatus, SignatureCoordinates, SignatureMetadata,
    SignatureVisibility, SigningResult,
};
pub use repository::{MemoryRepository, Repository};
pub use seal::SealRegistry;
pub use signing::{SignOptions, SigningEngine, SigningError};
pub use store::{KeyMaterialStore, MemoryKeyStore};
pub use timestamp::{LocalTimestampAuthority, NoTimestampAuthority, TimestampAuthority};
pub use verification::{
    ModificationLevel, PemTrustRoot, TrustRootSource, VerificationEngine, VerificationError,
    VerificationReport,
};

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

/// Decodes a PDF hex string, including the delimiters '<' and '>'.
///
/// Returns None if the string doesn't match the pattern "^<[0-9A-Fa-f]*>$".
fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    // First and last characters must be the delimiters '<' and '>'.
    if hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>') {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::with_capacity(hex_input.len() / 2);
    let mut hex_iter = hex_input.iter().map(|&b| (b as char).to_digit(16));

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}
