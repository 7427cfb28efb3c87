//! Locates the signatures embedded in a PDF and checks that their byte
//! ranges are sound.

use std::collections::HashSet;
use std::ops::Range;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use thiserror::Error;
use tracing::debug;

use crate::{decode_pdf_hex_string, pdf_ends_with_eof, ExactArrayOrNone};

/// Field trees deeper than this are treated as malformed.
const MAX_FIELD_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid signature object")]
    InvalidSignatureObject,
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature coverage skips over wrong sections of the document")]
    InvalidCoverage,
    #[error("can not ensure that the incremental update didn't change the document")]
    InternalConsistency,
    #[error("signature field tree is too deep")]
    FieldTreeTooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// A regular signature by a certificate holder.
    Approval,
    /// An RFC 3161 document time-stamp.
    DocTimeStamp,
}

/// A signature whose byte range passed the soundness checks. The
/// cryptographic content has not been verified yet.
#[derive(Debug)]
pub struct Signature {
    pub obj_id: ObjectId,
    pub offset: u32,
    pub coverage_end: usize,
    /// The `<...>` token holding the signature, delimiters included.
    pub skipped_range: Range<usize>,
    /// BER/DER signature container, as decoded from the hex string.
    pub contents: Vec<u8>,
    pub kind: SignatureKind,
    pub signing_time: Option<DateTime<Utc>>,
    /// `/P` of a DocMDP transform, when the signature carries one.
    pub docmdp_permission: Option<i64>,
}

impl Signature {
    pub fn signed_byte_ranges(&self) -> [Range<usize>; 2] {
        [
            0..self.skipped_range.start,
            self.skipped_range.end..self.coverage_end,
        ]
    }
}

/// A terminal signature field, with its signature or the reason it could
/// not be extracted.
#[derive(Debug)]
pub struct SignatureField {
    pub name: String,
    pub kind: SignatureKind,
    pub signature: Result<Signature>,
}

/// Every signed signature field of the document, in field tree order.
///
/// A document without `/AcroForm` has no fields. Unsigned signature fields
/// (no `/V`) are skipped.
pub fn signature_fields(pdf_bytes: &[u8], doc: &Document) -> Result<Vec<SignatureField>> {
    let acro_form = match doc.get_dict_in_dict(doc.catalog()?, b"AcroForm") {
        Ok(val) => val,
        Err(lopdf::Error::DictKey) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let fields = match acro_form.get_deref(b"Fields", doc) {
        Ok(fields) => fields.as_array()?,
        Err(lopdf::Error::DictKey) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut result = Vec::new();
    let mut seen = HashSet::new();
    collect_fields(pdf_bytes, doc, fields, None, None, 0, &mut seen, &mut result)?;
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn collect_fields(
    pdf_bytes: &[u8],
    doc: &Document,
    fields: &[Object],
    parent_name: Option<&str>,
    inherited_ft: Option<&[u8]>,
    depth: usize,
    seen: &mut HashSet<ObjectId>,
    result: &mut Vec<SignatureField>,
) -> Result<()> {
    if depth > MAX_FIELD_DEPTH {
        return Err(Error::FieldTreeTooDeep.into());
    }

    for field in fields {
        let (id, field) = match doc.dereference(field) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(?field, error = %e, "skipping unresolvable form field");
                continue;
            }
        };
        if let Some(id) = id {
            if !seen.insert(id) {
                continue;
            }
        }
        let Ok(field) = field.as_dict() else {
            debug!(?id, "skipping form field that is not a dictionary");
            continue;
        };

        let partial = field
            .get(b"T")
            .and_then(Object::as_str)
            .map(decode_text_string)
            .ok();
        let name = match (parent_name, partial) {
            (Some(parent), Some(partial)) => Some(format!("{parent}.{partial}")),
            (None, Some(partial)) => Some(partial),
            (parent, None) => parent.map(str::to_string),
        };
        let ft = match field.get(b"FT") {
            Ok(Object::Name(ft)) => Some(ft.as_slice()),
            _ => inherited_ft,
        };

        if ft == Some(b"Sig".as_slice()) && field.has(b"V") {
            let kind = signature_kind(doc, field);
            result.push(SignatureField {
                name: name.clone().unwrap_or_default(),
                kind,
                signature: field
                    .get(b"V")
                    .map_err(anyhow::Error::from)
                    .and_then(|v| process_signature(pdf_bytes, doc, v, kind)),
            });
        }

        if let Ok(kids) = field.get_deref(b"Kids", doc).and_then(Object::as_array) {
            collect_fields(
                pdf_bytes,
                doc,
                kids,
                name.as_deref(),
                ft,
                depth + 1,
                seen,
                result,
            )?;
        }
    }

    Ok(())
}

fn signature_kind(doc: &Document, field: &Dictionary) -> SignatureKind {
    let Ok(signature) = field.get_deref(b"V", doc).and_then(Object::as_dict) else {
        return SignatureKind::Approval;
    };
    let is_name = |key: &[u8], value: &[u8]| {
        signature
            .get(key)
            .and_then(Object::as_name)
            .is_ok_and(|n| n == value)
    };
    if is_name(b"Type", b"DocTimeStamp") || is_name(b"SubFilter", b"ETSI.RFC3161") {
        SignatureKind::DocTimeStamp
    } else {
        SignatureKind::Approval
    }
}

fn process_signature(
    pdf_bytes: &[u8],
    doc: &Document,
    sig_reference: &Object,
    kind: SignatureKind,
) -> Result<Signature> {
    let (Some(obj_id), Object::Dictionary(signature)) = doc.dereference(sig_reference)? else {
        // Signature object must be an indirect dictionary.
        return Err(Error::InvalidSignatureObject.into());
    };

    let signed_range = signature
        .get_deref(b"ByteRange", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?;

    // For soundness, we must ensure the signature covers the file since the
    // beginning.
    if signed_range[0] != 0 {
        return Err(Error::WrongRangeStart.into());
    }

    // The signature object must be inside the signed range.
    let offset = if let XrefEntry::Normal { offset, generation } = doc
        .reference_table
        .get(obj_id.0)
        .ok_or(Error::InternalConsistency)?
    {
        if *generation != obj_id.1 {
            return Err(Error::InternalConsistency.into());
        }
        if *offset as i64 >= signed_range[1] {
            return Err(Error::InvalidCoverage.into());
        }
        *offset
    } else {
        return Err(Error::InvalidSignatureObject.into());
    };

    // Sanity check that the range is well formed and inside the document.
    for &range in &signed_range[1..] {
        if range < 0 {
            return Err(Error::InvalidRange.into());
        }
    }
    let signed_range_end = signed_range[2]
        .checked_add(signed_range[3])
        .ok_or(Error::InvalidRange)?;
    if signed_range[1] > signed_range[2] || signed_range_end > pdf_bytes.len() as i64 {
        return Err(Error::InvalidRange.into());
    }
    let skipped_range = signed_range[1] as usize..signed_range[2] as usize;
    let coverage_end = signed_range_end as usize;

    // The /Contents field must match the bytes skipped in the signed range,
    // which must be hex encoded.
    let skipped_bytes =
        decode_pdf_hex_string(&pdf_bytes[skipped_range.clone()]).ok_or(Error::InvalidCoverage)?;
    let contents = signature.get_deref(b"Contents", doc)?.as_str()?;
    if contents != skipped_bytes {
        return Err(Error::InvalidCoverage.into());
    }

    // Tests if the signature range ends with the PDF end marker (%%EOF).
    if !pdf_ends_with_eof(&pdf_bytes[..coverage_end]) {
        return Err(Error::WrongRangeEnd.into());
    }

    let signing_time = signature
        .get(b"M")
        .and_then(Object::as_str)
        .ok()
        .and_then(parse_pdf_date);

    Ok(Signature {
        obj_id,
        offset,
        coverage_end,
        skipped_range,
        contents: skipped_bytes,
        kind,
        signing_time,
        docmdp_permission: docmdp_permission(doc, signature),
    })
}

/// Permission level of a DocMDP transform in the signature `/Reference`
/// array. `/P` defaults to 2.
fn docmdp_permission(doc: &Document, signature: &Dictionary) -> Option<i64> {
    let references = signature.get_deref(b"Reference", doc).ok()?.as_array().ok()?;
    references.iter().find_map(|reference| {
        let reference = doc.dereference(reference).ok()?.1.as_dict().ok()?;
        let method = reference.get(b"TransformMethod").and_then(Object::as_name).ok()?;
        if method != b"DocMDP".as_slice() {
            return None;
        }
        let permission = reference
            .get_deref(b"TransformParams", doc)
            .and_then(Object::as_dict)
            .and_then(|params| params.get(b"P"))
            .and_then(Object::as_i64)
            .unwrap_or(2);
        Some(permission)
    })
}

/// Decodes a PDF text string: UTF-16BE with a byte order mark, otherwise
/// treated as Latin-1.
pub fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xfe, 0xff, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Parses a PDF date, `D:YYYYMMDDHHmmSSOHH'mm'`, where everything after
/// the year is optional.
pub fn parse_pdf_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    let text = text.strip_prefix("D:").unwrap_or(text);

    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, zone) = text.split_at(digits_end);
    if digits.len() < 4 {
        return None;
    }
    let field = |range: Range<usize>, default: u32| -> Option<u32> {
        match digits.get(range) {
            Some(s) if !s.is_empty() => s.parse().ok(),
            _ => Some(default),
        }
    };
    let year = digits.get(0..4)?.parse().ok()?;
    let month = field(4..6, 1)?;
    let day = field(6..8, 1)?;
    let hour = field(8..10, 0)?;
    let minute = field(10..12, 0)?;
    let second = field(12..14, 0)?;

    let local = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;

    let offset_secs = match zone.chars().next() {
        None | Some('Z') => 0,
        Some(sign @ ('+' | '-')) => {
            let parts: Vec<&str> = zone[1..]
                .split('\'')
                .filter(|p| !p.is_empty())
                .collect();
            let hours: i32 = parts.first()?.parse().ok()?;
            let minutes: i32 = parts.get(1).map_or(Some(0), |m| m.parse().ok())?;
            let secs = hours * 3600 + minutes * 60;
            if sign == '-' {
                -secs
            } else {
                secs
            }
        }
        Some(_) => return None,
    };

    let offset = FixedOffset::east_opt(offset_secs)?;
    Some(
        offset
            .from_local_datetime(&local)
            .single()?
            .with_timezone(&Utc),
    )
}
