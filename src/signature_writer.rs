//! Appends signature revisions to a PDF.
//!
//! A revision is written in two steps. [`prepare`] appends the signature
//! field, its widget and a signature dictionary whose `/Contents` is a
//! zero-filled placeholder, then patches `/ByteRange` to skip exactly that
//! placeholder. The caller signs [`PreparedRevision::signed_data`] and
//! hands the signature container to [`PreparedRevision::finish`].

use std::collections::HashSet;
use std::fmt::Write as _;
use std::ops::Range;

use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{
    dictionary, Dictionary, Document, IncrementalDocument, Object, ObjectId, Stream, StringFormat,
};
use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::embedded::{decode_text_string, SignatureKind};
use crate::model::{SignatureCoordinates, SignatureMetadata};
use crate::openssl::join_ranges;

/// Bytes reserved for the signature container.
pub const SIGNATURE_CAPACITY: usize = 8192;

/// Wide enough for any offset we can produce, so patching never moves bytes.
const BYTE_RANGE_PLACEHOLDER: [i64; 4] = [0, 9_999_999_999, 9_999_999_999, 9_999_999_999];

lazy_static::lazy_static! {
    static ref BYTE_RANGE_REGEX: Regex =
        Regex::new(r"/ByteRange\s*(\[\s*0\s+9999999999\s+9999999999\s+9999999999\s*\])").unwrap();
    static ref CONTENTS_REGEX: Regex = Regex::new(r"/Contents\s*<(0+)>").unwrap();
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("failed to write the revision: {0}")]
    Save(String),
    #[error("page {0} does not exist")]
    PageOutOfRange(u32),
    #[error("signature placeholder not found in the written revision")]
    PlaceholderNotFound,
    #[error("signature of {0} bytes does not fit the reserved space")]
    SignatureTooLarge(usize),
}

/// Certificates and CRLs written to `/DSS` for offline validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationMaterial {
    pub certificates: Vec<Vec<u8>>,
    pub crls: Vec<Vec<u8>>,
}

/// Everything that goes into the new signature revision.
#[derive(Debug, Clone)]
pub struct NewSignature<'a> {
    pub kind: SignatureKind,
    pub signer_name: Option<&'a str>,
    pub signing_time: DateTime<Utc>,
    pub metadata: Option<&'a SignatureMetadata>,
    /// Box of a visible signature. The widget is invisible when `None`.
    pub placement: Option<SignatureCoordinates>,
    pub seal_image: Option<&'a [u8]>,
    pub validation_material: Option<&'a ValidationMaterial>,
}

impl<'a> NewSignature<'a> {
    pub fn approval(signer_name: &'a str, signing_time: DateTime<Utc>) -> Self {
        Self {
            kind: SignatureKind::Approval,
            signer_name: Some(signer_name),
            signing_time,
            metadata: None,
            placement: None,
            seal_image: None,
            validation_material: None,
        }
    }

    pub fn doc_timestamp(signing_time: DateTime<Utc>) -> Self {
        Self {
            kind: SignatureKind::DocTimeStamp,
            signer_name: None,
            signing_time,
            metadata: None,
            placement: None,
            seal_image: None,
            validation_material: None,
        }
    }
}

/// A written revision waiting for its signature container.
#[derive(Debug)]
pub struct PreparedRevision {
    bytes: Vec<u8>,
    /// The `<...>` placeholder token, delimiters included.
    contents: Range<usize>,
}

impl PreparedRevision {
    /// The bytes covered by `/ByteRange`.
    pub fn signed_data(&self) -> Vec<u8> {
        join_ranges(
            &self.bytes,
            &[0..self.contents.start, self.contents.end..self.bytes.len()],
        )
    }

    pub fn byte_range(&self) -> [usize; 4] {
        [
            0,
            self.contents.start,
            self.contents.end,
            self.bytes.len() - self.contents.end,
        ]
    }

    /// Writes `signature` into the placeholder and returns the final file.
    pub fn finish(mut self, signature: &[u8]) -> Result<Vec<u8>, WriterError> {
        let capacity = self.contents.len() - 2;
        if signature.len() * 2 > capacity {
            return Err(WriterError::SignatureTooLarge(signature.len()));
        }

        let hex = signature.iter().fold(String::new(), |mut hex, byte| {
            let _ = write!(hex, "{byte:02X}");
            hex
        });
        let start = self.contents.start + 1;
        self.bytes[start..start + hex.len()].copy_from_slice(hex.as_bytes());
        Ok(self.bytes)
    }
}

/// Objects of the previous revision that the new one replaces.
struct Previous {
    catalog_id: ObjectId,
    catalog: Dictionary,
    acro_form: AcroFormLocation,
    fields: Vec<Object>,
    field_names: HashSet<String>,
    page_id: ObjectId,
    page: Dictionary,
    annotations: Vec<Object>,
    dss: Option<Dictionary>,
}

enum AcroFormLocation {
    Indirect(ObjectId, Dictionary),
    Inline(Dictionary),
    Missing,
}

/// Appends `signature` as a new incremental revision of `pdf_bytes`.
///
/// The input bytes are kept verbatim at the start of the output.
pub fn prepare(
    pdf_bytes: &[u8],
    signature: &NewSignature,
) -> Result<PreparedRevision, WriterError> {
    let mut base = pdf_bytes.to_vec();
    if !matches!(base.last(), Some(b'\n' | b'\r')) {
        base.push(b'\n');
    }
    let base_len = base.len();

    let previous_doc = Document::load_mem(&base)?;
    let page_number = signature.placement.map_or(1, |p| p.page);
    let previous = Previous::read(&previous_doc, page_number)?;
    let mut inc = IncrementalDocument::create_from(base, previous_doc);
    let doc = &mut inc.new_document;

    let Previous {
        catalog_id,
        mut catalog,
        acro_form,
        mut fields,
        field_names,
        page_id,
        mut page,
        mut annotations,
        dss,
    } = previous;

    let rect = match signature.placement {
        Some(p) => [p.x, p.y, p.x + p.width, p.y + p.height],
        None => [0.0; 4],
    };

    let sig_id = doc.add_object(signature_dictionary(signature));
    let mut widget = dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Sig",
        "T" => Object::string_literal(unique_field_name(signature.kind, &field_names)),
        "V" => sig_id,
        "F" => 132,
        "P" => page_id,
        "Rect" => rect.iter().map(|&v| Object::Real(v)).collect::<Vec<_>>(),
    };
    if let Some(placement) = signature.placement {
        let appearance = appearance_stream(doc, signature, placement.width, placement.height)?;
        widget.set("AP", dictionary! { "N" => appearance });
    }
    let widget_id = doc.add_object(widget);

    annotations.push(widget_id.into());
    page.set("Annots", annotations);
    doc.objects.insert(page_id, Object::Dictionary(page));

    fields.push(widget_id.into());
    let form_entries = |mut form: Dictionary| {
        form.set("Fields", fields);
        form.set("SigFlags", 3);
        form
    };
    match acro_form {
        AcroFormLocation::Indirect(id, form) => {
            doc.objects.insert(id, Object::Dictionary(form_entries(form)));
        }
        AcroFormLocation::Inline(form) => {
            catalog.set("AcroForm", form_entries(form));
        }
        AcroFormLocation::Missing => {
            let id = doc.add_object(form_entries(Dictionary::new()));
            catalog.set("AcroForm", id);
        }
    }

    if let Some(material) = signature.validation_material {
        let dss_id = add_dss(doc, dss, material);
        catalog.set("DSS", dss_id);
    }

    doc.objects.insert(catalog_id, Object::Dictionary(catalog));
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::with_capacity(base_len + 4 * SIGNATURE_CAPACITY);
    inc.save_to(&mut bytes)
        .map_err(|e| WriterError::Save(e.to_string()))?;

    let contents = patch_placeholders(&mut bytes, base_len)?;
    let revision = PreparedRevision { bytes, contents };
    debug!(
        revision_bytes = revision.bytes.len() - base_len,
        byte_range = ?revision.byte_range(),
        "signature revision prepared"
    );
    Ok(revision)
}

impl Previous {
    fn read(doc: &Document, page_number: u32) -> Result<Self, WriterError> {
        let catalog_id = doc.trailer.get(b"Root")?.as_reference()?;
        let catalog = doc.get_dictionary(catalog_id)?.clone();

        let acro_form = match catalog.get(b"AcroForm") {
            Ok(Object::Reference(id)) => {
                AcroFormLocation::Indirect(*id, doc.get_dictionary(*id)?.clone())
            }
            Ok(Object::Dictionary(form)) => AcroFormLocation::Inline(form.clone()),
            Ok(_) => return Err(lopdf::Error::Type.into()),
            Err(_) => AcroFormLocation::Missing,
        };
        let fields = match &acro_form {
            AcroFormLocation::Indirect(_, form) | AcroFormLocation::Inline(form) => {
                match form.get_deref(b"Fields", doc) {
                    Ok(fields) => fields.as_array()?.clone(),
                    Err(_) => Vec::new(),
                }
            }
            AcroFormLocation::Missing => Vec::new(),
        };
        let field_names = fields
            .iter()
            .filter_map(|field| {
                let field = doc.dereference(field).ok()?.1.as_dict().ok()?;
                field.get(b"T").and_then(Object::as_str).ok()
            })
            .map(decode_text_string)
            .collect();

        let page_id = *doc
            .get_pages()
            .get(&page_number)
            .ok_or(WriterError::PageOutOfRange(page_number))?;
        let page = doc.get_dictionary(page_id)?.clone();
        let annotations = match page.get_deref(b"Annots", doc) {
            Ok(annotations) => annotations.as_array()?.clone(),
            Err(_) => Vec::new(),
        };

        let dss = catalog
            .get_deref(b"DSS", doc)
            .and_then(Object::as_dict)
            .ok()
            .cloned();

        Ok(Self {
            catalog_id,
            catalog,
            acro_form,
            fields,
            field_names,
            page_id,
            page,
            annotations,
            dss,
        })
    }
}

/// `Signature`, `Signature2`, ... skipping names already taken.
fn unique_field_name(kind: SignatureKind, taken: &HashSet<String>) -> String {
    let base = match kind {
        SignatureKind::Approval => "Signature",
        SignatureKind::DocTimeStamp => "DocTimeStamp",
    };
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}{n}"))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| base.to_string())
}

fn signature_dictionary(signature: &NewSignature) -> Dictionary {
    let mut dict = match signature.kind {
        SignatureKind::Approval => dictionary! {
            "Type" => "Sig",
            "Filter" => "Adobe.PPKLite",
            "SubFilter" => "adbe.pkcs7.detached",
        },
        SignatureKind::DocTimeStamp => dictionary! {
            "Type" => "DocTimeStamp",
            "Filter" => "Adobe.PPKLite",
            "SubFilter" => "ETSI.RFC3161",
        },
    };
    dict.set(
        "ByteRange",
        BYTE_RANGE_PLACEHOLDER
            .iter()
            .map(|&v| Object::Integer(v))
            .collect::<Vec<_>>(),
    );
    dict.set(
        "Contents",
        Object::String(vec![0; SIGNATURE_CAPACITY], StringFormat::Hexadecimal),
    );

    if signature.kind == SignatureKind::Approval {
        dict.set("M", Object::string_literal(pdf_date(signature.signing_time)));
        if let Some(name) = signature.signer_name {
            dict.set("Name", text_string(name));
        }
        if let Some(metadata) = signature.metadata {
            for (key, value) in [
                ("Reason", &metadata.reason),
                ("Location", &metadata.location),
                ("ContactInfo", &metadata.contact_info),
            ] {
                if let Some(value) = value {
                    dict.set(key, text_string(value));
                }
            }
        }
    }
    dict
}

fn pdf_date(time: DateTime<Utc>) -> String {
    time.format("D:%Y%m%d%H%M%S+00'00'").to_string()
}

/// PDF text string: plain when ASCII, UTF-16BE with a byte order mark
/// otherwise.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        return Object::string_literal(text);
    }
    let mut bytes = vec![0xfe, 0xff];
    bytes.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
    Object::String(bytes, StringFormat::Hexadecimal)
}

/// Adds a `/DSS` dictionary holding the entries of `existing` plus
/// `material`, and returns its id.
fn add_dss(
    doc: &mut Document,
    existing: Option<Dictionary>,
    material: &ValidationMaterial,
) -> ObjectId {
    let mut dss = existing.unwrap_or_else(Dictionary::new);
    for (key, items) in [
        (b"Certs".as_slice(), &material.certificates),
        (b"CRLs".as_slice(), &material.crls),
    ] {
        let mut refs = dss
            .get(key)
            .and_then(Object::as_array)
            .cloned()
            .unwrap_or_default();
        for der in items {
            refs.push(doc.add_object(Stream::new(dictionary! {}, der.clone())).into());
        }
        if !refs.is_empty() {
            dss.set(key, refs);
        }
    }
    doc.add_object(dss)
}

fn appearance_stream(
    doc: &mut Document,
    signature: &NewSignature,
    width: f32,
    height: f32,
) -> Result<ObjectId, WriterError> {
    if let Some(image) = signature.seal_image {
        match seal_appearance(doc, image, width, height) {
            Ok(id) => return Ok(id),
            Err(e) => warn!(error = %e, "seal image can not be embedded, using text appearance"),
        }
    }
    text_appearance(doc, signature, width, height)
}

fn form_xobject(width: f32, height: f32, resources: Dictionary, content: Vec<u8>) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), Object::Real(width), Object::Real(height)],
            "Resources" => resources,
        },
        content,
    )
}

/// The seal image scaled to fit the box, centred.
fn seal_appearance(
    doc: &mut Document,
    image: &[u8],
    width: f32,
    height: f32,
) -> Result<ObjectId, WriterError> {
    let image = lopdf::xobject::image_from(image.to_vec())?;
    let image_width = image.dict.get(b"Width")?.as_i64()? as f32;
    let image_height = image.dict.get(b"Height")?.as_i64()? as f32;
    if image_width <= 0.0 || image_height <= 0.0 {
        return Err(lopdf::Error::Type.into());
    }

    let scale = (width / image_width).min(height / image_height);
    let (w, h) = (image_width * scale, image_height * scale);
    let (x, y) = ((width - w) / 2.0, (height - h) / 2.0);

    let image_id = doc.add_object(image);
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(w),
                    0.into(),
                    0.into(),
                    Object::Real(h),
                    Object::Real(x),
                    Object::Real(y),
                ],
            ),
            Operation::new("Do", vec!["Im0".into()]),
            Operation::new("Q", vec![]),
        ],
    };
    let resources = dictionary! { "XObject" => dictionary! { "Im0" => image_id } };
    Ok(doc.add_object(form_xobject(width, height, resources, content.encode()?)))
}

/// A frame around the signer name and signing date.
fn text_appearance(
    doc: &mut Document,
    signature: &NewSignature,
    width: f32,
    height: f32,
) -> Result<ObjectId, WriterError> {
    let mut lines = vec![
        format!(
            "Digitally signed by {}",
            signature.signer_name.unwrap_or("unknown signer")
        ),
        format!(
            "Date: {}",
            signature.signing_time.format("%Y-%m-%d %H:%M:%S UTC")
        ),
    ];
    if let Some(metadata) = signature.metadata {
        if let Some(reason) = &metadata.reason {
            lines.push(format!("Reason: {reason}"));
        }
        if let Some(location) = &metadata.location {
            lines.push(format!("Location: {location}"));
        }
    }

    let font_size = (height / (lines.len() as f32 + 1.0)).clamp(4.0, 12.0);
    let leading = font_size * 1.2;

    let mut operations = vec![
        Operation::new("q", vec![]),
        Operation::new("w", vec![Object::Real(0.5)]),
        Operation::new(
            "re",
            vec![
                Object::Real(0.25),
                Object::Real(0.25),
                Object::Real(width - 0.5),
                Object::Real(height - 0.5),
            ],
        ),
        Operation::new("S", vec![]),
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["Helv".into(), Object::Real(font_size)]),
        Operation::new("TL", vec![Object::Real(leading)]),
        Operation::new("Td", vec![2.into(), Object::Real(height - leading)]),
    ];
    for line in lines {
        operations.push(Operation::new(
            "Tj",
            vec![Object::string_literal(latin1(&line))],
        ));
        operations.push(Operation::new("T*", vec![]));
    }
    operations.push(Operation::new("ET", vec![]));
    operations.push(Operation::new("Q", vec![]));

    let resources = dictionary! {
        "Font" => dictionary! {
            "Helv" => dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Encoding" => "WinAnsiEncoding",
            },
        },
    };
    let content = Content { operations }.encode()?;
    Ok(doc.add_object(form_xobject(width, height, resources, content)))
}

/// Characters outside Latin-1 become `?`.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Rewrites the `/ByteRange` placeholder in the appended revision and
/// returns the position of the `/Contents` token.
fn patch_placeholders(bytes: &mut [u8], appended_from: usize) -> Result<Range<usize>, WriterError> {
    let contents = CONTENTS_REGEX
        .captures(&bytes[appended_from..])
        .and_then(|c| c.get(1))
        .filter(|zeros| zeros.len() == 2 * SIGNATURE_CAPACITY)
        .ok_or(WriterError::PlaceholderNotFound)?;
    let contents = appended_from + contents.start() - 1..appended_from + contents.end() + 1;

    let placeholder = BYTE_RANGE_REGEX
        .captures(&bytes[appended_from..])
        .and_then(|c| c.get(1))
        .ok_or(WriterError::PlaceholderNotFound)?;
    let placeholder = appended_from + placeholder.start()..appended_from + placeholder.end();

    let byte_range = [0, contents.start, contents.end, bytes.len() - contents.end];
    let mut patched = format!(
        "[{} {} {} {}]",
        byte_range[0], byte_range[1], byte_range[2], byte_range[3]
    )
    .into_bytes();
    if patched.len() > placeholder.len() {
        return Err(WriterError::PlaceholderNotFound);
    }
    patched.resize(placeholder.len(), b' ');
    bytes[placeholder].copy_from_slice(&patched);

    Ok(contents)
}
