//! Decides what an incremental update changed relative to the revision it
//! extends.
//!
//! The previous revision is only read through [`Tracked`], which records
//! every indirect object it visits. After the structural comparison, an xref
//! entry that differs between the two revisions but was never visited is a
//! change nothing accounted for.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use lopdf::xref::XrefEntry;
use lopdf::{Dictionary, Document, Object, ObjectId};
use thiserror::Error;

use crate::embedded::Signature;
use crate::verification::ModificationLevel;
use crate::ExactArrayOrNone;

#[derive(Error, Debug)]
pub enum IncrementError {
    #[error("catalog changed beyond the signature")]
    Catalog,
    #[error("/AcroForm changed beyond the signature field")]
    AcroForm,
    #[error("/SigFlags must be 3")]
    SigFlags,
    #[error("expected exactly one new reference in {0}")]
    NotOneAddition(&'static str),
    #[error("more than one page changed")]
    SeveralPagesChanged,
    #[error("page dictionary changed beyond /Annots")]
    Page,
    #[error("number of pages changed")]
    PageCount,
    #[error("signature widget is malformed")]
    Widget,
    #[error("signature field does not hold the signature")]
    Field,
    #[error("signature dictionary is not where the xref says")]
    SignatureMoved,
    #[error("object {0} {1} changed outside the tracked structure")]
    UntrackedChange(u32, u16),
    #[error("object {0} is missing from one of the revisions")]
    MissingObject(u32),
}

/// The previous revision, remembering which indirect objects were visited.
struct Tracked<'a> {
    doc: &'a Document,
    visited: RefCell<HashMap<u32, u16>>,
}

impl<'a> Tracked<'a> {
    fn new(doc: &'a Document) -> Self {
        Self {
            doc,
            visited: RefCell::new(HashMap::new()),
        }
    }

    fn object(&self, id: ObjectId) -> Result<&'a Object> {
        let earlier = self.visited.borrow_mut().insert(id.0, id.1);
        if earlier.is_some_and(|generation| generation != id.1) {
            return Err(lopdf::Error::ObjectIdMismatch.into());
        }
        Ok(self.doc.get_object(id)?)
    }

    /// Follows a single reference. Only the first hop of a chain may be
    /// rewritten by an increment, so only that one is recorded.
    fn resolve(&self, obj: &'a Object) -> Result<&'a Object> {
        match obj {
            Object::Reference(id) => self.object(*id),
            direct => Ok(direct),
        }
    }

    fn resolve_dict(&self, obj: &'a Object) -> Result<&'a Dictionary> {
        Ok(self.resolve(obj)?.as_dict()?)
    }

    fn catalog(&self) -> Result<&'a Dictionary> {
        self.resolve_dict(self.doc.trailer.get(b"Root")?)
    }

    /// Objects whose xref entry differs in `newer` without being visited.
    fn unvisited_changes(self, newer: &Document) -> Result<Vec<ObjectId>> {
        let visited = self.visited.into_inner();
        let mut changed = Vec::new();

        for (&number, entry) in &self.doc.reference_table.entries {
            if visited.contains_key(&number) {
                continue;
            }
            let newer_entry = newer
                .reference_table
                .entries
                .get(&number)
                .ok_or(IncrementError::MissingObject(number))?;
            if !same_entry(entry, newer_entry) {
                changed.push((number, generation_of(entry)));
            }
        }

        Ok(changed)
    }
}

fn same_entry(a: &XrefEntry, b: &XrefEntry) -> bool {
    match (a, b) {
        (
            XrefEntry::Normal { offset, generation },
            XrefEntry::Normal {
                offset: other_offset,
                generation: other_generation,
            },
        ) => offset == other_offset && generation == other_generation,
        (
            XrefEntry::Compressed { container, index },
            XrefEntry::Compressed {
                container: other_container,
                index: other_index,
            },
        ) => container == other_container && index == other_index,
        (XrefEntry::Free, XrefEntry::Free)
        | (XrefEntry::UnusableFree, XrefEntry::UnusableFree) => true,
        _ => false,
    }
}

fn generation_of(entry: &XrefEntry) -> u16 {
    match entry {
        XrefEntry::Normal { generation, .. } => *generation,
        _ => 0,
    }
}

/// Page and box of the widget a signature increment added.
#[derive(Debug)]
pub struct WidgetPlacement {
    pub page_number: u32,
    pub rect: [f32; 4],
}

/// Checks that the increment from `previous` to `doc` only adds `signature`:
/// one signature field, at most one widget on one page, and optionally
/// `/DSS` validation material.
pub fn verify_increment(
    signature: &Signature,
    doc: &Document,
    previous: &Document,
) -> Result<Option<WidgetPlacement>> {
    let entry = doc
        .reference_table
        .entries
        .get(&signature.obj_id.0)
        .ok_or(IncrementError::SignatureMoved)?;
    let expected = XrefEntry::Normal {
        offset: signature.offset,
        generation: signature.obj_id.1,
    };
    if !same_entry(entry, &expected) {
        return Err(IncrementError::SignatureMoved.into());
    }

    let tracked = Tracked::new(previous);
    let catalog = compare_catalogs(doc, &tracked, true)?;
    let form = doc.catalog()?.get_deref(b"AcroForm", doc)?.as_dict()?;
    verify_acro_form(doc, form, catalog.previous_form, &tracked, signature.obj_id)?;

    let placement = match changed_pages(doc, previous)?.as_slice() {
        [] => None,
        &[(page_number, page_id, changed_id)] => {
            let (annots, previous_annots) = page_annotations(
                doc,
                doc.get_dictionary(changed_id)?,
                tracked.object(page_id)?.as_dict()?,
                &tracked,
            )?;
            let widget = single_addition(annots, previous_annots, "/Annots")?;
            Some(WidgetPlacement {
                page_number,
                rect: widget_rect(doc, changed_id, widget)?,
            })
        }
        _ => return Err(IncrementError::SeveralPagesChanged.into()),
    };

    if let Some(&(number, generation)) = tracked.unvisited_changes(doc)?.first() {
        return Err(IncrementError::UntrackedChange(number, generation).into());
    }
    Ok(placement)
}

/// Classifies an increment that carries no signature of its own.
///
/// Adding or replacing `/DSS` is an LTA update, adding annotations to pages
/// is an annotation change and changing the value or appearance of existing
/// non-signature fields is form filling. Anything else is an error.
pub fn classify_unsigned_increment(
    doc: &Document,
    previous: &Document,
) -> Result<ModificationLevel> {
    let tracked = Tracked::new(previous);
    let catalog = compare_catalogs(doc, &tracked, false)?;
    let mut level = if catalog.dss_changed {
        ModificationLevel::LtaUpdates
    } else {
        ModificationLevel::None
    };

    for (_, page_id, changed_id) in changed_pages(doc, previous)? {
        let (annots, previous_annots) = page_annotations(
            doc,
            doc.get_dictionary(changed_id)?,
            tracked.object(page_id)?.as_dict()?,
            &tracked,
        )?;
        if previous_annots.iter().any(|annot| !annots.contains(annot)) {
            return Err(IncrementError::Page.into());
        }
        if annots.len() > previous_annots.len() {
            level = level.max(ModificationLevel::Annotations);
        }
    }

    for (number, generation) in tracked.unvisited_changes(doc)? {
        if !is_filled_field(doc, previous, (number, generation)) {
            return Err(IncrementError::UntrackedChange(number, generation).into());
        }
        level = level.max(ModificationLevel::FormFilling);
    }

    Ok(level)
}

struct CatalogChanges<'a> {
    dss_changed: bool,
    previous_form: Option<&'a Dictionary>,
}

/// Compares the catalogs entry by entry. `/DSS` may be added or replaced.
/// With `form_may_change`, `/AcroForm` may be added, and an existing one is
/// returned for a closer look instead of being compared.
fn compare_catalogs<'a>(
    doc: &Document,
    tracked: &Tracked<'a>,
    form_may_change: bool,
) -> Result<CatalogChanges<'a>> {
    let catalog = doc.catalog()?;
    let previous = tracked.catalog()?;
    let mut changes = CatalogChanges {
        dss_changed: false,
        previous_form: None,
    };

    for (key, value) in previous.iter() {
        let current = catalog.get(key).ok();
        if key == b"DSS" {
            tracked.resolve(value)?;
            let rewritten = match value {
                Object::Reference(id) => first_changed_in_chain(doc, tracked.doc, *id)?.is_some(),
                _ => false,
            };
            changes.dss_changed |= rewritten || current != Some(value);
        } else if key == b"AcroForm" && form_may_change {
            changes.previous_form = Some(tracked.resolve_dict(value)?);
        } else if current != Some(value) {
            return Err(IncrementError::Catalog.into());
        }
    }

    for (key, _) in catalog.iter() {
        if previous.has(key) {
            continue;
        }
        if key == b"DSS" {
            changes.dss_changed = true;
        } else if !(key == b"AcroForm" && form_may_change) {
            return Err(IncrementError::Catalog.into());
        }
    }

    Ok(changes)
}

/// Entries a signature may add to `/AcroForm`.
const FORM_ADDITIONS: [&[u8]; 4] = [b"Fields", b"SigFlags", b"DA", b"DR"];

/// The form may only gain one field, which must hold `signature_id`, plus
/// `/SigFlags 3` and `/DA` or `/DR` when they were missing.
fn verify_acro_form<'a>(
    doc: &Document,
    form: &Dictionary,
    previous: Option<&'a Dictionary>,
    tracked: &Tracked<'a>,
    signature_id: ObjectId,
) -> Result<()> {
    let mut previous_fields: &[Object] = &[];
    if let Some(previous) = previous {
        for (key, value) in previous.iter() {
            if key == b"Fields" {
                previous_fields = tracked.resolve(value)?.as_array()?.as_slice();
            } else if form.get(key).ok() != Some(value) {
                return Err(IncrementError::AcroForm.into());
            }
        }
    }

    let unexpected = form.iter().any(|(key, _)| {
        !previous.is_some_and(|previous| previous.has(key))
            && !FORM_ADDITIONS.contains(&key.as_slice())
    });
    if unexpected {
        return Err(IncrementError::AcroForm.into());
    }
    if form.get(b"SigFlags")?.as_i64()? != 3 {
        return Err(IncrementError::SigFlags.into());
    }

    let fields = form.get_deref(b"Fields", doc)?.as_array()?;
    let field = doc.get_dictionary(single_addition(fields, previous_fields, "/Fields")?)?;
    if field.get_deref(b"FT", doc)?.as_name()? != b"Sig"
        || field.get(b"V")?.as_reference()? != signature_id
    {
        return Err(IncrementError::Field.into());
    }
    Ok(())
}

/// The one reference `current` holds beyond those of `previous`, in any
/// order. Every element of both arrays must be a reference.
fn single_addition(
    current: &[Object],
    previous: &[Object],
    array: &'static str,
) -> Result<ObjectId> {
    let mut remaining = current
        .iter()
        .map(Object::as_reference)
        .collect::<lopdf::Result<Vec<_>>>()?;
    remaining.sort_unstable();

    for obj in previous {
        let id = obj.as_reference()?;
        let pos = remaining
            .binary_search(&id)
            .map_err(|_| IncrementError::NotOneAddition(array))?;
        remaining.remove(pos);
    }

    match remaining.as_slice() {
        &[added] => Ok(added),
        _ => Err(IncrementError::NotOneAddition(array).into()),
    }
}

/// Pages whose object changed, as `(page number, page id, changed id)` where
/// the changed id is the first rewritten object of the reference chain.
fn changed_pages(doc: &Document, previous: &Document) -> Result<Vec<(u32, ObjectId, ObjectId)>> {
    let pages = doc.get_pages();
    if pages.len() != previous.get_pages().len() {
        return Err(IncrementError::PageCount.into());
    }

    let mut changed = Vec::new();
    for (page_number, page_id) in pages {
        if let Some(changed_id) = first_changed_in_chain(doc, previous, page_id)? {
            changed.push((page_number, page_id, changed_id));
        }
    }
    Ok(changed)
}

/// Walks the reference chain from `id` and returns the first object whose
/// xref entry differs between the revisions.
fn first_changed_in_chain(
    doc: &Document,
    previous: &Document,
    mut id: ObjectId,
) -> Result<Option<ObjectId>> {
    let mut seen = HashSet::new();
    loop {
        if !seen.insert(id.0) {
            return Err(lopdf::Error::ReferenceLimit.into());
        }
        let (Some(entry), Some(previous_entry)) = (
            doc.reference_table.entries.get(&id.0),
            previous.reference_table.entries.get(&id.0),
        ) else {
            return Err(IncrementError::MissingObject(id.0).into());
        };
        if !same_entry(entry, previous_entry) {
            return Ok(Some(id));
        }
        match doc.get_object(id)? {
            Object::Reference(next) => id = *next,
            _ => return Ok(None),
        }
    }
}

/// Requires the page dictionaries to be equal apart from `/Annots` and
/// returns the current and previous annotation arrays.
fn page_annotations<'a>(
    doc: &'a Document,
    page: &'a Dictionary,
    previous_page: &'a Dictionary,
    tracked: &Tracked<'a>,
) -> Result<(&'a [Object], &'a [Object])> {
    let mut previous_annots: &[Object] = &[];
    for (key, value) in previous_page.iter() {
        if key == b"Annots" {
            previous_annots = tracked.resolve(value)?.as_array()?.as_slice();
        } else if page.get(key).ok() != Some(value) {
            return Err(IncrementError::Page.into());
        }
    }
    if page
        .iter()
        .any(|(key, _)| key != b"Annots" && !previous_page.has(key))
    {
        return Err(IncrementError::Page.into());
    }

    let annots = page.get_deref(b"Annots", doc)?.as_array()?.as_slice();
    Ok((annots, previous_annots))
}

/// Keys a form filler may change on a field or its widget.
const FILLABLE_KEYS: [&[u8]; 3] = [b"V", b"AS", b"AP"];

/// Whether object `id` is a non-signature field or widget that only had its
/// value or appearance changed.
fn is_filled_field(doc: &Document, previous: &Document, id: ObjectId) -> bool {
    let (Ok(before), Ok(after)) = (previous.get_dictionary(id), doc.get_dictionary(id)) else {
        return false;
    };

    let has_name = |dict: &Dictionary, key: &[u8], name: &[u8]| {
        dict.get(key)
            .and_then(Object::as_name)
            .is_ok_and(|n| n == name)
    };
    let is_field =
        before.has(b"T") || before.has(b"FT") || has_name(before, b"Subtype", b"Widget");
    if !is_field || has_name(before, b"FT", b"Sig") {
        return false;
    }

    let fixed = |dict: &Dictionary| {
        dict.iter()
            .filter(|(key, _)| !FILLABLE_KEYS.contains(&key.as_slice()))
            .count()
    };
    fixed(before) == fixed(after)
        && before
            .iter()
            .filter(|(key, _)| !FILLABLE_KEYS.contains(&key.as_slice()))
            .all(|(key, value)| after.get(key).is_ok_and(|other| other == value))
}

/// `/Rect` of the signature widget `widget_id`, which must be a widget
/// annotation belonging to `page_id` when it names its page.
fn widget_rect(doc: &Document, page_id: ObjectId, widget_id: ObjectId) -> Result<[f32; 4]> {
    let widget = doc.get_dictionary(widget_id)?;

    match widget.get_deref(b"Type", doc) {
        Ok(kind) => {
            if kind.as_name()? != b"Annot" {
                return Err(IncrementError::Widget.into());
            }
        }
        Err(lopdf::Error::DictKey) => {}
        Err(e) => return Err(e.into()),
    }
    if let Ok(page) = widget.get(b"P") {
        if page.as_reference()? != page_id {
            return Err(IncrementError::Widget.into());
        }
    }
    if widget.get_deref(b"Subtype", doc)?.as_name()? != b"Widget" {
        return Err(IncrementError::Widget.into());
    }

    widget
        .get_deref(b"Rect", doc)?
        .as_array()?
        .iter()
        .map(|value| doc.dereference(value).and_then(|(_, value)| value.as_float()))
        .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()?
        .0
        .ok_or_else(|| IncrementError::Widget.into())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lopdf::{dictionary, IncrementalDocument};

    use super::*;
    use crate::embedded::signature_fields;
    use crate::signature_writer::{prepare, NewSignature, ValidationMaterial};
    use crate::testing;

    /// Appends one revision holding whatever `edit` puts in the new document.
    fn increment(pdf: &[u8], edit: impl FnOnce(&Document, &mut Document)) -> Vec<u8> {
        let mut base = pdf.to_vec();
        base.push(b'\n');
        let prev = Document::load_mem(&base).unwrap();
        let mut inc =
            IncrementalDocument::create_from(base.clone(), Document::load_mem(&base).unwrap());
        edit(&prev, &mut inc.new_document);
        inc.new_document
            .trailer
            .set("Root", prev.trailer.get(b"Root").unwrap().clone());
        let mut out = Vec::new();
        inc.save_to(&mut out).unwrap();
        out
    }

    fn classify(curr: &[u8], prev: &[u8]) -> Result<ModificationLevel> {
        classify_unsigned_increment(
            &Document::load_mem(curr).unwrap(),
            &Document::load_mem(prev).unwrap(),
        )
    }

    fn sign(pdf: &[u8], signature: &NewSignature) -> Vec<u8> {
        prepare(pdf, signature).unwrap().finish(&[1, 2, 3]).unwrap()
    }

    fn catalog_of(doc: &Document) -> (ObjectId, Dictionary) {
        let id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
        (id, doc.get_dictionary(id).unwrap().clone())
    }

    #[test]
    fn signature_increment_is_allowed() {
        let pdf = testing::blank_pdf(2);
        let signed = sign(&pdf, &NewSignature::approval("Alice", Utc::now()));

        let curr = Document::load_mem(&signed).unwrap();
        let prev = Document::load_mem(&pdf).unwrap();
        let field = signature_fields(&signed, &curr).unwrap().remove(0);
        let widget = verify_increment(&field.signature.unwrap(), &curr, &prev)
            .unwrap()
            .unwrap();
        assert_eq!(widget.page_number, 1);
        assert_eq!(widget.rect, [0.0; 4]);
    }

    #[test]
    fn countersignature_with_dss_is_allowed() {
        let pdf = testing::blank_pdf(1);
        let once = sign(&pdf, &NewSignature::approval("Alice", Utc::now()));
        let material = ValidationMaterial {
            certificates: vec![b"certificate".to_vec()],
            crls: vec![b"crl".to_vec()],
        };
        let mut second = NewSignature::approval("Bob", Utc::now());
        second.validation_material = Some(&material);
        let twice = sign(&once, &second);

        let curr = Document::load_mem(&twice).unwrap();
        let prev = Document::load_mem(&once).unwrap();
        let fields = signature_fields(&twice, &curr).unwrap();
        let latest = fields
            .into_iter()
            .filter_map(|f| f.signature.ok())
            .max_by_key(|s| s.coverage_end)
            .unwrap();
        assert!(verify_increment(&latest, &curr, &prev).is_ok());
    }

    #[test]
    fn signature_with_other_changes_is_rejected() {
        let pdf = testing::blank_pdf(1);
        let signed = sign(&pdf, &NewSignature::approval("Alice", Utc::now()));
        let tampered = increment(&signed, |prev, doc| {
            let (id, mut catalog) = catalog_of(prev);
            catalog.set("Lang", Object::string_literal("en"));
            doc.objects.insert(id, Object::Dictionary(catalog));
        });

        let curr = Document::load_mem(&tampered).unwrap();
        let prev = Document::load_mem(&pdf).unwrap();
        let field = signature_fields(&tampered, &curr).unwrap().remove(0);
        assert!(verify_increment(&field.signature.unwrap(), &curr, &prev).is_err());
    }

    #[test]
    fn empty_increment_changes_nothing() {
        let pdf = testing::blank_pdf(1);
        let next = increment(&pdf, |_, _| {});
        assert_eq!(classify(&next, &pdf).unwrap(), ModificationLevel::None);
    }

    #[test]
    fn added_dss_is_an_lta_update() {
        let pdf = testing::blank_pdf(1);
        let next = increment(&pdf, |prev, doc| {
            let (id, mut catalog) = catalog_of(prev);
            let dss = doc.add_object(dictionary! { "Certs" => Vec::<Object>::new() });
            catalog.set("DSS", dss);
            doc.objects.insert(id, Object::Dictionary(catalog));
        });
        assert_eq!(classify(&next, &pdf).unwrap(), ModificationLevel::LtaUpdates);
    }

    #[test]
    fn added_annotation_is_an_annotation_change() {
        let pdf = testing::blank_pdf(2);
        let next = increment(&pdf, |prev, doc| {
            let page_id = prev.get_pages()[&2];
            let mut page = prev.get_dictionary(page_id).unwrap().clone();
            let note = doc.add_object(dictionary! {
                "Type" => "Annot",
                "Subtype" => "Text",
                "Rect" => vec![0.into(), 0.into(), 10.into(), 10.into()],
                "Contents" => Object::string_literal("note"),
            });
            page.set("Annots", vec![note.into()]);
            doc.objects.insert(page_id, Object::Dictionary(page));
        });
        assert_eq!(classify(&next, &pdf).unwrap(), ModificationLevel::Annotations);
    }

    #[test]
    fn changed_page_is_rejected() {
        let pdf = testing::blank_pdf(1);
        let next = increment(&pdf, |prev, doc| {
            let page_id = prev.get_pages()[&1];
            let mut page = prev.get_dictionary(page_id).unwrap().clone();
            page.set("Rotate", 90);
            doc.objects.insert(page_id, Object::Dictionary(page));
        });
        assert!(classify(&next, &pdf).is_err());
    }

    /// Blank document with one text field holding "before".
    fn with_text_field() -> (Vec<u8>, ObjectId) {
        let mut doc = Document::load_mem(&testing::blank_pdf(1)).unwrap();
        let field_id = doc.add_object(dictionary! {
            "FT" => "Tx",
            "T" => Object::string_literal("name"),
            "V" => Object::string_literal("before"),
        });
        let (catalog_id, mut catalog) = catalog_of(&doc);
        catalog.set("AcroForm", dictionary! { "Fields" => vec![field_id.into()] });
        doc.objects.insert(catalog_id, Object::Dictionary(catalog));
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        (bytes, field_id)
    }

    #[test]
    fn new_field_value_is_form_filling() {
        let (pdf, field_id) = with_text_field();
        let next = increment(&pdf, |prev, doc| {
            let mut field = prev.get_dictionary(field_id).unwrap().clone();
            field.set("V", Object::string_literal("after"));
            doc.objects.insert(field_id, Object::Dictionary(field));
        });
        assert_eq!(classify(&next, &pdf).unwrap(), ModificationLevel::FormFilling);
    }

    #[test]
    fn renamed_field_is_rejected() {
        let (pdf, field_id) = with_text_field();
        let next = increment(&pdf, |prev, doc| {
            let mut field = prev.get_dictionary(field_id).unwrap().clone();
            field.set("T", Object::string_literal("other"));
            doc.objects.insert(field_id, Object::Dictionary(field));
        });
        assert!(classify(&next, &pdf).is_err());
    }
}
