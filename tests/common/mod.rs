#![allow(dead_code)]

use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use pdf_notary::authority::IssuedCertificate;
use pdf_notary::config::PdfSettings;
use pdf_notary::model::ArtifactType;
use pdf_notary::store::StoreLimits;
use pdf_notary::{
    CertificateAuthority, IssueRequest, KeyMaterialStore, LeafKeyAlgorithm,
    LocalTimestampAuthority, MemoryKeyStore, MemoryRepository, NoTimestampAuthority, Repository,
    RootKeyAlgorithm, SealRegistry, SigningEngine, TimestampAuthority, VerificationEngine,
};

pub const ROOT_CN: &str = "Test Root";

pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// A complete deployment over in-memory collaborators.
pub struct Notary {
    pub repository: Arc<MemoryRepository>,
    pub store: Arc<MemoryKeyStore>,
    pub ca: Arc<CertificateAuthority>,
}

impl Notary {
    pub fn new() -> Self {
        let repository = Arc::new(MemoryRepository::new());
        let store = Arc::new(MemoryKeyStore::ephemeral(StoreLimits::default()).unwrap());
        let ca = Arc::new(CertificateAuthority::new(repository.clone(), store.clone()));
        ca.generate_root_ca(RootKeyAlgorithm::EcP256, ROOT_CN, Some("Notary Test"), Some(1), 365)
            .unwrap();
        Self {
            repository,
            store,
            ca,
        }
    }

    pub fn issue(&self, owner: i64, common_name: &str) -> IssuedCertificate {
        self.ca
            .issue_certificate(
                IssueRequest::new(Some(owner), common_name, LeafKeyAlgorithm::EcP256),
                Some(owner),
            )
            .unwrap()
    }

    pub fn signer(&self) -> SigningEngine {
        self.signer_with(Arc::new(NoTimestampAuthority))
    }

    pub fn signer_with(&self, tsa: Arc<dyn TimestampAuthority>) -> SigningEngine {
        SigningEngine::new(
            self.ca.clone(),
            self.repository.clone(),
            self.store.clone(),
            tsa,
            PdfSettings::default(),
        )
    }

    pub fn verifier(&self) -> VerificationEngine {
        VerificationEngine::new(self.ca.clone())
    }

    pub fn seals(&self) -> SealRegistry {
        SealRegistry::new(self.repository.clone(), self.store.clone())
    }

    /// Root certificate and key as the engine stores them.
    pub fn root_material(&self) -> (X509, PKey<Private>) {
        let artifact = self
            .repository
            .latest_artifact(ArtifactType::RootCertificate)
            .unwrap()
            .unwrap();
        let key_pem = self
            .store
            .load_private_key(artifact.secret_id.unwrap())
            .unwrap();
        (
            self.ca.root_certificate().unwrap(),
            PKey::private_key_from_pem(key_pem.as_bytes()).unwrap(),
        )
    }

    /// PKCS #12 bundle of a leaf signed by the root but built outside the
    /// engine, as an external tool would.
    pub fn external_bundle(&self, common_name: &str, passphrase: &str) -> Vec<u8> {
        let (root, root_key) = self.root_material();
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)
            .unwrap();
        let name = name.build();
        let mut serial = BigNum::new().unwrap();
        serial.rand(120, MsbOption::MAYBE_ZERO, false).unwrap();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(root.subject_name()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(90).unwrap())
            .unwrap();
        builder.sign(&root_key, MessageDigest::sha256()).unwrap();

        Pkcs12::builder()
            .name(common_name)
            .pkey(&key)
            .cert(&builder.build())
            .build2(passphrase)
            .unwrap()
            .to_der()
            .unwrap()
    }

    /// A time-stamp authority whose certificate chains to the root.
    pub fn timestamp_authority(&self) -> LocalTimestampAuthority {
        let (certificate, key) = unpack(&self.issue(900, "Notary TSA"));
        LocalTimestampAuthority::new(certificate, key)
    }
}

/// Certificate and key of an issued PKCS #12 bundle.
pub fn unpack(issued: &IssuedCertificate) -> (X509, PKey<Private>) {
    let parsed = Pkcs12::from_der(&issued.pkcs12)
        .unwrap()
        .parse2(issued.passphrase.as_deref().unwrap_or(""))
        .unwrap();
    (parsed.cert.unwrap(), parsed.pkey.unwrap())
}

/// Minimal PDF with `pages` pages, each showing "Page N".
pub fn blank_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });

    let mut kids = Vec::new();
    for n in 0..pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 18.into()]),
                Operation::new("Td", vec![100.into(), 600.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::string_literal(format!("Page {}", n + 1))],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

pub fn page_count(pdf: &[u8]) -> usize {
    Document::load_mem(pdf).unwrap().get_pages().len()
}
