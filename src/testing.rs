//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Name, X509};
use uuid::Uuid;

use crate::authority::{CertificateAuthority, IssueRequest, LeafKeyAlgorithm, RootKeyAlgorithm};
use crate::model::{ArtifactType, CaArtifact, Certificate, CertificateStatus, Seal, UserId};
use crate::openssl::{asn1_time, build_name, generate_ec_p256, random_serial, sign_detached};
use crate::repository::{self, Changeset, MemoryRepository, Repository, RepositoryError};
use crate::signature_writer::{prepare, NewSignature};
use crate::store::{KeyMaterialStore, MemoryKeyStore, StoreLimits};

pub const ROOT_CN: &str = "Test Root";

/// A 1x1 RGBA PNG.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

pub fn key_store() -> MemoryKeyStore {
    MemoryKeyStore::ephemeral(StoreLimits::default()).unwrap()
}

/// Self-signed EC CA certificate, independent of any repository.
pub fn self_signed(common_name: &str) -> (X509, PKey<Private>) {
    let key = generate_ec_p256().unwrap();
    let name = build_name(common_name, None).unwrap();
    let now = Utc::now();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&random_serial().unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&asn1_time(now - Duration::days(1)).unwrap())
        .unwrap();
    builder
        .set_not_after(&asn1_time(now + Duration::days(30)).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// PKCS #12 bundle of a fresh EC leaf issued by `issuer`. An empty
/// `common_name` leaves the CN out of the subject.
pub fn leaf_bundle(
    issuer: &X509,
    issuer_key: &PKey<Private>,
    organization: Option<&str>,
    common_name: &str,
    passphrase: &str,
) -> Vec<u8> {
    let key = generate_ec_p256().unwrap();
    let mut name = X509Name::builder().unwrap();
    if !common_name.is_empty() {
        name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    }
    if let Some(organization) = organization {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)
            .unwrap();
    }
    let name = name.build();
    let now = Utc::now();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&random_serial().unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(issuer.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&asn1_time(now - Duration::minutes(1)).unwrap())
        .unwrap();
    builder
        .set_not_after(&asn1_time(now + Duration::days(30)).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().build().unwrap())
        .unwrap();
    builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let mut chain = Stack::new().unwrap();
    chain.push(issuer.clone()).unwrap();
    Pkcs12::builder()
        .name("imported")
        .pkey(&key)
        .cert(&cert)
        .ca(chain)
        .build2(passphrase)
        .unwrap()
        .to_der()
        .unwrap()
}

/// Repository that refuses every commit while `reject` is set, the way a
/// concurrent writer winning a uniqueness race would.
#[derive(Default)]
pub struct ContendedRepository {
    pub inner: MemoryRepository,
    pub reject: AtomicBool,
}

impl ContendedRepository {
    pub fn reject_commits(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

impl Repository for ContendedRepository {
    fn latest_artifact(
        &self,
        artifact_type: ArtifactType,
    ) -> repository::Result<Option<CaArtifact>> {
        self.inner.latest_artifact(artifact_type)
    }

    fn get_artifact(&self, id: Uuid) -> repository::Result<Option<CaArtifact>> {
        self.inner.get_artifact(id)
    }

    fn list_artifacts(
        &self,
        artifact_type: ArtifactType,
    ) -> repository::Result<Vec<CaArtifact>> {
        self.inner.list_artifacts(artifact_type)
    }

    fn get_certificate(&self, id: Uuid) -> repository::Result<Option<Certificate>> {
        self.inner.get_certificate(id)
    }

    fn certificate_by_serial(
        &self,
        serial_number: &str,
    ) -> repository::Result<Option<Certificate>> {
        self.inner.certificate_by_serial(serial_number)
    }

    fn list_certificates(&self, owner: Option<UserId>) -> repository::Result<Vec<Certificate>> {
        self.inner.list_certificates(owner)
    }

    fn certificates_with_status(
        &self,
        status: CertificateStatus,
    ) -> repository::Result<Vec<Certificate>> {
        self.inner.certificates_with_status(status)
    }

    fn get_seal(&self, id: Uuid) -> repository::Result<Option<Seal>> {
        self.inner.get_seal(id)
    }

    fn commit(&self, changeset: Changeset) -> repository::Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(RepositoryError::Conflict("concurrent writer".to_string()));
        }
        self.inner.commit(changeset)
    }
}

/// A CA engine over fresh in-memory collaborators.
pub struct Fixture {
    pub repository: Arc<MemoryRepository>,
    pub store: Arc<MemoryKeyStore>,
    pub ca: Arc<CertificateAuthority>,
}

impl Fixture {
    pub fn new() -> Self {
        let repository = Arc::new(MemoryRepository::new());
        let store = Arc::new(key_store());
        let ca = Arc::new(CertificateAuthority::new(repository.clone(), store.clone()));
        Self {
            repository,
            store,
            ca,
        }
    }

    /// Fixture with an EC P-256 root named [`ROOT_CN`].
    pub fn with_root() -> Self {
        let fixture = Self::new();
        fixture
            .ca
            .generate_root_ca(RootKeyAlgorithm::EcP256, ROOT_CN, None, Some(1), 30)
            .unwrap();
        fixture
    }

    /// Root certificate and key, read back the way the engine stores them.
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

    /// Bundle signed by the managed root but packed outside the engine.
    pub fn external_bundle(
        &self,
        organization: Option<&str>,
        common_name: &str,
        passphrase: &str,
    ) -> Vec<u8> {
        let (root, key) = self.root_material();
        leaf_bundle(&root, &key, organization, common_name, passphrase)
    }

    pub fn issue(&self, owner: UserId, common_name: &str) -> Certificate {
        self.ca
            .issue_certificate(
                IssueRequest::new(Some(owner), common_name, LeafKeyAlgorithm::EcP256),
                Some(owner),
            )
            .unwrap()
            .certificate
    }
}

/// Minimal PDF with `pages` A4 pages, each showing a line of text.
pub fn blank_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for n in 0..pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
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
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
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

/// Appends an invisible approval signature made directly with `key`.
pub fn sign_pdf(pdf: &[u8], certificate: &X509, key: &PKey<Private>) -> Vec<u8> {
    let prepared = prepare(pdf, &NewSignature::approval("Test signer", Utc::now())).unwrap();
    let container = sign_detached(certificate, key, &prepared.signed_data()).unwrap();
    prepared.finish(&container).unwrap()
}
