//! Secure-channel provisioning for ualink
//!
//! Turns `ClientConfig` into the `SessionOptions` a session is opened with:
//! security policy and mode normalization, user identity, client certificate
//! and key loading with key matching, and application URI discovery.
//!
//! Also maintains a local CA for issuing client application certificates,
//! builds CSRs for external CAs, and inspects or validates certificate files.

pub mod generator;
pub mod loader;
pub mod provisioner;
pub mod validator;

pub use generator::{
    default_application_uri, generate_csr, generate_self_signed, issue_client_files,
    CertificateConfig, CertificatePaths, GeneratedCertificate, GeneratedCsr, KeyAlgorithm,
    LocalCa,
};
pub use loader::{load_certificates, load_private_key, PrivateKey};
pub use provisioner::{provision, Provisioner, DEFAULT_PRODUCT_URI};
pub use validator::{certificate_info, validate_certificate_files, CertificateInfo};
