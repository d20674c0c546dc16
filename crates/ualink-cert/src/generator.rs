//! Certificate generation for secured sessions
//!
//! Maintains a local certificate authority and issues client application
//! certificates carrying the application URI in their subject alternative name,
//! the way servers expect application instance certificates to look.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
    SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use ualink_core::config::CertConfig;
use ualink_core::error::CertificateError;

/// Backdating applied to not-before so freshly issued certificates survive clock skew.
const NOT_BEFORE_SKEW: time::Duration = time::Duration::minutes(5);

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

type Result<T> = std::result::Result<T, CertificateError>;

fn generation_failed(e: impl std::fmt::Display) -> CertificateError {
    CertificateError::GenerationFailed {
        reason: e.to_string(),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CertificateError::WriteFailed {
            path: parent.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    std::fs::write(path, contents).map_err(|e| CertificateError::WriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write key material readable by the owner only.
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    write_file(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            CertificateError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(())
}

/// `urn:{hostname}:ualink`, the application URI used when none is configured.
pub fn default_application_uri() -> String {
    let host = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "ualink-client".to_string());
    format!("urn:{}:ualink", host)
}

/// Key type of generated certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }

    fn generate(self) -> Result<KeyPair> {
        KeyPair::generate_for(self.signature_algorithm()).map_err(generation_failed)
    }
}

/// Contents of a client application certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: Option<String>,
    /// Country code (2-letter)
    pub country: Option<String>,
    pub application_uri: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub validity_days: u32,
    pub key_algorithm: KeyAlgorithm,
}

impl CertificateConfig {
    /// Strict application instance profile: the only SAN entry is the application URI.
    pub fn strict_ua(application_uri: Option<&str>) -> Self {
        let application_uri = application_uri
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(str::to_string)
            .unwrap_or_else(default_application_uri);

        Self {
            common_name: "ualink".to_string(),
            organization: "ualink".to_string(),
            organizational_unit: Some("UAClient".to_string()),
            country: Some("US".to_string()),
            application_uri,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            validity_days: 3650,
            key_algorithm: KeyAlgorithm::EcdsaP256,
        }
    }

    /// Strict profile plus DNS and IP SANs, for servers that check them on client certificates.
    pub fn with_dns(
        application_uri: Option<&str>,
        dns_names: Vec<String>,
        ip_addresses: Vec<IpAddr>,
    ) -> Self {
        let mut config = Self::strict_ua(application_uri);
        config.dns_names = dns_names;
        config.ip_addresses = ip_addresses;
        config
    }

    /// Strict profile with a P-384 key.
    pub fn p384(application_uri: Option<&str>) -> Self {
        let mut config = Self::strict_ua(application_uri);
        config.key_algorithm = KeyAlgorithm::EcdsaP384;
        config
    }

    /// Strict profile with subject fields taken from the certificate settings.
    pub fn from_settings(settings: &CertConfig, application_uri: Option<&str>) -> Self {
        let mut config = Self::strict_ua(application_uri);
        config.common_name = settings.common_name.clone();
        config.organization = settings.organization.clone();
        config.validity_days = settings.validity_days;
        config
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, &self.common_name);
        dn.push(DnType::OrganizationName, &self.organization);
        if let Some(ou) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        if let Some(country) = &self.country {
            dn.push(DnType::CountryName, country);
        }
        dn
    }

    fn subject_alt_names(&self) -> Result<Vec<SanType>> {
        let mut sans = Vec::new();
        let uri = self.application_uri.trim();
        if !uri.is_empty() {
            sans.push(SanType::URI(
                Ia5String::try_from(uri.to_string()).map_err(generation_failed)?,
            ));
        }
        for dns in &self.dns_names {
            sans.push(SanType::DnsName(
                Ia5String::try_from(dns.clone()).map_err(generation_failed)?,
            ));
        }
        sans.extend(self.ip_addresses.iter().map(|ip| SanType::IpAddress(*ip)));
        Ok(sans)
    }

    fn leaf_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name();
        params.subject_alt_names = self.subject_alt_names()?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let now = time::OffsetDateTime::now_utc() - NOT_BEFORE_SKEW;
        params.not_before = now;
        params.not_after = now + time::Duration::days(self.validity_days as i64);
        Ok(params)
    }
}

/// Paths written for one generated certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    /// `{stem}.der`
    pub cert_der: PathBuf,
    /// `{stem}.crt`
    pub cert_pem: PathBuf,
    /// `{stem}.key`, PKCS#8 PEM
    pub key_pem: PathBuf,
    /// `{stem}_key.der`
    pub key_der: PathBuf,
    /// `{stem}.pem`, certificate followed by key
    pub bundle: PathBuf,
}

/// A generated certificate and its private key in every encoding we hand out.
#[derive(Clone)]
pub struct GeneratedCertificate {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
}

impl std::fmt::Debug for GeneratedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCertificate")
            .field("cert_der", &format!("[{} bytes]", self.cert_der.len()))
            .field("key_pem", &"[PRIVATE KEY]")
            .finish()
    }
}

impl GeneratedCertificate {
    fn new(cert: &Certificate, key_pair: &KeyPair) -> Self {
        Self {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key_pair.serialize_der(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    /// Write `{stem}.der`, `{stem}.crt`, `{stem}.key`, `{stem}_key.der` and `{stem}.pem` under `dir`.
    pub fn write_files(&self, dir: &Path, stem: &str) -> Result<CertificatePaths> {
        let paths = CertificatePaths {
            cert_der: dir.join(format!("{}.der", stem)),
            cert_pem: dir.join(format!("{}.crt", stem)),
            key_pem: dir.join(format!("{}.key", stem)),
            key_der: dir.join(format!("{}_key.der", stem)),
            bundle: dir.join(format!("{}.pem", stem)),
        };

        write_file(&paths.cert_der, &self.cert_der)?;
        write_file(&paths.cert_pem, self.cert_pem.as_bytes())?;
        write_secret(&paths.key_pem, self.key_pem.as_bytes())?;
        write_secret(&paths.key_der, &self.key_der)?;
        write_secret(
            &paths.bundle,
            format!("{}{}", self.cert_pem, self.key_pem).as_bytes(),
        )?;

        info!(dir = %dir.display(), stem, "Certificate files written");
        Ok(paths)
    }
}

/// Local certificate authority used to sign client certificates
pub struct LocalCa {
    /// CA certificate in PEM format
    pub cert_pem: String,
    /// CA private key in PEM format
    pub key_pem: String,
}

impl std::fmt::Debug for LocalCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCa")
            .field("cert_pem", &"[CERTIFICATE]")
            .field("key_pem", &"[PRIVATE KEY]")
            .finish()
    }
}

impl LocalCa {
    /// Generate a new CA certificate
    pub fn generate(common_name: &str, organization: &str, validity_days: u32) -> Result<Self> {
        info!(common_name, "Generating local CA");

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);
        distinguished_name.push(DnType::OrganizationName, organization);

        let key_pair = KeyAlgorithm::default().generate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = time::OffsetDateTime::now_utc() - NOT_BEFORE_SKEW;
        params.not_before = now;
        params.not_after = now + time::Duration::days(validity_days as i64);

        let certificate = params.self_signed(&key_pair).map_err(generation_failed)?;

        Ok(Self {
            cert_pem: certificate.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load CA from existing PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(|e| CertificateError::NoPrivateKey {
            path: format!("CA key ({})", e),
        })?;
        CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| {
            CertificateError::InvalidCertificate {
                reason: format!("CA certificate: {}", e),
            }
        })?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Load CA from PEM files on disk
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| CertificateError::ReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        write_file(cert_path, self.cert_pem.as_bytes())?;
        write_secret(key_path, self.key_pem.as_bytes())?;
        info!(cert = %cert_path.display(), key = %key_path.display(), "CA saved");
        Ok(())
    }

    /// Load `ca.crt`/`ca.key` from `dir`, creating them on first use.
    pub fn ensure(dir: &Path, settings: &CertConfig) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            debug!(dir = %dir.display(), "Reusing local CA");
            return Self::from_files(&cert_path, &key_path);
        }

        let ca = Self::generate(
            &format!("{} Local CA", settings.common_name),
            &settings.organization,
            settings.validity_days,
        )?;
        ca.save_to_files(&cert_path, &key_path)?;
        Ok(ca)
    }

    /// Issue a client certificate signed by this CA
    pub fn issue(&self, config: &CertificateConfig) -> Result<GeneratedCertificate> {
        info!(
            common_name = %config.common_name,
            application_uri = %config.application_uri,
            "Issuing client certificate"
        );

        let ca_key_pair = KeyPair::from_pem(&self.key_pem).map_err(generation_failed)?;
        let ca_params =
            CertificateParams::from_ca_cert_pem(&self.cert_pem).map_err(generation_failed)?;
        let ca_cert = ca_params
            .self_signed(&ca_key_pair)
            .map_err(generation_failed)?;

        let key_pair = config.key_algorithm.generate()?;
        let cert = config
            .leaf_params()?
            .signed_by(&key_pair, &ca_cert, &ca_key_pair)
            .map_err(generation_failed)?;

        Ok(GeneratedCertificate::new(&cert, &key_pair))
    }
}

/// Generate a self-signed client certificate, for servers that trust leaf certificates directly.
pub fn generate_self_signed(config: &CertificateConfig) -> Result<GeneratedCertificate> {
    info!(application_uri = %config.application_uri, "Generating self-signed certificate");
    let key_pair = config.key_algorithm.generate()?;
    let cert = config
        .leaf_params()?
        .self_signed(&key_pair)
        .map_err(generation_failed)?;
    Ok(GeneratedCertificate::new(&cert, &key_pair))
}

/// Issue `client.*` under `dir` from the local CA there, creating the CA when missing.
pub fn issue_client_files(
    dir: &Path,
    settings: &CertConfig,
    config: &CertificateConfig,
) -> Result<CertificatePaths> {
    let ca = LocalCa::ensure(dir, settings)?;
    ca.issue(config)?.write_files(dir, "client")
}

/// A certificate signing request for an external CA.
#[derive(Clone)]
pub struct GeneratedCsr {
    pub csr_pem: String,
    pub key_pem: String,
}

impl GeneratedCsr {
    /// Write `client.csr` and `client.key` under `dir`.
    pub fn write_files(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let csr_path = dir.join("client.csr");
        let key_path = dir.join("client.key");
        write_file(&csr_path, self.csr_pem.as_bytes())?;
        write_secret(&key_path, self.key_pem.as_bytes())?;
        info!(csr = %csr_path.display(), "Certificate signing request written");
        Ok((csr_path, key_path))
    }
}

/// Build a CSR carrying the same subject and SANs an issued certificate would have.
pub fn generate_csr(config: &CertificateConfig) -> Result<GeneratedCsr> {
    let key_pair = config.key_algorithm.generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = config.distinguished_name();
    params.subject_alt_names = config.subject_alt_names()?;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(generation_failed)?;
    Ok(GeneratedCsr {
        csr_pem: csr.pem().map_err(generation_failed)?,
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator;

    #[test]
    fn test_presets() {
        let strict = CertificateConfig::strict_ua(Some("urn:plant:hmi"));
        assert_eq!(strict.application_uri, "urn:plant:hmi");
        assert!(strict.dns_names.is_empty());

        let dns = CertificateConfig::with_dns(
            None,
            vec!["hmi.local".to_string()],
            vec!["10.0.0.5".parse().unwrap()],
        );
        assert!(dns.application_uri.starts_with("urn:"));
        assert!(dns.application_uri.ends_with(":ualink"));
        assert_eq!(dns.ip_addresses.len(), 1);

        assert_eq!(CertificateConfig::p384(None).key_algorithm, KeyAlgorithm::EcdsaP384);
    }

    #[test]
    fn test_generate_ca() {
        let ca = LocalCa::generate("ualink Local CA", "ualink", 30).unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(LocalCa::from_pem(&ca.cert_pem, &ca.key_pem).is_ok());
    }

    #[test]
    fn test_issued_certificate_contents() {
        let ca = LocalCa::generate("ualink Local CA", "ualink", 30).unwrap();
        let config = CertificateConfig::with_dns(
            Some("urn:plant:hmi"),
            vec!["hmi.local".to_string()],
            Vec::new(),
        );
        let issued = ca.issue(&config).unwrap();

        let info = validator::describe(&issued.cert_der).unwrap();
        assert_eq!(info.uris, vec!["urn:plant:hmi".to_string()]);
        assert_eq!(info.dns_names, vec!["hmi.local".to_string()]);
        assert!(info.issuer.contains("ualink Local CA"));
        assert!(!info.is_ca);
        assert!(info.not_before < chrono::Utc::now() - chrono::Duration::minutes(4));
        assert_eq!(
            validator::application_uri(&issued.cert_der),
            Some("urn:plant:hmi".to_string())
        );
    }

    #[test]
    fn test_ensure_reuses_ca() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CertConfig::default();

        let first = LocalCa::ensure(dir.path(), &settings).unwrap();
        let second = LocalCa::ensure(dir.path(), &settings).unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
    }

    #[test]
    fn test_issue_client_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CertConfig::default();
        let config = CertificateConfig::strict_ua(Some("urn:plant:hmi"));

        let paths = issue_client_files(dir.path(), &settings, &config).unwrap();
        for path in [
            &paths.cert_der,
            &paths.cert_pem,
            &paths.key_pem,
            &paths.key_der,
            &paths.bundle,
        ] {
            assert!(path.exists(), "missing {}", path.display());
        }
        assert_eq!(paths.key_der, dir.path().join("client_key.der"));

        let info = validator::validate_certificate_files(&paths.cert_pem, &paths.key_pem).unwrap();
        assert_eq!(info.uris, vec!["urn:plant:hmi".to_string()]);
        assert!(validator::validate_certificate_files(&paths.cert_der, &paths.key_der).is_ok());
    }

    #[test]
    fn test_self_signed_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = CertificateConfig::p384(Some("urn:plant:hmi"));

        let generated = generate_self_signed(&config).unwrap();
        let paths = generated.write_files(dir.path(), "selfsigned").unwrap();
        assert_eq!(paths.cert_der, dir.path().join("selfsigned.der"));

        let info = validator::describe(&generated.cert_der).unwrap();
        assert_eq!(info.subject, info.issuer);
    }

    #[test]
    fn test_csr() {
        let dir = tempfile::tempdir().unwrap();
        let csr = generate_csr(&CertificateConfig::strict_ua(Some("urn:plant:hmi"))).unwrap();
        assert!(csr.csr_pem.contains("BEGIN CERTIFICATE REQUEST"));

        let (csr_path, key_path) = csr.write_files(dir.path()).unwrap();
        assert!(csr_path.ends_with("client.csr"));
        assert!(key_path.ends_with("client.key"));
    }
}
