//! Certificate inspection: key matching, application URI discovery, validity checks.

use crate::loader::{self, PrivateKey};
use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};
use ualink_core::error::CertificateError;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

/// Human-readable summary of one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
}

impl CertificateInfo {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

impl fmt::Display for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f, "Issuer: {}", self.issuer)?;
        writeln!(f, "Valid from: {}", self.not_before.format(FORMAT))?;
        writeln!(f, "Valid until: {}", self.not_after.format(FORMAT))?;
        writeln!(f, "Serial Number: {}", self.serial)?;
        if !self.dns_names.is_empty() {
            writeln!(f, "DNS Names: {}", self.dns_names.join(", "))?;
        }
        if !self.uris.is_empty() {
            writeln!(f, "URIs: {}", self.uris.join(", "))?;
        }
        Ok(())
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| CertificateError::InvalidCertificate {
            reason: e.to_string(),
        })
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn san_entries(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut dns_names = Vec::new();
    let mut uris = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::URI(uri) => uris.push(uri.to_string()),
                _ => {}
            }
        }
    }
    (dns_names, uris)
}

/// Summarize a DER certificate.
pub fn describe(der: &[u8]) -> Result<CertificateInfo, CertificateError> {
    let cert = parse(der)?;
    let (dns_names, uris) = san_entries(&cert);
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: timestamp(cert.validity().not_before.timestamp()),
        not_after: timestamp(cert.validity().not_after.timestamp()),
        serial: cert.raw_serial_as_string(),
        is_ca: cert.is_ca(),
        dns_names,
        uris,
    })
}

/// Summarize the first certificate of a PEM or DER file.
pub fn certificate_info(path: &Path) -> Result<CertificateInfo, CertificateError> {
    let certs = loader::load_certificates(path)?;
    describe(certs[0].as_ref())
}

/// True when the certificate carries the public half of `key`.
pub fn key_matches(cert_der: &[u8], key: &PrivateKey) -> Result<bool, CertificateError> {
    let cert = parse(cert_der)?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// Pick the certificate matching `key`, falling back to the first one.
///
/// Returns the chosen certificate and whether it matched.
pub fn select_certificate<'a>(
    certs: &'a [CertificateDer<'static>],
    key: &PrivateKey,
) -> Option<(&'a CertificateDer<'static>, bool)> {
    let matched = certs
        .iter()
        .find(|cert| key_matches(cert.as_ref(), key).unwrap_or(false));
    match matched {
        Some(cert) => Some((cert, true)),
        None => certs.first().map(|cert| (cert, false)),
    }
}

/// Application URI carried by a certificate.
///
/// The first SAN URI wins; otherwise a common name that looks like a URI
/// (`urn:`, `http:`, `https:`) is used.
pub fn application_uri(cert_der: &[u8]) -> Option<String> {
    let cert = parse(cert_der).ok()?;
    let (_, uris) = san_entries(&cert);
    if let Some(uri) = uris.into_iter().find(|u| !u.is_empty()) {
        return Some(uri);
    }

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::trim)?;
    let lower = cn.to_ascii_lowercase();
    if lower.starts_with("urn:") || lower.starts_with("http:") || lower.starts_with("https:") {
        Some(cn.to_string())
    } else {
        None
    }
}

/// Check that a certificate/key pair is usable right now.
pub fn validate_certificate_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertificateInfo, CertificateError> {
    let certs = loader::load_certificates(cert_path)?;
    let info = describe(certs[0].as_ref())?;

    if !info.is_valid_at(Utc::now()) {
        warn!(
            path = %cert_path.display(),
            not_before = %info.not_before,
            not_after = %info.not_after,
            "Certificate outside its validity window"
        );
        return Err(CertificateError::OutsideValidity {
            not_before: info.not_before.to_rfc3339(),
            not_after: info.not_after.to_rfc3339(),
        });
    }

    let key = loader::load_private_key(key_path)?;
    if !key_matches(certs[0].as_ref(), &key)? {
        return Err(CertificateError::KeyMismatch);
    }

    debug!(path = %cert_path.display(), subject = %info.subject, "Certificate validated");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};

    fn self_signed(params: CertificateParams) -> (rcgen::Certificate, KeyPair) {
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert, key_pair)
    }

    fn loaded(key_pair: &KeyPair) -> PrivateKey {
        loader::parse_private_key(key_pair.serialize_pem().as_bytes(), "test").unwrap()
    }

    #[test]
    fn test_application_uri_from_san() {
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![SanType::URI(
            Ia5String::try_from("urn:plant:hmi".to_string()).unwrap(),
        )];
        let (cert, _) = self_signed(params);

        assert_eq!(
            application_uri(cert.der().as_ref()),
            Some("urn:plant:hmi".to_string())
        );
    }

    #[test]
    fn test_application_uri_from_common_name() {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "urn:plant:scada");
        params.distinguished_name = dn;
        let (cert, _) = self_signed(params);
        assert_eq!(
            application_uri(cert.der().as_ref()),
            Some("urn:plant:scada".to_string())
        );

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Operator Station");
        params.distinguished_name = dn;
        let (cert, _) = self_signed(params);
        assert_eq!(application_uri(cert.der().as_ref()), None);
    }

    #[test]
    fn test_select_matching_certificate() {
        let (other, _) = self_signed(CertificateParams::default());
        let (mine, key_pair) = self_signed(CertificateParams::default());
        let key = loaded(&key_pair);

        let certs = vec![other.der().clone(), mine.der().clone()];
        let (picked, matched) = select_certificate(&certs, &key).unwrap();
        assert!(matched);
        assert_eq!(picked.as_ref(), mine.der().as_ref());

        let only_other = vec![other.der().clone()];
        let (picked, matched) = select_certificate(&only_other, &key).unwrap();
        assert!(!matched);
        assert_eq!(picked.as_ref(), other.der().as_ref());
    }

    #[test]
    fn test_describe_reports_sans() {
        let params = CertificateParams::new(vec!["plc.local".to_string()]).unwrap();
        let (cert, _) = self_signed(params);

        let info = describe(cert.der().as_ref()).unwrap();
        assert_eq!(info.dns_names, vec!["plc.local".to_string()]);
        assert!(info.is_valid_at(Utc::now()));
        assert!(info.to_string().contains("DNS Names: plc.local"));
    }

    #[test]
    fn test_validate_files_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = self_signed(CertificateParams::default());
        let stranger = KeyPair::generate().unwrap();

        let cert_path = dir.path().join("client.crt");
        let key_path = dir.path().join("client.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, stranger.serialize_pem()).unwrap();

        let err = validate_certificate_files(&cert_path, &key_path).unwrap_err();
        assert!(matches!(err, CertificateError::KeyMismatch));
    }

    #[test]
    fn test_validate_files_detects_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = CertificateParams::default();
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(30);
        params.not_after = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        let (cert, key_pair) = self_signed(params);

        let cert_path = dir.path().join("expired.crt");
        let key_path = dir.path().join("expired.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let err = validate_certificate_files(&cert_path, &key_path).unwrap_err();
        assert!(matches!(err, CertificateError::OutsideValidity { .. }));
    }
}
