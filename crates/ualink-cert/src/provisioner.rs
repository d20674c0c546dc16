//! Turns client configuration into the `SessionOptions` the protocol layer consumes.

use crate::generator::{self, default_application_uri, CertificateConfig};
use crate::loader;
use crate::validator;
use std::path::PathBuf;
use tracing::{info, warn};
use ualink_core::config::{CertConfig, ClientConfig};
use ualink_core::error::{CertificateError, ConfigError, Result};
use ualink_core::types::{SecurityMode, SecurityPolicy, SessionOptions, UserIdentity};

/// Product URI used when none is configured.
pub const DEFAULT_PRODUCT_URI: &str = "urn:ualink:client";

/// Parse a security policy name or URI.
///
/// Matching is case-insensitive and ignores spaces. Empty and `auto` mean None.
pub fn parse_security_policy(value: &str) -> std::result::Result<SecurityPolicy, ConfigError> {
    let normalized: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let policy = match normalized.to_ascii_lowercase().as_str() {
        "" | "auto" | "none" => SecurityPolicy::None,
        "basic128rsa15" => SecurityPolicy::Basic128Rsa15,
        "basic256" => SecurityPolicy::Basic256,
        "basic256sha256" => SecurityPolicy::Basic256Sha256,
        "aes128_sha256_rsaoaep" | "aes128sha256rsaoaep" => SecurityPolicy::Aes128Sha256RsaOaep,
        "aes256_sha256_rsapss" | "aes256sha256rsapss" => SecurityPolicy::Aes256Sha256RsaPss,
        lower if lower.starts_with("http://") || lower.starts_with("https://") => normalized
            .strip_prefix(SecurityPolicy::URI_PREFIX)
            .filter(|short| !short.is_empty() && !short.contains(':'))
            .and_then(|short| parse_security_policy(short).ok())
            .unwrap_or_else(|| SecurityPolicy::Custom(normalized.clone())),
        _ => {
            return Err(ConfigError::UnknownSecurityPolicy {
                policy: value.to_string(),
            })
        }
    };
    Ok(policy)
}

/// Parse a message security mode. Empty and `auto` mean None.
pub fn parse_security_mode(value: &str) -> std::result::Result<SecurityMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "auto" | "none" => Ok(SecurityMode::None),
        "sign" => Ok(SecurityMode::Sign),
        "signandencrypt" => Ok(SecurityMode::SignAndEncrypt),
        _ => Err(ConfigError::UnknownSecurityMode {
            mode: value.to_string(),
        }),
    }
}

/// Reject combinations a server would refuse anyway.
pub fn check_security(
    policy: &SecurityPolicy,
    mode: SecurityMode,
) -> std::result::Result<(), ConfigError> {
    let contradicts = match mode {
        SecurityMode::None => !policy.is_none(),
        SecurityMode::Sign | SecurityMode::SignAndEncrypt => policy.is_none(),
    };
    if contradicts {
        return Err(ConfigError::IncompatibleSecurity {
            policy: policy.to_string(),
            mode: mode.to_string(),
        });
    }
    Ok(())
}

/// Build the user identity token from the auth mode.
pub fn parse_identity(config: &ClientConfig) -> std::result::Result<UserIdentity, ConfigError> {
    let policy_id = Some(config.user_token_policy_id.trim().to_string()).filter(|p| !p.is_empty());
    match config.auth_mode.trim().to_ascii_lowercase().as_str() {
        "" | "anonymous" => Ok(UserIdentity::Anonymous),
        "username" => Ok(UserIdentity::UserName {
            username: config.username.clone(),
            password: config.password.clone(),
            policy_id,
        }),
        _ => Err(ConfigError::UnsupportedAuthMode {
            mode: config.auth_mode.clone(),
        }),
    }
}

/// Certificate material selected for a secured session.
struct ClientCredentials {
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
    application_uri: Option<String>,
}

/// Prepares session options, generating client certificates on demand.
#[derive(Debug, Clone, Default)]
pub struct Provisioner {
    settings: CertConfig,
}

impl Provisioner {
    pub fn new(settings: CertConfig) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CertConfig {
        &self.settings
    }

    /// Validate the configuration and build the options for one session.
    pub fn provision(&self, config: &ClientConfig) -> Result<SessionOptions> {
        let security_policy = parse_security_policy(&config.security_policy)?;
        let security_mode = parse_security_mode(&config.security_mode)?;
        check_security(&security_policy, security_mode)?;
        let identity = parse_identity(config)?;

        let mut options = SessionOptions {
            security_policy,
            security_mode,
            identity,
            session_timeout: config.session_timeout(),
            connect_timeout: config.connect_timeout(),
            ..Default::default()
        };

        let configured_uri = Some(config.application_uri.trim().to_string()).filter(|u| !u.is_empty());
        let mut application_uri = configured_uri.clone();

        if security_mode != SecurityMode::None {
            if let Some(credentials) = self.load_credentials(config, configured_uri.as_deref())? {
                if let Some(cert_uri) = credentials.application_uri {
                    match &configured_uri {
                        Some(configured) if configured != &cert_uri => {
                            warn!(
                                configured = %configured,
                                certificate = %cert_uri,
                                "Application URI differs from certificate, using certificate URI"
                            );
                        }
                        _ => {}
                    }
                    application_uri = Some(cert_uri);
                }
                options.certificate_der = Some(credentials.certificate_der);
                options.private_key_der = Some(credentials.private_key_der);
            }
        }

        options.application_uri = application_uri.unwrap_or_else(default_application_uri);
        options.product_uri = Some(config.product_uri.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_PRODUCT_URI.to_string());
        options.session_name = Some(config.session_name.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| options.application_uri.clone());

        info!(
            policy = %options.security_policy,
            mode = %options.security_mode,
            application_uri = %options.application_uri,
            with_certificate = options.certificate_der.is_some(),
            "Session options provisioned"
        );
        Ok(options)
    }

    fn certificate_paths(
        &self,
        config: &ClientConfig,
        application_uri: Option<&str>,
    ) -> std::result::Result<Option<(PathBuf, PathBuf)>, CertificateError> {
        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => {
                Ok(Some((cert.clone(), key.clone())))
            }
            (Some(_), None) | (None, Some(_)) => Err(CertificateError::IncompletePair),
            _ if config.auto_generate_cert => {
                let generated = generator::issue_client_files(
                    &self.settings.dir,
                    &self.settings,
                    &CertificateConfig::from_settings(&self.settings, application_uri),
                )?;
                info!(
                    cert = %generated.cert_der.display(),
                    key = %generated.key_pem.display(),
                    "Generated client certificate"
                );
                Ok(Some((generated.cert_der, generated.key_pem)))
            }
            (Some(cert), Some(_)) => Err(CertificateError::ReadFailed {
                path: cert.display().to_string(),
                reason: "file not found".to_string(),
            }),
            (None, None) => Ok(None),
        }
    }

    fn load_credentials(
        &self,
        config: &ClientConfig,
        application_uri: Option<&str>,
    ) -> std::result::Result<Option<ClientCredentials>, CertificateError> {
        let Some((cert_path, key_path)) = self.certificate_paths(config, application_uri)? else {
            warn!("Secure mode without client certificate");
            return Ok(None);
        };

        let key = loader::load_private_key(&key_path)?;
        let certs = loader::load_certificates(&cert_path)?;
        let (certificate, matched) =
            validator::select_certificate(&certs, &key).ok_or_else(|| {
                CertificateError::NoCertificate {
                    path: cert_path.display().to_string(),
                }
            })?;
        if !matched {
            warn!(path = %cert_path.display(), "No certificate matches the private key, using the first");
        }

        Ok(Some(ClientCredentials {
            application_uri: validator::application_uri(certificate.as_ref()),
            certificate_der: certificate.to_vec(),
            private_key_der: key.der().to_vec(),
        }))
    }
}

/// Provision with default certificate settings.
pub fn provision(config: &ClientConfig) -> Result<SessionOptions> {
    Provisioner::default().provision(config)
}
