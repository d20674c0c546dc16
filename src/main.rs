//! ualink - OPC UA client runtime with an HTTP/WebSocket edge
//!
//! `run` hosts the session controller, the live-data hub and the API. The
//! remaining subcommands manage client certificates.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ualink_api::{ServerBuilder, ServerConfig};
use ualink_cert::{
    certificate_info, generate_csr, generate_self_signed, validate_certificate_files,
    CertificateConfig, CertificatePaths, KeyAlgorithm, LocalCa, Provisioner,
};
use ualink_client::MemoryServer;
use ualink_controller::Controller;
use ualink_core::config::{AppConfig, LogFormat, LoggingConfig};
use ualink_hub::HubConfig;

/// ualink - OPC UA client runtime and certificate tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml", env = "UALINK_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller, live-data hub and HTTP/WebSocket API
    Run {
        /// Override the API bind address
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Interval between simulated value changes in milliseconds (0 disables)
        #[arg(long, default_value = "1000")]
        simulate_ms: u64,

        /// Connect at startup even when client.auto_connect is off
        #[arg(long)]
        connect: bool,
    },

    /// Create the local CA in the certificate directory
    GenCa {
        /// Replace an existing CA
        #[arg(long)]
        force: bool,
    },

    /// Issue a client application certificate
    GenCert {
        /// Self-sign instead of issuing from the local CA
        #[arg(long)]
        self_signed: bool,

        /// Application URI placed in the SAN (defaults to urn:{hostname}:ualink:client)
        #[arg(long)]
        application_uri: Option<String>,

        /// Extra DNS SAN entries
        #[arg(long = "dns")]
        dns_names: Vec<String>,

        /// Extra IP SAN entries
        #[arg(long = "ip")]
        ip_addresses: Vec<IpAddr>,

        /// Use an ECDSA P-384 key
        #[arg(long)]
        p384: bool,

        /// Output directory (defaults to certs.dir)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Write a certificate signing request for an external CA
    GenCsr {
        #[arg(long)]
        application_uri: Option<String>,

        /// Output directory (defaults to certs.dir)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Print subject, issuer, validity and application URI of a certificate
    CertInfo {
        path: PathBuf,
    },

    /// Check that a certificate is currently valid and matches its key
    ValidateCert {
        cert: PathBuf,
        key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(&config.logging)?;

    match args.command {
        Command::Run {
            bind,
            simulate_ms,
            connect,
        } => run(config, bind, simulate_ms, connect).await,
        Command::GenCa { force } => gen_ca(&config, force),
        Command::GenCert {
            self_signed,
            application_uri,
            dns_names,
            ip_addresses,
            p384,
            output,
        } => {
            let mut cert_config = if dns_names.is_empty() && ip_addresses.is_empty() {
                CertificateConfig::from_settings(&config.certs, application_uri.as_deref())
            } else {
                let mut with_dns = CertificateConfig::with_dns(
                    application_uri.as_deref(),
                    dns_names,
                    ip_addresses,
                );
                with_dns.common_name = config.certs.common_name.clone();
                with_dns.organization = config.certs.organization.clone();
                with_dns.validity_days = config.certs.validity_days;
                with_dns
            };
            if p384 {
                cert_config.key_algorithm = KeyAlgorithm::EcdsaP384;
            }
            let dir = output.unwrap_or_else(|| config.certs.dir.clone());
            gen_cert(&config, &dir, &cert_config, self_signed)
        }
        Command::GenCsr {
            application_uri,
            output,
        } => {
            let cert_config =
                CertificateConfig::from_settings(&config.certs, application_uri.as_deref());
            let dir = output.unwrap_or_else(|| config.certs.dir.clone());
            let csr = generate_csr(&cert_config).context("Failed to build CSR")?;
            let (csr_path, key_path) = csr.write_files(&dir).context("Failed to write CSR")?;
            println!("CSR: {}", csr_path.display());
            println!("Key: {}", key_path.display());
            Ok(())
        }
        Command::CertInfo { path } => {
            let info = certificate_info(&path)
                .with_context(|| format!("Failed to read certificate {}", path.display()))?;
            println!("{}", info);
            Ok(())
        }
        Command::ValidateCert { cert, key } => {
            let info = validate_certificate_files(&cert, &key)
                .with_context(|| format!("Certificate {} is not usable", cert.display()))?;
            println!("OK: {}", info.subject);
            Ok(())
        }
    }
}

/// Loads the config file when present, layering `UALINK__*` overrides, else defaults.
fn load_config(path: &Path) -> Result<AppConfig> {
    let config = if path.exists() {
        AppConfig::from_config_builder(path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?
    } else {
        AppConfig::default()
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(logging.parse_level()?.as_str().to_lowercase()),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

async fn run(
    config: AppConfig,
    bind: Option<SocketAddr>,
    simulate_ms: u64,
    connect: bool,
) -> Result<()> {
    info!(endpoint = %config.client.endpoint_url, "Starting ualink");

    // The binary ships the in-memory plant as its session backend.
    let plant = Arc::new(MemoryServer::demo_plant());
    let background = CancellationToken::new();

    let simulation = if simulate_ms > 0 {
        let plant = plant.clone();
        let token = background.child_token();
        Some(tokio::spawn(async move {
            plant
                .run_simulation(Duration::from_millis(simulate_ms), token)
                .await;
        }))
    } else {
        None
    };

    let auto_connect = config.client.auto_connect || connect;
    let controller = Controller::new(
        config.client.clone(),
        plant,
        Provisioner::new(config.certs.clone()),
    );
    let hub = controller.spawn_hub(HubConfig::default());

    let server_task = if config.api.enabled {
        let mut server_config = ServerConfig::from_api_config(&config.api)?;
        if let Some(bind) = bind {
            server_config.bind_addr = bind;
        }
        info!(bind = %server_config.bind_addr, "Starting API server");

        let server = ServerBuilder::new(server_config).build(controller.clone(), hub.clone())?;
        let token = background.child_token();
        Some(tokio::spawn(async move {
            server.run(async move { token.cancelled().await }).await
        }))
    } else {
        warn!("API disabled, running controller only");
        None
    };

    let hook_token = background.clone();
    controller.set_shutdown_hook(move || async move {
        hook_token.cancel();
    });

    if auto_connect {
        let connecting = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = connecting.connect().await {
                error!(error = %e, "Auto-connect failed");
            }
        });
    } else {
        info!("auto_connect disabled, API requests return 503 until connected");
    }

    ualink_api::shutdown_signal().await;
    info!("Shutting down");

    controller.shutdown().await;
    hub.stop().await;

    if let Some(task) = server_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "API server error"),
            Err(e) => error!(error = %e, "API server task failed"),
        }
    }
    if let Some(task) = simulation {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn gen_ca(config: &AppConfig, force: bool) -> Result<()> {
    let dir = &config.certs.dir;
    let cert_path = dir.join("ca.crt");
    let key_path = dir.join("ca.key");

    if cert_path.exists() && !force {
        bail!(
            "CA already exists at {} (use --force to replace it)",
            cert_path.display()
        );
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let ca = LocalCa::generate(
        &format!("{} CA", config.certs.common_name),
        &config.certs.organization,
        config.certs.validity_days,
    )
    .context("Failed to generate CA")?;
    ca.save_to_files(&cert_path, &key_path)
        .context("Failed to write CA files")?;

    println!("CA certificate: {}", cert_path.display());
    println!("CA key:         {}", key_path.display());
    Ok(())
}

fn gen_cert(
    config: &AppConfig,
    dir: &Path,
    cert_config: &CertificateConfig,
    self_signed: bool,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let generated = if self_signed {
        generate_self_signed(cert_config).context("Failed to generate certificate")?
    } else {
        let ca = LocalCa::ensure(dir, &config.certs).context("Failed to load local CA")?;
        ca.issue(cert_config).context("Failed to issue certificate")?
    };

    let stem = if self_signed { "selfsigned" } else { "client" };
    let paths = generated
        .write_files(dir, stem)
        .context("Failed to write certificate files")?;
    print_paths(&paths, &cert_config.application_uri);
    Ok(())
}

fn print_paths(paths: &CertificatePaths, application_uri: &str) {
    println!("Application URI: {}", application_uri);
    println!("Certificate (DER): {}", paths.cert_der.display());
    println!("Certificate (PEM): {}", paths.cert_pem.display());
    println!("Private key (PEM): {}", paths.key_pem.display());
    println!("Private key (DER): {}", paths.key_der.display());
    println!("Bundle:            {}", paths.bundle.display());
}
