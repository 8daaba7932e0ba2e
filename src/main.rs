//! icp-admin - ICP-Brasil private certificate authority
//!
//! Operator front end for the `icp_admin` library: CA creation and
//! teardown, certificate issuance for the six ICP-Brasil profiles,
//! revocation, renewal, CRLs, exports, backups and certificate validation.
//!
//! # Quick Start
//!
//! ```bash
//! export ICP_CA_PASSWORD=root-secret
//! icp-admin create-root AC-Raiz --cn "AC Raiz" --org ICP-Brasil --ou PKI
//!
//! export ICP_PARENT_PASSWORD=root-secret ICP_CA_PASSWORD=inter-secret
//! icp-admin create-ca AC-Final --parent AC-Raiz --cn "AC Final" --org ICP-Brasil --ou PKI
//!
//! export ICP_KEY_PASSWORD=user-secret
//! icp-admin issue e-CPF --ca AC-Final --holder maria.json
//! ```
//!
//! Passwords are read from the environment (or the matching flags) and are
//! never printed. When the `openssl` toolchain fails, its stderr is shown
//! verbatim.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use icp_admin::{AppConfig, CertificateProfile, IcpError};
use tracing_subscriber::EnvFilter;

/// ICP-Brasil private certificate authority
#[derive(Parser, Debug)]
#[command(name = "icp-admin")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./icp-admin.toml when present)
    #[arg(short, long, global = true, env = "ICP_ADMIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List CAs under the base directory
    List,

    /// Create a self-signed Root CA
    CreateRoot(CreateCaArgs),

    /// Create an Intermediate CA signed by an existing CA
    CreateCa {
        #[command(flatten)]
        ca: CreateCaArgs,

        /// Name of the signing CA
        #[arg(long)]
        parent: String,

        /// Password of the signing CA's key
        #[arg(long, env = "ICP_PARENT_PASSWORD", hide_env_values = true)]
        parent_password: Option<String>,
    },

    /// Delete a CA directory (refused while it has subordinate CAs)
    DeleteCa {
        name: String,
    },

    /// Issue an end-entity certificate
    Issue(IssueArgs),

    /// Revoke a certificate and regenerate the CRL
    Revoke {
        /// Issuing CA
        #[arg(long)]
        ca: String,

        /// Certificate file, absolute or relative to the CA directory
        certificate: PathBuf,

        #[arg(long, env = "ICP_CA_PASSWORD", hide_env_values = true)]
        ca_password: Option<String>,
    },

    /// Re-sign a certificate's original request with a fresh validity window
    Renew {
        /// Issuing CA
        #[arg(long)]
        ca: String,

        /// Certificate file, absolute or relative to the CA directory
        #[arg(long)]
        certificate: PathBuf,

        /// Original request file, absolute or relative to the CA directory
        #[arg(long)]
        request: PathBuf,

        #[arg(long)]
        days: Option<u32>,

        #[arg(long, env = "ICP_CA_PASSWORD", hide_env_values = true)]
        ca_password: Option<String>,
    },

    /// Regenerate a CA's CRL
    Gencrl {
        ca: String,

        #[arg(long, env = "ICP_CA_PASSWORD", hide_env_values = true)]
        ca_password: Option<String>,
    },

    /// Write the PKCS#7 chain bundle of a CA
    ExportChain {
        ca: String,
    },

    /// Export a cataloged certificate as PKCS#12
    ExportP12 {
        /// Catalog id of the certificate
        id: String,

        #[arg(long, env = "ICP_KEY_PASSWORD", hide_env_values = true)]
        key_password: Option<String>,

        #[arg(long, env = "ICP_P12_PASSWORD", hide_env_values = true)]
        p12_password: Option<String>,
    },

    /// Archive a CA directory as a tar file
    Backup {
        ca: String,

        /// Destination directory (defaults to storage.backup_dir)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Mark cataloged certificates past their expiration as Expired
    SweepExpired,

    /// Validate a certificate against trust anchors and its CRLs
    Validate {
        /// Certificate file (PEM or DER)
        certificate: PathBuf,

        /// Trust anchor certificate (repeatable)
        #[arg(short, long = "anchor")]
        anchors: Vec<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct CreateCaArgs {
    /// Directory name of the new CA
    pub name: String,

    /// Common name (CN)
    #[arg(long)]
    pub cn: String,

    /// Organization (O)
    #[arg(long, default_value = "")]
    pub org: String,

    /// Organizational unit (OU)
    #[arg(long, default_value = "")]
    pub ou: String,

    /// Country (C), defaults to defaults.country
    #[arg(long)]
    pub country: Option<String>,

    #[arg(long)]
    pub days: Option<u32>,

    /// URI where this CA publishes its CRL
    #[arg(long)]
    pub crl_uri: Option<String>,

    #[arg(long)]
    pub cps_uri: Option<String>,

    /// Certificate policy OID (repeatable)
    #[arg(long = "policy")]
    pub policies: Vec<String>,

    /// Password protecting the new CA's key
    #[arg(long, env = "ICP_CA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct IssueArgs {
    /// e-CPF, e-CNPJ, RIC, e-Codigo, e-Servidor or e-Aplicacao
    pub profile: CertificateProfile,

    /// Issuing CA
    #[arg(long)]
    pub ca: String,

    /// JSON file with the holder data
    #[arg(long)]
    pub holder: PathBuf,

    /// Override the issuing CA's OU in the Subject
    #[arg(long)]
    pub ou: Option<String>,

    #[arg(long)]
    pub days: Option<u32>,

    /// Also write an unencrypted copy of the key
    #[arg(long)]
    pub plain_key: bool,

    #[arg(long, env = "ICP_KEY_PASSWORD", hide_env_values = true)]
    pub key_password: Option<String>,

    #[arg(long, env = "ICP_CA_PASSWORD", hide_env_values = true)]
    pub ca_password: Option<String>,

    /// Also export PKCS#12 protected by this password
    #[arg(long, env = "ICP_P12_PASSWORD", hide_env_values = true)]
    pub p12_password: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("✗ {:#}", e);
        if let Some(stderr) = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<IcpError>())
            .and_then(IcpError::stderr)
        {
            eprintln!("\n--- openssl stderr ---\n{}", stderr.trim_end());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => AppConfig::load().context("Failed to load configuration")?,
    };
    init_logging(&config);

    commands::dispatch(cli.command, &config)
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
