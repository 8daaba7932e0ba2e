//! Typed wrappers over the `openssl` command-line operations.
//!
//! Each method builds one fixed argument shape and runs it through the
//! [`ProcessRunner`]. A failure is terminal for the calling operation; the
//! captured stderr travels inside [`IcpError::Toolchain`].

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, info_span, Span};

use crate::configs::ToolchainConfig;
use crate::error::{IcpError, Result};
use crate::process_runner::{ProcessRunner, ToolArgs};

/// Shortest password the toolchain accepts for key encryption.
pub const MIN_PASSWORD_LEN: usize = 4;

pub fn check_password(what: &str, password: &SecretString) -> Result<()> {
    if password.expose_secret().chars().count() < MIN_PASSWORD_LEN {
        return Err(IcpError::Validation(format!(
            "{} must be at least {} characters",
            what, MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Arguments of a `ca` signing run.
pub struct SignRequest<'a> {
    /// Config of the signing CA (`ca_ossl.cnf`).
    pub issuer_config: &'a Path,
    pub request: &'a Path,
    pub certificate: &'a Path,
    pub days: u32,
    /// File holding the extension section, and the section name.
    pub extfile: &'a Path,
    pub extensions: &'a str,
    /// Password of the signing CA's key.
    pub password: &'a SecretString,
}

/// A new key plus either a CSR or a self-signed certificate.
pub struct KeyRequest<'a> {
    pub config: &'a Path,
    pub key: &'a Path,
    pub output: &'a Path,
    pub subject: &'a str,
    pub password: &'a SecretString,
}

#[derive(Debug, Clone)]
pub struct Toolchain {
    runner: ProcessRunner,
    digest: String,
    key_bits: u32,
    span: Span,
}

impl Toolchain {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            digest: "sha256".to_string(),
            key_bits: 2048,
            span: info_span!("toolchain"),
        }
    }

    pub fn from_config(config: &ToolchainConfig) -> Self {
        let runner = ProcessRunner::new(config.program.clone(), config.timeout())
            .with_poll_interval(config.poll_interval());
        Self::new(runner)
            .digest(config.digest.clone())
            .key_bits(config.key_bits)
    }

    pub fn digest(mut self, digest: String) -> Self {
        self.digest = digest;
        self
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.runner = self.runner.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn digest_name(&self) -> &str {
        &self.digest
    }

    pub fn bits(&self) -> u32 {
        self.key_bits
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// `req -x509`: new key and self-signed CA certificate with `v3_ca`.
    pub fn self_signed(&self, req: &KeyRequest<'_>, days: u32) -> Result<()> {
        check_password("CA password", req.password)?;
        let args = ToolArgs::new()
            .args(["req", "-x509", "-new", "-newkey"])
            .arg(format!("rsa:{}", self.key_bits))
            .path("-keyout", req.key)
            .path("-out", req.output)
            .arg("-days")
            .arg(days.to_string())
            .arg(format!("-{}", self.digest))
            .path("-config", req.config)
            .args(["-extensions", "v3_ca", "-subj"])
            .arg(req.subject)
            .arg("-utf8")
            .password("-passout", req.password);
        self.run("create self-signed certificate", &args)
    }

    /// `req -new`: new key and certificate signing request.
    pub fn request(&self, req: &KeyRequest<'_>) -> Result<()> {
        check_password("key password", req.password)?;
        let args = ToolArgs::new()
            .args(["req", "-new", "-newkey"])
            .arg(format!("rsa:{}", self.key_bits))
            .path("-keyout", req.key)
            .path("-out", req.output)
            .arg(format!("-{}", self.digest))
            .path("-config", req.config)
            .arg("-subj")
            .arg(req.subject)
            .arg("-utf8")
            .password("-passout", req.password);
        self.run("create certificate request", &args)
    }

    /// `ca`: sign a request with the issuer's key.
    pub fn sign(&self, sign: &SignRequest<'_>) -> Result<()> {
        check_password("CA password", sign.password)?;
        let args = ToolArgs::new()
            .args(["ca", "-batch", "-notext"])
            .path("-config", sign.issuer_config)
            .path("-in", sign.request)
            .path("-out", sign.certificate)
            .arg("-days")
            .arg(sign.days.to_string())
            .arg("-md")
            .arg(&self.digest)
            .path("-extfile", sign.extfile)
            .arg("-extensions")
            .arg(sign.extensions)
            .password("-passin", sign.password);
        self.run("sign certificate request", &args)
    }

    /// `ca -revoke`: mark a certificate revoked in the CA database.
    pub fn revoke(&self, config: &Path, certificate: &Path, password: &SecretString) -> Result<()> {
        check_password("CA password", password)?;
        let args = ToolArgs::new()
            .args(["ca", "-batch"])
            .path("-config", config)
            .path("-revoke", certificate)
            .password("-passin", password);
        self.run("revoke certificate", &args)
    }

    /// `ca -gencrl`: write a fresh CRL.
    pub fn generate_crl(
        &self,
        config: &Path,
        crl: &Path,
        days: u32,
        password: &SecretString,
    ) -> Result<()> {
        check_password("CA password", password)?;
        let args = ToolArgs::new()
            .args(["ca", "-batch"])
            .path("-config", config)
            .arg("-gencrl")
            .arg("-crldays")
            .arg(days.to_string())
            .arg("-md")
            .arg(&self.digest)
            .path("-out", crl)
            .password("-passin", password);
        self.run("generate CRL", &args)
    }

    /// `pkcs12 -export` of a certificate, its key and the issuing chain.
    #[allow(clippy::too_many_arguments)]
    pub fn export_pkcs12(
        &self,
        certificate: &Path,
        key: &Path,
        chain: Option<&Path>,
        friendly_name: &str,
        output: &Path,
        key_password: &SecretString,
        export_password: &SecretString,
    ) -> Result<()> {
        check_password("PKCS#12 password", export_password)?;
        let mut args = ToolArgs::new()
            .args(["pkcs12", "-export"])
            .path("-in", certificate)
            .path("-inkey", key);
        if let Some(chain) = chain {
            args = args.path("-certfile", chain);
        }
        let args = args
            .arg("-name")
            .arg(friendly_name)
            .path("-out", output)
            .password("-passin", key_password)
            .password("-passout", export_password);
        self.run("export PKCS#12", &args)
    }

    /// `pkey`: write an unencrypted copy of a private key.
    pub fn decrypt_key(&self, key: &Path, output: &Path, password: &SecretString) -> Result<()> {
        let args = ToolArgs::new()
            .arg("pkey")
            .path("-in", key)
            .path("-out", output)
            .password("-passin", password);
        self.run("decrypt private key", &args)
    }

    /// `crl2pkcs7 -nocrl`: bundle certificates as PKCS#7.
    pub fn pkcs7_chain(&self, certificates: &[PathBuf], output: &Path) -> Result<()> {
        if certificates.is_empty() {
            return Err(IcpError::Validation(
                "PKCS#7 chain needs at least one certificate".to_string(),
            ));
        }
        let mut args = ToolArgs::new().args(["crl2pkcs7", "-nocrl"]);
        for cert in certificates {
            args = args.path("-certfile", cert);
        }
        let args = args.path("-out", output);
        self.run("export PKCS#7 chain", &args)
    }

    fn run(&self, operation: &str, args: &ToolArgs) -> Result<()> {
        let _entered = self.span.enter();
        self.runner.run(operation, args)?;
        info!(operation, "toolchain step completed");
        Ok(())
    }
}
