//! CA lifecycle engine.
//!
//! The engine owns no state beyond its collaborators: the [`CaRegistry`]
//! (filesystem scans), the [`Toolchain`] (external process) and the
//! issuance defaults. Creation and issuance live in
//! [`generate_root_ca`](crate::generate_root_ca),
//! [`generate_intermediate_ca`](crate::generate_intermediate_ca) and
//! [`generate_user_keypair`](crate::generate_user_keypair); backups in
//! [`key_archive`](crate::key_archive).
//!
//! Calls against the same CA must be serialized by the caller. The engine
//! takes no locks; concurrent writers to one CA's `index.txt`/`serial` can
//! corrupt it.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use openssl::x509::X509;
use secrecy::SecretString;
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn, Span};

use crate::ca_directory::{CaDirectory, IssuanceFiles};
use crate::certificate_authority::CertificateAuthority;
use crate::configs::{AppConfig, IssuanceDefaults};
use crate::error::{IcpError, Result};
use crate::profile::{CertificateProfile, Holder};
use crate::registry::CaRegistry;
use crate::toolchain::{SignRequest, Toolchain};

/// Parameters for a new Root or Intermediate CA.
///
/// Unset optional fields fall back to the engine's [`IssuanceDefaults`].
pub struct CaParams {
    pub(crate) name: String,
    pub(crate) common_name: String,
    pub(crate) organization: String,
    pub(crate) org_unit: String,
    pub(crate) country: Option<String>,
    pub(crate) validity_days: Option<u32>,
    pub(crate) crl_uri: Option<String>,
    pub(crate) cps_uri: Option<String>,
    pub(crate) policies: Option<Vec<String>>,
    pub(crate) password: SecretString,
}

impl CaParams {
    /// Start parameters for CA `name`, whose key is protected by `password`.
    pub fn new(name: String, password: SecretString) -> Self {
        Self {
            name,
            common_name: String::new(),
            organization: String::new(),
            org_unit: String::new(),
            country: None,
            validity_days: None,
            crl_uri: None,
            cps_uri: None,
            policies: None,
            password,
        }
    }

    /// Set the common name (CN) of the CA certificate
    pub fn common_name(mut self, cn: String) -> Self {
        self.common_name = cn;
        self
    }

    /// Set the organization (O)
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    /// Set the organizational unit (OU)
    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.org_unit = ou;
        self
    }

    /// Set the country (C), 2-letter ISO code
    pub fn country(mut self, country: String) -> Self {
        self.country = Some(country);
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = Some(days);
        self
    }

    /// URI where this CA publishes its CRL
    pub fn crl_uri(mut self, uri: String) -> Self {
        self.crl_uri = Some(uri);
        self
    }

    pub fn cps_uri(mut self, uri: String) -> Self {
        self.cps_uri = Some(uri);
        self
    }

    /// Certificate Policy OIDs
    pub fn policies(mut self, oids: Vec<String>) -> Self {
        self.policies = Some(oids);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate(&self) -> Result<()> {
        crate::ca_directory::validate_ca_name(&self.name)?;
        if self.common_name.trim().is_empty() {
            return Err(IcpError::Validation(format!(
                "CA {} needs a common name",
                self.name
            )));
        }
        crate::toolchain::check_password("CA password", &self.password)
    }
}

/// One end-entity issuance.
pub struct IssueRequest {
    pub holder: Holder,
    /// Replaces the issuing CA's OU in the Subject.
    pub org_unit: Option<String>,
    pub validity_days: Option<u32>,
    /// Encrypts the new private key.
    pub key_password: SecretString,
    /// Unlocks the issuing CA's key.
    pub ca_password: SecretString,
    /// Also export a PKCS#12 bundle protected by this password.
    pub pkcs12_password: Option<SecretString>,
    /// Also write an unencrypted copy of the key.
    pub export_plain_key: bool,
}

impl IssueRequest {
    pub fn new(holder: Holder, key_password: SecretString, ca_password: SecretString) -> Self {
        Self {
            holder,
            org_unit: None,
            validity_days: None,
            key_password,
            ca_password,
            pkcs12_password: None,
            export_plain_key: false,
        }
    }
}

/// Files and metadata of an issued certificate, handed back for cataloging.
///
/// Paths are relative to the issuing CA's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub ca_name: String,
    pub token: String,
    pub profile: CertificateProfile,
    pub common_name: String,
    pub serial: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub request: PathBuf,
    pub pkcs12: Option<PathBuf>,
    pub plain_key: Option<PathBuf>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`CaEngine::renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renewal {
    pub certificate: PathBuf,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Drives CA creation, issuance, revocation and exports.
#[derive(Debug, Clone)]
pub struct CaEngine {
    pub(crate) registry: CaRegistry,
    pub(crate) toolchain: Toolchain,
    pub(crate) defaults: IssuanceDefaults,
    pub(crate) span: Span,
}

impl CaEngine {
    /// Build an engine from the application configuration.
    ///
    /// The base directory is created if needed and made absolute so the
    /// paths written into CA configs do not depend on the working directory.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let base = &config.storage.base_dir;
        fs::create_dir_all(base).map_err(|e| IcpError::fs(base, e))?;
        let base = base.canonicalize().map_err(|e| IcpError::fs(base, e))?;
        Ok(Self::with_parts(
            CaRegistry::new(base),
            Toolchain::from_config(&config.toolchain),
            config.defaults.clone(),
        ))
    }

    pub fn with_parts(
        registry: CaRegistry,
        toolchain: Toolchain,
        defaults: IssuanceDefaults,
    ) -> Self {
        Self {
            registry,
            toolchain,
            defaults,
            span: info_span!("ca_engine"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.toolchain = self.toolchain.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn registry(&self) -> &CaRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> &IssuanceDefaults {
        &self.defaults
    }

    pub fn list(&self) -> Result<Vec<CertificateAuthority>> {
        self.registry.list()
    }

    pub fn resolve(&self, name: &str) -> Result<CertificateAuthority> {
        self.registry.resolve(name)
    }

    /// Remove a CA directory. Refused while subordinate CAs exist.
    pub fn delete_ca(&self, name: &str) -> Result<()> {
        let _entered = self.span.enter();
        let ca = self.registry.resolve(name)?;
        let children = self.registry.children(&ca)?;
        if !children.is_empty() {
            let names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
            return Err(IcpError::Validation(format!(
                "CA {} still has subordinate CAs: {}",
                ca.name(),
                names.join(", ")
            )));
        }
        ca.directory().remove()?;
        info!(ca = %ca.name(), "CA deleted");
        Ok(())
    }

    /// Generate `crl/lcr.pem.crl` for `name`.
    pub fn create_crl(&self, name: &str, password: &SecretString) -> Result<PathBuf> {
        let ca = self.registry.resolve(name)?;
        self.generate_crl(ca.directory(), password)
    }

    /// Regenerate the CRL with a fresh validity window.
    pub fn renew_crl(&self, name: &str, password: &SecretString) -> Result<PathBuf> {
        let _entered = self.span.enter();
        info!(ca = name, "renewing CRL");
        self.create_crl(name, password)
    }

    pub(crate) fn generate_crl(&self, dir: &CaDirectory, password: &SecretString) -> Result<PathBuf> {
        let _entered = self.span.enter();
        let crl = dir.crl();
        self.toolchain.generate_crl(
            &dir.ca_config(),
            &crl,
            self.defaults.crl_validity_days,
            password,
        )?;
        info!(ca = %dir.name(), crl = %crl.display(), "CRL generated");
        Ok(crl)
    }

    /// Revoke `cert_file` and regenerate the CRL in the same call.
    ///
    /// `cert_file` may be absolute or relative to the CA directory.
    pub fn revoke(&self, name: &str, cert_file: &Path, password: &SecretString) -> Result<PathBuf> {
        let _entered = self.span.enter();
        let ca = self.registry.resolve(name)?;
        let dir = ca.directory();
        let certificate = existing_file(dir, cert_file)?;
        self.toolchain
            .revoke(&dir.ca_config(), &certificate, password)?;
        info!(ca = %ca.name(), certificate = %certificate.display(), "certificate revoked");
        self.generate_crl(dir, password)
    }

    /// Re-sign the original request of `cert_file` into the same path and
    /// revoke the old certificate. The key pair is unchanged.
    ///
    /// The new certificate is signed into a staging file first, so a bad
    /// request leaves the old certificate untouched. A certificate that is
    /// already revoked is renewed without a second revocation. Once the old
    /// certificate is revoked the CRL is regenerated even if a later step
    /// fails.
    pub fn renew(
        &self,
        name: &str,
        cert_file: &Path,
        req_file: &Path,
        password: &SecretString,
        validity_days: Option<u32>,
    ) -> Result<Renewal> {
        let _entered = self.span.enter();
        let ca = self.registry.resolve(name)?;
        let dir = ca.directory();
        let certificate = existing_file(dir, cert_file)?;
        let request = existing_file(dir, req_file)?;

        let extfile = IssuanceFiles::from_path(&request)
            .map(|files| dir.join(files.config))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| dir.user_config());
        let days = validity_days.unwrap_or(self.defaults.certificate_validity_days);

        let old_serial = read_serial(&certificate)?;
        let already_revoked = index_status(dir, &old_serial)? == Some('R');

        let staging_dir = certificate.parent().unwrap_or_else(|| dir.path());
        let staged = tempfile::Builder::new()
            .prefix(".renew-")
            .suffix(".pem")
            .tempfile_in(staging_dir)
            .map_err(|e| IcpError::fs(staging_dir, e))?;

        let issued_at = Utc::now();
        self.toolchain.sign(&SignRequest {
            issuer_config: &dir.ca_config(),
            request: &request,
            certificate: staged.path(),
            days,
            extfile: &extfile,
            extensions: crate::ca_config::SECTION_V3_REQ,
            password,
        })?;
        let serial = read_serial(staged.path())?;

        if !already_revoked {
            if let Err(e) = self
                .toolchain
                .revoke(&dir.ca_config(), &certificate, password)
            {
                self.withdraw(dir, staged.path(), password);
                return Err(e);
            }
        }

        let placed = staged
            .persist(&certificate)
            .map(|_| ())
            .map_err(|e| IcpError::fs(&certificate, e.error));
        let crl = self.generate_crl(dir, password);
        placed?;
        crl?;

        info!(
            ca = %ca.name(),
            certificate = %certificate.display(),
            old_serial = %old_serial,
            serial = %serial,
            "certificate renewed"
        );
        Ok(Renewal {
            certificate,
            serial,
            issued_at,
            expires_at: issued_at + ChronoDuration::days(i64::from(days)),
        })
    }

    /// Revoke a certificate that was signed but cannot be handed out, and
    /// publish a fresh CRL. Failures are logged; the caller already has an
    /// error to return.
    pub(crate) fn withdraw(&self, dir: &CaDirectory, certificate: &Path, password: &SecretString) {
        if let Err(e) = self
            .toolchain
            .revoke(&dir.ca_config(), certificate, password)
        {
            warn!(ca = %dir.name(), certificate = %certificate.display(), error = %e, "could not revoke abandoned certificate");
            return;
        }
        if let Err(e) = self.generate_crl(dir, password) {
            warn!(ca = %dir.name(), error = %e, "could not regenerate CRL after revoking abandoned certificate");
            return;
        }
        info!(ca = %dir.name(), certificate = %certificate.display(), "abandoned certificate revoked");
    }

    /// Root CA self-renewal is not implemented.
    pub fn renew_root_ca(&self, name: &str) -> Result<()> {
        let ca = self.registry.resolve(name)?;
        Err(IcpError::Unsupported(format!(
            "renewal of Root CA {} is not implemented",
            ca.name()
        )))
    }

    /// Write `certs/cachain.p7b` with the chain from `name` up to its Root.
    pub fn export_chain(&self, name: &str) -> Result<PathBuf> {
        let ca = self.registry.resolve(name)?;
        self.write_chain(&ca)
    }

    pub(crate) fn write_chain(&self, ca: &CertificateAuthority) -> Result<PathBuf> {
        let _entered = self.span.enter();
        let chain = self.registry.chain(ca)?;
        let output = ca.directory().chain();
        self.toolchain.pkcs7_chain(&chain, &output)?;
        info!(ca = %ca.name(), certificates = chain.len(), "chain exported");
        Ok(output)
    }

    /// Export a PKCS#12 bundle of an issued certificate, its key and the
    /// issuing chain.
    pub fn export_pkcs12(
        &self,
        issued: &IssuedCertificate,
        key_password: &SecretString,
        p12_password: &SecretString,
    ) -> Result<PathBuf> {
        let _entered = self.span.enter();
        let ca = self.registry.resolve(&issued.ca_name)?;
        let dir = ca.directory();
        let files = IssuanceFiles::from_token(issued.token.clone());
        let output = dir.join(files.pkcs12());

        let bundle = self.chain_bundle(&ca)?;
        self.toolchain.export_pkcs12(
            &dir.join(&issued.certificate),
            &dir.join(&issued.key),
            Some(bundle.path()),
            &issued.common_name,
            &output,
            key_password,
            p12_password,
        )?;
        info!(ca = %ca.name(), output = %output.display(), "PKCS#12 exported");
        Ok(output)
    }

    /// Write an unencrypted copy of `key_file` to `output`.
    pub fn decrypt_key(&self, key_file: &Path, password: &SecretString, output: &Path) -> Result<()> {
        let _entered = self.span.enter();
        if !key_file.is_file() {
            return Err(IcpError::NotFound(format!(
                "key file {}",
                key_file.display()
            )));
        }
        self.toolchain.decrypt_key(key_file, output, password)?;
        if let Err(e) = restrict_permissions(output) {
            warn!(path = %output.display(), error = %e, "could not restrict key file permissions");
        }
        Ok(())
    }

    /// PEM bundle of the CA chain in a temp file inside the CA directory.
    pub(crate) fn chain_bundle(&self, ca: &CertificateAuthority) -> Result<NamedTempFile> {
        let dir = ca.directory();
        let mut bundle = NamedTempFile::new_in(dir.path()).map_err(|e| IcpError::fs(dir.path(), e))?;
        for cert in self.registry.chain(ca)? {
            let pem = fs::read(&cert).map_err(|e| IcpError::fs(&cert, e))?;
            bundle
                .write_all(&pem)
                .map_err(|e| IcpError::fs(bundle.path(), e))?;
        }
        bundle.flush().map_err(|e| IcpError::fs(bundle.path(), e))?;
        Ok(bundle)
    }
}

/// Resolve `file` against the CA directory and require that it exists.
pub(crate) fn existing_file(dir: &CaDirectory, file: &Path) -> Result<PathBuf> {
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        dir.join(file)
    };
    if !path.is_file() {
        return Err(IcpError::NotFound(format!(
            "{} in CA {}",
            file.display(),
            dir.name()
        )));
    }
    Ok(path)
}

/// Hex serial of a PEM certificate file.
pub(crate) fn read_serial(path: &Path) -> Result<String> {
    let pem = fs::read(path).map_err(|e| IcpError::fs(path, e))?;
    let cert = X509::from_pem(&pem)?;
    let serial = cert.serial_number().to_bn()?.to_hex_str()?;
    Ok(serial.to_string())
}

/// Status letter (`V`, `R`, `E`) of `serial` in the CA's `index.txt`.
pub(crate) fn index_status(dir: &CaDirectory, serial: &str) -> Result<Option<char>> {
    let path = dir.index();
    let index = fs::read_to_string(&path).map_err(|e| IcpError::fs(&path, e))?;
    let wanted = serial.trim_start_matches('0');
    Ok(index.lines().find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            [status, _, _, listed, ..]
                if listed.trim_start_matches('0').eq_ignore_ascii_case(wanted) =>
            {
                status.chars().next()
            }
            _ => None,
        }
    }))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ca_config::CaConfigBuilder;
    use crate::catalog::{CertificateStatus, IssuedCertificateRecord};
    use crate::certificate_authority::CaInfo;
    use crate::error::ErrorKind;
    use crate::profile::{NaturalPerson, OID_PERSON_DATA};
    use openssl::nid::Nid;
    use openssl::x509::{CrlStatus, X509Crl};
    use std::process::Command;
    use tempfile::TempDir;

    pub(crate) fn openssl_available() -> bool {
        Command::new("openssl")
            .arg("version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    pub(crate) fn engine(tmp: &TempDir) -> CaEngine {
        let mut config = AppConfig::default();
        config.storage.base_dir = tmp.path().join("ca");
        config.toolchain.key_bits = 2048;
        config.defaults.cps_uri = "http://pki.test.br/dpc".to_string();
        config.defaults.policy_oids = vec!["2.16.76.1.2.1.1".to_string()];
        CaEngine::new(&config).unwrap()
    }

    pub(crate) fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    pub(crate) fn root_params(name: &str) -> CaParams {
        CaParams::new(name.to_string(), secret("root-pass"))
            .common_name(format!("Root{}", name))
            .organization("Test".to_string())
            .organizational_unit("PKI".to_string())
            .country("BR".to_string())
    }

    pub(crate) fn maria() -> Holder {
        Holder::ECpf {
            person: NaturalPerson {
                name: "Maria Silva".to_string(),
                email: "maria@test.br".to_string(),
                cpf: "12345678901".to_string(),
                ..Default::default()
            },
            upn: None,
        }
    }

    fn load_cert(path: &Path) -> X509 {
        X509::from_pem(&fs::read(path).unwrap()).unwrap()
    }

    fn common_name(cert: &X509) -> String {
        cert.subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string()
    }

    #[test]
    fn end_to_end_issue_and_revoke() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        let root = engine.create_root_ca(&root_params("R")).unwrap();
        assert!(root.is_root().unwrap());
        let root_dir = root.directory().clone();
        root_dir.verify_layout().unwrap();
        assert!(root_dir.certificate().is_file());
        assert!(root_dir.crl().is_file());
        assert!(root_dir.chain().is_file());
        assert_eq!(common_name(&load_cert(&root_dir.certificate())), "RootR");

        let inter = engine
            .create_ca(
                &CaParams::new("I".to_string(), secret("inter-pass"))
                    .common_name("Inter".to_string())
                    .organization("Test".to_string())
                    .organizational_unit("PKI".to_string()),
                "r",
                &secret("root-pass"),
            )
            .unwrap();
        assert_eq!(inter.info().unwrap().root, "R");
        let inter_cert = load_cert(&inter.directory().certificate());
        let root_cert = load_cert(&root_dir.certificate());
        assert!(inter_cert.verify(&root_cert.public_key().unwrap()).unwrap());

        let issued = engine
            .issue(
                "I",
                &IssueRequest::new(maria(), secret("user-pass"), secret("inter-pass")),
            )
            .unwrap();
        assert_eq!(issued.common_name, "Maria Silva:12345678901");
        assert_eq!(issued.expires_at - issued.issued_at, ChronoDuration::days(2190));
        let cert_path = inter.directory().join(&issued.certificate);
        let cert = load_cert(&cert_path);
        assert_eq!(common_name(&cert), "Maria Silva:12345678901");

        // the ICP-Brasil person data survives with its padding intact
        let der = cert.to_der().unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        let person = san
            .value
            .general_names
            .iter()
            .find_map(|name| match name {
                x509_parser::extensions::GeneralName::OtherName(oid, value)
                    if oid.to_id_string() == OID_PERSON_DATA =>
                {
                    Some(value.to_vec())
                }
                _ => None,
            })
            .unwrap();
        let expected = b"000000001234567890100000000000000000000000000";
        assert!(person.ends_with(expected));
        assert!(person.len() <= expected.len() + 4);

        let mut record = IssuedCertificateRecord::from_issued(&issued);
        assert_eq!(record.status, CertificateStatus::Valid);

        let crl_path = engine
            .revoke("I", &issued.certificate, &secret("inter-pass"))
            .unwrap();
        record.mark_revoked();
        assert_eq!(record.status, CertificateStatus::Revoked);

        let crl = X509Crl::from_pem(&fs::read(crl_path).unwrap()).unwrap();
        assert!(matches!(
            crl.get_by_serial(cert.serial_number()),
            CrlStatus::Revoked(_)
        ));
    }

    #[test]
    fn failed_signing_removes_intermediate_directory() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();

        let err = engine
            .create_ca(
                &CaParams::new("I".to_string(), secret("inter-pass"))
                    .common_name("Inter".to_string()),
                "R",
                &secret("wrong-password"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Toolchain);
        assert!(!err.stderr().unwrap_or_default().is_empty());
        assert!(!engine.registry().base_dir().join("I").exists());
        assert_eq!(engine.list().unwrap().len(), 1);
    }

    #[test]
    fn renewal_keeps_the_key_pair() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let issued = engine
            .issue(
                "R",
                &IssueRequest::new(maria(), secret("user-pass"), secret("root-pass")),
            )
            .unwrap();
        let dir = engine.resolve("R").unwrap().directory().clone();
        let before = load_cert(&dir.join(&issued.certificate));

        let renewal = engine
            .renew(
                "R",
                &issued.certificate,
                &issued.request,
                &secret("root-pass"),
                Some(30),
            )
            .unwrap();
        let after = load_cert(&renewal.certificate);

        assert_ne!(renewal.serial, issued.serial);
        assert!(after
            .public_key()
            .unwrap()
            .public_eq(&before.public_key().unwrap()));
        // the SAN came from the persisted issuance config
        assert!(after.subject_alt_names().is_some());

        let crl = X509Crl::from_pem(&fs::read(dir.crl()).unwrap()).unwrap();
        assert!(matches!(
            crl.get_by_serial(before.serial_number()),
            CrlStatus::Revoked(_)
        ));
        assert!(matches!(
            crl.get_by_serial(after.serial_number()),
            CrlStatus::NotRevoked
        ));
    }

    #[test]
    fn renewal_with_a_bad_request_keeps_the_old_certificate() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let issued = engine
            .issue(
                "R",
                &IssueRequest::new(maria(), secret("user-pass"), secret("root-pass")),
            )
            .unwrap();
        let dir = engine.resolve("R").unwrap().directory().clone();

        // a private key is not a certificate request
        let err = engine
            .renew(
                "R",
                &issued.certificate,
                &issued.key,
                &secret("root-pass"),
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Toolchain);

        assert_eq!(read_serial(&dir.join(&issued.certificate)).unwrap(), issued.serial);
        assert_eq!(index_status(&dir, &issued.serial).unwrap(), Some('V'));
        let staged: Vec<_> = fs::read_dir(dir.join("certs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".renew-"))
            .collect();
        assert!(staged.is_empty());
    }

    #[test]
    fn revoked_certificate_can_be_renewed() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let issued = engine
            .issue(
                "R",
                &IssueRequest::new(maria(), secret("user-pass"), secret("root-pass")),
            )
            .unwrap();
        engine
            .revoke("R", &issued.certificate, &secret("root-pass"))
            .unwrap();
        let mut record = IssuedCertificateRecord::from_issued(&issued);
        record.mark_revoked();

        let renewal = engine
            .renew(
                "R",
                &issued.certificate,
                &issued.request,
                &secret("root-pass"),
                None,
            )
            .unwrap();
        let dir = engine.resolve("R").unwrap().directory().clone();
        assert_eq!(index_status(&dir, &issued.serial).unwrap(), Some('R'));
        assert_eq!(index_status(&dir, &renewal.serial).unwrap(), Some('V'));

        let crl = X509Crl::from_pem(&fs::read(dir.crl()).unwrap()).unwrap();
        let renewed = load_cert(&renewal.certificate);
        assert!(matches!(
            crl.get_by_serial(renewed.serial_number()),
            CrlStatus::NotRevoked
        ));

        record.renew_validity(renewal.issued_at, renewal.expires_at, renewal.serial.clone());
        assert_eq!(record.status, CertificateStatus::Valid);
        assert_eq!(record.serial, renewal.serial);
    }

    #[test]
    fn withdrawn_certificate_is_published_as_revoked() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let issued = engine
            .issue(
                "R",
                &IssueRequest::new(maria(), secret("user-pass"), secret("root-pass")),
            )
            .unwrap();
        let dir = engine.resolve("R").unwrap().directory().clone();
        let cert = load_cert(&dir.join(&issued.certificate));

        engine.withdraw(&dir, &dir.join(&issued.certificate), &secret("root-pass"));

        assert_eq!(index_status(&dir, &issued.serial).unwrap(), Some('R'));
        let crl = X509Crl::from_pem(&fs::read(dir.crl()).unwrap()).unwrap();
        assert!(matches!(
            crl.get_by_serial(cert.serial_number()),
            CrlStatus::Revoked(_)
        ));
    }

    #[test]
    fn pkcs12_and_plain_key_exports() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();

        let mut request = IssueRequest::new(maria(), secret("user-pass"), secret("root-pass"));
        request.pkcs12_password = Some(secret("p12-pass"));
        request.export_plain_key = true;
        let issued = engine.issue("R", &request).unwrap();

        let dir = engine.resolve("R").unwrap().directory().clone();
        let p12 = dir.join(issued.pkcs12.as_ref().unwrap());
        let parsed = openssl::pkcs12::Pkcs12::from_der(&fs::read(&p12).unwrap())
            .unwrap()
            .parse2("p12-pass")
            .unwrap();
        assert!(parsed.pkey.is_some());
        assert!(parsed.cert.is_some());

        let plain = fs::read(dir.join(issued.plain_key.as_ref().unwrap())).unwrap();
        assert!(openssl::pkey::PKey::private_key_from_pem(&plain).is_ok());
    }

    #[test]
    fn failed_issuance_leaves_no_files() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();

        let err = engine
            .issue(
                "R",
                &IssueRequest::new(maria(), secret("user-pass"), secret("not-the-ca-pass")),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Toolchain);
        let dir = engine.resolve("R").unwrap().directory().clone();
        for sub in ["newcerts", "private", "certs"] {
            let leftovers: Vec<_> = fs::read_dir(dir.join(sub))
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("usr"))
                .collect();
            assert!(leftovers.is_empty(), "{sub}: {leftovers:?}");
        }
    }

    #[test]
    fn delete_refuses_parent_then_removes_leaf() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let base = engine.registry().base_dir().to_path_buf();
        for (name, root) in [("R", ""), ("I", "R")] {
            let dir = CaDirectory::new(&base, name).unwrap();
            dir.create_layout().unwrap();
            let info = CaInfo {
                common_name: name.to_string(),
                root: root.to_string(),
                root_dir: if root.is_empty() {
                    String::new()
                } else {
                    base.to_string_lossy().into_owned()
                },
                ..Default::default()
            };
            CaConfigBuilder::new(dir, info).write().unwrap();
        }

        let err = engine.delete_ca("R").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(base.join("I").exists());
        engine.delete_ca("I").unwrap();
        assert!(!base.join("I").exists());
        engine.delete_ca("R").unwrap();
        assert!(engine.list().unwrap().is_empty());
        assert_eq!(engine.delete_ca("R").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn root_renewal_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let dir = CaDirectory::new(engine.registry().base_dir(), "R").unwrap();
        dir.create_layout().unwrap();
        CaConfigBuilder::new(
            dir,
            CaInfo {
                common_name: "RootR".to_string(),
                ..Default::default()
            },
        )
        .write()
        .unwrap();
        assert_eq!(
            engine.renew_root_ca("R").unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn revoke_unknown_certificate_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let dir = CaDirectory::new(engine.registry().base_dir(), "R").unwrap();
        dir.create_layout().unwrap();
        CaConfigBuilder::new(
            dir,
            CaInfo {
                common_name: "RootR".to_string(),
                ..Default::default()
            },
        )
        .write()
        .unwrap();
        let err = engine
            .revoke("R", Path::new("certs/usrcert_nope.pem.cer"), &secret("root-pass"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
