//! On-disk layout of a single CA.
//!
//! ```text
//! <base_dir>/<name>/
//! ├── ca_ossl.cnf            CA config (icpAdmin metadata + toolchain sections)
//! ├── user_ossl.cnf          issuance config template
//! ├── index.txt              toolchain certificate database
//! ├── serial                 next certificate serial, seeded "01"
//! ├── serial_crl             next CRL number, seeded "01"
//! ├── certs/cacert.pem.cer
//! ├── certs/cachain.p7b
//! ├── crl/lcr.pem.crl
//! ├── newcerts/careq.pem
//! └── private/cakey.pem
//! ```
//!
//! Every path is derived from the base directory and CA name alone. The only
//! randomness is the per-issuance token used by [`IssuanceFiles`].

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::{IcpError, Result};

pub const CA_CONFIG_FILE: &str = "ca_ossl.cnf";
pub const USER_CONFIG_FILE: &str = "user_ossl.cnf";
pub const INDEX_FILE: &str = "index.txt";
pub const SERIAL_FILE: &str = "serial";
pub const CRL_SERIAL_FILE: &str = "serial_crl";
pub const CA_CERT_FILE: &str = "certs/cacert.pem.cer";
pub const CA_CHAIN_FILE: &str = "certs/cachain.p7b";
pub const CRL_FILE: &str = "crl/lcr.pem.crl";
pub const CA_KEY_FILE: &str = "private/cakey.pem";
pub const CA_REQUEST_FILE: &str = "newcerts/careq.pem";

const SUBDIRECTORIES: [&str; 4] = ["certs", "crl", "newcerts", "private"];
const SEEDED_FILES: [(&str, &str); 3] = [(INDEX_FILE, ""), (SERIAL_FILE, "01\n"), (CRL_SERIAL_FILE, "01\n")];

/// Number of random bytes behind each issuance token.
pub const ISSUANCE_TOKEN_BYTES: usize = 16;

/// Reject names that could escape the base directory.
pub fn validate_ca_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(IcpError::Validation("CA name must not be empty".to_string()));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) || name.contains('\0') {
        return Err(IcpError::Validation(format!("invalid CA name: {:?}", name)));
    }
    Ok(())
}

/// URL-safe Base64 (no padding) of `byte_len` bytes from the OpenSSL CSPRNG.
///
/// Each call draws fresh bytes; there is no shared generator state.
pub fn random_token(byte_len: usize) -> Result<String> {
    let mut bytes = vec![0u8; byte_len];
    openssl::rand::rand_bytes(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDirectory {
    base_dir: PathBuf,
    name: String,
    root: PathBuf,
}

impl CaDirectory {
    pub fn new(base_dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        validate_ca_name(name)?;
        let base_dir = base_dir.into();
        let root = base_dir.join(name);
        Ok(Self {
            base_dir,
            name: name.to_string(),
            root,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The CA's own directory, `<base_dir>/<name>`.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn ca_config(&self) -> PathBuf {
        self.join(CA_CONFIG_FILE)
    }

    pub fn user_config(&self) -> PathBuf {
        self.join(USER_CONFIG_FILE)
    }

    pub fn index(&self) -> PathBuf {
        self.join(INDEX_FILE)
    }

    pub fn serial(&self) -> PathBuf {
        self.join(SERIAL_FILE)
    }

    pub fn crl_serial(&self) -> PathBuf {
        self.join(CRL_SERIAL_FILE)
    }

    pub fn certificate(&self) -> PathBuf {
        self.join(CA_CERT_FILE)
    }

    pub fn chain(&self) -> PathBuf {
        self.join(CA_CHAIN_FILE)
    }

    pub fn crl(&self) -> PathBuf {
        self.join(CRL_FILE)
    }

    pub fn private_key(&self) -> PathBuf {
        self.join(CA_KEY_FILE)
    }

    pub fn request(&self) -> PathBuf {
        self.join(CA_REQUEST_FILE)
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the directory tree and seed `index.txt`, `serial` and `serial_crl`.
    ///
    /// Fails if the CA directory already exists.
    pub fn create_layout(&self) -> Result<()> {
        if self.root.exists() {
            return Err(IcpError::Validation(format!(
                "CA directory already exists: {}",
                self.root.display()
            )));
        }
        for sub in SUBDIRECTORIES {
            let dir = self.join(sub);
            fs::create_dir_all(&dir).map_err(|e| IcpError::fs(&dir, e))?;
        }
        for (file, contents) in SEEDED_FILES {
            let path = self.join(file);
            fs::write(&path, contents).map_err(|e| IcpError::fs(&path, e))?;
        }
        debug!(ca = %self.name, path = %self.root.display(), "created CA layout");
        Ok(())
    }

    /// Check that every directory and seeded file of the layout is present.
    pub fn verify_layout(&self) -> Result<()> {
        for sub in SUBDIRECTORIES {
            let dir = self.join(sub);
            if !dir.is_dir() {
                return Err(missing(&dir));
            }
        }
        for (file, _) in SEEDED_FILES {
            let path = self.join(file);
            if !path.is_file() {
                return Err(missing(&path));
            }
        }
        Ok(())
    }

    /// Delete the whole CA directory. Removing an absent directory is a no-op.
    pub fn remove(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.root).map_err(|e| IcpError::fs(&self.root, e))?;
        debug!(ca = %self.name, "removed CA directory");
        Ok(())
    }

    /// Remove the directory after a failed multi-step operation.
    ///
    /// Cleanup failures are logged, never returned.
    pub(crate) fn rollback(&self) {
        if let Err(e) = self.remove() {
            warn!(ca = %self.name, error = %e, "failed to remove partially created CA");
        }
    }
}

fn missing(path: &Path) -> IcpError {
    IcpError::fs(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "missing from CA layout"),
    )
}

/// Request, certificate and key paths for one end-entity issuance.
///
/// Paths are relative to the CA directory:
/// `newcerts/usrreq_<token>.pem`, `certs/usrcert_<token>.pem.cer`,
/// `private/usrkey_<token>.pem`. The issuance config (with its
/// `subject_alt_section`) is kept as `newcerts/usrcnf_<token>.cnf` so a
/// renewal re-signs with the same extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceFiles {
    pub token: String,
    pub request: PathBuf,
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub config: PathBuf,
}

impl IssuanceFiles {
    pub fn allocate() -> Result<Self> {
        Ok(Self::from_token(random_token(ISSUANCE_TOKEN_BYTES)?))
    }

    pub fn from_token(token: String) -> Self {
        Self {
            request: PathBuf::from(format!("newcerts/usrreq_{}.pem", token)),
            certificate: PathBuf::from(format!("certs/usrcert_{}.pem.cer", token)),
            key: PathBuf::from(format!("private/usrkey_{}.pem", token)),
            config: PathBuf::from(format!("newcerts/usrcnf_{}.cnf", token)),
            token,
        }
    }

    /// Recover the file set from a request or certificate path.
    pub fn from_path(path: &Path) -> Option<Self> {
        let file = path.file_name()?.to_str()?;
        let token = file
            .strip_prefix("usrreq_")
            .and_then(|rest| rest.strip_suffix(".pem"))
            .or_else(|| {
                file.strip_prefix("usrcert_")
                    .and_then(|rest| rest.strip_suffix(".pem.cer"))
            })?;
        if token.is_empty() {
            return None;
        }
        Some(Self::from_token(token.to_string()))
    }

    /// PKCS#12 bundle next to the certificate.
    pub fn pkcs12(&self) -> PathBuf {
        PathBuf::from(format!("certs/usrcert_{}.p12", self.token))
    }

    /// Unencrypted key copy next to the encrypted one.
    pub fn plain_key(&self) -> PathBuf {
        PathBuf::from(format!("private/usrkey_{}.plain.pem", self.token))
    }

    /// Best-effort removal of whatever was written under `dir`.
    pub(crate) fn discard(&self, dir: &CaDirectory) {
        for relative in [
            &self.request,
            &self.certificate,
            &self.key,
            &self.config,
            &self.pkcs12(),
            &self.plain_key(),
        ] {
            let path = dir.join(relative);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove issuance file");
                }
            }
        }
    }
}
