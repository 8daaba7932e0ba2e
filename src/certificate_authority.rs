//! CA descriptor: a name, a base directory and the metadata recorded in the
//! `icpAdmin` section of its `ca_ossl.cnf`.
//!
//! A descriptor is a snapshot. The parent is referenced by name and base
//! directory (`root`/`rootDir`), never by an in-memory link.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::ca_config::{ConfigDocument, SECTION_ICP_ADMIN};
use crate::ca_directory::CaDirectory;
use crate::error::{IcpError, Result};
use crate::profile::SubjectBase;

/// Metadata stored in `icpAdmin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaInfo {
    pub common_name: String,
    pub country: String,
    pub organization: String,
    pub org_unit: String,
    /// Parent CA name; empty for a Root CA.
    pub root: String,
    /// Parent CA base directory; empty for a Root CA.
    pub root_dir: String,
    /// Where this CA's CRL is published.
    pub crl_uri: String,
    pub cps_uri: String,
    pub policies: Vec<String>,
}

impl CaInfo {
    pub fn is_root(&self) -> bool {
        self.root.is_empty()
    }

    pub fn subject_base(&self) -> SubjectBase {
        SubjectBase {
            country: self.country.clone(),
            organization: self.organization.clone(),
            org_unit: self.org_unit.clone(),
        }
    }

    /// `-subj` form of the CA's own Subject.
    pub fn subject_dn(&self) -> String {
        let mut dn = String::new();
        for (key, value) in [
            ("C", &self.country),
            ("O", &self.organization),
            ("OU", &self.org_unit),
            ("CN", &self.common_name),
        ] {
            if value.is_empty() {
                continue;
            }
            dn.push('/');
            dn.push_str(key);
            dn.push('=');
            dn.push_str(&value.replace('\\', "\\\\").replace('/', "\\/"));
        }
        dn
    }

    pub fn from_document(doc: &ConfigDocument) -> Result<Self> {
        let section = doc.section(SECTION_ICP_ADMIN).ok_or_else(|| {
            IcpError::Configuration(format!("missing [{}] section", SECTION_ICP_ADMIN))
        })?;
        let field = |key: &str| section.get(key).unwrap_or_default().to_string();
        let common_name = field("commonName");
        if common_name.is_empty() {
            return Err(IcpError::Configuration(format!(
                "[{}] has no commonName",
                SECTION_ICP_ADMIN
            )));
        }
        Ok(Self {
            common_name,
            country: field("country"),
            organization: field("organization"),
            org_unit: field("orgUnit"),
            root: field("root"),
            root_dir: field("rootDir"),
            crl_uri: field("crlUri"),
            cps_uri: field("cpsUri"),
            policies: field("policies")
                .split(',')
                .map(str::trim)
                .filter(|oid| !oid.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// A CA on disk. `info` is read from `ca_ossl.cnf` on first use and cached
/// for the lifetime of this value; call [`refresh`](Self::refresh) to re-read.
#[derive(Debug)]
pub struct CertificateAuthority {
    directory: CaDirectory,
    info: OnceLock<CaInfo>,
}

impl CertificateAuthority {
    pub fn new(base_dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        Ok(Self::from_directory(CaDirectory::new(base_dir, name)?))
    }

    pub fn from_directory(directory: CaDirectory) -> Self {
        Self {
            directory,
            info: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.directory.name()
    }

    pub fn base_dir(&self) -> &Path {
        self.directory.base_dir()
    }

    pub fn directory(&self) -> &CaDirectory {
        &self.directory
    }

    pub fn info(&self) -> Result<&CaInfo> {
        if let Some(info) = self.info.get() {
            return Ok(info);
        }
        let doc = ConfigDocument::load(&self.directory.ca_config())?;
        let info = CaInfo::from_document(&doc)?;
        Ok(self.info.get_or_init(|| info))
    }

    /// Drop the cached metadata so the next access re-reads the config file.
    pub fn refresh(&mut self) {
        self.info = OnceLock::new();
    }

    pub fn is_root(&self) -> Result<bool> {
        Ok(self.info()?.is_root())
    }

    pub fn common_name(&self) -> Result<&str> {
        Ok(&self.info()?.common_name)
    }

    /// Parent descriptor, or `None` for a Root CA.
    pub fn parent(&self) -> Result<Option<CertificateAuthority>> {
        let info = self.info()?;
        if info.is_root() {
            return Ok(None);
        }
        let root_dir = if info.root_dir.is_empty() {
            self.base_dir().to_path_buf()
        } else {
            PathBuf::from(&info.root_dir)
        };
        Ok(Some(CertificateAuthority::new(root_dir, &info.root)?))
    }
}

impl Clone for CertificateAuthority {
    fn clone(&self) -> Self {
        let info = OnceLock::new();
        if let Some(cached) = self.info.get() {
            let _ = info.set(cached.clone());
        }
        Self {
            directory: self.directory.clone(),
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_config::CaConfigBuilder;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn write_ca(base: &Path, name: &str, info: CaInfo) -> CertificateAuthority {
        let dir = CaDirectory::new(base, name).unwrap();
        dir.create_layout().unwrap();
        CaConfigBuilder::new(dir.clone(), info).write().unwrap();
        CertificateAuthority::from_directory(dir)
    }

    #[test]
    fn info_is_read_from_config() {
        let tmp = TempDir::new().unwrap();
        let ca = write_ca(
            tmp.path(),
            "R",
            CaInfo {
                common_name: "RootR".to_string(),
                country: "BR".to_string(),
                organization: "Test".to_string(),
                org_unit: "PKI".to_string(),
                policies: vec!["2.16.76.1.2.1.1".to_string()],
                ..Default::default()
            },
        );
        let info = ca.info().unwrap();
        assert_eq!(info.common_name, "RootR");
        assert_eq!(info.policies, vec!["2.16.76.1.2.1.1".to_string()]);
        assert!(ca.is_root().unwrap());
        assert!(ca.parent().unwrap().is_none());
        assert_eq!(info.subject_dn(), "/C=BR/O=Test/OU=PKI/CN=RootR");
    }

    #[test]
    fn refresh_rereads_config() {
        let tmp = TempDir::new().unwrap();
        let mut ca = write_ca(
            tmp.path(),
            "R",
            CaInfo {
                common_name: "Before".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(ca.common_name().unwrap(), "Before");

        let mut doc = ConfigDocument::load(&ca.directory().ca_config()).unwrap();
        doc.set(SECTION_ICP_ADMIN, "commonName", "After");
        doc.write(&ca.directory().ca_config()).unwrap();

        assert_eq!(ca.common_name().unwrap(), "Before");
        ca.refresh();
        assert_eq!(ca.common_name().unwrap(), "After");
    }

    #[test]
    fn parent_follows_root_pointer() {
        let tmp = TempDir::new().unwrap();
        let child = write_ca(
            tmp.path(),
            "I",
            CaInfo {
                common_name: "Inter".to_string(),
                root: "R".to_string(),
                root_dir: tmp.path().to_string_lossy().into_owned(),
                ..Default::default()
            },
        );
        let parent = child.parent().unwrap().unwrap();
        assert_eq!(parent.name(), "R");
        assert_eq!(parent.base_dir(), tmp.path());
    }

    #[test]
    fn missing_config_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(tmp.path(), "ghost").unwrap();
        assert_eq!(ca.info().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
