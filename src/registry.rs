//! Filesystem-backed CA registry.
//!
//! Nothing is cached: every call rescans the base directory, so CAs created
//! or deleted by another process are visible on the next call.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ca_directory::{self, CaDirectory};
use crate::certificate_authority::CertificateAuthority;
use crate::error::{IcpError, Result};

#[derive(Debug, Clone)]
pub struct CaRegistry {
    base_dir: PathBuf,
}

impl CaRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Every immediate sub-directory holding a `ca_ossl.cnf`, sorted by name.
    ///
    /// A missing base directory is an empty registry.
    pub fn list(&self) -> Result<Vec<CertificateAuthority>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.base_dir).map_err(|e| IcpError::fs(&self.base_dir, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IcpError::fs(&self.base_dir, e))?;
            let path = entry.path();
            if !path.is_dir() || !path.join(ca_directory::CA_CONFIG_FILE).is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "skipping non UTF-8 directory"),
            }
        }
        names.sort();

        names
            .iter()
            .map(|name| CertificateAuthority::new(&self.base_dir, name))
            .collect()
    }

    /// Case-insensitive lookup in the current listing.
    pub fn resolve(&self, name: &str) -> Result<CertificateAuthority> {
        let wanted = name.to_lowercase();
        self.list()?
            .into_iter()
            .find(|ca| ca.name().to_lowercase() == wanted)
            .ok_or_else(|| IcpError::NotFound(format!("CA {:?}", name)))
    }

    /// Certificate files from `ca` up to its Root, following `root`/`rootDir`.
    pub fn chain(&self, ca: &CertificateAuthority) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        let mut current = ca.clone();

        loop {
            let key = current.directory().path().to_path_buf();
            if !seen.insert(key) {
                return Err(IcpError::Configuration(format!(
                    "CA hierarchy of {} contains a cycle at {}",
                    ca.name(),
                    current.name()
                )));
            }
            if !current.directory().ca_config().is_file() {
                return Err(IcpError::NotFound(format!(
                    "CA {:?} in {}",
                    current.name(),
                    current.base_dir().display()
                )));
            }
            files.push(current.directory().certificate());
            match current.parent()? {
                Some(parent) => current = parent,
                None => return Ok(files),
            }
        }
    }

    /// CAs in this base directory whose parent is `ca`.
    pub fn children(&self, ca: &CertificateAuthority) -> Result<Vec<CertificateAuthority>> {
        let mut children = Vec::new();
        for candidate in self.list()? {
            let Some(parent) = candidate.parent()? else {
                continue;
            };
            if parent.name().eq_ignore_ascii_case(ca.name())
                && same_dir(parent.base_dir(), ca.base_dir())
            {
                children.push(candidate);
            }
        }
        Ok(children)
    }

    pub fn directory(&self, name: &str) -> Result<CaDirectory> {
        CaDirectory::new(&self.base_dir, name)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_config::CaConfigBuilder;
    use crate::certificate_authority::CaInfo;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn add(base: &Path, name: &str, root: &str) {
        let dir = CaDirectory::new(base, name).unwrap();
        dir.create_layout().unwrap();
        let info = CaInfo {
            common_name: format!("CN {}", name),
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

    #[test]
    fn list_skips_non_ca_directories() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "B", "");
        add(tmp.path(), "A", "");
        fs::create_dir(tmp.path().join("backups")).unwrap();
        fs::write(tmp.path().join("catalog.json"), "[]").unwrap();

        let registry = CaRegistry::new(tmp.path());
        let names: Vec<_> = registry
            .list()
            .unwrap()
            .iter()
            .map(|ca| ca.name().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn list_sees_changes_without_caching() {
        let tmp = TempDir::new().unwrap();
        let registry = CaRegistry::new(tmp.path());
        assert!(registry.list().unwrap().is_empty());
        add(tmp.path(), "R", "");
        assert_eq!(registry.list().unwrap().len(), 1);
        fs::remove_dir_all(tmp.path().join("R")).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "AC-Raiz", "");
        let registry = CaRegistry::new(tmp.path());
        assert_eq!(registry.resolve("ac-raiz").unwrap().name(), "AC-Raiz");
        assert_eq!(
            registry.resolve("other").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn chain_runs_leaf_to_root() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "R", "");
        add(tmp.path(), "I", "R");
        add(tmp.path(), "J", "I");
        let registry = CaRegistry::new(tmp.path());
        let leaf = registry.resolve("J").unwrap();
        let chain = registry.chain(&leaf).unwrap();
        assert_eq!(
            chain,
            vec![
                tmp.path().join("J/certs/cacert.pem.cer"),
                tmp.path().join("I/certs/cacert.pem.cer"),
                tmp.path().join("R/certs/cacert.pem.cer"),
            ]
        );
    }

    #[test]
    fn chain_detects_cycles() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "A", "B");
        add(tmp.path(), "B", "A");
        let registry = CaRegistry::new(tmp.path());
        let err = registry.chain(&registry.resolve("A").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn chain_with_missing_parent_is_not_found() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "I", "gone");
        let registry = CaRegistry::new(tmp.path());
        let err = registry.chain(&registry.resolve("I").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn children_lists_subordinates() {
        let tmp = TempDir::new().unwrap();
        add(tmp.path(), "R", "");
        add(tmp.path(), "I", "R");
        add(tmp.path(), "S", "");
        let registry = CaRegistry::new(tmp.path());
        let root = registry.resolve("R").unwrap();
        let children = registry.children(&root).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "I");
        assert!(registry
            .children(&registry.resolve("S").unwrap())
            .unwrap()
            .is_empty());
    }
}
