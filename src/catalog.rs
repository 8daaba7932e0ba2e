//! Catalog of issued certificates.
//!
//! The engine hands back an [`IssuedCertificate`] and never records it
//! itself; callers keep these records in a [`CertificateCatalog`].
//!
//! ```text
//! Valid ──(expiry sweep)──> Expired
//!   │                          │
//!   └──(revoke)──> Revoked <───┘
//!
//! renew: Valid | Expired ──> Valid (new window, same record)
//! ```
//!
//! `Revoked` is terminal.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::engine::IssuedCertificate;
use crate::error::{IcpError, Result};
use crate::profile::CertificateProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateStatus {
    Valid,
    Expired,
    Revoked,
}

/// One issued certificate. Paths are relative to the issuing CA directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificateRecord {
    /// The issuance token, unique per certificate.
    pub id: String,
    pub ca_name: String,
    pub profile: CertificateProfile,
    pub common_name: String,
    pub serial: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub request: PathBuf,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CertificateStatus,
}

impl IssuedCertificateRecord {
    pub fn from_issued(issued: &IssuedCertificate) -> Self {
        Self {
            id: issued.token.clone(),
            ca_name: issued.ca_name.clone(),
            profile: issued.profile,
            common_name: issued.common_name.clone(),
            serial: issued.serial.clone(),
            certificate: issued.certificate.clone(),
            key: issued.key.clone(),
            request: issued.request.clone(),
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
            status: CertificateStatus::Valid,
        }
    }

    /// The engine-side view of this record, for exports.
    pub fn to_issued(&self) -> IssuedCertificate {
        IssuedCertificate {
            ca_name: self.ca_name.clone(),
            token: self.id.clone(),
            profile: self.profile,
            common_name: self.common_name.clone(),
            serial: self.serial.clone(),
            certificate: self.certificate.clone(),
            key: self.key.clone(),
            request: self.request.clone(),
            pkcs12: None,
            plain_key: None,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }

    pub fn mark_revoked(&mut self) {
        self.status = CertificateStatus::Revoked;
    }

    /// Valid -> Expired once `now` has passed `expires_at`.
    ///
    /// Returns whether the status changed.
    pub fn mark_expired_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == CertificateStatus::Valid && self.expires_at <= now {
            self.status = CertificateStatus::Expired;
            return true;
        }
        false
    }

    /// Start a new validity window after a renewal. This is the only way
    /// out of `Revoked`.
    pub fn renew_validity(
        &mut self,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        serial: String,
    ) {
        self.issued_at = issued_at;
        self.expires_at = expires_at;
        self.serial = serial;
        self.status = CertificateStatus::Valid;
    }
}

/// Record store for issued certificates.
///
/// Implementations serialize their own access; the engine never calls
/// into the catalog.
pub trait CertificateCatalog {
    /// Add a record. Fails with `Validation` if the id is taken.
    fn insert(&mut self, record: IssuedCertificateRecord) -> Result<()>;
    /// Replace a record. Fails with `NotFound` if the id is unknown.
    fn update(&mut self, record: IssuedCertificateRecord) -> Result<()>;
    fn delete(&mut self, id: &str) -> Result<()>;
    fn get(&self, id: &str) -> Option<IssuedCertificateRecord>;
    fn list_by_issuer(&self, ca_name: &str) -> Vec<IssuedCertificateRecord>;
    fn list_all(&self) -> Vec<IssuedCertificateRecord>;
    /// Record of the certificate at `certificate` under CA `ca_name`.
    fn find_by_certificate(
        &self,
        ca_name: &str,
        certificate: &Path,
    ) -> Option<IssuedCertificateRecord> {
        self.list_by_issuer(ca_name)
            .into_iter()
            .find(|r| r.certificate == certificate || certificate.ends_with(&r.certificate))
    }
    /// Expire every Valid record whose window ended before `now`.
    fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<usize>;
}

/// In-memory catalog keyed by record id.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    records: BTreeMap<String, IssuedCertificateRecord>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CertificateCatalog for MemoryCatalog {
    fn insert(&mut self, record: IssuedCertificateRecord) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(IcpError::Validation(format!(
                "certificate {} is already cataloged",
                record.id
            )));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn update(&mut self, record: IssuedCertificateRecord) -> Result<()> {
        match self.records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(IcpError::NotFound(format!("certificate {}", record.id))),
        }
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| IcpError::NotFound(format!("certificate {}", id)))
    }

    fn get(&self, id: &str) -> Option<IssuedCertificateRecord> {
        self.records.get(id).cloned()
    }

    fn list_by_issuer(&self, ca_name: &str) -> Vec<IssuedCertificateRecord> {
        self.records
            .values()
            .filter(|r| r.ca_name.eq_ignore_ascii_case(ca_name))
            .cloned()
            .collect()
    }

    fn list_all(&self) -> Vec<IssuedCertificateRecord> {
        self.records.values().cloned().collect()
    }

    fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for record in self.records.values_mut() {
            if record.mark_expired_if_due(now) {
                debug!(id = %record.id, ca = %record.ca_name, "certificate expired");
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// JSON-file catalog. The whole file is rewritten on each mutation through
/// a temporary file in the same directory, then renamed over the original.
#[derive(Debug)]
pub struct JsonFileCatalog {
    path: PathBuf,
    inner: MemoryCatalog,
}

impl JsonFileCatalog {
    /// Open `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.is_file() {
            let data = fs::read(&path).map_err(|e| IcpError::fs(&path, e))?;
            let records: Vec<IssuedCertificateRecord> = serde_json::from_slice(&data)?;
            let mut inner = MemoryCatalog::new();
            for record in records {
                inner.insert(record)?;
            }
            inner
        } else {
            MemoryCatalog::new()
        };
        debug!(path = %path.display(), records = inner.len(), "catalog opened");
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| IcpError::fs(&parent, e))?;

        let json = serde_json::to_vec_pretty(&self.inner.list_all())?;
        let mut temp = NamedTempFile::new_in(&parent).map_err(|e| IcpError::fs(&parent, e))?;
        temp.write_all(&json)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| IcpError::fs(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| IcpError::fs(&self.path, e.error))?;
        Ok(())
    }
}

impl CertificateCatalog for JsonFileCatalog {
    fn insert(&mut self, record: IssuedCertificateRecord) -> Result<()> {
        self.inner.insert(record)?;
        self.save()
    }

    fn update(&mut self, record: IssuedCertificateRecord) -> Result<()> {
        self.inner.update(record)?;
        self.save()
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.inner.delete(id)?;
        self.save()
    }

    fn get(&self, id: &str) -> Option<IssuedCertificateRecord> {
        self.inner.get(id)
    }

    fn list_by_issuer(&self, ca_name: &str) -> Vec<IssuedCertificateRecord> {
        self.inner.list_by_issuer(ca_name)
    }

    fn list_all(&self) -> Vec<IssuedCertificateRecord> {
        self.inner.list_all()
    }

    fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.inner.mark_expired(now)?;
        if expired > 0 {
            self.save()?;
            info!(expired, path = %self.path.display(), "expired certificates swept");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, ca: &str, expires_in_days: i64) -> IssuedCertificateRecord {
        let issued_at = Utc::now();
        IssuedCertificateRecord {
            id: id.to_string(),
            ca_name: ca.to_string(),
            profile: CertificateProfile::ECpf,
            common_name: "Maria Silva:12345678901".to_string(),
            serial: "1A".to_string(),
            certificate: PathBuf::from(format!("certs/usrcert_{id}.pem.cer")),
            key: PathBuf::from(format!("private/usrkey_{id}.pem")),
            request: PathBuf::from(format!("newcerts/usrreq_{id}.pem")),
            issued_at,
            expires_at: issued_at + Duration::days(expires_in_days),
            status: CertificateStatus::Valid,
        }
    }

    #[test]
    fn status_transitions() {
        let now = Utc::now();
        let mut r = record("a", "I", -1);
        assert!(r.mark_expired_if_due(now));
        assert_eq!(r.status, CertificateStatus::Expired);
        // expiry is only written once
        assert!(!r.mark_expired_if_due(now));

        r.renew_validity(now, now + Duration::days(30), "2B".to_string());
        assert_eq!(r.status, CertificateStatus::Valid);
        assert_eq!(r.serial, "2B");

        r.mark_revoked();
        assert_eq!(r.status, CertificateStatus::Revoked);
        assert!(!r.mark_expired_if_due(now + Duration::days(60)));
        r.renew_validity(now, now + Duration::days(30), "3C".to_string());
        assert_eq!(r.status, CertificateStatus::Valid);
        assert_eq!(r.serial, "3C");
    }

    #[test]
    fn memory_catalog_crud() {
        let mut catalog = MemoryCatalog::new();
        catalog.insert(record("a", "I", 10)).unwrap();
        catalog.insert(record("b", "J", 10)).unwrap();
        assert_eq!(
            catalog.insert(record("a", "I", 10)).unwrap_err().kind(),
            ErrorKind::Validation
        );

        assert_eq!(catalog.list_by_issuer("i").len(), 1);
        assert_eq!(
            catalog
                .find_by_certificate("I", Path::new("/srv/ca/I/certs/usrcert_a.pem.cer"))
                .unwrap()
                .id,
            "a"
        );
        assert!(catalog
            .find_by_certificate("J", Path::new("certs/usrcert_a.pem.cer"))
            .is_none());
        let issued = catalog.get("a").unwrap().to_issued();
        assert_eq!(issued.token, "a");
        assert_eq!(IssuedCertificateRecord::from_issued(&issued), catalog.get("a").unwrap());
        assert_eq!(catalog.list_all().len(), 2);

        let mut a = catalog.get("a").unwrap();
        a.mark_revoked();
        catalog.update(a).unwrap();
        assert_eq!(catalog.get("a").unwrap().status, CertificateStatus::Revoked);
        assert_eq!(
            catalog.update(record("zz", "I", 1)).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        catalog.delete("b").unwrap();
        assert!(catalog.get("b").is_none());
        assert_eq!(catalog.delete("b").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn sweep_only_touches_due_valid_records() {
        let mut catalog = MemoryCatalog::new();
        catalog.insert(record("old", "I", -5)).unwrap();
        catalog.insert(record("new", "I", 5)).unwrap();
        let mut revoked = record("gone", "I", -5);
        revoked.mark_revoked();
        catalog.insert(revoked).unwrap();

        assert_eq!(catalog.mark_expired(Utc::now()).unwrap(), 1);
        assert_eq!(catalog.get("old").unwrap().status, CertificateStatus::Expired);
        assert_eq!(catalog.get("new").unwrap().status, CertificateStatus::Valid);
        assert_eq!(catalog.get("gone").unwrap().status, CertificateStatus::Revoked);
        assert_eq!(catalog.mark_expired(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn json_catalog_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data").join("catalog.json");

        let mut catalog = JsonFileCatalog::open(&path).unwrap();
        assert!(catalog.list_all().is_empty());
        catalog.insert(record("a", "I", -1)).unwrap();
        catalog.insert(record("b", "I", 100)).unwrap();
        assert_eq!(catalog.mark_expired(Utc::now()).unwrap(), 1);

        let reopened = JsonFileCatalog::open(&path).unwrap();
        assert_eq!(reopened.list_all().len(), 2);
        assert_eq!(reopened.get("a").unwrap().status, CertificateStatus::Expired);
        assert_eq!(reopened.get("b").unwrap().profile, CertificateProfile::ECpf);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"e-CPF\""));
        assert!(text.contains("\"Expired\""));
        // no temp files left next to the catalog
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_catalog_is_a_json_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(
            JsonFileCatalog::open(&path).unwrap_err().kind(),
            ErrorKind::Json
        );
    }
}
