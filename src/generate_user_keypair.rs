//! End-entity issuance for the ICP-Brasil profiles.
//!
//! # Sequence
//! 1. Encode Subject, Subject Alternative Name and EKU for the holder
//! 2. Allocate `usrreq_<token>`/`usrcert_<token>`/`usrkey_<token>` paths
//! 3. Write the per-issuance config: the CA's `user_ossl.cnf` plus the
//!    `subject_alt_section`
//! 4. Generate key + CSR, sign it with the CA key (`v3_req`)
//! 5. Optionally export PKCS#12 and an unencrypted key copy
//!
//! The returned [`IssuedCertificate`] is meant for the catalog; the engine
//! itself keeps no record. Passwords are checked before any file is
//! written. On failure every file allocated in step 2 is removed; if the
//! certificate was already signed it is revoked first and the CRL
//! regenerated, so the CA database never lists a certificate nobody holds.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::ca_config::{self, ConfigDocument};
use crate::ca_directory::{CaDirectory, IssuanceFiles};
use crate::certificate_authority::CertificateAuthority;
use crate::engine::{read_serial, CaEngine, IssueRequest, IssuedCertificate};
use crate::error::Result;
use crate::profile::{self, EncodedProfile};
use crate::toolchain::{check_password, KeyRequest, SignRequest};

impl CaEngine {
    /// Issue a certificate for `request.holder` under CA `name`.
    ///
    /// # Returns
    /// File paths (relative to the CA directory), serial and validity window
    /// of the new certificate.
    pub fn issue(&self, name: &str, request: &IssueRequest) -> Result<IssuedCertificate> {
        let _entered = self.span.enter();
        let ca = self.registry.resolve(name)?;
        let mut base = ca.info()?.subject_base();
        if let Some(ou) = request.org_unit.as_deref().filter(|ou| !ou.trim().is_empty()) {
            base.org_unit = ou.trim().to_string();
        }
        let encoded = profile::encode(&request.holder, &base)?;
        check_password("key password", &request.key_password)?;
        check_password("CA password", &request.ca_password)?;
        if let Some(p12_password) = &request.pkcs12_password {
            check_password("PKCS#12 password", p12_password)?;
        }
        let files = IssuanceFiles::allocate()?;
        let dir = ca.directory();

        info!(
            ca = %ca.name(),
            profile = %encoded.profile,
            cn = %encoded.common_name,
            token = %files.token,
            "issuing certificate"
        );
        let mut issued = match self.build_user_certificate(&ca, &encoded, &files, request) {
            Ok(issued) => issued,
            Err(e) => {
                warn!(ca = %ca.name(), error = %e, "issuance failed, removing files");
                files.discard(dir);
                return Err(e);
            }
        };
        if let Err(e) = self.export_extras(dir, &files, request, &mut issued) {
            warn!(ca = %ca.name(), serial = %issued.serial, error = %e, "export failed after signing, revoking certificate");
            self.withdraw(dir, &dir.join(&files.certificate), &request.ca_password);
            files.discard(dir);
            return Err(e);
        }
        info!(ca = %ca.name(), serial = %issued.serial, "certificate issued");
        Ok(issued)
    }

    fn build_user_certificate(
        &self,
        ca: &CertificateAuthority,
        encoded: &EncodedProfile,
        files: &IssuanceFiles,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate> {
        let dir = ca.directory();
        let config = dir.join(&files.config);
        write_issuance_config(dir, encoded, &config)?;

        let key = dir.join(&files.key);
        let csr = dir.join(&files.request);
        let certificate = dir.join(&files.certificate);
        self.toolchain.request(&KeyRequest {
            config: &config,
            key: &key,
            output: &csr,
            subject: &encoded.subject_dn(),
            password: &request.key_password,
        })?;

        let days = request
            .validity_days
            .unwrap_or(self.defaults.certificate_validity_days);
        let issued_at = Utc::now();
        self.toolchain.sign(&SignRequest {
            issuer_config: &dir.ca_config(),
            request: &csr,
            certificate: &certificate,
            days,
            extfile: &config,
            extensions: ca_config::SECTION_V3_REQ,
            password: &request.ca_password,
        })?;

        Ok(IssuedCertificate {
            ca_name: ca.name().to_string(),
            token: files.token.clone(),
            profile: encoded.profile,
            common_name: encoded.common_name.clone(),
            serial: read_serial(&certificate)?,
            certificate: files.certificate.clone(),
            key: files.key.clone(),
            request: files.request.clone(),
            pkcs12: None,
            plain_key: None,
            issued_at,
            expires_at: issued_at + ChronoDuration::days(i64::from(days)),
        })
    }

    /// Optional PKCS#12 bundle and plain key copy of a signed certificate.
    fn export_extras(
        &self,
        dir: &CaDirectory,
        files: &IssuanceFiles,
        request: &IssueRequest,
        issued: &mut IssuedCertificate,
    ) -> Result<()> {
        if let Some(p12_password) = &request.pkcs12_password {
            self.export_pkcs12(&issued, &request.key_password, p12_password)?;
            issued.pkcs12 = Some(files.pkcs12());
        }
        if request.export_plain_key {
            self.decrypt_key(
                &dir.join(&files.key),
                &request.key_password,
                &dir.join(files.plain_key()),
            )?;
            issued.plain_key = Some(files.plain_key());
        }
        Ok(())
    }
}

/// The CA's `user_ossl.cnf` with the holder's SAN and EKU merged in.
fn write_issuance_config(
    dir: &CaDirectory,
    encoded: &EncodedProfile,
    output: &std::path::Path,
) -> Result<()> {
    let mut doc = ConfigDocument::load(&dir.user_config())?;
    ca_config::with_subject_alt_names(&mut doc, encoded);
    doc.write(output)
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::{engine, maria, openssl_available, root_params, secret};
    use crate::engine::IssueRequest;
    use crate::profile::{CertificateProfile, Holder, LegalEntity, NaturalPerson};
    use openssl::nid::Nid;
    use openssl::x509::X509;
    use std::fs;
    use tempfile::TempDir;

    fn acme() -> LegalEntity {
        LegalEntity {
            company_name: "ACME LTDA".to_string(),
            email: "pki@acme.com.br".to_string(),
            cnpj: "12345678000195".to_string(),
            locality: "Brasilia".to_string(),
            state: "DF".to_string(),
            responsible: NaturalPerson {
                name: "Joao Souza".to_string(),
                cpf: "98765432100".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn every_profile_can_be_issued() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();

        let holders = vec![
            Holder::ECnpj(acme()),
            Holder::Ric {
                person: NaturalPerson {
                    name: "Maria Silva".to_string(),
                    cpf: "12345678901".to_string(),
                    ..Default::default()
                },
                ric: "11122233344".to_string(),
            },
            Holder::ECodigo(acme()),
            Holder::EServidor {
                entity: acme(),
                server_name: "www.acme.com.br".to_string(),
                guid: Some("6F9619FF8B86D011B42D00C04FC964FF".to_string()),
            },
            Holder::EAplicacao {
                entity: acme(),
                application: "Faturamento".to_string(),
            },
        ];

        let dir = engine.resolve("R").unwrap().directory().clone();
        for holder in holders {
            let profile = holder.profile();
            let mut request = IssueRequest::new(holder, secret("user-pass"), secret("root-pass"));
            request.org_unit = Some("Clientes".to_string());
            request.validity_days = Some(365);
            let issued = engine.issue("R", &request).unwrap();
            assert_eq!(issued.profile, profile);

            let cert = X509::from_pem(&fs::read(dir.join(&issued.certificate)).unwrap()).unwrap();
            let ou = cert
                .subject_name()
                .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
                .next()
                .unwrap()
                .data()
                .as_utf8()
                .unwrap()
                .to_string();
            assert_eq!(ou, "Clientes");
            assert!(dir.join(&issued.request).is_file());
            assert!(dir.join(&issued.key).is_file());

            if profile == CertificateProfile::ECnpj {
                assert!(cert
                    .subject_name()
                    .entries_by_nid(Nid::LOCALITYNAME)
                    .next()
                    .is_some());
            }
        }
    }

    #[test]
    fn invalid_holder_data_fails_before_any_file_is_written() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let dir = crate::ca_directory::CaDirectory::new(engine.registry().base_dir(), "R").unwrap();
        dir.create_layout().unwrap();
        crate::ca_config::CaConfigBuilder::new(
            dir.clone(),
            crate::certificate_authority::CaInfo {
                common_name: "RootR".to_string(),
                ..Default::default()
            },
        )
        .write()
        .unwrap();

        let holder = Holder::ECpf {
            person: NaturalPerson {
                name: "Maria".to_string(),
                cpf: "123".to_string(),
                pis_pasep: "not digits".to_string(),
                ..Default::default()
            },
            upn: None,
        };
        let err = engine
            .issue("R", &IssueRequest::new(holder, secret("user-pass"), secret("root-pass")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert_eq!(fs::read_dir(dir.join("newcerts")).unwrap().count(), 0);
    }

    #[test]
    fn short_pkcs12_password_is_rejected_before_signing() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let dir = engine.resolve("R").unwrap().directory().clone();

        let mut request = IssueRequest::new(maria(), secret("user-pass"), secret("root-pass"));
        request.pkcs12_password = Some(secret("abc"));
        let err = engine.issue("R", &request).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        assert_eq!(fs::read_to_string(dir.index()).unwrap(), "");
        let issued_files = fs::read_dir(dir.join("certs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("usrcert_"))
            .count();
        assert_eq!(issued_files, 0);
    }
}
