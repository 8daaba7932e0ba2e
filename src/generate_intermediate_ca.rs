//! Intermediate CA creation.
//!
//! The new CA's key and request are generated with its own `ca_ossl.cnf`;
//! the request is then signed by the parent CA (parent config, parent key,
//! parent password) using the child's `v3_ca` section as extension file.
//! The child's `icpAdmin` section records the parent name and base
//! directory, which is all the hierarchy there is.
//!
//! Any failure after the directory is created removes it again, so an
//! invalid parent password leaves nothing behind.

use std::path::Path;

use secrecy::SecretString;
use tracing::info;

use crate::ca_config::SECTION_V3_CA;
use crate::ca_directory::CaDirectory;
use crate::certificate_authority::{CaInfo, CertificateAuthority};
use crate::engine::{CaEngine, CaParams};
use crate::error::{IcpError, Result};
use crate::toolchain::{KeyRequest, SignRequest};

impl CaEngine {
    /// Create an Intermediate CA signed by `parent`.
    ///
    /// # Arguments
    /// * `params` - Subject, validity and password of the new CA
    /// * `parent` - Name of the signing CA (case-insensitive)
    /// * `parent_password` - Password of the signing CA's key
    ///
    /// # Errors
    /// - `NotFound` if the parent does not exist
    /// - `Validation` for incomplete parameters or an existing name
    /// - `Toolchain`/`Timeout` if any toolchain step fails (the new directory
    ///   is removed first)
    pub fn create_ca(
        &self,
        params: &CaParams,
        parent: &str,
        parent_password: &SecretString,
    ) -> Result<CertificateAuthority> {
        let _entered = self.span.enter();
        params.validate()?;
        let parent = self.registry.resolve(parent)?;
        let parent_info = parent.info()?.clone();
        if !parent.directory().certificate().is_file() {
            return Err(IcpError::NotFound(format!(
                "certificate of parent CA {}",
                parent.name()
            )));
        }

        let dir = self.new_directory(params.name())?;
        let info = self.ca_info(
            params,
            parent.name().to_string(),
            parent.base_dir().to_string_lossy().into_owned(),
        );
        let days = params.validity_days.unwrap_or(self.defaults.ca_validity_days);

        info!(
            ca = %dir.name(),
            parent = %parent.name(),
            cn = %info.common_name,
            days,
            "creating Intermediate CA"
        );
        let created = self.build_intermediate(
            &dir,
            info,
            params,
            &parent_info,
            parent.directory().ca_config().as_path(),
            parent_password,
            days,
        );
        self.finish_creation(dir, created)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_intermediate(
        &self,
        dir: &CaDirectory,
        info: CaInfo,
        params: &CaParams,
        parent_info: &CaInfo,
        parent_config: &Path,
        parent_password: &SecretString,
        days: u32,
    ) -> Result<CertificateAuthority> {
        dir.create_layout()?;
        let subject = info.subject_dn();
        self.config_builder(dir, info, parent_info.crl_uri.clone())
            .write()?;

        self.toolchain.request(&KeyRequest {
            config: &dir.ca_config(),
            key: &dir.private_key(),
            output: &dir.request(),
            subject: &subject,
            password: &params.password,
        })?;
        self.toolchain.sign(&SignRequest {
            issuer_config: parent_config,
            request: &dir.request(),
            certificate: &dir.certificate(),
            days,
            extfile: &dir.ca_config(),
            extensions: SECTION_V3_CA,
            password: parent_password,
        })?;
        self.generate_crl(dir, &params.password)?;

        let ca = CertificateAuthority::from_directory(dir.clone());
        self.write_chain(&ca)?;
        dir.verify_layout()?;
        Ok(ca)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::{engine, openssl_available, root_params, secret};
    use crate::engine::CaParams;
    use crate::error::ErrorKind;
    use openssl::x509::X509;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn intermediate_chain_and_constraints() {
        if !openssl_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.create_root_ca(&root_params("R")).unwrap();
        let inter = engine
            .create_ca(
                &CaParams::new("I".to_string(), secret("inter-pass"))
                    .common_name("Inter".to_string())
                    .crl_uri("http://pki.test.br/I.crl".to_string()),
                "R",
                &secret("root-pass"),
            )
            .unwrap();

        let chain = engine.registry().chain(&inter).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(inter.directory().chain().is_file());
        assert_eq!(inter.info().unwrap().crl_uri, "http://pki.test.br/I.crl");

        let cert = X509::from_pem(&fs::read(inter.directory().certificate()).unwrap()).unwrap();
        let der = cert.to_der().unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
        let bc = parsed.basic_constraints().unwrap().unwrap().value;
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(0));
    }

    #[test]
    fn unknown_parent_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let err = engine
            .create_ca(
                &CaParams::new("I".to_string(), secret("inter-pass"))
                    .common_name("Inter".to_string()),
                "nobody",
                &secret("root-pass"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!engine.registry().base_dir().join("I").exists());
    }
}
