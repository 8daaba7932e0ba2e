//! Root CA creation.
//!
//! # PKI Hierarchy Position
//! ```text
//! Root CA (self-signed) ← This module
//!   └── Intermediate CA (signed by Root)
//!       └── End-entity certificate (e-CPF, e-CNPJ, ...)
//! ```
//!
//! # Sequence
//! 1. Create the directory layout (`certs/`, `crl/`, `newcerts/`, `private/`,
//!    `index.txt`, `serial`, `serial_crl`)
//! 2. Write `ca_ossl.cnf` and `user_ossl.cnf`
//! 3. Generate the key and the self-signed certificate (`v3_ca`,
//!    `CA:true`, `keyCertSign`, `cRLSign`)
//! 4. Generate the initial CRL
//! 5. Export the chain as PKCS#7
//!
//! Any failure in steps 1-5 removes the CA directory before the error is
//! returned. The directory is the unit of atomicity.
//!
//! # Example
//! ```rust,no_run
//! # use icp_admin::{AppConfig, CaEngine, CaParams};
//! # use secrecy::SecretString;
//! # fn example() -> icp_admin::Result<()> {
//! let engine = CaEngine::new(&AppConfig::default())?;
//! let root = engine.create_root_ca(
//!     &CaParams::new("AC-Raiz".to_string(), SecretString::from("s3cret".to_string()))
//!         .common_name("AC Raiz de Teste".to_string())
//!         .organization("ICP-Brasil".to_string())
//!         .organizational_unit("Instituto Nacional de Tecnologia da Informacao".to_string())
//!         .country("BR".to_string())
//!         .validity_days(7300), // 20 years
//! )?;
//! # Ok(())
//! # }
//! ```

use tracing::{info, warn};

use crate::ca_config::CaConfigBuilder;
use crate::ca_directory::CaDirectory;
use crate::certificate_authority::{CaInfo, CertificateAuthority};
use crate::engine::{CaEngine, CaParams};
use crate::error::{IcpError, Result};
use crate::toolchain::KeyRequest;

impl CaEngine {
    /// Create a self-signed Root CA.
    ///
    /// # Errors
    /// - `Validation` if the parameters are incomplete or the CA exists
    /// - `Toolchain`/`Timeout` if key generation, signing or CRL generation fails
    /// - `Filesystem` if the layout cannot be created
    pub fn create_root_ca(&self, params: &CaParams) -> Result<CertificateAuthority> {
        let _entered = self.span.enter();
        params.validate()?;
        let dir = self.new_directory(params.name())?;
        let info = self.ca_info(params, String::new(), String::new());
        let days = params
            .validity_days
            .unwrap_or(self.defaults.root_validity_days);

        info!(ca = %dir.name(), cn = %info.common_name, days, "creating Root CA");
        let created = self.build_root(&dir, info, params, days);
        self.finish_creation(dir, created)
    }

    fn build_root(
        &self,
        dir: &CaDirectory,
        info: CaInfo,
        params: &CaParams,
        days: u32,
    ) -> Result<CertificateAuthority> {
        dir.create_layout()?;
        let subject = info.subject_dn();
        self.config_builder(dir, info, String::new()).write()?;

        self.toolchain.self_signed(
            &KeyRequest {
                config: &dir.ca_config(),
                key: &dir.private_key(),
                output: &dir.certificate(),
                subject: &subject,
                password: &params.password,
            },
            days,
        )?;
        self.generate_crl(dir, &params.password)?;

        let ca = CertificateAuthority::from_directory(dir.clone());
        self.write_chain(&ca)?;
        dir.verify_layout()?;
        Ok(ca)
    }

    /// Descriptor for a CA that must not exist yet.
    pub(crate) fn new_directory(&self, name: &str) -> Result<CaDirectory> {
        let dir = self.registry.directory(name)?;
        if dir.exists() {
            return Err(IcpError::Validation(format!("CA {} already exists", name)));
        }
        if let Ok(existing) = self.registry.resolve(name) {
            return Err(IcpError::Validation(format!(
                "CA {} already exists as {}",
                name,
                existing.name()
            )));
        }
        Ok(dir)
    }

    pub(crate) fn ca_info(&self, params: &CaParams, root: String, root_dir: String) -> CaInfo {
        CaInfo {
            common_name: params.common_name.trim().to_string(),
            country: params
                .country
                .clone()
                .unwrap_or_else(|| self.defaults.country.clone()),
            organization: params.organization.clone(),
            org_unit: params.org_unit.clone(),
            root,
            root_dir,
            crl_uri: params
                .crl_uri
                .clone()
                .unwrap_or_else(|| self.defaults.crl_uri_for(params.name())),
            cps_uri: params
                .cps_uri
                .clone()
                .unwrap_or_else(|| self.defaults.cps_uri.clone()),
            policies: params
                .policies
                .clone()
                .unwrap_or_else(|| self.defaults.policy_oids.clone()),
        }
    }

    pub(crate) fn config_builder(
        &self,
        dir: &CaDirectory,
        info: CaInfo,
        issuer_crl_uri: String,
    ) -> CaConfigBuilder {
        CaConfigBuilder::new(dir.clone(), info)
            .issuer_crl_uri(issuer_crl_uri)
            .digest(self.toolchain.digest_name().to_string())
            .key_bits(self.toolchain.bits())
            .default_days(self.defaults.certificate_validity_days)
            .crl_days(self.defaults.crl_validity_days)
    }

    /// Roll the directory back if creation failed, otherwise log success.
    pub(crate) fn finish_creation(
        &self,
        dir: CaDirectory,
        created: Result<CertificateAuthority>,
    ) -> Result<CertificateAuthority> {
        match created {
            Ok(ca) => {
                info!(ca = %ca.name(), path = %dir.path().display(), "CA created");
                Ok(ca)
            }
            Err(e) => {
                warn!(ca = %dir.name(), error = %e, "CA creation failed, removing directory");
                dir.rollback();
                Err(e)
            }
        }
    }
}
