//! ICP-Brasil private certificate authority.
//!
//! Manages a two-tier CA hierarchy on the filesystem, issues the six
//! ICP-Brasil end-entity profiles, maintains CRLs and validates presented
//! certificates for relying parties. All signing happens in the external
//! `openssl` command-line program; this crate writes its configuration,
//! runs it under a timeout and keeps the on-disk state consistent.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed)
//!   └── Intermediate CA (signed by Root, pathlen=0)
//!       └── e-CPF / e-CNPJ / RIC / e-Código / e-Servidor / e-Aplicação
//! ```
//!
//! Every CA is one directory under the configured base directory. The
//! directory alone is enough to rebuild the hierarchy: its `ca_ossl.cnf`
//! records the CA's Subject and the name of its parent.
//!
//! ```text
//! <base>/<name>/
//!   ca_ossl.cnf  user_ossl.cnf  index.txt  serial  serial_crl
//!   certs/cacert.pem.cer  certs/cachain.p7b  crl/lcr.pem.crl
//!   private/cakey.pem     newcerts/careq.pem
//! ```
//!
//! # Module Overview
//!
//! - [`process_runner`] / [`toolchain`]: `openssl` invocations with a hard
//!   timeout and redacted passwords
//! - [`ca_directory`] / [`ca_config`]: on-disk layout and config files
//! - [`certificate_authority`] / [`registry`]: CA descriptors discovered
//!   by scanning the base directory
//! - [`profile`]: Subject, SAN and EKU for each ICP-Brasil profile
//! - [`engine`]: CA lifecycle, issuance, revocation, renewal and exports
//! - [`catalog`]: records of issued certificates
//! - [`trust`] / [`crl_fetch`]: chain and CRL validation
//!
//! # Example
//!
//! ```no_run
//! use icp_admin::{AppConfig, CaEngine, CaParams, Holder, IssueRequest, NaturalPerson};
//! use secrecy::SecretString;
//!
//! fn setup() -> icp_admin::Result<()> {
//!     let engine = CaEngine::new(&AppConfig::load()?)?;
//!
//!     engine.create_root_ca(
//!         &CaParams::new("R".to_string(), SecretString::from("root-pass".to_string()))
//!             .common_name("RootR".to_string())
//!             .organization("Test".to_string())
//!             .organizational_unit("PKI".to_string()),
//!     )?;
//!
//!     let holder = Holder::ECpf {
//!         person: NaturalPerson {
//!             name: "Maria Silva".to_string(),
//!             cpf: "12345678901".to_string(),
//!             ..Default::default()
//!         },
//!         upn: None,
//!     };
//!     let issued = engine.issue(
//!         "R",
//!         &IssueRequest::new(
//!             holder,
//!             SecretString::from("user-pass".to_string()),
//!             SecretString::from("root-pass".to_string()),
//!         ),
//!     )?;
//!     println!("issued {} ({})", issued.common_name, issued.serial);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Library calls return [`Result`] with an [`IcpError`]. Match on
//! [`IcpError::kind`] for the category; toolchain failures carry the
//! program's stderr verbatim:
//!
//! ```no_run
//! use icp_admin::{AppConfig, CaEngine, ErrorKind};
//! use secrecy::SecretString;
//!
//! # fn example() -> icp_admin::Result<()> {
//! let engine = CaEngine::new(&AppConfig::default())?;
//! match engine.create_crl("R", &SecretString::from("wrong".to_string())) {
//!     Err(e) if e.kind() == ErrorKind::Toolchain => {
//!         eprintln!("{}", e.stderr().unwrap_or_default());
//!     }
//!     other => {
//!         other?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod ca_config;
pub mod ca_directory;
pub mod catalog;
pub mod certificate_authority;
pub mod configs;
pub mod crl_fetch;
pub mod engine;
pub mod error;
pub mod generate_intermediate_ca;
pub mod generate_root_ca;
pub mod generate_user_keypair;
pub mod key_archive;
pub mod process_runner;
pub mod profile;
pub mod registry;
pub mod toolchain;
pub mod trust;

pub use catalog::{
    CertificateCatalog, CertificateStatus, IssuedCertificateRecord, JsonFileCatalog,
    MemoryCatalog,
};
pub use certificate_authority::{CaInfo, CertificateAuthority};
pub use configs::AppConfig;
pub use engine::{CaEngine, CaParams, IssueRequest, IssuedCertificate, Renewal};
pub use error::{ErrorKind, IcpError, Result};
pub use profile::{
    CertificateProfile, Holder, HolderData, LegalEntity, NaturalPerson, VoterRegistration,
};
pub use registry::CaRegistry;
pub use trust::{TrustValidator, ValidationStatus};
