//! Toolchain configuration files.
//!
//! [`ConfigDocument`] is a small ordered model of the INI dialect the
//! toolchain reads (`[ section ]`, `key = value`, `#` comments). The
//! [`CaConfigBuilder`] renders the two files every CA directory carries:
//!
//! - `ca_ossl.cnf`: `icpAdmin` metadata, the `ca`/`CA_default` signing
//!   settings, request defaults and the `v3_ca` extensions used for the CA's
//!   own certificate.
//! - `user_ossl.cnf`: request defaults and the `v3_req` extensions applied to
//!   end-entity certificates. A copy with a `subject_alt_section` is written
//!   for every issuance by [`with_subject_alt_names`].

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::ca_directory::{self, CaDirectory};
use crate::certificate_authority::CaInfo;
use crate::error::{IcpError, Result};
use crate::profile::{EncodedProfile, OtherNameValue};

pub const SECTION_ICP_ADMIN: &str = "icpAdmin";
pub const SECTION_V3_CA: &str = "v3_ca";
pub const SECTION_V3_REQ: &str = "v3_req";
pub const SECTION_SUBJECT_ALT: &str = "subject_alt_section";
const POLICY_SECTION_PREFIX: &str = "polsection";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl ConfigSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace `key`, keeping the original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Like [`set`](Self::set) but escapes `$` and `\` so the toolchain
    /// reads the value back literally.
    pub fn set_literal(&mut self, key: impl Into<String>, value: &str) -> &mut Self {
        self.set(key, escape(value))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered INI document. Entries before the first header live in a
/// section with an empty name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    sections: Vec<ConfigSection>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut ConfigSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    /// Existing section `name`, or a new one appended at the end.
    pub fn upsert_section(&mut self, name: &str) -> &mut ConfigSection {
        let pos = match self.sections.iter().position(|s| s.name == name) {
            Some(pos) => pos,
            None => {
                self.sections.push(ConfigSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[pos]
    }

    pub fn remove_section(&mut self, name: &str) -> Option<ConfigSection> {
        let pos = self.sections.iter().position(|s| s.name == name)?;
        Some(self.sections.remove(pos))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.upsert_section(section).set(key, value);
    }

    pub fn sections(&self) -> impl Iterator<Item = &ConfigSection> {
        self.sections.iter()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = ConfigDocument::new();
        let mut current = String::new();

        for (index, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| {
                        IcpError::Configuration(format!(
                            "line {}: unterminated section header",
                            index + 1
                        ))
                    })?
                    .trim();
                current = name.to_string();
                doc.upsert_section(&current);
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                IcpError::Configuration(format!("line {}: expected key = value", index + 1))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(IcpError::Configuration(format!(
                    "line {}: empty key",
                    index + 1
                )));
            }
            doc.upsert_section(&current)
                .set(key, unquote(value.trim()));
        }
        Ok(doc)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            IcpError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&text).map_err(|e| match e {
            IcpError::Configuration(msg) => {
                IcpError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !section.name.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                let _ = writeln!(out, "[ {} ]", section.name);
            }
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{} = {}", key, quote(value));
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| IcpError::fs(path, e))
    }
}

fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '$' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unquote(value: &str) -> String {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn quote(value: &str) -> String {
    let needs_quotes = value.contains('#')
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Renders `ca_ossl.cnf` and `user_ossl.cnf` for one CA.
///
/// `issuer_crl_uri` is the CRL distribution point placed in the CA's own
/// certificate (its parent's CRL); the CA's `crl_uri` goes into the
/// certificates it issues.
#[derive(Debug, Clone)]
pub struct CaConfigBuilder {
    dir: CaDirectory,
    info: CaInfo,
    issuer_crl_uri: String,
    digest: String,
    key_bits: u32,
    default_days: u32,
    crl_days: u32,
}

impl CaConfigBuilder {
    pub fn new(dir: CaDirectory, info: CaInfo) -> Self {
        Self {
            dir,
            info,
            issuer_crl_uri: String::new(),
            digest: "sha256".to_string(),
            key_bits: 2048,
            default_days: 2190,
            crl_days: 7,
        }
    }

    pub fn issuer_crl_uri(mut self, uri: String) -> Self {
        self.issuer_crl_uri = uri;
        self
    }

    pub fn digest(mut self, digest: String) -> Self {
        self.digest = digest;
        self
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn default_days(mut self, days: u32) -> Self {
        self.default_days = days;
        self
    }

    pub fn crl_days(mut self, days: u32) -> Self {
        self.crl_days = days;
        self
    }

    pub fn build_ca_config(&self) -> ConfigDocument {
        let mut doc = ConfigDocument::new();
        let info = &self.info;

        let meta = doc.upsert_section(SECTION_ICP_ADMIN);
        meta.set_literal("commonName", &info.common_name)
            .set_literal("country", &info.country)
            .set_literal("organization", &info.organization)
            .set_literal("orgUnit", &info.org_unit)
            .set_literal("root", &info.root)
            .set_literal("rootDir", &info.root_dir)
            .set_literal("crlUri", &info.crl_uri)
            .set_literal("cpsUri", &info.cps_uri)
            .set_literal("policies", &info.policies.join(","));

        doc.set("ca", "default_ca", "CA_default");

        let ca = doc.upsert_section("CA_default");
        ca.set_literal("dir", &self.dir.path().to_string_lossy())
            .set("certs", "$dir/certs")
            .set("crl_dir", "$dir/crl")
            .set("database", format!("$dir/{}", ca_directory::INDEX_FILE))
            .set("new_certs_dir", "$dir/newcerts")
            .set("certificate", format!("$dir/{}", ca_directory::CA_CERT_FILE))
            .set("serial", format!("$dir/{}", ca_directory::SERIAL_FILE))
            .set("crlnumber", format!("$dir/{}", ca_directory::CRL_SERIAL_FILE))
            .set("crl", format!("$dir/{}", ca_directory::CRL_FILE))
            .set("private_key", format!("$dir/{}", ca_directory::CA_KEY_FILE))
            .set("default_days", self.default_days.to_string())
            .set("default_crl_days", self.crl_days.to_string())
            .set("default_md", self.digest.clone())
            .set("preserve", "yes")
            .set("email_in_dn", "no")
            .set("unique_subject", "no")
            .set("copy_extensions", "none")
            .set("policy", "policy_anything");

        let policy = doc.upsert_section("policy_anything");
        policy
            .set("countryName", "optional")
            .set("stateOrProvinceName", "optional")
            .set("localityName", "optional")
            .set("organizationName", "optional")
            .set("organizationalUnitName", "optional")
            .set("commonName", "supplied")
            .set("emailAddress", "optional");

        self.request_sections(&mut doc);

        let v3 = doc.upsert_section(SECTION_V3_CA);
        v3.set("subjectKeyIdentifier", "hash")
            .set("authorityKeyIdentifier", "keyid:always,issuer");
        if info.is_root() {
            v3.set("basicConstraints", "critical,CA:true");
        } else {
            v3.set("basicConstraints", "critical,CA:true,pathlen:0");
        }
        v3.set("keyUsage", "critical,keyCertSign,cRLSign");
        if !self.issuer_crl_uri.is_empty() {
            v3.set("crlDistributionPoints", format!("URI:{}", self.issuer_crl_uri));
        }
        self.policy_sections(&mut doc, SECTION_V3_CA);
        doc
    }

    pub fn build_user_config(&self) -> ConfigDocument {
        let mut doc = ConfigDocument::new();
        self.request_sections(&mut doc);

        let v3 = doc.upsert_section(SECTION_V3_REQ);
        v3.set("basicConstraints", "critical,CA:false")
            .set(
                "keyUsage",
                "critical,digitalSignature,nonRepudiation,keyEncipherment",
            )
            .set("subjectKeyIdentifier", "hash")
            .set("authorityKeyIdentifier", "keyid,issuer");
        if !self.info.crl_uri.is_empty() {
            v3.set("crlDistributionPoints", format!("URI:{}", self.info.crl_uri));
        }
        self.policy_sections(&mut doc, SECTION_V3_REQ);
        doc
    }

    /// Write both files into the CA directory.
    pub fn write(&self) -> Result<()> {
        self.build_ca_config().write(&self.dir.ca_config())?;
        self.build_user_config().write(&self.dir.user_config())
    }

    fn request_sections(&self, doc: &mut ConfigDocument) {
        let req = doc.upsert_section("req");
        req.set("default_bits", self.key_bits.to_string())
            .set("default_md", self.digest.clone())
            .set("string_mask", "utf8only")
            .set("utf8", "yes")
            .set("prompt", "no")
            .set("distinguished_name", "req_distinguished_name")
            .set("attributes", "req_attributes");

        let dn = doc.upsert_section("req_distinguished_name");
        dn.set_literal("commonName", &self.info.common_name);
        if !self.info.country.is_empty() {
            dn.set_literal("countryName", &self.info.country);
        }
        if !self.info.organization.is_empty() {
            dn.set_literal("organizationName", &self.info.organization);
        }
        doc.upsert_section("req_attributes");
    }

    fn policy_sections(&self, doc: &mut ConfigDocument, extensions: &str) {
        if self.info.policies.is_empty() {
            return;
        }
        let names: Vec<String> = (0..self.info.policies.len())
            .map(policy_section_name)
            .collect();
        let refs: Vec<String> = names.iter().map(|n| format!("@{}", n)).collect();
        doc.set(extensions, "certificatePolicies", refs.join(","));

        for (name, oid) in names.iter().zip(&self.info.policies) {
            let section = doc.upsert_section(name);
            section.set("policyIdentifier", oid.clone());
            if !self.info.cps_uri.is_empty() {
                section.set_literal("CPS.1", &self.info.cps_uri);
            }
        }
    }
}

/// `polsection`, `polsection1`, `polsection2`, ...
fn policy_section_name(index: usize) -> String {
    if index == 0 {
        POLICY_SECTION_PREFIX.to_string()
    } else {
        format!("{}{}", POLICY_SECTION_PREFIX, index)
    }
}

/// Add the Subject Alternative Name and Extended Key Usage of `encoded` to a
/// `user_ossl.cnf` document.
///
/// ICP-Brasil values are written as hex octets so the padding spaces survive
/// the toolchain's whitespace trimming.
pub fn with_subject_alt_names(doc: &mut ConfigDocument, encoded: &EncodedProfile) {
    let v3 = doc.upsert_section(SECTION_V3_REQ);
    v3.set("subjectAltName", format!("@{}", SECTION_SUBJECT_ALT))
        .set("extendedKeyUsage", encoded.extended_key_usage.join(","));

    doc.remove_section(SECTION_SUBJECT_ALT);
    let san = doc.upsert_section(SECTION_SUBJECT_ALT);
    if let Some(email) = &encoded.email {
        san.set_literal("email.0", email);
    }
    for (index, entry) in encoded.other_names.iter().enumerate() {
        let value = match &entry.value {
            OtherNameValue::Octets(text) => {
                format!("{};FORMAT:HEX,OCT:{}", entry.oid, hex::encode(text.as_bytes()))
            }
            OtherNameValue::Utf8(text) => format!("{};UTF8:{}", entry.oid, escape(text)),
            OtherNameValue::Hex(hex) => format!("{};FORMAT:HEX,OCT:{}", entry.oid, hex),
        };
        san.set(format!("otherName.{}", index), value);
    }
}
