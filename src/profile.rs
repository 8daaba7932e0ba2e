//! ICP-Brasil certificate profiles.
//!
//! Each profile fixes the Subject layout, the set of `otherName` entries in
//! the Subject Alternative Name and the Extended Key Usage. The `otherName`
//! values are concatenations of fixed-width subfields (DOC-ICP-04):
//!
//! ```text
//! 2.16.76.1.3.1 / .3.4   birth date(8) CPF(11) PIS/PASEP(11) RG(15) RG issuer(4) RG UF(2)
//! 2.16.76.1.3.5          voter title(12) zone(3) section(4) municipality(20) UF(2)
//! 2.16.76.1.3.6 / .3.7   CEI(12)
//! 2.16.76.1.3.3          CNPJ(14)
//! 2.16.76.1.3.9          RIC(11)
//! ```
//!
//! Numeric subfields are left padded with zeros, UF and municipality are
//! right padded with spaces. An all-zero or all-space value means the
//! attribute is absent. When the RG number is empty its issuer and UF are
//! emitted as empty strings; the same holds for the voter title and its
//! zone, section, municipality and UF.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{IcpError, Result};

pub const OID_PERSON_DATA: &str = "2.16.76.1.3.1";
pub const OID_RESPONSIBLE_NAME: &str = "2.16.76.1.3.2";
pub const OID_CNPJ: &str = "2.16.76.1.3.3";
pub const OID_RESPONSIBLE_DATA: &str = "2.16.76.1.3.4";
pub const OID_VOTER_TITLE: &str = "2.16.76.1.3.5";
pub const OID_PERSON_CEI: &str = "2.16.76.1.3.6";
pub const OID_ENTITY_CEI: &str = "2.16.76.1.3.7";
pub const OID_COMPANY_NAME: &str = "2.16.76.1.3.8";
pub const OID_RIC: &str = "2.16.76.1.3.9";
pub const OID_MS_UPN: &str = "1.3.6.1.4.1.311.20.2.3";
pub const OID_MS_SERVER_GUID: &str = "1.3.6.1.4.1.311.25.1";

const BIRTH_DATE_WIDTH: usize = 8;
const CPF_WIDTH: usize = 11;
const PIS_WIDTH: usize = 11;
const RG_WIDTH: usize = 15;
const RG_ISSUER_WIDTH: usize = 4;
const UF_WIDTH: usize = 2;
const VOTER_TITLE_WIDTH: usize = 12;
const ZONE_WIDTH: usize = 3;
const SECTION_WIDTH: usize = 4;
const MUNICIPALITY_WIDTH: usize = 20;
const CEI_WIDTH: usize = 12;
const RIC_WIDTH: usize = 11;
const CNPJ_WIDTH: usize = 14;
const GUID_HEX_WIDTH: usize = 32;

/// The six ICP-Brasil end-entity certificate types, in ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CertificateProfile {
    #[serde(rename = "e-CPF")]
    ECpf,
    #[serde(rename = "e-CNPJ")]
    ECnpj,
    #[serde(rename = "RIC")]
    Ric,
    #[serde(rename = "e-Código")]
    ECodigo,
    #[serde(rename = "e-Servidor")]
    EServidor,
    #[serde(rename = "e-Aplicação")]
    EAplicacao,
}

impl CertificateProfile {
    pub const ALL: [CertificateProfile; 6] = [
        CertificateProfile::ECpf,
        CertificateProfile::ECnpj,
        CertificateProfile::Ric,
        CertificateProfile::ECodigo,
        CertificateProfile::EServidor,
        CertificateProfile::EAplicacao,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            CertificateProfile::ECpf => 0,
            CertificateProfile::ECnpj => 1,
            CertificateProfile::Ric => 2,
            CertificateProfile::ECodigo => 3,
            CertificateProfile::EServidor => 4,
            CertificateProfile::EAplicacao => 5,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            CertificateProfile::ECpf => "e-CPF",
            CertificateProfile::ECnpj => "e-CNPJ",
            CertificateProfile::Ric => "RIC",
            CertificateProfile::ECodigo => "e-Código",
            CertificateProfile::EServidor => "e-Servidor",
            CertificateProfile::EAplicacao => "e-Aplicação",
        }
    }

    /// Extended Key Usage short names as understood by the toolchain.
    pub fn extended_key_usage(self) -> &'static [&'static str] {
        match self {
            CertificateProfile::ECpf => &["clientAuth", "emailProtection", "msSmartcardLogin"],
            CertificateProfile::ECnpj | CertificateProfile::Ric => {
                &["clientAuth", "emailProtection"]
            }
            CertificateProfile::ECodigo => &["codeSigning"],
            CertificateProfile::EServidor => &["serverAuth", "clientAuth"],
            CertificateProfile::EAplicacao => &["clientAuth"],
        }
    }
}

impl fmt::Display for CertificateProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CertificateProfile {
    type Err = IcpError;

    /// Accepts the ICP-Brasil names case-insensitively, with or without the
    /// accents and the `e-` hyphen (`e-Código`, `ecodigo`, `e-codigo`).
    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| match c {
                'ó' => 'o',
                'ç' => 'c',
                'ã' => 'a',
                other => other,
            })
            .collect();
        match folded.as_str() {
            "ecpf" => Ok(CertificateProfile::ECpf),
            "ecnpj" => Ok(CertificateProfile::ECnpj),
            "ric" => Ok(CertificateProfile::Ric),
            "ecodigo" => Ok(CertificateProfile::ECodigo),
            "eservidor" => Ok(CertificateProfile::EServidor),
            "eaplicacao" => Ok(CertificateProfile::EAplicacao),
            _ => Err(IcpError::Validation(format!(
                "unknown certificate profile: {}",
                s
            ))),
        }
    }
}

/// Electoral registration of a natural person.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VoterRegistration {
    pub title: String,
    pub zone: String,
    pub section: String,
    pub municipality: String,
    pub uf: String,
}

/// A natural person: the holder of e-CPF/RIC, or the person responsible
/// for a legal entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NaturalPerson {
    pub name: String,
    pub email: String,
    pub birth_date: Option<NaiveDate>,
    pub cpf: String,
    pub pis_pasep: String,
    pub rg: String,
    pub rg_issuer: String,
    pub rg_uf: String,
    pub cei: String,
    pub voter: VoterRegistration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LegalEntity {
    pub company_name: String,
    pub email: String,
    pub cnpj: String,
    pub cei: String,
    pub locality: String,
    pub state: String,
    pub responsible: NaturalPerson,
}

/// Per-profile holder data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    ECpf {
        person: NaturalPerson,
        upn: Option<String>,
    },
    ECnpj(LegalEntity),
    Ric {
        person: NaturalPerson,
        ric: String,
    },
    ECodigo(LegalEntity),
    EServidor {
        entity: LegalEntity,
        server_name: String,
        guid: Option<String>,
    },
    EAplicacao {
        entity: LegalEntity,
        application: String,
    },
}

impl Holder {
    pub fn profile(&self) -> CertificateProfile {
        match self {
            Holder::ECpf { .. } => CertificateProfile::ECpf,
            Holder::ECnpj(_) => CertificateProfile::ECnpj,
            Holder::Ric { .. } => CertificateProfile::Ric,
            Holder::ECodigo(_) => CertificateProfile::ECodigo,
            Holder::EServidor { .. } => CertificateProfile::EServidor,
            Holder::EAplicacao { .. } => CertificateProfile::EAplicacao,
        }
    }
}

/// Holder description as read from a JSON file.
///
/// Carries the fields of every profile; [`HolderData::into_holder`] keeps
/// the ones the chosen profile uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HolderData {
    pub person: NaturalPerson,
    pub entity: LegalEntity,
    pub upn: Option<String>,
    pub ric: String,
    pub server_name: String,
    pub guid: Option<String>,
    pub application: String,
}

impl HolderData {
    pub fn into_holder(self, profile: CertificateProfile) -> Holder {
        match profile {
            CertificateProfile::ECpf => Holder::ECpf {
                person: self.person,
                upn: self.upn.filter(|u| !u.trim().is_empty()),
            },
            CertificateProfile::ECnpj => Holder::ECnpj(self.entity),
            CertificateProfile::Ric => Holder::Ric {
                person: self.person,
                ric: self.ric,
            },
            CertificateProfile::ECodigo => Holder::ECodigo(self.entity),
            CertificateProfile::EServidor => Holder::EServidor {
                entity: self.entity,
                server_name: self.server_name,
                guid: self.guid.filter(|g| !g.trim().is_empty()),
            },
            CertificateProfile::EAplicacao => Holder::EAplicacao {
                entity: self.entity,
                application: self.application,
            },
        }
    }
}

/// Subject fields inherited from the issuing CA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectBase {
    pub country: String,
    pub organization: String,
    pub org_unit: String,
}

/// Value of one `otherName` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtherNameValue {
    /// ICP-Brasil fixed-width text, carried as an OCTET STRING.
    Octets(String),
    /// UTF8String (Microsoft UPN).
    Utf8(String),
    /// Raw bytes given as hex (server GUID).
    Hex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherName {
    pub oid: &'static str,
    pub value: OtherNameValue,
}

/// Everything the config builder needs to issue one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedProfile {
    pub profile: CertificateProfile,
    pub common_name: String,
    /// Subject RDNs in order, as (short name, value).
    pub subject: Vec<(&'static str, String)>,
    pub email: Option<String>,
    pub other_names: Vec<OtherName>,
    pub extended_key_usage: &'static [&'static str],
}

impl EncodedProfile {
    /// Subject in the toolchain's `-subj` syntax, e.g. `/C=BR/O=Org/CN=Name`.
    pub fn subject_dn(&self) -> String {
        let mut dn = String::new();
        for (key, value) in &self.subject {
            dn.push('/');
            dn.push_str(key);
            dn.push('=');
            for c in value.chars() {
                if c == '/' || c == '\\' {
                    dn.push('\\');
                }
                dn.push(c);
            }
        }
        dn
    }

    pub fn other_name(&self, oid: &str) -> Option<&OtherNameValue> {
        self.other_names
            .iter()
            .find(|entry| entry.oid == oid)
            .map(|entry| &entry.value)
    }
}

// ================= Subfield padding =================

fn strip_separators(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '/' | ' '))
        .collect()
}

/// Left zero-padded digits. Empty input yields all zeros.
fn numeric(field: &str, value: &str, width: usize) -> Result<String> {
    let digits = strip_separators(value);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(IcpError::Validation(format!(
            "{} must contain only digits: {:?}",
            field, value
        )));
    }
    left_pad(field, &digits, width, '0')
}

fn left_pad(field: &str, value: &str, width: usize, fill: char) -> Result<String> {
    let len = value.chars().count();
    if len > width {
        return Err(IcpError::Validation(format!(
            "{} exceeds {} characters: {:?}",
            field, width, value
        )));
    }
    let mut out: String = std::iter::repeat(fill).take(width - len).collect();
    out.push_str(value);
    Ok(out)
}

/// Widths count UTF-8 bytes: the value is stored as an octet string.
fn right_pad(field: &str, value: &str, width: usize) -> Result<String> {
    let len = value.len();
    if len > width {
        return Err(IcpError::Validation(format!(
            "{} exceeds {} bytes: {:?}",
            field, width, value
        )));
    }
    let mut out = value.to_string();
    out.extend(std::iter::repeat(' ').take(width - len));
    Ok(out)
}

fn alphanumeric(field: &str, value: &str, width: usize) -> Result<String> {
    let cleaned = strip_separators(value).to_uppercase();
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(IcpError::Validation(format!(
            "{} must be alphanumeric: {:?}",
            field, value
        )));
    }
    left_pad(field, &cleaned, width, '0')
}

/// Subfields of the `2.16.76.1.3.1` / `2.16.76.1.3.4` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonFields {
    pub birth_date: String,
    pub cpf: String,
    pub pis_pasep: String,
    pub rg: String,
    pub rg_issuer: String,
    pub rg_uf: String,
}

impl PersonFields {
    pub fn encode(person: &NaturalPerson) -> Result<Self> {
        let birth_date = match person.birth_date {
            Some(date) => date.format("%d%m%Y").to_string(),
            None => "0".repeat(BIRTH_DATE_WIDTH),
        };
        let rg_present = !person.rg.trim().is_empty();
        Ok(Self {
            birth_date,
            cpf: numeric("CPF", &person.cpf, CPF_WIDTH)?,
            pis_pasep: numeric("PIS/PASEP", &person.pis_pasep, PIS_WIDTH)?,
            rg: alphanumeric("RG", &person.rg, RG_WIDTH)?,
            rg_issuer: if rg_present {
                alphanumeric("RG issuer", &person.rg_issuer, RG_ISSUER_WIDTH)?
            } else {
                String::new()
            },
            rg_uf: if rg_present {
                right_pad("RG UF", person.rg_uf.trim(), UF_WIDTH)?
            } else {
                String::new()
            },
        })
    }

    pub fn value(&self) -> String {
        [
            self.birth_date.as_str(),
            &self.cpf,
            &self.pis_pasep,
            &self.rg,
            &self.rg_issuer,
            &self.rg_uf,
        ]
        .concat()
    }
}

/// Subfields of the `2.16.76.1.3.5` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterFields {
    pub title: String,
    pub zone: String,
    pub section: String,
    pub municipality: String,
    pub uf: String,
}

impl VoterFields {
    pub fn encode(voter: &VoterRegistration) -> Result<Self> {
        let title = numeric("voter title", &voter.title, VOTER_TITLE_WIDTH)?;
        if voter.title.trim().is_empty() {
            return Ok(Self {
                title,
                zone: String::new(),
                section: String::new(),
                municipality: String::new(),
                uf: String::new(),
            });
        }
        Ok(Self {
            title,
            zone: numeric("voter zone", &voter.zone, ZONE_WIDTH)?,
            section: numeric("voter section", &voter.section, SECTION_WIDTH)?,
            municipality: right_pad(
                "voter municipality",
                voter.municipality.trim(),
                MUNICIPALITY_WIDTH,
            )?,
            uf: right_pad("voter UF", voter.uf.trim(), UF_WIDTH)?,
        })
    }

    pub fn value(&self) -> String {
        [
            self.title.as_str(),
            &self.zone,
            &self.section,
            &self.municipality,
            &self.uf,
        ]
        .concat()
    }
}

fn normalize_guid(guid: &str) -> Result<String> {
    let hex: String = guid
        .chars()
        .filter(|c| !matches!(c, '-' | '{' | '}'))
        .collect();
    if hex.len() != GUID_HEX_WIDTH || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IcpError::Validation(format!(
            "server GUID must be {} hex digits: {:?}",
            GUID_HEX_WIDTH, guid
        )));
    }
    Ok(hex.to_ascii_lowercase())
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IcpError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn octets(oid: &'static str, value: String) -> OtherName {
    OtherName {
        oid,
        value: OtherNameValue::Octets(value),
    }
}

fn push_text(names: &mut Vec<OtherName>, oid: &'static str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        names.push(octets(oid, value.to_string()));
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Groups shared by every legal-entity profile: `.3.4`, `.3.2`, `.3.3`.
fn entity_groups(entity: &LegalEntity, cnpj: &str) -> Result<Vec<OtherName>> {
    let mut names = vec![octets(
        OID_RESPONSIBLE_DATA,
        PersonFields::encode(&entity.responsible)?.value(),
    )];
    push_text(&mut names, OID_RESPONSIBLE_NAME, &entity.responsible.name);
    names.push(octets(OID_CNPJ, cnpj.to_string()));
    Ok(names)
}

/// Groups shared by e-CPF and RIC: `.3.1`, `.3.6`, `.3.5`.
fn person_groups(person: &NaturalPerson) -> Result<Vec<OtherName>> {
    Ok(vec![
        octets(OID_PERSON_DATA, PersonFields::encode(person)?.value()),
        octets(OID_PERSON_CEI, numeric("CEI", &person.cei, CEI_WIDTH)?),
        octets(OID_VOTER_TITLE, VoterFields::encode(&person.voter)?.value()),
    ])
}

/// Build the Subject, SAN entries and EKU for `holder`.
pub fn encode(holder: &Holder, base: &SubjectBase) -> Result<EncodedProfile> {
    let profile = holder.profile();
    let mut subject: Vec<(&'static str, String)> = vec![
        ("C", base.country.clone()),
        ("O", base.organization.clone()),
        ("OU", base.org_unit.clone()),
    ];
    subject.retain(|(_, value)| !value.is_empty());

    let (common_name, email, other_names) = match holder {
        Holder::ECpf { person, upn } => {
            let name = required("holder name", &person.name)?;
            required("CPF", &person.cpf)?;
            let cpf = numeric("CPF", &person.cpf, CPF_WIDTH)?;
            let mut names = person_groups(person)?;
            if let Some(upn) = upn.as_deref().and_then(non_empty) {
                names.push(OtherName {
                    oid: OID_MS_UPN,
                    value: OtherNameValue::Utf8(upn),
                });
            }
            (format!("{}:{}", name, cpf), non_empty(&person.email), names)
        }
        Holder::Ric { person, ric } => {
            let name = required("holder name", &person.name)?;
            required("RIC", ric)?;
            let ric = numeric("RIC", ric, RIC_WIDTH)?;
            let mut names = person_groups(person)?;
            names.push(octets(OID_RIC, ric.clone()));
            (format!("{}:{}", name, ric), non_empty(&person.email), names)
        }
        Holder::ECnpj(entity) | Holder::ECodigo(entity) => {
            let company = required("company name", &entity.company_name)?;
            required("CNPJ", &entity.cnpj)?;
            let cnpj = numeric("CNPJ", &entity.cnpj, CNPJ_WIDTH)?;
            let mut names = entity_groups(entity, &cnpj)?;
            names.push(octets(
                OID_ENTITY_CEI,
                numeric("CEI", &entity.cei, CEI_WIDTH)?,
            ));
            if profile == CertificateProfile::ECnpj {
                if let Some(locality) = non_empty(&entity.locality) {
                    subject.push(("L", locality));
                }
                if let Some(state) = non_empty(&entity.state) {
                    subject.push(("ST", state));
                }
            }
            (format!("{}:{}", company, cnpj), non_empty(&entity.email), names)
        }
        Holder::EServidor {
            entity,
            server_name,
            guid,
        } => {
            let server_name = required("server name", server_name)?;
            let cnpj = numeric("CNPJ", &entity.cnpj, CNPJ_WIDTH)?;
            let mut names = entity_groups(entity, &cnpj)?;
            push_text(&mut names, OID_COMPANY_NAME, &entity.company_name);
            if let Some(guid) = guid.as_deref().and_then(non_empty) {
                names.push(OtherName {
                    oid: OID_MS_SERVER_GUID,
                    value: OtherNameValue::Hex(normalize_guid(&guid)?),
                });
            }
            (server_name, non_empty(&entity.email), names)
        }
        Holder::EAplicacao {
            entity,
            application,
        } => {
            let application = required("application name", application)?;
            required("CNPJ", &entity.cnpj)?;
            let cnpj = numeric("CNPJ", &entity.cnpj, CNPJ_WIDTH)?;
            let mut names = entity_groups(entity, &cnpj)?;
            push_text(&mut names, OID_COMPANY_NAME, &entity.company_name);
            (
                format!("{}:{}", application, cnpj),
                non_empty(&entity.email),
                names,
            )
        }
    };

    subject.push(("CN", common_name.clone()));

    Ok(EncodedProfile {
        profile,
        common_name,
        subject,
        email,
        other_names,
        extended_key_usage: profile.extended_key_usage(),
    })
}
