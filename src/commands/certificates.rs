use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use icp_admin::{
    CaEngine, CertificateCatalog, HolderData, IssueRequest, IssuedCertificateRecord,
};

use super::{banner, password};
use crate::IssueArgs;

/// Handle `issue`: issue under the CA and record the result in the catalog.
pub fn handle_issue(
    engine: &CaEngine,
    catalog: &mut impl CertificateCatalog,
    args: IssueArgs,
) -> Result<()> {
    banner(&format!("ISSUING {} CERTIFICATE", args.profile));

    let json = fs::read_to_string(&args.holder)
        .with_context(|| format!("Failed to read holder file {}", args.holder.display()))?;
    let data: HolderData = serde_json::from_str(&json)
        .with_context(|| format!("Invalid holder file {}", args.holder.display()))?;
    let holder = data.into_holder(args.profile);

    let mut request = IssueRequest::new(
        holder,
        password(args.key_password, "key password", "ICP_KEY_PASSWORD")?,
        password(args.ca_password, "CA password", "ICP_CA_PASSWORD")?,
    );
    request.org_unit = args.ou;
    request.validity_days = args.days;
    request.export_plain_key = args.plain_key;
    request.pkcs12_password = args.p12_password.filter(|p| !p.is_empty()).map(Into::into);

    let issued = engine
        .issue(&args.ca, &request)
        .with_context(|| format!("Failed to issue certificate under {}", args.ca))?;
    catalog
        .insert(IssuedCertificateRecord::from_issued(&issued))
        .context("Certificate issued but could not be cataloged")?;

    println!("✓ {} issued", issued.common_name);
    println!("   Id:          {}", issued.token);
    println!("   Serial:      {}", issued.serial);
    println!("   Expires:     {}", issued.expires_at.format("%Y-%m-%d"));
    println!("   Certificate: {}", issued.certificate.display());
    println!("   Key:         {}", issued.key.display());
    println!("   Request:     {}", issued.request.display());
    if let Some(p12) = &issued.pkcs12 {
        println!("   PKCS#12:     {}", p12.display());
    }
    if let Some(plain) = &issued.plain_key {
        println!("   Plain key:   {}", plain.display());
    }
    Ok(())
}

/// Handle `revoke`.
pub fn handle_revoke(
    engine: &CaEngine,
    catalog: &mut impl CertificateCatalog,
    ca: &str,
    certificate: &Path,
    ca_password: Option<String>,
) -> Result<()> {
    let pw = password(ca_password, "CA password", "ICP_CA_PASSWORD")?;
    let crl = engine
        .revoke(ca, certificate, &pw)
        .with_context(|| format!("Failed to revoke {}", certificate.display()))?;
    println!("✓ {} revoked", certificate.display());
    println!("✓ CRL regenerated at {}", crl.display());

    match catalog.find_by_certificate(ca, certificate) {
        Some(mut record) => {
            record.mark_revoked();
            let id = record.id.clone();
            catalog
                .update(record)
                .context("Failed to update catalog record")?;
            println!("✓ Catalog record {} marked revoked", id);
        }
        None => println!("  (certificate not in catalog)"),
    }
    Ok(())
}

pub struct RenewTarget<'a> {
    pub ca: &'a str,
    pub certificate: &'a Path,
    pub request: &'a Path,
    pub days: Option<u32>,
}

/// Handle `renew`: same key pair, new serial and validity window.
pub fn handle_renew(
    engine: &CaEngine,
    catalog: &mut impl CertificateCatalog,
    target: RenewTarget<'_>,
    ca_password: Option<String>,
) -> Result<()> {
    let pw = password(ca_password, "CA password", "ICP_CA_PASSWORD")?;
    let renewal = engine
        .renew(target.ca, target.certificate, target.request, &pw, target.days)
        .with_context(|| format!("Failed to renew {}", target.certificate.display()))?;
    println!("✓ {} renewed", renewal.certificate.display());
    println!("   Serial:  {}", renewal.serial);
    println!("   Expires: {}", renewal.expires_at.format("%Y-%m-%d"));

    if let Some(mut record) = catalog.find_by_certificate(target.ca, target.certificate) {
        record.renew_validity(renewal.issued_at, renewal.expires_at, renewal.serial.clone());
        catalog
            .update(record)
            .context("Failed to update catalog record")?;
        println!("✓ Catalog record updated");
    }
    Ok(())
}

/// Handle `export-p12`.
pub fn handle_export_p12(
    engine: &CaEngine,
    catalog: &impl CertificateCatalog,
    id: &str,
    key_password: Option<String>,
    p12_password: Option<String>,
) -> Result<()> {
    let record = catalog
        .get(id)
        .ok_or_else(|| anyhow!("No catalog record with id {}", id))?;
    let key_pw = password(key_password, "key password", "ICP_KEY_PASSWORD")?;
    let p12_pw = password(p12_password, "PKCS#12 password", "ICP_P12_PASSWORD")?;

    let output = engine
        .export_pkcs12(&record.to_issued(), &key_pw, &p12_pw)
        .with_context(|| format!("Failed to export {} as PKCS#12", record.common_name))?;
    println!("✓ PKCS#12 written to {}", output.display());
    Ok(())
}

/// Handle `sweep-expired`.
pub fn handle_sweep_expired(catalog: &mut impl CertificateCatalog) -> Result<()> {
    let expired = catalog
        .mark_expired(Utc::now())
        .context("Failed to sweep expired certificates")?;
    println!("✓ {} certificate(s) marked expired", expired);
    Ok(())
}
