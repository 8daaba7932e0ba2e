use std::path::Path;

use anyhow::{Context, Result};
use icp_admin::{CaEngine, CaParams};

use super::{banner, password};
use crate::CreateCaArgs;

/// Handle `list`: one line per CA with its parent and certificate state.
pub fn handle_list(engine: &CaEngine) -> Result<()> {
    let cas = engine.list().context("Failed to list CAs")?;
    if cas.is_empty() {
        println!("No CAs under {}", engine.registry().base_dir().display());
        return Ok(());
    }

    println!("{:<24} {:<32} {:<24} CERTIFICATE", "NAME", "COMMON NAME", "PARENT");
    for ca in &cas {
        let (cn, parent) = match ca.info() {
            Ok(info) => (
                info.common_name.clone(),
                if info.is_root() {
                    "(root)".to_string()
                } else {
                    info.root.clone()
                },
            ),
            Err(e) => (format!("<unreadable: {}>", e), String::new()),
        };
        let state = if ca.directory().certificate().is_file() {
            "present"
        } else {
            "missing"
        };
        println!("{:<24} {:<32} {:<24} {}", ca.name(), cn, parent, state);
    }
    Ok(())
}

fn params(args: CreateCaArgs) -> Result<CaParams> {
    let pw = password(args.password, "CA password", "ICP_CA_PASSWORD")?;
    let mut params = CaParams::new(args.name, pw)
        .common_name(args.cn)
        .organization(args.org)
        .organizational_unit(args.ou);
    if let Some(country) = args.country {
        params = params.country(country);
    }
    if let Some(days) = args.days {
        params = params.validity_days(days);
    }
    if let Some(uri) = args.crl_uri {
        params = params.crl_uri(uri);
    }
    if let Some(uri) = args.cps_uri {
        params = params.cps_uri(uri);
    }
    if !args.policies.is_empty() {
        params = params.policies(args.policies);
    }
    Ok(params)
}

/// Handle `create-root`.
pub fn handle_create_root(engine: &CaEngine, args: CreateCaArgs) -> Result<()> {
    banner("CREATING ROOT CA");
    let params = params(args)?;
    let name = params.name().to_string();
    let ca = engine
        .create_root_ca(&params)
        .with_context(|| format!("Failed to create Root CA {}", name))?;

    println!("✓ Root CA {} created", ca.name());
    println!("   Directory:   {}", ca.directory().path().display());
    println!("   Certificate: {}", ca.directory().certificate().display());
    println!("   CRL:         {}", ca.directory().crl().display());
    Ok(())
}

/// Handle `create-ca`.
pub fn handle_create_ca(
    engine: &CaEngine,
    args: CreateCaArgs,
    parent: &str,
    parent_password: Option<String>,
) -> Result<()> {
    banner("CREATING INTERMEDIATE CA");
    let parent_pw = password(parent_password, "parent CA password", "ICP_PARENT_PASSWORD")?;
    let params = params(args)?;
    let name = params.name().to_string();
    let ca = engine
        .create_ca(&params, parent, &parent_pw)
        .with_context(|| format!("Failed to create CA {} under {}", name, parent))?;

    println!("✓ CA {} created, signed by {}", ca.name(), parent);
    println!("   Directory:   {}", ca.directory().path().display());
    println!("   Chain:       {}", ca.directory().chain().display());
    Ok(())
}

/// Handle `delete-ca`.
pub fn handle_delete_ca(engine: &CaEngine, name: &str) -> Result<()> {
    engine
        .delete_ca(name)
        .with_context(|| format!("Failed to delete CA {}", name))?;
    println!("✓ CA {} deleted", name);
    Ok(())
}

/// Handle `gencrl`.
pub fn handle_gencrl(engine: &CaEngine, ca: &str, ca_password: Option<String>) -> Result<()> {
    let pw = password(ca_password, "CA password", "ICP_CA_PASSWORD")?;
    let crl = engine
        .renew_crl(ca, &pw)
        .with_context(|| format!("Failed to generate CRL for {}", ca))?;
    println!("✓ CRL written to {}", crl.display());
    Ok(())
}

/// Handle `export-chain`.
pub fn handle_export_chain(engine: &CaEngine, ca: &str) -> Result<()> {
    let chain = engine
        .export_chain(ca)
        .with_context(|| format!("Failed to export chain of {}", ca))?;
    println!("✓ Chain written to {}", chain.display());
    Ok(())
}

/// Handle `backup`.
pub fn handle_backup(engine: &CaEngine, ca: &str, dest: &Path) -> Result<()> {
    let archive = engine
        .backup(ca, dest)
        .with_context(|| format!("Failed to back up {}", ca))?;
    println!("✓ Backup written to {}", archive.display());
    Ok(())
}
