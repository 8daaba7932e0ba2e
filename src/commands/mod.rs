//! Command handlers for the `icp-admin` binary.

pub mod ca;
pub mod certificates;
pub mod validate;

use anyhow::{anyhow, Context, Result};
use icp_admin::{AppConfig, CaEngine, JsonFileCatalog};
use secrecy::SecretString;
use tracing::info_span;

use crate::Command;

pub fn dispatch(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::List => ca::handle_list(&engine(config, "list")?),
        Command::CreateRoot(args) => ca::handle_create_root(&engine(config, "create-root")?, args),
        Command::CreateCa {
            ca,
            parent,
            parent_password,
        } => ca::handle_create_ca(&engine(config, "create-ca")?, ca, &parent, parent_password),
        Command::DeleteCa { name } => ca::handle_delete_ca(&engine(config, "delete-ca")?, &name),
        Command::Gencrl { ca, ca_password } => {
            ca::handle_gencrl(&engine(config, "gencrl")?, &ca, ca_password)
        }
        Command::ExportChain { ca } => ca::handle_export_chain(&engine(config, "export-chain")?, &ca),
        Command::Backup { ca, dest } => {
            let dest = dest.unwrap_or_else(|| config.storage.backup_dir.clone());
            ca::handle_backup(&engine(config, "backup")?, &ca, &dest)
        }
        Command::Issue(args) => certificates::handle_issue(
            &engine(config, "issue")?,
            &mut catalog(config)?,
            args,
        ),
        Command::Revoke {
            ca,
            certificate,
            ca_password,
        } => certificates::handle_revoke(
            &engine(config, "revoke")?,
            &mut catalog(config)?,
            &ca,
            &certificate,
            ca_password,
        ),
        Command::Renew {
            ca,
            certificate,
            request,
            days,
            ca_password,
        } => certificates::handle_renew(
            &engine(config, "renew")?,
            &mut catalog(config)?,
            certificates::RenewTarget {
                ca: &ca,
                certificate: &certificate,
                request: &request,
                days,
            },
            ca_password,
        ),
        Command::ExportP12 {
            id,
            key_password,
            p12_password,
        } => certificates::handle_export_p12(
            &engine(config, "export-p12")?,
            &catalog(config)?,
            &id,
            key_password,
            p12_password,
        ),
        Command::SweepExpired => certificates::handle_sweep_expired(&mut catalog(config)?),
        Command::Validate {
            certificate,
            anchors,
            json,
        } => validate::handle_validate(config, &certificate, &anchors, json),
    }
}

fn engine(config: &AppConfig, command: &str) -> Result<CaEngine> {
    let engine = CaEngine::new(config).with_context(|| {
        format!(
            "Failed to open CA base directory {}",
            config.storage.base_dir.display()
        )
    })?;
    Ok(engine.with_span(info_span!("icp_admin", command)))
}

fn catalog(config: &AppConfig) -> Result<JsonFileCatalog> {
    JsonFileCatalog::open(&config.storage.catalog_path).with_context(|| {
        format!(
            "Failed to open catalog {}",
            config.storage.catalog_path.display()
        )
    })
}

/// A password from its flag or environment variable.
pub(crate) fn password(value: Option<String>, what: &str, env: &str) -> Result<SecretString> {
    value
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
        .ok_or_else(|| anyhow!("{} is required (set {} or pass the flag)", what, env))
}

pub(crate) fn banner(title: &str) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("  {}", title);
    println!("═══════════════════════════════════════════════════════════\n");
}
