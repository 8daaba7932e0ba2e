use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use icp_admin::trust::{self, TrustValidator, ValidationStatus};
use icp_admin::AppConfig;
use tracing::info_span;

/// Handle `validate`: print the certificate's status and exit non-zero
/// unless it is valid.
pub fn handle_validate(
    config: &AppConfig,
    certificate: &Path,
    anchors: &[PathBuf],
    json: bool,
) -> Result<()> {
    let bytes = fs::read(certificate)
        .with_context(|| format!("Failed to read {}", certificate.display()))?;
    let anchors = anchors
        .iter()
        .map(|path| {
            let pem = fs::read(path)
                .with_context(|| format!("Failed to read anchor {}", path.display()))?;
            trust::load_certificate(&pem)
                .with_context(|| format!("Invalid anchor {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let validator = TrustValidator::from_config(&config.trust)
        .with_span(info_span!("icp_admin", command = "validate"));
    let status = validator.status(&bytes, &anchors);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "certificate": certificate.display().to_string(),
                "anchors": anchors.len(),
                "status": status,
            })
        );
    } else {
        let mark = if status == ValidationStatus::Valid { "✓" } else { "✗" };
        println!("{} {}: {}", mark, certificate.display(), status);
        if anchors.is_empty() {
            println!("  (no trust anchors given, chain not restricted)");
        }
    }

    if status != ValidationStatus::Valid {
        std::process::exit(2);
    }
    Ok(())
}
