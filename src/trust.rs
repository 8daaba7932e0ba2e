//! Relying-party validation of presented certificates.
//!
//! Checks run in a fixed order and collapse into a [`ValidationStatus`]:
//!
//! ```text
//! parse ──✗──> Unknown
//!   │
//! dates ──✗──> Expired
//!   │
//! chain ──✗──> Invalid      (empty anchor set = no restriction)
//!   │
//! CRLs  ──✓──> Revoked      (unreachable distribution points are skipped)
//!   │
//! Valid
//! ```
//!
//! # Revocation is fail-open
//! A certificate is reported revoked only when some CRL lists its serial.
//! If no distribution point can be fetched or parsed the certificate counts
//! as not revoked, so an attacker who can block CRL retrieval can keep a
//! revoked certificate passing. Deployments that need fail-closed behavior
//! must check [`TrustValidator::crl_reachable`] themselves.

use std::cmp::Ordering;

use openssl::asn1::Asn1Time;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{CrlStatus, X509Crl, X509Ref, X509StoreContext, X509};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Span};
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};

use crate::configs::TrustConfig;
use crate::crl_fetch::{CrlFetcher, TransportFetcher};
use crate::error::{IcpError, Result};

/// Outcome of [`TrustValidator::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Expired,
    Revoked,
    Invalid,
    Unknown,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationStatus::Valid => "valid",
            ValidationStatus::Expired => "expired",
            ValidationStatus::Revoked => "revoked",
            ValidationStatus::Invalid => "invalid",
            ValidationStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Parse a PEM or DER certificate.
pub fn load_certificate(bytes: &[u8]) -> Result<X509> {
    let trimmed = skip_whitespace(bytes);
    if trimmed.starts_with(b"-----BEGIN") {
        Ok(X509::from_pem(trimmed)?)
    } else {
        Ok(X509::from_der(bytes)?)
    }
}

/// Whether `cert`'s signature verifies with its own public key.
pub fn is_self_signed(cert: &X509Ref) -> bool {
    cert.public_key()
        .and_then(|key| cert.verify(&key))
        .unwrap_or(false)
}

/// Whether the current time lies inside `cert`'s validity window.
pub fn is_valid_by_date(cert: &X509Ref) -> Result<bool> {
    let now = Asn1Time::days_from_now(0)?;
    let started = cert.not_before().compare(&now)? != Ordering::Greater;
    let not_ended = cert.not_after().compare(&now)? != Ordering::Less;
    Ok(started && not_ended)
}

/// Whether `cert` chains to a self-signed certificate in `anchors`.
///
/// An empty anchor set places no restriction and always passes. Every
/// link is checked with a single-step PKIX validation against one anchor;
/// non-self-signed anchors are followed further through the same set.
pub fn is_valid_key_chain(cert: &X509Ref, anchors: &[X509]) -> bool {
    if anchors.is_empty() {
        return true;
    }
    chains_to_anchor(cert, anchors, 0)
}

fn chains_to_anchor(cert: &X509Ref, anchors: &[X509], depth: usize) -> bool {
    // Each link consumes one anchor; a longer walk can only be a cycle.
    if depth >= anchors.len() {
        return false;
    }
    for anchor in anchors.iter().filter(|a| issued_by(cert, a)) {
        match verify_single_step(cert, anchor) {
            Ok(true) => {
                if is_self_signed(anchor) || chains_to_anchor(anchor, anchors, depth + 1) {
                    return true;
                }
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "path validation against anchor failed"),
        }
    }
    false
}

fn issued_by(cert: &X509Ref, anchor: &X509Ref) -> bool {
    matches!(
        cert.issuer_name().try_cmp(anchor.subject_name()),
        Ok(Ordering::Equal)
    )
}

/// PKIX validation of `cert` with `anchor` as the only trusted certificate.
fn verify_single_step(cert: &X509Ref, anchor: &X509) -> Result<bool> {
    let mut builder = X509StoreBuilder::new()?;
    builder.add_cert(anchor.clone())?;
    builder.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
    let store = builder.build();

    let untrusted = Stack::new()?;
    let mut context = X509StoreContext::new()?;
    let verified = context.init(&store, cert, &untrusted, |ctx| {
        let ok = ctx.verify_cert()?;
        if !ok {
            debug!(error = %ctx.error(), "single-step path validation rejected");
        }
        Ok(ok)
    })?;
    Ok(verified)
}

/// URIs from the `cRLDistributionPoints` extension, in certificate order.
pub fn crl_distribution_points(cert: &X509Ref) -> Result<Vec<String>> {
    let der = cert.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| IcpError::Validation(format!("certificate could not be parsed: {}", e)))?;

    let mut uris = Vec::new();
    for ext in parsed.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            uris.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }
    Ok(uris)
}

fn skip_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn parse_crl(bytes: &[u8]) -> Result<X509Crl> {
    let trimmed = skip_whitespace(bytes);
    if trimmed.starts_with(b"-----BEGIN") {
        Ok(X509Crl::from_pem(trimmed)?)
    } else {
        Ok(X509Crl::from_der(bytes)?)
    }
}

/// Certificate validation for relying parties.
///
/// Anchors are supplied per call and never stored.
pub struct TrustValidator {
    fetcher: Box<dyn CrlFetcher>,
    span: Span,
}

impl TrustValidator {
    pub fn new(fetcher: Box<dyn CrlFetcher>) -> Self {
        Self {
            fetcher,
            span: info_span!("trust_validator"),
        }
    }

    pub fn from_config(config: &TrustConfig) -> Self {
        Self::new(Box::new(TransportFetcher::new(config.fetch_timeout())))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether any CRL reachable from `cert`'s distribution points lists it.
    ///
    /// Fetch and parse failures are logged and the next point is tried.
    pub fn is_revoked(&self, cert: &X509Ref) -> bool {
        let _entered = self.span.enter();
        let uris = match crl_distribution_points(cert) {
            Ok(uris) => uris,
            Err(e) => {
                warn!(error = %e, "no readable CRL distribution points");
                return false;
            }
        };
        if uris.is_empty() {
            debug!("certificate has no CRL distribution points");
        }

        for uri in &uris {
            match self.check_crl(uri, cert) {
                Ok(true) => {
                    info!(uri = %uri, "certificate listed as revoked");
                    return true;
                }
                Ok(false) => debug!(uri = %uri, "certificate not listed"),
                Err(e) => warn!(uri = %uri, error = %e, "CRL check failed, trying next point"),
            }
        }
        false
    }

    /// Whether at least one distribution point yields a parsable CRL.
    pub fn crl_reachable(&self, cert: &X509Ref) -> bool {
        let _entered = self.span.enter();
        crl_distribution_points(cert)
            .map(|uris| {
                uris.iter().any(|uri| {
                    self.fetcher
                        .fetch(uri)
                        .and_then(|bytes| parse_crl(&bytes))
                        .is_ok()
                })
            })
            .unwrap_or(false)
    }

    fn check_crl(&self, uri: &str, cert: &X509Ref) -> Result<bool> {
        let bytes = self.fetcher.fetch(uri)?;
        let crl = parse_crl(&bytes)?;
        Ok(matches!(
            crl.get_by_serial(cert.serial_number()),
            CrlStatus::Revoked(_)
        ))
    }

    /// Validate PEM or DER `certificate` against `anchors`.
    ///
    /// Never fails; internal errors are reported as `Unknown`.
    pub fn status(&self, certificate: &[u8], anchors: &[X509]) -> ValidationStatus {
        let _entered = self.span.enter();
        let cert = match load_certificate(certificate) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(error = %e, "certificate could not be parsed");
                return ValidationStatus::Unknown;
            }
        };
        self.certificate_status(&cert, anchors)
    }

    pub fn certificate_status(&self, cert: &X509Ref, anchors: &[X509]) -> ValidationStatus {
        let _entered = self.span.enter();
        let status = match is_valid_by_date(cert) {
            Err(e) => {
                warn!(error = %e, "validity window could not be read");
                ValidationStatus::Unknown
            }
            Ok(false) => ValidationStatus::Expired,
            Ok(true) if !is_valid_key_chain(cert, anchors) => ValidationStatus::Invalid,
            Ok(true) if self.is_revoked(cert) => ValidationStatus::Revoked,
            Ok(true) => ValidationStatus::Valid,
        };
        info!(%status, anchors = anchors.len(), "certificate validated");
        status
    }
}
